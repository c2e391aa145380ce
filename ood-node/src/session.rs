//! Race service: the session context that ties a peer transport, the race core,
//! a clock and (optionally) the local vehicle link together for one transport lifetime.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ood_core::protocol::{Peer, Role};
use ood_core::race::MatchPhase;
use ood_core::vehicle::{self, VehicleCommand, VehicleMessage};
use ood_core::{Clock, OutboundAction, RaceConfig, RaceCore, RaceNotice, RaceResult, RaceSession, SessionError};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::link::LinkManager;
use crate::radio::DeliveryMode;
use crate::transport::PeerTransport;

/// Notices and vehicle messages buffered per subscriber.
pub const EVENT_BUFFER: usize = 256;
pub const DEFAULT_TIME_SYNC_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    pub race: RaceConfig,
    pub time_sync_interval: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            race: RaceConfig::default(),
            time_sync_interval: DEFAULT_TIME_SYNC_INTERVAL,
        }
    }
}

struct Inner {
    transport: Arc<dyn PeerTransport>,
    core: Mutex<RaceCore>,
    clock: Arc<dyn Clock>,
    vehicle: Mutex<Option<LinkManager>>,
    vehicle_commands: mpsc::UnboundedSender<VehicleCommand>,
    notices: broadcast::Sender<RaceNotice>,
    telemetry: broadcast::Sender<VehicleMessage>,
    time_sync_interval: Duration,
    time_sync: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns race state for the lifetime of one transport. Create it once the transport
/// exists; `teardown` ends it.
#[derive(Clone)]
pub struct RaceService {
    inner: Arc<Inner>,
}

impl RaceService {
    pub fn create(transport: Arc<dyn PeerTransport>, clock: Arc<dyn Clock>, options: ServiceOptions) -> Self {
        let local = transport.local_peer();
        let core = RaceCore::with_config(transport.role(), local.name.clone(), options.race);
        let (notices, _) = broadcast::channel(EVENT_BUFFER);
        let (telemetry, _) = broadcast::channel(EVENT_BUFFER);
        let (vehicle_commands, commands_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            transport,
            core: Mutex::new(core),
            clock,
            vehicle: Mutex::new(None),
            vehicle_commands,
            notices,
            telemetry,
            time_sync_interval: options.time_sync_interval,
            time_sync: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });
        // Subscribe before anything can arrive.
        let incoming = inner.transport.incoming();
        let roster = inner.transport.peers();
        let pump = tokio::spawn(pump_transport(inner.clone(), incoming, roster));
        let writer = tokio::spawn(write_vehicle_commands(inner.clone(), commands_rx));
        if let Ok(mut tasks) = inner.tasks.try_lock() {
            tasks.push(pump);
            tasks.push(writer);
        }
        info!(role = ?inner.transport.role(), peer = %local.id, "race service created");
        Self { inner }
    }

    pub fn role(&self) -> Role {
        self.inner.transport.role()
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        self.inner.transport.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<RaceNotice> {
        self.inner.notices.subscribe()
    }

    /// Decoded messages from the local vehicle.
    pub fn vehicle_messages(&self) -> broadcast::Receiver<VehicleMessage> {
        self.inner.telemetry.subscribe()
    }

    /// Host only: probe peers with TimeSync on the configured interval.
    pub async fn start_time_sync(&self) -> Result<(), SessionError> {
        self.require_host()?;
        let mut slot = self.inner.time_sync.lock().await;
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        let inner = self.inner.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.time_sync_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = inner.sync_once().await {
                    warn!(error = %e, "time sync stopped");
                    break;
                }
            }
        }));
        Ok(())
    }

    pub async fn stop_time_sync(&self) {
        if let Some(task) = self.inner.time_sync.lock().await.take() {
            task.abort();
        }
    }

    /// Host only: send one TimeSync probe now.
    pub async fn sync_now(&self) -> Result<(), SessionError> {
        self.inner.sync_once().await
    }

    pub async fn start_match(&self, countdown_seconds: u8, target_laps: u8) -> Result<i64, SessionError> {
        let now = self.inner.clock.now_ms();
        let (actions, go_at) = {
            let mut core = self.inner.core.lock().await;
            let actions = core.start_match(now, countdown_seconds, target_laps)?;
            (actions, core.session().match_start_at_local_ms.unwrap_or(now))
        };
        info!(go_at, countdown_seconds, target_laps, "match started");
        self.inner.execute(actions).await;
        Ok(go_at)
    }

    pub async fn cancel_match(&self) -> Result<(), SessionError> {
        let actions = self.inner.core.lock().await.cancel_match()?;
        info!("match cancelled");
        self.inner.execute(actions).await;
        Ok(())
    }

    pub async fn ping(&self) {
        let now = self.inner.clock.now_ms();
        let actions = self.inner.core.lock().await.ping(now);
        self.inner.execute(actions).await;
    }

    pub async fn session(&self) -> RaceSession {
        self.inner.core.lock().await.session()
    }

    pub async fn phase(&self) -> MatchPhase {
        let now = self.inner.clock.now_ms();
        self.inner.core.lock().await.session().phase(now)
    }

    pub async fn results(&self) -> Vec<RaceResult> {
        self.inner.core.lock().await.results()
    }

    pub async fn set_start_marker(&self, piece: u8) {
        let now = self.inner.clock.now_ms();
        self.inner.core.lock().await.set_start_marker(piece, now);
    }

    /// Host-side offset estimate for a peer, for display.
    pub async fn offset_for(&self, peer_id: &str) -> Option<i64> {
        self.inner.core.lock().await.offset_for(peer_id).map(|s| s.offset_ms)
    }

    /// Feed the local vehicle's notifications into the race and forward commands to it.
    pub async fn attach_vehicle(&self, link: LinkManager) {
        let mut frames = link.notifications();
        *self.inner.vehicle.lock().await = Some(link);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                inner.on_vehicle_frame(&frame).await;
            }
        });
        self.inner.tasks.lock().await.push(task);
    }

    /// Process one raw vehicle frame. Unparsed frames are dropped.
    pub async fn on_vehicle_frame(&self, frame: &[u8]) {
        self.inner.on_vehicle_frame(frame).await;
    }

    /// Stop all background work and the transport, and forget the race.
    pub async fn teardown(&self) {
        self.stop_time_sync().await;
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.inner.core.lock().await.teardown();
        self.inner.vehicle.lock().await.take();
        self.inner.transport.stop().await;
        info!("race service torn down");
    }

    fn require_host(&self) -> Result<(), SessionError> {
        let actual = self.role();
        if actual != Role::Host {
            return Err(SessionError::RoleMismatch {
                expected: Role::Host,
                actual,
            });
        }
        Ok(())
    }
}

impl Inner {
    async fn sync_once(&self) -> Result<(), SessionError> {
        let now = self.clock.now_ms();
        let actions = self.core.lock().await.tick(now)?;
        self.execute(actions).await;
        Ok(())
    }

    async fn on_vehicle_frame(&self, frame: &[u8]) {
        let Some(msg) = vehicle::decode(frame) else {
            debug!(len = frame.len(), "unparsed vehicle frame");
            return;
        };
        let _ = self.telemetry.send(msg.clone());
        let now = self.clock.now_ms();
        let actions = self.core.lock().await.on_vehicle_message(&msg, now);
        self.execute(actions).await;
    }

    async fn execute(&self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::Broadcast(bytes) => {
                    let delivered = self.transport.broadcast(&bytes).await;
                    debug!(delivered, len = bytes.len(), "broadcast");
                }
                OutboundAction::SendMessage(peer, bytes) => {
                    if !self.transport.send(&peer, &bytes).await {
                        debug!(peer = %peer.id, "send failed");
                    }
                }
                OutboundAction::Vehicle(cmd) => {
                    if self.vehicle_commands.send(cmd).is_err() {
                        debug!("vehicle command writer gone");
                    }
                }
                OutboundAction::Notify(notice) => {
                    let _ = self.notices.send(notice);
                }
            }
        }
    }

    async fn on_peer_joined(&self, peer: &Peer) {
        info!(peer = %peer.id, name = peer.label(), "peer joined");
        let actions = self.core.lock().await.on_peer_joined(peer);
        self.execute(actions).await;
    }
}

/// Single writer of vehicle commands, so they reach the link in the order issued.
async fn write_vehicle_commands(inner: Arc<Inner>, mut commands: mpsc::UnboundedReceiver<VehicleCommand>) {
    while let Some(cmd) = commands.recv().await {
        let link = inner.vehicle.lock().await.clone();
        match link {
            Some(link) => {
                if !link.write(cmd.encode(), DeliveryMode::WithResponse).await {
                    warn!(?cmd, "vehicle command write failed");
                }
            }
            None => debug!(?cmd, "no vehicle attached"),
        }
    }
}

/// Single reader of transport traffic and roster changes. A peer is announced to the
/// core before its first message is processed.
async fn pump_transport(
    inner: Arc<Inner>,
    mut incoming: broadcast::Receiver<(Peer, Vec<u8>)>,
    mut roster: watch::Receiver<Vec<Peer>>,
) {
    let mut known: HashSet<String> = HashSet::new();
    let current = roster.borrow_and_update().clone();
    sync_roster(&inner, &mut known, current).await;
    loop {
        tokio::select! {
            changed = roster.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = roster.borrow_and_update().clone();
                sync_roster(&inner, &mut known, current).await;
            }
            msg = incoming.recv() => {
                let (peer, bytes) = match msg {
                    Ok(m) => m,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "incoming messages dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if known.insert(peer.id.clone()) {
                    inner.on_peer_joined(&peer).await;
                }
                let now = inner.clock.now_ms();
                let result = inner.core.lock().await.on_message_received(&peer, &bytes, now);
                match result {
                    Ok(actions) => inner.execute(actions).await,
                    Err(e) => debug!(peer = %peer.id, error = %e, "discarding message"),
                }
            }
        }
    }
}

async fn sync_roster(inner: &Inner, known: &mut HashSet<String>, current: Vec<Peer>) {
    let ids: HashSet<String> = current.iter().map(|p| p.id.clone()).collect();
    for peer in current.iter().filter(|p| !known.contains(&p.id)) {
        inner.on_peer_joined(peer).await;
    }
    for gone in known.difference(&ids) {
        info!(peer = %gone, "peer left");
        inner.core.lock().await.on_peer_left(gone);
    }
    *known = ids;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::{MockChannel, MockRadio};
    use crate::transport::MemoryHub;
    use ood_core::ManualClock;

    async fn wait_for(rx: &mut broadcast::Receiver<RaceNotice>, pred: impl Fn(&RaceNotice) -> bool) -> RaceNotice {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(n) if pred(&n) => return n,
                    Ok(_) => {}
                    Err(e) => panic!("notice stream failed: {e}"),
                }
            }
        })
        .await
        .expect("timed out waiting for notice")
    }

    fn position_frame(piece: u8, speed: u16) -> Vec<u8> {
        let mut f = vec![9, 0x27, 0, piece];
        f.extend_from_slice(&0f32.to_le_bytes());
        f.extend_from_slice(&speed.to_le_bytes());
        f
    }

    struct Rig {
        host: RaceService,
        client: RaceService,
        host_clock: ManualClock,
        client_clock: ManualClock,
    }

    async fn rig() -> Rig {
        let hub = MemoryHub::new();
        let host_t = Arc::new(hub.transport(Role::Host, Peer::new("h", Some("Hosty".into()))));
        let client_t = Arc::new(hub.transport(Role::Client, Peer::new("c", Some("Kid".into()))));
        let host_clock = ManualClock::new(10_000);
        let client_clock = ManualClock::new(9_800);
        let host = RaceService::create(host_t.clone(), Arc::new(host_clock.clone()), ServiceOptions::default());
        let client = RaceService::create(client_t.clone(), Arc::new(client_clock.clone()), ServiceOptions::default());
        assert!(host_t.start().await);
        assert!(client_t.start().await);
        Rig {
            host,
            client,
            host_clock,
            client_clock,
        }
    }

    #[tokio::test]
    async fn time_sync_is_host_only() {
        let r = rig().await;
        assert!(matches!(
            r.client.start_time_sync().await,
            Err(SessionError::RoleMismatch { expected: Role::Host, actual: Role::Client })
        ));
        assert!(r.client.sync_now().await.is_err());
        assert!(r.host.start_time_sync().await.is_ok());
        assert!(r.host.start_time_sync().await.is_ok());
        r.host.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn host_probes_once_per_interval() {
        let r = rig().await;
        let mut host_notices = r.host.notices();
        let started = tokio::time::Instant::now();
        r.host.start_time_sync().await.unwrap();

        let mut estimated_at = Vec::new();
        while estimated_at.len() < 3 {
            if let RaceNotice::OffsetEstimated { sample, .. } = host_notices.recv().await.unwrap() {
                estimated_at.push((sample.seq, started.elapsed()));
            }
        }
        assert_eq!(
            estimated_at,
            vec![
                (1, Duration::ZERO),
                (2, Duration::from_secs(1)),
                (3, Duration::from_secs(2)),
            ]
        );
        r.host.teardown().await;
    }

    #[tokio::test]
    async fn vehicle_commands_keep_their_order() {
        let r = rig().await;
        let radio = MockRadio::new(MockChannel::default());
        let link = LinkManager::new(radio.clone(), Arc::new(r.client_clock.clone()));
        link.connect("AA").await.unwrap();
        r.client.attach_vehicle(link).await;

        let commands: Vec<VehicleCommand> = (1..=5).map(|i| VehicleCommand::set_speed(i * 100, 1000, false)).collect();
        r.client
            .inner
            .execute(commands.iter().cloned().map(OutboundAction::Vehicle).collect())
            .await;

        let expected: Vec<Vec<u8>> = commands.iter().map(VehicleCommand::encode).collect();
        tokio::time::timeout(Duration::from_secs(5), async {
            while radio.channel.writes.lock().unwrap().len() < expected.len() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("vehicle commands not written");
        let written: Vec<Vec<u8>> = radio.channel.writes.lock().unwrap().iter().map(|(p, _)| p.clone()).collect();
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn start_match_lands_on_client_clock() {
        let r = rig().await;
        let mut host_notices = r.host.notices();
        let mut client_notices = r.client.notices();

        // Client announces itself when it sees the host.
        let joined = wait_for(&mut host_notices, |n| matches!(n, RaceNotice::PeerJoined { .. })).await;
        assert_eq!(joined, RaceNotice::PeerJoined { peer: Peer::new("c", Some("Kid".into())) });

        r.host.sync_now().await.unwrap();
        wait_for(&mut host_notices, |n| matches!(n, RaceNotice::OffsetEstimated { .. })).await;

        let go = r.host.start_match(3, 3).await.unwrap();
        assert_eq!(go, 14_000);
        let scheduled = wait_for(&mut client_notices, |n| matches!(n, RaceNotice::MatchScheduled { .. })).await;
        assert_eq!(
            scheduled,
            RaceNotice::MatchScheduled { go_at_local_ms: 13_800, countdown_seconds: 3, target_laps: 3 }
        );
        assert_eq!(r.client.phase().await, MatchPhase::Countdown { remaining_ms: 4_000 });

        r.host.cancel_match().await.unwrap();
        wait_for(&mut client_notices, |n| *n == RaceNotice::MatchCancelled).await;
        assert!(!r.client.session().await.is_active());
    }

    #[tokio::test]
    async fn client_race_reaches_host_results_and_stops_vehicle() {
        let r = rig().await;
        let mut host_notices = r.host.notices();
        let radio = MockRadio::new(MockChannel::default());
        let link = LinkManager::new(radio.clone(), Arc::new(r.client_clock.clone()));
        link.connect("AA").await.unwrap();
        r.client.attach_vehicle(link).await;

        r.host.sync_now().await.unwrap();
        wait_for(&mut host_notices, |n| matches!(n, RaceNotice::OffsetEstimated { .. })).await;
        let mut client_notices = r.client.notices();
        r.host.start_match(3, 2).await.unwrap();
        wait_for(&mut client_notices, |n| matches!(n, RaceNotice::MatchScheduled { .. })).await;

        let go = 13_800;
        for (at, piece, speed) in [
            (go + 100, 4, 400),
            (go + 5_000, 5, 600),
            (go + 21_000, 4, 600),
            (go + 30_000, 5, 600),
            (go + 39_000, 4, 600),
        ] {
            r.client_clock.set(at);
            r.client.on_vehicle_frame(&position_frame(piece, speed)).await;
        }

        r.host_clock.set(60_000);
        let finished = wait_for(&mut host_notices, |n| matches!(n, RaceNotice::Finished { .. })).await;
        // Host go instant 14_000 + elapsed 39_000.
        assert_eq!(
            finished,
            RaceNotice::Finished { racer_id: "c".into(), laps: 2, finished_at_local_ms: 53_000 }
        );
        let results = r.host.results().await;
        assert_eq!(results[0].racer_id, "c");
        assert_eq!(results[0].name.as_deref(), Some("Kid"));
        assert_eq!(results[0].best_lap_ms, Some(18_000));

        let stop = VehicleCommand::stop().encode();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !radio.channel.writes.lock().unwrap().iter().any(|(p, _)| *p == stop) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("stop command not written");
    }

    #[tokio::test]
    async fn attached_vehicle_telemetry_reaches_host() {
        let r = rig().await;
        let radio = MockRadio::new(MockChannel::default());
        let link = LinkManager::new(radio.clone(), Arc::new(r.client_clock.clone()));
        link.connect("AA").await.unwrap();
        let mut vehicle_rx = r.client.vehicle_messages();
        r.client.attach_vehicle(link).await;

        radio.push(crate::radio::ChannelEvent::Notification(position_frame(12, 700)));
        let msg = tokio::time::timeout(Duration::from_secs(5), vehicle_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, VehicleMessage::PositionUpdate(p) if p.road_piece_id == 12));

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(t) = r.host.inner.core.lock().await.peer_telemetry("c") {
                    assert_eq!((t.piece_id, t.speed_mmps), (12, 700));
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("telemetry not forwarded");
    }

    #[tokio::test]
    async fn teardown_clears_race_and_stops_transport() {
        let r = rig().await;
        r.host.start_match(3, 3).await.unwrap();
        r.host.teardown().await;
        assert_eq!(r.host.session().await, RaceSession::default());
        assert!(r.host.transport().peers().borrow().is_empty());
        assert_eq!(r.host.inner.transport.broadcast(&[1]).await, 0);
    }
}
