//! Host-driven API: RaceCore receives peer messages, vehicle telemetry and timer ticks
//! from the host application and returns the actions to perform. No I/O here.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::event::{EventError, Finished, LapCompleted, RaceEvent, StartMatch};
use crate::protocol::{NetMessage, Peer, Role, PROTOCOL_VERSION};
use crate::race::{self, Lap, LapTracker, RaceResult, RaceSession, RacerState};
use crate::timesync::{ClientSync, HostSync, OffsetSample};
use crate::vehicle::{PositionUpdate, VehicleCommand, VehicleMessage};
use crate::wire;

/// Racer id used for this device in the racer table.
pub const LOCAL_RACER_ID: &str = "local";

/// Default spacing of forwarded telemetry.
pub const DEFAULT_TELEMETRY_INTERVAL_MS: i64 = 100;
/// Unanswered pings are forgotten after this long.
const PING_TIMEOUT_MS: i64 = 10_000;

/// Tunables for lap detection and telemetry forwarding.
#[derive(Debug, Clone, Copy)]
pub struct RaceConfig {
    pub lap_debounce_ms: i64,
    pub min_lap_speed_mm_per_sec: u16,
    pub telemetry_interval_ms: i64,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            lap_debounce_ms: race::DEFAULT_LAP_DEBOUNCE_MS,
            min_lap_speed_mm_per_sec: race::DEFAULT_MIN_LAP_SPEED_MM_PER_SEC,
            telemetry_interval_ms: DEFAULT_TELEMETRY_INTERVAL_MS,
        }
    }
}

/// Latest telemetry reported by a peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerTelemetry {
    pub piece_id: i32,
    pub location_id: i32,
    pub offset_mm: f32,
    pub speed_mmps: i32,
    pub flags: i32,
    pub ts_client: i64,
    pub received_at_ms: i64,
}

/// State changes worth showing to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum RaceNotice {
    PeerJoined { peer: Peer },
    OffsetEstimated { peer_id: String, sample: OffsetSample },
    MatchScheduled { go_at_local_ms: i64, countdown_seconds: u8, target_laps: u8 },
    MatchCancelled,
    LapCompleted { racer_id: String, laps: u8, lap_ms: Option<i64> },
    Finished { racer_id: String, laps: u8, finished_at_local_ms: i64 },
    PingReply { peer_id: String, rtt_ms: i64 },
}

/// Action for the host application to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Send to every connected peer.
    Broadcast(Vec<u8>),
    /// Send to one peer only.
    SendMessage(Peer, Vec<u8>),
    /// Write this command to the local vehicle.
    Vehicle(VehicleCommand),
    Notify(RaceNotice),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("operation requires the {expected:?} role, transport is {actual:?}")]
    RoleMismatch { expected: Role, actual: Role },
    #[error(transparent)]
    Event(#[from] EventError),
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decode message")]
    DecodeFailed,
    #[error("bad event: {0}")]
    Event(#[from] EventError),
}

enum SyncState {
    Host(HostSync),
    Client(ClientSync),
}

/// Race coordinator for one device. Owns the race session, per-racer state and
/// time-sync bookkeeping for the lifetime of a peer transport.
pub struct RaceCore {
    role: Role,
    local_name: Option<String>,
    config: RaceConfig,
    sync: SyncState,
    session: RaceSession,
    racers: HashMap<String, RacerState>,
    peer_names: HashMap<String, String>,
    telemetry: HashMap<String, PeerTelemetry>,
    lap_tracker: LapTracker,
    last_telemetry_sent_ms: Option<i64>,
    joined_host: bool,
    pending_pings: HashMap<i32, i64>,
}

impl RaceCore {
    pub fn new(role: Role, local_name: Option<String>) -> Self {
        Self::with_config(role, local_name, RaceConfig::default())
    }

    pub fn with_config(role: Role, local_name: Option<String>, config: RaceConfig) -> Self {
        let sync = match role {
            Role::Host => SyncState::Host(HostSync::new()),
            Role::Client => SyncState::Client(ClientSync::new()),
        };
        Self {
            role,
            local_name,
            config,
            sync,
            session: RaceSession::default(),
            racers: HashMap::new(),
            peer_names: HashMap::new(),
            telemetry: HashMap::new(),
            lap_tracker: LapTracker::new(config.lap_debounce_ms, config.min_lap_speed_mm_per_sec),
            last_telemetry_sent_ms: None,
            joined_host: false,
            pending_pings: HashMap::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session(&self) -> RaceSession {
        self.session
    }

    pub fn racers(&self) -> &HashMap<String, RacerState> {
        &self.racers
    }

    pub fn racer(&self, id: &str) -> Option<&RacerState> {
        self.racers.get(id)
    }

    pub fn peer_telemetry(&self, peer_id: &str) -> Option<PeerTelemetry> {
        self.telemetry.get(peer_id).copied()
    }

    /// Host-side offset estimate for a peer (diagnostics only).
    pub fn offset_for(&self, peer_id: &str) -> Option<OffsetSample> {
        match &self.sync {
            SyncState::Host(h) => h.offset_for(peer_id),
            SyncState::Client(_) => None,
        }
    }

    /// Client-side `host - local` estimate from the latest probe.
    pub fn provisional_offset_ms(&self) -> Option<i64> {
        match &self.sync {
            SyncState::Client(c) => c.provisional_offset_ms(),
            SyncState::Host(_) => None,
        }
    }

    pub fn lap_marker(&self) -> Option<u8> {
        self.lap_tracker.marker()
    }

    pub fn results(&self) -> Vec<RaceResult> {
        race::rank(&self.racers, self.session.match_start_at_local_ms)
    }

    fn require(&self, expected: Role) -> Result<(), SessionError> {
        if self.role != expected {
            return Err(SessionError::RoleMismatch {
                expected,
                actual: self.role,
            });
        }
        Ok(())
    }

    /// Host timer tick: probe every peer with a TimeSync.
    pub fn tick(&mut self, now_ms: i64) -> Result<Vec<OutboundAction>, SessionError> {
        self.require(Role::Host)?;
        let SyncState::Host(host) = &mut self.sync else {
            return Ok(vec![]);
        };
        let probe = host.next_probe(now_ms);
        Ok(vec![OutboundAction::Broadcast(wire::encode_message(&probe))])
    }

    /// Peer appeared on the transport. A client introduces itself to the host once.
    pub fn on_peer_joined(&mut self, peer: &Peer) -> Vec<OutboundAction> {
        if let Some(name) = &peer.name {
            self.peer_names.entry(peer.id.clone()).or_insert_with(|| name.clone());
        }
        if self.role == Role::Client && !self.joined_host {
            self.joined_host = true;
            let join = NetMessage::Join {
                name: self.local_name.clone(),
                protocol_version: PROTOCOL_VERSION as i32,
            };
            return vec![OutboundAction::SendMessage(
                peer.clone(),
                wire::encode_message(&join),
            )];
        }
        vec![]
    }

    /// Peer went away. Its racer entry stays for the results.
    pub fn on_peer_left(&mut self, peer_id: &str) {
        self.telemetry.remove(peer_id);
        match &mut self.sync {
            SyncState::Host(h) => h.forget_peer(peer_id),
            SyncState::Client(_) => self.joined_host = false,
        }
    }

    /// Ping every peer. Replies come back as `RaceNotice::PingReply`.
    pub fn ping(&mut self, now_ms: i64) -> Vec<OutboundAction> {
        self.pending_pings
            .retain(|_, sent| now_ms - *sent < PING_TIMEOUT_MS);
        let nonce = rand::random::<i32>();
        self.pending_pings.insert(nonce, now_ms);
        let msg = NetMessage::Ping { nonce };
        vec![OutboundAction::Broadcast(wire::encode_message(&msg))]
    }

    /// Host starts a match `countdown + 1` seconds from now and tells everyone.
    pub fn start_match(
        &mut self,
        now_ms: i64,
        countdown_seconds: u8,
        target_laps: u8,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        self.require(Role::Host)?;
        let start = StartMatch::scheduled(now_ms, countdown_seconds, target_laps);
        let msg = RaceEvent::StartMatch(start).to_message()?;
        let mut actions = vec![OutboundAction::Broadcast(wire::encode_message(&msg))];
        actions.extend(self.begin_match(start.host_go_at_ms, countdown_seconds, target_laps));
        Ok(actions)
    }

    /// Host cancels the countdown (or running match) everywhere.
    pub fn cancel_match(&mut self) -> Result<Vec<OutboundAction>, SessionError> {
        self.require(Role::Host)?;
        let msg = RaceEvent::CancelMatch.to_message()?;
        let mut actions = vec![OutboundAction::Broadcast(wire::encode_message(&msg))];
        actions.extend(self.end_match());
        Ok(actions)
    }

    fn begin_match(&mut self, go_at_local_ms: i64, countdown_seconds: u8, target_laps: u8) -> Vec<OutboundAction> {
        self.session.start(go_at_local_ms, target_laps);
        for racer in self.racers.values_mut() {
            racer.reset();
        }
        self.lap_tracker.arm();
        vec![OutboundAction::Notify(RaceNotice::MatchScheduled {
            go_at_local_ms,
            countdown_seconds,
            target_laps,
        })]
    }

    fn end_match(&mut self) -> Vec<OutboundAction> {
        self.session.cancel();
        self.lap_tracker.disarm();
        vec![OutboundAction::Notify(RaceNotice::MatchCancelled)]
    }

    fn racer_entry(&mut self, racer_id: &str) -> &mut RacerState {
        let name = if racer_id == LOCAL_RACER_ID {
            self.local_name.clone()
        } else {
            self.peer_names.get(racer_id).cloned()
        };
        self.racers
            .entry(racer_id.to_string())
            .or_insert_with(|| RacerState::named(name))
    }

    /// Process one payload received from `peer`.
    pub fn on_message_received(
        &mut self,
        peer: &Peer,
        bytes: &[u8],
        now_ms: i64,
    ) -> Result<Vec<OutboundAction>, MessageError> {
        let msg = wire::decode_message(bytes).ok_or(MessageError::DecodeFailed)?;
        let mut actions = Vec::new();
        match msg {
            NetMessage::TimeSync {
                t_host,
                seq,
                t_client,
            } => match (&mut self.sync, t_client) {
                (SyncState::Client(client), None) => {
                    let echo = client.on_probe(t_host, seq, now_ms);
                    debug!(seq, offset_ms = t_host - now_ms, "time sync probe");
                    actions.push(OutboundAction::SendMessage(
                        peer.clone(),
                        wire::encode_message(&echo),
                    ));
                }
                // Only clients send TimeSync to a host, so every one is an echo; a
                // client clock reading 0 decodes as `None`.
                (SyncState::Host(host), t_client) => {
                    if let Some(sample) = host.on_echo(&peer.id, seq, t_client.unwrap_or(0), now_ms) {
                        debug!(peer = %peer.id, seq, rtt_ms = sample.rtt_ms, offset_ms = sample.offset_ms, "time sync echo");
                        actions.push(OutboundAction::Notify(RaceNotice::OffsetEstimated {
                            peer_id: peer.id.clone(),
                            sample,
                        }));
                    }
                }
                _ => {}
            },
            NetMessage::Event { kind, payload } => {
                let event = RaceEvent::decode(kind, &payload, now_ms)?;
                actions.extend(self.apply_remote_event(peer, event, now_ms));
            }
            NetMessage::Join {
                name,
                protocol_version,
            } => {
                if protocol_version != PROTOCOL_VERSION as i32 {
                    warn!(peer = %peer.id, protocol_version, "peer speaks a different protocol version");
                }
                if let Some(name) = name {
                    self.peer_names.insert(peer.id.clone(), name.clone());
                    if let Some(r) = self.racers.get_mut(&peer.id) {
                        r.name = Some(name);
                    }
                }
                actions.push(OutboundAction::Notify(RaceNotice::PeerJoined {
                    peer: Peer::new(peer.id.clone(), self.peer_names.get(&peer.id).cloned()),
                }));
            }
            NetMessage::Telemetry {
                piece_id,
                location_id,
                offset_mm,
                speed_mmps,
                flags,
                ts_client,
            } => {
                self.telemetry.insert(
                    peer.id.clone(),
                    PeerTelemetry {
                        piece_id,
                        location_id,
                        offset_mm,
                        speed_mmps,
                        flags,
                        ts_client,
                        received_at_ms: now_ms,
                    },
                );
            }
            NetMessage::Ping { nonce } => match self.pending_pings.get(&nonce) {
                Some(&sent) => {
                    actions.push(OutboundAction::Notify(RaceNotice::PingReply {
                        peer_id: peer.id.clone(),
                        rtt_ms: now_ms - sent,
                    }));
                }
                None => actions.push(OutboundAction::SendMessage(peer.clone(), bytes.to_vec())),
            },
            NetMessage::Input { .. } | NetMessage::WorldState { .. } => {
                debug!(peer = %peer.id, "ignoring input/world message");
            }
        }
        Ok(actions)
    }

    fn apply_remote_event(&mut self, peer: &Peer, event: RaceEvent, now_ms: i64) -> Vec<OutboundAction> {
        match event {
            RaceEvent::StartMatch(start) => {
                let go_at_local_ms = match &self.sync {
                    SyncState::Client(c) => c.to_local(start.host_go_at_ms),
                    SyncState::Host(_) => start.host_go_at_ms,
                };
                self.begin_match(go_at_local_ms, start.countdown_seconds, start.target_laps)
            }
            RaceEvent::CancelMatch => self.end_match(),
            RaceEvent::LapCompleted(LapCompleted {
                laps, last_lap_ms, ..
            }) => {
                let lap_ms = Some(last_lap_ms).filter(|&ms| ms > 0);
                self.racer_entry(&peer.id).record_lap(laps, lap_ms);
                vec![OutboundAction::Notify(RaceNotice::LapCompleted {
                    racer_id: peer.id.clone(),
                    laps,
                    lap_ms,
                })]
            }
            RaceEvent::Finished(Finished {
                laps,
                elapsed_since_go_ms,
            }) => {
                let finished_at_local_ms = self
                    .session
                    .match_start_at_local_ms
                    .map_or(now_ms, |go| go + elapsed_since_go_ms);
                let racer = self.racer_entry(&peer.id);
                racer.record_finish(laps, finished_at_local_ms);
                let finished_at_local_ms = racer.finished_at_local_ms.unwrap_or(finished_at_local_ms);
                vec![OutboundAction::Notify(RaceNotice::Finished {
                    racer_id: peer.id.clone(),
                    laps,
                    finished_at_local_ms,
                })]
            }
        }
    }

    /// Use `piece` as the lap start marker from now on.
    pub fn set_start_marker(&mut self, piece: u8, now_ms: i64) {
        self.lap_tracker.set_marker(piece, now_ms);
    }

    /// Process one decoded message from the local vehicle.
    pub fn on_vehicle_message(&mut self, msg: &VehicleMessage, now_ms: i64) -> Vec<OutboundAction> {
        match msg {
            VehicleMessage::PositionUpdate(pos) => self.on_position(pos, now_ms),
            _ => vec![],
        }
    }

    fn on_position(&mut self, pos: &PositionUpdate, now_ms: i64) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        let due = self
            .last_telemetry_sent_ms
            .map_or(true, |last| now_ms - last >= self.config.telemetry_interval_ms);
        if due {
            let t = NetMessage::Telemetry {
                piece_id: pos.road_piece_id as i32,
                location_id: pos.location_id as i32,
                offset_mm: pos.offset_from_center_mm,
                speed_mmps: pos.speed_mm_per_sec as i32,
                flags: pos.parsing_flags.unwrap_or(0) as i32,
                ts_client: now_ms,
            };
            actions.push(OutboundAction::Broadcast(wire::encode_message(&t)));
            self.last_telemetry_sent_ms = Some(now_ms);
        }
        let lap = self.lap_tracker.on_position(
            pos.road_piece_id,
            pos.speed_mm_per_sec,
            now_ms,
            self.session.match_start_at_local_ms,
        );
        if let Some(lap) = lap {
            actions.extend(self.on_local_lap(lap));
        }
        actions
    }

    fn on_local_lap(&mut self, lap: Lap) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        let elapsed_since_go_ms = self.session.elapsed_since_go(lap.at_ms).unwrap_or(0);
        self.racer_entry(LOCAL_RACER_ID).record_lap(lap.laps, lap.duration_ms);
        let event = RaceEvent::LapCompleted(LapCompleted {
            laps: lap.laps,
            last_lap_ms: lap.duration_ms.unwrap_or(0),
            elapsed_since_go_ms,
        });
        if let Ok(msg) = event.to_message() {
            actions.push(OutboundAction::Broadcast(wire::encode_message(&msg)));
        }
        actions.push(OutboundAction::Notify(RaceNotice::LapCompleted {
            racer_id: LOCAL_RACER_ID.to_string(),
            laps: lap.laps,
            lap_ms: lap.duration_ms,
        }));

        let Some(target) = self.session.target_laps else {
            return actions;
        };
        let local = self.racer_entry(LOCAL_RACER_ID);
        if lap.laps < target || local.is_finished() {
            return actions;
        }
        local.record_finish(lap.laps, lap.at_ms);
        let event = RaceEvent::Finished(Finished {
            laps: lap.laps,
            elapsed_since_go_ms,
        });
        if let Ok(msg) = event.to_message() {
            actions.push(OutboundAction::Broadcast(wire::encode_message(&msg)));
        }
        actions.push(OutboundAction::Vehicle(VehicleCommand::stop()));
        actions.push(OutboundAction::Notify(RaceNotice::Finished {
            racer_id: LOCAL_RACER_ID.to_string(),
            laps: lap.laps,
            finished_at_local_ms: lap.at_ms,
        }));
        actions
    }

    /// End of the transport's lifetime: forget everything.
    pub fn teardown(&mut self) {
        self.session.clear();
        self.racers.clear();
        self.telemetry.clear();
        self.peer_names.clear();
        self.lap_tracker = LapTracker::new(self.config.lap_debounce_ms, self.config.min_lap_speed_mm_per_sec);
        self.last_telemetry_sent_ms = None;
        self.joined_host = false;
        self.pending_pings.clear();
        self.sync = match self.role {
            Role::Host => SyncState::Host(HostSync::new()),
            Role::Client => SyncState::Client(ClientSync::new()),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventType;

    fn host_peer() -> Peer {
        Peer::new("host", Some("Host".into()))
    }

    fn position(piece: u8, speed: u16) -> VehicleMessage {
        VehicleMessage::PositionUpdate(PositionUpdate {
            location_id: 0,
            road_piece_id: piece,
            offset_from_center_mm: 0.0,
            speed_mm_per_sec: speed,
            parsing_flags: None,
            last_recv_lane_change_id: None,
            last_exec_lane_change_id: None,
            last_desired_h_speed_mm_per_sec: None,
            last_desired_speed_mm_per_sec: None,
        })
    }

    fn broadcasts(actions: &[OutboundAction]) -> Vec<NetMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Broadcast(b) => wire::decode_message(b),
                _ => None,
            })
            .collect()
    }

    fn events(actions: &[OutboundAction]) -> Vec<RaceEvent> {
        broadcasts(actions)
            .into_iter()
            .filter_map(|m| match m {
                NetMessage::Event { kind, payload } => RaceEvent::decode(kind, &payload, 0).ok(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn client_rejects_host_only_operations() {
        let mut client = RaceCore::new(Role::Client, None);
        assert!(matches!(
            client.tick(0),
            Err(SessionError::RoleMismatch { expected: Role::Host, actual: Role::Client })
        ));
        assert!(client.start_match(0, 3, 3).is_err());
        assert!(client.cancel_match().is_err());
    }

    #[test]
    fn time_sync_round_trip_between_cores() {
        let mut host = RaceCore::new(Role::Host, Some("H".into()));
        let mut client = RaceCore::new(Role::Client, Some("C".into()));
        let client_peer = Peer::new("c1", Some("C".into()));

        let probe = match host.tick(1000).unwrap().remove(0) {
            OutboundAction::Broadcast(b) => b,
            other => panic!("expected broadcast, got {other:?}"),
        };
        let echo = match client.on_message_received(&host_peer(), &probe, 1040).unwrap().remove(0) {
            OutboundAction::SendMessage(to, b) => {
                assert_eq!(to, host_peer());
                b
            }
            other => panic!("expected direct reply, got {other:?}"),
        };
        assert_eq!(client.provisional_offset_ms(), Some(-40));

        // Pretend the client clock reads 1060 when echoing; host receives at 1100.
        let echo = match wire::decode_message(&echo) {
            Some(NetMessage::TimeSync { t_host, seq, .. }) => wire::encode_message(&NetMessage::TimeSync {
                t_host,
                seq,
                t_client: Some(1060),
            }),
            other => panic!("unexpected echo {other:?}"),
        };
        let actions = host.on_message_received(&client_peer, &echo, 1100).unwrap();
        let sample = host.offset_for("c1").unwrap();
        assert_eq!((sample.rtt_ms, sample.offset_ms), (100, 10));
        assert!(matches!(actions[0], OutboundAction::Notify(RaceNotice::OffsetEstimated { .. })));
    }

    #[test]
    fn echo_from_client_clock_at_zero_is_estimated() {
        let mut host = RaceCore::new(Role::Host, None);
        let mut client = RaceCore::new(Role::Client, None);
        let client_peer = Peer::new("c1", None);

        let probe = match host.tick(500).unwrap().remove(0) {
            OutboundAction::Broadcast(b) => b,
            other => panic!("expected broadcast, got {other:?}"),
        };
        let echo = match client.on_message_received(&host_peer(), &probe, 0).unwrap().remove(0) {
            OutboundAction::SendMessage(_, b) => b,
            other => panic!("expected direct reply, got {other:?}"),
        };
        let actions = host.on_message_received(&client_peer, &echo, 540).unwrap();
        assert!(matches!(actions[0], OutboundAction::Notify(RaceNotice::OffsetEstimated { .. })));
        let sample = host.offset_for("c1").unwrap();
        assert_eq!((sample.rtt_ms, sample.offset_ms), (40, -520));
    }

    #[test]
    fn start_match_propagates_with_client_offset() {
        let mut host = RaceCore::new(Role::Host, None);
        let mut client = RaceCore::new(Role::Client, None);

        // Client clock is 200 ms behind the host: probe t_host=10_200 arrives at local 10_000.
        let probe = wire::encode_message(&NetMessage::TimeSync { t_host: 10_200, seq: 1, t_client: None });
        client.on_message_received(&host_peer(), &probe, 10_000).unwrap();

        let actions = host.start_match(10_000, 3, 3).unwrap();
        assert_eq!(host.session().match_start_at_local_ms, Some(14_000));
        let start = match &actions[0] {
            OutboundAction::Broadcast(b) => b.clone(),
            other => panic!("expected broadcast, got {other:?}"),
        };
        client.on_message_received(&host_peer(), &start, 10_050).unwrap();
        assert_eq!(client.session().match_start_at_local_ms, Some(13_800));
        assert_eq!(client.session().target_laps, Some(3));

        let cancel = match &host.cancel_match().unwrap()[0] {
            OutboundAction::Broadcast(b) => b.clone(),
            other => panic!("expected broadcast, got {other:?}"),
        };
        client.on_message_received(&host_peer(), &cancel, 10_100).unwrap();
        assert_eq!(client.session().match_start_at_local_ms, None);
        assert_eq!(host.session().match_start_at_local_ms, None);
    }

    #[test]
    fn full_race_as_host() {
        let mut host = RaceCore::new(Role::Host, Some("Me".into()));
        host.start_match(0, 3, 3).unwrap();
        let go = 4_000;
        let mut all = Vec::new();
        let samples = [
            (go + 100, 17, 300),
            (go + 5_000, 18, 600),
            (go + 20_000, 17, 600),
            (go + 25_000, 18, 600),
            (go + 42_000, 17, 600),
            (go + 50_000, 18, 600),
            (go + 61_000, 17, 600),
        ];
        for (at, piece, speed) in samples {
            all.extend(host.on_vehicle_message(&position(piece, speed), at));
        }
        let local = host.racer(LOCAL_RACER_ID).unwrap();
        assert_eq!(local.laps_completed, 3);
        assert_eq!(local.best_lap_ms, Some(19_000));
        assert_eq!(local.finished_at_local_ms, Some(go + 61_000));
        assert_eq!(local.name.as_deref(), Some("Me"));

        let evs = events(&all);
        assert_eq!(
            evs.last(),
            Some(&RaceEvent::Finished(Finished { laps: 3, elapsed_since_go_ms: 61_000 }))
        );
        assert!(evs.contains(&RaceEvent::LapCompleted(LapCompleted {
            laps: 2,
            last_lap_ms: 22_000,
            elapsed_since_go_ms: 42_000
        })));
        assert!(all.contains(&OutboundAction::Vehicle(VehicleCommand::stop())));

        // A further lap does not finish twice.
        all.clear();
        all.extend(host.on_vehicle_message(&position(18, 600), go + 70_000));
        all.extend(host.on_vehicle_message(&position(17, 600), go + 80_000));
        assert!(!all.contains(&OutboundAction::Vehicle(VehicleCommand::stop())));
        assert_eq!(host.racer(LOCAL_RACER_ID).unwrap().finished_at_local_ms, Some(go + 61_000));
    }

    #[test]
    fn remote_laps_are_monotonic_and_finish_maps_to_local_clock() {
        let mut host = RaceCore::new(Role::Host, None);
        host.start_match(0, 3, 2).unwrap();
        let peer = Peer::new("p1", Some("Rho".into()));
        host.on_peer_joined(&peer);

        let lap = |laps: u8, ms: i64| {
            wire::encode_message(
                &RaceEvent::LapCompleted(LapCompleted { laps, last_lap_ms: ms, elapsed_since_go_ms: 0 })
                    .to_message()
                    .unwrap(),
            )
        };
        host.on_message_received(&peer, &lap(2, 21_000), 30_000).unwrap();
        host.on_message_received(&peer, &lap(1, 18_000), 31_000).unwrap();
        let r = host.racer("p1").unwrap();
        assert_eq!(r.laps_completed, 2);
        assert_eq!(r.best_lap_ms, Some(18_000));
        assert_eq!(r.name.as_deref(), Some("Rho"));

        let fin = wire::encode_message(
            &RaceEvent::Finished(Finished { laps: 2, elapsed_since_go_ms: 40_000 }).to_message().unwrap(),
        );
        host.on_message_received(&peer, &fin, 99_000).unwrap();
        assert_eq!(host.racer("p1").unwrap().finished_at_local_ms, Some(44_000));

        let results = host.results();
        assert_eq!(results[0].racer_id, "p1");
    }

    #[test]
    fn client_joins_once_and_pings_are_echoed() {
        let mut client = RaceCore::new(Role::Client, Some("Kid".into()));
        let first = client.on_peer_joined(&host_peer());
        assert_eq!(first.len(), 1);
        match &first[0] {
            OutboundAction::SendMessage(_, b) => assert_eq!(
                wire::decode_message(b),
                Some(NetMessage::Join { name: Some("Kid".into()), protocol_version: 1 })
            ),
            other => panic!("expected join, got {other:?}"),
        }
        assert!(client.on_peer_joined(&host_peer()).is_empty());

        let ping = wire::encode_message(&NetMessage::Ping { nonce: 77 });
        let actions = client.on_message_received(&host_peer(), &ping, 0).unwrap();
        assert_eq!(actions, vec![OutboundAction::SendMessage(host_peer(), ping)]);
    }

    #[test]
    fn own_ping_coming_back_is_a_reply() {
        let mut host = RaceCore::new(Role::Host, None);
        let mut client = RaceCore::new(Role::Client, None);
        let ping = match host.ping(1_000).remove(0) {
            OutboundAction::Broadcast(b) => b,
            other => panic!("expected broadcast, got {other:?}"),
        };
        let client_peer = Peer::new("c", None);
        let echo = match client.on_message_received(&host_peer(), &ping, 5).unwrap().remove(0) {
            OutboundAction::SendMessage(_, b) => b,
            other => panic!("expected echo, got {other:?}"),
        };
        let actions = host.on_message_received(&client_peer, &echo, 1_030).unwrap();
        assert_eq!(
            actions,
            vec![OutboundAction::Notify(RaceNotice::PingReply { peer_id: "c".into(), rtt_ms: 30 })]
        );
    }

    #[test]
    fn host_records_join_name_and_telemetry() {
        let mut host = RaceCore::new(Role::Host, None);
        let peer = Peer::new("p9", None);
        let join = wire::encode_message(&NetMessage::Join { name: Some("Nuke".into()), protocol_version: 1 });
        let actions = host.on_message_received(&peer, &join, 0).unwrap();
        assert_eq!(
            actions,
            vec![OutboundAction::Notify(RaceNotice::PeerJoined { peer: Peer::new("p9", Some("Nuke".into())) })]
        );
        let t = wire::encode_message(&NetMessage::Telemetry {
            piece_id: 4,
            location_id: 2,
            offset_mm: 1.5,
            speed_mmps: 700,
            flags: 0,
            ts_client: 5,
        });
        host.on_message_received(&peer, &t, 123).unwrap();
        let got = host.peer_telemetry("p9").unwrap();
        assert_eq!((got.piece_id, got.speed_mmps, got.received_at_ms), (4, 700, 123));
        host.on_peer_left("p9");
        assert!(host.peer_telemetry("p9").is_none());
    }

    #[test]
    fn telemetry_forwarding_is_rate_limited() {
        let mut client = RaceCore::new(Role::Client, None);
        let count = |a: Vec<OutboundAction>| {
            broadcasts(&a)
                .into_iter()
                .filter(|m| matches!(m, NetMessage::Telemetry { .. }))
                .count()
        };
        assert_eq!(count(client.on_vehicle_message(&position(1, 500), 1_000)), 1);
        assert_eq!(count(client.on_vehicle_message(&position(1, 500), 1_050)), 0);
        assert_eq!(count(client.on_vehicle_message(&position(1, 500), 1_100)), 1);
    }

    #[test]
    fn undecodable_input_is_reported() {
        let mut host = RaceCore::new(Role::Host, None);
        assert!(matches!(
            host.on_message_received(&host_peer(), &[0xEE], 0),
            Err(MessageError::DecodeFailed)
        ));
        let bad_lap = wire::encode_message(&NetMessage::event(EventType::LapCompleted, vec![1]));
        assert!(matches!(
            host.on_message_received(&host_peer(), &bad_lap, 0),
            Err(MessageError::Event(_))
        ));
    }

    #[test]
    fn teardown_clears_everything() {
        let mut host = RaceCore::new(Role::Host, None);
        host.start_match(0, 3, 3).unwrap();
        host.on_vehicle_message(&position(3, 500), 4_500);
        host.teardown();
        assert_eq!(host.session(), RaceSession::default());
        assert!(host.racers().is_empty());
        assert_eq!(host.lap_marker(), None);
    }
}
