//! Link session manager: one radio connection's lifecycle, FIFO write serialization,
//! notification fan-out, and device discovery with pruning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ood_core::discovery::{DeviceTable, DiscoveredDevice, SCAN_RESULT_CADENCE_MS};
use ood_core::Clock;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::radio::{ChannelEvent, DeliveryMode, Radio, RadioChannel, RadioError, SubscribeMode};

/// MTU asked for after connecting; the link works at the default minimum too.
pub const REQUESTED_MTU: u16 = 185;
/// Notification frames buffered per subscriber before the oldest are dropped.
pub const NOTIFICATION_BUFFER: usize = 64;
const PRUNE_INTERVAL: Duration = Duration::from_millis(SCAN_RESULT_CADENCE_MS as u64 / 2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting(String),
    Connected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("invalid device address {0:?}")]
    InvalidAddress(String),
    #[error("failed to open link: {0}")]
    Open(#[source] RadioError),
    #[error("connect to {0:?} abandoned by disconnect")]
    Abandoned(String),
    #[error("failed to start scan: {0}")]
    Scan(#[source] RadioError),
}

struct WriteRequest {
    payload: Vec<u8>,
    mode: DeliveryMode,
    done: oneshot::Sender<bool>,
}

struct ActiveLink {
    generation: u64,
    address: String,
    channel: Arc<dyn RadioChannel>,
    writes: mpsc::UnboundedSender<WriteRequest>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    radio: Arc<dyn Radio>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<ConnectionState>,
    notifications: broadcast::Sender<Vec<u8>>,
    active: Mutex<Option<ActiveLink>>,
    /// Bumped by every connect and disconnect; a connect that finds it moved is stale.
    generation: AtomicU64,
    connecting: Mutex<()>,
    scan: Mutex<Option<JoinHandle<()>>>,
}

/// Owns at most one vehicle link. Cheap to clone; clones share the link.
#[derive(Clone)]
pub struct LinkManager {
    inner: Arc<Inner>,
}

impl LinkManager {
    pub fn new(radio: Arc<dyn Radio>, clock: Arc<dyn Clock>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            inner: Arc::new(Inner {
                radio,
                clock,
                state,
                notifications,
                active: Mutex::new(None),
                generation: AtomicU64::new(0),
                connecting: Mutex::new(()),
                scan: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Start a fresh scan, ending any earlier one first. The scan runs until the
    /// returned handle is dropped.
    pub async fn scan(&self) -> Result<Scan, LinkError> {
        let mut slot = self.inner.scan.lock().await;
        if let Some(previous) = slot.take() {
            previous.abort();
            // A scan task that ran to completion has already stopped the radio.
            if previous.await.is_err() {
                self.inner.radio.stop_scan().await;
                debug!("previous scan stopped");
            }
        }
        let adverts = self.inner.radio.start_scan().await.map_err(LinkError::Scan)?;
        let (tx, rx) = watch::channel(Vec::new());
        *slot = Some(tokio::spawn(run_scan(self.inner.clone(), adverts, tx)));
        Ok(Scan { rx })
    }

    /// Connect to `address`, tearing down any current link first.
    pub async fn connect(&self, address: &str) -> Result<(), LinkError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(LinkError::InvalidAddress(address.to_string()));
        }
        let _connecting = self.inner.connecting.lock().await;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.release(None).await;
        self.inner
            .state
            .send_replace(ConnectionState::Connecting(address.to_string()));
        info!(address, "connecting");

        let conn = match self.inner.radio.connect(address).await {
            Ok(conn) => conn,
            Err(e) => {
                self.inner.mark_disconnected();
                warn!(address, error = %e, "connect failed");
                return Err(match e {
                    RadioError::UnknownAddress(a) => LinkError::InvalidAddress(a),
                    other => LinkError::Open(other),
                });
            }
        };

        match conn.channel.request_mtu(REQUESTED_MTU).await {
            Ok(mtu) => debug!(address, mtu, "mtu negotiated"),
            Err(e) => debug!(address, error = %e, "mtu request rejected, using default"),
        }

        {
            // Stored and announced under the lock the pump's release waits on.
            let mut active = self.inner.active.lock().await;
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                self.inner.mark_disconnected();
                drop(active);
                conn.channel.close().await;
                info!(address, "connect abandoned");
                return Err(LinkError::Abandoned(address.to_string()));
            }
            let (writes, write_rx) = mpsc::unbounded_channel();
            let drain = tokio::spawn(drain_writes(conn.channel.clone(), write_rx));
            let pump = tokio::spawn(pump_events(self.inner.clone(), generation, conn.events));
            *active = Some(ActiveLink {
                generation,
                address: address.to_string(),
                channel: conn.channel,
                writes,
                tasks: vec![drain, pump],
            });
            self.inner
                .state
                .send_replace(ConnectionState::Connected(address.to_string()));
        }
        info!(address, "connected");

        if !self.enable_notifications().await {
            warn!(address, "notifications unavailable, continuing without them");
        }
        Ok(())
    }

    /// Subscribe to vehicle notifications, falling back from notify to indicate.
    pub async fn enable_notifications(&self) -> bool {
        let Some(channel) = self.inner.channel().await else {
            return false;
        };
        match channel.subscribe(SubscribeMode::Notify).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "notify rejected, trying indicate");
                channel.subscribe(SubscribeMode::Indicate).await.is_ok()
            }
        }
    }

    /// Queue a write. Resolves once the drain loop has attempted it; `false` when the
    /// write failed in both modes or the link went away first.
    pub async fn write(&self, payload: Vec<u8>, mode: DeliveryMode) -> bool {
        let writes = match self.inner.active.lock().await.as_ref() {
            Some(active) => active.writes.clone(),
            None => return false,
        };
        let (done, result) = oneshot::channel();
        if writes.send(WriteRequest { payload, mode, done }).is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }

    /// Raw notification frames from the vehicle. Slow readers lose the oldest frames.
    pub fn notifications(&self) -> Notifications {
        Notifications {
            rx: self.inner.notifications.subscribe(),
        }
    }

    /// Drop the current link, or abandon a connect that is still in progress.
    pub async fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.release(None).await;
    }
}

impl Inner {
    async fn channel(&self) -> Option<Arc<dyn RadioChannel>> {
        self.active.lock().await.as_ref().map(|a| a.channel.clone())
    }

    fn mark_disconnected(&self) {
        self.state.send_if_modified(|s| {
            let changed = !matches!(s, ConnectionState::Disconnected);
            *s = ConnectionState::Disconnected;
            changed
        });
    }

    /// Tear down the current link. With `Some(generation)` only that link is released.
    /// Releasing nothing is a no-op.
    async fn release(&self, generation: Option<u64>) {
        let active = {
            let mut guard = self.active.lock().await;
            let ours = guard
                .as_ref()
                .is_some_and(|a| generation.map_or(true, |g| g == a.generation));
            if ours {
                guard.take()
            } else {
                None
            }
        };
        let Some(active) = active else {
            if generation.is_none() {
                self.mark_disconnected();
            }
            return;
        };
        info!(address = %active.address, "releasing link");
        active.channel.close().await;
        self.state.send_replace(ConnectionState::Disconnected);
        // Dropping the queue with the drain task resolves pending writes as failed.
        drop(active.writes);
        for task in active.tasks {
            task.abort();
        }
    }
}

async fn drain_writes(channel: Arc<dyn RadioChannel>, mut rx: mpsc::UnboundedReceiver<WriteRequest>) {
    while let Some(req) = rx.recv().await {
        let ok = match channel.write(&req.payload, req.mode).await {
            Ok(()) => true,
            Err(e) => {
                let fallback = req.mode.alternate();
                debug!(error = %e, ?fallback, "write rejected, retrying in alternate mode");
                channel.write(&req.payload, fallback).await.is_ok()
            }
        };
        let _ = req.done.send(ok);
    }
}

async fn pump_events(inner: Arc<Inner>, generation: u64, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Notification(bytes) => {
                let _ = inner.notifications.send(bytes);
            }
            ChannelEvent::Disconnected => break,
        }
    }
    warn!("link dropped by radio");
    inner.release(Some(generation)).await;
}

async fn run_scan(
    inner: Arc<Inner>,
    mut adverts: mpsc::UnboundedReceiver<ood_core::Advertisement>,
    tx: watch::Sender<Vec<DiscoveredDevice>>,
) {
    let mut table = DeviceTable::default();
    let mut prune = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = tx.closed() => break,
            adv = adverts.recv() => {
                let Some(adv) = adv else { break };
                table.observe(&adv, inner.clock.now_ms());
                tx.send_replace(table.snapshot());
            }
            _ = prune.tick() => {
                if table.prune(inner.clock.now_ms()) {
                    tx.send_replace(table.snapshot());
                }
            }
        }
    }
    inner.radio.stop_scan().await;
    debug!("scan stopped");
}

/// Handle to a running scan. Dropping it stops the scan.
pub struct Scan {
    rx: watch::Receiver<Vec<DiscoveredDevice>>,
}

impl Scan {
    /// Next device list; `None` once the radio ends the scan.
    pub async fn next(&mut self) -> Option<Vec<DiscoveredDevice>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn latest(&self) -> Vec<DiscoveredDevice> {
        self.rx.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.rx.has_changed().is_err()
    }
}

pub struct Notifications {
    rx: broadcast::Receiver<Vec<u8>>,
}

impl Notifications {
    /// Next frame, skipping over any the reader fell behind on.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.rx.recv().await {
                Ok(bytes) => return Some(bytes),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(dropped = n, "notification reader lagging");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
