//! Peer transport: role-parameterized message channel between controllers.
//! `LanTransport` advertises over UDP multicast and carries length-prefixed frames
//! over TCP; `MemoryHub` links transports in-process.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use ood_core::protocol::{Peer, Role, DEFAULT_SERVICE_ID, PROTOCOL_VERSION};
use ood_core::wire::{encode_frame, frame_len, LEN_SIZE};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Received messages buffered per `incoming()` subscriber.
pub const INCOMING_BUFFER: usize = 1024;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn role(&self) -> Role;
    fn local_peer(&self) -> Peer;
    /// Start advertising (host) or discovering (client). Starting twice is a no-op.
    async fn start(&self) -> bool;
    async fn stop(&self);
    async fn send(&self, peer: &Peer, bytes: &[u8]) -> bool;
    /// Returns the number of peers the payload was handed to.
    async fn broadcast(&self, bytes: &[u8]) -> usize;
    /// One item per payload sent by a peer.
    fn incoming(&self) -> broadcast::Receiver<(Peer, Vec<u8>)>;
    fn peers(&self) -> watch::Receiver<Vec<Peer>>;
    fn status(&self) -> String;
}

// ---------------------------------------------------------------------------
// LAN

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const ADVERT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Advert {
    protocol_version: u8,
    service_id: String,
    peer_id: String,
    name: Option<String>,
    port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Hello {
    protocol_version: u8,
    peer_id: String,
    name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LanConfig {
    pub service_id: String,
    pub discovery_port: u16,
    pub transport_port: u16,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            service_id: DEFAULT_SERVICE_ID.to_string(),
            discovery_port: 45688,
            transport_port: 45689,
        }
    }
}

struct Shared {
    local: Peer,
    senders: Mutex<BTreeMap<String, (Peer, mpsc::UnboundedSender<Vec<u8>>)>>,
    incoming: broadcast::Sender<(Peer, Vec<u8>)>,
    roster: watch::Sender<Vec<Peer>>,
    status: watch::Sender<String>,
}

impl Shared {
    async fn add_peer(&self, peer: Peer, tx: mpsc::UnboundedSender<Vec<u8>>) {
        let mut senders = self.senders.lock().await;
        senders.insert(peer.id.clone(), (peer, tx));
        self.publish(&senders);
    }

    async fn remove_peer(&self, peer_id: &str) {
        let mut senders = self.senders.lock().await;
        if senders.remove(peer_id).is_some() {
            self.publish(&senders);
        }
    }

    fn publish(&self, senders: &BTreeMap<String, (Peer, mpsc::UnboundedSender<Vec<u8>>)>) {
        let peers: Vec<Peer> = senders.values().map(|(p, _)| p.clone()).collect();
        let status = if peers.is_empty() {
            self.idle_status()
        } else {
            format!("Connected ({} peers)", peers.len())
        };
        self.roster.send_replace(peers);
        self.status.send_replace(status);
    }

    fn idle_status(&self) -> String {
        let s = self.status.borrow();
        if s.starts_with("Connected") {
            "Waiting".to_string()
        } else {
            s.clone()
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct LanTransport {
    role: Role,
    config: LanConfig,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl LanTransport {
    pub fn new(role: Role, local: Peer, config: LanConfig) -> Self {
        let (incoming, _) = broadcast::channel(INCOMING_BUFFER);
        let (roster, _) = watch::channel(Vec::new());
        let (status, _) = watch::channel("Idle".to_string());
        Self {
            role,
            config,
            shared: Arc::new(Shared {
                local,
                senders: Mutex::new(BTreeMap::new()),
                incoming,
                roster,
                status,
            }),
            running: Mutex::new(None),
        }
    }

    async fn start_host(&self, shutdown: watch::Receiver<bool>) -> std::io::Result<Vec<JoinHandle<()>>> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.transport_port)).await?;
        let port = listener.local_addr()?.port();
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_multicast_ttl_v4(1)?;
        let advert = Advert {
            protocol_version: PROTOCOL_VERSION,
            service_id: self.config.service_id.clone(),
            peer_id: self.shared.local.id.clone(),
            name: self.shared.local.name.clone(),
            port,
        };
        let advert = bincode::serialize(&advert)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let dest = SocketAddr::from((MULTICAST_GROUP, self.config.discovery_port));
        self.shared.status.send_replace("Advertising".to_string());
        info!(port, "advertising race session");

        let advert_task = tokio::spawn(async move {
            loop {
                if let Err(e) = socket.send_to(&advert, dest).await {
                    debug!(error = %e, "advert send failed");
                }
                tokio::time::sleep(ADVERT_INTERVAL).await;
            }
        });

        let shared = self.shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, from)) => {
                        let shared = shared.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            match handshake(stream, &shared.local).await {
                                Ok((stream, peer)) => run_connection(shared, stream, peer, shutdown).await,
                                Err(e) => warn!(%from, error = %e, "handshake failed"),
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });
        Ok(vec![advert_task, accept_task])
    }

    async fn start_client(&self, shutdown: watch::Receiver<bool>) -> std::io::Result<Vec<JoinHandle<()>>> {
        let socket = make_multicast_socket(self.config.discovery_port)?;
        self.shared.status.send_replace("Discovering".to_string());
        let shared = self.shared.clone();
        let service_id = self.config.service_id.clone();
        let discover_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let (n, from) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "discovery socket failed");
                        break;
                    }
                };
                let Ok(advert) = bincode::deserialize::<Advert>(&buf[..n]) else {
                    continue;
                };
                if advert.protocol_version != PROTOCOL_VERSION
                    || advert.service_id != service_id
                    || advert.peer_id == shared.local.id
                {
                    continue;
                }
                // Star topology: one host at a time.
                if !shared.senders.lock().await.is_empty() {
                    continue;
                }
                let addr = SocketAddr::new(from.ip(), advert.port);
                info!(%addr, host = %advert.peer_id, "connecting to host");
                let stream = match TcpStream::connect(addr).await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(%addr, error = %e, "connect failed");
                        continue;
                    }
                };
                match handshake(stream, &shared.local).await {
                    Ok((stream, peer)) => {
                        // Runs until the host goes away, then we listen for adverts again.
                        run_connection(shared.clone(), stream, peer, shutdown.clone()).await;
                    }
                    Err(e) => warn!(%addr, error = %e, "handshake failed"),
                }
            }
        });
        Ok(vec![discover_task])
    }
}

#[async_trait]
impl PeerTransport for LanTransport {
    fn role(&self) -> Role {
        self.role
    }

    fn local_peer(&self) -> Peer {
        self.shared.local.clone()
    }

    async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return true;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let started = match self.role {
            Role::Host => self.start_host(shutdown_rx).await,
            Role::Client => self.start_client(shutdown_rx).await,
        };
        match started {
            Ok(tasks) => {
                *running = Some(Running { shutdown, tasks });
                true
            }
            Err(e) => {
                warn!(role = ?self.role, error = %e, "transport start failed");
                self.shared.status.send_replace(format!("Error: {e}"));
                false
            }
        }
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        for task in running.tasks {
            task.abort();
        }
        let mut senders = self.shared.senders.lock().await;
        senders.clear();
        self.shared.roster.send_replace(Vec::new());
        self.shared.status.send_replace("Idle".to_string());
        info!("transport stopped");
    }

    async fn send(&self, peer: &Peer, bytes: &[u8]) -> bool {
        let senders = self.shared.senders.lock().await;
        senders
            .get(&peer.id)
            .map_or(false, |(_, tx)| tx.send(bytes.to_vec()).is_ok())
    }

    async fn broadcast(&self, bytes: &[u8]) -> usize {
        let senders = self.shared.senders.lock().await;
        senders
            .values()
            .filter(|(_, tx)| tx.send(bytes.to_vec()).is_ok())
            .count()
    }

    fn incoming(&self) -> broadcast::Receiver<(Peer, Vec<u8>)> {
        self.shared.incoming.subscribe()
    }

    fn peers(&self) -> watch::Receiver<Vec<Peer>> {
        self.shared.roster.subscribe()
    }

    fn status(&self) -> String {
        self.shared.status.borrow().clone()
    }
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = frame_len(len_buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let frame = encode_frame(payload).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.write_all(&frame).await?;
    stream.flush().await
}

/// Both sides send `Hello` first, then read the other's.
async fn handshake(mut stream: TcpStream, local: &Peer) -> std::io::Result<(TcpStream, Peer)> {
    let hello = Hello {
        protocol_version: PROTOCOL_VERSION,
        peer_id: local.id.clone(),
        name: local.name.clone(),
    };
    let out = bincode::serialize(&hello).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    write_frame(&mut stream, &out).await?;
    let theirs = read_frame(&mut stream).await?;
    let theirs: Hello =
        bincode::deserialize(&theirs).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if theirs.protocol_version != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    Ok((stream, Peer::new(theirs.peer_id, theirs.name)))
}

async fn run_connection(shared: Arc<Shared>, stream: TcpStream, peer: Peer, mut shutdown: watch::Receiver<bool>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    // Roster first, so the peer is listed before its first message.
    shared.add_peer(peer.clone(), tx).await;
    info!(peer = %peer.id, name = peer.label(), "peer connected");

    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &payload).await {
                debug!(error = %e, "peer write failed");
                break;
            }
        }
    });
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(payload) => {
                    let _ = shared.incoming.send((peer.clone(), payload));
                }
                Err(e) => {
                    debug!(peer = %peer.id, error = %e, "peer read ended");
                    break;
                }
            },
        }
    }
    writer_task.abort();
    shared.remove_peer(&peer.id).await;
    info!(peer = %peer.id, "peer disconnected");
}

// ---------------------------------------------------------------------------
// In-process

struct Endpoint {
    peer: Peer,
    role: Role,
    started: bool,
    incoming: broadcast::Sender<(Peer, Vec<u8>)>,
    roster: watch::Sender<Vec<Peer>>,
}

/// Links in-process transports in a star around the single host.
#[derive(Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<StdMutex<HashMap<String, Endpoint>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, role: Role, local: Peer) -> MemoryTransport {
        let (incoming, _) = broadcast::channel(INCOMING_BUFFER);
        let (roster, _) = watch::channel(Vec::new());
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.insert(
                local.id.clone(),
                Endpoint {
                    peer: local.clone(),
                    role,
                    started: false,
                    incoming,
                    roster,
                },
            );
        }
        MemoryTransport {
            hub: self.clone(),
            role,
            local,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, Endpoint>) -> R) -> Option<R> {
        self.endpoints.lock().ok().map(|mut e| f(&mut e))
    }
}

fn linked(a: &Endpoint, b: &Endpoint) -> bool {
    a.started && b.started && a.peer.id != b.peer.id && (a.role == Role::Host) != (b.role == Role::Host)
}

fn republish(endpoints: &HashMap<String, Endpoint>) {
    for ep in endpoints.values() {
        let mut peers: Vec<Peer> = endpoints
            .values()
            .filter(|other| linked(ep, other))
            .map(|other| other.peer.clone())
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        ep.roster.send_if_modified(|current| {
            let changed = *current != peers;
            *current = peers;
            changed
        });
    }
}

pub struct MemoryTransport {
    hub: MemoryHub,
    role: Role,
    local: Peer,
}

impl MemoryTransport {
    fn deliver(&self, endpoints: &HashMap<String, Endpoint>, to: &Endpoint, bytes: &[u8]) -> bool {
        match endpoints.get(&self.local.id) {
            Some(me) if linked(me, to) => {
                let _ = to.incoming.send((self.local.clone(), bytes.to_vec()));
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn role(&self) -> Role {
        self.role
    }

    fn local_peer(&self) -> Peer {
        self.local.clone()
    }

    async fn start(&self) -> bool {
        self.hub
            .with(|endpoints| {
                let Some(me) = endpoints.get_mut(&self.local.id) else {
                    return false;
                };
                me.started = true;
                republish(endpoints);
                true
            })
            .unwrap_or(false)
    }

    async fn stop(&self) {
        self.hub.with(|endpoints| {
            if let Some(me) = endpoints.get_mut(&self.local.id) {
                me.started = false;
            }
            republish(endpoints);
        });
    }

    async fn send(&self, peer: &Peer, bytes: &[u8]) -> bool {
        self.hub
            .with(|endpoints| {
                endpoints
                    .get(&peer.id)
                    .map_or(false, |to| self.deliver(endpoints, to, bytes))
            })
            .unwrap_or(false)
    }

    async fn broadcast(&self, bytes: &[u8]) -> usize {
        self.hub
            .with(|endpoints| {
                endpoints
                    .values()
                    .filter(|to| self.deliver(endpoints, to, bytes))
                    .count()
            })
            .unwrap_or(0)
    }

    fn incoming(&self) -> broadcast::Receiver<(Peer, Vec<u8>)> {
        self.hub
            .with(|endpoints| endpoints.get(&self.local.id).map(|e| e.incoming.subscribe()))
            .flatten()
            .unwrap_or_else(|| broadcast::channel(1).1)
    }

    fn peers(&self) -> watch::Receiver<Vec<Peer>> {
        self.hub
            .with(|endpoints| endpoints.get(&self.local.id).map(|e| e.roster.subscribe()))
            .flatten()
            .unwrap_or_else(|| watch::channel(Vec::new()).1)
    }

    fn status(&self) -> String {
        let peers = self.peers().borrow().len();
        match peers {
            0 => "Idle".to_string(),
            n => format!("Connected ({n} peers)"),
        }
    }
}
