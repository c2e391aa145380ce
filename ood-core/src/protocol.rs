//! Peer protocol: message types, roles, and identifiers shared by all peers.

use serde::{Deserialize, Serialize};

/// Current protocol version. Sent in `Join` and in LAN adverts.
pub const PROTOCOL_VERSION: u8 = 1;

/// Logical session identifier used for peer discovery.
pub const DEFAULT_SERVICE_ID: &str = "de.schwen.openoverdrive.session";

/// Wire type byte of each [`NetMessage`] variant.
pub mod msg_type {
    pub const JOIN: u8 = 1;
    pub const TIME_SYNC: u8 = 2;
    pub const INPUT: u8 = 3;
    pub const TELEMETRY: u8 = 4;
    pub const WORLD_STATE: u8 = 5;
    pub const EVENT: u8 = 6;
    pub const PING: u8 = 7;
}

/// Which side of the star topology this device is. Fixed for a transport's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Advertises and accepts connections; drives time sync and match start.
    Host,
    /// Discovers a host and connects to the first one found.
    Client,
}

/// A remote (or the local) endpoint. `id` is unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub name: Option<String>,
}

impl Peer {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    /// Name if known, else id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Race event kinds carried inside [`NetMessage::Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    StartMatch,
    CancelMatch,
    LapCompleted,
    Finished,
}

impl EventType {
    pub fn code(self) -> i32 {
        match self {
            EventType::StartMatch => 1,
            EventType::CancelMatch => 2,
            EventType::LapCompleted => 3,
            EventType::Finished => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(EventType::StartMatch),
            2 => Some(EventType::CancelMatch),
            3 => Some(EventType::LapCompleted),
            4 => Some(EventType::Finished),
            _ => None,
        }
    }
}

/// All peer message types. Encoding is the hand-laid binary format in the wire module.
#[derive(Debug, Clone, PartialEq)]
pub enum NetMessage {
    /// Client announces itself to the host.
    Join { name: Option<String>, protocol_version: i32 },
    /// Host clock sample; echoed back by a client with `t_client` filled in.
    TimeSync { t_host: i64, seq: i32, t_client: Option<i64> },
    Input { throttle: i32, lane_change: i32, fire: bool, ts_client: i64 },
    Telemetry {
        piece_id: i32,
        location_id: i32,
        offset_mm: f32,
        speed_mmps: i32,
        flags: i32,
        ts_client: i64,
    },
    WorldState { tick: i32 },
    /// Race event; `kind` is an [`EventType`] code, unknown codes are carried through.
    Event { kind: i32, payload: Vec<u8> },
    Ping { nonce: i32 },
}

impl NetMessage {
    pub fn event(kind: EventType, payload: Vec<u8>) -> Self {
        NetMessage::Event {
            kind: kind.code(),
            payload,
        }
    }
}
