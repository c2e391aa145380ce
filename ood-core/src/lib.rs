//! OpenOverdrive protocol reference implementation.
//! Host-driven: no I/O; the host passes vehicle and peer bytes in and receives actions.

pub mod clock;
pub mod discovery;
pub mod event;
pub mod protocol;
pub mod race;
pub mod timesync;
pub mod vehicle;
pub mod wire;

pub use clock::{Clock, ManualClock, SystemClock};
pub use discovery::{Advertisement, DeviceTable, DiscoveredDevice, NameHeuristic};
pub use event::{EventError, RaceEvent};
pub use protocol::{NetMessage, Peer, Role, PROTOCOL_VERSION};
pub use race::{MatchPhase, RaceResult, RaceSession, RacerState};
pub use vehicle::{VehicleCommand, VehicleMessage};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
pub use core::{
    MessageError, OutboundAction, RaceConfig, RaceCore, RaceNotice, SessionError, LOCAL_RACER_ID,
};

pub mod core;
