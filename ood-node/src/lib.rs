//! OpenOverdrive node: vehicle link management, peer transport and the race service
//! on top of the `ood-core` protocol implementation.

pub mod config;
pub mod link;
pub mod radio;
pub mod session;
pub mod transport;

pub use link::{ConnectionState, LinkError, LinkManager};
pub use radio::{DeliveryMode, Radio, RadioChannel, RadioError};
pub use session::{RaceService, ServiceOptions};
pub use transport::{LanConfig, LanTransport, MemoryHub, PeerTransport};
