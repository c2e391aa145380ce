//! Radio collaborator seam. The platform's scan/connect/notify facilities are
//! supplied by the embedding application as implementations of these traits.

use std::sync::Arc;

use async_trait::async_trait;
use ood_core::Advertisement;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("address not resolvable: {0}")]
    UnknownAddress(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("radio failure: {0}")]
    Failed(String),
}

/// Write delivery mode on the vehicle characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    WithResponse,
    WithoutResponse,
}

impl DeliveryMode {
    pub fn alternate(self) -> Self {
        match self {
            Self::WithResponse => Self::WithoutResponse,
            Self::WithoutResponse => Self::WithResponse,
        }
    }
}

/// Subscription mode for the read characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    Notify,
    Indicate,
}

/// Event pushed by an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Notification(Vec<u8>),
    Disconnected,
}

/// One open channel to a vehicle.
#[async_trait]
pub trait RadioChannel: Send + Sync {
    /// Returns the negotiated MTU.
    async fn request_mtu(&self, mtu: u16) -> Result<u16, RadioError>;
    async fn subscribe(&self, mode: SubscribeMode) -> Result<(), RadioError>;
    async fn write(&self, payload: &[u8], mode: DeliveryMode) -> Result<(), RadioError>;
    /// Release the channel. Must tolerate repeated calls.
    async fn close(&self);
}

/// Channel plus its event stream, as returned by `Radio::connect`.
pub struct Connection {
    pub channel: Arc<dyn RadioChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[async_trait]
pub trait Radio: Send + Sync {
    /// Start scanning; advertisements arrive on the returned receiver until `stop_scan`.
    async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<Advertisement>, RadioError>;
    async fn stop_scan(&self);
    /// Open a channel with the vehicle characteristics resolved.
    async fn connect(&self, address: &str) -> Result<Connection, RadioError>;
}
