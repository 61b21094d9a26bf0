//! Transport contract the coordination layer needs from a pub/sub bus.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Raw message pushed by the bus to a subscribed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Published on a channel the connection subscribed to by name.
    Message { channel: String, payload: Vec<u8> },
    /// Published on a channel matching a subscribed glob pattern.
    PMessage {
        pattern: String,
        channel: String,
        payload: Vec<u8>,
    },
}

impl Delivery {
    pub fn channel(&self) -> &str {
        match self {
            Delivery::Message { channel, .. } | Delivery::PMessage { channel, .. } => channel,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Delivery::Message { payload, .. } | Delivery::PMessage { payload, .. } => payload,
        }
    }
}

/// Stream of deliveries for one connection.
pub type Deliveries = mpsc::UnboundedReceiver<Delivery>;

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Could not reach the bus.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// The connection was closed while a call was outstanding.
    #[error("connection closed")]
    Closed,
    /// The bus answered a command with an error reply.
    #[error("bus rejected command: {0}")]
    Rejected(String),
    /// The bus sent something the client cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A bus that can hand out private connections.
///
/// Every call to [`Bus::connect`] yields a fresh connection so that a
/// subscribe-mode connection never shares state with a publishing one.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn connect(&self) -> Result<(Arc<dyn Connection>, Deliveries), BusError>;
}

/// One connection to the bus.
///
/// The subscribe family resolves once the bus acknowledges the request, with
/// the connection's total subscription count (channels plus patterns) as
/// reported by that acknowledgement.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Publish raw bytes. Returns the number of receivers the bus reached.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BusError>;

    async fn subscribe(&self, channel: &str) -> Result<usize, BusError>;

    async fn psubscribe(&self, pattern: &str) -> Result<usize, BusError>;

    /// Drop one channel, or every channel when `None`.
    async fn unsubscribe(&self, channel: Option<&str>) -> Result<usize, BusError>;

    /// Drop one pattern, or every pattern when `None`.
    async fn punsubscribe(&self, pattern: Option<&str>) -> Result<usize, BusError>;

    /// Close the connection. Further calls fail with [`BusError::Closed`].
    async fn quit(&self) -> Result<(), BusError>;
}

#[async_trait]
impl<B: Bus + ?Sized> Bus for Arc<B> {
    async fn connect(&self) -> Result<(Arc<dyn Connection>, Deliveries), BusError> {
        (**self).connect().await
    }
}
