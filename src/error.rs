//! Error taxonomy for the coordination layer.

use thiserror::Error;

use crate::bus::BusError;
use crate::claim::ClaimError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RoverError>;

/// Errors surfaced by publishers, subscribers and the command layer.
#[derive(Debug, Error)]
pub enum RoverError {
    /// A required argument (channel, pattern, topic) was missing or empty.
    /// Reported before any bus interaction.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A raw delivery could not be parsed as an envelope.
    #[error("malformed envelope on channel {channel}: {reason}")]
    MalformedEnvelope { channel: String, reason: String },

    /// The claim store failed while a group member tried to claim a message.
    /// The message is treated as not claimed.
    #[error("claim store failure for {key}: {source}")]
    ClaimStoreFailure {
        key: String,
        #[source]
        source: ClaimError,
    },

    /// A subscriber handler panicked. The subscriber has stopped dispatching.
    #[error("handler panicked on channel {channel}")]
    HandlerPanicked { channel: String },

    /// A response arrived whose correlation id matches no pending request.
    #[error("no pending request for correlation id {correlation_id:?}")]
    CorrelationMiss { correlation_id: Option<String> },

    /// A pending request was not answered before its deadline.
    #[error("request {0} timed out")]
    Timeout(String),

    /// The subscriber or sender was stopped while the call was outstanding.
    #[error("closed: {0}")]
    Closed(String),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl RoverError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        RoverError::InvalidArgument(msg.into())
    }

    /// True for errors that are expected under normal operation and only
    /// worth logging.
    pub fn is_benign(&self) -> bool {
        matches!(self, RoverError::CorrelationMiss { .. })
    }
}
