//! Publisher: stamps payloads with a fresh id and emits them on a channel.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::connection::Connection;
use crate::envelope::Envelope;
use crate::error::{Result, RoverError};

/// Emits envelopes on the bus over a private connection.
///
/// Publishing is fire-and-forget: no retry and no acknowledgement beyond
/// the bus accepting the message.
///
/// ## Example
///
/// ```ignore
/// let publisher = rover.publisher().await?;
/// let id = publisher.publish("events", &json!({ "foo": "bar" })).await?;
/// ```
pub struct Publisher {
    connection: Arc<dyn Connection>,
}

impl Publisher {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }

    /// Publish `payload` on `channel`. Returns the generated message id.
    pub async fn publish<T: Serialize + ?Sized>(&self, channel: &str, payload: &T) -> Result<String> {
        let envelope = Envelope::encode(payload)?;
        self.publish_envelope(channel, &envelope).await?;
        Ok(envelope.id().to_string())
    }

    /// Publish `payload` with extra metadata merged into the envelope.
    pub async fn publish_with_meta<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        payload: &T,
        meta: Map<String, Value>,
    ) -> Result<String> {
        let envelope = Envelope::encode(payload)?.with_meta_map(meta)?;
        self.publish_envelope(channel, &envelope).await?;
        Ok(envelope.id().to_string())
    }

    /// Publish an already stamped envelope. Useful when the id must be known
    /// (and registered somewhere) before the message leaves the process.
    /// Returns the number of receivers the bus reached.
    pub async fn publish_envelope(&self, channel: &str, envelope: &Envelope) -> Result<usize> {
        if channel.is_empty() {
            return Err(RoverError::invalid("publish requires a channel"));
        }
        let bytes = envelope.to_bytes()?;
        let receivers = self.connection.publish(channel, &bytes).await?;
        debug!(channel, message_id = envelope.id(), receivers, "published");
        Ok(receivers)
    }

    /// Close the underlying connection.
    pub async fn quit(&self) -> Result<()> {
        self.connection.quit().await?;
        Ok(())
    }
}
