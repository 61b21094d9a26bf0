//! Claim store on a Redis command connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::connection::RedisConnection;
use super::resp::Frame;
use crate::bus::BusError;
use crate::claim::{ClaimError, ClaimStore};
use crate::config::RedisConfig;

/// Claims recorded with `SET key value NX PX <ttl-ms>`.
///
/// A lost connection fails the claim in flight and is re-opened on the next
/// claim, so an outage only costs the deliveries attempted during it.
pub struct RedisClaimStore {
    config: RedisConfig,
    connection: Mutex<Option<Arc<RedisConnection>>>,
}

impl RedisClaimStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self, BusError> {
        let connection = open(config).await?;
        Ok(Self {
            config: config.clone(),
            connection: Mutex::new(Some(connection)),
        })
    }

    /// The live connection, re-opened if the previous one was lost.
    async fn connection(&self) -> Result<Arc<RedisConnection>, BusError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref().filter(|c| !c.is_closed()) {
            return Ok(Arc::clone(connection));
        }
        debug!(address = %self.config.address(), "reconnecting claim store");
        let connection = open(&self.config).await?;
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Forget `lost` so the next claim reconnects.
    async fn discard(&self, lost: &Arc<RedisConnection>) {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, lost)) {
            *slot = None;
        }
    }
}

async fn open(config: &RedisConfig) -> Result<Arc<RedisConnection>, BusError> {
    // A command connection never subscribes, so its delivery stream stays empty.
    let (connection, _deliveries) = RedisConnection::open(config).await?;
    Ok(Arc::new(connection))
}

/// Errors after which the connection cannot carry another command.
fn is_connection_lost(error: &BusError) -> bool {
    matches!(
        error,
        BusError::Closed | BusError::Io(_) | BusError::Protocol(_)
    )
}

fn interpret(reply: Result<Frame, BusError>) -> Result<bool, ClaimError> {
    match reply {
        Ok(Frame::Simple(status)) if status == "OK" => Ok(true),
        Ok(frame) if frame.is_null() => Ok(false),
        Ok(other) => Err(ClaimError::UnexpectedReply(format!("{:?}", other))),
        Err(BusError::Rejected(reason)) => Err(ClaimError::Rejected(reason)),
        Err(e) => Err(ClaimError::Unavailable(e.to_string())),
    }
}

#[async_trait]
impl ClaimStore for RedisClaimStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, ClaimError> {
        // PX 0 is rejected by the server.
        let millis = ttl.as_millis().max(1).to_string();
        let connection = match self.connection().await {
            Ok(connection) => connection,
            Err(e) => return interpret(Err(e)),
        };
        let reply = connection
            .command(&[
                &b"SET"[..],
                key.as_bytes(),
                value.as_bytes(),
                &b"NX"[..],
                &b"PX"[..],
                millis.as_bytes(),
            ])
            .await;
        if let Err(e) = &reply {
            if is_connection_lost(e) {
                warn!(error = %e, "claim store connection lost");
                self.discard(&connection).await;
            }
        }
        interpret(reply)
    }
}
