use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use super::ClaimStore;
use crate::config::DEFAULT_CLAIM_TTL_SECS;
use crate::error::{Result, RoverError};

/// Value written under every claim key.
pub const CLAIM_VALUE: &str = "1";

/// Key under which a group's claim on a message is recorded.
pub fn claim_key(group: &str, message_id: &str) -> String {
    format!("{}:{}", group, message_id)
}

/// Decides whether the calling process is the exclusive processor of a
/// message for a group.
///
/// Each decision is a single round-trip to the shared [`ClaimStore`]. Store
/// failures are fail-closed: the caller gets `ClaimStoreFailure` and must
/// treat the message as not claimed, so an outage under-delivers rather than
/// over-delivers.
#[derive(Clone)]
pub struct GroupCoordinator {
    store: Arc<dyn ClaimStore>,
    ttl: Duration,
}

impl GroupCoordinator {
    pub fn new(store: Arc<dyn ClaimStore>) -> Self {
        Self::with_ttl(store, Duration::from_secs(DEFAULT_CLAIM_TTL_SECS))
    }

    pub fn with_ttl(store: Arc<dyn ClaimStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Claim `message_id` for `group` with the configured TTL.
    pub async fn claim(&self, group: &str, message_id: &str) -> Result<bool> {
        self.claim_with_ttl(group, message_id, self.ttl).await
    }

    /// Claim `message_id` for `group`. `Ok(true)` iff this call created the
    /// claim record.
    pub async fn claim_with_ttl(
        &self,
        group: &str,
        message_id: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let key = claim_key(group, message_id);
        match self.store.set_if_absent(&key, CLAIM_VALUE, ttl).await {
            Ok(claimed) => {
                debug!(group, message_id, claimed, "claim attempt");
                Ok(claimed)
            }
            Err(source) => {
                error!(group, message_id, error = %source, "claim store failure, message not claimed");
                Err(RoverError::ClaimStoreFailure { key, source })
            }
        }
    }
}
