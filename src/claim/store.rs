use std::time::Duration;

use async_trait::async_trait;

use super::ClaimError;

/// The one primitive the coordination layer needs from a shared key store.
///
/// Implementations must make `set_if_absent` atomic across every process
/// that shares the store: for a given key, at most one caller observes
/// `Ok(true)` until the key expires. In-memory stores use a `Mutex`;
/// distributed stores might use Redis `SET NX`, etcd transactions, etc.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Create `key` with `value`, expiring after `ttl`, only if it does not
    /// exist. Returns `Ok(true)` if this call created it.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, ClaimError>;
}

#[async_trait]
impl<S: ClaimStore + ?Sized> ClaimStore for std::sync::Arc<S> {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, ClaimError> {
        (**self).set_if_absent(key, value, ttl).await
    }
}
