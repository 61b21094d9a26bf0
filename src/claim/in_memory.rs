use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{ClaimError, ClaimStore};

/// Entries held before `set_if_absent` sweeps out expired claims.
const PURGE_THRESHOLD: usize = 1024;

struct Claim {
    value: String,
    expires_at: Instant,
}

struct Claims {
    entries: HashMap<String, Claim>,
    purge_at: usize,
}

impl Default for Claims {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            purge_at: PURGE_THRESHOLD,
        }
    }
}

impl Claims {
    fn purge(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, c| c.expires_at > now);
        // Next sweep once the live set has doubled, so sweeps stay amortized.
        self.purge_at = PURGE_THRESHOLD.max(self.entries.len() * 2);
        before - self.entries.len()
    }
}

/// In-memory claim store backed by a `Mutex<HashMap<..>>`.
///
/// Expiry is checked lazily against `tokio::time::Instant`, so tests running
/// on a paused clock can step over a TTL with `tokio::time::advance`.
///
/// Expired claims are swept out whenever the map grows past a threshold,
/// so memory follows the number of live claims.
///
/// The store can be switched into a failing mode to exercise the
/// fail-closed path of [`GroupCoordinator`](super::GroupCoordinator).
#[derive(Default)]
pub struct InMemoryClaimStore {
    claims: Mutex<Claims>,
    failure: Mutex<Option<String>>,
}

impl InMemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn claims(&self) -> MutexGuard<'_, Claims> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live (unexpired) claims.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.claims()
            .entries
            .values()
            .filter(|c| c.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value stored under `key`, if the claim is still live.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.claims()
            .entries
            .get(key)
            .filter(|c| c.expires_at > now)
            .map(|c| c.value.clone())
    }

    /// Drop expired claims. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.claims().purge(Instant::now())
    }

    /// Make every subsequent call fail with `ClaimError::Unavailable(reason)`.
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    /// Leave failing mode.
    pub fn recover(&self) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[async_trait]
impl ClaimStore for InMemoryClaimStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, ClaimError> {
        if let Some(reason) = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(ClaimError::Unavailable(reason));
        }

        let now = Instant::now();
        let mut claims = self.claims();
        if let Some(existing) = claims.entries.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        if claims.entries.len() >= claims.purge_at {
            claims.purge(now);
        }
        claims.entries.insert(
            key.to_string(),
            Claim {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }
}
