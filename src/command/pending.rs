//! Pending-request table for one command sender.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::RoverError;

type Callback = Box<dyn FnMut(Envelope) + Send>;

enum Pending {
    /// Invoked for every matching response until cancelled or evicted.
    /// A broadcast request may legitimately be answered several times.
    Callback(Arc<Mutex<Callback>>),
    /// Completed by the first matching response, then removed.
    Once(oneshot::Sender<Envelope>),
}

/// Tracks requests awaiting responses, keyed by correlation id.
///
/// Owned by a single sender; entries are inserted before the request is
/// published and removed on first match (one-shot entries), on `cancel`,
/// or on eviction after a deadline.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, Pending>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `id` with a callback invoked for every matching response.
    pub fn register<F>(&self, id: impl Into<String>, callback: F)
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        let callback: Callback = Box::new(callback);
        self.entries()
            .insert(id.into(), Pending::Callback(Arc::new(Mutex::new(callback))));
    }

    /// Track `id` and return a receiver completed by the first matching
    /// response.
    pub fn register_once(&self, id: impl Into<String>) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.entries().insert(id.into(), Pending::Once(tx));
        rx
    }

    /// Route a response to the request it answers.
    ///
    /// Returns `CorrelationMiss` when the response carries no correlation id,
    /// an unknown one, or answers a one-shot request whose caller has gone.
    pub fn resolve(&self, response: Envelope) -> Result<(), RoverError> {
        let Some(id) = response.correlates_to().map(str::to_string) else {
            return Err(RoverError::CorrelationMiss {
                correlation_id: None,
            });
        };
        let miss = || RoverError::CorrelationMiss {
            correlation_id: Some(id.clone()),
        };

        let callback = {
            let mut entries = self.entries();
            match entries.remove(&id) {
                Some(Pending::Callback(callback)) => {
                    entries.insert(id.clone(), Pending::Callback(Arc::clone(&callback)));
                    callback
                }
                Some(Pending::Once(tx)) => {
                    drop(entries);
                    return tx.send(response).map_err(|_| miss());
                }
                None => return Err(miss()),
            }
        };

        // Entry lock released; the callback may register new requests.
        let mut callback = callback.lock().unwrap_or_else(PoisonError::into_inner);
        (*callback)(response);
        Ok(())
    }

    /// Stop tracking `id`. Returns whether it was pending.
    pub fn cancel(&self, id: &str) -> bool {
        self.entries().remove(id).is_some()
    }

    /// Cancel `id` once `after` has elapsed, unless it was removed already.
    pub fn evict_after(self: &Arc<Self>, id: String, after: Duration) {
        let table: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(table) = table.upgrade() {
                if table.cancel(&id) {
                    debug!(correlation_id = %id, "evicted pending request");
                }
            }
        });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Drop every entry. One-shot waiters observe a closed channel.
    pub fn clear(&self) {
        self.entries().clear();
    }
}
