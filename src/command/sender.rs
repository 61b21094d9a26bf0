//! Command sender: publishes requests and routes correlated responses back
//! to their callers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::pending::PendingRequests;
use super::{command_channel, response_channel};
use crate::bus::{Publisher, Subscriber};
use crate::envelope::Envelope;
use crate::error::{Result, RoverError};

/// Counters for a sender.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SenderStats {
    /// Requests published.
    pub sent: usize,
    /// Responses routed to a pending request.
    pub dispatched: usize,
    /// Responses that matched no pending request.
    pub misses: usize,
}

#[derive(Default)]
struct Counters {
    sent: AtomicUsize,
    dispatched: AtomicUsize,
    misses: AtomicUsize,
}

/// Publishes commands on `<topic>::command` and listens, ungrouped, on
/// `<topic>::response`.
///
/// Responses are matched to requests through an instance-owned
/// [`PendingRequests`] table. A response nobody is waiting for is a miss:
/// counted and logged at debug level, never an error, since a broadcast
/// request may be answered by several receivers.
pub struct CommandSender {
    topic: String,
    command_channel: String,
    response_channel: String,
    publisher: Publisher,
    subscriber: Subscriber,
    pending: Arc<PendingRequests>,
    counters: Arc<Counters>,
    timeout: Option<Duration>,
}

impl CommandSender {
    /// Wire the response handler and wait for the response subscription to
    /// be acknowledged.
    pub async fn start(
        topic: &str,
        publisher: Publisher,
        subscriber: Subscriber,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let command_channel = command_channel(topic)?;
        let response_channel = response_channel(topic)?;
        let pending = Arc::new(PendingRequests::new());
        let counters = Arc::new(Counters::default());

        {
            let pending = Arc::clone(&pending);
            let counters = Arc::clone(&counters);
            let topic = topic.to_string();
            subscriber.on(move |message| match pending.resolve(message.envelope.clone()) {
                Ok(()) => {
                    counters.dispatched.fetch_add(1, Ordering::AcqRel);
                }
                Err(miss) => {
                    counters.misses.fetch_add(1, Ordering::AcqRel);
                    debug!(topic = %topic, response_id = message.envelope.id(), error = %miss, "response miss");
                }
            });
        }
        subscriber.subscribe(&response_channel).await?;

        Ok(Self {
            topic: topic.to_string(),
            command_channel,
            response_channel,
            publisher,
            subscriber,
            pending,
            counters,
            timeout,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish `payload` as a command and invoke `callback` with every
    /// response correlated to it. Returns the request id.
    ///
    /// The callback stays registered until [`CommandSender::cancel`], until the
    /// configured request timeout evicts it, or until the sender stops.
    pub async fn request<T, F>(&self, payload: &T, callback: F) -> Result<String>
    where
        T: Serialize + ?Sized,
        F: FnMut(Envelope) + Send + 'static,
    {
        let envelope = Envelope::encode(payload)?;
        let id = envelope.id().to_string();

        // Register before publishing so no response can arrive untracked.
        self.pending.register(id.clone(), callback);
        if let Some(timeout) = self.timeout {
            self.pending.evict_after(id.clone(), timeout);
        }

        self.send(&id, &envelope).await?;
        Ok(id)
    }

    /// Publish `payload` and wait for the first response, honouring the
    /// configured request timeout.
    pub async fn request_one<T>(&self, payload: &T) -> Result<Envelope>
    where
        T: Serialize + ?Sized,
    {
        self.await_first(payload, self.timeout).await
    }

    /// Like [`CommandSender::request_one`] with an explicit deadline.
    pub async fn request_one_within<T>(&self, payload: &T, timeout: Duration) -> Result<Envelope>
    where
        T: Serialize + ?Sized,
    {
        self.await_first(payload, Some(timeout)).await
    }

    async fn await_first<T>(&self, payload: &T, timeout: Option<Duration>) -> Result<Envelope>
    where
        T: Serialize + ?Sized,
    {
        let envelope = Envelope::encode(payload)?;
        let id = envelope.id().to_string();
        let response = self.pending.register_once(id.clone());

        self.send(&id, &envelope).await?;

        let outcome = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, response).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.cancel(&id);
                    return Err(RoverError::Timeout(id));
                }
            },
            None => response.await,
        };
        outcome.map_err(|_| RoverError::Closed(format!("sender for `{}` stopped", self.topic)))
    }

    async fn send(&self, id: &str, envelope: &Envelope) -> Result<()> {
        if let Err(e) = self
            .publisher
            .publish_envelope(&self.command_channel, envelope)
            .await
        {
            self.pending.cancel(id);
            return Err(e);
        }
        self.counters.sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Stop tracking a request. Later responses to it count as misses.
    pub fn cancel(&self, id: &str) -> bool {
        self.pending.cancel(id)
    }

    /// Number of requests still tracked.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            sent: self.counters.sent.load(Ordering::Acquire),
            dispatched: self.counters.dispatched.load(Ordering::Acquire),
            misses: self.counters.misses.load(Ordering::Acquire),
        }
    }

    /// Unsubscribe, close both connections and drop every pending request.
    pub async fn stop(self) -> Result<SenderStats> {
        self.subscriber
            .unsubscribe(Some(&self.response_channel))
            .await?;
        self.subscriber.quit().await?;
        self.publisher.quit().await?;
        self.pending.clear();
        Ok(self.stats())
    }
}
