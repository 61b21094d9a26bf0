//! Subscriber: channel and pattern subscriptions with group-gated dispatch.
//!
//! Each subscriber owns a private bus connection and one dispatch task that
//! drains the connection's deliveries. For every delivery the task:
//!
//! 1. drops it if its channel (or pattern) is no longer subscribed,
//! 2. parses the envelope, reporting `MalformedEnvelope` on failure,
//! 3. for group-bound subscribers, claims the message id for the group and
//!    stops unless the claim was won,
//! 4. invokes every registered handler, in registration order.
//!
//! Steps 1 to 3 run for up to [`CLAIM_CONCURRENCY`] deliveries at once, so
//! claim round-trips overlap. Step 4 runs strictly in bus order.
//!
//! In [`DeliveryMode::Once`] the first successful delivery moves the
//! subscriber to [`OnceState::Satisfied`]; afterwards it stays subscribed
//! but inert until the caller unsubscribes or quits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::connection::{Connection, Deliveries, Delivery};
use crate::claim::GroupCoordinator;
use crate::envelope::Envelope;
use crate::error::{Result, RoverError};

/// Deliveries a subscriber may have between arrival and handler dispatch.
pub const CLAIM_CONCURRENCY: usize = 64;

/// A delivered message as seen by handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Concrete channel the message was published on.
    pub channel: String,
    /// Matched pattern, for pattern deliveries.
    pub pattern: Option<String>,
    pub envelope: Envelope,
}

/// Handler invoked for every dispatched message.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Dispatch every message.
    Every,
    /// Dispatch the first message only.
    Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnceState {
    Active,
    Satisfied,
}

/// Lifecycle of one channel or pattern subscription. A channel absent from
/// the table is unsubscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Subscribing,
    Subscribed,
}

type StateTable = Mutex<HashMap<String, SubscriptionState>>;

fn table(lock: &StateTable) -> MutexGuard<'_, HashMap<String, SubscriptionState>> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between a [`Subscriber`] and its dispatch task.
struct Dispatcher {
    group: Option<String>,
    coordinator: GroupCoordinator,
    mode: DeliveryMode,
    satisfied: AtomicBool,
    stopped: AtomicBool,
    handlers: RwLock<Vec<Handler>>,
    channels: StateTable,
    patterns: StateTable,
    errors: mpsc::UnboundedSender<RoverError>,
    delivered: AtomicUsize,
}

impl Dispatcher {
    fn is_subscribed(&self, channel: &str, pattern: Option<&str>) -> bool {
        match pattern {
            Some(pattern) => table(&self.patterns).contains_key(pattern),
            None => table(&self.channels).contains_key(channel),
        }
    }

    fn is_satisfied(&self) -> bool {
        self.mode == DeliveryMode::Once && self.satisfied.load(Ordering::Acquire)
    }

    fn report(&self, error: RoverError) {
        // Nobody listening is fine; the error was already logged.
        let _ = self.errors.send(error);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        table(&self.channels).clear();
        table(&self.patterns).clear();
    }

    /// Liveness, parse and group claim for one raw delivery. `Some` means
    /// the message should reach the handlers.
    async fn prepare(&self, delivery: Delivery) -> Option<Message> {
        let (channel, pattern, payload) = match delivery {
            Delivery::Message { channel, payload } => (channel, None, payload),
            Delivery::PMessage {
                pattern,
                channel,
                payload,
            } => (channel, Some(pattern), payload),
        };
        if !self.is_subscribed(&channel, pattern.as_deref()) {
            debug!(channel = %channel, "dropping delivery for inactive subscription");
            return None;
        }
        if self.is_satisfied() {
            return None;
        }

        let envelope = match Envelope::from_bytes(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(channel = %channel, error = %e, "malformed envelope");
                self.report(RoverError::MalformedEnvelope {
                    channel,
                    reason: e.to_string(),
                });
                return None;
            }
        };

        if let Some(group) = &self.group {
            match self.coordinator.claim(group, envelope.id()).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(group = %group, message_id = envelope.id(), "claimed by another member");
                    return None;
                }
                Err(e) => {
                    self.report(e);
                    return None;
                }
            }
        }

        Some(Message {
            channel,
            pattern,
            envelope,
        })
    }

    /// Run the handlers for a prepared message, in registration order.
    fn deliver(&self, message: Message) {
        if !self.is_subscribed(&message.channel, message.pattern.as_deref()) {
            return;
        }
        if self.mode == DeliveryMode::Once
            && self
                .satisfied
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let _guard = PanicGuard {
            dispatcher: self,
            channel: &message.channel,
        };
        for handler in &handlers {
            handler(&message);
        }
        self.delivered.fetch_add(1, Ordering::AcqRel);
    }

    async fn run(&self, deliveries: Deliveries) {
        let arrivals = stream::unfold(deliveries, |mut deliveries| async move {
            deliveries.recv().await.map(|delivery| (delivery, deliveries))
        });
        let prepared = arrivals
            .map(move |delivery| self.prepare(delivery))
            .buffered(CLAIM_CONCURRENCY);
        let mut prepared = std::pin::pin!(prepared);
        while let Some(ready) = prepared.next().await {
            if let Some(message) = ready {
                self.deliver(message);
            }
        }
    }
}

/// Stops the subscriber when a handler unwinds out of dispatch.
struct PanicGuard<'a> {
    dispatcher: &'a Dispatcher,
    channel: &'a str,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(channel = self.channel, group = ?self.dispatcher.group, "handler panicked, subscriber stopped");
            self.dispatcher.stop();
            self.dispatcher.report(RoverError::HandlerPanicked {
                channel: self.channel.to_string(),
            });
        }
    }
}

/// A subscriber on its own bus connection.
///
/// Claims for queued deliveries overlap, but handlers only see a message
/// once every earlier delivery has been decided, so one slow claim delays
/// the deliveries behind it.
///
/// A panicking handler stops the subscriber: its subscriptions are dropped
/// from the state table, `HandlerPanicked` is sent on the error channel and
/// [`Subscriber::closed`] re-raises the panic.
///
/// ## Example
///
/// ```ignore
/// let mut sub = rover.subscriber(Some("billing")).await?;
/// sub.on(|msg| println!("{} -> {:?}", msg.channel, msg.envelope.payload()));
/// sub.subscribe("orders").await?;
/// ```
pub struct Subscriber {
    connection: Arc<dyn Connection>,
    dispatcher: Arc<Dispatcher>,
    errors: Option<mpsc::UnboundedReceiver<RoverError>>,
    task: Option<JoinHandle<()>>,
}

impl Subscriber {
    /// Wrap a fresh connection and start its dispatch task.
    pub fn start(
        connection: Arc<dyn Connection>,
        deliveries: Deliveries,
        group: Option<String>,
        coordinator: GroupCoordinator,
        mode: DeliveryMode,
    ) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher {
            group,
            coordinator,
            mode,
            satisfied: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            handlers: RwLock::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
            patterns: Mutex::new(HashMap::new()),
            errors: errors_tx,
            delivered: AtomicUsize::new(0),
        });

        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher.run(deliveries).await;
                debug!("delivery stream closed");
            })
        };

        Self {
            connection,
            dispatcher,
            errors: Some(errors_rx),
            task: Some(task),
        }
    }

    pub fn group(&self) -> Option<&str> {
        self.dispatcher.group.as_deref()
    }

    pub fn mode(&self) -> DeliveryMode {
        self.dispatcher.mode
    }

    /// Register a handler. Every handler sees every dispatched message.
    pub fn on<F>(&self, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.dispatcher
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// True once a handler panic has stopped dispatch.
    pub fn is_stopped(&self) -> bool {
        self.dispatcher.stopped.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            Err(RoverError::Closed("subscriber stopped after a handler panic".into()))
        } else {
            Ok(())
        }
    }

    /// Subscribe to a channel. Resolves with the bus acknowledgement count.
    pub async fn subscribe(&self, channel: &str) -> Result<usize> {
        if channel.is_empty() {
            return Err(RoverError::invalid("subscribe requires a channel"));
        }
        self.ensure_running()?;
        table(&self.dispatcher.channels)
            .entry(channel.to_string())
            .or_insert(SubscriptionState::Subscribing);

        match self.connection.subscribe(channel).await {
            Ok(count) => {
                if let Some(state) = table(&self.dispatcher.channels).get_mut(channel) {
                    *state = SubscriptionState::Subscribed;
                }
                debug!(channel, group = ?self.group(), count, "subscribed");
                Ok(count)
            }
            Err(e) => {
                table(&self.dispatcher.channels).remove(channel);
                Err(e.into())
            }
        }
    }

    /// Subscribe to a glob pattern. Resolves with the bus acknowledgement count.
    pub async fn psubscribe(&self, pattern: &str) -> Result<usize> {
        if pattern.is_empty() {
            return Err(RoverError::invalid("psubscribe requires a pattern"));
        }
        self.ensure_running()?;
        table(&self.dispatcher.patterns)
            .entry(pattern.to_string())
            .or_insert(SubscriptionState::Subscribing);

        match self.connection.psubscribe(pattern).await {
            Ok(count) => {
                if let Some(state) = table(&self.dispatcher.patterns).get_mut(pattern) {
                    *state = SubscriptionState::Subscribed;
                }
                debug!(pattern, group = ?self.group(), count, "psubscribed");
                Ok(count)
            }
            Err(e) => {
                table(&self.dispatcher.patterns).remove(pattern);
                Err(e.into())
            }
        }
    }

    /// Unsubscribe from one channel, or from every channel when `None`.
    /// Dispatch for the channel stops immediately, even for messages
    /// already queued locally.
    pub async fn unsubscribe(&self, channel: Option<&str>) -> Result<usize> {
        match channel {
            Some("") => return Err(RoverError::invalid("unsubscribe requires a non-empty channel")),
            Some(channel) => {
                table(&self.dispatcher.channels).remove(channel);
            }
            None => table(&self.dispatcher.channels).clear(),
        }
        let count = self.connection.unsubscribe(channel).await?;
        debug!(channel = ?channel, count, "unsubscribed");
        Ok(count)
    }

    /// Unsubscribe from one pattern, or from every pattern when `None`.
    pub async fn punsubscribe(&self, pattern: Option<&str>) -> Result<usize> {
        match pattern {
            Some("") => return Err(RoverError::invalid("punsubscribe requires a non-empty pattern")),
            Some(pattern) => {
                table(&self.dispatcher.patterns).remove(pattern);
            }
            None => table(&self.dispatcher.patterns).clear(),
        }
        let count = self.connection.punsubscribe(pattern).await?;
        debug!(pattern = ?pattern, count, "punsubscribed");
        Ok(count)
    }

    pub fn state(&self, channel: &str) -> Option<SubscriptionState> {
        table(&self.dispatcher.channels).get(channel).copied()
    }

    pub fn pattern_state(&self, pattern: &str) -> Option<SubscriptionState> {
        table(&self.dispatcher.patterns).get(pattern).copied()
    }

    pub fn once_state(&self) -> OnceState {
        if self.dispatcher.satisfied.load(Ordering::Acquire) {
            OnceState::Satisfied
        } else {
            OnceState::Active
        }
    }

    /// Number of messages dispatched to the handlers so far.
    pub fn delivered(&self) -> usize {
        self.dispatcher.delivered.load(Ordering::Acquire)
    }

    /// Take the error channel carrying `MalformedEnvelope`,
    /// `ClaimStoreFailure` and `HandlerPanicked` reports. Only the first call returns `Some`.
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<RoverError>> {
        self.errors.take()
    }

    /// Wait for the dispatch task to end.
    ///
    /// Resolves when the delivery stream closes or after [`quit`](Self::quit).
    /// If a handler panicked, the panic is resumed on the caller.
    pub async fn closed(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            _ => Ok(()),
        }
    }

    /// Close the connection and stop dispatching.
    pub async fn quit(&self) -> Result<()> {
        table(&self.dispatcher.channels).clear();
        table(&self.dispatcher.patterns).clear();
        if let Some(task) = &self.task {
            task.abort();
        }
        self.connection.quit().await?;
        Ok(())
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
