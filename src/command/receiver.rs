//! Command receiver: runs handlers on inbound commands and publishes their
//! results as correlated responses.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tracing::{debug, error};

use super::{command_channel, response_channel};
use crate::bus::{Publisher, Subscriber};
use crate::envelope::Envelope;

type CommandHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, Value> + Send + Sync>;

/// Counters for a receiver.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Commands dispatched to the handlers (after group claiming).
    pub handled: usize,
    /// Responses published.
    pub responded: usize,
    /// Responses that could not be published.
    pub publish_failures: usize,
}

#[derive(Default)]
struct Counters {
    handled: AtomicUsize,
    responded: AtomicUsize,
    publish_failures: AtomicUsize,
}

/// Listens on `<topic>::command`, optionally as a member of a group, and
/// answers on `<topic>::response`.
///
/// Every registered handler runs for every command this receiver processes
/// and publishes its own response. Without a group, every receiver on the
/// topic answers every command.
pub struct CommandReceiver {
    topic: String,
    command_channel: String,
    publisher: Arc<Publisher>,
    subscriber: Subscriber,
    handlers: Arc<RwLock<Vec<CommandHandler>>>,
    counters: Arc<Counters>,
}

impl CommandReceiver {
    /// Wire dispatch and wait for the command subscription to be acknowledged.
    pub async fn start(
        topic: &str,
        publisher: Publisher,
        subscriber: Subscriber,
    ) -> crate::Result<Self> {
        let command_channel = command_channel(topic)?;
        let response_channel = Arc::new(response_channel(topic)?);
        let publisher = Arc::new(publisher);
        let handlers: Arc<RwLock<Vec<CommandHandler>>> = Arc::new(RwLock::new(Vec::new()));
        let counters = Arc::new(Counters::default());

        {
            let publisher = Arc::clone(&publisher);
            let handlers = Arc::clone(&handlers);
            let counters = Arc::clone(&counters);
            subscriber.on(move |message| {
                let handlers = handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                counters.handled.fetch_add(1, Ordering::AcqRel);
                debug!(channel = %message.channel, request_id = message.envelope.id(), handlers = handlers.len(), "command received");

                for handler in handlers {
                    let result = handler(message.envelope.clone());
                    let publisher = Arc::clone(&publisher);
                    let response_channel = Arc::clone(&response_channel);
                    let counters = Arc::clone(&counters);
                    let request_id = message.envelope.id().to_string();

                    tokio::spawn(async move {
                        let value = result.await;
                        let published = match Envelope::new(value).correlated(&request_id) {
                            Ok(response) => publisher.publish_envelope(&response_channel, &response).await,
                            Err(e) => Err(e),
                        };
                        match published {
                            Ok(_) => {
                                counters.responded.fetch_add(1, Ordering::AcqRel);
                            }
                            Err(e) => {
                                counters.publish_failures.fetch_add(1, Ordering::AcqRel);
                                error!(request_id = %request_id, error = %e, "failed to publish response");
                            }
                        }
                    });
                }
            });
        }
        subscriber.subscribe(&command_channel).await?;

        Ok(Self {
            topic: topic.to_string(),
            command_channel,
            publisher,
            subscriber,
            handlers,
            counters,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> Option<&str> {
        self.subscriber.group()
    }

    /// Register a command handler. Its output becomes the response payload.
    ///
    /// Synchronous handlers can return `std::future::ready(value)` or an
    /// `async` block.
    pub fn on_request<F, Fut>(&self, handler: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let handler: CommandHandler = Arc::new(move |command| handler(command).boxed());
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            handled: self.counters.handled.load(Ordering::Acquire),
            responded: self.counters.responded.load(Ordering::Acquire),
            publish_failures: self.counters.publish_failures.load(Ordering::Acquire),
        }
    }

    /// Unsubscribe and close both connections. Responses still being
    /// computed fail to publish.
    pub async fn stop(self) -> crate::Result<ReceiverStats> {
        self.subscriber
            .unsubscribe(Some(&self.command_channel))
            .await?;
        self.subscriber.quit().await?;
        self.publisher.quit().await?;
        Ok(self.stats())
    }
}
