//! `Rover`: entry point that owns the bus, the claim coordinator and the
//! configuration, and hands out publishers, subscribers and command
//! endpoints on fresh connections.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::bus::{Bus, DeliveryMode, InMemoryBus, Publisher, Subscriber};
use crate::claim::{ClaimStore, GroupCoordinator, InMemoryClaimStore};
use crate::command::{CommandReceiver, CommandSender};
use crate::config::RoverConfig;
use crate::envelope::Envelope;
use crate::error::{Result, RoverError};

/// Factory for every endpoint of one deployment.
///
/// Cheap to clone; clones share the bus, the claim store and the config.
///
/// ## Example
///
/// ```ignore
/// let rover = Rover::in_memory();
///
/// let billing = rover.subscriber(Some("billing")).await?;
/// billing.on(|msg| println!("billing saw {}", msg.envelope.id()));
/// billing.subscribe("orders").await?;
///
/// rover.publisher().await?.publish("orders", &json!({ "sku": 7 })).await?;
/// ```
#[derive(Clone)]
pub struct Rover {
    bus: Arc<dyn Bus>,
    coordinator: GroupCoordinator,
    config: Arc<RoverConfig>,
}

impl Rover {
    pub fn new(bus: Arc<dyn Bus>, claims: Arc<dyn ClaimStore>) -> Self {
        Self::with_config(bus, claims, RoverConfig::default())
    }

    pub fn with_config(bus: Arc<dyn Bus>, claims: Arc<dyn ClaimStore>, config: RoverConfig) -> Self {
        let coordinator = GroupCoordinator::with_ttl(claims, config.claim_ttl());
        Self {
            bus,
            coordinator,
            config: Arc::new(config),
        }
    }

    /// Process-local bus and claim store.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryBus::new()),
            Arc::new(InMemoryClaimStore::new()),
        )
    }

    /// Redis bus and claim store from `config.redis`.
    #[cfg(feature = "redis")]
    pub async fn connect_redis(config: RoverConfig) -> Result<Self> {
        use crate::redis::{RedisBus, RedisClaimStore};

        let claims = RedisClaimStore::connect(&config.redis).await?;
        let bus = RedisBus::new(config.redis.clone());
        tracing::debug!(address = %config.redis.address(), "using redis backend");
        Ok(Self::with_config(Arc::new(bus), Arc::new(claims), config))
    }

    pub fn config(&self) -> &RoverConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &GroupCoordinator {
        &self.coordinator
    }

    pub async fn publisher(&self) -> Result<Publisher> {
        let (connection, _deliveries) = self.bus.connect().await?;
        Ok(Publisher::new(connection))
    }

    /// Subscriber dispatching every message. With a group, each message is
    /// handled by exactly one member of the group.
    pub async fn subscriber(&self, group: Option<&str>) -> Result<Subscriber> {
        self.build_subscriber(group, DeliveryMode::Every).await
    }

    /// Subscriber dispatching only the first message it processes.
    pub async fn subscriber_once(&self, group: Option<&str>) -> Result<Subscriber> {
        self.build_subscriber(group, DeliveryMode::Once).await
    }

    async fn build_subscriber(&self, group: Option<&str>, mode: DeliveryMode) -> Result<Subscriber> {
        if group == Some("") {
            return Err(RoverError::invalid("group name must not be empty"));
        }
        let (connection, deliveries) = self.bus.connect().await?;
        Ok(Subscriber::start(
            connection,
            deliveries,
            group.map(str::to_string),
            self.coordinator.clone(),
            mode,
        ))
    }

    /// Wait for the next message on `channel`, then unsubscribe and close.
    pub async fn once(&self, channel: &str) -> Result<Envelope> {
        let subscriber = self.subscriber_once(None).await?;
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        subscriber.on(move |message| {
            if let Some(tx) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(message.envelope.clone());
            }
        });
        subscriber.subscribe(channel).await?;

        let envelope = rx
            .await
            .map_err(|_| RoverError::Closed(format!("subscription to `{}` ended", channel)));
        subscriber.unsubscribe(Some(channel)).await?;
        subscriber.quit().await?;
        envelope
    }

    /// Command sender for `topic`, listening for responses on a private
    /// ungrouped subscriber.
    pub async fn sender(&self, topic: &str) -> Result<CommandSender> {
        let publisher = self.publisher().await?;
        let subscriber = self.subscriber(None).await?;
        CommandSender::start(topic, publisher, subscriber, self.config.request_timeout()).await
    }

    /// Command receiver for `topic`. Receivers sharing a group split the
    /// commands between them.
    pub async fn receiver(&self, topic: &str, group: Option<&str>) -> Result<CommandReceiver> {
        let publisher = self.publisher().await?;
        let subscriber = self.subscriber(group).await?;
        CommandReceiver::start(topic, publisher, subscriber).await
    }
}
