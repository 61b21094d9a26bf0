//! Group-coordinated pub/sub and correlated commands over a publish/subscribe bus.
//!
//! Every published message is wrapped in an [`Envelope`] carrying a unique id.
//! Subscribers bound to a group race to claim that id in a shared
//! [`ClaimStore`]; only the winner runs its handlers, so each group sees each
//! message once while ungrouped subscribers see everything. Commands layer
//! request/response on top: a [`CommandSender`] publishes on
//! `<topic>::command` and matches answers from `<topic>::response` back to the
//! caller by the `_re` correlation field.

pub mod bus;
pub mod claim;
pub mod command;
pub mod config;
pub mod envelope;
pub mod error;
#[cfg(feature = "redis")]
pub mod redis;
mod rover;

pub use bus::{
    Bus, BusError, Connection, DeliveryMode, InMemoryBus, Message, OnceState, Publisher,
    Subscriber, SubscriptionState,
};
pub use claim::{ClaimError, ClaimStore, GroupCoordinator, InMemoryClaimStore};
pub use command::{CommandReceiver, CommandSender, ReceiverStats, SenderStats};
pub use config::{RedisConfig, RoverConfig};
pub use envelope::Envelope;
pub use error::{Result, RoverError};
#[cfg(feature = "redis")]
pub use redis::{RedisBus, RedisClaimStore};
pub use rover::Rover;
