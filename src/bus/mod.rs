//! Bus transport contract, the in-memory transport, publisher and subscriber.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  publish   ┌──────────────────────┐  deliveries  ┌──────────────────────┐
//! │  Publisher   │ ─────────▶ │ Bus (Connection per  │ ───────────▶ │ Subscriber           │
//! │  (stamps id) │            │ publisher/subscriber)│              │ dispatch task        │
//! └──────────────┘            └──────────────────────┘              │  ├ envelope parse    │
//!                                      │                            │  ├ group claim gate  │
//!                       ┌──────────────┴────────────┐               │  └ handlers          │
//!                       ▼                           ▼               └──────────────────────┘
//!               ┌─────────────┐            ┌─────────────────┐
//!               │ InMemoryBus │            │ RedisBus        │
//!               │ (included)  │            │ (feature redis) │
//!               └─────────────┘            └─────────────────┘
//! ```

mod connection;
mod in_memory;
mod pattern;
mod publisher;
mod subscriber;

pub use connection::{Bus, BusError, Connection, Deliveries, Delivery};
pub use in_memory::{InMemoryBus, InMemoryConnection, Published};
pub use pattern::pattern_matches;
pub use publisher::Publisher;
pub use subscriber::{
    DeliveryMode, Handler, Message, OnceState, SubscriptionState, Subscriber, CLAIM_CONCURRENCY,
};
