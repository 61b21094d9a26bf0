//! Redis backend: RESP2 codec, pub/sub bus and claim store.
//!
//! Enabled by the `redis` feature (on by default). Each publisher and
//! subscriber gets its own TCP connection; the claim store keeps one command
//! connection shared by every group member in the process.

mod claim_store;
mod connection;
pub mod resp;

pub use claim_store::RedisClaimStore;
pub use connection::{RedisBus, RedisConnection};
