//! Claims: "first writer wins" marking of a `(group, message-id)` pair.
//!
//! A group of cooperating subscribers shares one [`ClaimStore`]. Every
//! member attempts the same atomic claim for each delivery; only the member
//! that creates the key processes the message. Claims are never released;
//! they simply expire.

mod coordinator;
mod error;
mod in_memory;
mod store;

pub use coordinator::{claim_key, GroupCoordinator, CLAIM_VALUE};
pub use error::ClaimError;
pub use in_memory::InMemoryClaimStore;
pub use store::ClaimStore;
