//! Pub/sub integration tests.

mod support;
mod delivery;
