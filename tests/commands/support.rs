//! Shared helpers for the command suite.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use red_rover::{Envelope, InMemoryBus, InMemoryClaimStore, Rover, RoverConfig};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A rover on a fresh in-memory bus, plus the bus for inspection.
pub fn rover() -> (Rover, InMemoryBus) {
    rover_with(RoverConfig::default())
}

pub fn rover_with(config: RoverConfig) -> (Rover, InMemoryBus) {
    init_tracing();
    let bus = InMemoryBus::recording();
    let rover = Rover::with_config(
        Arc::new(bus.clone()),
        Arc::new(InMemoryClaimStore::new()),
        config,
    );
    (rover, bus)
}

pub type Responses = Arc<Mutex<Vec<Envelope>>>;

/// A response sink plus a callback feeding it, for `CommandSender::request`.
pub fn responses() -> (Responses, impl FnMut(Envelope) + Send + 'static) {
    let responses: Responses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&responses);
    (responses, move |response: Envelope| sink.lock().unwrap().push(response))
}

pub fn len(responses: &Responses) -> usize {
    responses.lock().unwrap().len()
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Give in-flight deliveries a chance to (wrongly) arrive.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
