//! Shared helpers for the pub/sub suite.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use red_rover::{InMemoryBus, InMemoryClaimStore, Message, Rover, Subscriber};
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
    init_tracing();
    let bus = InMemoryBus::recording();
    let rover = Rover::new(Arc::new(bus.clone()), Arc::new(InMemoryClaimStore::new()));
    (rover, bus)
}

pub type Inbox = Arc<Mutex<Vec<Message>>>;

/// Record every message the subscriber dispatches.
pub fn inbox(subscriber: &Subscriber) -> Inbox {
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inbox);
    subscriber.on(move |message| sink.lock().unwrap().push(message.clone()));
    inbox
}

pub fn count(inbox: &Inbox) -> usize {
    inbox.lock().unwrap().len()
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
