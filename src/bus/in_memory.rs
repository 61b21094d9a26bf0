//! In-memory bus for testing and single-process scenarios.
//!
//! This module provides a process-local pub/sub bus that implements the
//! [`Bus`] contract, useful for:
//! - Unit and integration testing without an external broker
//! - Single-process applications
//! - Development and prototyping

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::connection::{Bus, BusError, Connection, Deliveries, Delivery};
use super::pattern::pattern_matches;

/// A message recorded by [`InMemoryBus`] at publish time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// In-memory pub/sub bus.
///
/// Features:
/// - Cheap to clone; clones share the same registry
/// - Exact and glob-pattern subscriptions
/// - Every connection gets its own ordered delivery queue
/// - With [`InMemoryBus::recording`], published messages are kept in an
///   append-only log for inspection
///
/// ## Example
///
/// ```ignore
/// use red_rover::bus::{Bus, InMemoryBus};
///
/// let bus = InMemoryBus::recording();
/// let (sub, mut deliveries) = bus.connect().await.unwrap();
/// let (publisher, _) = bus.connect().await.unwrap();
///
/// assert_eq!(sub.subscribe("events").await.unwrap(), 1);
/// assert_eq!(publisher.publish("events", b"{}").await.unwrap(), 1);
/// assert_eq!(deliveries.recv().await.unwrap().channel(), "events");
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBus {
    registry: Arc<Registry>,
}

#[derive(Default)]
struct Registry {
    recording: bool,
    next_id: AtomicU64,
    state: Mutex<RegistryState>,
    log: RwLock<Vec<Published>>,
}

#[derive(Default)]
struct RegistryState {
    channels: HashMap<String, HashSet<u64>>,
    patterns: HashMap<String, HashSet<u64>>,
    connections: HashMap<u64, ConnectionEntry>,
}

struct ConnectionEntry {
    sender: mpsc::UnboundedSender<Delivery>,
    channels: BTreeSet<String>,
    patterns: BTreeSet<String>,
}

impl ConnectionEntry {
    fn count(&self) -> usize {
        self.channels.len() + self.patterns.len()
    }
}

impl Registry {
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RegistryState {
    fn entry(&mut self, id: u64) -> Result<&mut ConnectionEntry, BusError> {
        self.connections.get_mut(&id).ok_or(BusError::Closed)
    }

    fn subscribe(&mut self, id: u64, channel: &str) -> Result<usize, BusError> {
        let entry = self.connections.get_mut(&id).ok_or(BusError::Closed)?;
        entry.channels.insert(channel.to_string());
        let count = entry.count();
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id);
        Ok(count)
    }

    fn psubscribe(&mut self, id: u64, pattern: &str) -> Result<usize, BusError> {
        let entry = self.connections.get_mut(&id).ok_or(BusError::Closed)?;
        entry.patterns.insert(pattern.to_string());
        let count = entry.count();
        self.patterns
            .entry(pattern.to_string())
            .or_default()
            .insert(id);
        Ok(count)
    }

    fn unsubscribe(&mut self, id: u64, channel: Option<&str>) -> Result<usize, BusError> {
        let entry = self.entry(id)?;
        let removed: Vec<String> = match channel {
            Some(channel) => entry.channels.take(channel).into_iter().collect(),
            None => std::mem::take(&mut entry.channels).into_iter().collect(),
        };
        let count = entry.count();
        for channel in removed {
            detach(&mut self.channels, &channel, id);
        }
        Ok(count)
    }

    fn punsubscribe(&mut self, id: u64, pattern: Option<&str>) -> Result<usize, BusError> {
        let entry = self.entry(id)?;
        let removed: Vec<String> = match pattern {
            Some(pattern) => entry.patterns.take(pattern).into_iter().collect(),
            None => std::mem::take(&mut entry.patterns).into_iter().collect(),
        };
        let count = entry.count();
        for pattern in removed {
            detach(&mut self.patterns, &pattern, id);
        }
        Ok(count)
    }

    fn unregister(&mut self, id: u64) {
        if let Some(entry) = self.connections.remove(&id) {
            for channel in &entry.channels {
                detach(&mut self.channels, channel, id);
            }
            for pattern in &entry.patterns {
                detach(&mut self.patterns, pattern, id);
            }
        }
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> usize {
        let mut count = 0;

        if let Some(subscribers) = self.channels.get(channel) {
            for id in subscribers {
                let delivery = Delivery::Message {
                    channel: channel.to_string(),
                    payload: payload.to_vec(),
                };
                if self.send(*id, delivery) {
                    count += 1;
                }
            }
        }

        for (pattern, subscribers) in &self.patterns {
            if !pattern_matches(pattern, channel) {
                continue;
            }
            for id in subscribers {
                let delivery = Delivery::PMessage {
                    pattern: pattern.clone(),
                    channel: channel.to_string(),
                    payload: payload.to_vec(),
                };
                if self.send(*id, delivery) {
                    count += 1;
                }
            }
        }

        count
    }

    fn send(&self, id: u64, delivery: Delivery) -> bool {
        self.connections
            .get(&id)
            .map(|entry| entry.sender.send(delivery).is_ok())
            .unwrap_or(false)
    }
}

fn detach(index: &mut HashMap<String, HashSet<u64>>, key: &str, id: u64) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(&id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

impl InMemoryBus {
    /// Bus that keeps nothing once a message has been fanned out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus that also logs every published message, for tests.
    pub fn recording() -> Self {
        Self {
            registry: Arc::new(Registry {
                recording: true,
                ..Registry::default()
            }),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.registry.recording
    }

    /// Every message published so far, in publish order. Always empty
    /// unless the bus was created with [`InMemoryBus::recording`].
    pub fn published(&self) -> Vec<Published> {
        self.registry
            .log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages published on one channel.
    pub fn published_on(&self, channel: &str) -> Vec<Published> {
        self.registry
            .log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|p| p.channel == channel)
            .cloned()
            .collect()
    }

    /// Number of connections subscribed to `channel` by name.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.registry
            .state()
            .channels
            .get(channel)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.registry.state().connections.len()
    }

    /// Clear the published log (useful for test cleanup).
    pub fn clear(&self) {
        self.registry
            .log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn connect(&self) -> Result<(Arc<dyn Connection>, Deliveries), BusError> {
        let (sender, deliveries) = mpsc::unbounded_channel();
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.state().connections.insert(
            id,
            ConnectionEntry {
                sender,
                channels: BTreeSet::new(),
                patterns: BTreeSet::new(),
            },
        );

        let connection = InMemoryConnection {
            id,
            registry: Arc::clone(&self.registry),
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(connection), deliveries))
    }
}

/// Connection handed out by [`InMemoryBus`]. Dropping it unregisters it.
pub struct InMemoryConnection {
    id: u64,
    registry: Arc<Registry>,
    closed: AtomicBool,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BusError> {
        self.ensure_open()?;
        // Log and fan-out under one lock so the log order is the delivery order.
        let state = self.registry.state();
        if self.registry.recording {
            self.registry
                .log
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Published {
                    channel: channel.to_string(),
                    payload: payload.to_vec(),
                });
        }
        Ok(state.publish(channel, payload))
    }

    async fn subscribe(&self, channel: &str) -> Result<usize, BusError> {
        self.ensure_open()?;
        self.registry.state().subscribe(self.id, channel)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<usize, BusError> {
        self.ensure_open()?;
        self.registry.state().psubscribe(self.id, pattern)
    }

    async fn unsubscribe(&self, channel: Option<&str>) -> Result<usize, BusError> {
        self.ensure_open()?;
        self.registry.state().unsubscribe(self.id, channel)
    }

    async fn punsubscribe(&self, pattern: Option<&str>) -> Result<usize, BusError> {
        self.ensure_open()?;
        self.registry.state().punsubscribe(self.id, pattern)
    }

    async fn quit(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::Release);
        self.registry.state().unregister(self.id);
        Ok(())
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.registry.state().unregister(self.id);
    }
}
