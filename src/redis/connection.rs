//! Redis-backed bus: one TCP connection per [`Bus::connect`] call, with a
//! reader task that demultiplexes pub/sub pushes from command replies.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::resp::{self, Frame};
use crate::bus::{Bus, BusError, Connection, Deliveries, Delivery};
use crate::config::RedisConfig;

/// Bus backed by a Redis server.
#[derive(Debug, Clone)]
pub struct RedisBus {
    config: RedisConfig,
}

impl RedisBus {
    pub fn new(config: RedisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn connect(&self) -> Result<(Arc<dyn Connection>, Deliveries), BusError> {
        let (connection, deliveries) = RedisConnection::open(&self.config).await?;
        Ok((Arc::new(connection), deliveries))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AckKind {
    Subscribe,
    PSubscribe,
    Unsubscribe,
    PUnsubscribe,
}

impl AckKind {
    fn command(self) -> &'static [u8] {
        match self {
            AckKind::Subscribe => b"SUBSCRIBE",
            AckKind::PSubscribe => b"PSUBSCRIBE",
            AckKind::Unsubscribe => b"UNSUBSCRIBE",
            AckKind::PUnsubscribe => b"PUNSUBSCRIBE",
        }
    }

    fn from_reply(kind: &str) -> Option<Self> {
        match kind {
            "subscribe" => Some(AckKind::Subscribe),
            "psubscribe" => Some(AckKind::PSubscribe),
            "unsubscribe" => Some(AckKind::Unsubscribe),
            "punsubscribe" => Some(AckKind::PUnsubscribe),
            _ => None,
        }
    }

    fn is_pattern(self) -> bool {
        matches!(self, AckKind::PSubscribe | AckKind::PUnsubscribe)
    }
}

type AckKey = (AckKind, Option<String>);
type AckWaiter = oneshot::Sender<Result<usize, BusError>>;
type ReplyWaiter = oneshot::Sender<Result<Frame, BusError>>;

/// Server push recognised by the reader.
#[derive(Debug, PartialEq)]
enum Push {
    Delivery(Delivery),
    Ack {
        kind: AckKind,
        name: Option<String>,
        count: usize,
    },
}

fn parse_push(items: &[Frame]) -> Option<Push> {
    let kind = items.first()?.as_str()?;
    match (kind, items.len()) {
        ("message", 3) => Some(Push::Delivery(Delivery::Message {
            channel: items[1].as_str()?.to_string(),
            payload: items[2].as_bytes()?.to_vec(),
        })),
        ("pmessage", 4) => Some(Push::Delivery(Delivery::PMessage {
            pattern: items[1].as_str()?.to_string(),
            channel: items[2].as_str()?.to_string(),
            payload: items[3].as_bytes()?.to_vec(),
        })),
        (kind, 3) => {
            let kind = AckKind::from_reply(kind)?;
            let name = items[1].as_str().map(str::to_string);
            let count = match items[2] {
                Frame::Integer(n) => usize::try_from(n).ok()?,
                _ => return None,
            };
            Some(Push::Ack { kind, name, count })
        }
        _ => None,
    }
}

#[derive(Default)]
struct State {
    closed: bool,
    replies: VecDeque<ReplyWaiter>,
    acks: HashMap<AckKey, VecDeque<AckWaiter>>,
    channels: BTreeSet<String>,
    patterns: BTreeSet<String>,
    deliveries: Option<mpsc::UnboundedSender<Delivery>>,
}

impl State {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn tracked(&self, kind: AckKind) -> Vec<String> {
        let names = if kind.is_pattern() {
            &self.patterns
        } else {
            &self.channels
        };
        names.iter().cloned().collect()
    }

    fn apply(&mut self, push: Push) {
        match push {
            Push::Delivery(delivery) => {
                if let Some(deliveries) = &self.deliveries {
                    let _ = deliveries.send(delivery);
                }
            }
            Push::Ack { kind, name, count } => {
                if let Some(name) = &name {
                    match kind {
                        AckKind::Subscribe => {
                            self.channels.insert(name.clone());
                        }
                        AckKind::PSubscribe => {
                            self.patterns.insert(name.clone());
                        }
                        AckKind::Unsubscribe => {
                            self.channels.remove(name);
                        }
                        AckKind::PUnsubscribe => {
                            self.patterns.remove(name);
                        }
                    }
                }

                let key = (kind, name);
                if let Some(queue) = self.acks.get_mut(&key) {
                    if let Some(waiter) = queue.pop_front() {
                        let _ = waiter.send(Ok(count));
                    }
                    if queue.is_empty() {
                        self.acks.remove(&key);
                    }
                } else {
                    debug!(?key, count, "unsolicited subscription acknowledgement");
                }
            }
        }
    }

    fn route(&mut self, frame: Frame) {
        if let Frame::Array(Some(items)) = &frame {
            if let Some(push) = parse_push(items) {
                self.apply(push);
                return;
            }
        }
        match self.replies.pop_front() {
            Some(waiter) => {
                let _ = waiter.send(Ok(frame));
            }
            // An error nobody asked for answers a subscription request.
            None => match frame {
                Frame::Error(reason) => {
                    for (_, queue) in self.acks.drain() {
                        for waiter in queue {
                            let _ = waiter.send(Err(BusError::Rejected(reason.clone())));
                        }
                    }
                }
                other => debug!(frame = ?other, "unsolicited frame"),
            },
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.deliveries = None;
        for waiter in self.replies.drain(..) {
            let _ = waiter.send(Err(BusError::Closed));
        }
        for (_, queue) in self.acks.drain() {
            for waiter in queue {
                let _ = waiter.send(Err(BusError::Closed));
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One Redis connection.
///
/// Command replies are matched to callers in FIFO order; subscription
/// acknowledgements are matched by kind and channel name, since a
/// connection in subscribe mode interleaves them with message pushes.
pub struct RedisConnection {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl RedisConnection {
    /// Connect, authenticate and select the configured database.
    pub async fn open(config: &RedisConfig) -> Result<(Self, Deliveries), BusError> {
        let address = config.address();
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| BusError::ConnectionFailed(format!("{}: {}", address, e)))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (deliveries_tx, deliveries) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                deliveries: Some(deliveries_tx),
                ..State::default()
            }),
        });
        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&shared)));

        let connection = Self {
            writer: tokio::sync::Mutex::new(write_half),
            shared,
            reader,
        };

        if let Some(password) = &config.password {
            connection.command(&[&b"AUTH"[..], password.as_bytes()]).await?;
        }
        if let Some(db) = config.db {
            let db = db.to_string();
            connection.command(&[&b"SELECT"[..], db.as_bytes()]).await?;
        }
        debug!(address = %address, "redis connection established");
        Ok((connection, deliveries))
    }

    /// True once the server hung up or the connection was quit.
    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    /// Issue a command and wait for its reply. Error replies become
    /// [`BusError::Rejected`].
    pub async fn command(&self, args: &[&[u8]]) -> Result<Frame, BusError> {
        let reply = {
            let mut writer = self.writer.lock().await;
            let (tx, rx) = oneshot::channel();
            {
                let mut state = self.shared.state();
                state.ensure_open()?;
                state.replies.push_back(tx);
            }
            if let Err(e) = write_command(&mut writer, args).await {
                self.shared.state().replies.pop_back();
                return Err(e);
            }
            rx
        };

        match reply.await {
            Ok(Ok(Frame::Error(reason))) => Err(BusError::Rejected(reason)),
            Ok(outcome) => outcome,
            Err(_) => Err(BusError::Closed),
        }
    }

    /// Send a subscription command and wait for its acknowledgements.
    ///
    /// With no name, the bus acknowledges each tracked channel separately,
    /// or once with a null name when nothing is tracked.
    async fn subscription(&self, kind: AckKind, name: Option<&str>) -> Result<usize, BusError> {
        let waiters = {
            let mut writer = self.writer.lock().await;
            let waiters = {
                let mut state = self.shared.state();
                state.ensure_open()?;
                let names: Vec<Option<String>> = match name {
                    Some(name) => vec![Some(name.to_string())],
                    None => {
                        let tracked = state.tracked(kind);
                        if tracked.is_empty() {
                            vec![None]
                        } else {
                            tracked.into_iter().map(Some).collect()
                        }
                    }
                };
                names
                    .into_iter()
                    .map(|name| {
                        let (tx, rx) = oneshot::channel();
                        state.acks.entry((kind, name)).or_default().push_back(tx);
                        rx
                    })
                    .collect::<Vec<_>>()
            };

            let mut args = vec![kind.command()];
            if let Some(name) = name {
                args.push(name.as_bytes());
            }
            write_command(&mut writer, &args).await?;
            waiters
        };

        let mut remaining = usize::MAX;
        for waiter in waiters {
            let count = waiter.await.map_err(|_| BusError::Closed)??;
            remaining = remaining.min(count);
        }
        Ok(remaining)
    }
}

async fn write_command(writer: &mut OwnedWriteHalf, args: &[&[u8]]) -> Result<(), BusError> {
    let mut buf = BytesMut::new();
    resp::encode_command(args, &mut buf);
    writer.write_all(&buf).await?;
    Ok(())
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    let mut buf = BytesMut::with_capacity(4 * 1024);
    let failure = loop {
        match resp::parse(&mut buf) {
            Ok(Some(frame)) => {
                shared.state().route(frame);
                continue;
            }
            Ok(None) => {}
            Err(e) => break Some(e),
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => break None,
            Ok(_) => {}
            Err(e) => break Some(BusError::Io(e)),
        }
    };

    match failure {
        Some(e) => warn!(error = %e, "redis connection lost"),
        None => debug!("redis connection closed by peer"),
    }
    shared.state().close();
}

#[async_trait]
impl Connection for RedisConnection {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BusError> {
        match self
            .command(&[&b"PUBLISH"[..], channel.as_bytes(), payload])
            .await?
        {
            Frame::Integer(n) => Ok(usize::try_from(n).unwrap_or(0)),
            other => Err(BusError::Protocol(format!(
                "unexpected PUBLISH reply {:?}",
                other
            ))),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<usize, BusError> {
        self.subscription(AckKind::Subscribe, Some(channel)).await
    }

    async fn psubscribe(&self, pattern: &str) -> Result<usize, BusError> {
        self.subscription(AckKind::PSubscribe, Some(pattern)).await
    }

    async fn unsubscribe(&self, channel: Option<&str>) -> Result<usize, BusError> {
        self.subscription(AckKind::Unsubscribe, channel).await
    }

    async fn punsubscribe(&self, pattern: Option<&str>) -> Result<usize, BusError> {
        self.subscription(AckKind::PUnsubscribe, pattern).await
    }

    async fn quit(&self) -> Result<(), BusError> {
        let mut writer = self.writer.lock().await;
        if self.shared.state().closed {
            return Ok(());
        }
        // Best effort: the server may already be gone.
        let _ = write_command(&mut writer, &[&b"QUIT"[..]]).await;
        let _ = writer.shutdown().await;
        self.shared.state().close();
        self.reader.abort();
        Ok(())
    }
}

impl Drop for RedisConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
