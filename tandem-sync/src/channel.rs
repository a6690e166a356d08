//! Duplex transport to a document room.
//!
//! One driver task per channel owns the WebSocket. The handle never blocks:
//! frames go through an unbounded command queue, inbound frames and status
//! changes come back as [`ChannelEvent`]s.
//!
//! ```text
//!  Channel::send ──► cmd queue ──► driver ──► OutboundQueue ──► WebSocket
//!                                    │                              │
//!  ChannelEvent  ◄───────────────────┴──────────── decode ◄─────────┘
//! ```
//!
//! On every (re)connect the driver writes the join frame first, then flushes
//! the outbound queue in order. Presence frames are never queued while
//! disconnected; the session recomputes them on reconnect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::BackoffConfig;
use crate::protocol::{ClientFrame, ProtocolError, ServerFrame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Last attempt failed; a retry is scheduled.
    Errored,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

/// Transport failures. Recovered by reconnecting; never surfaced to the user
/// unless a save depends on them.
#[derive(Debug, Clone)]
pub enum TransportError {
    Connect(String),
    Write(String),
    Protocol(ProtocolError),
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "Connect failed: {e}"),
            Self::Write(e) => write!(f, "Write failed: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Emitted by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Status(ConnectionStatus),
    Frame(ServerFrame),
}

// ───────────────────────────────────────────────────────────────────
// Backoff
// ───────────────────────────────────────────────────────────────────

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Un-jittered delay for the next attempt: `base * 2^attempt`, capped.
    pub fn ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(16)).unwrap_or(u32::MAX);
        self.config.base.saturating_mul(factor).min(self.config.cap)
    }

    /// Delay before the next attempt, uniform in `[ceiling/2, ceiling]`.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling().as_millis() as u64;
        self.attempt = self.attempt.saturating_add(1);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(ceiling / 2..=ceiling))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset if the connection that just ended was up long enough.
    pub fn settle(&mut self, connected_for: Duration) {
        if connected_for >= self.config.stable_after {
            self.reset();
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Outbound queue
// ───────────────────────────────────────────────────────────────────

/// FIFO of frames waiting for a connection.
pub struct OutboundQueue {
    queue: VecDeque<ClientFrame>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Queue a frame for the next connection. Presence frames and frames past
    /// capacity are dropped and `false` is returned.
    pub fn enqueue(&mut self, frame: ClientFrame) -> bool {
        if frame.is_presence() {
            return false;
        }
        if self.queue.len() >= self.capacity {
            log::warn!("Outbound queue full ({}), dropping frame", self.capacity);
            return false;
        }
        self.queue.push_back(frame);
        true
    }

    /// Put back a frame whose write failed.
    pub fn requeue_front(&mut self, frame: ClientFrame) {
        if !frame.is_presence() {
            self.queue.push_front(frame);
        }
    }

    pub fn pop_front(&mut self) -> Option<ClientFrame> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Channel handle
// ───────────────────────────────────────────────────────────────────

enum Command {
    Send(ClientFrame),
    Close,
}

/// Handle to a running channel driver.
pub struct Channel {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Channel {
    /// Start connecting to `url`. `join` is written first on every connect.
    pub fn connect(
        url: impl Into<String>,
        join: ClientFrame,
        backoff: BackoffConfig,
        queue_capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let status_tx = Arc::new(status_tx);
        let closed = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            url: url.into(),
            join,
            commands: cmd_rx,
            events: event_tx,
            status: status_tx.clone(),
            closed: closed.clone(),
            queue: OutboundQueue::new(queue_capacity),
            backoff: Backoff::new(backoff),
        };
        let task = tokio::spawn(driver.run());

        let channel = Self {
            commands: cmd_tx,
            status: status_rx,
            status_tx,
            closed,
            task,
        };
        (channel, event_rx)
    }

    /// Send a frame; queued while disconnected.
    pub fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.commands
            .send(Command::Send(frame))
            .map_err(|_| TransportError::Closed)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Discard pending sends and stop for good.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.status_tx.send_replace(ConnectionStatus::Disconnected);
        let _ = self.commands.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
        self.task.abort();
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

enum Exit {
    Closed,
    Lost,
}

struct Driver {
    url: String,
    join: ClientFrame,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    closed: Arc<AtomicBool>,
    queue: OutboundQueue,
    backoff: Backoff,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.publish(ConnectionStatus::Connecting);
            log::debug!("Connecting to {}", self.url);

            let attempt = tokio_tungstenite::connect_async(self.url.clone());
            tokio::pin!(attempt);
            let result = loop {
                tokio::select! {
                    result = &mut attempt => break result,
                    cmd = self.commands.recv() => {
                        if let Exit::Closed = self.offline_command(cmd) {
                            return;
                        }
                    }
                }
            };

            match result {
                Ok((socket, _)) => {
                    log::info!("Connected to {}", self.url);
                    let connected_at = Instant::now();
                    self.publish(ConnectionStatus::Connected);
                    if let Exit::Closed = self.pump(socket).await {
                        return;
                    }
                    self.backoff.settle(connected_at.elapsed());
                    log::info!("Connection to {} lost", self.url);
                    self.publish(ConnectionStatus::Disconnected);
                }
                Err(e) => {
                    log::warn!("{}", TransportError::Connect(e.to_string()));
                    self.publish(ConnectionStatus::Errored);
                }
            }

            let delay = self.backoff.next_delay();
            log::debug!("Reconnecting in {delay:?} (attempt {})", self.backoff.attempt());
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = self.commands.recv() => {
                        if let Exit::Closed = self.offline_command(cmd) {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn offline_command(&mut self, cmd: Option<Command>) -> Exit {
        match cmd {
            Some(Command::Send(frame)) => {
                // A dropped op is resent by the coordinator after the next sync.
                self.queue.enqueue(frame);
                Exit::Lost
            }
            Some(Command::Close) | None => {
                self.queue.clear();
                Exit::Closed
            }
        }
    }

    async fn pump(&mut self, socket: Socket) -> Exit {
        let (mut sink, mut stream) = socket.split();

        if let Err(e) = write(&mut sink, &self.join).await {
            log::warn!("{e}");
            return Exit::Lost;
        }
        if !self.queue.is_empty() {
            log::info!("Replaying {} queued frames", self.queue.len());
        }
        while let Some(frame) = self.queue.pop_front() {
            if let Err(e) = write(&mut sink, &frame).await {
                log::warn!("{e}");
                self.queue.requeue_front(frame);
                return Exit::Lost;
            }
        }

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(frame)) => {
                        if let Err(e) = write(&mut sink, &frame).await {
                            log::warn!("{e}");
                            self.queue.requeue_front(frame);
                            return Exit::Lost;
                        }
                    }
                    Some(Command::Close) | None => {
                        self.queue.clear();
                        let _ = sink.close().await;
                        return Exit::Closed;
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => match ServerFrame::decode(text.as_str()) {
                        Ok(frame) => {
                            log::trace!("<- {frame:?}");
                            let _ = self.events.send(ChannelEvent::Frame(frame));
                        }
                        Err(e) => log::warn!("Dropping inbound frame: {}", TransportError::from(e)),
                    },
                    Some(Ok(Message::Close(_))) | None => return Exit::Lost,
                    Some(Err(e)) => {
                        log::warn!("Socket error: {e}");
                        return Exit::Lost;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    fn publish(&self, next: ConnectionStatus) {
        let closed = &self.closed;
        let changed = self.status.send_if_modified(|current| {
            if closed.load(Ordering::Acquire) || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            let _ = self.events.send(ChannelEvent::Status(next));
        }
    }
}

async fn write<S>(sink: &mut S, frame: &ClientFrame) -> Result<(), TransportError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let encoded = frame.encode()?;
    log::trace!("-> {encoded}");
    sink.send(Message::Text(encoded.into()))
        .await
        .map_err(|e| TransportError::Write(e.to_string()))
}
