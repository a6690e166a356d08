//! One open document: the coordinator, its channel and its timers, driven by a
//! single task.
//!
//! ```text
//!  DocumentSession (handle, Clone) ──commands──┐
//!                                              ▼
//!   Channel events ──────────────────► ┌──────────────┐ ──► Channel::send
//!   REST save results ───────────────► │   runtime    │ ──► DocumentStore::save (spawned)
//!   coordinator deadline / sweep ────► │ (select! loop)│ ──► SessionEvent subscribers
//!                                      └──────────────┘
//! ```
//!
//! Everything for a document runs on that one task, so the coordinator and
//! the replica need no locks. Closing the session cancels its timers, aborts
//! an in-flight REST save and closes the channel.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::{Channel, ChannelEvent, ConnectionStatus};
use crate::config::SyncConfig;
use crate::coordinator::{Conflict, ConflictResolution, Coordinator, Effect, SaveState, SaveStatus};
use crate::observer::{Observers, SubscriptionId};
use crate::presence::{now_ms, Cursor, Identity, PresenceEvent, PresenceRecord};
use crate::protocol::DocumentRecord;
use crate::replica::ConvergenceError;
use crate::store::{DocumentStore, SaveError};

/// What a session needs to open a document.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Relay base URL, e.g. `ws://localhost:9090`.
    pub server_url: String,
    pub document_id: Uuid,
    pub identity: Identity,
    pub session_id: Uuid,
    pub config: SyncConfig,
}

impl SessionOptions {
    pub fn new(server_url: impl Into<String>, document_id: Uuid, identity: Identity) -> Self {
        Self {
            server_url: server_url.into(),
            document_id,
            identity,
            session_id: Uuid::new_v4(),
            config: SyncConfig::default(),
        }
    }
}

/// Notifications delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RemoteChange(String),
    Status(SaveStatus),
    Conflict(Conflict),
    Presence(PresenceEvent),
    Connection(ConnectionStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Initial load failed.
    Load(SaveError),
    /// A local edit was rejected.
    Edit(ConvergenceError),
    /// The session was closed.
    Closed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load(e) => write!(f, "Failed to load document: {e}"),
            Self::Edit(e) => write!(f, "Edit rejected: {e}"),
            Self::Closed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<SaveError> for SessionError {
    fn from(e: SaveError) -> Self {
        Self::Load(e)
    }
}

impl From<ConvergenceError> for SessionError {
    fn from(e: ConvergenceError) -> Self {
        Self::Edit(e)
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Snapshot(Reply<String>),
    Insert { pos: usize, text: String, reply: Reply<Result<(), ConvergenceError>> },
    Delete { pos: usize, len: usize, reply: Reply<Result<(), ConvergenceError>> },
    SetCursor(Option<Cursor>),
    RequestSave { manual: bool },
    ResolveConflict(ConflictResolution),
    DismissStatus,
    Presence(Reply<Vec<PresenceRecord>>),
    Status(Reply<(SaveStatus, SaveState)>),
    Subscribe(Reply<(SubscriptionId, mpsc::UnboundedReceiver<SessionEvent>)>),
    Unsubscribe(SubscriptionId, Reply<bool>),
    Close(Reply<()>),
}

/// Handle to an open document. Clones share the same session; the session
/// closes when [`close`](Self::close) is called or the last handle drops.
#[derive(Clone)]
pub struct DocumentSession {
    commands: mpsc::UnboundedSender<Command>,
    connection: watch::Receiver<ConnectionStatus>,
    document_id: Uuid,
    session_id: Uuid,
}

impl DocumentSession {
    /// Load the document, seed the replica and start connecting.
    pub async fn open<S: DocumentStore>(options: SessionOptions, store: Arc<S>) -> Result<Self, SessionError> {
        let document: DocumentRecord = store.load(options.document_id).await?;
        log::info!("Opened document {} as session {}", document.uuid, options.session_id);

        let config = options.config;
        let mut coordinator = Coordinator::new(document, options.session_id, &options.identity, config.clone());
        let (_, presence_events) = coordinator.presence_mut().subscribe();

        let url = format!("{}/{}", options.server_url.trim_end_matches('/'), options.document_id);
        let (channel, channel_events) = Channel::connect(url, coordinator.join_frame(), config.backoff, config.queue_capacity);
        let connection = channel.watch_status();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (rest_tx, rest_rx) = mpsc::unbounded_channel();
        let runtime = Runtime {
            coordinator,
            channel,
            channel_events,
            commands: cmd_rx,
            presence_events,
            observers: Observers::new(),
            store,
            rest: None,
            rest_seq: 0,
            rest_tx,
            rest_rx,
            config,
        };
        tokio::spawn(runtime.run());

        Ok(Self {
            commands: cmd_tx,
            connection,
            document_id: options.document_id,
            session_id: options.session_id,
        })
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }

    async fn ask<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Current converged text.
    pub async fn get_snapshot(&self) -> Result<String, SessionError> {
        self.ask(Command::Snapshot).await
    }

    pub async fn insert(&self, pos: usize, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        Ok(self.ask(|reply| Command::Insert { pos, text, reply }).await??)
    }

    pub async fn delete(&self, pos: usize, len: usize) -> Result<(), SessionError> {
        Ok(self.ask(|reply| Command::Delete { pos, len, reply }).await??)
    }

    pub fn set_cursor(&self, cursor: Option<Cursor>) -> Result<(), SessionError> {
        self.send(Command::SetCursor(cursor))
    }

    /// `manual` bypasses the debounce and may fall back to the store.
    pub fn request_save(&self, manual: bool) -> Result<(), SessionError> {
        self.send(Command::RequestSave { manual })
    }

    pub fn resolve_conflict(&self, resolution: ConflictResolution) -> Result<(), SessionError> {
        self.send(Command::ResolveConflict(resolution))
    }

    pub fn dismiss_status(&self) -> Result<(), SessionError> {
        self.send(Command::DismissStatus)
    }

    /// Live presence records, ours included.
    pub async fn presence(&self) -> Result<Vec<PresenceRecord>, SessionError> {
        self.ask(Command::Presence).await
    }

    pub async fn status(&self) -> Result<SaveStatus, SessionError> {
        Ok(self.ask(Command::Status).await?.0)
    }

    pub async fn save_state(&self) -> Result<SaveState, SessionError> {
        Ok(self.ask(Command::Status).await?.1)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.connection.borrow()
    }

    pub async fn subscribe(&self) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        self.ask(Command::Subscribe).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, SessionError> {
        self.ask(|reply| Command::Unsubscribe(id, reply)).await
    }

    /// Call `handler` with the new text after every remote change.
    pub async fn on_remote_change<F>(&self, mut handler: F) -> Result<SubscriptionId, SessionError>
    where
        F: FnMut(String) + Send + 'static,
    {
        let (id, mut events) = self.subscribe().await?;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let SessionEvent::RemoteChange(text) = event {
                    handler(text);
                }
            }
        });
        Ok(id)
    }

    /// Tear down: leave the room, cancel timers, drop in-flight saves.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.ask(Command::Close).await
    }
}

struct Runtime<S> {
    coordinator: Coordinator,
    channel: Channel,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    presence_events: mpsc::UnboundedReceiver<PresenceEvent>,
    observers: Observers<SessionEvent>,
    store: Arc<S>,
    rest: Option<JoinHandle<()>>,
    rest_seq: u64,
    rest_tx: mpsc::UnboundedSender<(u64, Result<DocumentRecord, SaveError>)>,
    rest_rx: mpsc::UnboundedReceiver<(u64, Result<DocumentRecord, SaveError>)>,
    config: SyncConfig,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

impl<S: DocumentStore> Runtime<S> {
    async fn run(mut self) {
        let period = self.config.presence_sweep;
        let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            let deadline = self.coordinator.next_deadline();
            let effects = tokio::select! {
                cmd = self.commands.recv() => match cmd.map(|cmd| self.command(cmd)) {
                    Some(ControlFlow::Continue(effects)) => effects,
                    Some(ControlFlow::Break(reply)) => {
                        self.shutdown();
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.shutdown();
                        return;
                    }
                },
                Some(event) = self.channel_events.recv() => match event {
                    ChannelEvent::Status(status) => {
                        log::debug!("Document {} connection {status:?}", self.coordinator.document_id());
                        self.observers.notify(&SessionEvent::Connection(status));
                        self.coordinator.on_connection(status, Instant::now())
                    }
                    ChannelEvent::Frame(frame) => self.coordinator.handle_frame(frame, Instant::now()),
                },
                Some((seq, result)) = self.rest_rx.recv() => {
                    if seq == self.rest_seq {
                        self.rest = None;
                        self.coordinator.on_rest_result(result, Instant::now())
                    } else {
                        Vec::new()
                    }
                }
                Some(event) = self.presence_events.recv() => {
                    self.observers.notify(&SessionEvent::Presence(event));
                    Vec::new()
                }
                _ = wait_until(deadline) => self.coordinator.tick(Instant::now()),
                _ = sweep.tick() => self.coordinator.presence_sweep(),
            };
            self.execute(effects);
        }
    }

    /// Run one command. `Break` carries the reply of a close request.
    fn command(&mut self, cmd: Command) -> ControlFlow<Reply<()>, Vec<Effect>> {
        let now = Instant::now();
        let effects = match cmd {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.coordinator.snapshot());
                Vec::new()
            }
            Command::Insert { pos, text, reply } => {
                let (result, effects) = split(self.coordinator.local_insert(pos, &text, now));
                let _ = reply.send(result);
                effects
            }
            Command::Delete { pos, len, reply } => {
                let (result, effects) = split(self.coordinator.local_delete(pos, len, now));
                let _ = reply.send(result);
                effects
            }
            Command::SetCursor(cursor) => self.coordinator.set_cursor(cursor, now),
            Command::RequestSave { manual } => self.coordinator.request_save(manual, now),
            Command::ResolveConflict(resolution) => self.coordinator.resolve_conflict(resolution, now),
            Command::DismissStatus => self.coordinator.dismiss_status(now),
            Command::Presence(reply) => {
                let mut records: Vec<PresenceRecord> =
                    self.coordinator.presence_mut().get_all(now_ms()).into_values().collect();
                records.sort_by_key(|r| r.session_id);
                let _ = reply.send(records);
                Vec::new()
            }
            Command::Status(reply) => {
                let _ = reply.send((self.coordinator.status().clone(), self.coordinator.state().clone()));
                Vec::new()
            }
            Command::Subscribe(reply) => {
                let _ = reply.send(self.observers.subscribe());
                Vec::new()
            }
            Command::Unsubscribe(id, reply) => {
                let _ = reply.send(self.observers.unsubscribe(id));
                Vec::new()
            }
            Command::Close(reply) => return ControlFlow::Break(reply),
        };
        ControlFlow::Continue(effects)
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(frame) => {
                    if let Err(e) = self.channel.send(frame) {
                        log::warn!("{e}");
                    }
                }
                Effect::RestSave(envelope) => {
                    if let Some(previous) = self.rest.take() {
                        previous.abort();
                    }
                    self.rest_seq += 1;
                    let seq = self.rest_seq;
                    let store = self.store.clone();
                    let tx = self.rest_tx.clone();
                    self.rest = Some(tokio::spawn(async move {
                        let result = store.save(envelope).await;
                        let _ = tx.send((seq, result));
                    }));
                }
                Effect::RemoteChange(text) => self.observers.notify(&SessionEvent::RemoteChange(text)),
                Effect::Status(status) => self.observers.notify(&SessionEvent::Status(status)),
                Effect::Conflict(conflict) => self.observers.notify(&SessionEvent::Conflict(conflict)),
            }
        }
    }

    fn shutdown(&mut self) {
        log::info!("Closing document {}", self.coordinator.document_id());
        if self.channel.status().is_connected() {
            let _ = self.channel.send(self.coordinator.leave_frame());
        }
        if let Some(rest) = self.rest.take() {
            rest.abort();
        }
        self.channel.close();
        self.coordinator.presence_mut().teardown();
        self.observers.clear();
    }
}

fn split(result: Result<Vec<Effect>, ConvergenceError>) -> (Result<(), ConvergenceError>, Vec<Effect>) {
    match result {
        Ok(effects) => (Ok(()), effects),
        Err(e) => (Err(e), Vec::new()),
    }
}
