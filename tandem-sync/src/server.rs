//! WebSocket relay with room-based document routing.
//!
//! ```text
//! Session A ──┐
//!             ├── Room (document id) ── Replica ── BroadcastGroup
//! Session B ──┘          │                              │
//!                        ├── presence cache             ├──► Session A
//!                        └── DocumentStore (load/save)  └──► Session B
//! ```
//!
//! Each room keeps:
//! - an authoritative [`Replica`] seeded from the stored content, so late
//!   joiners get the full state in one `sync` frame
//! - the last presence record of every peer, replayed on join
//! - the persisted [`DocumentRecord`]
//!
//! Integrated `op` frames go to everyone, the sender included, which is how
//! a session learns its op landed. An op that refers to elements the room
//! does not know is answered with a `sync` instead of being relayed.
//! `presence` frames go to the other peers; `update` frames are saved through
//! the store and echoed to everyone with the sender as `origin`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Relayed};
use crate::presence::PresenceRecord;
use crate::protocol::{ClientFrame, DocumentRecord, SaveEnvelope, SaveOrigin, ServerFrame};
use crate::replica::{ApplyOutcome, Operation, Replica};
use crate::store::{DocumentStore, SaveError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before it starts lagging.
    pub broadcast_capacity: usize,
    /// Name given to documents the store does not know yet.
    pub default_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            default_name: "Untitled".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub active_rooms: usize,
    pub saves: u64,
}

struct Room {
    document: DocumentRecord,
    replica: Replica,
    presence: HashMap<Uuid, PresenceRecord>,
    peers: HashSet<Uuid>,
    group: Arc<BroadcastGroup>,
}

impl Room {
    fn new(document: DocumentRecord, capacity: usize) -> Self {
        let replica = Replica::seeded(Uuid::nil(), &document.content);
        Self {
            document,
            replica,
            presence: HashMap::new(),
            peers: HashSet::new(),
            group: Arc::new(BroadcastGroup::new(capacity)),
        }
    }
}

struct Shared<S> {
    config: ServerConfig,
    rooms: RwLock<HashMap<Uuid, Room>>,
    /// Text of emptied rooms whose store write has not finished.
    closing: Mutex<HashMap<Uuid, DocumentRecord>>,
    store: S,
    stats: RwLock<ServerStats>,
}

/// The relay.
pub struct SyncServer<S: DocumentStore> {
    shared: Arc<Shared<S>>,
}

impl<S: DocumentStore> Clone for SyncServer<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: DocumentStore> SyncServer<S> {
    pub fn new(config: ServerConfig, store: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                rooms: RwLock::new(HashMap::new()),
                closing: Mutex::new(HashMap::new()),
                store,
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        log::info!("Sync relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn store(&self) -> &S {
        &self.shared.store
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    /// Converged text of an open room.
    pub async fn live_text(&self, document_id: Uuid) -> Option<String> {
        self.shared.rooms.read().await.get(&document_id).map(|r| r.replica.snapshot())
    }

    /// Write a document from outside the op stream (import, admin edit).
    ///
    /// Connected sessions receive an `update` without origin.
    pub async fn publish_external(&self, document: DocumentRecord) -> Result<DocumentRecord, SaveError> {
        let envelope = SaveEnvelope {
            document_id: document.uuid,
            name: document.name,
            content: document.content,
            origin_kind: SaveOrigin::Manual,
        };
        let saved = self.shared.store.save(envelope).await?;

        let mut rooms = self.shared.rooms.write().await;
        if let Some(room) = rooms.get_mut(&saved.uuid) {
            room.replica.reset_to(&saved.content);
            room.document = saved.clone();
            let frame = ServerFrame::Update {
                document: saved.clone(),
                origin: None,
            };
            log_broadcast(room.group.broadcast(None, &frame));
        }
        log::info!("External write to {}", saved.uuid);
        Ok(saved)
    }
}

impl<S: DocumentStore> Shared<S> {
    fn closing(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, DocumentRecord>> {
        self.closing.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn load_or_new(&self, document_id: Uuid) -> Result<DocumentRecord, SaveError> {
        let reopened = self.closing().get(&document_id).cloned();
        if let Some(record) = reopened {
            return Ok(record);
        }
        match self.store.load(document_id).await {
            Ok(record) => Ok(record),
            Err(SaveError::NotFound(_)) => {
                log::info!("Document {document_id} not in store, starting empty");
                Ok(DocumentRecord::new(document_id, self.config.default_name.clone(), ""))
            }
            Err(e) => Err(e),
        }
    }

    async fn join(
        &self,
        document_id: Uuid,
        session: Uuid,
    ) -> Result<(Vec<ServerFrame>, broadcast::Receiver<Relayed>), String> {
        let mut loaded = None;
        loop {
            {
                let mut rooms = self.rooms.write().await;
                if !rooms.contains_key(&document_id) {
                    if let Some(record) = loaded.take() {
                        rooms.insert(document_id, Room::new(record, self.config.broadcast_capacity));
                    }
                }
                if let Some(room) = rooms.get_mut(&document_id) {
                    if room.peers.len() >= self.config.max_peers_per_room {
                        return Err(format!("room {document_id} is full"));
                    }
                    room.peers.insert(session);
                    let rx = room.group.subscribe();

                    let mut frames = vec![
                        ServerFrame::Init {
                            document: room.document.clone(),
                        },
                        ServerFrame::Sync {
                            state: room.replica.state(),
                        },
                    ];
                    frames.extend(
                        room.presence
                            .iter()
                            .filter(|(id, _)| **id != session)
                            .map(|(id, record)| ServerFrame::Presence {
                                session_id: *id,
                                record: Some(record.clone()),
                            }),
                    );
                    let room_count = rooms.len();
                    drop(rooms);

                    self.stats.write().await.active_rooms = room_count;
                    log::info!("Session {session} joined document {document_id}");
                    return Ok((frames, rx));
                }
            }
            loaded = Some(self.load_or_new(document_id).await.map_err(|e| e.to_string())?);
        }
    }

    async fn apply_op(&self, document_id: Uuid, session: Uuid, op: Operation) -> Vec<ServerFrame> {
        if op.origin != session {
            return vec![ServerFrame::op_rejected(&op, "operation origin does not match session")];
        }
        if let Err(e) = op.validate() {
            log::warn!("Rejected op from {session}: {e}");
            return vec![ServerFrame::op_rejected(&op, e.to_string())];
        }
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&document_id) else {
            return vec![ServerFrame::error("not joined")];
        };
        if !room.replica.is_ready(&op) {
            log::info!("Op {}:{} refers to unknown elements, resending state", op.origin, op.clock);
            return vec![ServerFrame::Sync {
                state: room.replica.state(),
            }];
        }
        match room.replica.apply_remote(op.clone()) {
            // Already applied: acknowledge to the sender only.
            Ok(ApplyOutcome::Duplicate) => vec![ServerFrame::Op(op)],
            Ok(_) => {
                log_broadcast(room.group.broadcast(None, &ServerFrame::Op(op)));
                Vec::new()
            }
            Err(e) => {
                log::warn!("Rejected op from {session}: {e}");
                vec![ServerFrame::op_rejected(&op, e.to_string())]
            }
        }
    }

    async fn relay_presence(&self, document_id: Uuid, session: Uuid, record: Option<PresenceRecord>) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&document_id) else { return };
        match &record {
            Some(r) => {
                room.presence.insert(session, r.clone());
            }
            None => {
                room.presence.remove(&session);
            }
        }
        let frame = ServerFrame::Presence {
            session_id: session,
            record,
        };
        log_broadcast(room.group.broadcast(Some(session), &frame));
    }

    async fn save(&self, document_id: Uuid, session: Uuid, name: String, content: String) -> Vec<ServerFrame> {
        if name.trim().is_empty() {
            return vec![ServerFrame::error("name required")];
        }
        let envelope = SaveEnvelope {
            document_id,
            name,
            content,
            origin_kind: SaveOrigin::Manual,
        };
        let saved = match self.store.save(envelope).await {
            Ok(saved) => saved,
            Err(e) => {
                log::error!("Save of {document_id} failed: {e}");
                return vec![ServerFrame::error(e.to_string())];
            }
        };

        self.stats.write().await.saves += 1;
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(&document_id) {
            room.document = saved.clone();
            let frame = ServerFrame::Update {
                document: saved,
                origin: Some(session),
            };
            log_broadcast(room.group.broadcast(None, &frame));
        }
        Vec::new()
    }

    async fn sync_frame(&self, document_id: Uuid) -> Vec<ServerFrame> {
        let rooms = self.rooms.read().await;
        match rooms.get(&document_id) {
            Some(room) => vec![ServerFrame::Sync {
                state: room.replica.state(),
            }],
            None => vec![ServerFrame::error("not joined")],
        }
    }

    async fn leave(&self, document_id: Uuid, session: Uuid) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&document_id) else { return };

        room.peers.remove(&session);
        room.presence.remove(&session);
        let frame = ServerFrame::Presence {
            session_id: session,
            record: None,
        };
        log_broadcast(room.group.broadcast(Some(session), &frame));
        log::info!("Session {session} left document {document_id}");

        let mut unsaved = None;
        if room.peers.is_empty() {
            let text = room.replica.snapshot();
            if text != room.document.content {
                let record = DocumentRecord::new(document_id, room.document.name.clone(), text);
                // A join before the write lands reopens from this record.
                self.closing().insert(document_id, record.clone());
                unsaved = Some(record);
            }
            rooms.remove(&document_id);
            log::info!("Room {document_id} removed (empty)");
        }
        let room_count = rooms.len();
        drop(rooms);
        self.stats.write().await.active_rooms = room_count;

        let Some(record) = unsaved else { return };
        let envelope = SaveEnvelope {
            document_id,
            name: record.name,
            content: record.content,
            origin_kind: SaveOrigin::Auto,
        };
        match self.store.save(envelope).await {
            Ok(_) => log::info!("Persisted {document_id} (room closing)"),
            Err(e) => log::error!("Failed to persist {document_id} on close: {e}"),
        }
        self.closing().remove(&document_id);
    }
}

fn log_broadcast<T>(result: Result<T, crate::protocol::ProtocolError>) {
    if let Err(e) = result {
        log::error!("Broadcast failed: {e}");
    }
}

async fn next_relayed(rx: &mut Option<broadcast::Receiver<Relayed>>) -> Result<Relayed, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_connection<S: DocumentStore>(
    shared: Arc<Shared<S>>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut joined: Option<(Uuid, Uuid)> = None;
    let mut relay_rx: Option<broadcast::Receiver<Relayed>> = None;

    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        shared.stats.write().await.total_frames += 1;
                        let frame = match ClientFrame::decode(text.as_str()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Failed to decode frame from {addr}: {e}");
                                let reply = ServerFrame::error(e.to_string()).encode()?;
                                ws_sender.send(Message::Text(reply.into())).await?;
                                continue;
                            }
                        };

                        let replies = match (frame, joined) {
                            (ClientFrame::Join { document_id, session_id }, None) => {
                                match shared.join(document_id, session_id).await {
                                    Ok((frames, rx)) => {
                                        joined = Some((document_id, session_id));
                                        relay_rx = Some(rx);
                                        frames
                                    }
                                    Err(e) => vec![ServerFrame::error(e)],
                                }
                            }
                            (ClientFrame::Join { .. }, Some(_)) => vec![ServerFrame::error("already joined")],
                            (_, None) => vec![ServerFrame::error("join first")],
                            (ClientFrame::Op(op), Some((doc, session))) => shared.apply_op(doc, session, op).await,
                            (ClientFrame::Presence { record, .. }, Some((doc, session))) => {
                                shared.relay_presence(doc, session, record).await;
                                Vec::new()
                            }
                            (ClientFrame::Update { name, content }, Some((doc, session))) => {
                                shared.save(doc, session, name, content).await
                            }
                            (ClientFrame::Resync, Some((doc, _))) => shared.sync_frame(doc).await,
                        };

                        for reply in replies {
                            ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },

                relayed = next_relayed(&mut relay_rx) => match relayed {
                    Ok(relayed) => {
                        if joined.is_some_and(|(_, session)| relayed.is_for(session)) {
                            ws_sender.send(Message::Text(relayed.text.to_string().into())).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer {addr} lagged by {n} frames, resending state");
                        if let Some((doc, _)) = joined {
                            if let Some(group) = shared.rooms.read().await.get(&doc).map(|r| r.group.clone()) {
                                group.record_lag(n);
                            }
                            for reply in shared.sync_frame(doc).await {
                                ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
    .await;

    if let Some((doc, session)) = joined {
        shared.leave(doc, session).await;
    }
    shared.stats.write().await.active_connections -= 1;
    result
}
