//! # tandem-sync: Real-time co-editing of plain-text documents
//!
//! Keeps every open copy of a document converged while several people type
//! at once, shows who else is present and where their cursor is, and saves
//! the agreed text without ever overwriting newer work.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    WebSocket (JSON)    ┌──────────────────┐
//! │ DocumentSession  │ ◄────────────────────► │ SyncServer       │
//! │ (per document)   │   join/op/presence/    │ (relay)          │
//! └────────┬─────────┘   update/resync        └────────┬─────────┘
//!          │                                           │
//!          ▼                                           ▼
//! ┌──────────────────┐                        ┌──────────────────┐
//! │ Coordinator      │                        │ Room             │
//! │  ├─ Replica      │                        │  ├─ Replica      │
//! │  ├─ PresenceStore│                        │  ├─ presence     │
//! │  └─ save machine │                        │  └─ BroadcastGroup
//! └────────┬─────────┘                        └────────┬─────────┘
//!          │ REST fallback                             │
//!          ▼                                           ▼
//!   ┌───────────────────────── DocumentStore ─────────────────────┐
//!   │  RestDocumentStore · FileDocumentStore · MemoryDocumentStore │
//!   └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`replica`]: Sequence CRDT over characters
//! - [`protocol`]: JSON wire frames and document records
//! - [`channel`]: Reconnecting WebSocket with an offline queue
//! - [`presence`]: Who is here and where their cursor is
//! - [`coordinator`]: Save lifecycle, echo detection, conflict handling
//! - [`session`]: Per-document task wiring all of the above
//! - [`view`]: Applying remote text to an editor without moving the caret
//! - [`store`]: Document persistence (REST, files, memory)
//! - [`server`] / [`broadcast`]: The relay

pub mod broadcast;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod observer;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod session;
pub mod store;
pub mod view;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use channel::{Channel, ChannelEvent, ConnectionStatus, TransportError};
pub use config::{BackoffConfig, SyncConfig};
pub use coordinator::{
    Conflict, ConflictResolution, Coordinator, Effect, SaveRoute, SaveState, SaveStatus,
};
pub use observer::SubscriptionId;
pub use presence::{Cursor, CursorColor, Identity, PresenceEvent, PresenceRecord, PresenceStore};
pub use protocol::{
    ClientFrame, DocumentRecord, ProtocolError, SaveEnvelope, SaveOrigin, ServerFrame,
};
pub use replica::{ApplyOutcome, CharId, ConvergenceError, Operation, Replica};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{DocumentSession, SessionError, SessionEvent, SessionOptions};
pub use store::{
    DocumentStore, FileDocumentStore, MemoryDocumentStore, RestDocumentStore, SaveError,
};
pub use view::{diff, EditBuffer, ReconcilingView, Selection, TextBuffer, TextPatch};
