//! JSON wire protocol between sessions and the relay.
//!
//! Every frame is a JSON object discriminated by `type`:
//! ```text
//!  client → server   join | op | presence | update{name,content} | resync
//!  server → client   init | update{document,origin} | op | presence | sync | error
//! ```
//!
//! `presence` is relayed verbatim to the other peers of a room; an integrated
//! `op` goes to every peer, its sender included.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::PresenceRecord;
use crate::replica::{CharId, Operation, ReplicaState};

/// A persisted document as held by the store and echoed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub uuid: Uuid,
    pub name: String,
    pub content: String,
    /// Milliseconds since the Unix epoch of the last successful save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
}

impl DocumentRecord {
    pub fn new(uuid: Uuid, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            content: content.into(),
            updated_at: None,
        }
    }
}

/// What triggered a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveOrigin {
    Manual,
    Auto,
}

/// One save request. At most one is outstanding per document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveEnvelope {
    pub document_id: Uuid,
    pub name: String,
    pub content: String,
    pub origin_kind: SaveOrigin,
}

/// Frames sent by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// First frame after every connect.
    Join { document_id: Uuid, session_id: Uuid },
    Op(Operation),
    /// `record: None` announces a leave.
    Presence {
        session_id: Uuid,
        record: Option<PresenceRecord>,
    },
    /// Full-document save request.
    Update { name: String, content: String },
    /// Ask for the full replica state.
    Resync,
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Init { document: DocumentRecord },
    /// Save confirmation. `origin` is the saving session, absent for
    /// writes that did not come through the op stream.
    Update {
        document: DocumentRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<Uuid>,
    },
    Op(Operation),
    Presence {
        session_id: Uuid,
        record: Option<PresenceRecord>,
    },
    Sync { state: ReplicaState },
    /// `rejected` names the operation the relay refused, if any.
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rejected: Option<CharId>,
    },
}

impl ClientFrame {
    /// Presence frames are recomputed after reconnect instead of queued.
    pub fn is_presence(&self) -> bool {
        matches!(self, ClientFrame::Presence { .. })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: message.into(),
            rejected: None,
        }
    }

    /// Refusal of the operation `(origin, clock)`.
    pub fn op_rejected(op: &Operation, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: message.into(),
            rejected: Some(CharId::new(op.origin, op.clock)),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
