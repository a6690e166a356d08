//! Durable document storage.
//!
//! ```text
//!   DocumentSession ──load/save (fallback)──┐
//!                                           ▼
//!                                   ┌───────────────┐
//!   SyncServer ──load/save────────► │ DocumentStore │
//!                                   └───────┬───────┘
//!                     ┌─────────────────────┼──────────────────┐
//!                     ▼                     ▼                  ▼
//!            RestDocumentStore     FileDocumentStore   MemoryDocumentStore
//!            GET/PUT /documents/{id}  {dir}/{uuid}.json     HashMap
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::presence::now_ms;
use crate::protocol::{DocumentRecord, SaveEnvelope};

/// Why a save (or load) did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveError {
    /// The server answered with an error.
    Rejected(String),
    /// No confirmation in time.
    Timeout,
    /// The connection failed mid-request.
    Transport(String),
    /// The store could not be reached at all.
    Unavailable(String),
    NotFound(Uuid),
    Decode(String),
}

impl std::fmt::Display for SaveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "Save rejected: {e}"),
            Self::Timeout => write!(f, "Save timed out"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            Self::NotFound(id) => write!(f, "Document not found: {id}"),
            Self::Decode(e) => write!(f, "Decode error: {e}"),
        }
    }
}

impl std::error::Error for SaveError {}

impl From<reqwest::Error> for SaveError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            Self::Unavailable(e.to_string())
        } else if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<std::io::Error> for SaveError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for SaveError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Load/save of whole documents.
pub trait DocumentStore: Send + Sync + 'static {
    fn load(&self, id: Uuid) -> impl Future<Output = Result<DocumentRecord, SaveError>> + Send;

    /// Persist the envelope and return the stored record.
    fn save(&self, envelope: SaveEnvelope) -> impl Future<Output = Result<DocumentRecord, SaveError>> + Send;
}

fn stored(envelope: SaveEnvelope) -> DocumentRecord {
    DocumentRecord {
        uuid: envelope.document_id,
        name: envelope.name,
        content: envelope.content,
        updated_at: Some(now_ms()),
    }
}

// ───────────────────────────────────────────────────────────────────
// REST
// ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SaveBody<'a> {
    name: &'a str,
    content: &'a str,
}

/// Client for the document REST API.
#[derive(Debug, Clone)]
pub struct RestDocumentStore {
    client: reqwest::Client,
    base_url: String,
}

impl RestDocumentStore {
    /// `base_url` without trailing slash, e.g. `http://localhost:8080/api`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SaveError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, id: Uuid) -> String {
        format!("{}/documents/{}", self.base_url, id)
    }

    async fn check(resp: reqwest::Response, id: Uuid) -> Result<reqwest::Response, SaveError> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SaveError::NotFound(id));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SaveError::Rejected(format!("{status} {body}").trim().to_string()));
        }
        Ok(resp)
    }
}

impl DocumentStore for RestDocumentStore {
    async fn load(&self, id: Uuid) -> Result<DocumentRecord, SaveError> {
        let resp = self.client.get(self.url(id)).send().await?;
        let resp = Self::check(resp, id).await?;
        Ok(resp.json::<DocumentRecord>().await?)
    }

    async fn save(&self, envelope: SaveEnvelope) -> Result<DocumentRecord, SaveError> {
        let id = envelope.document_id;
        let body = SaveBody {
            name: &envelope.name,
            content: &envelope.content,
        };
        let resp = self.client.put(self.url(id)).json(&body).send().await?;
        let resp = Self::check(resp, id).await?;

        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(stored(envelope));
        }
        Ok(serde_json::from_str(&text)?)
    }
}

// ───────────────────────────────────────────────────────────────────
// Memory
// ───────────────────────────────────────────────────────────────────

/// In-process store; clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    documents: Arc<RwLock<HashMap<Uuid, DocumentRecord>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: DocumentRecord) {
        self.documents.write().await.insert(record.uuid, record);
    }

    pub async fn get(&self, id: Uuid) -> Option<DocumentRecord> {
        self.documents.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }
}

impl DocumentStore for MemoryDocumentStore {
    async fn load(&self, id: Uuid) -> Result<DocumentRecord, SaveError> {
        self.get(id).await.ok_or(SaveError::NotFound(id))
    }

    async fn save(&self, envelope: SaveEnvelope) -> Result<DocumentRecord, SaveError> {
        let record = stored(envelope);
        self.insert(record.clone()).await;
        Ok(record)
    }
}

// ───────────────────────────────────────────────────────────────────
// Files
// ───────────────────────────────────────────────────────────────────

/// One JSON file per document under a directory.
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    dir: PathBuf,
}

impl FileDocumentStore {
    /// Opens (and creates) the directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, SaveError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        log::info!("Document store at {}", dir.display());
        Ok(Self { dir })
    }

    fn path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Ids of every stored document.
    pub async fn list(&self) -> Result<Vec<Uuid>, SaveError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| Uuid::parse_str(s).ok()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl DocumentStore for FileDocumentStore {
    async fn load(&self, id: Uuid) -> Result<DocumentRecord, SaveError> {
        let bytes = match tokio::fs::read(self.path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(SaveError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save(&self, envelope: SaveEnvelope) -> Result<DocumentRecord, SaveError> {
        let id = envelope.document_id;
        let record = stored(envelope);
        let json = serde_json::to_vec_pretty(&record)?;

        // Atomic replace.
        let tmp = self.dir.join(format!("{id}.json.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, self.path(id)).await?;
        log::debug!("Stored document {id}");
        Ok(record)
    }
}
