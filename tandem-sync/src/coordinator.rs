//! Save/sync coordinator for one open document.
//!
//! A synchronous state machine. Every input carries `now` and returns the
//! [`Effect`]s the runtime must perform; nothing here blocks or spawns.
//!
//! ```text
//!            local edit                debounce ∧ connected
//!   Idle ───────────────► Editing ─────────────────────────► SavePending(auto)
//!    ▲                      │ ▲       explicit save            │
//!    │                      │ └──────────────────────────────► SavePending(manual)
//!    │                      │                                   │          │
//!    │     status window    │            echo / REST ok         │          │ error / timeout /
//!    └────────────── SaveConfirmed ◄────────────────────────────┘          │ socket loss
//!                                                                          ▼
//!                           Editing ◄──────────────────────────────── SaveFailed
//! ```
//!
//! Remote operations merge through the [`Replica`]; an origin-less
//! full-document write while dirty becomes a [`Conflict`] that only
//! [`Coordinator::resolve_conflict`] settles.
//!
//! Local edits are journaled until the relay echoes them back. Nothing is
//! sent before the first `sync` of a connection; every `sync` replays the
//! journal onto the relay's state, by id where the relay knows the anchors
//! and by visible position where it does not.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use uuid::Uuid;

use crate::channel::ConnectionStatus;
use crate::config::SyncConfig;
use crate::presence::{now_ms, Cursor, Identity, PresenceRecord, PresenceStore};
use crate::protocol::{ClientFrame, DocumentRecord, SaveEnvelope, SaveOrigin, ServerFrame};
use crate::replica::{ConvergenceError, Operation, Replica};
use crate::store::SaveError;

/// Save lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveState {
    Idle,
    Editing { dirty: bool },
    SavePending(SaveOrigin),
    SaveConfirmed,
    SaveFailed(SaveError),
}

/// User-visible save indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Saving,
    Success,
    Error(String),
}

/// How an in-flight envelope travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveRoute {
    Duplex,
    Rest,
}

/// A remote full-document write that arrived while local edits were unsaved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub local: String,
    pub remote: DocumentRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Keep the local text and save it over the remote write.
    KeepLocal,
    /// Discard local edits in favor of the remote write.
    TakeRemote,
}

/// Work for the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(ClientFrame),
    /// Save through the document store; report back with
    /// [`Coordinator::on_rest_result`].
    RestSave(SaveEnvelope),
    /// The text changed because of someone else.
    RemoteChange(String),
    Status(SaveStatus),
    Conflict(Conflict),
}

/// A local edit as the user made it, kept for rebasing.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalEdit {
    Insert { pos: usize, text: String },
    Delete { pos: usize, len: usize },
}

/// A local edit the relay has not acknowledged yet.
#[derive(Debug, Clone)]
struct Pending {
    edit: LocalEdit,
    op: Operation,
}

#[derive(Debug, Clone)]
struct InFlight {
    envelope: SaveEnvelope,
    route: SaveRoute,
    /// `edit_seq` when the envelope was built.
    edit_seq: u64,
    deadline: Instant,
}

pub struct Coordinator {
    document_id: Uuid,
    name: String,
    session_id: Uuid,
    config: SyncConfig,
    replica: Replica,
    presence: PresenceStore,
    state: SaveState,
    dirty: bool,
    edit_seq: u64,
    in_flight: Option<InFlight>,
    debounce_at: Option<Instant>,
    status: SaveStatus,
    status_revert_at: Option<Instant>,
    connection: ConnectionStatus,
    malformed: HashMap<Uuid, u32>,
    conflict: Option<Conflict>,
    /// The replica shares the relay's history for this connection.
    synced: bool,
    journal: VecDeque<Pending>,
}

impl Coordinator {
    /// Seed from the loaded document.
    pub fn new(document: DocumentRecord, session_id: Uuid, identity: &Identity, config: SyncConfig) -> Self {
        let replica = Replica::seeded(session_id, &document.content);
        let mut presence = PresenceStore::new(session_id, config.presence_timeout, config.presence_throttle);
        presence.set_local(PresenceRecord::for_identity(session_id, identity), now_ms());

        Self {
            document_id: document.uuid,
            name: document.name,
            session_id,
            config,
            replica,
            presence,
            state: SaveState::Idle,
            dirty: false,
            edit_seq: 0,
            in_flight: None,
            debounce_at: None,
            status: SaveStatus::Idle,
            status_revert_at: None,
            connection: ConnectionStatus::Disconnected,
            malformed: HashMap::new(),
            conflict: None,
            synced: false,
            journal: VecDeque::new(),
        }
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn snapshot(&self) -> String {
        self.replica.snapshot()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn state(&self) -> &SaveState {
        &self.state
    }

    pub fn status(&self) -> &SaveStatus {
        &self.status
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn conflict(&self) -> Option<&Conflict> {
        self.conflict.as_ref()
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.connection
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Local edits not yet acknowledged by the relay.
    pub fn unacknowledged(&self) -> usize {
        self.journal.len()
    }

    pub fn in_flight(&self) -> Option<(&SaveEnvelope, SaveRoute)> {
        self.in_flight.as_ref().map(|f| (&f.envelope, f.route))
    }

    pub fn presence(&self) -> &PresenceStore {
        &self.presence
    }

    pub fn presence_mut(&mut self) -> &mut PresenceStore {
        &mut self.presence
    }

    pub fn join_frame(&self) -> ClientFrame {
        ClientFrame::Join {
            document_id: self.document_id,
            session_id: self.session_id,
        }
    }

    pub fn leave_frame(&self) -> ClientFrame {
        ClientFrame::Presence {
            session_id: self.session_id,
            record: None,
        }
    }

    /// Earliest instant at which [`tick`](Self::tick) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.in_flight.as_ref().map(|f| f.deadline),
            self.debounce_at,
            self.status_revert_at,
            self.presence.pending_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ─── Local input ─────────────────────────────────────────────

    pub fn local_insert(&mut self, pos: usize, text: &str, now: Instant) -> Result<Vec<Effect>, ConvergenceError> {
        let op = self.replica.apply_local_insert(pos, text)?;
        let edit = LocalEdit::Insert {
            pos,
            text: text.to_string(),
        };
        Ok(self.local_edit(edit, op, now))
    }

    pub fn local_delete(&mut self, pos: usize, len: usize, now: Instant) -> Result<Vec<Effect>, ConvergenceError> {
        let op = self.replica.apply_local_delete(pos, len)?;
        Ok(self.local_edit(LocalEdit::Delete { pos, len }, op, now))
    }

    fn local_edit(&mut self, edit: LocalEdit, op: Operation, now: Instant) -> Vec<Effect> {
        self.dirty = true;
        self.edit_seq += 1;
        if self.in_flight.is_none() {
            self.state = SaveState::Editing { dirty: true };
            self.debounce_at = Some(now + self.config.save_debounce);
        }
        self.journal.push_back(Pending { edit, op: op.clone() });
        if self.synced {
            vec![Effect::Send(ClientFrame::Op(op))]
        } else {
            log::debug!("Holding op {}:{} until the relay state arrives", op.origin, op.clock);
            Vec::new()
        }
    }

    pub fn set_cursor(&mut self, cursor: Option<Cursor>, now: Instant) -> Vec<Effect> {
        match self.presence.update_local_cursor(cursor, now, now_ms()) {
            Some(record) => vec![self.presence_frame(record)],
            None => Vec::new(),
        }
    }

    fn presence_frame(&self, record: PresenceRecord) -> Effect {
        Effect::Send(ClientFrame::Presence {
            session_id: self.session_id,
            record: Some(record),
        })
    }

    /// Start a save. Coalesces into the outstanding envelope if there is one.
    pub fn request_save(&mut self, manual: bool, now: Instant) -> Vec<Effect> {
        let origin = if manual { SaveOrigin::Manual } else { SaveOrigin::Auto };

        if self.in_flight.is_some() {
            log::debug!("Save ({origin:?}) coalesced into the outstanding envelope");
            return Vec::new();
        }
        if let Some(conflict) = &self.conflict {
            log::warn!("Save of {} blocked by an unresolved conflict", self.document_id);
            return vec![Effect::Conflict(conflict.clone())];
        }
        self.debounce_at = None;

        let connected = self.connection.is_connected();
        if !connected && !manual {
            log::debug!("Auto save deferred until reconnect");
            return Vec::new();
        }

        let envelope = SaveEnvelope {
            document_id: self.document_id,
            name: self.name.clone(),
            content: self.replica.snapshot(),
            origin_kind: origin,
        };
        let (route, effect) = if connected {
            let frame = ClientFrame::Update {
                name: envelope.name.clone(),
                content: envelope.content.clone(),
            };
            (SaveRoute::Duplex, Effect::Send(frame))
        } else {
            log::info!("Not connected, saving {} through the store", self.document_id);
            (SaveRoute::Rest, Effect::RestSave(envelope.clone()))
        };

        self.in_flight = Some(InFlight {
            envelope,
            route,
            edit_seq: self.edit_seq,
            deadline: now + self.config.save_timeout,
        });
        self.state = SaveState::SavePending(origin);

        let mut effects = vec![effect];
        self.set_status(SaveStatus::Saving, now, &mut effects);
        effects
    }

    /// Settle a pending conflict.
    pub fn resolve_conflict(&mut self, resolution: ConflictResolution, now: Instant) -> Vec<Effect> {
        let Some(conflict) = self.conflict.take() else {
            return Vec::new();
        };
        match resolution {
            ConflictResolution::KeepLocal => {
                log::info!("Conflict on {}: keeping local text", self.document_id);
                self.request_save(true, now)
            }
            ConflictResolution::TakeRemote => {
                log::info!("Conflict on {}: taking remote text", self.document_id);
                self.adopt(conflict.remote);
                vec![Effect::RemoteChange(self.replica.snapshot())]
            }
        }
    }

    /// Clear a success/error indicator now.
    pub fn dismiss_status(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        if matches!(self.status, SaveStatus::Success | SaveStatus::Error(_)) {
            self.settle_state();
            self.set_status(SaveStatus::Idle, now, &mut effects);
        }
        effects
    }

    // ─── Remote input ────────────────────────────────────────────

    pub fn on_connection(&mut self, status: ConnectionStatus, now: Instant) -> Vec<Effect> {
        let was = self.connection;
        self.connection = status;
        let mut effects = Vec::new();
        if !status.is_connected() {
            self.synced = false;
        }

        if status.is_connected() {
            if let Some(record) = self.presence.touch_local(now_ms()) {
                effects.push(self.presence_frame(record));
            }
            if self.dirty && self.in_flight.is_none() && self.conflict.is_none() {
                self.debounce_at = Some(now + self.config.save_debounce);
            }
        } else if was.is_connected() {
            let duplex = self.in_flight.as_ref().is_some_and(|f| f.route == SaveRoute::Duplex);
            if duplex {
                self.fail(SaveError::Transport("connection lost".into()), now, &mut effects);
            }
        }
        effects
    }

    pub fn handle_frame(&mut self, frame: ServerFrame, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        match frame {
            ServerFrame::Init { document } => {
                log::debug!("Joined {} ({} chars stored)", document.uuid, document.content.chars().count());
                self.name = document.name;
            }
            ServerFrame::Update { document, origin } => self.on_update(document, origin, now, &mut effects),
            ServerFrame::Op(op) => self.on_op(op, &mut effects),
            ServerFrame::Presence { session_id, record } => {
                self.presence.apply_remote(session_id, record, now_ms());
            }
            ServerFrame::Sync { state } => {
                let before = self.replica.snapshot();
                match self.replica.restore(state) {
                    Ok(()) => {
                        self.synced = true;
                        self.malformed.clear();
                        self.replay_journal(&mut effects);
                        self.after_remote_change(before, &mut effects);
                    }
                    Err(e) => log::warn!("Discarding sync state: {e}"),
                }
            }
            ServerFrame::Error { error, rejected } => {
                let duplex = self.in_flight.as_ref().is_some_and(|f| f.route == SaveRoute::Duplex);
                match rejected {
                    Some(id) => {
                        log::warn!("Relay rejected op {}:{} ({error}), requesting resync", id.site, id.clock);
                        self.journal.retain(|p| (p.op.origin, p.op.clock) != (id.site, id.clock));
                        effects.push(Effect::Send(ClientFrame::Resync));
                    }
                    None if duplex => self.fail(SaveError::Rejected(error), now, &mut effects),
                    None => {
                        log::warn!("Relay reported an error ({error}), requesting resync");
                        effects.push(Effect::Send(ClientFrame::Resync));
                    }
                }
            }
        }
        effects
    }

    fn on_update(&mut self, document: DocumentRecord, origin: Option<Uuid>, now: Instant, effects: &mut Vec<Effect>) {
        let confirms = self.in_flight.as_ref().is_some_and(|f| {
            f.route == SaveRoute::Duplex
                && (origin == Some(self.session_id) || document.content == f.envelope.content)
        });
        if confirms {
            self.name = document.name;
            self.confirm(now, effects);
            return;
        }

        match origin {
            Some(id) if id == self.session_id => log::debug!("Stale save echo ignored"),
            Some(id) => {
                log::debug!("Document {} persisted by {id}", document.uuid);
                self.name = document.name;
            }
            None => {
                if document.content == self.replica.snapshot() {
                    self.name = document.name;
                } else if !self.dirty && self.in_flight.is_none() {
                    log::info!("Document {} replaced remotely", document.uuid);
                    self.adopt(document);
                    effects.push(Effect::RemoteChange(self.replica.snapshot()));
                } else {
                    log::warn!("Remote write to {} conflicts with unsaved edits", document.uuid);
                    let conflict = Conflict {
                        local: self.replica.snapshot(),
                        remote: document,
                    };
                    self.conflict = Some(conflict.clone());
                    self.debounce_at = None;
                    effects.push(Effect::Conflict(conflict));
                }
            }
        }
    }

    fn on_op(&mut self, op: Operation, effects: &mut Vec<Effect>) {
        if op.origin == self.session_id {
            // Our own op back from the relay.
            if let Some(i) = self.journal.iter().position(|p| p.op.clock == op.clock) {
                self.journal.remove(i);
            }
            return;
        }
        let peer = op.origin;
        let before = self.replica.snapshot();
        match self.replica.apply_remote(op) {
            Ok(_) => self.after_remote_change(before, effects),
            Err(ConvergenceError::Backlog(n)) => {
                log::warn!("Deferred backlog full ({n}), requesting resync");
                effects.push(Effect::Send(ClientFrame::Resync));
            }
            Err(e) => {
                let count = self.malformed.entry(peer).or_insert(0);
                *count += 1;
                log::warn!("Dropped operation from {peer} ({count}): {e}");
                if *count >= self.config.malformed_threshold {
                    self.malformed.remove(&peer);
                    log::warn!("Too many malformed operations from {peer}, requesting resync");
                    effects.push(Effect::Send(ClientFrame::Resync));
                }
            }
        }
    }

    /// Reapply unacknowledged edits on top of freshly restored relay state.
    fn replay_journal(&mut self, effects: &mut Vec<Effect>) {
        let pending = std::mem::take(&mut self.journal);
        let mut rebased = 0;
        for entry in pending {
            if self.replica.contains(&entry.op) {
                continue;
            }
            if self.replica.is_ready(&entry.op) {
                match self.replica.apply_remote(entry.op.clone()) {
                    Ok(_) => {
                        effects.push(Effect::Send(ClientFrame::Op(entry.op.clone())));
                        self.journal.push_back(entry);
                    }
                    Err(e) => log::warn!("Dropping local op {}:{}: {e}", entry.op.origin, entry.op.clock),
                }
                continue;
            }

            let len = self.replica.len();
            let result = match &entry.edit {
                LocalEdit::Insert { pos, text } => self.replica.apply_local_insert((*pos).min(len), text).map(Some),
                LocalEdit::Delete { pos, .. } if *pos >= len => Ok(None),
                LocalEdit::Delete { pos, len: n } => self.replica.apply_local_delete(*pos, (*n).min(len - pos)).map(Some),
            };
            match result {
                Ok(Some(op)) => {
                    rebased += 1;
                    effects.push(Effect::Send(ClientFrame::Op(op.clone())));
                    self.journal.push_back(Pending { edit: entry.edit, op });
                }
                Ok(None) => log::debug!("Local delete past the end of the relay text dropped"),
                Err(e) => log::warn!("Could not rebase local edit: {e}"),
            }
        }
        if rebased > 0 {
            log::info!("Rebased {rebased} local edits onto the relay state of {}", self.document_id);
        }
    }

    fn after_remote_change(&mut self, before: String, effects: &mut Vec<Effect>) {
        if !self.dirty && self.in_flight.is_none() {
            self.state = SaveState::Idle;
        }
        let after = self.replica.snapshot();
        if after != before {
            effects.push(Effect::RemoteChange(after));
        }
    }

    /// Result of a [`Effect::RestSave`].
    pub fn on_rest_result(&mut self, result: Result<DocumentRecord, SaveError>, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.in_flight.as_ref().is_some_and(|f| f.route == SaveRoute::Rest) {
            log::debug!("REST save result with no REST save in flight");
            return effects;
        }
        match result {
            Ok(document) => {
                self.name = document.name;
                self.confirm(now, &mut effects);
            }
            Err(e) => self.fail(e, now, &mut effects),
        }
        effects
    }

    /// Periodic presence housekeeping: expire peers and refresh our record.
    pub fn presence_sweep(&mut self) -> Vec<Effect> {
        let now = now_ms();
        self.presence.sweep(now);
        match self.presence.touch_local(now) {
            Some(record) if self.connection.is_connected() => vec![self.presence_frame(record)],
            _ => Vec::new(),
        }
    }

    // ─── Timers ──────────────────────────────────────────────────

    pub fn tick(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.in_flight.as_ref().is_some_and(|f| now >= f.deadline) {
            log::warn!("Save of {} timed out", self.document_id);
            self.fail(SaveError::Timeout, now, &mut effects);
        }

        if self.debounce_at.is_some_and(|d| now >= d) {
            self.debounce_at = None;
            if self.connection.is_connected() {
                effects.extend(self.request_save(false, now));
            }
        }

        if self.status_revert_at.is_some_and(|d| now >= d) {
            self.status_revert_at = None;
            self.settle_state();
            self.set_status(SaveStatus::Idle, now, &mut effects);
        }

        if let Some(record) = self.presence.take_pending(now) {
            effects.push(self.presence_frame(record));
        }
        effects
    }

    // ─── Transitions ─────────────────────────────────────────────

    fn confirm(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        let Some(flight) = self.in_flight.take() else { return };
        if self.edit_seq > flight.edit_seq {
            self.state = SaveState::Editing { dirty: true };
            self.debounce_at = Some(now + self.config.save_debounce);
        } else {
            self.dirty = false;
            self.state = SaveState::SaveConfirmed;
        }
        log::debug!("Save of {} confirmed", self.document_id);
        self.set_status(SaveStatus::Success, now, effects);
    }

    fn fail(&mut self, error: SaveError, now: Instant, effects: &mut Vec<Effect>) {
        if self.in_flight.take().is_none() {
            return;
        }
        log::warn!("Save of {} failed: {error}", self.document_id);
        self.dirty = true;
        self.state = SaveState::SaveFailed(error.clone());
        self.set_status(SaveStatus::Error(error.to_string()), now, effects);
    }

    /// Leave a terminal save state once its indicator is gone. A failed save
    /// stays dirty but waits for the next edit or explicit save.
    fn settle_state(&mut self) {
        match self.state {
            SaveState::SaveConfirmed => self.state = SaveState::Idle,
            SaveState::SaveFailed(_) => self.state = SaveState::Editing { dirty: true },
            _ => {}
        }
    }

    fn adopt(&mut self, document: DocumentRecord) {
        self.replica.reset_to(&document.content);
        self.journal.clear();
        self.name = document.name;
        self.dirty = false;
        self.debounce_at = None;
        self.state = SaveState::Idle;
    }

    fn set_status(&mut self, status: SaveStatus, now: Instant, effects: &mut Vec<Effect>) {
        self.status_revert_at = match status {
            SaveStatus::Success | SaveStatus::Error(_) => Some(now + self.config.status_window),
            _ => None,
        };
        if self.status != status {
            self.status = status.clone();
            effects.push(Effect::Status(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn doc() -> DocumentRecord {
        DocumentRecord::new(Uuid::from_u128(7), "Notes", "hello")
    }

    /// Connected coordinators have also received the relay's state.
    fn coordinator(connected: bool) -> Coordinator {
        let mut c = Coordinator::new(doc(), Uuid::from_u128(1), &Identity::new("Ada"), SyncConfig::default());
        if connected {
            let now = Instant::now();
            c.on_connection(ConnectionStatus::Connected, now);
            let state = Replica::seeded(Uuid::nil(), "hello").state();
            assert!(c.handle_frame(ServerFrame::Sync { state }, now).is_empty());
        }
        c
    }

    fn sent_ops(effects: &[Effect]) -> Vec<Operation> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(ClientFrame::Op(op)) => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    fn sends_update(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Send(ClientFrame::Update { .. })))
            .count()
    }

    fn echo(c: &Coordinator, origin: Option<Uuid>) -> ServerFrame {
        let mut document = doc();
        document.content = c.in_flight().map(|(e, _)| e.content.clone()).unwrap_or_default();
        ServerFrame::Update { document, origin }
    }

    #[test]
    fn test_local_edit_arms_debounce() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        let effects = c.local_insert(5, "!", t0).unwrap();

        assert!(matches!(effects[0], Effect::Send(ClientFrame::Op(_))));
        assert_eq!(c.state(), &SaveState::Editing { dirty: true });
        assert_eq!(c.next_deadline(), Some(t0 + Duration::from_millis(600)));
        assert_eq!(c.snapshot(), "hello!");
    }

    #[test]
    fn test_debounce_resets_on_each_edit() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        c.local_insert(5, "a", t0).unwrap();
        c.local_insert(6, "b", t0 + Duration::from_millis(500)).unwrap();

        assert_eq!(sends_update(&c.tick(t0 + Duration::from_millis(700))), 0);
        let effects = c.tick(t0 + Duration::from_millis(1100));
        assert_eq!(sends_update(&effects), 1);
        assert!(effects.contains(&Effect::Status(SaveStatus::Saving)));
        assert_eq!(c.state(), &SaveState::SavePending(SaveOrigin::Auto));
    }

    #[test]
    fn test_auto_save_waits_for_connection() {
        let mut c = coordinator(false);
        let t0 = Instant::now();
        c.local_insert(0, "x", t0).unwrap();
        let effects = c.tick(t0 + Duration::from_secs(1));
        assert!(effects.is_empty());
        assert!(c.in_flight().is_none());
        assert!(c.is_dirty());

        let t1 = t0 + Duration::from_secs(2);
        let effects = c.on_connection(ConnectionStatus::Connected, t1);
        assert!(matches!(effects[0], Effect::Send(ClientFrame::Presence { record: Some(_), .. })));
        assert_eq!(sends_update(&c.tick(t1 + Duration::from_millis(600))), 1);
    }

    #[test]
    fn test_manual_saves_coalesce() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        c.local_insert(0, "x", t0).unwrap();

        let first = c.request_save(true, t0);
        let second = c.request_save(true, t0 + Duration::from_millis(10));
        assert_eq!(sends_update(&first), 1);
        assert!(second.is_empty());

        let frame = echo(&c, Some(c.session_id()));
        let effects = c.handle_frame(frame, t0 + Duration::from_millis(50));
        let successes = effects.iter().filter(|e| **e == Effect::Status(SaveStatus::Success)).count();
        assert_eq!(successes, 1);
        assert!(!c.is_dirty());
        assert_eq!(c.state(), &SaveState::SaveConfirmed);

        // Debounce was cancelled by the manual save.
        assert_eq!(sends_update(&c.tick(t0 + Duration::from_secs(1))), 0);
    }

    #[test]
    fn test_echo_matches_by_content() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        c.local_insert(0, "x", t0).unwrap();
        c.request_save(true, t0);

        let frame = echo(&c, None);
        c.handle_frame(frame, t0);
        assert_eq!(c.status(), &SaveStatus::Success);
        assert!(c.in_flight().is_none());
    }

    #[test]
    fn test_manual_save_falls_back_to_rest() {
        let mut c = coordinator(false);
        let t0 = Instant::now();
        c.local_insert(5, " world", t0).unwrap();

        let effects = c.request_save(true, t0);
        let envelope = match &effects[0] {
            Effect::RestSave(envelope) => envelope.clone(),
            other => panic!("expected REST save, got {other:?}"),
        };
        assert_eq!(envelope.content, "hello world");
        assert_eq!(envelope.origin_kind, SaveOrigin::Manual);
        assert_eq!(c.in_flight().map(|(_, r)| r), Some(SaveRoute::Rest));

        let stored = DocumentRecord::new(envelope.document_id, envelope.name, envelope.content);
        let effects = c.on_rest_result(Ok(stored), t0 + Duration::from_millis(100));
        assert_eq!(effects, vec![Effect::Status(SaveStatus::Success)]);
        assert!(!c.is_dirty());
    }

    #[test]
    fn test_error_frame_fails_save_and_keeps_edits() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        c.local_insert(0, ">", t0).unwrap();
        c.request_save(true, t0);

        let effects = c.handle_frame(ServerFrame::error("name required"), t0);
        assert!(matches!(&effects[0], Effect::Status(SaveStatus::Error(e)) if e.contains("name required")));
        assert_eq!(c.snapshot(), ">hello");
        assert!(c.is_dirty());
        assert!(matches!(c.state(), SaveState::SaveFailed(SaveError::Rejected(_))));

        // No automatic retry after a failure.
        assert_eq!(sends_update(&c.tick(t0 + Duration::from_secs(2))), 0);
    }

    #[test]
    fn test_save_timeout() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        c.local_insert(0, "x", t0).unwrap();
        c.request_save(true, t0);

        assert!(c.tick(t0 + Duration::from_secs(7)).is_empty());
        c.tick(t0 + Duration::from_secs(8));
        assert_eq!(c.state(), &SaveState::SaveFailed(SaveError::Timeout));
    }

    #[test]
    fn test_socket_loss_fails_duplex_save() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        c.local_insert(0, "x", t0).unwrap();
        c.request_save(false, t0);

        c.on_connection(ConnectionStatus::Disconnected, t0);
        assert!(matches!(c.state(), SaveState::SaveFailed(SaveError::Transport(_))));
        assert!(c.is_dirty());
    }

    #[test]
    fn test_edits_during_save_stay_dirty() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        c.local_insert(0, "a", t0).unwrap();
        c.request_save(true, t0);
        let frame = echo(&c, Some(c.session_id()));
        c.local_insert(1, "b", t0 + Duration::from_millis(10)).unwrap();

        let t1 = t0 + Duration::from_millis(20);
        c.handle_frame(frame, t1);
        assert_eq!(c.state(), &SaveState::Editing { dirty: true });
        assert!(c.is_dirty());
        assert_eq!(sends_update(&c.tick(t1 + Duration::from_millis(600))), 1);
    }

    #[test]
    fn test_status_reverts_after_window() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        c.local_insert(0, "x", t0).unwrap();
        c.request_save(true, t0);
        let frame = echo(&c, Some(c.session_id()));
        c.handle_frame(frame, t0);

        assert!(c.tick(t0 + Duration::from_millis(2900)).is_empty());
        let effects = c.tick(t0 + Duration::from_secs(3));
        assert_eq!(effects, vec![Effect::Status(SaveStatus::Idle)]);
        assert_eq!(c.state(), &SaveState::Idle);
    }

    #[test]
    fn test_dismiss_status() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        c.local_insert(0, "x", t0).unwrap();
        c.request_save(true, t0);
        c.handle_frame(ServerFrame::error("nope"), t0);
        assert_eq!(c.dismiss_status(t0), vec![Effect::Status(SaveStatus::Idle)]);
        assert_eq!(c.state(), &SaveState::Editing { dirty: true });
        assert!(c.dismiss_status(t0).is_empty());
    }

    #[test]
    fn test_failed_save_settles_to_editing() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        c.local_insert(0, "x", t0).unwrap();
        c.request_save(true, t0);
        c.handle_frame(ServerFrame::error("disk full"), t0);
        assert!(matches!(c.state(), SaveState::SaveFailed(_)));

        let effects = c.tick(t0 + Duration::from_secs(10));
        assert_eq!(effects, vec![Effect::Status(SaveStatus::Idle)]);
        assert_eq!(c.state(), &SaveState::Editing { dirty: true });
        assert!(c.is_dirty());

        // The next edit arms a fresh auto save.
        let t1 = t0 + Duration::from_secs(11);
        c.local_insert(0, "y", t1).unwrap();
        assert_eq!(sends_update(&c.tick(t1 + Duration::from_millis(600))), 1);
    }

    #[test]
    fn test_rejected_op_during_save_resyncs() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        let op = sent_ops(&c.local_insert(0, "x", t0).unwrap()).remove(0);
        c.request_save(true, t0);

        let frame = ServerFrame::op_rejected(&op, "Malformed operation: zero clock");
        let effects = c.handle_frame(frame, t0);
        assert_eq!(effects, vec![Effect::Send(ClientFrame::Resync)]);
        assert_eq!(c.state(), &SaveState::SavePending(SaveOrigin::Manual));
        assert!(c.in_flight().is_some());
        assert_eq!(c.unacknowledged(), 0);

        // The save itself still completes.
        let frame = echo(&c, Some(c.session_id()));
        c.handle_frame(frame, t0);
        assert_eq!(c.status(), &SaveStatus::Success);
    }

    #[test]
    fn test_remote_op_merges_and_settles_idle() {
        let mut c = coordinator(true);
        let mut peer = Replica::seeded(Uuid::from_u128(2), "hello");
        let op = peer.apply_local_insert(0, "Y").unwrap();

        let effects = c.handle_frame(ServerFrame::Op(op), Instant::now());
        assert_eq!(effects, vec![Effect::RemoteChange("Yhello".into())]);
        assert_eq!(c.state(), &SaveState::Idle);
        assert!(!c.is_dirty());
    }

    #[test]
    fn test_remote_op_while_dirty_keeps_editing() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        c.local_insert(5, "!", t0).unwrap();
        let mut peer = Replica::seeded(Uuid::from_u128(2), "hello");
        let op = peer.apply_local_insert(0, "Y").unwrap();

        c.handle_frame(ServerFrame::Op(op), t0);
        assert_eq!(c.snapshot(), "Yhello!");
        assert_eq!(c.state(), &SaveState::Editing { dirty: true });
    }

    #[test]
    fn test_foreign_update_is_persistence_notice() {
        let mut c = coordinator(true);
        let mut document = doc();
        document.content = "something else".into();
        let effects = c.handle_frame(
            ServerFrame::Update {
                document,
                origin: Some(Uuid::from_u128(2)),
            },
            Instant::now(),
        );
        assert!(effects.is_empty());
        assert_eq!(c.snapshot(), "hello");
    }

    #[test]
    fn test_out_of_band_update_when_clean() {
        let mut c = coordinator(true);
        let mut document = doc();
        document.content = "rewritten".into();
        let effects = c.handle_frame(ServerFrame::Update { document, origin: None }, Instant::now());
        assert_eq!(effects, vec![Effect::RemoteChange("rewritten".into())]);
        assert_eq!(c.snapshot(), "rewritten");
    }

    #[test]
    fn test_out_of_band_update_when_dirty_conflicts() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        c.local_insert(5, " local", t0).unwrap();
        let mut document = doc();
        document.content = "remote".into();

        let effects = c.handle_frame(ServerFrame::Update { document, origin: None }, t0);
        assert!(matches!(&effects[0], Effect::Conflict(conflict) if conflict.local == "hello local"));
        assert_eq!(c.snapshot(), "hello local");

        // Saves are held until the conflict is settled.
        assert!(matches!(c.request_save(true, t0)[0], Effect::Conflict(_)));
        assert_eq!(sends_update(&c.tick(t0 + Duration::from_secs(1))), 0);

        let effects = c.resolve_conflict(ConflictResolution::TakeRemote, t0);
        assert_eq!(effects, vec![Effect::RemoteChange("remote".into())]);
        assert!(!c.is_dirty());
        assert!(c.conflict().is_none());
    }

    #[test]
    fn test_keep_local_saves_over_remote() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        c.local_insert(5, "!", t0).unwrap();
        let mut document = doc();
        document.content = "remote".into();
        c.handle_frame(ServerFrame::Update { document, origin: None }, t0);

        let effects = c.resolve_conflict(ConflictResolution::KeepLocal, t0);
        assert!(effects.contains(&Effect::Send(ClientFrame::Update {
            name: "Notes".into(),
            content: "hello!".into(),
        })));
    }

    #[test]
    fn test_malformed_threshold_requests_resync() {
        let mut c = coordinator(true);
        let peer = Uuid::from_u128(9);
        let t0 = Instant::now();
        for i in 0..4 {
            let effects = c.handle_frame(ServerFrame::Op(Operation::insert(peer, 0, None, "x")), t0);
            assert!(effects.is_empty(), "resync too early at {i}");
        }
        let effects = c.handle_frame(ServerFrame::Op(Operation::insert(peer, 0, None, "x")), t0);
        assert_eq!(effects, vec![Effect::Send(ClientFrame::Resync)]);
        assert_eq!(c.snapshot(), "hello");
    }

    #[test]
    fn test_error_without_save_requests_resync() {
        let mut c = coordinator(true);
        let effects = c.handle_frame(ServerFrame::error("bad op"), Instant::now());
        assert_eq!(effects, vec![Effect::Send(ClientFrame::Resync)]);
    }

    #[test]
    fn test_sync_restores_authoritative_state() {
        let mut c = coordinator(true);
        let mut relay = Replica::seeded(Uuid::from_u128(3), "hello");
        relay.apply_local_insert(5, " there").unwrap();

        let effects = c.handle_frame(ServerFrame::Sync { state: relay.state() }, Instant::now());
        assert_eq!(effects, vec![Effect::RemoteChange("hello there".into())]);
    }

    #[test]
    fn test_sync_replays_held_edits() {
        let mut c = coordinator(false);
        let t0 = Instant::now();
        assert!(c.local_insert(0, ">", t0).unwrap().is_empty());
        let mut relay = Replica::seeded(Uuid::from_u128(3), "hello");
        relay.apply_local_insert(5, "?").unwrap();

        let effects = c.handle_frame(ServerFrame::Sync { state: relay.state() }, t0);
        assert_eq!(c.snapshot(), ">hello?");
        let sent = sent_ops(&effects);
        assert_eq!(sent.len(), 1);
        assert!(relay.is_ready(&sent[0]));
    }

    #[test]
    fn test_edit_before_sync_rebases_onto_relay_history() {
        let mut document = doc();
        document.content = "Xabc".into();
        let mut c = Coordinator::new(document, Uuid::from_u128(1), &Identity::new("Bob"), SyncConfig::default());
        let t0 = Instant::now();
        c.on_connection(ConnectionStatus::Connected, t0);

        // Typed before the relay state arrived.
        assert!(c.local_insert(4, "!", t0).unwrap().is_empty());
        assert_eq!(c.unacknowledged(), 1);

        // The relay reached "Xabc" from "abc", so its ids differ from ours.
        let mut relay = Replica::seeded(Uuid::nil(), "abc");
        relay.apply_local_insert(0, "X").unwrap();
        let effects = c.handle_frame(ServerFrame::Sync { state: relay.state() }, t0);

        assert_eq!(c.snapshot(), "Xabc!");
        assert!(c.is_synced());
        let sent = sent_ops(&effects);
        assert_eq!(sent.len(), 1);
        relay.apply_remote(sent[0].clone()).unwrap();
        assert_eq!(relay.snapshot(), "Xabc!");
        assert_eq!(relay.deferred_len(), 0);
    }

    #[test]
    fn test_unacknowledged_ops_resent_after_reconnect() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        let first = sent_ops(&c.local_insert(5, "!", t0).unwrap());
        let second = sent_ops(&c.local_insert(6, "?", t0).unwrap());
        assert_eq!((first.len(), second.len()), (1, 1));

        // The link drops before the relay saw either op; the next edit is held.
        c.on_connection(ConnectionStatus::Disconnected, t0);
        assert!(!c.is_synced());
        assert!(sent_ops(&c.local_delete(0, 1, t0).unwrap()).is_empty());
        assert_eq!(c.unacknowledged(), 3);

        c.on_connection(ConnectionStatus::Connected, t0);
        let mut relay = Replica::seeded(Uuid::nil(), "hello");
        relay.apply_remote(first[0].clone()).unwrap();
        let effects = c.handle_frame(ServerFrame::Sync { state: relay.state() }, t0);

        assert_eq!(c.snapshot(), "ello!?");
        let resent = sent_ops(&effects);
        assert_eq!(resent.len(), 2);
        assert_eq!(resent[0], second[0]);
        for op in resent {
            relay.apply_remote(op.clone()).unwrap();
            c.handle_frame(ServerFrame::Op(op), t0);
        }
        assert_eq!(relay.snapshot(), "ello!?");
        assert_eq!(c.unacknowledged(), 0);
    }

    #[test]
    fn test_own_op_echo_is_acknowledgement() {
        let mut c = coordinator(true);
        let t0 = Instant::now();
        let a = sent_ops(&c.local_insert(5, "a", t0).unwrap()).remove(0);
        let b = sent_ops(&c.local_insert(6, "b", t0).unwrap()).remove(0);

        let effects = c.handle_frame(ServerFrame::Op(b.clone()), t0);
        assert!(effects.is_empty());
        assert_eq!(c.unacknowledged(), 1);
        c.handle_frame(ServerFrame::Op(a.clone()), t0);
        assert_eq!(c.unacknowledged(), 0);

        // A later sync that already holds the ops resends nothing.
        let mut relay = Replica::seeded(Uuid::nil(), "hello");
        relay.apply_remote(a).unwrap();
        relay.apply_remote(b).unwrap();
        let effects = c.handle_frame(ServerFrame::Sync { state: relay.state() }, t0);
        assert!(effects.is_empty());
        assert_eq!(c.snapshot(), "helloab");
    }

    #[test]
    fn test_presence_frames_feed_store() {
        let mut c = coordinator(true);
        let peer = Uuid::from_u128(5);
        let record = PresenceRecord::for_identity(peer, &Identity::new("Bob"));
        c.handle_frame(ServerFrame::Presence { session_id: peer, record: Some(record) }, Instant::now());
        assert_eq!(c.presence_mut().get_all(now_ms()).len(), 2);

        c.handle_frame(ServerFrame::Presence { session_id: peer, record: None }, Instant::now());
        assert_eq!(c.presence_mut().get_all(now_ms()).len(), 1);
    }

    #[test]
    fn test_cursor_update_sends_presence() {
        let mut c = coordinator(true);
        let effects = c.set_cursor(Some(Cursor::caret(2)), Instant::now());
        assert!(matches!(
            &effects[0],
            Effect::Send(ClientFrame::Presence { record: Some(r), .. }) if r.cursor == Some(Cursor::caret(2))
        ));
    }
}
