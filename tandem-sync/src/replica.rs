//! Replicated text buffer (RGA) shared by every session in a room.
//!
//! Every character carries a [`CharId`] `{site, clock}` and remembers the id
//! of its left neighbour at insertion time (its *anchor*). Deleted characters
//! stay in the list as tombstones so that late or repeated deletes are no-ops.
//!
//! ```text
//!   anchor ──► [ X(4,a) ][ Y(4,b) ][ c(3,seed) ] ...
//!               siblings sorted: higher clock first,
//!               equal clocks by origin id ascending
//! ```
//!
//! Convergence: any two replicas that integrated the same set of operations,
//! in any order, hold identical element lists.
//!
//! Reference: Roh et al., Replicated abstract data types (RGA), 2011

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Upper bound on operations parked while waiting for their dependencies.
pub const MAX_DEFERRED: usize = 4096;

/// Identity of a single replicated character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharId {
    pub site: Uuid,
    pub clock: u64,
}

impl CharId {
    pub fn new(site: Uuid, clock: u64) -> Self {
        Self { site, clock }
    }

    /// Whether `self` sorts before `other` when both share an anchor.
    ///
    /// Causally later inserts carry a higher clock and land nearer the anchor;
    /// concurrent inserts with equal clocks order by origin id ascending.
    #[inline]
    fn outranks(&self, other: &CharId) -> bool {
        self.clock > other.clock || (self.clock == other.clock && self.site < other.site)
    }
}

/// A run of consecutive ids minted by one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdSpan {
    pub site: Uuid,
    pub clock: u64,
    pub len: u64,
}

impl IdSpan {
    fn ids(&self) -> impl Iterator<Item = CharId> + '_ {
        (self.clock..self.clock + self.len).map(move |c| CharId::new(self.site, c))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Delete,
}

/// Operation body: inserted text, or the ids removed by a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpPayload {
    Text(String),
    Spans(Vec<IdSpan>),
}

/// One causal edit, broadcast once and idempotent on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Session that produced the edit.
    pub origin: Uuid,
    /// Origin's Lamport counter for the first affected element.
    pub clock: u64,
    pub kind: OpKind,
    /// Left neighbour of an insert (`None` = document start). Unused by deletes.
    pub position: Option<CharId>,
    pub payload: OpPayload,
}

impl Operation {
    pub fn insert(origin: Uuid, clock: u64, position: Option<CharId>, text: impl Into<String>) -> Self {
        Self {
            origin,
            clock,
            kind: OpKind::Insert,
            position,
            payload: OpPayload::Text(text.into()),
        }
    }

    pub fn delete(origin: Uuid, clock: u64, spans: Vec<IdSpan>) -> Self {
        Self {
            origin,
            clock,
            kind: OpKind::Delete,
            position: None,
            payload: OpPayload::Spans(spans),
        }
    }

    /// Structural validation. Dependencies are checked at integration time.
    pub fn validate(&self) -> Result<(), ConvergenceError> {
        if self.clock == 0 {
            return Err(ConvergenceError::Malformed("zero clock".into()));
        }
        match (&self.kind, &self.payload) {
            (OpKind::Insert, OpPayload::Text(text)) => {
                if text.is_empty() {
                    return Err(ConvergenceError::Malformed("empty insert".into()));
                }
                let n = text.chars().count() as u64;
                if self.clock.checked_add(n).is_none() {
                    return Err(ConvergenceError::Malformed("clock overflow".into()));
                }
                if matches!(self.position, Some(anchor) if anchor.clock == 0) {
                    return Err(ConvergenceError::Malformed("anchor with zero clock".into()));
                }
                Ok(())
            }
            (OpKind::Delete, OpPayload::Spans(spans)) => {
                if self.position.is_some() {
                    return Err(ConvergenceError::Malformed("delete with position".into()));
                }
                if spans.is_empty() {
                    return Err(ConvergenceError::Malformed("empty delete".into()));
                }
                for span in spans {
                    if span.len == 0 || span.clock == 0 || span.clock.checked_add(span.len).is_none() {
                        return Err(ConvergenceError::Malformed(format!("bad span {span:?}")));
                    }
                }
                Ok(())
            }
            (kind, _) => Err(ConvergenceError::Malformed(format!("{kind:?} with mismatched payload"))),
        }
    }
}

/// A replicated character; `deleted` marks a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: CharId,
    pub anchor: Option<CharId>,
    pub ch: char,
    pub deleted: bool,
}

/// Complete replica contents, tombstones included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub clock: u64,
    pub elements: Vec<Element>,
}

impl ReplicaState {
    pub fn visible_text(&self) -> String {
        self.elements.iter().filter(|e| !e.deleted).map(|e| e.ch).collect()
    }
}

/// Result of applying a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Integrated into the text.
    Integrated,
    /// Already applied; nothing changed.
    Duplicate,
    /// Parked until its anchor or delete targets arrive.
    Deferred,
}

enum Readiness {
    Integrated,
    Duplicate,
    Missing,
}

/// Errors raised by the replica. Never fatal; remote ones trigger a resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceError {
    OutOfBounds { pos: usize, len: usize },
    EmptyEdit,
    Malformed(String),
    Backlog(usize),
    Encoding(String),
}

impl std::fmt::Display for ConvergenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds { pos, len } => write!(f, "Position {pos} out of bounds (len {len})"),
            Self::EmptyEdit => write!(f, "Empty edit"),
            Self::Malformed(e) => write!(f, "Malformed operation: {e}"),
            Self::Backlog(n) => write!(f, "Deferred operation backlog full ({n})"),
            Self::Encoding(e) => write!(f, "Replica state encoding error: {e}"),
        }
    }
}

impl std::error::Error for ConvergenceError {}

/// Site id that owns the characters of a seeded document.
///
/// Derived from the content (FNV-1a), so every party seeding from the same
/// text mints the same element ids.
pub fn seed_site(text: &str) -> Uuid {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    Uuid::from_u64_pair(hash, text.len() as u64)
}

/// The local copy of the shared text.
#[derive(Debug, Clone)]
pub struct Replica {
    site: Uuid,
    /// Lamport clock: highest counter seen or minted.
    clock: u64,
    elements: Vec<Element>,
    ids: HashSet<CharId>,
    deferred: VecDeque<Operation>,
    /// Number of integrated operations.
    version: u64,
    local_since_sync: u64,
}

impl Replica {
    /// Empty replica for the given session.
    pub fn new(site: Uuid) -> Self {
        Self {
            site,
            clock: 0,
            elements: Vec::new(),
            ids: HashSet::new(),
            deferred: VecDeque::new(),
            version: 0,
            local_since_sync: 0,
        }
    }

    /// Replica whose initial text is attributed to [`seed_site`].
    pub fn seeded(site: Uuid, text: &str) -> Self {
        let mut replica = Self::new(site);
        replica.install_seed(text);
        replica
    }

    fn install_seed(&mut self, text: &str) {
        let seed = seed_site(text);
        let mut anchor = None;
        self.elements.clear();
        self.ids.clear();
        for (i, ch) in text.chars().enumerate() {
            let id = CharId::new(seed, i as u64 + 1);
            self.elements.push(Element { id, anchor, ch, deleted: false });
            self.ids.insert(id);
            anchor = Some(id);
        }
        self.clock = self.clock.max(self.elements.len() as u64);
    }

    pub fn site(&self) -> Uuid {
        self.site
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Local operations minted since the last restore/merge.
    pub fn local_ops_since_sync(&self) -> u64 {
        self.local_since_sync
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.elements.iter().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current visible text.
    pub fn snapshot(&self) -> String {
        self.elements.iter().filter(|e| !e.deleted).map(|e| e.ch).collect()
    }

    fn nth_visible(&self, n: usize) -> Option<usize> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.deleted)
            .nth(n)
            .map(|(i, _)| i)
    }

    fn index_of(&self, id: &CharId) -> Option<usize> {
        self.elements.iter().position(|e| e.id == *id)
    }

    /// Insert `text` before visible position `pos`.
    pub fn apply_local_insert(&mut self, pos: usize, text: &str) -> Result<Operation, ConvergenceError> {
        if text.is_empty() {
            return Err(ConvergenceError::EmptyEdit);
        }
        let len = self.len();
        if pos > len {
            return Err(ConvergenceError::OutOfBounds { pos, len });
        }
        let anchor = match pos {
            0 => None,
            _ => self.nth_visible(pos - 1).map(|i| self.elements[i].id),
        };

        let op = Operation::insert(self.site, self.clock + 1, anchor, text);
        self.integrate_insert(&op, text);
        self.local_since_sync += 1;
        Ok(op)
    }

    /// Delete `len` visible characters starting at `pos`.
    pub fn apply_local_delete(&mut self, pos: usize, len: usize) -> Result<Operation, ConvergenceError> {
        if len == 0 {
            return Err(ConvergenceError::EmptyEdit);
        }
        let visible = self.len();
        if pos.checked_add(len).map_or(true, |end| end > visible) {
            return Err(ConvergenceError::OutOfBounds { pos: pos.saturating_add(len), len: visible });
        }

        let mut spans: Vec<IdSpan> = Vec::new();
        for element in self.elements.iter_mut().filter(|e| !e.deleted).skip(pos).take(len) {
            element.deleted = true;
            let id = element.id;
            match spans.last_mut() {
                Some(span) if span.site == id.site && span.clock + span.len == id.clock => span.len += 1,
                _ => spans.push(IdSpan { site: id.site, clock: id.clock, len: 1 }),
            }
        }

        self.clock += 1;
        self.version += 1;
        self.local_since_sync += 1;
        Ok(Operation::delete(self.site, self.clock, spans))
    }

    /// Apply an operation received from another session.
    pub fn apply_remote(&mut self, op: Operation) -> Result<ApplyOutcome, ConvergenceError> {
        op.validate()?;
        match self.try_apply(&op) {
            Readiness::Duplicate => Ok(ApplyOutcome::Duplicate),
            Readiness::Missing => {
                if self.deferred.len() >= MAX_DEFERRED {
                    return Err(ConvergenceError::Backlog(self.deferred.len()));
                }
                log::debug!("Deferring op {}:{} until dependencies arrive", op.origin, op.clock);
                self.deferred.push_back(op);
                Ok(ApplyOutcome::Deferred)
            }
            Readiness::Integrated => {
                self.drain_deferred();
                Ok(ApplyOutcome::Integrated)
            }
        }
    }

    /// Whether every element `op` refers to is present.
    pub fn is_ready(&self, op: &Operation) -> bool {
        match &op.payload {
            OpPayload::Text(_) => op.position.map_or(true, |anchor| self.ids.contains(&anchor)),
            OpPayload::Spans(spans) => spans.iter().all(|s| s.ids().all(|id| self.ids.contains(&id))),
        }
    }

    /// Whether the effect of `op` is already part of this replica.
    pub fn contains(&self, op: &Operation) -> bool {
        match &op.payload {
            OpPayload::Text(_) => self.ids.contains(&CharId::new(op.origin, op.clock)),
            OpPayload::Spans(spans) => {
                let targets: HashSet<CharId> = spans.iter().flat_map(|s| s.ids()).collect();
                targets.iter().all(|id| self.ids.contains(id))
                    && self.elements.iter().all(|e| e.deleted || !targets.contains(&e.id))
            }
        }
    }

    fn try_apply(&mut self, op: &Operation) -> Readiness {
        match &op.payload {
            OpPayload::Text(text) => {
                if self.ids.contains(&CharId::new(op.origin, op.clock)) {
                    return Readiness::Duplicate;
                }
                if let Some(anchor) = op.position {
                    if !self.ids.contains(&anchor) {
                        return Readiness::Missing;
                    }
                }
                self.integrate_insert(op, text);
                Readiness::Integrated
            }
            OpPayload::Spans(spans) => {
                let all_known = spans.iter().all(|s| s.ids().all(|id| self.ids.contains(&id)));
                if !all_known {
                    return Readiness::Missing;
                }
                let targets: HashSet<CharId> = spans.iter().flat_map(|s| s.ids()).collect();
                let mut changed = false;
                for element in self.elements.iter_mut() {
                    if !element.deleted && targets.contains(&element.id) {
                        element.deleted = true;
                        changed = true;
                    }
                }
                self.clock = self.clock.max(op.clock);
                if changed {
                    self.version += 1;
                    Readiness::Integrated
                } else {
                    Readiness::Duplicate
                }
            }
        }
    }

    fn integrate_insert(&mut self, op: &Operation, text: &str) {
        let mut anchor = op.position;
        let mut idx = match anchor {
            Some(a) => self.index_of(&a).map_or(0, |i| i + 1),
            None => 0,
        };
        let mut last = op.clock;
        for (k, ch) in text.chars().enumerate() {
            let id = CharId::new(op.origin, op.clock + k as u64);
            while idx < self.elements.len() && self.elements[idx].id.outranks(&id) {
                idx += 1;
            }
            self.elements.insert(idx, Element { id, anchor, ch, deleted: false });
            self.ids.insert(id);
            anchor = Some(id);
            idx += 1;
            last = id.clock;
        }
        self.clock = self.clock.max(last);
        self.version += 1;
    }

    fn drain_deferred(&mut self) {
        loop {
            let mut progressed = false;
            for _ in 0..self.deferred.len() {
                let Some(op) = self.deferred.pop_front() else { break };
                match self.try_apply(&op) {
                    Readiness::Integrated => progressed = true,
                    Readiness::Duplicate => {}
                    Readiness::Missing => self.deferred.push_back(op),
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Full state for transfer or local persistence.
    pub fn state(&self) -> ReplicaState {
        ReplicaState {
            clock: self.clock,
            elements: self.elements.clone(),
        }
    }

    /// Replace the contents with `state`.
    ///
    /// The local clock never moves backwards so ids minted before the restore
    /// are not reused.
    pub fn restore(&mut self, state: ReplicaState) -> Result<(), ConvergenceError> {
        let mut ids = HashSet::with_capacity(state.elements.len());
        for element in &state.elements {
            if !ids.insert(element.id) {
                return Err(ConvergenceError::Malformed(format!("duplicate id {:?}", element.id)));
            }
        }
        self.clock = self.clock.max(state.clock);
        self.elements = state.elements;
        self.ids = ids;
        self.local_since_sync = 0;
        self.version += 1;
        self.drain_deferred();
        Ok(())
    }

    /// Union `state` into this replica, keeping local elements the state lacks.
    pub fn merge_state(&mut self, state: ReplicaState) -> Result<(), ConvergenceError> {
        for element in state.elements {
            if !self.ids.contains(&element.id) {
                let op = Operation::insert(element.id.site, element.id.clock, element.anchor, element.ch.to_string());
                op.validate()?;
                if let Readiness::Missing = self.try_apply(&op) {
                    self.deferred.push_back(op);
                }
            }
            if element.deleted {
                if let Some(i) = self.index_of(&element.id) {
                    self.elements[i].deleted = true;
                }
            }
        }
        self.clock = self.clock.max(state.clock);
        self.local_since_sync = 0;
        self.drain_deferred();
        Ok(())
    }

    /// Drop all history and reseed from `text`.
    pub fn reset_to(&mut self, text: &str) {
        self.deferred.clear();
        self.install_seed(text);
        self.local_since_sync = 0;
        self.version += 1;
    }

    /// Binary snapshot (bincode).
    pub fn encode_state(&self) -> Result<Vec<u8>, ConvergenceError> {
        bincode::serde::encode_to_vec(self.state(), bincode::config::standard())
            .map_err(|e| ConvergenceError::Encoding(e.to_string()))
    }

    pub fn decode_state(bytes: &[u8]) -> Result<ReplicaState, ConvergenceError> {
        let (state, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ConvergenceError::Encoding(e.to_string()))?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn permutations(items: &[Operation]) -> Vec<Vec<Operation>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_local_insert_and_snapshot() {
        let mut r = Replica::new(site(1));
        r.apply_local_insert(0, "hello").unwrap();
        r.apply_local_insert(5, " world").unwrap();
        assert_eq!(r.snapshot(), "hello world");
        assert_eq!(r.len(), 11);
    }

    #[test]
    fn test_insert_at_front_preserves_typing_order() {
        let mut r = Replica::new(site(1));
        r.apply_local_insert(0, "a").unwrap();
        r.apply_local_insert(0, "b").unwrap();
        r.apply_local_insert(1, "c").unwrap();
        assert_eq!(r.snapshot(), "bca");
    }

    #[test]
    fn test_local_delete_produces_spans() {
        let mut r = Replica::seeded(site(1), "abcdef");
        let op = r.apply_local_delete(1, 3).unwrap();
        assert_eq!(r.snapshot(), "aef");
        match op.payload {
            OpPayload::Spans(spans) => {
                assert_eq!(spans.len(), 1);
                assert_eq!(spans[0].len, 3);
                assert_eq!(spans[0].clock, 2);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_local_bounds_checked() {
        let mut r = Replica::seeded(site(1), "abc");
        assert_eq!(
            r.apply_local_insert(4, "x"),
            Err(ConvergenceError::OutOfBounds { pos: 4, len: 3 })
        );
        assert!(r.apply_local_delete(2, 2).is_err());
        assert_eq!(r.apply_local_insert(0, ""), Err(ConvergenceError::EmptyEdit));
        assert_eq!(r.apply_local_delete(0, 0), Err(ConvergenceError::EmptyEdit));
        assert_eq!(r.snapshot(), "abc");
    }

    #[test]
    fn test_remote_insert_applies() {
        let mut a = Replica::seeded(site(1), "ac");
        let mut b = Replica::seeded(site(2), "ac");
        let op = a.apply_local_insert(1, "b").unwrap();
        assert_eq!(b.apply_remote(op).unwrap(), ApplyOutcome::Integrated);
        assert_eq!(b.snapshot(), "abc");
    }

    #[test]
    fn test_idempotent_replay() {
        let mut a = Replica::seeded(site(1), "hello");
        let mut b = Replica::seeded(site(2), "hello");
        let ins = a.apply_local_insert(5, "!").unwrap();
        let del = a.apply_local_delete(0, 1).unwrap();

        b.apply_remote(ins.clone()).unwrap();
        b.apply_remote(del.clone()).unwrap();
        let once = b.snapshot();

        assert_eq!(b.apply_remote(ins).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(b.apply_remote(del).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(b.snapshot(), once);
        assert_eq!(once, "ello!");
    }

    #[test]
    fn test_concurrent_inserts_tie_break_by_origin() {
        let mut a = Replica::seeded(site(1), "doc");
        let mut b = Replica::seeded(site(2), "doc");
        let x = a.apply_local_insert(0, "X").unwrap();
        let y = b.apply_local_insert(0, "Y").unwrap();
        a.apply_remote(y).unwrap();
        b.apply_remote(x).unwrap();
        assert_eq!(a.snapshot(), "XYdoc");
        assert_eq!(b.snapshot(), "XYdoc");
    }

    #[test]
    fn test_concurrent_delete_same_range() {
        let mut a = Replica::seeded(site(1), "abcdef");
        let mut b = Replica::seeded(site(2), "abcdef");
        let da = a.apply_local_delete(1, 3).unwrap();
        let db = b.apply_local_delete(2, 3).unwrap();
        a.apply_remote(db).unwrap();
        b.apply_remote(da).unwrap();
        assert_eq!(a.snapshot(), "af");
        assert_eq!(b.snapshot(), "af");
    }

    #[test]
    fn test_convergence_all_orderings() {
        let seed = "ab";
        let mut a = Replica::seeded(site(1), seed);
        let mut b = Replica::seeded(site(2), seed);
        let mut c = Replica::seeded(site(3), seed);

        let a1 = a.apply_local_insert(0, "X").unwrap();
        let a2 = a.apply_local_insert(1, "Z").unwrap(); // depends on a1
        let b1 = b.apply_local_insert(0, "Y").unwrap();
        let c1 = c.apply_local_delete(0, 1).unwrap();
        let c2 = c.apply_local_insert(1, "Q").unwrap();

        let ops = vec![a1, a2, b1, c1, c2];
        let mut expected: Option<String> = None;
        for order in permutations(&ops) {
            let mut r = Replica::seeded(site(9), seed);
            for op in order {
                r.apply_remote(op).unwrap();
            }
            assert_eq!(r.deferred_len(), 0);
            let text = r.snapshot();
            match &expected {
                Some(e) => assert_eq!(&text, e),
                None => expected = Some(text),
            }
        }
        let text = expected.unwrap();
        assert_eq!(text.chars().count(), 5);
        assert!(!text.contains('a'));
    }

    #[test]
    fn test_delete_before_insert_is_deferred() {
        let mut a = Replica::new(site(1));
        let mut b = Replica::new(site(2));
        let ins = a.apply_local_insert(0, "hi").unwrap();
        let del = a.apply_local_delete(0, 1).unwrap();

        assert_eq!(b.apply_remote(del).unwrap(), ApplyOutcome::Deferred);
        assert_eq!(b.deferred_len(), 1);
        assert_eq!(b.apply_remote(ins).unwrap(), ApplyOutcome::Integrated);
        assert_eq!(b.deferred_len(), 0);
        assert_eq!(b.snapshot(), "i");
    }

    #[test]
    fn test_malformed_ops_rejected_without_corruption() {
        let mut r = Replica::seeded(site(1), "abc");
        let zero = Operation::insert(site(2), 0, None, "x");
        let empty = Operation::insert(site(2), 1, None, "");
        let mismatched = Operation {
            origin: site(2),
            clock: 5,
            kind: OpKind::Delete,
            position: None,
            payload: OpPayload::Text("x".into()),
        };
        let empty_span = Operation::delete(site(2), 3, vec![IdSpan { site: site(2), clock: 1, len: 0 }]);

        for op in [zero, empty, mismatched, empty_span] {
            assert!(matches!(r.apply_remote(op), Err(ConvergenceError::Malformed(_))));
        }
        assert_eq!(r.snapshot(), "abc");
    }

    #[test]
    fn test_seeded_replicas_share_ids() {
        let a = Replica::seeded(site(1), "same text");
        let b = Replica::seeded(site(2), "same text");
        assert_eq!(a.state().elements, b.state().elements);
        assert_ne!(seed_site("same text"), seed_site("other text"));
    }

    #[test]
    fn test_restore_keeps_clock_monotonic() {
        let mut a = Replica::new(site(1));
        a.apply_local_insert(0, "abcdef").unwrap();
        let clock = a.clock();
        a.restore(ReplicaState::default()).unwrap();
        assert!(a.is_empty());
        assert_eq!(a.clock(), clock);
        let op = a.apply_local_insert(0, "z").unwrap();
        assert!(op.clock > clock);
    }

    #[test]
    fn test_merge_state_unions_edits() {
        let mut a = Replica::seeded(site(1), "base");
        let mut b = Replica::seeded(site(2), "base");
        a.apply_local_insert(4, "A").unwrap();
        b.apply_local_insert(0, "B").unwrap();
        b.apply_local_delete(1, 1).unwrap();

        a.merge_state(b.state()).unwrap();
        b.merge_state(a.state()).unwrap();
        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.snapshot(), "BaseA");
        assert_eq!(a.local_ops_since_sync(), 0);
    }

    #[test]
    fn test_restore_rejects_duplicate_ids() {
        let mut r = Replica::new(site(1));
        let mut state = Replica::seeded(site(2), "ab").state();
        let dup = state.elements[0].clone();
        state.elements.push(dup);
        assert!(r.restore(state).is_err());
    }

    #[test]
    fn test_encode_decode_state() {
        let mut r = Replica::seeded(site(1), "snap");
        r.apply_local_delete(0, 1).unwrap();
        let bytes = r.encode_state().unwrap();
        let state = Replica::decode_state(&bytes).unwrap();
        assert_eq!(state, r.state());
        assert_eq!(state.visible_text(), "nap");
        assert!(Replica::decode_state(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_reset_to_reseeds() {
        let mut a = Replica::seeded(site(1), "old");
        a.apply_local_insert(3, "!").unwrap();
        a.reset_to("new text");
        let b = Replica::seeded(site(2), "new text");
        assert_eq!(a.snapshot(), "new text");
        assert_eq!(a.state().elements, b.state().elements);
        assert_eq!(a.local_ops_since_sync(), 0);
    }

    #[test]
    fn test_unicode_scalars() {
        let mut r = Replica::seeded(site(1), "héllo");
        r.apply_local_insert(5, " 🌍").unwrap();
        r.apply_local_delete(1, 1).unwrap();
        assert_eq!(r.snapshot(), "hllo 🌍");
        assert_eq!(r.len(), 6);
    }

    #[test]
    fn test_readiness_against_foreign_history() {
        let mut local = Replica::seeded(site(1), "abc");
        let insert = local.apply_local_insert(3, "!").unwrap();
        let delete = local.apply_local_delete(0, 1).unwrap();

        let mut relay = Replica::seeded(site(9), "abc");
        assert!(relay.is_ready(&insert));
        assert!(relay.is_ready(&delete));
        assert!(!relay.contains(&insert));
        assert!(!relay.contains(&delete));

        relay.apply_remote(insert.clone()).unwrap();
        relay.apply_remote(delete.clone()).unwrap();
        assert!(relay.contains(&insert));
        assert!(relay.contains(&delete));

        // Same text, different history: none of the ids line up.
        let mut other = Replica::seeded(site(9), "");
        other.apply_local_insert(0, "abc").unwrap();
        assert!(!other.is_ready(&insert));
        assert!(!other.is_ready(&delete));
        assert!(!other.contains(&insert));
    }
}
