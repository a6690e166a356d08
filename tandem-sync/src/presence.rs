//! Presence ("awareness") for real-time cursor and identity sharing.
//!
//! ## Architecture
//!
//! ```text
//! Local caret move
//!       │
//!       ▼
//! PresenceStore::update_local_cursor()
//!       │  (throttled)
//!       ▼
//! {type:"presence", sessionId, record}
//!       │
//!       ▼   (WebSocket relay)
//! Remote PresenceStore::apply_remote()
//!       │
//!       ▼
//! get_all() / sweep()  ──►  PresenceEvent::{Added, Updated, Expired, Left}
//! ```
//!
//! Records are volatile and never persisted. A peer that stops refreshing is
//! dropped once its `last_seen` is older than the timeout, both lazily on read
//! and on the periodic sweep.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::observer::{Observers, SubscriptionId};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable color for a session.
    ///
    /// HSL with fixed saturation and lightness; the hue comes from a hash of
    /// the session id. Collisions are cosmetic.
    pub fn from_session(id: Uuid) -> Self {
        let hash = id
            .as_bytes()
            .iter()
            .fold(0x811c_9dc5_u32, |h, b| (h ^ u32::from(*b)).wrapping_mul(0x0100_0193));
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb`, alpha ignored.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Records
// ───────────────────────────────────────────────────────────────────

/// Identity supplied by the host's identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            color: None,
        }
    }
}

/// Caret and selection as char offsets into the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub anchor: usize,
    pub head: usize,
}

impl Cursor {
    pub fn caret(pos: usize) -> Self {
        Self { anchor: pos, head: pos }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub session_id: Uuid,
    pub display_name: String,
    pub color: String,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    /// Wall-clock ms of the last refresh, stamped by the receiver.
    #[serde(default)]
    pub last_seen: u64,
}

impl PresenceRecord {
    /// Record for `session_id`, colored by the identity or by the session hash.
    pub fn for_identity(session_id: Uuid, identity: &Identity) -> Self {
        let color = identity
            .color
            .clone()
            .unwrap_or_else(|| CursorColor::from_session(session_id).to_hex());
        Self {
            session_id,
            display_name: identity.name.clone(),
            color,
            cursor: None,
            last_seen: 0,
        }
    }
}

/// Change notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Added(PresenceRecord),
    Updated(PresenceRecord),
    Expired(Uuid),
    Left(Uuid),
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// Presence of every session in one document room, the local one included.
pub struct PresenceStore {
    local_session: Uuid,
    records: HashMap<Uuid, PresenceRecord>,
    timeout: Duration,
    observers: Observers<PresenceEvent>,
    /// Minimum interval between local cursor broadcasts.
    throttle: Duration,
    last_broadcast: Option<Instant>,
    broadcast_pending: bool,
}

impl PresenceStore {
    pub fn new(local_session: Uuid, timeout: Duration, throttle: Duration) -> Self {
        Self {
            local_session,
            records: HashMap::new(),
            timeout,
            observers: Observers::new(),
            throttle,
            last_broadcast: None,
            broadcast_pending: false,
        }
    }

    pub fn local_session(&self) -> Uuid {
        self.local_session
    }

    pub fn subscribe(&mut self) -> (SubscriptionId, mpsc::UnboundedReceiver<PresenceEvent>) {
        self.observers.subscribe()
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Install or replace the local record.
    pub fn set_local(&mut self, mut record: PresenceRecord, now_ms: u64) {
        record.session_id = self.local_session;
        record.last_seen = now_ms;
        self.upsert(record);
    }

    pub fn local(&self) -> Option<&PresenceRecord> {
        self.records.get(&self.local_session)
    }

    /// Keep the local record alive.
    pub fn touch_local(&mut self, now_ms: u64) -> Option<PresenceRecord> {
        let record = self.records.get_mut(&self.local_session)?;
        record.last_seen = now_ms;
        Some(record.clone())
    }

    /// Move the local caret. Returns the record to broadcast unless throttled;
    /// a throttled update is picked up by [`take_pending`](Self::take_pending).
    pub fn update_local_cursor(&mut self, cursor: Option<Cursor>, now: Instant, now_ms: u64) -> Option<PresenceRecord> {
        let mut record = self.local()?.clone();
        record.cursor = cursor;
        record.last_seen = now_ms;
        self.upsert(record.clone());

        if self.last_broadcast.is_some_and(|t| now.duration_since(t) < self.throttle) {
            self.broadcast_pending = true;
            return None;
        }
        self.last_broadcast = Some(now);
        self.broadcast_pending = false;
        Some(record)
    }

    /// When a throttled broadcast becomes due.
    pub fn pending_deadline(&self) -> Option<Instant> {
        match (self.broadcast_pending, self.last_broadcast) {
            (true, Some(t)) => Some(t + self.throttle),
            _ => None,
        }
    }

    pub fn take_pending(&mut self, now: Instant) -> Option<PresenceRecord> {
        let due = self.pending_deadline().is_some_and(|d| now >= d);
        if !due {
            return None;
        }
        self.broadcast_pending = false;
        self.last_broadcast = Some(now);
        self.local().cloned()
    }

    /// Apply a record (or a leave, `None`) received from a peer.
    pub fn apply_remote(&mut self, session_id: Uuid, record: Option<PresenceRecord>, now_ms: u64) {
        if session_id == self.local_session {
            return;
        }
        match record {
            Some(mut record) => {
                record.session_id = session_id;
                record.last_seen = now_ms;
                self.upsert(record);
            }
            None => {
                if self.records.remove(&session_id).is_some() {
                    log::debug!("Presence: {session_id} left");
                    self.observers.notify(&PresenceEvent::Left(session_id));
                }
            }
        }
    }

    fn upsert(&mut self, record: PresenceRecord) {
        let event = if self.records.contains_key(&record.session_id) {
            PresenceEvent::Updated(record.clone())
        } else {
            PresenceEvent::Added(record.clone())
        };
        self.records.insert(record.session_id, record);
        self.observers.notify(&event);
    }

    /// All live records; expired peers are removed first.
    pub fn get_all(&mut self, now_ms: u64) -> HashMap<Uuid, PresenceRecord> {
        self.sweep(now_ms);
        self.records.clone()
    }

    /// Remove peers whose `last_seen` is older than the timeout.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<Uuid> {
        let timeout = self.timeout.as_millis() as u64;
        let local = self.local_session;
        let stale: Vec<Uuid> = self
            .records
            .values()
            .filter(|r| r.session_id != local && now_ms.saturating_sub(r.last_seen) > timeout)
            .map(|r| r.session_id)
            .collect();

        for id in &stale {
            self.records.remove(id);
            log::debug!("Presence: {id} expired");
            self.observers.notify(&PresenceEvent::Expired(*id));
        }
        stale
    }

    /// Number of records, the local one included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget every peer and drop subscribers.
    pub fn teardown(&mut self) {
        self.records.clear();
        self.observers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn store() -> PresenceStore {
        PresenceStore::new(Uuid::new_v4(), TIMEOUT, Duration::from_millis(50))
    }

    fn remote(name: &str) -> PresenceRecord {
        PresenceRecord::for_identity(Uuid::new_v4(), &Identity::new(name))
    }

    #[test]
    fn test_color_stable_per_session() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(CursorColor::from_session(id), CursorColor::from_session(id));
        let hex = CursorColor::from_session(id).to_hex();
        assert_eq!(hex.len(), 7);
        assert!(hex.starts_with('#'));
    }

    #[test]
    fn test_identity_color_overrides_hash() {
        let mut identity = Identity::new("Alice");
        identity.color = Some("#ff0000".into());
        let record = PresenceRecord::for_identity(Uuid::new_v4(), &identity);
        assert_eq!(record.color, "#ff0000");
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_remote_add_update_events() {
        let mut s = store();
        let (_, mut events) = s.subscribe();
        let record = remote("Bob");
        let id = record.session_id;

        s.apply_remote(id, Some(record.clone()), 1_000);
        s.apply_remote(id, Some(record), 2_000);

        assert!(matches!(events.try_recv().unwrap(), PresenceEvent::Added(r) if r.last_seen == 1_000));
        assert!(matches!(events.try_recv().unwrap(), PresenceEvent::Updated(r) if r.last_seen == 2_000));
        assert_eq!(s.get_all(2_000).len(), 1);
    }

    #[test]
    fn test_own_session_ignored() {
        let mut s = store();
        let local = s.local_session();
        let mut record = remote("Me");
        record.session_id = local;
        s.apply_remote(local, Some(record), 1_000);
        assert!(s.is_empty());
    }

    #[test]
    fn test_expiry_on_sweep_without_traffic() {
        let mut s = store();
        let (_, mut events) = s.subscribe();
        let record = remote("Carol");
        let id = record.session_id;
        s.apply_remote(id, Some(record), 10_000);
        let _ = events.try_recv();

        assert!(s.sweep(10_000 + 30_000).is_empty());
        assert_eq!(s.sweep(10_000 + 30_001), vec![id]);
        assert_eq!(events.try_recv().unwrap(), PresenceEvent::Expired(id));
        assert!(!s.get_all(40_001).contains_key(&id));
    }

    #[test]
    fn test_lazy_expiry_on_read() {
        let mut s = store();
        let record = remote("Dan");
        let id = record.session_id;
        s.apply_remote(id, Some(record), 0);
        assert!(s.get_all(31_000).is_empty());
    }

    #[test]
    fn test_local_record_never_expires() {
        let mut s = store();
        s.set_local(remote("Me"), 0);
        assert_eq!(s.get_all(10 * 60 * 1_000).len(), 1);
        assert_eq!(s.local().unwrap().session_id, s.local_session());
    }

    #[test]
    fn test_leave_removes_immediately() {
        let mut s = store();
        let (_, mut events) = s.subscribe();
        let record = remote("Eve");
        let id = record.session_id;
        s.apply_remote(id, Some(record), 0);
        s.apply_remote(id, None, 1);
        let _ = events.try_recv();
        assert_eq!(events.try_recv().unwrap(), PresenceEvent::Left(id));
        assert!(s.is_empty());
    }

    #[test]
    fn test_cursor_broadcast_throttled() {
        let mut s = store();
        s.set_local(remote("Me"), 0);
        let t0 = Instant::now();

        assert!(s.update_local_cursor(Some(Cursor::caret(1)), t0, 0).is_some());
        assert!(s.update_local_cursor(Some(Cursor::caret(2)), t0 + Duration::from_millis(10), 10).is_none());
        assert_eq!(s.pending_deadline(), Some(t0 + Duration::from_millis(50)));
        assert!(s.take_pending(t0 + Duration::from_millis(20)).is_none());

        let flushed = s.take_pending(t0 + Duration::from_millis(50)).unwrap();
        assert_eq!(flushed.cursor, Some(Cursor::caret(2)));
        assert!(s.pending_deadline().is_none());
    }

    #[test]
    fn test_cursor_requires_local_record() {
        let mut s = store();
        assert!(s.update_local_cursor(Some(Cursor::caret(0)), Instant::now(), 0).is_none());
    }

    #[test]
    fn test_teardown_closes_subscribers() {
        let mut s = store();
        let (_, mut events) = s.subscribe();
        s.apply_remote(Uuid::new_v4(), Some(remote("Zed")), 0);
        s.teardown();
        let _ = events.try_recv();
        assert!(events.try_recv().is_err());
        assert!(s.is_empty());
    }
}
