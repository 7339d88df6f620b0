//! Ephemeral per-participant presence and its lifecycle.
//!
//! Presence is the frequently-changing state distinct from durable case
//! data: cursor position, focused section, typing flag. Each room tracks
//! one entry per *connection*; a participant with two tabs open appears as
//! two entries sharing a participant id, and renderers dedupe by id when
//! counting distinct people.
//!
//! Lifecycle of an entry within one room:
//!
//! ```text
//! Absent ──join──► Joining ──announce──► Active
//!                                          │ heartbeat silence
//!                                          ▼
//!                                        Idle ──timeout──► Absent
//!                                          │
//!                        explicit leave / connection close ──► Absent
//! ```
//!
//! The instance that owns the connection holds the authoritative entry.
//! Other instances hold derived copies rebuilt from bus events, bootstrapped
//! by a full snapshot exchange when a local member first joins, and swept
//! independently when the owning instance goes silent.
//!
//! Cursor updates are loss-tolerant and coalesced: only the latest value
//! matters, so rapid moves inside the configured interval simply refresh
//! the stored entry without republishing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::identity::{epoch_secs, Identity};
use crate::protocol::RoomId;

/// Cursor position in the case view, in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPos {
    pub x: f32,
    pub y: f32,
}

/// One connection's presence within one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Connection the entry belongs to. Unique across instances.
    pub conn_id: Uuid,
    pub participant_id: Uuid,
    pub display_name: String,
    pub color_hint: [f32; 4],
    pub cursor: Option<CursorPos>,
    pub focused_section: Option<String>,
    pub is_typing: bool,
    /// Seconds since the Unix epoch of the last activity on this entry.
    pub last_seen_at: u64,
}

impl PresenceEntry {
    pub fn new(conn_id: Uuid, identity: &Identity) -> Self {
        Self {
            conn_id,
            participant_id: identity.id,
            display_name: identity.display_name.clone(),
            color_hint: identity.color_hint,
            cursor: None,
            focused_section: None,
            is_typing: false,
            last_seen_at: epoch_secs(),
        }
    }
}

/// Lifecycle phase of a tracked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresencePhase {
    Joining,
    Active,
    Idle,
}

struct Tracked {
    entry: PresenceEntry,
    phase: PresencePhase,
    /// True when this instance owns the connection; derived copies from
    /// other instances are false.
    owned: bool,
    last_refresh: Instant,
    last_cursor_publish: Instant,
}

impl Tracked {
    fn refresh(&mut self) {
        self.last_refresh = Instant::now();
        self.entry.last_seen_at = epoch_secs();
        if self.phase == PresencePhase::Idle {
            self.phase = PresencePhase::Active;
        }
    }
}

/// Presence state for one room. The store hands out one of these per room
/// behind its own lock, so rooms never contend with each other.
pub struct RoomPresence {
    entries: HashMap<Uuid, Tracked>,
    cursor_min_interval: Duration,
}

impl RoomPresence {
    pub fn new(cursor_min_interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            cursor_min_interval,
        }
    }

    /// Register a locally-owned entry in `Joining` phase. Idempotent: a
    /// re-join refreshes the existing entry instead of resetting it, so a
    /// rejoining client keeps its cursor and focus.
    pub fn begin_join(&mut self, entry: PresenceEntry) {
        let now = Instant::now();
        self.entries
            .entry(entry.conn_id)
            .and_modify(|t| t.refresh())
            .or_insert(Tracked {
                entry,
                phase: PresencePhase::Joining,
                owned: true,
                last_refresh: now,
                // Allow an immediate first cursor publish.
                last_cursor_publish: now - Duration::from_secs(1),
            });
    }

    /// Transition a joining (or idle) entry to `Active`, returning the
    /// entry to announce.
    pub fn activate(&mut self, conn_id: Uuid) -> Option<PresenceEntry> {
        let tracked = self.entries.get_mut(&conn_id)?;
        tracked.phase = PresencePhase::Active;
        tracked.refresh();
        Some(tracked.entry.clone())
    }

    /// Apply a cursor move. Returns the entry to republish, or `None` when
    /// the update was coalesced into the stored entry or the connection is
    /// unknown.
    pub fn apply_cursor(&mut self, conn_id: Uuid, cursor: CursorPos) -> Option<PresenceEntry> {
        let tracked = self.entries.get_mut(&conn_id)?;
        tracked.entry.cursor = Some(cursor);
        tracked.refresh();
        if tracked.last_cursor_publish.elapsed() < self.cursor_min_interval {
            return None;
        }
        tracked.last_cursor_publish = Instant::now();
        Some(tracked.entry.clone())
    }

    /// Apply a section-focus change. Always republished.
    pub fn apply_focus(
        &mut self,
        conn_id: Uuid,
        section: Option<String>,
    ) -> Option<PresenceEntry> {
        let tracked = self.entries.get_mut(&conn_id)?;
        tracked.entry.focused_section = section;
        tracked.refresh();
        Some(tracked.entry.clone())
    }

    /// Apply a typing start/stop. Always republished.
    pub fn set_typing(&mut self, conn_id: Uuid, is_typing: bool) -> Option<PresenceEntry> {
        let tracked = self.entries.get_mut(&conn_id)?;
        tracked.entry.is_typing = is_typing;
        tracked.refresh();
        Some(tracked.entry.clone())
    }

    /// Refresh the heartbeat clock for a locally-owned entry.
    pub fn refresh(&mut self, conn_id: Uuid) {
        if let Some(tracked) = self.entries.get_mut(&conn_id) {
            tracked.refresh();
        }
    }

    /// Remove an entry (explicit leave or connection close), returning it
    /// for the `left` announcement.
    pub fn remove(&mut self, conn_id: Uuid) -> Option<PresenceEntry> {
        self.entries.remove(&conn_id).map(|t| t.entry)
    }

    /// Merge a derived entry received from another instance.
    pub fn merge_remote(&mut self, entry: PresenceEntry) {
        let now = Instant::now();
        match self.entries.get_mut(&entry.conn_id) {
            // Never let a bus echo overwrite an entry this instance owns.
            Some(t) if t.owned => {}
            Some(t) => {
                t.entry = entry;
                t.last_refresh = now;
            }
            None => {
                self.entries.insert(
                    entry.conn_id,
                    Tracked {
                        entry,
                        phase: PresencePhase::Active,
                        owned: false,
                        last_refresh: now,
                        last_cursor_publish: now,
                    },
                );
            }
        }
    }

    /// Mark entries idle after `idle_after` of silence and evict derived
    /// entries older than `evict_after`. Locally-owned entries are evicted
    /// by their connection's own heartbeat timeout, never here, so a dead
    /// remote instance cannot trigger duplicate `left` announcements.
    pub fn sweep(&mut self, idle_after: Duration, evict_after: Duration) -> Vec<PresenceEntry> {
        for tracked in self.entries.values_mut() {
            if tracked.phase == PresencePhase::Active
                && tracked.last_refresh.elapsed() >= idle_after
            {
                tracked.phase = PresencePhase::Idle;
            }
        }
        let stale: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, t)| !t.owned && t.last_refresh.elapsed() >= evict_after)
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|t| t.entry))
            .collect()
    }

    /// Full view of the room: owned and derived entries.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.entries.values().map(|t| t.entry.clone()).collect()
    }

    /// Entries whose connections this instance owns. Reported in snapshot
    /// replies; derived copies are someone else's to report.
    pub fn locally_owned(&self) -> Vec<PresenceEntry> {
        self.entries
            .values()
            .filter(|t| t.owned)
            .map(|t| t.entry.clone())
            .collect()
    }

    pub fn phase(&self, conn_id: Uuid) -> Option<PresencePhase> {
        self.entries.get(&conn_id).map(|t| t.phase)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Process-local presence store: one [`RoomPresence`] per room, each behind
/// its own lock.
pub struct PresenceStore {
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<RoomPresence>>>>,
    cursor_min_interval: Duration,
}

impl PresenceStore {
    pub fn new(cursor_min_interval: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            cursor_min_interval,
        }
    }

    /// Get or create the presence state for a room.
    pub async fn room(&self, room_id: &str) -> Arc<Mutex<RoomPresence>> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock.
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }
        let room = Arc::new(Mutex::new(RoomPresence::new(self.cursor_min_interval)));
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    pub async fn snapshot(&self, room_id: &str) -> Vec<PresenceEntry> {
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(room_id).cloned()
        };
        match room {
            Some(room) => room.lock().await.snapshot(),
            None => Vec::new(),
        }
    }

    /// Drop a room's presence state once nothing is tracked in it.
    pub async fn remove_room_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.lock().await.is_empty() {
                rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_for(identity: &Identity) -> PresenceEntry {
        PresenceEntry::new(Uuid::new_v4(), identity)
    }

    fn identity() -> Identity {
        Identity::new(Uuid::new_v4(), "Dr. Osei", "physician")
    }

    #[test]
    fn test_join_activate_lifecycle() {
        let mut room = RoomPresence::new(Duration::from_millis(50));
        let entry = entry_for(&identity());
        let conn = entry.conn_id;

        room.begin_join(entry);
        assert_eq!(room.phase(conn), Some(PresencePhase::Joining));

        let announced = room.activate(conn).unwrap();
        assert_eq!(announced.conn_id, conn);
        assert_eq!(room.phase(conn), Some(PresencePhase::Active));
    }

    #[test]
    fn test_rejoin_keeps_entry_state() {
        let mut room = RoomPresence::new(Duration::from_millis(0));
        let entry = entry_for(&identity());
        let conn = entry.conn_id;

        room.begin_join(entry.clone());
        room.activate(conn);
        room.apply_cursor(conn, CursorPos { x: 5.0, y: 6.0 });

        // Idempotent re-join must not reset the cursor.
        room.begin_join(entry);
        let snap = room.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].cursor, Some(CursorPos { x: 5.0, y: 6.0 }));
    }

    #[test]
    fn test_cursor_coalescing() {
        let mut room = RoomPresence::new(Duration::from_millis(50));
        let entry = entry_for(&identity());
        let conn = entry.conn_id;
        room.begin_join(entry);
        room.activate(conn);

        // First move publishes, immediate second move is coalesced.
        assert!(room.apply_cursor(conn, CursorPos { x: 1.0, y: 1.0 }).is_some());
        assert!(room.apply_cursor(conn, CursorPos { x: 2.0, y: 2.0 }).is_none());

        // The coalesced value still landed in the entry.
        let snap = room.snapshot();
        assert_eq!(snap[0].cursor, Some(CursorPos { x: 2.0, y: 2.0 }));
    }

    #[test]
    fn test_cursor_unknown_connection() {
        let mut room = RoomPresence::new(Duration::from_millis(50));
        assert!(room
            .apply_cursor(Uuid::new_v4(), CursorPos { x: 0.0, y: 0.0 })
            .is_none());
    }

    #[test]
    fn test_focus_and_typing_always_publish() {
        let mut room = RoomPresence::new(Duration::from_secs(60));
        let entry = entry_for(&identity());
        let conn = entry.conn_id;
        room.begin_join(entry);
        room.activate(conn);

        let e = room.apply_focus(conn, Some("treatmentPlan".into())).unwrap();
        assert_eq!(e.focused_section.as_deref(), Some("treatmentPlan"));

        let e = room.set_typing(conn, true).unwrap();
        assert!(e.is_typing);
        let e = room.set_typing(conn, false).unwrap();
        assert!(!e.is_typing);
    }

    #[test]
    fn test_two_tabs_two_entries() {
        let mut room = RoomPresence::new(Duration::from_millis(50));
        let identity = identity();
        let tab1 = entry_for(&identity);
        let tab2 = entry_for(&identity);
        room.begin_join(tab1.clone());
        room.begin_join(tab2.clone());

        // Same participant, two connections: both entries are kept.
        let snap = room.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap.iter().all(|e| e.participant_id == identity.id));
    }

    #[test]
    fn test_remove_returns_entry() {
        let mut room = RoomPresence::new(Duration::from_millis(50));
        let entry = entry_for(&identity());
        let conn = entry.conn_id;
        room.begin_join(entry);

        let removed = room.remove(conn).unwrap();
        assert_eq!(removed.conn_id, conn);
        assert!(room.remove(conn).is_none());
        assert!(room.is_empty());
    }

    #[test]
    fn test_merge_remote_never_overwrites_owned() {
        let mut room = RoomPresence::new(Duration::from_millis(0));
        let entry = entry_for(&identity());
        let conn = entry.conn_id;
        room.begin_join(entry.clone());
        room.activate(conn);
        room.apply_cursor(conn, CursorPos { x: 9.0, y: 9.0 });

        // A bus echo of the stale join entry must not clobber the cursor.
        room.merge_remote(entry);
        assert_eq!(room.snapshot()[0].cursor, Some(CursorPos { x: 9.0, y: 9.0 }));
    }

    #[test]
    fn test_sweep_evicts_only_derived() {
        let mut room = RoomPresence::new(Duration::from_millis(50));
        let owned = entry_for(&identity());
        let owned_conn = owned.conn_id;
        room.begin_join(owned);
        room.activate(owned_conn);

        let remote = entry_for(&identity());
        let remote_conn = remote.conn_id;
        room.merge_remote(remote);

        std::thread::sleep(Duration::from_millis(20));
        let evicted = room.sweep(Duration::from_millis(5), Duration::from_millis(10));

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].conn_id, remote_conn);
        // Owned entry went idle but stays tracked.
        assert_eq!(room.phase(owned_conn), Some(PresencePhase::Idle));
        assert_eq!(room.len(), 1);
    }

    #[test]
    fn test_refresh_revives_idle() {
        let mut room = RoomPresence::new(Duration::from_millis(50));
        let entry = entry_for(&identity());
        let conn = entry.conn_id;
        room.begin_join(entry);
        room.activate(conn);

        std::thread::sleep(Duration::from_millis(15));
        room.sweep(Duration::from_millis(5), Duration::from_secs(60));
        assert_eq!(room.phase(conn), Some(PresencePhase::Idle));

        room.refresh(conn);
        assert_eq!(room.phase(conn), Some(PresencePhase::Active));
    }

    #[test]
    fn test_locally_owned_excludes_derived() {
        let mut room = RoomPresence::new(Duration::from_millis(50));
        let owned = entry_for(&identity());
        room.begin_join(owned.clone());
        room.merge_remote(entry_for(&identity()));

        let reported = room.locally_owned();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].conn_id, owned.conn_id);
        assert_eq!(room.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_store_room_reuse() {
        let store = PresenceStore::new(Duration::from_millis(50));
        let a = store.room("case-42").await;
        let b = store.room("case-42").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_store_remove_if_empty() {
        let store = PresenceStore::new(Duration::from_millis(50));
        let room = store.room("case-42").await;

        let entry = entry_for(&identity());
        let conn = entry.conn_id;
        room.lock().await.begin_join(entry);
        assert!(!store.remove_room_if_empty("case-42").await);

        room.lock().await.remove(conn);
        assert!(store.remove_room_if_empty("case-42").await);
        assert_eq!(store.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_store_snapshot_missing_room() {
        let store = PresenceStore::new(Duration::from_millis(50));
        assert!(store.snapshot("case-404").await.is_empty());
    }
}
