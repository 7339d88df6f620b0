//! Per-process room membership registry.
//!
//! Holds only the connections attached to *this* instance; the rest of a
//! room is mirrored through the fan-out bus, never by direct cross-process
//! reference. Rooms are independent of each other, so each gets its own
//! lock rather than sharing a global one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::identity::Identity;
use crate::outbound::OutboundQueue;
use crate::protocol::RoomId;

/// Handle to one live connection, shared with every room it joins.
pub struct ConnectionHandle {
    pub conn_id: Uuid,
    pub identity: Identity,
    /// Outbound queue the fan-out path writes into.
    pub queue: Arc<OutboundQueue>,
    joined_rooms: RwLock<HashSet<RoomId>>,
}

impl ConnectionHandle {
    pub fn new(identity: Identity, queue: Arc<OutboundQueue>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            identity,
            queue,
            joined_rooms: RwLock::new(HashSet::new()),
        }
    }

    pub async fn joined_rooms(&self) -> Vec<RoomId> {
        self.joined_rooms.read().await.iter().cloned().collect()
    }

    pub async fn is_member(&self, room_id: &str) -> bool {
        self.joined_rooms.read().await.contains(room_id)
    }
}

struct RoomMembers {
    members: RwLock<HashMap<Uuid, Arc<ConnectionHandle>>>,
}

impl RoomMembers {
    fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
        }
    }
}

/// Registry of room membership for one gateway instance.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<RoomMembers>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Join a connection to a room. Idempotent: returns `false` when the
    /// connection was already a member. Callers re-announce presence either
    /// way, so a client can recover from a missed announcement by simply
    /// joining again.
    pub async fn join(&self, handle: Arc<ConnectionHandle>, room_id: &str) -> bool {
        let room = self.room(room_id).await;
        let newly_joined = {
            let mut members = room.members.write().await;
            members
                .insert(handle.conn_id, handle.clone())
                .is_none()
        };
        if newly_joined {
            handle.joined_rooms.write().await.insert(room_id.to_string());
        }
        newly_joined
    }

    /// Leave a room. A leave for a room the connection never joined is a
    /// no-op, not an error.
    pub async fn leave(&self, handle: &ConnectionHandle, room_id: &str) -> bool {
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(room_id).cloned()
        };
        let Some(room) = room else {
            return false;
        };
        let removed = room.members.write().await.remove(&handle.conn_id).is_some();
        if removed {
            handle.joined_rooms.write().await.remove(room_id);
            self.remove_room_if_empty(room_id).await;
        }
        removed
    }

    /// Remove a connection from every room it was in. Runs on transport
    /// close and on heartbeat timeout; a connection that silently
    /// disappears must be cleaned up exactly like one that said goodbye.
    /// Returns the rooms left, one `left` announcement owed per entry.
    pub async fn remove_connection(&self, handle: &ConnectionHandle) -> Vec<RoomId> {
        let rooms_joined: Vec<RoomId> = {
            let mut joined = handle.joined_rooms.write().await;
            joined.drain().collect()
        };
        for room_id in &rooms_joined {
            let room = {
                let rooms = self.rooms.read().await;
                rooms.get(room_id).cloned()
            };
            if let Some(room) = room {
                room.members.write().await.remove(&handle.conn_id);
            }
            self.remove_room_if_empty(room_id).await;
        }
        rooms_joined
    }

    /// Local members of a room. Connections on other instances are not
    /// visible here.
    pub async fn members_of(&self, room_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(room_id).cloned()
        };
        match room {
            Some(room) => room.members.read().await.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn rooms_of(&self, handle: &ConnectionHandle) -> Vec<RoomId> {
        handle.joined_rooms().await
    }

    pub async fn local_member_count(&self, room_id: &str) -> usize {
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(room_id).cloned()
        };
        match room {
            Some(room) => room.members.read().await.len(),
            None => 0,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn room(&self, room_id: &str) -> Arc<RoomMembers> {
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
        let room = Arc::new(RoomMembers::new());
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    async fn remove_room_if_empty(&self, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.members.read().await.is_empty() {
                rooms.remove(room_id);
            }
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
