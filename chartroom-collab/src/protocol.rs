//! Binary wire protocol for the collaboration gateway.
//!
//! Three frame families, all bincode-encoded:
//!
//! - [`ClientMessage`] — client to gateway
//! - [`ServerEvent`] — gateway to client
//! - [`BusEnvelope`] — gateway instance to gateway instance, carried by the
//!   fan-out bus
//!
//! Channel naming convention: one bus channel per room for presence and
//! chat, one per document for edit operations, so fan-out cost is bounded
//! to the instances that currently have a member attached.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::{CursorPos, PresenceEntry};

/// Rooms are keyed by case id, e.g. `"case-42"`.
pub type RoomId = String;

/// Bus channel carrying presence and chat for one room.
pub fn room_channel(room_id: &str) -> String {
    format!("room:{room_id}")
}

/// Bus channel carrying edit operations for one document.
pub fn doc_channel(doc_id: &Uuid) -> String {
    format!("doc:{doc_id}")
}

/// Document operation payload.
///
/// The sync handshake mirrors state-vector based replication: a client
/// opens a document by sending `SyncRequest` with its encoded state vector
/// and receives an `Update` diff covering everything it is missing.
/// Subsequent incremental edits travel as `Update` in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DocOpPayload {
    /// Open handshake: the sender's encoded state vector.
    SyncRequest { state_vector: Vec<u8> },
    /// An incremental update diff (also the reply to a `SyncRequest`).
    Update { update: Vec<u8> },
}

/// Messages a client sends to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    JoinRoom {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    /// Keep-alive for otherwise-idle connections. Any inbound frame
    /// refreshes the connection's heartbeat clock; this one exists so a
    /// silent client is distinguishable from a dead one.
    Heartbeat,
    CursorMove {
        room_id: RoomId,
        cursor: CursorPos,
    },
    SectionFocus {
        room_id: RoomId,
        /// `None` clears the focus.
        section: Option<String>,
    },
    TypingStart {
        room_id: RoomId,
    },
    TypingStop {
        room_id: RoomId,
    },
    ChatSend {
        room_id: RoomId,
        text: String,
    },
    DocOp {
        room_id: RoomId,
        doc_id: Uuid,
        op: DocOpPayload,
    },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Events the gateway pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Full presence view of a room. Sent on join and whenever a remote
    /// instance's snapshot reply changes the derived view.
    PresenceSync {
        room_id: RoomId,
        entries: Vec<PresenceEntry>,
    },
    Joined {
        room_id: RoomId,
        entry: PresenceEntry,
    },
    Left {
        room_id: RoomId,
        conn_id: Uuid,
        participant_id: Uuid,
    },
    PresenceUpdated {
        room_id: RoomId,
        entry: PresenceEntry,
    },
    ChatMessage {
        room_id: RoomId,
        participant_id: Uuid,
        display_name: String,
        text: String,
        /// Seconds since the Unix epoch, stamped by the accepting instance.
        sent_at: u64,
    },
    DocOp {
        room_id: RoomId,
        doc_id: Uuid,
        op: DocOpPayload,
    },
}

/// Queue class driving the outbound backpressure policy: when a
/// connection's queue is over bound, the oldest [`EventClass::Ephemeral`]
/// frames are shed first. [`EventClass::Durable`] frames are never shed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Presence traffic. Loss-tolerant: only the latest value matters and
    /// the next presence sync repairs any gap.
    Ephemeral,
    /// Chat and document operations. Must not be dropped.
    Durable,
}

impl ServerEvent {
    pub fn class(&self) -> EventClass {
        match self {
            ServerEvent::ChatMessage { .. } | ServerEvent::DocOp { .. } => EventClass::Durable,
            _ => EventClass::Ephemeral,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        match self {
            ServerEvent::PresenceSync { room_id, .. }
            | ServerEvent::Joined { room_id, .. }
            | ServerEvent::Left { room_id, .. }
            | ServerEvent::PresenceUpdated { room_id, .. }
            | ServerEvent::ChatMessage { room_id, .. }
            | ServerEvent::DocOp { room_id, .. } => room_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Frame replicated between gateway instances over the fan-out bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusFrame {
    Joined {
        room_id: RoomId,
        entry: PresenceEntry,
    },
    Left {
        room_id: RoomId,
        conn_id: Uuid,
        participant_id: Uuid,
    },
    PresenceUpdated {
        room_id: RoomId,
        entry: PresenceEntry,
    },
    Chat {
        room_id: RoomId,
        participant_id: Uuid,
        display_name: String,
        text: String,
        sent_at: u64,
    },
    DocUpdate {
        room_id: RoomId,
        doc_id: Uuid,
        update: Vec<u8>,
    },
    /// New-member bootstrap: ask every instance with live entries for the
    /// room to report them. Replaying history would be unbounded; a full
    /// snapshot is not.
    PresenceSnapshotRequest {
        room_id: RoomId,
    },
    /// Locally-owned entries of the replying instance.
    PresenceSnapshotReply {
        room_id: RoomId,
        entries: Vec<PresenceEntry>,
    },
}

/// Envelope wrapping every bus frame with its origin, so subscribers can
/// skip their own publications and avoid echoing an event back to the
/// connection that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Gateway instance that published the frame.
    pub origin_instance: Uuid,
    /// Connection that caused the frame, when there is one.
    pub origin_conn: Option<Uuid>,
    pub frame: BusFrame,
}

impl BusEnvelope {
    pub fn new(origin_instance: Uuid, origin_conn: Option<Uuid>, frame: BusFrame) -> Self {
        Self {
            origin_instance,
            origin_conn,
            frame,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (env, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(env)
    }
}

/// Protocol errors. A malformed inbound frame is logged and dropped; it
/// never tears down the connection.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn entry() -> PresenceEntry {
        let identity = Identity::new(Uuid::new_v4(), "Dr. Osei", "physician");
        PresenceEntry::new(Uuid::new_v4(), &identity)
    }

    #[test]
    fn test_client_message_roundtrip() {
        let msg = ClientMessage::CursorMove {
            room_id: "case-42".into(),
            cursor: CursorPos { x: 10.0, y: 20.0 },
        };
        let encoded = msg.encode().unwrap();
        let decoded = ClientMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_join_leave_roundtrip() {
        for msg in [
            ClientMessage::JoinRoom { room_id: "case-7".into() },
            ClientMessage::LeaveRoom { room_id: "case-7".into() },
            ClientMessage::Heartbeat,
        ] {
            let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn test_doc_op_roundtrip() {
        let msg = ClientMessage::DocOp {
            room_id: "case-42".into(),
            doc_id: Uuid::new_v4(),
            op: DocOpPayload::Update { update: vec![1, 2, 3] },
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_server_event_roundtrip() {
        let event = ServerEvent::Joined {
            room_id: "case-42".into(),
            entry: entry(),
        };
        let decoded = ServerEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn test_event_class_split() {
        let chat = ServerEvent::ChatMessage {
            room_id: "r".into(),
            participant_id: Uuid::new_v4(),
            display_name: "A".into(),
            text: "hello".into(),
            sent_at: 0,
        };
        let doc = ServerEvent::DocOp {
            room_id: "r".into(),
            doc_id: Uuid::new_v4(),
            op: DocOpPayload::Update { update: vec![] },
        };
        let cursor = ServerEvent::PresenceUpdated {
            room_id: "r".into(),
            entry: entry(),
        };
        assert_eq!(chat.class(), EventClass::Durable);
        assert_eq!(doc.class(), EventClass::Durable);
        assert_eq!(cursor.class(), EventClass::Ephemeral);
    }

    #[test]
    fn test_bus_envelope_roundtrip() {
        let env = BusEnvelope::new(
            Uuid::new_v4(),
            Some(Uuid::new_v4()),
            BusFrame::Chat {
                room_id: "case-42".into(),
                participant_id: Uuid::new_v4(),
                display_name: "Dr. Chen".into(),
                text: "on my way".into(),
                sent_at: 1700000000,
            },
        );
        let decoded = BusEnvelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(room_channel("case-42"), "room:case-42");
        let id = Uuid::nil();
        assert_eq!(doc_channel(&id), format!("doc:{id}"));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(ClientMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ServerEvent::decode(&[0xFF]).is_err());
        assert!(BusEnvelope::decode(&[]).is_err());
    }

    #[test]
    fn test_cursor_frame_size_efficient() {
        let msg = ClientMessage::CursorMove {
            room_id: "case-42".into(),
            cursor: CursorPos { x: 100.0, y: 200.0 },
        };
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 40, "Cursor frame too large: {} bytes", encoded.len());
    }
}
