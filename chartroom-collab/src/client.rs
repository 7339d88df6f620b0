//! WebSocket client for the collaboration gateway.
//!
//! Used by integration tests and downstream UIs. Provides:
//! - Connection lifecycle (connect with a bearer token, disconnect)
//! - Room membership and presence senders (cursor, focus, typing, chat)
//! - Document update send/receive with an offline queue for edits made
//!   while disconnected
//! - A typed event stream decoded from gateway frames
//!
//! Presence messages are dropped silently when offline (only the latest
//! value matters and a rejoin resyncs everything). Document updates are
//! never silently dropped: while disconnected they land in the offline
//! queue and are replayed on the next connect.

use futures_util::{SinkExt, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::{CursorPos, PresenceEntry};
use crate::protocol::{ClientMessage, DocOpPayload, ProtocolError, RoomId, ServerEvent};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Bearer token presented at handshake time
    pub token: String,
    /// Cadence of the background heartbeat frames
    pub heartbeat_interval: Duration,
    /// Capacity of the offline document-op queue
    pub offline_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            token: String::new(),
            heartbeat_interval: Duration::from_secs(10),
            offline_queue_capacity: 10_000,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the application, decoded from gateway frames.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// Full presence view of a room.
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
    Chat {
        room_id: RoomId,
        participant_id: Uuid,
        display_name: String,
        text: String,
        sent_at: u64,
    },
    /// An incremental document update (edit or sync-reply diff).
    DocUpdate {
        room_id: RoomId,
        doc_id: Uuid,
        update: Vec<u8>,
    },
}

/// A document op made while disconnected, awaiting replay.
#[derive(Debug, Clone)]
pub struct QueuedOp {
    pub room_id: RoomId,
    pub doc_id: Uuid,
    pub update: Vec<u8>,
}

/// Bounded queue of document ops made while disconnected.
pub struct OfflineQueue {
    queue: VecDeque<QueuedOp>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an op for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, room_id: RoomId, doc_id: Uuid, update: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedOp {
            room_id,
            doc_id,
            update,
        });
        true
    }

    /// Drain everything queued, in the order it was made.
    pub fn drain(&mut self) -> Vec<QueuedOp> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|op| op.update.len()).sum()
    }
}

/// The collaboration client.
pub struct CollabClient {
    config: ClientConfig,
    state: Arc<RwLock<ClientState>>,
    offline: Arc<Mutex<OfflineQueue>>,
    /// Rooms joined on this client, re-joined automatically on connect.
    joined_rooms: Arc<Mutex<HashSet<RoomId>>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl CollabClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let offline = Arc::new(Mutex::new(OfflineQueue::new(config.offline_queue_capacity)));
        Self {
            config,
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            offline,
            joined_rooms: Arc::new(Mutex::new(HashSet::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver. Can only be taken once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline.lock().await.len()
    }

    /// Connect to the gateway, presenting the configured token. Spawns the
    /// writer, reader, and heartbeat tasks, then replays the offline queue.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ClientState::Connecting;

        let url = format!("{}/collab?token={}", self.config.server_url, self.config.token);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", self.config.server_url);
                *self.state.write().await = ClientState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer: forward outgoing frames, say goodbye when the channel
        // closes so the gateway cleans up immediately.
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_sender.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        // Heartbeat: keep an otherwise-idle connection distinguishable
        // from a dead one. Ends when the writer channel closes.
        let heartbeat_tx = out_tx.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(heartbeat_interval);
            tick.tick().await; // first tick fires immediately; skip it
            loop {
                tick.tick().await;
                let Ok(frame) = ClientMessage::Heartbeat.encode() else {
                    break;
                };
                if heartbeat_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        *self.state.write().await = ClientState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Re-join every room we were in, plus the rooms of any queued
        // edits, before replaying them; the gateway only accepts doc ops
        // from room members. Join frames precede the ops on the wire, so
        // membership is established by the time they arrive.
        let queued = self.offline.lock().await.drain();
        let rooms: Vec<RoomId> = {
            let mut joined = self.joined_rooms.lock().await;
            for op in &queued {
                joined.insert(op.room_id.clone());
            }
            joined.iter().cloned().collect()
        };
        for room_id in rooms {
            if let Ok(frame) = (ClientMessage::JoinRoom { room_id }).encode() {
                let _ = out_tx.send(frame).await;
            }
        }
        if !queued.is_empty() {
            log::info!("Replaying {} queued document ops", queued.len());
            for op in queued {
                let msg = ClientMessage::DocOp {
                    room_id: op.room_id,
                    doc_id: op.doc_id,
                    op: DocOpPayload::Update { update: op.update },
                };
                if let Ok(frame) = msg.encode() {
                    let _ = out_tx.send(frame).await;
                }
            }
        }

        // Reader: decode gateway frames into typed events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerEvent::decode(&bytes) {
                            Ok(event) => {
                                if let Some(event) = map_event(event) {
                                    if event_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => log::warn!("Undecodable gateway frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ClientState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Drop the connection. The writer task sends a close frame on its way
    /// out; queued offline ops survive for the next connect.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ClientState::Disconnected;
    }

    pub async fn join_room(&self, room_id: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
        })
        .await?;
        self.joined_rooms.lock().await.insert(room_id.to_string());
        Ok(())
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::LeaveRoom {
            room_id: room_id.to_string(),
        })
        .await?;
        self.joined_rooms.lock().await.remove(room_id);
        Ok(())
    }

    pub async fn send_heartbeat(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Heartbeat).await
    }

    /// Presence senders are best-effort: silently dropped when offline.
    pub async fn send_cursor(&self, room_id: &str, x: f32, y: f32) -> Result<(), ProtocolError> {
        if self.state().await != ClientState::Connected {
            return Ok(());
        }
        self.send(&ClientMessage::CursorMove {
            room_id: room_id.to_string(),
            cursor: CursorPos { x, y },
        })
        .await
    }

    pub async fn focus_section(
        &self,
        room_id: &str,
        section: Option<String>,
    ) -> Result<(), ProtocolError> {
        if self.state().await != ClientState::Connected {
            return Ok(());
        }
        self.send(&ClientMessage::SectionFocus {
            room_id: room_id.to_string(),
            section,
        })
        .await
    }

    pub async fn set_typing(&self, room_id: &str, is_typing: bool) -> Result<(), ProtocolError> {
        if self.state().await != ClientState::Connected {
            return Ok(());
        }
        let msg = if is_typing {
            ClientMessage::TypingStart {
                room_id: room_id.to_string(),
            }
        } else {
            ClientMessage::TypingStop {
                room_id: room_id.to_string(),
            }
        };
        self.send(&msg).await
    }

    pub async fn send_chat(&self, room_id: &str, text: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::ChatSend {
            room_id: room_id.to_string(),
            text: text.to_string(),
        })
        .await
    }

    /// Send a document update. While disconnected the update is queued for
    /// replay instead; the error case is a full queue.
    pub async fn send_doc_update(
        &self,
        room_id: &str,
        doc_id: Uuid,
        update: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        if self.state().await != ClientState::Connected {
            let mut queue = self.offline.lock().await;
            if !queue.enqueue(room_id.to_string(), doc_id, update) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }
        self.send(&ClientMessage::DocOp {
            room_id: room_id.to_string(),
            doc_id,
            op: DocOpPayload::Update { update },
        })
        .await
    }

    /// Open a document: ask the gateway for everything this site is
    /// missing relative to `state_vector` (empty means "send it all").
    pub async fn request_doc_sync(
        &self,
        room_id: &str,
        doc_id: Uuid,
        state_vector: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::DocOp {
            room_id: room_id.to_string(),
            doc_id,
            op: DocOpPayload::SyncRequest { state_vector },
        })
        .await
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let frame = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

fn map_event(event: ServerEvent) -> Option<ClientEvent> {
    match event {
        ServerEvent::PresenceSync { room_id, entries } => {
            Some(ClientEvent::PresenceSync { room_id, entries })
        }
        ServerEvent::Joined { room_id, entry } => Some(ClientEvent::Joined { room_id, entry }),
        ServerEvent::Left {
            room_id,
            conn_id,
            participant_id,
        } => Some(ClientEvent::Left {
            room_id,
            conn_id,
            participant_id,
        }),
        ServerEvent::PresenceUpdated { room_id, entry } => {
            Some(ClientEvent::PresenceUpdated { room_id, entry })
        }
        ServerEvent::ChatMessage {
            room_id,
            participant_id,
            display_name,
            text,
            sent_at,
        } => Some(ClientEvent::Chat {
            room_id,
            participant_id,
            display_name,
            text,
            sent_at,
        }),
        ServerEvent::DocOp {
            room_id,
            doc_id,
            op: DocOpPayload::Update { update },
        } => Some(ClientEvent::DocUpdate {
            room_id,
            doc_id,
            update,
        }),
        // A sync request never travels gateway-to-client.
        ServerEvent::DocOp { .. } => None,
    }
}
