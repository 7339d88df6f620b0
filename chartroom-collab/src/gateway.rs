//! WebSocket connection gateway.
//!
//! Owns one long-lived connection per client and multiplexes them into
//! per-case rooms:
//!
//! ```text
//! Client ── ws://host:port/collab?token=…
//!    │
//!    ▼  (verify credential before any room logic)
//! ┌─────────────────────────────────────────────┐
//! │ per connection                              │
//! │   inbound loop ──► dispatch ──► registry    │
//! │                              ──► presence   │
//! │                              ──► doc engine │
//! │   writer loop ◄── OutboundQueue ◄── fan-out │
//! └─────────────────────────────────────────────┘
//!                     ▲
//!     one subscriber task per room channel feeds
//!     every local member's queue from the bus
//! ```
//!
//! The outbound queue decouples a slow client from the bus subscriber: a
//! consumer that cannot keep up first loses old ephemeral frames, and is
//! disconnected outright only when durable traffic alone overflows the
//! bound.
//!
//! A connection that disappears without a goodbye is indistinguishable
//! from a silent one until its heartbeat clock runs out; the timeout is
//! treated as an implicit close and runs the exact same cleanup path,
//! emitting one `left` announcement per joined room.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::bus::{BusPayload, FanoutBus};
use crate::docsync::DocumentEngine;
use crate::identity::{epoch_secs, IdentityVerifier};
use crate::outbound::{OutboundQueue, PushResult};
use crate::presence::{PresenceEntry, PresenceStore};
use crate::protocol::{
    doc_channel, room_channel, BusEnvelope, BusFrame, ClientMessage, DocOpPayload, RoomId,
    ServerEvent,
};
use crate::registry::{ConnectionHandle, RoomRegistry};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Expected client heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is treated as closed. Keep at
    /// least 3x the interval so transient network jitter cannot evict a
    /// live participant.
    pub heartbeat_timeout: Duration,
    /// Outbound queue bound per connection
    pub outbound_queue_bound: usize,
    /// Minimum gap between republished cursor updates per connection
    pub cursor_min_interval: Duration,
    /// Maximum accepted chat message length in characters
    pub max_chat_len: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            outbound_queue_bound: 256,
            cursor_min_interval: Duration::from_millis(50),
            max_chat_len: 4000,
        }
    }
}

/// Gateway counters.
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub auth_failures: u64,
    pub frames_in: u64,
    pub bytes_in: u64,
    pub malformed_frames: u64,
    pub connections_force_closed: u64,
}

/// Point-in-time view served by the health endpoint.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub bus_healthy: bool,
    pub active_connections: u64,
    pub active_rooms: usize,
}

/// Cheap cloneable handle for liveness probes, usable without a reference
/// to the gateway itself.
#[derive(Clone)]
pub struct HealthHandle {
    bus: Arc<FanoutBus>,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<GatewayStats>>,
}

impl HealthHandle {
    pub fn new(
        bus: Arc<FanoutBus>,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<GatewayStats>>,
    ) -> Self {
        Self {
            bus,
            registry,
            stats,
        }
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            bus_healthy: self.bus.healthy(),
            active_connections: self.stats.read().await.active_connections,
            active_rooms: self.registry.room_count().await,
        }
    }
}

/// The connection gateway for one instance.
pub struct CollabGateway {
    config: GatewayConfig,
    instance_id: Uuid,
    verifier: Arc<IdentityVerifier>,
    registry: Arc<RoomRegistry>,
    presence: Arc<PresenceStore>,
    engine: Arc<DocumentEngine>,
    bus: Arc<FanoutBus>,
    stats: Arc<RwLock<GatewayStats>>,
    room_tasks: Mutex<HashMap<RoomId, JoinHandle<()>>>,
    doc_tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl CollabGateway {
    pub fn new(
        config: GatewayConfig,
        verifier: Arc<IdentityVerifier>,
        bus: Arc<FanoutBus>,
        engine: Arc<DocumentEngine>,
    ) -> Arc<Self> {
        let presence = Arc::new(PresenceStore::new(config.cursor_min_interval));
        Arc::new(Self {
            config,
            instance_id: Uuid::new_v4(),
            verifier,
            registry: Arc::new(RoomRegistry::new()),
            presence,
            engine,
            bus,
            stats: Arc::new(RwLock::new(GatewayStats::default())),
            room_tasks: Mutex::new(HashMap::new()),
            doc_tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.presence
    }

    pub fn engine(&self) -> &Arc<DocumentEngine> {
        &self.engine
    }

    pub fn bus(&self) -> &Arc<FanoutBus> {
        &self.bus
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> GatewayStats {
        self.stats.read().await.clone()
    }

    pub fn health_handle(&self) -> HealthHandle {
        HealthHandle::new(self.bus.clone(), self.registry.clone(), self.stats.clone())
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collab gateway listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream, addr).await {
                    log::debug!("Connection from {addr} ended: {e}");
                }
            });
        }
    }

    /// Handle a single connection for its whole life.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut credential: Option<String> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            credential = extract_credential(req);
            Ok(resp)
        })
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Authentication comes before any room logic; a bad credential
        // never touches the registry or the presence store.
        let identity = match self.verifier.verify(credential.as_deref().unwrap_or("")) {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!("Rejected connection from {addr}: {e}");
                self.stats.write().await.auth_failures += 1;
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(());
            }
        };

        let queue = Arc::new(OutboundQueue::new(self.config.outbound_queue_bound));
        let handle = Arc::new(ConnectionHandle::new(identity, queue.clone()));
        log::info!(
            "Connection {} established for {} ({addr})",
            handle.conn_id,
            handle.identity.display_name
        );
        {
            let mut stats = self.stats.write().await;
            stats.total_connections += 1;
            stats.active_connections += 1;
        }

        // Writer loop: drain the outbound queue at the client's pace.
        let writer_queue = queue.clone();
        let writer = tokio::spawn(async move {
            while let Some(item) = writer_queue.pop().await {
                if ws_sender
                    .send(Message::Binary(item.frame.to_vec().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        // Inbound loop.
        let mut last_heartbeat = Instant::now();
        let mut check = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            last_heartbeat = Instant::now();
                            {
                                let mut stats = self.stats.write().await;
                                stats.frames_in += 1;
                                stats.bytes_in += bytes.len() as u64;
                            }
                            match ClientMessage::decode(&bytes) {
                                Ok(message) => Self::dispatch(&self, &handle, message).await,
                                Err(e) => {
                                    // Malformed frames are dropped; the
                                    // connection stays open.
                                    log::warn!("Malformed frame from {}: {e}", handle.conn_id);
                                    self.stats.write().await.malformed_frames += 1;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            last_heartbeat = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {} closed", handle.conn_id);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::debug!("Transport error on {}: {e}", handle.conn_id);
                            break;
                        }
                    }
                }
                _ = check.tick() => {
                    if queue.is_closed() {
                        if queue.overflowed() {
                            log::warn!(
                                "Force-closing slow consumer {} (shed {} ephemeral frames)",
                                handle.conn_id,
                                queue.shed_count()
                            );
                            self.stats.write().await.connections_force_closed += 1;
                        }
                        break;
                    }
                    if last_heartbeat.elapsed() > self.config.heartbeat_timeout {
                        log::info!("Heartbeat timeout for {}", handle.conn_id);
                        break;
                    }
                }
            }
        }

        Self::cleanup_connection(&self, &handle).await;
        queue.close();
        let _ = writer.await;
        self.stats.write().await.active_connections -= 1;
        Ok(())
    }

    async fn dispatch(gateway: &Arc<Self>, handle: &Arc<ConnectionHandle>, msg: ClientMessage) {
        match msg {
            ClientMessage::JoinRoom { room_id } => {
                Self::handle_join(gateway, handle, &room_id).await;
            }
            ClientMessage::LeaveRoom { room_id } => {
                Self::handle_leave(gateway, handle, &room_id).await;
            }
            ClientMessage::Heartbeat => {
                Self::handle_heartbeat(gateway, handle).await;
            }
            ClientMessage::CursorMove { room_id, cursor } => {
                if !handle.is_member(&room_id).await {
                    return;
                }
                let room = gateway.presence.room(&room_id).await;
                let republished = room.lock().await.apply_cursor(handle.conn_id, cursor);
                if let Some(entry) = republished {
                    gateway.publish(
                        &room_channel(&room_id),
                        Some(handle.conn_id),
                        BusFrame::PresenceUpdated { room_id, entry },
                    );
                }
            }
            ClientMessage::SectionFocus { room_id, section } => {
                if !handle.is_member(&room_id).await {
                    return;
                }
                let room = gateway.presence.room(&room_id).await;
                let updated = room.lock().await.apply_focus(handle.conn_id, section);
                if let Some(entry) = updated {
                    gateway.publish(
                        &room_channel(&room_id),
                        Some(handle.conn_id),
                        BusFrame::PresenceUpdated { room_id, entry },
                    );
                }
            }
            ClientMessage::TypingStart { room_id } => {
                Self::handle_typing(gateway, handle, &room_id, true).await;
            }
            ClientMessage::TypingStop { room_id } => {
                Self::handle_typing(gateway, handle, &room_id, false).await;
            }
            ClientMessage::ChatSend { room_id, text } => {
                Self::handle_chat(gateway, handle, &room_id, text).await;
            }
            ClientMessage::DocOp {
                room_id,
                doc_id,
                op,
            } => {
                Self::handle_doc_op(gateway, handle, &room_id, doc_id, op).await;
            }
        }
    }

    async fn handle_join(gateway: &Arc<Self>, handle: &Arc<ConnectionHandle>, room_id: &str) {
        let newly_joined = gateway.registry.join(handle.clone(), room_id).await;

        let room = gateway.presence.room(room_id).await;
        let (entry, local_view) = {
            let mut presence = room.lock().await;
            presence.begin_join(PresenceEntry::new(handle.conn_id, &handle.identity));
            let Some(entry) = presence.activate(handle.conn_id) else {
                return;
            };
            (entry, presence.snapshot())
        };

        // Subscribe before announcing so this instance observes snapshot
        // replies to its own request.
        Self::ensure_room_task(gateway, room_id).await;

        // Seed the joiner with the view this instance already has.
        Self::send_to(handle, &ServerEvent::PresenceSync {
            room_id: room_id.to_string(),
            entries: local_view,
        });

        // Announce (re-announce on an idempotent re-join) to everyone.
        gateway.publish(
            &room_channel(room_id),
            Some(handle.conn_id),
            BusFrame::Joined {
                room_id: room_id.to_string(),
                entry,
            },
        );

        if newly_joined {
            // Bootstrap the derived view from other instances.
            gateway.publish(
                &room_channel(room_id),
                Some(handle.conn_id),
                BusFrame::PresenceSnapshotRequest {
                    room_id: room_id.to_string(),
                },
            );
        }
        log::info!(
            "{} joined room {room_id} on connection {}",
            handle.identity.display_name,
            handle.conn_id
        );
    }

    async fn handle_leave(gateway: &Arc<Self>, handle: &Arc<ConnectionHandle>, room_id: &str) {
        // Leaving a room never joined is a no-op.
        if !gateway.registry.leave(handle, room_id).await {
            return;
        }
        let room = gateway.presence.room(room_id).await;
        let removed = room.lock().await.remove(handle.conn_id);
        if let Some(entry) = removed {
            gateway.publish(
                &room_channel(room_id),
                Some(handle.conn_id),
                BusFrame::Left {
                    room_id: room_id.to_string(),
                    conn_id: entry.conn_id,
                    participant_id: entry.participant_id,
                },
            );
        }
        gateway.presence.remove_room_if_empty(room_id).await;
        log::info!("Connection {} left room {room_id}", handle.conn_id);
    }

    /// A heartbeat refreshes the entry in every joined room and
    /// republishes it, keeping derived copies on other instances from
    /// being swept while the participant is idle but alive.
    async fn handle_heartbeat(gateway: &Arc<Self>, handle: &Arc<ConnectionHandle>) {
        for room_id in handle.joined_rooms().await {
            let room = gateway.presence.room(&room_id).await;
            let entry = {
                let mut presence = room.lock().await;
                presence.refresh(handle.conn_id);
                presence.activate(handle.conn_id)
            };
            if let Some(entry) = entry {
                gateway.publish(
                    &room_channel(&room_id),
                    Some(handle.conn_id),
                    BusFrame::PresenceUpdated { room_id, entry },
                );
            }
        }
    }

    async fn handle_typing(
        gateway: &Arc<Self>,
        handle: &Arc<ConnectionHandle>,
        room_id: &str,
        is_typing: bool,
    ) {
        if !handle.is_member(room_id).await {
            return;
        }
        let room = gateway.presence.room(room_id).await;
        let updated = room.lock().await.set_typing(handle.conn_id, is_typing);
        if let Some(entry) = updated {
            gateway.publish(
                &room_channel(room_id),
                Some(handle.conn_id),
                BusFrame::PresenceUpdated {
                    room_id: room_id.to_string(),
                    entry,
                },
            );
        }
    }

    async fn handle_chat(
        gateway: &Arc<Self>,
        handle: &Arc<ConnectionHandle>,
        room_id: &str,
        text: String,
    ) {
        if !handle.is_member(room_id).await {
            log::debug!("Chat from non-member {} for {room_id}", handle.conn_id);
            return;
        }
        if text.trim().is_empty() || text.chars().count() > gateway.config.max_chat_len {
            log::warn!("Rejected chat message from {} (empty or too long)", handle.conn_id);
            return;
        }
        gateway.publish(
            &room_channel(room_id),
            Some(handle.conn_id),
            BusFrame::Chat {
                room_id: room_id.to_string(),
                participant_id: handle.identity.id,
                display_name: handle.identity.display_name.clone(),
                text,
                sent_at: epoch_secs(),
            },
        );
    }

    async fn handle_doc_op(
        gateway: &Arc<Self>,
        handle: &Arc<ConnectionHandle>,
        room_id: &str,
        doc_id: Uuid,
        op: DocOpPayload,
    ) {
        if !handle.is_member(room_id).await {
            return;
        }
        Self::ensure_doc_task(gateway, doc_id).await;
        match op {
            DocOpPayload::SyncRequest { state_vector } => {
                match gateway.engine.handle_sync_request(doc_id, &state_vector).await {
                    Ok(diff) => Self::send_to(handle, &ServerEvent::DocOp {
                        room_id: room_id.to_string(),
                        doc_id,
                        op: DocOpPayload::Update { update: diff },
                    }),
                    Err(e) => log::warn!("Sync request failed for doc {doc_id}: {e}"),
                }
            }
            DocOpPayload::Update { update } => {
                if let Err(e) = gateway
                    .engine
                    .integrate(room_id, doc_id, &update, Some(handle.conn_id))
                    .await
                {
                    log::warn!("Rejected doc op from {}: {e}", handle.conn_id);
                }
            }
        }
    }

    /// Registry cleanup plus one `left` announcement per room, for
    /// explicit closes and heartbeat timeouts alike.
    async fn cleanup_connection(gateway: &Arc<Self>, handle: &Arc<ConnectionHandle>) {
        let rooms = gateway.registry.remove_connection(handle).await;
        for room_id in rooms {
            let room = gateway.presence.room(&room_id).await;
            let removed = room.lock().await.remove(handle.conn_id);
            if let Some(entry) = removed {
                gateway.publish(
                    &room_channel(&room_id),
                    Some(handle.conn_id),
                    BusFrame::Left {
                        room_id: room_id.clone(),
                        conn_id: entry.conn_id,
                        participant_id: entry.participant_id,
                    },
                );
            }
            gateway.presence.remove_room_if_empty(&room_id).await;
        }
    }

    fn publish(&self, channel: &str, origin_conn: Option<Uuid>, frame: BusFrame) {
        let envelope = BusEnvelope::new(self.instance_id, origin_conn, frame);
        match envelope.encode() {
            Ok(bytes) => {
                if let Err(e) = self.bus.publish(channel, bytes) {
                    // Degraded cross-instance visibility; local members
                    // are unaffected and health reporting surfaces it.
                    log::warn!("Bus publish failed on {channel}: {e}");
                }
            }
            Err(e) => log::error!("Failed to encode bus envelope: {e}"),
        }
    }

    fn send_to(handle: &ConnectionHandle, event: &ServerEvent) {
        match event.encode() {
            Ok(bytes) => {
                let _ = handle.queue.push(Arc::new(bytes), event.class());
            }
            Err(e) => log::error!("Failed to encode event for {}: {e}", handle.conn_id),
        }
    }

    /// Encode once, push to every local member's queue.
    async fn deliver_local(
        gateway: &Arc<Self>,
        room_id: &str,
        except: Option<Uuid>,
        event: &ServerEvent,
    ) {
        let encoded = match event.encode() {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::error!("Failed to encode event for room {room_id}: {e}");
                return;
            }
        };
        let class = event.class();
        for member in gateway.registry.members_of(room_id).await {
            if Some(member.conn_id) == except {
                continue;
            }
            match member.queue.push(encoded.clone(), class) {
                PushResult::Overflowed => {
                    log::warn!("Outbound overflow on {}; connection closing", member.conn_id);
                }
                PushResult::QueuedAfterShedding(n) => {
                    log::debug!("Shed {n} ephemeral frames for {}", member.conn_id);
                }
                _ => {}
            }
        }
    }

    /// Start the room-channel subscriber for this instance if it is not
    /// already running.
    async fn ensure_room_task(gateway: &Arc<Self>, room_id: &str) {
        let mut tasks = gateway.room_tasks.lock().await;
        if let Some(task) = tasks.get(room_id) {
            if !task.is_finished() {
                return;
            }
        }
        let rx = gateway.bus.subscribe(&room_channel(room_id));
        let g = gateway.clone();
        let rid = room_id.to_string();
        tasks.insert(
            room_id.to_string(),
            tokio::spawn(async move { Self::room_subscriber(g, rid, rx).await }),
        );
    }

    /// Per-room bus subscriber: applies remote presence, feeds local
    /// members, answers snapshot requests, sweeps stale derived entries.
    /// Ends itself once the room has no local members.
    async fn room_subscriber(
        gateway: Arc<Self>,
        room_id: String,
        mut rx: broadcast::Receiver<BusPayload>,
    ) {
        let mut sweep = tokio::time::interval(gateway.config.heartbeat_interval);
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(payload) => Self::handle_bus_frame(&gateway, &room_id, &payload).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Room {room_id} subscriber lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = sweep.tick() => {
                    if gateway.registry.local_member_count(&room_id).await == 0 {
                        break;
                    }
                    let room = gateway.presence.room(&room_id).await;
                    let evicted = room.lock().await.sweep(
                        gateway.config.heartbeat_interval,
                        gateway.config.heartbeat_timeout,
                    );
                    for entry in evicted {
                        log::info!(
                            "Evicted stale presence entry {} from room {room_id}",
                            entry.conn_id
                        );
                        Self::deliver_local(&gateway, &room_id, None, &ServerEvent::Left {
                            room_id: room_id.clone(),
                            conn_id: entry.conn_id,
                            participant_id: entry.participant_id,
                        })
                        .await;
                    }
                }
            }
        }
        gateway.bus.prune(&room_channel(&room_id));
        gateway.presence.remove_room_if_empty(&room_id).await;
        gateway.room_tasks.lock().await.remove(&room_id);
        log::debug!("Room subscriber for {room_id} stopped");
    }

    async fn handle_bus_frame(gateway: &Arc<Self>, room_id: &str, payload: &[u8]) {
        let envelope = match BusEnvelope::decode(payload) {
            Ok(env) => env,
            Err(e) => {
                log::warn!("Undecodable bus frame on room {room_id}: {e}");
                return;
            }
        };
        let own = envelope.origin_instance == gateway.instance_id;

        match envelope.frame {
            BusFrame::Joined { room_id: rid, entry } if rid == room_id => {
                if !own {
                    let room = gateway.presence.room(room_id).await;
                    room.lock().await.merge_remote(entry.clone());
                }
                Self::deliver_local(gateway, room_id, envelope.origin_conn, &ServerEvent::Joined {
                    room_id: rid,
                    entry,
                })
                .await;
            }
            BusFrame::PresenceUpdated { room_id: rid, entry } if rid == room_id => {
                if !own {
                    let room = gateway.presence.room(room_id).await;
                    room.lock().await.merge_remote(entry.clone());
                }
                Self::deliver_local(
                    gateway,
                    room_id,
                    envelope.origin_conn,
                    &ServerEvent::PresenceUpdated {
                        room_id: rid,
                        entry,
                    },
                )
                .await;
            }
            BusFrame::Left {
                room_id: rid,
                conn_id,
                participant_id,
            } if rid == room_id => {
                if !own {
                    let room = gateway.presence.room(room_id).await;
                    room.lock().await.remove(conn_id);
                }
                Self::deliver_local(gateway, room_id, envelope.origin_conn, &ServerEvent::Left {
                    room_id: rid,
                    conn_id,
                    participant_id,
                })
                .await;
            }
            BusFrame::Chat {
                room_id: rid,
                participant_id,
                display_name,
                text,
                sent_at,
            } if rid == room_id => {
                Self::deliver_local(
                    gateway,
                    room_id,
                    envelope.origin_conn,
                    &ServerEvent::ChatMessage {
                        room_id: rid,
                        participant_id,
                        display_name,
                        text,
                        sent_at,
                    },
                )
                .await;
            }
            BusFrame::PresenceSnapshotRequest { room_id: rid } if rid == room_id => {
                if own {
                    return;
                }
                let room = gateway.presence.room(room_id).await;
                let owned_entries = room.lock().await.locally_owned();
                if !owned_entries.is_empty() {
                    gateway.publish(
                        &room_channel(room_id),
                        None,
                        BusFrame::PresenceSnapshotReply {
                            room_id: room_id.to_string(),
                            entries: owned_entries,
                        },
                    );
                }
            }
            BusFrame::PresenceSnapshotReply { room_id: rid, entries } if rid == room_id => {
                if own {
                    return;
                }
                let merged_view = {
                    let room = gateway.presence.room(room_id).await;
                    let mut presence = room.lock().await;
                    for entry in entries {
                        presence.merge_remote(entry);
                    }
                    presence.snapshot()
                };
                Self::deliver_local(gateway, room_id, None, &ServerEvent::PresenceSync {
                    room_id: room_id.to_string(),
                    entries: merged_view,
                })
                .await;
            }
            // Doc updates travel on their own channels; anything else on
            // this channel is a room-id mismatch and gets dropped.
            _ => {}
        }
    }

    /// Start the document-channel subscriber for this instance if it is
    /// not already running. Runs for the life of the gateway; documents
    /// outlive any one room session.
    async fn ensure_doc_task(gateway: &Arc<Self>, doc_id: Uuid) {
        let mut tasks = gateway.doc_tasks.lock().await;
        if let Some(task) = tasks.get(&doc_id) {
            if !task.is_finished() {
                return;
            }
        }
        let rx = gateway.bus.subscribe(&doc_channel(&doc_id));
        let g = gateway.clone();
        tasks.insert(
            doc_id,
            tokio::spawn(async move { Self::doc_subscriber(g, doc_id, rx).await }),
        );
    }

    async fn doc_subscriber(
        gateway: Arc<Self>,
        doc_id: Uuid,
        mut rx: broadcast::Receiver<BusPayload>,
    ) {
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    let envelope = match BusEnvelope::decode(&payload) {
                        Ok(env) => env,
                        Err(e) => {
                            log::warn!("Undecodable bus frame on doc {doc_id}: {e}");
                            continue;
                        }
                    };
                    let BusFrame::DocUpdate {
                        room_id,
                        doc_id: did,
                        update,
                    } = envelope.frame
                    else {
                        continue;
                    };
                    if did != doc_id {
                        continue;
                    }
                    if envelope.origin_instance != gateway.instance_id {
                        if let Err(e) = gateway.engine.merge_remote(did, &update).await {
                            log::warn!("Failed to merge remote update for doc {did}: {e}");
                            continue;
                        }
                    }
                    Self::deliver_local(
                        &gateway,
                        &room_id,
                        envelope.origin_conn,
                        &ServerEvent::DocOp {
                            room_id: room_id.clone(),
                            doc_id: did,
                            op: DocOpPayload::Update { update },
                        },
                    )
                    .await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Doc {doc_id} subscriber lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn extract_credential(req: &Request) -> Option<String> {
    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("token=") {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    req.headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docsync::EngineConfig;

    fn test_gateway() -> Arc<CollabGateway> {
        let bus = Arc::new(FanoutBus::new(64));
        let engine = Arc::new(DocumentEngine::new(
            Uuid::new_v4(),
            bus.clone(),
            None,
            EngineConfig::default(),
        ));
        CollabGateway::new(
            GatewayConfig::default(),
            Arc::new(IdentityVerifier::new(b"gateway-test-secret")),
            bus,
            engine,
        )
    }

    #[test]
    fn test_config_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert!(config.heartbeat_timeout >= config.heartbeat_interval * 3);
        assert_eq!(config.outbound_queue_bound, 256);
    }

    #[tokio::test]
    async fn test_initial_stats() {
        let gateway = test_gateway();
        let stats = gateway.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.auth_failures, 0);
        assert_eq!(stats.frames_in, 0);
    }

    #[tokio::test]
    async fn test_health_handle() {
        let gateway = test_gateway();
        let health = gateway.health_handle();
        let snapshot = health.snapshot().await;
        assert!(snapshot.bus_healthy);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.active_rooms, 0);

        gateway.bus().set_connected(false);
        assert!(!health.snapshot().await.bus_healthy);
    }

    #[test]
    fn test_extract_credential_query() {
        let req = Request::builder()
            .uri("ws://localhost/collab?token=abc123")
            .body(())
            .unwrap();
        assert_eq!(extract_credential(&req), Some("abc123".to_string()));
    }

    #[test]
    fn test_extract_credential_query_among_params() {
        let req = Request::builder()
            .uri("ws://localhost/collab?case=42&token=xyz&debug=1")
            .body(())
            .unwrap();
        assert_eq!(extract_credential(&req), Some("xyz".to_string()));
    }

    #[test]
    fn test_extract_credential_header() {
        let req = Request::builder()
            .uri("ws://localhost/collab")
            .header("authorization", "Bearer tok-789")
            .body(())
            .unwrap();
        assert_eq!(extract_credential(&req), Some("tok-789".to_string()));
    }

    #[test]
    fn test_extract_credential_missing() {
        let req = Request::builder()
            .uri("ws://localhost/collab?token=")
            .body(())
            .unwrap();
        assert_eq!(extract_credential(&req), None);
    }
}
