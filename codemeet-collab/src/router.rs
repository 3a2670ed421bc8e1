//! Single entry point for everything a connection sends.
//!
//! ```text
//!  raw frame ──▶ size check ──▶ decode ──▶ dispatch
//!                                            │
//!        join / leave ──────────────────────▶ SessionController
//!        code_change ───────────────────────▶ DocumentSync
//!        chat_message ──────────────────────▶ ChatBroadcaster
//!        offer / answer / ice-candidate ────▶ SignalingRelay
//! ```
//!
//! Failures never leave the connection that caused them. Depending on
//! [`CoordinatorError::disposition`] the sender either gets an `error`
//! message or nothing at all.
//!
//! Once a message has been handled, any member whose outbox overflowed
//! while it was fanned out is disconnected.

use std::sync::Arc;

use serde_json::Value;

use crate::chat::ChatBroadcaster;
use crate::config::ServerConfig;
use crate::document::DocumentSync;
use crate::error::{CoordinatorError, Disposition};
use crate::protocol::{ClientMessage, ConnectionId, RoomCode, ServerMessage, SignalKind};
use crate::registry::{ConnectionRegistry, Outbox};
use crate::rooms::RoomStore;
use crate::session::SessionController;
use crate::signaling::SignalingRelay;

/// Owns the registry and the room store and routes messages between them.
pub struct Coordinator {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomStore>,
    sessions: SessionController,
    documents: DocumentSync,
    chat: ChatBroadcaster,
    relay: SignalingRelay,
}

impl Coordinator {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomStore::new(config.default_document.clone()));

        Self {
            sessions: SessionController::new(
                registry.clone(),
                rooms.clone(),
                config.max_members_per_room,
            ),
            documents: DocumentSync::new(registry.clone(), rooms.clone()),
            chat: ChatBroadcaster::new(registry.clone(), rooms.clone()),
            relay: SignalingRelay::new(registry.clone(), rooms.clone()),
            registry,
            rooms,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomStore {
        &self.rooms
    }

    pub fn sessions(&self) -> &SessionController {
        &self.sessions
    }

    /// Register a new transport connection and greet it with its id.
    pub async fn connect(&self, outbox: Outbox) -> ConnectionId {
        let id = self.registry.register(outbox).await;

        match (ServerMessage::Welcome { connection_id: id }).encode() {
            Ok(frame) => {
                self.registry.send_to(id, frame).await;
            }
            Err(e) => log::error!("Failed to encode welcome for {id}: {e}"),
        }

        log::debug!("Connection {id} registered");
        id
    }

    /// Handle one raw inbound frame.
    ///
    /// Errors are returned for bookkeeping only; by the time this returns
    /// they have already been logged or reported to the sender.
    pub async fn handle_frame(&self, id: ConnectionId, raw: &str) -> Result<(), CoordinatorError> {
        let max = self.config.max_message_bytes;
        if raw.len() > max {
            let err = CoordinatorError::FrameTooLarge { len: raw.len(), max };
            self.report(id, "frame", &err).await;
            return Err(err);
        }

        let msg = match ClientMessage::decode(raw) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Undecodable frame from {id}: {e}");
                return Err(e.into());
            }
        };

        self.dispatch(id, msg).await
    }

    /// Route one decoded message.
    pub async fn dispatch(
        &self,
        id: ConnectionId,
        msg: ClientMessage,
    ) -> Result<(), CoordinatorError> {
        let kind = msg.kind();
        log::debug!("{kind} from {id}");

        let result = self.route(id, msg).await;
        if let Err(ref err) = result {
            self.report(id, kind, err).await;
        }
        self.evict_lagging().await;
        result
    }

    async fn route(&self, id: ConnectionId, msg: ClientMessage) -> Result<(), CoordinatorError> {
        match msg {
            ClientMessage::Join { room, username } => {
                self.sessions.join(id, &room, &username).await?;
            }
            ClientMessage::Leave { room } => {
                self.check_room_hint(id, room.as_deref()).await;
                self.sessions.leave(id).await?;
            }
            ClientMessage::CodeChange { room, code } => {
                self.check_room_hint(id, room.as_deref()).await;
                self.documents.change(id, code).await?;
            }
            ClientMessage::ChatMessage { room, username, message } => {
                self.check_room_hint(id, room.as_deref()).await;
                self.chat.send(id, username.as_deref(), &message).await?;
            }
            ClientMessage::Offer { room, offer, to } => {
                self.signal(id, SignalKind::Offer, room, offer, to).await?;
            }
            ClientMessage::Answer { room, answer, to } => {
                self.signal(id, SignalKind::Answer, room, answer, to).await?;
            }
            ClientMessage::IceCandidate { room, candidate, to } => {
                self.signal(id, SignalKind::IceCandidate, room, candidate, to).await?;
            }
        }
        Ok(())
    }

    async fn signal(
        &self,
        id: ConnectionId,
        kind: SignalKind,
        room: Option<String>,
        payload: Value,
        to: Option<ConnectionId>,
    ) -> Result<(), CoordinatorError> {
        self.check_room_hint(id, room.as_deref()).await;
        self.relay.relay(id, kind, payload, to).await?;
        Ok(())
    }

    /// The `room` field after join is advisory. Routing always uses the
    /// registered room; a different hint is only worth a warning.
    async fn check_room_hint(&self, id: ConnectionId, hint: Option<&str>) {
        let Some(hint) = hint else { return };
        let Some(joined) = self.registry.room_of(id).await else { return };

        match RoomCode::parse(hint) {
            Ok(code) if code == joined => {}
            _ => log::warn!("{id} named room {hint:?} but is joined to {joined}"),
        }
    }

    async fn report(&self, id: ConnectionId, kind: &str, err: &CoordinatorError) {
        match err.disposition() {
            Disposition::Ignore => {
                log::debug!("Ignoring {kind} from {id}: {err}");
            }
            Disposition::Report => {
                log::debug!("Rejected {kind} from {id}: {err}");
                match (ServerMessage::Error { message: err.to_string() }).encode() {
                    Ok(frame) => {
                        self.registry.send_to(id, frame).await;
                    }
                    Err(e) => log::error!("Failed to encode error for {id}: {e}"),
                }
            }
        }
    }

    /// Transport closed: behave as if the connection sent `leave`, then
    /// forget it. Safe to call more than once.
    pub async fn disconnect(&self, id: ConnectionId) {
        self.close(id).await;
        self.evict_lagging().await;
    }

    async fn close(&self, id: ConnectionId) {
        self.registry.mark_closed(id).await;

        if let Err(e) = self.sessions.leave(id).await {
            log::error!("Leave on disconnect failed for {id}: {e}");
        }

        if self.registry.unregister(id).await.is_some() {
            log::debug!("Connection {id} unregistered");
        }
    }

    /// Disconnect every member that lost a frame to a full outbox. Dropping
    /// the last senders of its outbox ends its transport task, and the
    /// `members_changed` for its departure may overflow someone else, hence
    /// the loop.
    async fn evict_lagging(&self) {
        loop {
            let lagging = self.rooms.take_lagging().await;
            if lagging.is_empty() {
                break;
            }
            for (id, code) in lagging {
                log::warn!("Disconnecting {id}: outbox overflowed in room {code}");
                self.registry.mark_closed(id).await;
                if let Err(e) = self.sessions.leave_room(id, &code).await {
                    log::error!("Evicting {id} from room {code} failed: {e}");
                }
                self.close(id).await;
            }
        }
    }

    /// Drop every room and every connection. Outboxes close with them, which
    /// ends each connection's task.
    pub async fn shutdown(&self) {
        self.rooms.clear().await;
        self.registry.clear().await;
        log::info!("Coordinator shut down");
    }
}
