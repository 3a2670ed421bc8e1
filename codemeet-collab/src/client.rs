//! WebSocket session client for talking to the coordinator.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Join / leave, document snapshots and chat
//! - Signaling messages for the external media layer
//!
//! Everything the server sends surfaces as a [`SessionEvent`] on the
//! channel returned by [`SessionClient::take_event_rx`].

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    ChatLine, ClientMessage, ConnectionId, MembershipChange, ProtocolError, ServerMessage,
    SignalKind,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the session client.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connection established
    Connected,
    /// The coordinator assigned our connection id
    Welcome(ConnectionId),
    /// Latest document text: join replay or another member's edit
    CodeUpdate(String),
    ChatMessage(ChatLine),
    /// Chat log replayed on join
    ChatHistory(Vec<ChatLine>),
    MembersChanged(MembershipChange),
    /// Offer, answer or ICE candidate from another member
    Signal {
        kind: SignalKind,
        from: ConnectionId,
        payload: Value,
    },
    /// A request of ours was rejected
    Error(String),
    /// Connection lost
    Disconnected,
}

impl From<ServerMessage> for SessionEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Welcome { connection_id } => Self::Welcome(connection_id),
            ServerMessage::CodeUpdate { code } => Self::CodeUpdate(code),
            ServerMessage::ChatHistory { messages } => Self::ChatHistory(messages),
            ServerMessage::ChatMessage(line) => Self::ChatMessage(line),
            ServerMessage::MembersChanged(change) => Self::MembersChanged(change),
            ServerMessage::Offer { from, offer } => Self::Signal {
                kind: SignalKind::Offer,
                from,
                payload: offer,
            },
            ServerMessage::Answer { from, answer } => Self::Signal {
                kind: SignalKind::Answer,
                from,
                payload: answer,
            },
            ServerMessage::IceCandidate { from, candidate } => Self::Signal {
                kind: SignalKind::IceCandidate,
                from,
                payload: candidate,
            },
            ServerMessage::Error { message } => Self::Error(message),
        }
    }
}

/// The session client.
///
/// Manages one WebSocket connection to the coordinator. Messages are
/// queued to a writer task; a reader task turns inbound frames into events.
pub struct SessionClient {
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Id assigned by the coordinator's `welcome`
    connection_id: Arc<RwLock<Option<ConnectionId>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SessionEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SessionEvent>,

    /// Server URL
    server_url: String,
}

impl SessionClient {
    /// Create a new session client.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connection_id: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SessionEvent::Connected).await;

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };

                match ServerMessage::decode(&text) {
                    Ok(server_msg) => {
                        if let ServerMessage::Welcome { connection_id: id } = server_msg {
                            *connection_id.write().await = Some(id);
                        }
                        let _ = event_tx.send(server_msg.into()).await;
                    }
                    Err(e) => log::warn!("Undecodable message from server: {e}"),
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SessionEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. The server treats this as a leave.
    pub fn close(&mut self) {
        // Dropping the sender ends the writer task, which closes the socket
        self.outgoing_tx = None;
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        self.send_raw(encoded).await
    }

    /// Send a raw text frame, bypassing encoding.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(text.into())
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn join(&self, room: &str, username: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Join {
            room: room.to_string(),
            username: username.to_string(),
        })
        .await
    }

    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Leave { room: None }).await
    }

    /// Publish a new document snapshot.
    pub async fn send_code(&self, code: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::CodeChange {
            room: None,
            code: code.into(),
        })
        .await
    }

    pub async fn send_chat(&self, message: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::ChatMessage {
            room: None,
            username: None,
            message: message.into(),
        })
        .await
    }

    /// Send an offer, answer or ICE candidate, to one member or to the room.
    pub async fn send_signal(
        &self,
        kind: SignalKind,
        payload: Value,
        to: Option<ConnectionId>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::signal(kind, None, payload, to)).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Our connection id, once the server's `welcome` has arrived.
    pub async fn connection_id(&self) -> Option<ConnectionId> {
        *self.connection_id.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
