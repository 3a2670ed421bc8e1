//! WebSocket server: one task per connection, all state in the [`Coordinator`].
//!
//! Architecture:
//! ```text
//! Client A ──ws──┐                         ┌── outbox A ──ws──▶ Client A
//!                ├──▶ Coordinator::handle_frame
//! Client B ──ws──┘          │              └── outbox B ──ws──▶ Client B
//!                           ▼
//!            RoomStore (per-room lock) ── ConnectionRegistry
//! ```
//!
//! Each connection task `select!`s between the next inbound WebSocket message
//! and the next frame queued in its outbox. Outboxes are bounded; when one
//! fills up the coordinator never waits on it. It disconnects that
//! recipient instead, which closes the outbox and ends the task.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::protocol::{ConnectionId, Frame};
use crate::router::Coordinator;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Pause after an `accept()` failure that points at resource exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long to wait before accepting again after `err`.
///
/// A peer that gave up before being accepted says nothing about the
/// listener, so those retry immediately. Anything else (usually running out
/// of file descriptors) backs off so existing connections can close.
fn accept_backoff(err: &io::Error) -> Duration {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted => Duration::ZERO,
        _ => ACCEPT_BACKOFF,
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Inbound frames that were rejected or ignored
    pub rejected_messages: u64,
    pub active_rooms: usize,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
}

/// The collaboration server.
pub struct CollabServer {
    coordinator: Arc<Coordinator>,
    /// Transport-level counters; delivery counters live in the room store
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            coordinator: Arc::new(Coordinator::new(config)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the process ends.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.coordinator.config().bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until the process ends.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        self.run_until(listener, std::future::pending()).await
    }

    /// Serve on `listener` until `shutdown` resolves, then drop every room
    /// and connection. Failed accepts are logged and retried.
    pub async fn run_until(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), BoxError> {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::error!("Failed to accept connection: {e}");
                            let backoff = accept_backoff(&e);
                            if !backoff.is_zero() {
                                tokio::time::sleep(backoff).await;
                            }
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let coordinator = self.coordinator.clone();
                    let stats = self.stats.clone();

                    tokio::spawn(async move {
                        let result =
                            Self::handle_connection(stream, addr, coordinator, stats).await;
                        if let Err(e) = result {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }

                () = &mut shutdown => {
                    log::info!("Shutdown requested, closing all rooms");
                    break;
                }
            }
        }

        self.coordinator.shutdown().await;
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<Coordinator>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (outbox, mut outbound) = mpsc::channel::<Frame>(coordinator.config().outbound_capacity);
        let id = coordinator.connect(outbox).await;

        log::info!("WebSocket connection {id} established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                Self::on_frame(&coordinator, &stats, id, text.as_str()).await;
                            }

                            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                                Ok(text) => Self::on_frame(&coordinator, &stats, id, text).await,
                                Err(_) => {
                                    log::warn!("Non UTF-8 binary frame from {id}, ignored");
                                    stats.write().await.rejected_messages += 1;
                                }
                            },

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {id} closed from {addr}");
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing frame queued by the coordinator
                    frame = outbound.recv() => {
                        match frame {
                            Some(frame) => {
                                ws_sender.send(Message::text(frame.to_string())).await?;
                            }
                            None => {
                                log::debug!("Outbox of {id} closed");
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        // Same path as an explicit leave, whatever ended the loop
        coordinator.disconnect(id).await;
        stats.write().await.active_connections -= 1;

        result
    }

    async fn on_frame(
        coordinator: &Coordinator,
        stats: &RwLock<ServerStats>,
        id: ConnectionId,
        text: &str,
    ) {
        {
            let mut s = stats.write().await;
            s.total_messages += 1;
            s.total_bytes += text.len() as u64;
        }

        if coordinator.handle_frame(id, text).await.is_err() {
            stats.write().await.rejected_messages += 1;
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let delivery = self.coordinator.rooms().stats().await;
        stats.active_rooms = delivery.active_rooms;
        stats.messages_delivered = delivery.messages_delivered;
        stats.messages_dropped = delivery.messages_dropped;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.coordinator.config().bind_addr
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}
