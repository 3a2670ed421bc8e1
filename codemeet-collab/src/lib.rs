//! # codemeet-collab: Session coordinator for codemeet rooms
//!
//! Accepts WebSocket participants, groups them into rooms, keeps each
//! room's latest document text and chat log, and relays WebRTC signaling
//! so members can open direct audio/video connections.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌───────────────┐
//! │ SessionClient │ ◄────────────────► │ CollabServer  │
//! │ (per user)    │   JSON {type,data} │ (one task per │
//! └───────────────┘                    │  connection)  │
//!                                      └───────┬───────┘
//!                                              ▼
//!                                      ┌───────────────┐
//!                                      │  Coordinator  │
//!                                      └───────┬───────┘
//!            ┌──────────────┬──────────────┬───┴──────────┐
//!            ▼              ▼              ▼              ▼
//!     SessionController DocumentSync ChatBroadcaster SignalingRelay
//!            └──────────────┴──────┬───────┴──────────────┘
//!                                  ▼
//!                  RoomStore ── ConnectionRegistry
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages and room codes
//! - [`error`]: Request errors and how each is answered
//! - [`config`]: Server configuration
//! - [`registry`]: Live connections and their outboxes
//! - [`rooms`]: Room table with per-room serialization
//! - [`session`]: Join / leave lifecycle, replay for joiners
//! - [`signaling`]: Offer / answer / ICE candidate relay
//! - [`document`]: Latest-text document sync without echo
//! - [`chat`]: Chat fan-out and history
//! - [`router`]: Single dispatch point ([`Coordinator`])
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket session client

pub mod chat;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod server;
pub mod session;
pub mod signaling;

// Re-exports for convenience
pub use chat::{ChatBroadcaster, MAX_CHAT_CHARS};
pub use client::{ConnectionState, SessionClient, SessionEvent};
pub use config::{ServerConfig, DEFAULT_DOCUMENT};
pub use document::DocumentSync;
pub use error::{CoordinatorError, Disposition};
pub use protocol::{
    ChatLine, ClientMessage, ConnectionId, Frame, MemberInfo, MembershipChange, ProtocolError,
    RoomCode, ServerMessage, SignalKind,
};
pub use registry::{Connection, ConnectionRegistry, Delivery, Outbox};
pub use rooms::{BroadcastStats, ChatEntry, RoomStore};
pub use router::Coordinator;
pub use server::{CollabServer, ServerStats};
pub use session::{JoinOutcome, LeaveOutcome, SessionController};
pub use signaling::SignalingRelay;
