//! Error taxonomy for per-connection requests.
//!
//! Nothing here is fatal to the coordinator. Each error only decides what
//! the offending connection gets back, see [`CoordinatorError::disposition`].

use crate::protocol::{ConnectionId, ProtocolError, RoomCode};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    #[error("Already joined room {0}, leave it first")]
    AlreadyJoined(RoomCode),

    #[error("Not joined to any room")]
    NotJoined,

    #[error("Invalid room code {0:?}")]
    InvalidRoomCode(String),

    #[error("Display name must not be empty")]
    EmptyDisplayName,

    #[error("Room {room} is full ({max} members)")]
    RoomFull { room: RoomCode, max: usize },

    #[error("Chat message is empty")]
    EmptyMessage,

    #[error("Chat message is {len} characters, the limit is {max}")]
    MessageTooLong { len: usize, max: usize },

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What the router does with a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Log and drop; the sender hears nothing.
    Ignore,
    /// Answer the sender (and only the sender) with an `error` message.
    Report,
}

impl CoordinatorError {
    pub fn disposition(&self) -> Disposition {
        match self {
            // Protocol and state errors, plus races with disconnect
            Self::UnknownConnection(_) | Self::NotJoined | Self::Protocol(_) => Disposition::Ignore,

            Self::AlreadyJoined(_)
            | Self::InvalidRoomCode(_)
            | Self::EmptyDisplayName
            | Self::RoomFull { .. }
            | Self::EmptyMessage
            | Self::MessageTooLong { .. }
            | Self::FrameTooLarge { .. } => Disposition::Report,
        }
    }
}
