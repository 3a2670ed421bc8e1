//! JSON wire protocol between participants and the coordinator.
//!
//! Every frame is a JSON text message, adjacently tagged:
//! ```text
//! { "type": "code_change", "data": { "room": "ABC123", "code": "x = 1" } }
//! ```
//!
//! Clients and the coordinator speak different enums ([`ClientMessage`] in,
//! [`ServerMessage`] out) because several kinds (`offer`, `chat_message`, ...)
//! share a `type` but not their fields.
//!
//! Signaling payloads are kept as raw [`serde_json::Value`]s and never
//! inspected.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoordinatorError;

/// Identifier handed out by the registry for every live transport connection.
pub type ConnectionId = Uuid;

/// A pre-encoded outbound message, shared between every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Longest accepted room code.
pub const MAX_ROOM_CODE_LEN: usize = 32;

const GENERATED_CODE_LEN: usize = 6;

/// Normalized (upper-cased, alphanumeric) room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Validate and normalize a caller-supplied code.
    ///
    /// Codes are case-insensitive: `abc123` and `ABC123` name the same room.
    pub fn parse(raw: &str) -> Result<Self, CoordinatorError> {
        let trimmed = raw.trim();
        let valid = !trimmed.is_empty()
            && trimmed.len() <= MAX_ROOM_CODE_LEN
            && trimmed.chars().all(|c| c.is_ascii_alphanumeric());

        if !valid {
            return Err(CoordinatorError::InvalidRoomCode(raw.to_string()));
        }

        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// Generate a fresh 6-character code for the "create meeting" flow.
    pub fn generate() -> Self {
        let mut code = Uuid::new_v4().simple().to_string();
        code.truncate(GENERATED_CODE_LEN);
        Self(code.to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three WebRTC handshake message kinds the relay forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }
}

/// Messages sent by a participant.
///
/// `room` is required on `join` only. On every later message it is advisory:
/// routing always uses the room the connection joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        room: String,
        username: String,
    },
    Leave {
        #[serde(default)]
        room: Option<String>,
    },
    CodeChange {
        #[serde(default)]
        room: Option<String>,
        code: String,
    },
    Offer {
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        offer: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ConnectionId>,
    },
    Answer {
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        answer: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ConnectionId>,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        candidate: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ConnectionId>,
    },
    ChatMessage {
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        username: Option<String>,
        message: String,
    },
}

impl ClientMessage {
    /// Build a signaling message of the given kind.
    pub fn signal(
        kind: SignalKind,
        room: Option<String>,
        payload: Value,
        to: Option<ConnectionId>,
    ) -> Self {
        match kind {
            SignalKind::Offer => Self::Offer { room, offer: payload, to },
            SignalKind::Answer => Self::Answer { room, answer: payload, to },
            SignalKind::IceCandidate => Self::IceCandidate { room, candidate: payload, to },
        }
    }

    /// The wire `type` of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::CodeChange { .. } => "code_change",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::ChatMessage { .. } => "chat_message",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// One chat line as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
    pub username: String,
    pub message: String,
}

/// A room member as shown to other members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: ConnectionId,
    pub username: String,
}

/// Membership notification sent to the other members of a room.
///
/// `initiator` names the existing member expected to create the
/// peer-connection offer towards a newcomer. It is `None` on departures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub room: RoomCode,
    pub members: Vec<MemberInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined: Option<MemberInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<MemberInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<ConnectionId>,
}

/// Messages sent by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every connection.
    Welcome { connection_id: ConnectionId },
    /// Latest document snapshot: join replay, or another member's edit.
    CodeUpdate { code: String },
    /// Full chat log, sent once to a joiner.
    ChatHistory { messages: Vec<ChatLine> },
    ChatMessage(ChatLine),
    MembersChanged(MembershipChange),
    Offer {
        from: ConnectionId,
        offer: Value,
    },
    Answer {
        from: ConnectionId,
        answer: Value,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        from: ConnectionId,
        candidate: Value,
    },
    /// Local error indicator; only ever sent to the offending connection.
    Error { message: String },
}

impl ServerMessage {
    pub fn signal(kind: SignalKind, from: ConnectionId, payload: Value) -> Self {
        match kind {
            SignalKind::Offer => Self::Offer { from, offer: payload },
            SignalKind::Answer => Self::Answer { from, answer: payload },
            SignalKind::IceCandidate => Self::IceCandidate { from, candidate: payload },
        }
    }

    /// Serialize once into a frame that can be cloned into many outboxes.
    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        serde_json::to_string(self)
            .map(Frame::from)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_join() {
        let raw = r#"{"type":"join","data":{"room":"abc123","username":"Alice"}}"#;
        let msg = ClientMessage::decode(raw).unwrap();

        assert_eq!(
            msg,
            ClientMessage::Join {
                room: "abc123".into(),
                username: "Alice".into(),
            }
        );
        assert_eq!(msg.kind(), "join");
    }

    #[test]
    fn test_decode_ice_candidate_kebab_type() {
        let raw = r#"{"type":"ice-candidate","data":{"room":"R1","candidate":{"sdpMid":"0"}}}"#;
        match ClientMessage::decode(raw).unwrap() {
            ClientMessage::IceCandidate { room, candidate, to } => {
                assert_eq!(room.as_deref(), Some("R1"));
                assert_eq!(candidate, json!({"sdpMid": "0"}));
                assert!(to.is_none());
            }
            other => panic!("Expected ice-candidate, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_offer_without_payload_is_null() {
        // Malformed handshakes are forwarded, not dropped.
        let raw = r#"{"type":"offer","data":{"room":"R1"}}"#;
        match ClientMessage::decode(raw).unwrap() {
            ClientMessage::Offer { offer, .. } => assert_eq!(offer, Value::Null),
            other => panic!("Expected offer, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_type_fails() {
        let raw = r#"{"type":"dance","data":{}}"#;
        assert!(matches!(
            ClientMessage::decode(raw),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(ClientMessage::decode("not json").is_err());
        assert!(ClientMessage::decode(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn test_server_chat_message_shape() {
        let msg = ServerMessage::ChatMessage(ChatLine {
            username: "B".into(),
            message: "hi".into(),
        });
        let frame = msg.encode().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(
            value,
            json!({"type": "chat_message", "data": {"username": "B", "message": "hi"}})
        );
    }

    #[test]
    fn test_server_signal_carries_sender_and_payload() {
        let from = Uuid::new_v4();
        let payload = json!({"type": "offer", "sdp": "v=0"});
        let frame = ServerMessage::signal(SignalKind::IceCandidate, from, payload.clone())
            .encode()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["data"]["candidate"], payload);
        assert_eq!(value["data"]["from"], from.to_string());
    }

    #[test]
    fn test_membership_change_omits_empty_fields() {
        let change = MembershipChange {
            room: RoomCode::parse("r1").unwrap(),
            members: Vec::new(),
            joined: None,
            left: None,
            initiator: None,
        };
        let frame = ServerMessage::MembersChanged(change.clone()).encode().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["data"]["room"], "R1");
        assert!(value["data"].get("initiator").is_none());
        assert_eq!(
            ServerMessage::decode(&frame).unwrap(),
            ServerMessage::MembersChanged(change)
        );
    }

    #[test]
    fn test_room_code_normalizes_case() {
        let lower = RoomCode::parse(" abc123 ").unwrap();
        let upper = RoomCode::parse("ABC123").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.as_str(), "ABC123");
    }

    #[test]
    fn test_room_code_rejects_invalid() {
        assert!(RoomCode::parse("").is_err());
        assert!(RoomCode::parse("   ").is_err());
        assert!(RoomCode::parse("abc-123").is_err());
        assert!(RoomCode::parse("héllo").is_err());
        assert!(RoomCode::parse(&"A".repeat(MAX_ROOM_CODE_LEN + 1)).is_err());
        assert!(RoomCode::parse(&"A".repeat(MAX_ROOM_CODE_LEN)).is_ok());
    }

    #[test]
    fn test_generated_room_code_is_valid() {
        let code = RoomCode::generate();
        assert_eq!(code.as_str().len(), GENERATED_CODE_LEN);
        assert_eq!(RoomCode::parse(code.as_str()).unwrap(), code);
    }
}
