//! Room chat with history replay.
//!
//! Unlike document edits, chat lines go back to their sender too: every
//! client renders exactly what it receives. The log lives as long as the
//! room does and is replayed to each joiner as `chat_history`.

use std::sync::Arc;

use crate::error::CoordinatorError;
use crate::protocol::{ChatLine, ConnectionId, ServerMessage};
use crate::registry::ConnectionRegistry;
use crate::rooms::{ChatEntry, RoomStore};

/// Longest accepted chat message, in characters, after trimming.
pub const MAX_CHAT_CHARS: usize = 300;

/// Trim `text` and check it against the chat limits.
///
/// Over-long messages are rejected, never truncated.
pub fn validate(text: &str) -> Result<&str, CoordinatorError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CoordinatorError::EmptyMessage);
    }

    let len = trimmed.chars().count();
    if len > MAX_CHAT_CHARS {
        return Err(CoordinatorError::MessageTooLong {
            len,
            max: MAX_CHAT_CHARS,
        });
    }

    Ok(trimmed)
}

pub struct ChatBroadcaster {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomStore>,
}

impl ChatBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, rooms: Arc<RoomStore>) -> Self {
        Self { registry, rooms }
    }

    /// Append a message to the sender's room and send it to every member,
    /// the sender included.
    ///
    /// The author is the name registered at join. `claimed_name`, the
    /// username the client put in the message, is only compared and logged.
    pub async fn send(
        &self,
        sender: ConnectionId,
        claimed_name: Option<&str>,
        text: &str,
    ) -> Result<ChatEntry, CoordinatorError> {
        let connection = self
            .registry
            .get(sender)
            .await
            .ok_or(CoordinatorError::UnknownConnection(sender))?;
        let code = connection.room.ok_or(CoordinatorError::NotJoined)?;
        let author = connection.display_name.unwrap_or_default();

        let text = validate(text)?;

        if let Some(claimed) = claimed_name {
            if claimed != author {
                log::debug!("Chat from {sender} claims name {claimed:?}, registered as {author:?}");
            }
        }

        let frame = ServerMessage::ChatMessage(ChatLine {
            username: author.clone(),
            message: text.to_string(),
        })
        .encode()?;

        self.rooms
            .with_room(&code, |state| {
                if !state.contains(sender) {
                    return Err(CoordinatorError::NotJoined);
                }
                let entry = state.append_chat(author, text.to_string());
                state.broadcast(&frame, None);
                Ok(entry)
            })
            .await
            .unwrap_or(Err(CoordinatorError::NotJoined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, RoomCode};
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomStore>,
        chat: ChatBroadcaster,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomStore::new(""));
        let chat = ChatBroadcaster::new(registry.clone(), rooms.clone());
        Fixture {
            registry,
            rooms,
            chat,
        }
    }

    async fn member(fx: &Fixture, name: &str) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        let id = fx.registry.register(tx.clone()).await;
        let code = RoomCode::parse("R1").unwrap();
        fx.rooms
            .get_or_create(&code, |state| state.add_member(id, name.to_string(), tx))
            .await;
        fx.registry.set_room(id, Some(code)).await;
        fx.registry.set_display_name(id, name.to_string()).await;
        (id, rx)
    }

    fn room() -> RoomCode {
        RoomCode::parse("R1").unwrap()
    }

    #[test]
    fn test_validate_limits() {
        assert_eq!(validate("  hi  ").unwrap(), "hi");
        assert_eq!(validate(" \t\n ").unwrap_err(), CoordinatorError::EmptyMessage);
        assert!(validate(&"a".repeat(MAX_CHAT_CHARS)).is_ok());
        assert_eq!(
            validate(&"a".repeat(MAX_CHAT_CHARS + 1)).unwrap_err(),
            CoordinatorError::MessageTooLong { len: 301, max: 300 }
        );
    }

    #[test]
    fn test_validate_counts_characters_not_bytes() {
        // 300 two-byte characters
        assert!(validate(&"é".repeat(MAX_CHAT_CHARS)).is_ok());
        // Surrounding whitespace does not count
        let padded = format!("   {}   ", "a".repeat(MAX_CHAT_CHARS));
        assert!(validate(&padded).is_ok());
    }

    #[tokio::test]
    async fn test_message_reaches_everyone_including_sender() {
        let fx = fixture();
        let (_a, mut rx_a) = member(&fx, "A").await;
        let (b, mut rx_b) = member(&fx, "B").await;

        let entry = fx.chat.send(b, Some("B"), "hi").await.unwrap();
        assert_eq!(entry.seq, 0);
        assert_eq!(entry.author, "B");

        let expected = ServerMessage::ChatMessage(ChatLine {
            username: "B".into(),
            message: "hi".into(),
        });
        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(ServerMessage::decode(&rx.try_recv().unwrap()).unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_rejected_message_leaves_history_untouched() {
        let fx = fixture();
        let (a, mut rx_a) = member(&fx, "A").await;
        fx.chat.send(a, None, "first").await.unwrap();
        let _ = rx_a.try_recv();

        let long = "x".repeat(301);
        assert!(matches!(
            fx.chat.send(a, None, &long).await,
            Err(CoordinatorError::MessageTooLong { len: 301, .. })
        ));
        assert_eq!(
            fx.chat.send(a, None, "    ").await.unwrap_err(),
            CoordinatorError::EmptyMessage
        );

        assert!(rx_a.try_recv().is_err());
        let history = fx.rooms.chat_history(&room()).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "first");
    }

    #[tokio::test]
    async fn test_registered_name_wins_over_claimed() {
        let fx = fixture();
        let (a, mut rx_a) = member(&fx, "Alice").await;

        let entry = fx.chat.send(a, Some("Mallory"), "hello").await.unwrap();
        assert_eq!(entry.author, "Alice");
        match ServerMessage::decode(&rx_a.try_recv().unwrap()).unwrap() {
            ServerMessage::ChatMessage(line) => assert_eq!(line.username, "Alice"),
            other => panic!("Expected chat_message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_history_keeps_send_order() {
        let fx = fixture();
        let (a, _rx_a) = member(&fx, "A").await;
        let (b, _rx_b) = member(&fx, "B").await;

        fx.chat.send(a, None, "one").await.unwrap();
        fx.chat.send(b, None, " two ").await.unwrap();
        fx.chat.send(a, None, "three").await.unwrap();

        let history = fx.rooms.chat_history(&room()).await;
        let lines: Vec<(u64, &str, &str)> = history
            .iter()
            .map(|e| (e.seq, e.author.as_str(), e.text.as_str()))
            .collect();
        assert_eq!(lines, vec![(0, "A", "one"), (1, "B", "two"), (2, "A", "three")]);
    }

    #[tokio::test]
    async fn test_chat_before_join_is_ignored() {
        let fx = fixture();
        let (tx, _rx) = mpsc::channel(4);
        let loner = fx.registry.register(tx).await;

        assert_eq!(
            fx.chat.send(loner, None, "hello").await.unwrap_err(),
            CoordinatorError::NotJoined
        );
    }
}
