//! Document sync: last-writer-wins snapshots.
//!
//! The room keeps only the latest text. An edit replaces it and goes out to
//! every other member as `code_update`; it is never echoed to its sender.
//! Edits from one sender arrive in order because each connection is handled
//! sequentially and every outbox is FIFO.

use std::sync::Arc;

use crate::error::CoordinatorError;
use crate::protocol::{ConnectionId, ServerMessage};
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomStore;

pub struct DocumentSync {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomStore>,
}

impl DocumentSync {
    pub fn new(registry: Arc<ConnectionRegistry>, rooms: Arc<RoomStore>) -> Self {
        Self { registry, rooms }
    }

    /// Store `text` as the room's latest snapshot and send it to the other
    /// members. Returns the number of members it was queued for.
    pub async fn change(
        &self,
        sender: ConnectionId,
        text: String,
    ) -> Result<usize, CoordinatorError> {
        let code = self
            .registry
            .room_of(sender)
            .await
            .ok_or(CoordinatorError::NotJoined)?;

        let frame = ServerMessage::CodeUpdate { code: text.clone() }.encode()?;

        self.rooms
            .with_room(&code, |state| {
                if !state.contains(sender) {
                    return Err(CoordinatorError::NotJoined);
                }
                state.set_latest_text(text);
                Ok(state.broadcast(&frame, Some(sender)))
            })
            .await
            .unwrap_or(Err(CoordinatorError::NotJoined))
    }
}
