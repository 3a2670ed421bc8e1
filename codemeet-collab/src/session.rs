//! Session lifecycle: join, leave and disconnect.
//!
//! Per connection:
//! ```text
//! UNJOINED ──join──▶ JOINED ──leave──▶ UNJOINED (may join again)
//!                       │
//!                       └──transport close──▶ DISCONNECTED
//! ```
//!
//! This is the only place rooms are created or destroyed. Both happen inside
//! a single [`RoomStore`] critical section together with the membership
//! change, the joiner's replay and the notification to the other members.

use std::sync::Arc;

use crate::error::CoordinatorError;
use crate::protocol::{ConnectionId, MemberInfo, MembershipChange, RoomCode, ServerMessage};
use crate::registry::ConnectionRegistry;
use crate::rooms::{ChatEntry, RoomState, RoomStore};

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room: RoomCode,
    /// Every member after the join, the joiner included.
    pub members: Vec<MemberInfo>,
    /// Existing member expected to send the first offer, `None` if the
    /// joiner is alone.
    pub initiator: Option<ConnectionId>,
}

/// Result of leaving a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub room: RoomCode,
    pub left: MemberInfo,
    pub remaining: usize,
    pub room_deleted: bool,
}

pub struct SessionController {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomStore>,
    max_members: usize,
}

impl SessionController {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomStore>,
        max_members: usize,
    ) -> Self {
        Self {
            registry,
            rooms,
            max_members,
        }
    }

    /// Join `room` as `display_name`, creating the room if it does not exist.
    ///
    /// The joiner gets `code_update` and `chat_history` before anything
    /// else broadcast in the room; the existing members get
    /// `members_changed`.
    pub async fn join(
        &self,
        id: ConnectionId,
        room: &str,
        display_name: &str,
    ) -> Result<JoinOutcome, CoordinatorError> {
        let connection = self
            .registry
            .get(id)
            .await
            .ok_or(CoordinatorError::UnknownConnection(id))?;

        if let Some(current) = connection.room {
            return Err(CoordinatorError::AlreadyJoined(current));
        }

        let code = RoomCode::parse(room)?;
        let name = display_name.trim();
        if name.is_empty() {
            return Err(CoordinatorError::EmptyDisplayName);
        }

        let outbox = self
            .registry
            .outbox(id)
            .await
            .ok_or(CoordinatorError::UnknownConnection(id))?;

        let max = self.max_members;
        let outcome = self
            .rooms
            .get_or_create(&code, |state| -> Result<JoinOutcome, CoordinatorError> {
                if state.len() >= max {
                    return Err(CoordinatorError::RoomFull {
                        room: code.clone(),
                        max,
                    });
                }

                let initiator = state.members().first().map(|m| m.id);

                state.add_member(id, name.to_string(), outbox);
                replay(state, id)?;

                let members = state.members();
                let change = ServerMessage::MembersChanged(MembershipChange {
                    room: code.clone(),
                    members: members.clone(),
                    joined: state.member(id),
                    left: None,
                    initiator,
                })
                .encode()?;
                state.broadcast(&change, Some(id));

                Ok(JoinOutcome {
                    room: code.clone(),
                    members,
                    initiator,
                })
            })
            .await?;

        self.registry.set_display_name(id, name.to_string()).await;
        self.registry.set_room(id, Some(code.clone())).await;

        log::info!(
            "{name} ({id}) joined room {code}, {} member(s)",
            outcome.members.len()
        );
        Ok(outcome)
    }

    /// Leave the current room. A connection that is not in a room is left
    /// untouched and `Ok(None)` is returned.
    pub async fn leave(
        &self,
        id: ConnectionId,
    ) -> Result<Option<LeaveOutcome>, CoordinatorError> {
        let Some(code) = self.registry.room_of(id).await else {
            return Ok(None);
        };

        let outcome = self.leave_room(id, &code).await;
        self.registry.set_room(id, None).await;
        outcome
    }

    /// Remove `id` from `code` without consulting the registry, notifying
    /// the remaining members. Used when a lagging connection is evicted,
    /// possibly before its join has been recorded in the registry.
    pub async fn leave_room(
        &self,
        id: ConnectionId,
        code: &RoomCode,
    ) -> Result<Option<LeaveOutcome>, CoordinatorError> {
        let result = self
            .rooms
            .update(code, |state| -> Result<Option<LeaveOutcome>, CoordinatorError> {
                let Some(left) = state.remove_member(id) else {
                    return Ok(None);
                };

                if !state.is_empty() {
                    let change = ServerMessage::MembersChanged(MembershipChange {
                        room: code.clone(),
                        members: state.members(),
                        joined: None,
                        left: Some(left.clone()),
                        initiator: None,
                    })
                    .encode()?;
                    state.broadcast(&change, None);
                }

                Ok(Some(LeaveOutcome {
                    room: code.clone(),
                    left,
                    remaining: state.len(),
                    room_deleted: state.is_empty(),
                }))
            })
            .await;

        let outcome = result.transpose()?.flatten();
        if let Some(ref outcome) = outcome {
            log::info!(
                "{} ({id}) left room {code}, {} member(s) remaining",
                outcome.left.username,
                outcome.remaining
            );
        }
        Ok(outcome)
    }
}

/// Queue the room's latest text and full chat log for a member.
fn replay(state: &mut RoomState, id: ConnectionId) -> Result<(), CoordinatorError> {
    let text = ServerMessage::CodeUpdate {
        code: state.latest_text().to_string(),
    }
    .encode()?;
    let history = ServerMessage::ChatHistory {
        messages: state.chat_history().iter().map(ChatEntry::to_line).collect(),
    }
    .encode()?;

    state.send_to(id, text);
    state.send_to(id, history);
    Ok(())
}
