//! Room store: room code → members, latest document text and chat log.
//!
//! Each room sits behind its own mutex and every mutation of a room
//! (membership, text, chat) runs under it, so a joiner reading the latest
//! text never interleaves with a concurrent edit. The room table is
//! write-locked only to change membership, which keeps "a room exists iff it
//! has members" atomic: [`RoomStore::get_or_create`] and
//! [`RoomStore::update`] delete a room in the same
//! critical section that removed its last member.
//!
//! Fan-out goes through each member's bounded outbox with `try_send`.
//! Delivery stats are atomics, so broadcasts never take an extra lock.
//!
//! A member whose outbox overflows has lost a frame and can no longer be
//! kept consistent. It is marked lagging, receives nothing further, and is
//! handed out by [`RoomStore::take_lagging`] so its connection can be closed.
//! The client reconnects and gets a fresh replay.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::protocol::{ChatLine, ConnectionId, Frame, MemberInfo, RoomCode};
use crate::registry::{self, Delivery, Outbox};

/// Snapshot of delivery health across all rooms.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicDeliveryStats {
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
}

/// One chat entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    /// Insertion position within the room, starting at 0.
    pub seq: u64,
    pub author: String,
    pub text: String,
}

impl ChatEntry {
    pub fn to_line(&self) -> ChatLine {
        ChatLine {
            username: self.author.clone(),
            message: self.text.clone(),
        }
    }
}

struct Member {
    display_name: String,
    outbox: Outbox,
}

/// Mutable state of one room. Only reachable through the room's lock.
pub struct RoomState {
    code: RoomCode,
    members: BTreeMap<ConnectionId, Member>,
    latest_text: String,
    chat: Vec<ChatEntry>,
    /// Members that overflowed their outbox; cleared when they leave
    lagging: Vec<ConnectionId>,
    /// Lagging members not yet handed to the store
    evictions: Vec<ConnectionId>,
    stats: Arc<AtomicDeliveryStats>,
}

impl RoomState {
    pub fn add_member(&mut self, id: ConnectionId, display_name: String, outbox: Outbox) {
        self.members.insert(id, Member { display_name, outbox });
    }

    /// Returns the removed member, or `None` if `id` was not a member.
    pub fn remove_member(&mut self, id: ConnectionId) -> Option<MemberInfo> {
        self.lagging.retain(|lagging| *lagging != id);
        self.members.remove(&id).map(|m| MemberInfo {
            id,
            username: m.display_name,
        })
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member(&self, id: ConnectionId) -> Option<MemberInfo> {
        self.members.get(&id).map(|m| MemberInfo {
            id,
            username: m.display_name.clone(),
        })
    }

    /// Members ordered by connection id.
    pub fn members(&self) -> Vec<MemberInfo> {
        self.members
            .iter()
            .map(|(id, m)| MemberInfo {
                id: *id,
                username: m.display_name.clone(),
            })
            .collect()
    }

    pub fn latest_text(&self) -> &str {
        &self.latest_text
    }

    pub fn set_latest_text(&mut self, text: String) {
        self.latest_text = text;
    }

    pub fn append_chat(&mut self, author: String, text: String) -> ChatEntry {
        let entry = ChatEntry {
            seq: self.chat.len() as u64,
            author,
            text,
        };
        self.chat.push(entry.clone());
        entry
    }

    pub fn chat_history(&self) -> &[ChatEntry] {
        &self.chat
    }

    pub fn is_lagging(&self, id: ConnectionId) -> bool {
        self.lagging.contains(&id)
    }

    /// Deliver a frame to a single member. Lagging members get nothing.
    pub fn send_to(&mut self, id: ConnectionId, frame: Frame) -> Delivery {
        let delivery = match self.members.get(&id) {
            Some(_) if self.is_lagging(id) => Delivery::Closed,
            Some(member) => registry::deliver(&member.outbox, frame),
            None => Delivery::Closed,
        };
        self.record(id, delivery)
    }

    /// Deliver a frame to every member except `except` and the lagging ones.
    ///
    /// Returns the number of members the frame was queued for.
    pub fn broadcast(&mut self, frame: &Frame, except: Option<ConnectionId>) -> usize {
        let deliveries: Vec<(ConnectionId, Delivery)> = self
            .members
            .iter()
            .filter(|(id, _)| Some(**id) != except && !self.lagging.contains(*id))
            .map(|(id, member)| (*id, registry::deliver(&member.outbox, frame.clone())))
            .collect();

        deliveries
            .into_iter()
            .map(|(id, delivery)| self.record(id, delivery))
            .filter(|d| *d == Delivery::Delivered)
            .count()
    }

    /// Drain the members marked lagging since the last call. They stay
    /// lagging until removed.
    pub fn take_lagging(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.evictions)
    }

    fn record(&mut self, id: ConnectionId, delivery: Delivery) -> Delivery {
        match delivery {
            Delivery::Delivered => {
                self.stats.messages_delivered.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::Dropped => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbox of {id} in room {} is full, closing it", self.code);
                if !self.lagging.contains(&id) {
                    self.lagging.push(id);
                    self.evictions.push(id);
                }
            }
            Delivery::Closed => {
                log::debug!("Connection {id} in room {} already closed", self.code);
            }
        }
        delivery
    }
}

/// A room and its serialization point.
pub struct Room {
    state: Mutex<RoomState>,
}

impl Room {
    fn new(code: RoomCode, text: String, stats: Arc<AtomicDeliveryStats>) -> Self {
        Self {
            state: Mutex::new(RoomState {
                code,
                members: BTreeMap::new(),
                latest_text: text,
                chat: Vec::new(),
                lagging: Vec::new(),
                evictions: Vec::new(),
                stats,
            }),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }
}

/// Room table: maps room codes to rooms.
///
/// Empty at construction; [`RoomStore::clear`] drops everything on shutdown.
pub struct RoomStore {
    rooms: RwLock<HashMap<RoomCode, Arc<Room>>>,
    default_document: String,
    stats: Arc<AtomicDeliveryStats>,
    lagging: Mutex<Vec<(ConnectionId, RoomCode)>>,
}

impl RoomStore {
    pub fn new(default_document: impl Into<String>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_document: default_document.into(),
            stats: Arc::new(AtomicDeliveryStats::default()),
            lagging: Mutex::new(Vec::new()),
        }
    }

    /// Run a membership change against a room, creating it first if needed.
    ///
    /// A new room starts with the default text and an empty log. If `f`
    /// leaves the room without members it is deleted again before the table
    /// lock is released.
    pub async fn get_or_create<R>(
        &self,
        code: &RoomCode,
        f: impl FnOnce(&mut RoomState) -> R,
    ) -> R {
        let mut rooms = self.rooms.write().await;

        let room = match rooms.get(code).cloned() {
            Some(room) => room,
            None => {
                let room = Arc::new(Room::new(
                    code.clone(),
                    self.default_document.clone(),
                    self.stats.clone(),
                ));
                rooms.insert(code.clone(), room.clone());
                log::info!("Room {code} created");
                room
            }
        };

        let mut state = room.lock().await;
        let result = f(&mut state);
        self.collect_lagging(&mut state).await;
        if state.is_empty() {
            rooms.remove(code);
            log::info!("Room {code} removed (empty)");
        }
        result
    }

    /// Run a membership change against an existing room.
    ///
    /// A room left without members is deleted in the same critical section.
    /// Returns `None` if the room does not exist.
    pub async fn update<R>(
        &self,
        code: &RoomCode,
        f: impl FnOnce(&mut RoomState) -> R,
    ) -> Option<R> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(code).cloned()?;

        let mut state = room.lock().await;
        let result = f(&mut state);
        self.collect_lagging(&mut state).await;
        if state.is_empty() {
            rooms.remove(code);
            log::info!("Room {code} removed (empty)");
        }
        Some(result)
    }

    /// Run a non-membership operation (text update, chat append, relay)
    /// under the room's lock. `f` must not add or remove members.
    ///
    /// Only the room lock is held while `f` runs, so rooms proceed in
    /// parallel. Returns `None` if the room does not exist.
    pub async fn with_room<R>(
        &self,
        code: &RoomCode,
        f: impl FnOnce(&mut RoomState) -> R,
    ) -> Option<R> {
        let room = self.rooms.read().await.get(code).cloned()?;
        let mut state = room.lock().await;

        // Deleted between the table read and taking the room lock
        if state.is_empty() {
            return None;
        }

        let result = f(&mut state);
        self.collect_lagging(&mut state).await;
        Some(result)
    }

    async fn collect_lagging(&self, state: &mut RoomState) {
        let lagging = state.take_lagging();
        if !lagging.is_empty() {
            let code = state.code.clone();
            self.lagging
                .lock()
                .await
                .extend(lagging.into_iter().map(|id| (id, code.clone())));
        }
    }

    /// Connections that overflowed their outbox since the last call, with
    /// the room they overflowed in. Each one is returned once.
    pub async fn take_lagging(&self) -> Vec<(ConnectionId, RoomCode)> {
        std::mem::take(&mut *self.lagging.lock().await)
    }

    pub async fn contains(&self, code: &RoomCode) -> bool {
        self.rooms.read().await.contains_key(code)
    }

    /// Member ids of a room, empty if the room does not exist.
    pub async fn members_of(&self, code: &RoomCode) -> Vec<ConnectionId> {
        self.with_room(code, |state| state.members().into_iter().map(|m| m.id).collect())
            .await
            .unwrap_or_default()
    }

    pub async fn latest_text(&self, code: &RoomCode) -> Option<String> {
        self.with_room(code, |state| state.latest_text().to_string()).await
    }

    pub async fn chat_history(&self, code: &RoomCode) -> Vec<ChatEntry> {
        self.with_room(code, |state| state.chat_history().to_vec())
            .await
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomCode> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Drop every room.
    pub async fn clear(&self) {
        let mut rooms = self.rooms.write().await;
        if !rooms.is_empty() {
            log::info!("Dropping {} room(s)", rooms.len());
        }
        rooms.clear();
    }

    /// Delivery statistics (lock-free counters plus the current room count).
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_delivered: self.stats.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_rooms: self.room_count().await,
        }
    }
}
