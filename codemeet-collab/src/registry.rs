//! Connection registry: one entry per live transport connection.
//!
//! Every operation on an unknown id is a no-op. A late message racing a
//! disconnect must never take the coordinator down.

use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{ConnectionId, Frame, RoomCode};

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::Sender<Frame>;

/// Result of pushing one frame into one outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Outbox full; the frame was dropped for this recipient only.
    Dropped,
    /// Transport already gone.
    Closed,
}

/// Push without waiting, so one slow recipient never holds up the rest.
pub fn deliver(outbox: &Outbox, frame: Frame) -> Delivery {
    match outbox.try_send(frame) {
        Ok(()) => Delivery::Delivered,
        Err(TrySendError::Full(_)) => Delivery::Dropped,
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    /// Set by `join`; not unique across the system.
    pub display_name: Option<String>,
    pub room: Option<RoomCode>,
    /// Cleared as soon as the transport closes.
    pub alive: bool,
    outbox: Outbox,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its id.
    pub async fn register(&self, outbox: Outbox) -> ConnectionId {
        let id = Uuid::new_v4();
        let connection = Connection {
            id,
            display_name: None,
            room: None,
            alive: true,
            outbox,
        };
        self.connections.write().await.insert(id, connection);
        id
    }

    /// Remove a connection. Leaving its room is the caller's job and must
    /// happen first, see `Coordinator::disconnect`.
    pub(crate) async fn unregister(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.write().await.remove(&id)
    }

    pub async fn set_room(&self, id: ConnectionId, room: Option<RoomCode>) {
        if let Some(connection) = self.connections.write().await.get_mut(&id) {
            connection.room = room;
        }
    }

    pub async fn room_of(&self, id: ConnectionId) -> Option<RoomCode> {
        self.connections.read().await.get(&id).and_then(|c| c.room.clone())
    }

    pub async fn set_display_name(&self, id: ConnectionId, name: String) {
        if let Some(connection) = self.connections.write().await.get_mut(&id) {
            connection.display_name = Some(name);
        }
    }

    pub async fn display_name(&self, id: ConnectionId) -> Option<String> {
        self.connections
            .read()
            .await
            .get(&id)
            .and_then(|c| c.display_name.clone())
    }

    /// A clone of the connection's outbox, if it is still alive.
    pub async fn outbox(&self, id: ConnectionId) -> Option<Outbox> {
        self.connections
            .read()
            .await
            .get(&id)
            .filter(|c| c.alive)
            .map(|c| c.outbox.clone())
    }

    /// Send one frame to one connection. Closed connections drop it silently.
    pub async fn send_to(&self, id: ConnectionId, frame: Frame) -> Delivery {
        match self.outbox(id).await {
            Some(outbox) => deliver(&outbox, frame),
            None => Delivery::Closed,
        }
    }

    pub async fn mark_closed(&self, id: ConnectionId) {
        if let Some(connection) = self.connections.write().await.get_mut(&id) {
            connection.alive = false;
        }
    }

    pub async fn is_alive(&self, id: ConnectionId) -> bool {
        self.connections
            .read()
            .await
            .get(&id)
            .is_some_and(|c| c.alive)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Drop every connection; their outboxes close once the registry's
    /// senders are gone.
    pub(crate) async fn clear(&self) {
        self.connections.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_unregister() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);

        let id = registry.register(tx).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.is_alive(id).await);
        assert!(registry.room_of(id).await.is_none());

        let removed = registry.unregister(id).await.unwrap();
        assert_eq!(removed.id, id);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_set_room_and_name() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = registry.register(tx).await;
        let room = RoomCode::parse("r1").unwrap();

        registry.set_room(id, Some(room.clone())).await;
        registry.set_display_name(id, "Alice".into()).await;
        assert_eq!(registry.room_of(id).await, Some(room));
        assert_eq!(registry.display_name(id).await.as_deref(), Some("Alice"));

        registry.set_room(id, None).await;
        assert!(registry.room_of(id).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_connection_is_noop() {
        let registry = ConnectionRegistry::new();
        let ghost = Uuid::new_v4();

        registry.set_room(ghost, RoomCode::parse("r1").ok()).await;
        registry.mark_closed(ghost).await;
        assert!(registry.room_of(ghost).await.is_none());
        assert!(registry.unregister(ghost).await.is_none());
        assert_eq!(registry.send_to(ghost, Frame::from("x")).await, Delivery::Closed);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_send_to_respects_liveness() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        let id = registry.register(tx).await;

        assert_eq!(registry.send_to(id, Frame::from("one")).await, Delivery::Delivered);
        assert_eq!(&*rx.recv().await.unwrap(), "one");

        registry.mark_closed(id).await;
        assert_eq!(registry.send_to(id, Frame::from("two")).await, Delivery::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);

        assert_eq!(deliver(&tx, Frame::from("a")), Delivery::Delivered);
        assert_eq!(deliver(&tx, Frame::from("b")), Delivery::Dropped);

        drop(rx);
        assert_eq!(deliver(&tx, Frame::from("c")), Delivery::Closed);
    }
}
