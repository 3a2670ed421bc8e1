//! WebRTC signaling relay.
//!
//! Offers, answers and ICE candidates are routed by room membership only.
//! Payloads are forwarded verbatim and never validated; rejecting a malformed
//! offer is the receiving peer connection's job.

use std::sync::Arc;

use serde_json::Value;

use crate::error::CoordinatorError;
use crate::protocol::{ConnectionId, ServerMessage, SignalKind};
use crate::registry::{ConnectionRegistry, Delivery};
use crate::rooms::RoomStore;

pub struct SignalingRelay {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomStore>,
}

impl SignalingRelay {
    pub fn new(registry: Arc<ConnectionRegistry>, rooms: Arc<RoomStore>) -> Self {
        Self { registry, rooms }
    }

    /// Forward a handshake message from `sender` to its room.
    ///
    /// With `to` naming another current member, only that member gets it.
    /// Otherwise every member except the sender does. Returns the number of
    /// recipients the message was queued for.
    pub async fn relay(
        &self,
        sender: ConnectionId,
        kind: SignalKind,
        payload: Value,
        to: Option<ConnectionId>,
    ) -> Result<usize, CoordinatorError> {
        let code = self
            .registry
            .room_of(sender)
            .await
            .ok_or(CoordinatorError::NotJoined)?;

        let frame = ServerMessage::signal(kind, sender, payload).encode()?;

        self.rooms
            .with_room(&code, |state| {
                if !state.contains(sender) {
                    return Err(CoordinatorError::NotJoined);
                }

                match to {
                    Some(target) if target != sender && state.contains(target) => {
                        log::debug!(
                            "Relaying {} {sender} -> {target} in room {code}",
                            kind.as_str()
                        );
                        let delivered = state.send_to(target, frame) == Delivery::Delivered;
                        Ok(usize::from(delivered))
                    }
                    _ => {
                        if let Some(target) = to {
                            log::debug!(
                                "{} target {target} is not in room {code}, sending to all",
                                kind.as_str()
                            );
                        }
                        Ok(state.broadcast(&frame, Some(sender)))
                    }
                }
            })
            .await
            .unwrap_or(Err(CoordinatorError::NotJoined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, RoomCode};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomStore>,
        relay: SignalingRelay,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomStore::new(""));
        let relay = SignalingRelay::new(registry.clone(), rooms.clone());
        Fixture {
            registry,
            rooms,
            relay,
        }
    }

    /// Register a connection and put it straight into `room`.
    async fn member(fx: &Fixture, room: &str, name: &str) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        let id = fx.registry.register(tx.clone()).await;
        let code = RoomCode::parse(room).unwrap();
        fx.rooms
            .get_or_create(&code, |state| state.add_member(id, name.to_string(), tx))
            .await;
        fx.registry.set_room(id, Some(code)).await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_offer_goes_to_all_other_members() {
        let fx = fixture();
        let (a, mut rx_a) = member(&fx, "R1", "A").await;
        let (_b, mut rx_b) = member(&fx, "R1", "B").await;
        let (_c, mut rx_c) = member(&fx, "R1", "C").await;
        let (_other, mut rx_other) = member(&fx, "R2", "D").await;

        let sdp = json!({"type": "offer", "sdp": "v=0"});
        let sent = fx.relay.relay(a, SignalKind::Offer, sdp.clone(), None).await.unwrap();
        assert_eq!(sent, 2);

        for rx in [&mut rx_b, &mut rx_c] {
            let msg = ServerMessage::decode(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(msg, ServerMessage::Offer { from: a, offer: sdp.clone() });
        }
        assert!(rx_a.try_recv().is_err());
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_directed_answer_reaches_only_target() {
        let fx = fixture();
        let (a, mut rx_a) = member(&fx, "R1", "A").await;
        let (b, _rx_b) = member(&fx, "R1", "B").await;
        let (_c, mut rx_c) = member(&fx, "R1", "C").await;

        let sent = fx
            .relay
            .relay(b, SignalKind::Answer, json!({"sdp": "x"}), Some(a))
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert!(matches!(
            ServerMessage::decode(&rx_a.try_recv().unwrap()).unwrap(),
            ServerMessage::Answer { from, .. } if from == b
        ));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_target_falls_back_to_room() {
        let fx = fixture();
        let (a, _rx_a) = member(&fx, "R1", "A").await;
        let (_b, mut rx_b) = member(&fx, "R1", "B").await;
        let (outsider, _rx_o) = member(&fx, "R2", "O").await;

        let sent = fx
            .relay
            .relay(a, SignalKind::IceCandidate, json!({"candidate": "c"}), Some(outsider))
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_forwarded() {
        let fx = fixture();
        let (a, _rx_a) = member(&fx, "R1", "A").await;
        let (_b, mut rx_b) = member(&fx, "R1", "B").await;

        fx.relay
            .relay(a, SignalKind::Offer, Value::String("garbage".into()), None)
            .await
            .unwrap();
        let msg = ServerMessage::decode(&rx_b.try_recv().unwrap()).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Offer {
                from: a,
                offer: Value::String("garbage".into())
            }
        );
    }

    #[tokio::test]
    async fn test_unjoined_sender_changes_nothing() {
        let fx = fixture();
        let (_a, mut rx_a) = member(&fx, "R1", "A").await;
        let (tx, _rx) = mpsc::channel(4);
        let loner = fx.registry.register(tx).await;

        let err = fx
            .relay
            .relay(loner, SignalKind::Offer, json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err, CoordinatorError::NotJoined);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(fx.rooms.room_count().await, 1);
    }
}
