//! Room-scoped fan-out of typed events and state snapshots.
//!
//! Every room gets one broadcast channel; players and spectators subscribe
//! to it and the hub forwards messages to their sockets. Delivery is
//! per-room FIFO on one node and best-effort per subscriber: a lagging
//! spectator loses messages without affecting anyone else.

use std::collections::HashMap;

use protocol::{CHANNEL_BUFFER_SIZE, RoomMessage};
use tokio::sync::RwLock;
use tokio::sync::broadcast;

use crate::module::ActionResult;

pub struct Broadcaster {
    rooms: RwLock<HashMap<String, broadcast::Sender<RoomMessage>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Broadcaster {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribes to a room, creating its channel on first use.
    pub async fn subscribe(&self, room_id: &str) -> broadcast::Receiver<RoomMessage> {
        {
            let rooms = self.rooms.read().await;
            if let Some(sender) = rooms.get(room_id) {
                return sender.subscribe();
            }
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_BUFFER_SIZE).0)
            .subscribe()
    }

    /// Publishes one message to a room. A room without subscribers simply
    /// swallows the message.
    pub async fn publish(&self, room_id: &str, message: RoomMessage) {
        let rooms = self.rooms.read().await;
        if let Some(sender) = rooms.get(room_id) {
            // An error only means there are no receivers right now.
            let _ = sender.send(message);
        }
    }

    /// Publishes the effects of an [`ActionResult`]: every event first,
    /// then the state snapshot if one was produced.
    pub async fn publish_result(&self, room_id: &str, result: &ActionResult) {
        for event in &result.events {
            self.publish(
                room_id,
                RoomMessage::GameEvent {
                    room_id: room_id.to_string(),
                    name: event.name.clone(),
                    data: event.data.clone(),
                    timestamp: event.timestamp,
                },
            )
            .await;
        }
        if let Some(state) = &result.new_state {
            self.publish(
                room_id,
                RoomMessage::GameState {
                    room_id: room_id.to_string(),
                    state: state.clone(),
                },
            )
            .await;
        }
    }

    /// Drops a room's channel; outstanding receivers observe a close.
    pub async fn drop_room(&self, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        rooms.remove(room_id);
    }

    /// Number of live subscribers of a room.
    pub async fn subscriber_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::GameEvent;
    use serde_json::json;

    fn chat(room: &str, text: &str) -> RoomMessage {
        RoomMessage::ChatMessage {
            room_id: room.into(),
            user_id: "u1".into(),
            user_name: "Ada".into(),
            text: text.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn per_room_fifo_order() {
        let broadcaster = Broadcaster::new();
        let mut receiver = broadcaster.subscribe("room-a").await;

        for n in 0..5 {
            broadcaster.publish("room-a", chat("room-a", &format!("m{n}"))).await;
        }
        for n in 0..5 {
            match receiver.recv().await.unwrap() {
                RoomMessage::ChatMessage { text, .. } => assert_eq!(text, format!("m{n}")),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let broadcaster = Broadcaster::new();
        let mut receiver_a = broadcaster.subscribe("room-a").await;
        let mut receiver_b = broadcaster.subscribe("room-b").await;

        broadcaster.publish("room-a", chat("room-a", "only-a")).await;
        match receiver_a.recv().await.unwrap() {
            RoomMessage::ChatMessage { text, .. } => assert_eq!(text, "only-a"),
            other => panic!("unexpected message {other:?}"),
        }
        assert!(matches!(
            receiver_b.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn action_result_broadcasts_events_before_state() {
        let broadcaster = Broadcaster::new();
        let mut receiver = broadcaster.subscribe("room-a").await;

        let result = ActionResult::ok(json!({"pos": 3}))
            .with_event(GameEvent::new("DiceRolled", json!({"value": 3})))
            .with_event(GameEvent::new("PieceMoved", json!({"to": 3})));
        broadcaster.publish_result("room-a", &result).await;

        match receiver.recv().await.unwrap() {
            RoomMessage::GameEvent { name, .. } => assert_eq!(name, "DiceRolled"),
            other => panic!("unexpected message {other:?}"),
        }
        match receiver.recv().await.unwrap() {
            RoomMessage::GameEvent { name, .. } => assert_eq!(name, "PieceMoved"),
            other => panic!("unexpected message {other:?}"),
        }
        match receiver.recv().await.unwrap() {
            RoomMessage::GameState { state, .. } => assert_eq!(state["pos"], 3),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_stop_others() {
        let broadcaster = Broadcaster::new();
        // The laggard never drains its receiver.
        let _laggard = broadcaster.subscribe("room-a").await;
        let mut keen = broadcaster.subscribe("room-a").await;

        // Overflow the channel capacity.
        for n in 0..(CHANNEL_BUFFER_SIZE + 16) {
            broadcaster.publish("room-a", chat("room-a", &format!("m{n}"))).await;
        }
        // The keen subscriber lags too (it read nothing while we flooded),
        // but recovers and keeps receiving newer messages.
        loop {
            match keen.recv().await {
                Ok(RoomMessage::ChatMessage { .. }) => break,
                Ok(other) => panic!("unexpected message {other:?}"),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("unexpected error {err}"),
            }
        }
    }

    #[tokio::test]
    async fn dropped_room_closes_receivers() {
        let broadcaster = Broadcaster::new();
        let mut receiver = broadcaster.subscribe("room-a").await;
        broadcaster.drop_room("room-a").await;
        assert!(matches!(
            receiver.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
