//! Typed messages exchanged over the realtime connection.
//!
//! Three message families exist:
//! - [`HandshakeRequest`] / [`HandshakeReply`]: the first exchange on a fresh
//!   websocket, before any command is accepted.
//! - [`ClientCommand`] / [`ServerReply`]: request/response pairs on one
//!   connection. A reply always goes only to the commanding connection.
//! - [`RoomMessage`]: events fanned out to everyone subscribed to a room.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// First frame a client sends after the websocket upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Opaque credential checked by the server-side authenticator.
    pub token: String,
}

/// Server answer to the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeReply {
    /// The connection is authenticated and commands are accepted now.
    Welcome {
        user_id: String,
        user_name: String,
        /// Set when a disconnect ticket existed and the session resumed
        /// into that room.
        resumed_room: Option<String>,
    },
    /// The credential was rejected; the server closes the socket next.
    Rejected { reason: String },
}

/// Commands a client may invoke once authenticated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    CreateRoom {
        template_name: String,
    },
    /// `room` is either an opaque room id or a 5-char short code.
    JoinRoom {
        room: String,
    },
    LeaveRoom {
        room_id: String,
    },
    SpectateRoom {
        room_id: String,
    },
    StopSpectating {
        room_id: String,
    },
    PerformAction {
        room_id: String,
        action: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },
    GetLegalActions {
        room_id: String,
    },
    GetState {
        room_id: String,
    },
    SendChatMessage {
        room_id: String,
        message: String,
    },
    /// Keep-alive; refreshes the heartbeat score of this connection.
    Heartbeat,
}

impl ClientCommand {
    /// Short action name used for rate-limit accounting and error replies.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::CreateRoom { .. } => "create_room",
            ClientCommand::JoinRoom { .. } => "join_room",
            ClientCommand::LeaveRoom { .. } => "leave_room",
            ClientCommand::SpectateRoom { .. } => "spectate_room",
            ClientCommand::StopSpectating { .. } => "stop_spectating",
            ClientCommand::PerformAction { .. } => "perform_action",
            ClientCommand::GetLegalActions { .. } => "get_legal_actions",
            ClientCommand::GetState { .. } => "get_state",
            ClientCommand::SendChatMessage { .. } => "send_chat_message",
            ClientCommand::Heartbeat => "heartbeat",
        }
    }
}

/// Direct replies to [`ClientCommand`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    CreateRoomResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        short_code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    JoinRoomResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        seat_index: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ActionReply {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_state: Option<Value>,
    },
    LegalActions {
        actions: Vec<String>,
    },
    State {
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<Value>,
    },
    Acknowledged,
}

/// Events fanned out to every subscriber of a room.
///
/// Per-room FIFO holds for messages originating on one node; there is no
/// ordering between rooms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomMessage {
    GameState {
        room_id: String,
        state: Value,
    },
    PlayerJoined {
        room_id: String,
        user_id: String,
        user_name: String,
        seat_index: u8,
    },
    PlayerLeft {
        room_id: String,
        user_id: String,
        user_name: String,
    },
    PlayerDisconnected {
        room_id: String,
        user_id: String,
        user_name: String,
        grace_period_seconds: u64,
    },
    PlayerReconnected {
        room_id: String,
        user_id: String,
        user_name: String,
    },
    GameEvent {
        room_id: String,
        name: String,
        data: Value,
        timestamp: DateTime<Utc>,
    },
    /// Only ever delivered to the connection whose action failed, never
    /// broadcast to the room.
    ActionError {
        action: String,
        message: String,
    },
    ChatMessage {
        room_id: String,
        user_id: String,
        user_name: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_command_round_trips_through_json() {
        let cmd = ClientCommand::PerformAction {
            room_id: "abc123".into(),
            action: "roll".into(),
            payload: serde_json::json!({"steps": 3}),
            command_id: Some("c-1".into()),
        };
        let text = serde_json::to_string(&cmd).unwrap();
        let back: ClientCommand = serde_json::from_str(&text).unwrap();
        assert_eq!(back.name(), "perform_action");
    }

    #[test]
    fn perform_action_payload_defaults_to_null() {
        let text = r#"{"type":"perform_action","room_id":"ab","action":"roll"}"#;
        let cmd: ClientCommand = serde_json::from_str(text).unwrap();
        match cmd {
            ClientCommand::PerformAction { payload, command_id, .. } => {
                assert!(payload.is_null());
                assert!(command_id.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn room_message_tags_are_snake_case() {
        let msg = RoomMessage::PlayerDisconnected {
            room_id: "r".into(),
            user_id: "u".into(),
            user_name: "n".into(),
            grace_period_seconds: 15,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "player_disconnected");
        assert_eq!(v["grace_period_seconds"], 15);
    }
}
