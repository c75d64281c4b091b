//! The realtime hub: one websocket per client, JSON frames in both
//! directions.
//!
//! A connection is handshaked first (token -> identity), then commands are
//! validated, rate-limited and routed into the runtime. Room events reach
//! the socket through per-room forwarder tasks that drain the broadcast
//! channels into this connection's outbound queue; replies and action
//! errors go only to the commanding connection.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{
    ClientCommand, HandshakeReply, HandshakeRequest, RoomMessage, ServerReply, validate,
};
use room_core::error::{CoreError, CoreResult};
use room_core::module::GameCommand;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::state::AppState;

/// Outbound frames of one connection, serialized late.
enum Outbound {
    Hello(HandshakeReply),
    Reply(ServerReply),
    Event(RoomMessage),
}

impl Outbound {
    fn to_text(&self) -> Option<String> {
        let serialized = match self {
            Outbound::Hello(reply) => serde_json::to_string(reply),
            Outbound::Reply(reply) => serde_json::to_string(reply),
            Outbound::Event(event) => serde_json::to_string(event),
        };
        match serialized {
            Ok(text) => Some(text),
            Err(err) => {
                tracing::error!(%err, "failed to serialize outbound frame");
                None
            }
        }
    }
}

/// Everything the command loop knows about one live connection.
struct ConnectionSession {
    user_id: String,
    user_name: String,
    connection_id: String,
    outgoing: mpsc::Sender<Outbound>,
}

impl ConnectionSession {
    async fn send_reply(&self, reply: ServerReply) {
        let _ = self.outgoing.send(Outbound::Reply(reply)).await;
    }

    /// A failed action produces exactly one `ActionError` to the caller.
    async fn send_action_error(&self, action: &str, message: impl Into<String>) {
        let _ = self
            .outgoing
            .send(Outbound::Event(RoomMessage::ActionError {
                action: action.to_string(),
                message: message.into(),
            }))
            .await;
    }
}

/// Per-room forwarder tasks feeding this connection.
struct Subscriptions {
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Subscriptions {
    fn new() -> Self {
        Subscriptions {
            forwarders: HashMap::new(),
        }
    }

    async fn subscribe(&mut self, state: &Arc<AppState>, session: &ConnectionSession, room_id: &str) {
        if self.forwarders.contains_key(room_id) {
            return;
        }
        let mut receiver = state.runtime.broadcaster.subscribe(room_id).await;
        let outgoing = session.outgoing.clone();
        let room = room_id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        if outgoing.send(Outbound::Event(message)).await.is_err() {
                            return; // connection is gone
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(room, skipped, "connection lagged on room events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        self.forwarders.insert(room_id.to_string(), handle);
    }

    fn unsubscribe(&mut self, room_id: &str) {
        if let Some(handle) = self.forwarders.remove(room_id) {
            handle.abort();
        }
    }

    fn clear(&mut self) {
        for (_, handle) in self.forwarders.drain() {
            handle.abort();
        }
    }
}

/// Upgrades the request and runs the connection to completion.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| websocket(socket, state))
}

async fn websocket(stream: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = stream.split();

    let Some(identity) = perform_handshake(&state, &mut sender, &mut receiver).await else {
        return;
    };

    let (outgoing_tx, outgoing_rx) = mpsc::channel::<Outbound>(protocol::CHANNEL_BUFFER_SIZE);
    let session = ConnectionSession {
        user_id: identity.user_id,
        user_name: identity.user_name,
        connection_id: format!("conn-{}", Uuid::new_v4().simple()),
        outgoing: outgoing_tx,
    };

    let resumed_room = match state
        .sessions
        .on_connect(&session.user_id, &session.user_name, &session.connection_id)
        .await
    {
        Ok(resumed) => resumed,
        Err(err) => {
            tracing::error!(%err, user_id = %session.user_id, "session registration failed");
            return;
        }
    };

    let mut subscriptions = Subscriptions::new();
    if let Some(room_id) = &resumed_room {
        subscriptions.subscribe(&state, &session, room_id).await;
    }
    let _ = session
        .outgoing
        .send(Outbound::Hello(HandshakeReply::Welcome {
            user_id: session.user_id.clone(),
            user_name: session.user_name.clone(),
            resumed_room,
        }))
        .await;

    let mut send_task = tokio::spawn(send_loop(sender, outgoing_rx));
    let command_loop = command_loop(&state, &session, &mut subscriptions, &mut receiver);

    // Whichever side finishes first tears the connection down.
    tokio::select! {
        _ = &mut send_task => {}
        _ = command_loop => { send_task.abort(); }
    }

    subscriptions.clear();
    if let Err(err) = state
        .sessions
        .on_disconnect(&session.user_id, &session.user_name, &session.connection_id)
        .await
    {
        tracing::error!(%err, user_id = %session.user_id, "disconnect handling failed");
    }
    tracing::debug!(user_id = %session.user_id, connection_id = %session.connection_id,
        "connection closed");
}

/// Reads the handshake frame and authenticates it. On failure the client
/// gets a rejection frame and the socket closes.
async fn perform_handshake(
    state: &Arc<AppState>,
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
) -> Option<crate::auth::Identity> {
    let raw = loop {
        let Some(frame) = receiver.next().await else {
            tracing::warn!("websocket closed before handshake completed");
            return None;
        };
        match frame {
            Ok(Message::Text(text)) => break text,
            Ok(Message::Close(_)) | Err(_) => return None,
            // Ping/pong and binary frames are ignored during handshake.
            Ok(_) => {}
        }
    };

    let request: HandshakeRequest = match serde_json::from_str(&raw) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(%err, "malformed handshake frame");
            reject(sender, "Malformed handshake").await;
            return None;
        }
    };

    match state.authenticator.authenticate(&request.token).await {
        Some(identity) => Some(identity),
        None => {
            reject(sender, "Authentication failed").await;
            None
        }
    }
}

async fn reject(sender: &mut SplitSink<WebSocket, Message>, reason: &str) {
    let reply = HandshakeReply::Rejected {
        reason: reason.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&reply) {
        let _ = sender.send(Message::Text(text.into())).await;
    }
    let _ = sender.send(Message::Close(None)).await;
}

/// Drains the outbound queue into the socket.
async fn send_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outgoing: mpsc::Receiver<Outbound>,
) {
    while let Some(frame) = outgoing.recv().await {
        let Some(text) = frame.to_text() else { continue };
        if sender.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
}

/// Parses and runs commands until the socket closes.
async fn command_loop(
    state: &Arc<AppState>,
    session: &ConnectionSession,
    subscriptions: &mut Subscriptions,
    receiver: &mut SplitStream<WebSocket>,
) {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let command: ClientCommand = match serde_json::from_str(&text) {
                    Ok(command) => command,
                    Err(err) => {
                        tracing::debug!(%err, "unparseable client command");
                        session.send_action_error("parse", "Malformed command").await;
                        continue;
                    }
                };
                run_command(state, session, subscriptions, command).await;
            }
            Ok(Message::Close(_)) | Err(_) => return,
            Ok(_) => {} // ignore ping/pong/binary
        }
    }
}

/// Rate-limits, executes and answers one command.
async fn run_command(
    state: &Arc<AppState>,
    session: &ConnectionSession,
    subscriptions: &mut Subscriptions,
    command: ClientCommand,
) {
    let action = command.name();

    if !matches!(command, ClientCommand::Heartbeat) {
        match state.runtime.allow(&session.user_id).await {
            Ok(true) => {}
            Ok(false) => {
                let err = CoreError::RateLimited;
                session.send_action_error(action, err.to_string()).await;
                if let Some(reply) = failure_reply(&command, &err) {
                    session.send_reply(reply).await;
                }
                return;
            }
            Err(err) => {
                tracing::error!(%err, "rate limit check failed");
                session.send_action_error(action, "Service unavailable").await;
                return;
            }
        }
    }

    match handle_command(state, session, subscriptions, &command).await {
        Ok(Some(reply)) => session.send_reply(reply).await,
        Ok(None) => {}
        Err(err) => {
            let message = if err.is_client_fault() {
                err.to_string()
            } else {
                tracing::error!(%err, user_id = %session.user_id, action, "command failed");
                "Internal error".to_string()
            };
            session.send_action_error(action, message.clone()).await;
            if let Some(reply) = failure_reply(&command, &err) {
                session.send_reply(reply).await;
            }
        }
    }
}

/// Commands with a structured result type get a typed failure too.
fn failure_reply(command: &ClientCommand, err: &CoreError) -> Option<ServerReply> {
    let error = if err.is_client_fault() {
        err.to_string()
    } else {
        "Internal error".to_string()
    };
    match command {
        ClientCommand::CreateRoom { .. } => Some(ServerReply::CreateRoomResult {
            success: false,
            room_id: None,
            short_code: None,
            error: Some(error),
        }),
        ClientCommand::JoinRoom { .. } => Some(ServerReply::JoinRoomResult {
            success: false,
            seat_index: None,
            error: Some(error),
        }),
        ClientCommand::PerformAction { .. } => Some(ServerReply::ActionReply {
            success: false,
            error: Some(error),
            new_state: None,
        }),
        _ => None,
    }
}

async fn handle_command(
    state: &Arc<AppState>,
    session: &ConnectionSession,
    subscriptions: &mut Subscriptions,
    command: &ClientCommand,
) -> CoreResult<Option<ServerReply>> {
    match command {
        ClientCommand::CreateRoom { template_name } => {
            validate::template_name(template_name)?;
            let template = state
                .templates
                .get(template_name)
                .await
                .ok_or_else(|| CoreError::UnknownTemplate(template_name.clone()))?;
            let room_id = state
                .runtime
                .create_room(&template, Some(&session.user_id))
                .await?;
            let short_code = state.runtime.registry.short_code_of(&room_id).await?;

            subscriptions.subscribe(state, session, &room_id).await;
            state
                .runtime
                .broadcaster
                .publish(
                    &room_id,
                    RoomMessage::PlayerJoined {
                        room_id: room_id.clone(),
                        user_id: session.user_id.clone(),
                        user_name: session.user_name.clone(),
                        seat_index: 0,
                    },
                )
                .await;
            Ok(Some(ServerReply::CreateRoomResult {
                success: true,
                room_id: Some(room_id),
                short_code,
                error: None,
            }))
        }

        ClientCommand::JoinRoom { room } => {
            validate::room_reference(room)?;
            let (room_id, game_type) = state.runtime.resolve_room(room).await?;
            let outcome = state
                .runtime
                .modules
                .service(&game_type)?
                .join_room(&room_id, &session.user_id)
                .await?;

            subscriptions.subscribe(state, session, &room_id).await;
            state
                .runtime
                .broadcaster
                .publish(
                    &room_id,
                    RoomMessage::PlayerJoined {
                        room_id: room_id.clone(),
                        user_id: session.user_id.clone(),
                        user_name: session.user_name.clone(),
                        seat_index: outcome.seat,
                    },
                )
                .await;
            Ok(Some(ServerReply::JoinRoomResult {
                success: true,
                seat_index: Some(outcome.seat),
                error: None,
            }))
        }

        ClientCommand::LeaveRoom { room_id } => {
            validate::room_id(room_id)?;
            let (room_id, game_type) = state.runtime.resolve_room(room_id).await?;
            state
                .runtime
                .modules
                .service(&game_type)?
                .leave_room(&room_id, &session.user_id)
                .await?;
            subscriptions.unsubscribe(&room_id);
            state
                .runtime
                .broadcaster
                .publish(
                    &room_id,
                    RoomMessage::PlayerLeft {
                        room_id: room_id.clone(),
                        user_id: session.user_id.clone(),
                        user_name: session.user_name.clone(),
                    },
                )
                .await;
            Ok(Some(ServerReply::Acknowledged))
        }

        ClientCommand::SpectateRoom { room_id } => {
            validate::room_reference(room_id)?;
            let (room_id, _game_type) = state.runtime.resolve_room(room_id).await?;
            subscriptions.subscribe(state, session, &room_id).await;
            Ok(Some(ServerReply::Acknowledged))
        }

        ClientCommand::StopSpectating { room_id } => {
            validate::room_reference(room_id)?;
            match state.runtime.resolve_room(room_id).await {
                Ok((room_id, _game_type)) => subscriptions.unsubscribe(&room_id),
                // The room is already gone; its broadcast channel closed
                // and took the forwarder with it.
                Err(CoreError::RoomNotFound) => subscriptions.unsubscribe(room_id),
                Err(err) => return Err(err),
            }
            Ok(Some(ServerReply::Acknowledged))
        }

        ClientCommand::PerformAction {
            room_id,
            action,
            payload,
            command_id,
        } => {
            validate::room_id(room_id)?;
            validate::idempotency_key(action)?;
            if let Some(command_id) = command_id {
                validate::idempotency_key(command_id)?;
            }
            let serialized = serde_json::to_string(payload)?;
            validate::config_json(&serialized)?;

            let (room_id, game_type) = state.runtime.resolve_room(room_id).await?;
            let result = state
                .runtime
                .perform_action(
                    &game_type,
                    &room_id,
                    GameCommand {
                        user_id: session.user_id.clone(),
                        action: action.clone(),
                        payload: payload.clone(),
                    },
                )
                .await?;

            if result.success {
                Ok(Some(ServerReply::ActionReply {
                    success: true,
                    error: None,
                    new_state: result.new_state,
                }))
            } else {
                let message = result
                    .error_message
                    .unwrap_or_else(|| "Action rejected".to_string());
                session.send_action_error(action, message.clone()).await;
                Ok(Some(ServerReply::ActionReply {
                    success: false,
                    error: Some(message),
                    new_state: None,
                }))
            }
        }

        ClientCommand::GetLegalActions { room_id } => {
            validate::room_id(room_id)?;
            let (room_id, game_type) = state.runtime.resolve_room(room_id).await?;
            let actions = state
                .runtime
                .legal_actions(&game_type, &room_id, &session.user_id)
                .await?;
            Ok(Some(ServerReply::LegalActions { actions }))
        }

        ClientCommand::GetState { room_id } => {
            validate::room_id(room_id)?;
            let (room_id, game_type) = state.runtime.resolve_room(room_id).await?;
            let response = state.runtime.state(&game_type, &room_id).await?;
            let value = match response {
                Some(response) => Some(serde_json::to_value(&response)?),
                None => None,
            };
            Ok(Some(ServerReply::State { state: value }))
        }

        ClientCommand::SendChatMessage { room_id, message } => {
            validate::room_id(room_id)?;
            validate::chat_message(message)?;
            let (room_id, _game_type) = state.runtime.resolve_room(room_id).await?;
            state
                .runtime
                .broadcaster
                .publish(
                    &room_id,
                    RoomMessage::ChatMessage {
                        room_id: room_id.clone(),
                        user_id: session.user_id.clone(),
                        user_name: session.user_name.clone(),
                        text: message.clone(),
                        timestamp: chrono::Utc::now(),
                    },
                )
                .await;
            Ok(Some(ServerReply::Acknowledged))
        }

        ClientCommand::Heartbeat => {
            state
                .sessions
                .heartbeat(&session.user_id, &session.connection_id)
                .await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_failures_map_to_a_typed_result() {
        let command = ClientCommand::JoinRoom {
            room: "deadbeef".into(),
        };
        match failure_reply(&command, &CoreError::RoomFull) {
            Some(ServerReply::JoinRoomResult {
                success,
                seat_index,
                error,
            }) => {
                assert!(!success);
                assert!(seat_index.is_none());
                assert_eq!(error.as_deref(), Some("Room is full"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn infrastructure_errors_are_not_leaked() {
        let command = ClientCommand::PerformAction {
            room_id: "deadbeef".into(),
            action: "roll".into(),
            payload: serde_json::Value::Null,
            command_id: None,
        };
        let err = CoreError::Internal("postgres exploded".into());
        match failure_reply(&command, &err) {
            Some(ServerReply::ActionReply { error, .. }) => {
                assert_eq!(error.as_deref(), Some("Internal error"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn commands_without_structured_results_get_no_reply() {
        let command = ClientCommand::LeaveRoom {
            room_id: "deadbeef".into(),
        };
        assert!(failure_reply(&command, &CoreError::NotInRoom).is_none());
    }

    #[test]
    fn outbound_frames_serialize_with_type_tags() {
        let frame = Outbound::Reply(ServerReply::Acknowledged);
        let text = frame.to_text().unwrap();
        assert!(text.contains("\"type\":\"acknowledged\""));

        let frame = Outbound::Event(RoomMessage::ActionError {
            action: "roll".into(),
            message: "It is not your turn".into(),
        });
        let text = frame.to_text().unwrap();
        assert!(text.contains("\"type\":\"action_error\""));
    }
}
