//! The command pipeline gluing hub, dispatcher, store, engines, outbox and
//! broadcaster together.
//!
//! One player action travels: dispatcher shard -> room lock -> engine
//! execute (load, apply, save) -> outbox enqueue when the game ended ->
//! unlock -> broadcast. Effects of one room are totally ordered; rooms
//! never wait for each other.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::broadcast::Broadcaster;
use crate::config::{RoomTemplate, RuntimeConfig};
use crate::dispatch::CommandDispatcher;
use crate::error::{CoreError, CoreResult};
use crate::module::{ActionResult, GameCommand, ModuleRegistry, RoomMeta, StateResponse};
use crate::outbox::{GAME_ENDED_EVENT, GameEndedPayload, OutboxRepository, game_ended_payload};
use crate::registry::RoomRegistry;
use crate::store::RoomStore;

pub struct RoomRuntime {
    pub modules: Arc<ModuleRegistry>,
    pub store: Arc<RoomStore>,
    pub registry: Arc<RoomRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub outbox: Arc<dyn OutboxRepository>,
    pub config: Arc<RuntimeConfig>,
}

impl RoomRuntime {
    /// Resolves a client-supplied room reference (id or short code) to the
    /// room id and its game type.
    pub async fn resolve_room(&self, reference: &str) -> CoreResult<(String, String)> {
        let room_id = if protocol::is_short_code(reference) {
            self.registry
                .room_by_short_code(reference)
                .await?
                .ok_or(CoreError::RoomNotFound)?
        } else {
            reference.to_string()
        };
        let game_type = self
            .registry
            .game_type_of(&room_id)
            .await?
            .ok_or(CoreError::RoomNotFound)?;
        Ok((room_id, game_type))
    }

    /// Creates a room from a template. With a creator the room opens with
    /// them on seat 0; without one it opens empty (administrative rooms).
    pub async fn create_room(
        &self,
        template: &RoomTemplate,
        creator: Option<&str>,
    ) -> CoreResult<String> {
        let module = self.modules.get(&template.game_type)?;
        let mut meta = RoomMeta::new(&template.game_type, template.max_seats);
        meta.entry_fee = template.entry_fee;
        meta.visibility = template.visibility;
        meta.config = template.config.clone();

        let room_id = module.service.create_room(meta).await?;
        if let Some(user_id) = creator {
            if let Err(err) = module.service.join_room(&room_id, user_id).await {
                // A creator who cannot pay must not leave an empty husk.
                module.service.delete_room(&room_id).await?;
                return Err(err);
            }
        }
        Ok(room_id)
    }

    /// Runs one player action through the full pipeline and returns the
    /// engine's result. Broadcasts happen here; the caller only relays
    /// errors to the acting connection.
    pub async fn perform_action(
        &self,
        game_type: &str,
        room_id: &str,
        command: GameCommand,
    ) -> CoreResult<ActionResult> {
        let engine = self.modules.engine(game_type)?;
        let store = self.store.clone();
        let outbox = self.outbox.clone();
        let game_type_owned = game_type.to_string();
        let room_id_owned = room_id.to_string();

        let result = self
            .dispatcher
            .dispatch(room_id, move || async move {
                store
                    .with_lock(&game_type_owned, &room_id_owned, || async {
                        let result = engine.execute(&room_id_owned, command).await?;
                        if result.success {
                            if let Some(outcome) = &result.game_ended {
                                // Enqueued before unlock so the archival
                                // worker can pay out even if we die here.
                                let meta = store
                                    .load_meta(&game_type_owned, &room_id_owned)
                                    .await?
                                    .unwrap_or_else(|| RoomMeta::new(&game_type_owned, 0));
                                let payload = GameEndedPayload {
                                    room_id: room_id_owned.clone(),
                                    game_type: game_type_owned.clone(),
                                    final_state: outcome.final_state.clone(),
                                    player_seats: meta.seats.clone(),
                                    winner_user_id: outcome.winner_user_id.clone(),
                                    ranking: outcome.ranking.clone(),
                                    total_pot: outcome.total_pot,
                                    started_at: meta.created_at,
                                    ended_at: Utc::now(),
                                };
                                outbox
                                    .enqueue(GAME_ENDED_EVENT, &game_ended_payload(&payload)?)
                                    .await?;
                            }
                        }
                        Ok(result)
                    })
                    .await
            })
            .await?;

        if result.success {
            self.apply_post_action(game_type, room_id, &result).await?;
        }
        Ok(result)
    }

    /// Effects of a successful result outside the room lock: broadcast,
    /// activity, due-entry bookkeeping, end-of-game teardown.
    pub async fn apply_post_action(
        &self,
        game_type: &str,
        room_id: &str,
        result: &ActionResult,
    ) -> CoreResult<()> {
        self.broadcaster.publish_result(room_id, result).await;
        self.registry
            .update_room_activity(game_type, room_id)
            .await?;

        if result.game_ended.is_some() {
            self.teardown_room(game_type, room_id).await?;
            return Ok(());
        }

        // The due entry follows whatever turn the engine recorded in meta.
        let engine = self.modules.engine(game_type)?;
        if let Some(turn_based) = engine.turn_based() {
            let meta = self.store.load_meta(game_type, room_id).await?;
            match meta.and_then(|meta| meta.turn_started_at) {
                Some(turn_started_at) => {
                    let due_at = turn_started_at
                        + chrono::Duration::seconds(turn_based.turn_timeout_secs() as i64);
                    self.registry
                        .register_turn_timeout(game_type, room_id, due_at)
                        .await?;
                }
                None => {
                    self.registry
                        .unregister_turn_timeout(game_type, room_id)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Removes a finished room everywhere. The archive row and payouts are
    /// the outbox worker's job; the live room simply disappears.
    pub async fn teardown_room(&self, game_type: &str, room_id: &str) -> CoreResult<()> {
        self.registry
            .unregister_turn_timeout(game_type, room_id)
            .await?;
        if let Some(meta) = self.store.load_meta(game_type, room_id).await? {
            for user_id in meta.seats.keys() {
                self.registry.clear_user_room(user_id).await?;
                self.registry.clear_disconnect_ticket(user_id).await?;
            }
        }
        self.store.delete(game_type, room_id).await?;
        self.broadcaster.drop_room(room_id).await;
        tracing::info!(game_type, room_id, "room torn down after game end");
        Ok(())
    }

    pub async fn legal_actions(&self, game_type: &str, room_id: &str, user_id: &str) -> CoreResult<Vec<String>> {
        self.modules
            .engine(game_type)?
            .legal_actions(room_id, user_id)
            .await
    }

    pub async fn state(&self, game_type: &str, room_id: &str) -> CoreResult<Option<StateResponse>> {
        self.modules.engine(game_type)?.state(room_id).await
    }

    /// True while the user stays inside their rate budget.
    pub async fn allow(&self, user_id: &str) -> CoreResult<bool> {
        let window_secs = self.config.rate_limit.window_minutes * 60;
        self.registry
            .check_rate_limit(user_id, self.config.rate_limit.permit_limit, window_secs)
            .await
    }

    /// Drains the dispatcher on shutdown; in-flight commands finish, queued
    /// ones resolve with a shutting-down error.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let drained = tokio::time::timeout(drain_timeout, self.dispatcher.shutdown()).await;
        if drained.is_err() {
            tracing::warn!("dispatcher drain exceeded its timeout");
        }
    }
}
