//! Leader-elected tick that drives turn timeouts and ages out idle rooms.
//!
//! Exactly one node holds `leader:gameloop` at a time; the holder refreshes
//! the TTL every tick and everyone else sleeps. Due rooms come from the
//! per-game-type timeout index; each is handled under a short room lock
//! with bounded parallelism. The stale due entry is removed
//! unconditionally after the hook; only an engine that recorded a new
//! turn gets a fresh entry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::watch;

use crate::error::CoreResult;
use crate::module::RoomMeta;
use crate::outbox::{GAME_ENDED_EVENT, GameEndedPayload, game_ended_payload};
use crate::runtime::RoomRuntime;

const LEADER_KEY: &str = "leader:gameloop";
const LEADER_TTL_SECS: u64 = 15;

/// Acquire-or-refresh in one atomic step: a fresh SET NX takes the lock, a
/// matching holder extends it, anyone else is turned away.
const LEADER_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
    return 1
end
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

pub struct TurnTimeoutScheduler {
    runtime: Arc<RoomRuntime>,
    lock_pool: deadpool_redis::Pool,
    worker_id: String,
}

impl TurnTimeoutScheduler {
    pub fn new(
        runtime: Arc<RoomRuntime>,
        lock_pool: deadpool_redis::Pool,
        worker_id: impl Into<String>,
    ) -> Self {
        TurnTimeoutScheduler {
            runtime,
            lock_pool,
            worker_id: worker_id.into(),
        }
    }

    /// Ticks until the shutdown signal flips. Only the leader advances
    /// timeouts; followers merely keep trying to become leader.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let tick = Duration::from_millis(self.runtime.config.game_loop.tick_interval_ms);
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.try_acquire_leadership().await {
                        Ok(true) => {
                            if let Err(err) = self.run_tick().await {
                                tracing::error!(%err, "game loop tick failed");
                            }
                        }
                        Ok(false) => {} // another node leads
                        Err(err) => tracing::warn!(%err, "leader election unavailable"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn try_acquire_leadership(&self) -> CoreResult<bool> {
        let mut conn = self.lock_pool.get().await?;
        let held: i64 = redis::Script::new(LEADER_SCRIPT)
            .key(LEADER_KEY)
            .arg(&self.worker_id)
            .arg(LEADER_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        Ok(held == 1)
    }

    /// One leader tick: timeout sweep per turn-based game type, then the
    /// idle-room eviction sweep.
    pub async fn run_tick(&self) -> CoreResult<()> {
        for game_type in self.runtime.modules.turn_based_types() {
            self.process_due_rooms(&game_type).await?;
        }
        self.evict_idle_rooms().await
    }

    async fn process_due_rooms(&self, game_type: &str) -> CoreResult<()> {
        let config = &self.runtime.config.game_loop;
        let due = self
            .runtime
            .registry
            .rooms_due_for_timeout(game_type, Utc::now(), config.max_rooms_per_tick as isize)
            .await?;
        if due.is_empty() {
            return Ok(());
        }
        tracing::debug!(game_type, rooms = due.len(), "processing due rooms");

        stream::iter(due)
            .for_each_concurrent(config.parallelism, |room_id| async move {
                if let Err(err) = self.handle_due_room(game_type, &room_id).await {
                    tracing::error!(game_type, room_id, %err, "timeout handling failed");
                }
            })
            .await;
        Ok(())
    }

    async fn handle_due_room(&self, game_type: &str, room_id: &str) -> CoreResult<()> {
        let engine = self.runtime.modules.engine(game_type)?;
        let Some(turn_based) = engine.turn_based() else {
            return Ok(());
        };

        if !self
            .runtime
            .store
            .try_lock(game_type, room_id, Duration::from_secs(1))
            .await?
        {
            // Contention is fine; the entry stays and the next tick retries.
            return Ok(());
        }

        let outcome = async {
            let result = turn_based.check_timeouts(room_id).await?;

            // The stale entry goes away no matter what the engine decided;
            // a declining engine must not make the scheduler spin.
            self.runtime
                .registry
                .unregister_turn_timeout(game_type, room_id)
                .await?;

            if let Some(result) = &result {
                if result.success {
                    if let Some(outcome) = &result.game_ended {
                        let meta = self
                            .runtime
                            .store
                            .load_meta(game_type, room_id)
                            .await?
                            .unwrap_or_else(|| RoomMeta::new(game_type, 0));
                        let payload = GameEndedPayload {
                            room_id: room_id.to_string(),
                            game_type: game_type.to_string(),
                            final_state: outcome.final_state.clone(),
                            player_seats: meta.seats.clone(),
                            winner_user_id: outcome.winner_user_id.clone(),
                            ranking: outcome.ranking.clone(),
                            total_pot: outcome.total_pot,
                            started_at: meta.created_at,
                            ended_at: Utc::now(),
                        };
                        self.runtime
                            .outbox
                            .enqueue(GAME_ENDED_EVENT, &game_ended_payload(&payload)?)
                            .await?;
                    }
                }
            }
            Ok::<_, crate::error::CoreError>(result)
        }
        .await;

        self.runtime.store.unlock(game_type, room_id).await?;

        match outcome? {
            Some(result) if result.success => {
                self.runtime
                    .apply_post_action(game_type, room_id, &result)
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Deletes rooms idle past the configured window, a few per tick.
    async fn evict_idle_rooms(&self) -> CoreResult<()> {
        const EVICTIONS_PER_TICK: isize = 20;
        let idle_secs = self.runtime.config.game_loop.idle_eviction_secs as i64;
        for module in self.runtime.modules.iter() {
            let idle = self
                .runtime
                .registry
                .idle_rooms(&module.game_type, idle_secs, EVICTIONS_PER_TICK)
                .await?;
            for room_id in idle {
                tracing::info!(game_type = %module.game_type, room_id, "evicting idle room");
                self.runtime
                    .teardown_room(&module.game_type, &room_id)
                    .await?;
            }
        }
        Ok(())
    }
}
