//! Transactional outbox draining game-end records into payouts and the
//! archive.
//!
//! Every node runs the worker; rows coordinate the nodes. A row is claimed
//! with a conditional attempts bump, so two workers never run the same
//! attempt, and every side effect behind it is idempotent anyway. Outbox
//! failures never surface to clients; a row retries until it succeeds or
//! exhausts its attempts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::Row;
use tokio::sync::watch;
use uuid::Uuid;

use crate::economy::apply_payouts;
use crate::error::{CoreError, CoreResult};

/// Retries a row gets before it is parked for inspection.
pub const MAX_ATTEMPTS: i32 = 5;

/// Rows read per worker cycle.
pub const BATCH_SIZE: i64 = 100;

/// Age after which processed and exhausted rows are purged.
pub const PURGE_AFTER_DAYS: i64 = 7;

/// The one event type the core depends on.
pub const GAME_ENDED_EVENT: &str = "GameEnded";

#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Payload of a [`GAME_ENDED_EVENT`] row, written in the same atomic step
/// as the final state save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEndedPayload {
    pub room_id: String,
    pub game_type: String,
    pub final_state: Value,
    pub player_seats: HashMap<String, u8>,
    pub winner_user_id: Option<String>,
    pub ranking: Option<Vec<String>>,
    pub total_pot: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    async fn enqueue(&self, event_type: &str, payload: &Value) -> CoreResult<Uuid>;

    /// Unprocessed rows with attempts left, oldest first.
    async fn due(&self, limit: i64) -> CoreResult<Vec<OutboxRecord>>;

    /// Claims one attempt on a row. False when another worker already
    /// bumped it (or it got processed meanwhile).
    async fn claim(&self, id: Uuid, expected_attempts: i32) -> CoreResult<bool>;

    async fn mark_processed(&self, id: Uuid) -> CoreResult<()>;

    /// Stores the failure reason of the current attempt.
    async fn record_failure(&self, id: Uuid, error: &str) -> CoreResult<()>;

    /// Drops processed rows and exhausted rows older than the cutoff.
    /// Returns how many rows went away.
    async fn purge(&self, cutoff: DateTime<Utc>) -> CoreResult<u64>;
}

/// A handler for one event type. Handlers must be idempotent: a crash
/// between the side effect and the processed mark replays them.
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    async fn handle(&self, record: &OutboxRecord) -> CoreResult<()>;
}

// ---- Postgres implementations ----

pub struct PgOutboxRepository {
    pool: PgPool,
}

impl PgOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        PgOutboxRepository { pool }
    }
}

#[async_trait]
impl OutboxRepository for PgOutboxRepository {
    async fn enqueue(&self, event_type: &str, payload: &Value) -> CoreResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO outbox_messages (id, event_type, payload, attempts, created_at) \
             VALUES ($1, $2, $3, 0, NOW())",
        )
        .bind(id)
        .bind(event_type)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn due(&self, limit: i64) -> CoreResult<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            "SELECT id, event_type, payload, attempts, last_error, created_at, processed_at \
             FROM outbox_messages \
             WHERE processed_at IS NULL AND attempts < $1 \
             ORDER BY created_at \
             LIMIT $2",
        )
        .bind(MAX_ATTEMPTS)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| OutboxRecord {
                id: row.get("id"),
                event_type: row.get("event_type"),
                payload: row.get("payload"),
                attempts: row.get("attempts"),
                last_error: row.get("last_error"),
                created_at: row.get("created_at"),
                processed_at: row.get("processed_at"),
            })
            .collect())
    }

    async fn claim(&self, id: Uuid, expected_attempts: i32) -> CoreResult<bool> {
        let updated = sqlx::query(
            "UPDATE outbox_messages SET attempts = attempts + 1 \
             WHERE id = $1 AND attempts = $2 AND processed_at IS NULL",
        )
        .bind(id)
        .bind(expected_attempts)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn mark_processed(&self, id: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE outbox_messages SET processed_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> CoreResult<()> {
        let truncated: String = error.chars().take(500).collect();
        sqlx::query("UPDATE outbox_messages SET last_error = $1 WHERE id = $2")
            .bind(truncated)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> CoreResult<u64> {
        let processed = sqlx::query(
            "DELETE FROM outbox_messages WHERE processed_at IS NOT NULL AND processed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let exhausted = sqlx::query(
            "DELETE FROM outbox_messages \
             WHERE processed_at IS NULL AND attempts >= $1 AND created_at < $2",
        )
        .bind(MAX_ATTEMPTS)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(processed.rows_affected() + exhausted.rows_affected())
    }
}

/// Handles `GameEnded`: pays the pot out and writes the archive row, both
/// in one relational transaction.
pub struct GameEndedHandler {
    pool: PgPool,
    initial_coins: i64,
}

impl GameEndedHandler {
    pub fn new(pool: PgPool, initial_coins: i64) -> Self {
        GameEndedHandler {
            pool,
            initial_coins,
        }
    }
}

#[async_trait]
impl OutboxHandler for GameEndedHandler {
    async fn handle(&self, record: &OutboxRecord) -> CoreResult<()> {
        let payload: GameEndedPayload = serde_json::from_value(record.payload.clone())?;

        let mut tx = self.pool.begin().await?;
        apply_payouts(
            &mut *tx,
            self.initial_coins,
            &payload.room_id,
            &payload.game_type,
            payload.total_pot,
            &payload.player_seats,
            payload.winner_user_id.as_deref(),
            payload.ranking.as_deref(),
        )
        .await?;

        // The unique room_id keeps a replayed row from archiving twice.
        sqlx::query(
            "INSERT INTO archived_games \
             (id, room_id, game_type, final_state_json, player_seats_json, winner_user_id, \
              total_pot, started_at, ended_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (room_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(&payload.room_id)
        .bind(&payload.game_type)
        .bind(serde_json::to_string(&payload.final_state)?)
        .bind(serde_json::to_string(&payload.player_seats)?)
        .bind(&payload.winner_user_id)
        .bind(payload.total_pot)
        .bind(payload.started_at)
        .bind(payload.ended_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

// ---- the worker ----

pub struct OutboxWorker {
    repository: Arc<dyn OutboxRepository>,
    handlers: HashMap<String, Arc<dyn OutboxHandler>>,
    poll_interval: Duration,
    purge_interval: Duration,
}

impl OutboxWorker {
    pub fn new(repository: Arc<dyn OutboxRepository>) -> Self {
        OutboxWorker {
            repository,
            handlers: HashMap::new(),
            poll_interval: Duration::from_secs(5),
            purge_interval: Duration::from_secs(3600),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn register_handler(mut self, event_type: &str, handler: Arc<dyn OutboxHandler>) -> Self {
        self.handlers.insert(event_type.to_string(), handler);
        self
    }

    /// Drains due rows until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = tokio::time::interval(self.poll_interval);
        let mut purge = tokio::time::interval(self.purge_interval);
        purge.reset(); // first purge only after a full interval
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(err) = self.run_cycle().await {
                        tracing::error!(%err, "outbox cycle failed");
                    }
                }
                _ = purge.tick() => {
                    let cutoff = Utc::now() - chrono::Duration::days(PURGE_AFTER_DAYS);
                    match self.repository.purge(cutoff).await {
                        Ok(0) => {}
                        Ok(purged) => tracing::info!(purged, "purged old outbox rows"),
                        Err(err) => tracing::error!(%err, "outbox purge failed"),
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

    /// One drain pass; also directly callable from tests.
    pub async fn run_cycle(&self) -> CoreResult<()> {
        let due = self.repository.due(BATCH_SIZE).await?;
        for record in due {
            if !self.repository.claim(record.id, record.attempts).await? {
                continue; // another worker has it
            }
            let Some(handler) = self.handlers.get(&record.event_type) else {
                self.repository
                    .record_failure(record.id, "no handler for event type")
                    .await?;
                tracing::error!(event_type = %record.event_type, "outbox row without handler");
                continue;
            };
            match handler.handle(&record).await {
                Ok(()) => self.repository.mark_processed(record.id).await?,
                Err(err) => {
                    tracing::warn!(id = %record.id, attempts = record.attempts + 1, %err,
                        "outbox row failed, will retry");
                    self.repository.record_failure(record.id, &err.to_string()).await?;
                }
            }
        }
        Ok(())
    }
}

/// Builds the outbox payload for a finished game.
pub fn game_ended_payload(payload: &GameEndedPayload) -> CoreResult<Value> {
    serde_json::to_value(payload).map_err(CoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FlakyHandler, MemoryOutbox};
    use serde_json::json;

    fn worker(
        repository: Arc<MemoryOutbox>,
        handler: Arc<FlakyHandler>,
    ) -> OutboxWorker {
        OutboxWorker::new(repository).register_handler(GAME_ENDED_EVENT, handler)
    }

    #[tokio::test]
    async fn failing_row_retries_then_succeeds() {
        let repository = Arc::new(MemoryOutbox::new());
        let handler = Arc::new(FlakyHandler::failing_times(3));
        let id = repository
            .enqueue(GAME_ENDED_EVENT, &json!({"room_id": "r1"}))
            .await
            .unwrap();

        let worker = worker(repository.clone(), handler.clone());
        for _ in 0..3 {
            worker.run_cycle().await.unwrap();
            let record = repository.get(id).unwrap();
            assert!(record.processed_at.is_none());
            assert!(record.last_error.is_some());
        }
        let record = repository.get(id).unwrap();
        assert_eq!(record.attempts, 3);

        worker.run_cycle().await.unwrap();
        let record = repository.get(id).unwrap();
        assert!(record.processed_at.is_some());
        assert_eq!(record.attempts, 4);
        assert_eq!(handler.calls(), 4);
    }

    #[tokio::test]
    async fn exhausted_rows_stop_retrying() {
        let repository = Arc::new(MemoryOutbox::new());
        let handler = Arc::new(FlakyHandler::failing_times(u32::MAX));
        let id = repository
            .enqueue(GAME_ENDED_EVENT, &json!({"room_id": "r1"}))
            .await
            .unwrap();

        let worker = worker(repository.clone(), handler.clone());
        for _ in 0..(MAX_ATTEMPTS + 3) {
            worker.run_cycle().await.unwrap();
        }
        let record = repository.get(id).unwrap();
        assert_eq!(record.attempts, MAX_ATTEMPTS);
        assert!(record.processed_at.is_none());
        assert_eq!(handler.calls(), MAX_ATTEMPTS as u32);
    }

    #[tokio::test]
    async fn rows_without_handler_are_marked_failed() {
        let repository = Arc::new(MemoryOutbox::new());
        let id = repository
            .enqueue("UnknownEvent", &json!({}))
            .await
            .unwrap();
        let worker = OutboxWorker::new(repository.clone());
        worker.run_cycle().await.unwrap();

        let record = repository.get(id).unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_error.as_deref(), Some("no handler for event type"));
    }

    #[tokio::test]
    async fn purge_drops_old_processed_and_exhausted_rows() {
        let repository = Arc::new(MemoryOutbox::new());
        let old = Utc::now() - chrono::Duration::days(PURGE_AFTER_DAYS + 1);

        let processed = repository.enqueue(GAME_ENDED_EVENT, &json!({})).await.unwrap();
        repository.mark_processed(processed).await.unwrap();
        repository.backdate(processed, old);

        let exhausted = repository.enqueue(GAME_ENDED_EVENT, &json!({})).await.unwrap();
        for n in 0..MAX_ATTEMPTS {
            assert!(repository.claim(exhausted, n).await.unwrap());
        }
        repository.backdate(exhausted, old);

        let fresh = repository.enqueue(GAME_ENDED_EVENT, &json!({})).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(PURGE_AFTER_DAYS);
        let purged = repository.purge(cutoff).await.unwrap();
        assert_eq!(purged, 2);
        assert!(repository.get(processed).is_none());
        assert!(repository.get(exhausted).is_none());
        assert!(repository.get(fresh).is_some());
    }

    #[test]
    fn game_ended_payload_round_trips() {
        let payload = GameEndedPayload {
            room_id: "r1".into(),
            game_type: "race".into(),
            final_state: json!({"positions": [30, 12, 0, 7]}),
            player_seats: HashMap::from([("u1".to_string(), 0u8), ("u2".to_string(), 1u8)]),
            winner_user_id: Some("u1".into()),
            ranking: None,
            total_pot: 200,
            started_at: Utc::now(),
            ended_at: Utc::now(),
        };
        let value = game_ended_payload(&payload).unwrap();
        let back: GameEndedPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.room_id, "r1");
        assert_eq!(back.winner_user_id.as_deref(), Some("u1"));
        assert_eq!(back.player_seats.len(), 2);
    }
}
