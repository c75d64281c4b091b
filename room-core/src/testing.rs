//! In-memory backends for unit tests. They satisfy the same traits as the
//! Postgres implementations, keeping tests fast and free of external
//! services.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::economy::{EconomyService, Reservation, compute_awards, win_key};
use crate::error::{CoreError, CoreResult};
use crate::outbox::{MAX_ATTEMPTS, OutboxHandler, OutboxRecord, OutboxRepository};

/// Outbox rows in a mutex-guarded map.
pub struct MemoryOutbox {
    rows: Mutex<Vec<OutboxRecord>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        MemoryOutbox {
            rows: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxRecord> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.id == id)
            .cloned()
    }

    /// Ages a row for purge tests.
    pub fn backdate(&self, id: Uuid, to: DateTime<Utc>) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|row| row.id == id) {
            row.created_at = to;
            if row.processed_at.is_some() {
                row.processed_at = Some(to);
            }
        }
    }
}

#[async_trait]
impl OutboxRepository for MemoryOutbox {
    async fn enqueue(&self, event_type: &str, payload: &Value) -> CoreResult<Uuid> {
        let id = Uuid::new_v4();
        self.rows.lock().unwrap().push(OutboxRecord {
            id,
            event_type: event_type.to_string(),
            payload: payload.clone(),
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            processed_at: None,
        });
        Ok(id)
    }

    async fn due(&self, limit: i64) -> CoreResult<Vec<OutboxRecord>> {
        let mut due: Vec<OutboxRecord> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.processed_at.is_none() && row.attempts < MAX_ATTEMPTS)
            .cloned()
            .collect();
        due.sort_by_key(|row| row.created_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn claim(&self, id: Uuid, expected_attempts: i32) -> CoreResult<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.iter_mut().find(|row| row.id == id) else {
            return Ok(false);
        };
        if row.processed_at.is_some() || row.attempts != expected_attempts {
            return Ok(false);
        }
        row.attempts += 1;
        Ok(true)
    }

    async fn mark_processed(&self, id: Uuid) -> CoreResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|row| row.id == id) {
            row.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> CoreResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|row| row.id == id) {
            row.last_error = Some(error.chars().take(500).collect());
        }
        Ok(())
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> CoreResult<u64> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|row| {
            let processed_old = row
                .processed_at
                .map(|at| at < cutoff)
                .unwrap_or(false);
            let exhausted_old =
                row.processed_at.is_none() && row.attempts >= MAX_ATTEMPTS && row.created_at < cutoff;
            !(processed_old || exhausted_old)
        });
        Ok((before - rows.len()) as u64)
    }
}

/// Handler that fails a configured number of times before succeeding.
pub struct FlakyHandler {
    failures_left: Mutex<u32>,
    calls: AtomicU32,
}

impl FlakyHandler {
    pub fn failing_times(failures: u32) -> Self {
        FlakyHandler {
            failures_left: Mutex::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboxHandler for FlakyHandler {
    async fn handle(&self, _record: &OutboxRecord) -> CoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(CoreError::Internal("injected failure".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub user_id: String,
    pub amount: i64,
    pub balance_after: i64,
    pub entry_type: String,
    pub idempotency_key: String,
}

/// Wallet backend over two maps; mirrors the idempotency and
/// balance-never-negative rules of the Postgres implementation.
pub struct MemoryEconomy {
    initial_coins: i64,
    inner: Mutex<MemoryEconomyInner>,
}

#[derive(Default)]
struct MemoryEconomyInner {
    balances: HashMap<String, i64>,
    ledger: Vec<LedgerRow>,
    reserve_failures: u32,
}

impl MemoryEconomy {
    pub fn new(initial_coins: i64) -> Self {
        MemoryEconomy {
            initial_coins,
            inner: Mutex::new(MemoryEconomyInner::default()),
        }
    }

    pub fn balance(&self, user_id: &str) -> i64 {
        let inner = self.inner.lock().unwrap();
        inner
            .balances
            .get(user_id)
            .copied()
            .unwrap_or(self.initial_coins)
    }

    pub fn ledger(&self) -> Vec<LedgerRow> {
        self.inner.lock().unwrap().ledger.clone()
    }

    /// Makes the next `n` reservations fail, for compensation tests.
    pub fn fail_next_reserves(&self, n: u32) {
        self.inner.lock().unwrap().reserve_failures = n;
    }

    fn apply(
        &self,
        user_id: &str,
        amount: i64,
        entry_type: &str,
        idempotency_key: &str,
    ) -> CoreResult<i64> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .ledger
            .iter()
            .any(|row| row.idempotency_key == idempotency_key)
        {
            return Err(CoreError::DuplicateTransaction);
        }
        let balance = inner
            .balances
            .get(user_id)
            .copied()
            .unwrap_or(self.initial_coins);
        let balance_after = balance + amount;
        if balance_after < 0 {
            return Err(CoreError::InsufficientFunds);
        }
        inner.balances.insert(user_id.to_string(), balance_after);
        inner.ledger.push(LedgerRow {
            user_id: user_id.to_string(),
            amount,
            balance_after,
            entry_type: entry_type.to_string(),
            idempotency_key: idempotency_key.to_string(),
        });
        Ok(balance_after)
    }
}

#[async_trait]
impl EconomyService for MemoryEconomy {
    async fn reserve_entry_fee(
        &self,
        user_id: &str,
        fee: i64,
        room_id: &str,
    ) -> CoreResult<Reservation> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.reserve_failures > 0 {
                inner.reserve_failures -= 1;
                return Err(CoreError::Internal("injected reserve failure".into()));
            }
        }
        let reservation = Reservation {
            reservation_id: format!("res-{}", Uuid::new_v4().simple()),
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            amount: fee,
        };
        self.apply(user_id, -fee, "entry_fee", &reservation.reservation_id)?;
        Ok(reservation)
    }

    async fn commit_entry_fee(&self, _reservation: &Reservation) -> CoreResult<()> {
        Ok(())
    }

    async fn refund_entry_fee(&self, reservation: &Reservation) -> CoreResult<()> {
        match self.apply(
            &reservation.user_id,
            reservation.amount,
            "refund",
            &reservation.refund_key(),
        ) {
            Ok(_) | Err(CoreError::DuplicateTransaction) => Ok(()),
            Err(other) => Err(other),
        }
    }

    async fn process_game_payouts(
        &self,
        room_id: &str,
        _game_type: &str,
        total_pot: i64,
        seats: &HashMap<String, u8>,
        winner_user_id: Option<&str>,
        ranking: Option<&[String]>,
    ) -> CoreResult<()> {
        for (user_id, amount) in compute_awards(total_pot, seats, winner_user_id, ranking) {
            match self.apply(&user_id, amount, "payout", &win_key(room_id, &user_id)) {
                Ok(_) | Err(CoreError::DuplicateTransaction) => {}
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reservation_and_refund_are_balance_neutral() {
        let economy = MemoryEconomy::new(500);
        let reservation = economy.reserve_entry_fee("u1", 100, "r1").await.unwrap();
        assert_eq!(economy.balance("u1"), 400);

        economy.refund_entry_fee(&reservation).await.unwrap();
        assert_eq!(economy.balance("u1"), 500);

        // The ledger shows the paired entries sharing the reservation id.
        let ledger = economy.ledger();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].amount, -100);
        assert_eq!(ledger[1].amount, 100);
        assert_eq!(
            ledger[1].idempotency_key,
            format!("refund:{}", ledger[0].idempotency_key)
        );

        // Refund retries are harmless.
        economy.refund_entry_fee(&reservation).await.unwrap();
        assert_eq!(economy.balance("u1"), 500);
        assert_eq!(economy.ledger().len(), 2);
    }

    #[tokio::test]
    async fn injected_reserve_failures_leave_no_trace() {
        let economy = MemoryEconomy::new(500);
        economy.fail_next_reserves(1);
        assert!(economy.reserve_entry_fee("u1", 100, "r1").await.is_err());
        assert_eq!(economy.balance("u1"), 500);
        assert!(economy.ledger().is_empty());

        // The next reservation goes through again.
        economy.reserve_entry_fee("u1", 100, "r1").await.unwrap();
        assert_eq!(economy.balance("u1"), 400);
    }

    #[tokio::test]
    async fn insufficient_funds_rejects_the_reservation() {
        let economy = MemoryEconomy::new(50);
        let err = economy.reserve_entry_fee("u1", 100, "r1").await.unwrap_err();
        assert!(matches!(err, CoreError::InsufficientFunds));
        assert_eq!(economy.balance("u1"), 50);
        assert!(economy.ledger().is_empty());
    }

    #[tokio::test]
    async fn payouts_are_idempotent_per_win_key() {
        let economy = MemoryEconomy::new(0);
        let seats = HashMap::from([("u1".to_string(), 0u8), ("u2".to_string(), 1u8)]);

        economy
            .process_game_payouts("r1", "race", 200, &seats, Some("u1"), None)
            .await
            .unwrap();
        let after_first = economy.balance("u1");
        assert_eq!(after_first, 194); // 200 minus 3% rake

        // A retried outbox row must not credit twice.
        economy
            .process_game_payouts("r1", "race", 200, &seats, Some("u1"), None)
            .await
            .unwrap();
        assert_eq!(economy.balance("u1"), after_first);
    }
}
