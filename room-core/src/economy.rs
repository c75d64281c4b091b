//! The wallet boundary the room runtime must uphold.
//!
//! Entry fees are debited through reservations before a seat becomes
//! visible and refunded when a join falls apart; winnings flow through
//! payout keys that make outbox retries harmless. Every ledger write is an
//! append with a unique idempotency key; balances never go negative.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// House share deducted from every ranked or winner payout.
pub const RAKE_PERCENT: i64 = 3;

/// Ranked payout tables per player count, normalized to 1.
const PAYOUT_TABLE_2: [f64; 2] = [0.7, 0.3];
const PAYOUT_TABLE_3: [f64; 3] = [0.5, 0.3, 0.2];
const PAYOUT_TABLE_4: [f64; 4] = [0.4, 0.3, 0.2, 0.1];

/// A fee debit awaiting the outcome of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub reservation_id: String,
    pub user_id: String,
    pub room_id: String,
    pub amount: i64,
}

impl Reservation {
    pub fn refund_key(&self) -> String {
        format!("refund:{}", self.reservation_id)
    }
}

/// Idempotency key of a game award.
pub fn win_key(room_id: &str, user_id: &str) -> String {
    format!("win:{room_id}:{user_id}")
}

pub fn rake(total_pot: i64) -> i64 {
    total_pot * RAKE_PERCENT / 100
}

/// Payout weights for a ranking of `players` entries.
///
/// Small rankings use the fixed tables above; anything larger pays the top
/// half of the ranking harmonic-series weights (1, 1/2, 1/3, ...)
/// normalized to sum to 1. Ranks below the paid half receive nothing.
pub fn payout_shares(players: usize) -> Vec<f64> {
    match players {
        0 | 1 => vec![1.0],
        2 => PAYOUT_TABLE_2.to_vec(),
        3 => PAYOUT_TABLE_3.to_vec(),
        4 => PAYOUT_TABLE_4.to_vec(),
        n => {
            let paid = n.div_ceil(2);
            let total: f64 = (1..=paid).map(|rank| 1.0 / rank as f64).sum();
            (1..=paid).map(|rank| 1.0 / rank as f64 / total).collect()
        }
    }
}

/// Concrete awards for one finished game.
///
/// Winner-take-all when a winner is named without a ranking; table payouts
/// over a ranking; an equal, rake-free refund when nobody won.
pub fn compute_awards(
    total_pot: i64,
    seats: &HashMap<String, u8>,
    winner_user_id: Option<&str>,
    ranking: Option<&[String]>,
) -> Vec<(String, i64)> {
    if total_pot <= 0 || seats.is_empty() {
        return Vec::new();
    }
    match (winner_user_id, ranking) {
        (Some(winner), None) => {
            vec![(winner.to_string(), total_pot - rake(total_pot))]
        }
        (_, Some(ranking)) if !ranking.is_empty() => {
            let pool = total_pot - rake(total_pot);
            let shares = payout_shares(ranking.len());
            ranking
                .iter()
                .zip(shares.iter())
                .map(|(user, share)| (user.clone(), (pool as f64 * share).floor() as i64))
                .filter(|(_, amount)| *amount > 0)
                .collect()
        }
        _ => {
            // Nobody won: everyone gets their stake back, no rake.
            let refund = total_pot / seats.len() as i64;
            let mut users: Vec<&String> = seats.keys().collect();
            users.sort_unstable();
            users
                .into_iter()
                .map(|user| (user.clone(), refund))
                .collect()
        }
    }
}

#[async_trait]
pub trait EconomyService: Send + Sync {
    /// Debits `fee` and writes a ledger entry keyed by the fresh
    /// reservation id. Fails with [`CoreError::InsufficientFunds`] when the
    /// balance would go negative.
    async fn reserve_entry_fee(
        &self,
        user_id: &str,
        fee: i64,
        room_id: &str,
    ) -> CoreResult<Reservation>;

    /// Marks the reservation confirmed; bookkeeping only.
    async fn commit_entry_fee(&self, reservation: &Reservation) -> CoreResult<()>;

    /// Credits the fee back under `refund:<reservationId>`. Safe to retry.
    async fn refund_entry_fee(&self, reservation: &Reservation) -> CoreResult<()>;

    /// Distributes a finished game's pot. Retried by the outbox; the
    /// `win:<roomId>:<userId>` keys keep every award single-shot.
    async fn process_game_payouts(
        &self,
        room_id: &str,
        game_type: &str,
        total_pot: i64,
        seats: &HashMap<String, u8>,
        winner_user_id: Option<&str>,
        ranking: Option<&[String]>,
    ) -> CoreResult<()>;
}

pub struct PostgresEconomy {
    pool: PgPool,
    initial_coins: i64,
}

impl PostgresEconomy {
    pub fn new(pool: PgPool, initial_coins: i64) -> Self {
        PostgresEconomy {
            pool,
            initial_coins,
        }
    }

    /// Runs `apply_ledger_entry` in its own transaction, retrying the
    /// optimistic version check a few times.
    async fn ledger_transaction(
        &self,
        user_id: &str,
        amount: i64,
        entry_type: &str,
        description: &str,
        reference_id: &str,
        idempotency_key: &str,
    ) -> CoreResult<i64> {
        const ATTEMPTS: u32 = 3;
        let mut last = CoreError::ConcurrencyConflict;
        for _ in 0..ATTEMPTS {
            let mut tx = self.pool.begin().await?;
            match apply_ledger_entry(
                &mut *tx,
                self.initial_coins,
                user_id,
                amount,
                entry_type,
                description,
                reference_id,
                idempotency_key,
            )
            .await
            {
                Ok(balance_after) => {
                    tx.commit().await?;
                    return Ok(balance_after);
                }
                Err(CoreError::ConcurrencyConflict) => {
                    tx.rollback().await?;
                    last = CoreError::ConcurrencyConflict;
                }
                Err(other) => {
                    tx.rollback().await?;
                    return Err(other);
                }
            }
        }
        Err(last)
    }
}

/// Appends one ledger entry and moves the balance, inside the caller's
/// transaction.
///
/// The idempotency key is the write gate: a second call with the same key
/// changes nothing and reports [`CoreError::DuplicateTransaction`]. The
/// profile row uses an optimistic `version`; a lost race surfaces as
/// [`CoreError::ConcurrencyConflict`] for the caller to retry.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn apply_ledger_entry(
    conn: &mut PgConnection,
    initial_coins: i64,
    user_id: &str,
    amount: i64,
    entry_type: &str,
    description: &str,
    reference_id: &str,
    idempotency_key: &str,
) -> CoreResult<i64> {
    protocol::validate::coin_amount(amount)?;

    sqlx::query(
        "INSERT INTO player_profiles (user_id, coins, version, is_deleted) \
         VALUES ($1, $2, 1, FALSE) ON CONFLICT (user_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(initial_coins)
    .execute(&mut *conn)
    .await?;

    let (coins, version): (i64, i64) = sqlx::query_as(
        "SELECT coins, version FROM player_profiles WHERE user_id = $1 AND is_deleted = FALSE",
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;

    let balance_after = coins + amount;
    if balance_after < 0 {
        return Err(CoreError::InsufficientFunds);
    }

    let inserted = sqlx::query(
        "INSERT INTO wallet_transactions \
         (id, user_id, amount, balance_after, type, description, reference_id, idempotency_key, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW()) \
         ON CONFLICT (idempotency_key) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(amount)
    .bind(balance_after)
    .bind(entry_type)
    .bind(description)
    .bind(reference_id)
    .bind(idempotency_key)
    .execute(&mut *conn)
    .await?;
    if inserted.rows_affected() == 0 {
        return Err(CoreError::DuplicateTransaction);
    }

    let updated = sqlx::query(
        "UPDATE player_profiles SET coins = $1, version = version + 1 \
         WHERE user_id = $2 AND version = $3",
    )
    .bind(balance_after)
    .bind(user_id)
    .bind(version)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(CoreError::ConcurrencyConflict);
    }

    Ok(balance_after)
}

/// Applies every award of a finished game inside the caller's transaction.
/// Awards that already landed (duplicate win key) are skipped.
pub(crate) async fn apply_payouts(
    conn: &mut PgConnection,
    initial_coins: i64,
    room_id: &str,
    game_type: &str,
    total_pot: i64,
    seats: &HashMap<String, u8>,
    winner_user_id: Option<&str>,
    ranking: Option<&[String]>,
) -> CoreResult<()> {
    let awards = compute_awards(total_pot, seats, winner_user_id, ranking);
    for (user_id, amount) in awards {
        let outcome = apply_ledger_entry(
            conn,
            initial_coins,
            &user_id,
            amount,
            "payout",
            &format!("{game_type} game payout"),
            room_id,
            &win_key(room_id, &user_id),
        )
        .await;
        match outcome {
            Ok(_) => {}
            // A previous attempt already credited this user.
            Err(CoreError::DuplicateTransaction) => {
                tracing::debug!(room_id, user_id, "payout already applied");
            }
            Err(other) => return Err(other),
        }
    }
    Ok(())
}

#[async_trait]
impl EconomyService for PostgresEconomy {
    async fn reserve_entry_fee(
        &self,
        user_id: &str,
        fee: i64,
        room_id: &str,
    ) -> CoreResult<Reservation> {
        let reservation = Reservation {
            reservation_id: format!("res-{}", Uuid::new_v4().simple()),
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            amount: fee,
        };
        self.ledger_transaction(
            user_id,
            -fee,
            "entry_fee",
            "entry fee reservation",
            room_id,
            &reservation.reservation_id,
        )
        .await?;
        Ok(reservation)
    }

    async fn commit_entry_fee(&self, reservation: &Reservation) -> CoreResult<()> {
        sqlx::query(
            "UPDATE wallet_transactions SET description = 'entry fee (committed)' \
             WHERE idempotency_key = $1",
        )
        .bind(&reservation.reservation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn refund_entry_fee(&self, reservation: &Reservation) -> CoreResult<()> {
        let outcome = self
            .ledger_transaction(
                &reservation.user_id,
                reservation.amount,
                "refund",
                "entry fee refund",
                &reservation.room_id,
                &reservation.refund_key(),
            )
            .await;
        match outcome {
            Ok(_) => Ok(()),
            // The refund already landed on an earlier attempt.
            Err(CoreError::DuplicateTransaction) => Ok(()),
            Err(other) => Err(other),
        }
    }

    async fn process_game_payouts(
        &self,
        room_id: &str,
        game_type: &str,
        total_pot: i64,
        seats: &HashMap<String, u8>,
        winner_user_id: Option<&str>,
        ranking: Option<&[String]>,
    ) -> CoreResult<()> {
        const ATTEMPTS: u32 = 3;
        for attempt in 0..ATTEMPTS {
            let mut tx = self.pool.begin().await?;
            match apply_payouts(
                &mut *tx,
                self.initial_coins,
                room_id,
                game_type,
                total_pot,
                seats,
                winner_user_id,
                ranking,
            )
            .await
            {
                Ok(()) => {
                    tx.commit().await?;
                    return Ok(());
                }
                Err(CoreError::ConcurrencyConflict) if attempt + 1 < ATTEMPTS => {
                    tx.rollback().await?;
                }
                Err(other) => {
                    tx.rollback().await?;
                    return Err(other);
                }
            }
        }
        Err(CoreError::ConcurrencyConflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seats(users: &[&str]) -> HashMap<String, u8> {
        users
            .iter()
            .enumerate()
            .map(|(seat, user)| (user.to_string(), seat as u8))
            .collect()
    }

    #[test]
    fn rake_is_three_percent_floored() {
        assert_eq!(rake(400), 12);
        assert_eq!(rake(100), 3);
        assert_eq!(rake(33), 0);
    }

    #[test]
    fn winner_take_all_gets_pot_minus_rake() {
        let awards = compute_awards(400, &seats(&["a", "b", "c", "d"]), Some("b"), None);
        assert_eq!(awards, vec![("b".to_string(), 388)]);
    }

    #[test]
    fn ranked_payouts_follow_the_tables() {
        let ranking: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let awards = compute_awards(400, &seats(&["a", "b", "c", "d"]), Some("a"), Some(&ranking));
        // 400 - 12 rake = 388; table [0.4, 0.3, 0.2, 0.1].
        assert_eq!(
            awards,
            vec![
                ("a".to_string(), 155),
                ("b".to_string(), 116),
                ("c".to_string(), 77),
                ("d".to_string(), 38),
            ]
        );

        let two: Vec<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        let awards = compute_awards(200, &seats(&["x", "y"]), None, Some(&two));
        // 200 - 6 rake = 194; table [0.7, 0.3].
        assert_eq!(
            awards,
            vec![("x".to_string(), 135), ("y".to_string(), 58)]
        );

        let three: Vec<String> = ["x", "y", "z"].iter().map(|s| s.to_string()).collect();
        let awards = compute_awards(300, &seats(&["x", "y", "z"]), None, Some(&three));
        // 300 - 9 rake = 291; table [0.5, 0.3, 0.2].
        assert_eq!(
            awards,
            vec![
                ("x".to_string(), 145),
                ("y".to_string(), 87),
                ("z".to_string(), 58),
            ]
        );
    }

    #[test]
    fn no_winner_means_equal_rake_free_refund() {
        let awards = compute_awards(300, &seats(&["a", "b", "c"]), None, None);
        assert_eq!(awards.len(), 3);
        assert!(awards.iter().all(|(_, amount)| *amount == 100));
    }

    #[test]
    fn empty_pot_awards_nothing() {
        assert!(compute_awards(0, &seats(&["a"]), Some("a"), None).is_empty());
        assert!(compute_awards(100, &HashMap::new(), None, None).is_empty());
    }

    #[test]
    fn refund_key_pairs_with_reservation() {
        let reservation = Reservation {
            reservation_id: "res-abc".into(),
            user_id: "u1".into(),
            room_id: "r1".into(),
            amount: 100,
        };
        assert_eq!(reservation.refund_key(), "refund:res-abc");
        assert_eq!(win_key("r1", "u1"), "win:r1:u1");
    }

    #[test]
    fn payout_shares_match_the_fixed_tables_for_small_counts() {
        assert_eq!(payout_shares(1), vec![1.0]);
        assert_eq!(payout_shares(2), PAYOUT_TABLE_2.to_vec());
        assert_eq!(payout_shares(3), PAYOUT_TABLE_3.to_vec());
        assert_eq!(payout_shares(4), PAYOUT_TABLE_4.to_vec());
    }

    #[test]
    fn large_rankings_pay_the_top_half_harmonically() {
        for players in [5usize, 6, 8, 9] {
            let shares = payout_shares(players);
            assert_eq!(shares.len(), players.div_ceil(2));
            let sum: f64 = shares.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "shares for {players} sum to {sum}");
            assert!(shares.windows(2).all(|pair| pair[0] > pair[1]));
            // Harmonic weights: rank 1 earns twice rank 2, thrice rank 3.
            assert!((shares[0] / shares[1] - 2.0).abs() < 1e-9);
            assert!((shares[0] / shares[2] - 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn six_player_ranking_pays_only_the_top_three() {
        let users = ["a", "b", "c", "d", "e", "f"];
        let ranking: Vec<String> = users.iter().map(|s| s.to_string()).collect();
        let awards = compute_awards(600, &seats(&users), None, Some(&ranking));

        // 600 minus 18 rake = 582, split 6:3:2 across the top half.
        assert_eq!(awards.len(), 3);
        assert_eq!(
            awards,
            vec![
                ("a".to_string(), 317),
                ("b".to_string(), 158),
                ("c".to_string(), 105),
            ]
        );
    }
}
