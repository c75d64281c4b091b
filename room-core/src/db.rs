//! Relational pool construction and schema bootstrap.
//!
//! The schema is created idempotently at startup; every statement is a
//! CREATE ... IF NOT EXISTS so rolling deploys can race on it safely.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::{AdminSeedConfig, DatabaseConfig};
use crate::error::CoreResult;

pub async fn connect(config: &DatabaseConfig) -> CoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_pool_size)
        .min_connections(config.min_pool_size)
        .idle_timeout(Duration::from_secs(config.connection_idle_lifetime))
        .acquire_timeout(Duration::from_secs(config.command_timeout))
        .connect(&config.url)
        .await?;
    Ok(pool)
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS player_profiles (
        user_id     TEXT PRIMARY KEY,
        coins       BIGINT NOT NULL DEFAULT 0,
        version     BIGINT NOT NULL DEFAULT 1,
        is_deleted  BOOLEAN NOT NULL DEFAULT FALSE,
        deleted_at  TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS wallet_transactions (
        id              UUID PRIMARY KEY,
        user_id         TEXT NOT NULL,
        amount          BIGINT NOT NULL,
        balance_after   BIGINT NOT NULL,
        type            TEXT NOT NULL,
        description     TEXT NOT NULL DEFAULT '',
        reference_id    TEXT,
        idempotency_key TEXT NOT NULL UNIQUE,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_wallet_transactions_user
        ON wallet_transactions (user_id, created_at)",
    "CREATE TABLE IF NOT EXISTS outbox_messages (
        id           UUID PRIMARY KEY,
        event_type   TEXT NOT NULL,
        payload      JSONB NOT NULL,
        attempts     INTEGER NOT NULL DEFAULT 0,
        last_error   TEXT,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        processed_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_outbox_due
        ON outbox_messages (processed_at, attempts, created_at)",
    "CREATE TABLE IF NOT EXISTS archived_games (
        id                UUID PRIMARY KEY,
        room_id           TEXT NOT NULL UNIQUE,
        game_type         TEXT NOT NULL,
        final_state_json  TEXT NOT NULL,
        player_seats_json TEXT NOT NULL,
        winner_user_id    TEXT,
        total_pot         BIGINT NOT NULL DEFAULT 0,
        started_at        TIMESTAMPTZ NOT NULL,
        ended_at          TIMESTAMPTZ NOT NULL
    )",
];

/// Creates the tables and indexes the runtime relies on.
pub async fn run_migrations(pool: &PgPool) -> CoreResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("database schema is up to date");
    Ok(())
}

/// Seeds the administrative profile once, if configured.
pub async fn seed_admin(pool: &PgPool, seed: &AdminSeedConfig) -> CoreResult<()> {
    let inserted = sqlx::query(
        "INSERT INTO player_profiles (user_id, coins, version, is_deleted) \
         VALUES ($1, $2, 1, FALSE) ON CONFLICT (user_id) DO NOTHING",
    )
    .bind(&seed.email)
    .bind(seed.initial_coins)
    .execute(pool)
    .await?;
    if inserted.rows_affected() == 1 {
        tracing::info!(admin = %seed.email, "seeded admin profile");
    }
    Ok(())
}
