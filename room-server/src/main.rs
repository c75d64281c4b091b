mod admin;
mod auth;
mod hub;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use room_core::broadcast::Broadcaster;
use room_core::codec::MigrationRegistry;
use room_core::config::{RuntimeConfig, TemplateStore};
use room_core::db;
use room_core::dispatch::CommandDispatcher;
use room_core::economy::PostgresEconomy;
use room_core::module::ModuleRegistry;
use room_core::outbox::{GAME_ENDED_EVENT, GameEndedHandler, OutboxWorker, PgOutboxRepository};
use room_core::registry::RoomRegistry;
use room_core::runtime::RoomRuntime;
use room_core::scheduler::TurnTimeoutScheduler;
use room_core::session::{SessionCleanupWorker, SessionManager};
use room_core::store::RoomStore;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::auth::ApiKeyAuthenticator;
use crate::state::AppState;

#[tokio::main]
/// Wires the pools, the module table and the background workers, then
/// serves the websocket hub and the operator pages until a shutdown signal
/// arrives.
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=debug,room_core=debug", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let config = Arc::new(RuntimeConfig::load().context("loading configuration")?);
    let worker_id = format!("worker-{}", Uuid::new_v4().simple());
    tracing::info!(%worker_id, "room server starting");

    // Backing stores.
    let kv_pool = deadpool_redis::Config::from_url(&config.redis.url)
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .context("building the key-value pool")?;
    let db_pool = db::connect(&config.database)
        .await
        .context("connecting to the database")?;
    db::run_migrations(&db_pool).await.context("migrating")?;
    if let Some(seed) = &config.admin_seed {
        db::seed_admin(&db_pool, seed).await.context("seeding admin")?;
    }

    // The runtime pieces.
    let registry = Arc::new(RoomRegistry::new(kv_pool.clone()));
    let migrations = Arc::new(MigrationRegistry::new());
    let store = Arc::new(RoomStore::new(
        kv_pool.clone(),
        registry.clone(),
        migrations,
        worker_id.clone(),
    ));
    let economy = Arc::new(PostgresEconomy::new(
        db_pool.clone(),
        config.economy.initial_coins,
    ));
    let outbox = Arc::new(PgOutboxRepository::new(db_pool.clone()));

    let mut modules = ModuleRegistry::new();
    modules.register(race_game::module(store.clone(), economy.clone()));
    modules.register(reveal_game::module(store.clone(), economy.clone()));
    let modules = Arc::new(modules);

    let runtime = Arc::new(RoomRuntime {
        modules,
        store,
        registry,
        broadcaster: Arc::new(Broadcaster::new()),
        dispatcher: Arc::new(CommandDispatcher::new()),
        outbox: outbox.clone(),
        config: config.clone(),
    });
    let sessions = Arc::new(SessionManager::new(runtime.clone()));

    // Room templates must load once before we accept connections.
    let templates = Arc::new(TemplateStore::new(&config.server.templates_path));
    if let Err(message) = templates.reload().await {
        tracing::error!(message, "Initial template load error.");
        anyhow::bail!("initial template load failed: {message}");
    }

    // Background workers.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = TurnTimeoutScheduler::new(runtime.clone(), kv_pool.clone(), worker_id.clone());
    tokio::spawn(scheduler.run(shutdown_rx.clone()));
    tokio::spawn(SessionCleanupWorker::new(runtime.clone()).run(shutdown_rx.clone()));
    let outbox_worker = OutboxWorker::new(outbox).register_handler(
        GAME_ENDED_EVENT,
        Arc::new(GameEndedHandler::new(
            db_pool.clone(),
            config.economy.initial_coins,
        )),
    );
    tokio::spawn(outbox_worker.run(shutdown_rx));

    // The HTTP surface.
    let app_state = Arc::new(AppState {
        runtime: runtime.clone(),
        sessions,
        templates,
        authenticator: Arc::new(ApiKeyAuthenticator::new(
            config.security.minimum_api_key_length,
        )),
        kv_pool,
        db_pool,
    });

    let mut app = Router::new()
        .route("/ws", get(hub::websocket_handler))
        .route("/rooms", get(admin::rooms_handler))
        .route("/lobby/{game_type}", get(admin::lobby_handler))
        .route("/reload", get(admin::reload_handler))
        .route("/healthz", get(admin::health_handler))
        .with_state(app_state);

    if !config.cors.allowed_origins.is_empty() {
        let origins: Vec<_> = config
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        app = app.layer(CorsLayer::new().allow_origin(AllowOrigin::list(origins)));
    }

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "room server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("serving")?;

    // Stop the workers, then drain the dispatcher.
    let _ = shutdown_tx.send(true);
    runtime.shutdown(Duration::from_secs(10)).await;
    tracing::info!("room server stopped");
    Ok(())
}
