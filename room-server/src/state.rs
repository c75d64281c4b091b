//! Shared state handed to every request handler.

use std::sync::Arc;

use room_core::config::TemplateStore;
use room_core::runtime::RoomRuntime;
use room_core::session::SessionManager;
use sqlx::PgPool;

use crate::auth::Authenticator;

pub struct AppState {
    pub runtime: Arc<RoomRuntime>,
    pub sessions: Arc<SessionManager>,
    pub templates: Arc<TemplateStore>,
    pub authenticator: Arc<dyn Authenticator>,
    pub kv_pool: deadpool_redis::Pool,
    pub db_pool: PgPool,
}
