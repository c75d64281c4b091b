//! Operator pages: room listing, lobby snapshots, template reload, health.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;

use crate::state::AppState;

/// Generates a list of active rooms per game type with their occupancy.
pub async fn rooms_handler(State(state): State<Arc<AppState>>) -> String {
    let mut lines = Vec::new();
    for module in state.runtime.modules.iter() {
        let room_ids = match state
            .runtime
            .registry
            .rooms_by_game_type(&module.game_type, 0, 100)
            .await
        {
            Ok(room_ids) => room_ids,
            Err(err) => {
                return format!("Room listing failed: {}", err);
            }
        };
        let metas = match state
            .runtime
            .store
            .load_meta_many(&module.game_type, &room_ids)
            .await
        {
            Ok(metas) => metas,
            Err(err) => {
                return format!("Room listing failed: {}", err);
            }
        };
        for (room_id, meta) in metas {
            let code = state
                .runtime
                .registry
                .short_code_of(&room_id)
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| "-----".to_string());
            lines.push(format!(
                "Room: {:<34} Code: {} Game: {:<10} Players: {:02}/{:02} Fee: {}",
                room_id,
                code,
                meta.game_type,
                meta.seats.len(),
                meta.max_seats,
                meta.entry_fee,
            ));
        }
    }
    if lines.is_empty() {
        "No active rooms".to_string()
    } else {
        lines.join("\n")
    }
}

/// Batched lobby snapshot of one game type: public rooms with their full
/// state, newest page first.
pub async fn lobby_handler(
    State(state): State<Arc<AppState>>,
    Path(game_type): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if protocol::validate::game_type(&game_type).is_err() {
        return Err((StatusCode::BAD_REQUEST, "bad game type".to_string()));
    }
    let engine = state
        .runtime
        .modules
        .engine(&game_type)
        .map_err(|err| (StatusCode::NOT_FOUND, err.to_string()))?;

    let room_ids = state
        .runtime
        .registry
        .rooms_by_game_type(&game_type, 0, 100)
        .await
        .map_err(|err| (StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;
    let snapshots = engine
        .states(&room_ids)
        .await
        .map_err(|err| (StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;

    let rooms: Vec<serde_json::Value> = snapshots
        .iter()
        .filter(|snapshot| {
            snapshot.meta.visibility == room_core::module::RoomVisibility::Public
        })
        .filter_map(|snapshot| serde_json::to_value(snapshot).ok())
        .collect();
    Ok(Json(serde_json::json!({
        "game_type": game_type,
        "rooms": rooms,
    })))
}

/// Forces the reload of the template file and lists the content. This
/// enables adding new room presets without restarting the service.
pub async fn reload_handler(State(state): State<Arc<AppState>>) -> String {
    match state.templates.reload().await {
        Ok(_) => {
            let mut lines = Vec::new();
            for template in state.templates.list().await {
                lines.push(format!(
                    "Template: {:<40} Game: {:<10} Seats: {} Fee: {}",
                    template.name, template.game_type, template.max_seats, template.entry_fee,
                ));
            }
            lines.join("\n")
        }
        Err(e) => {
            format!("Template reload failed: {}", e)
        }
    }
}

/// Liveness of the two backing stores.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> (StatusCode, String) {
    let kv_ok = match state.kv_pool.get().await {
        Ok(mut conn) => redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok(),
        Err(_) => false,
    };
    let db_ok = sqlx::query("SELECT 1").execute(&state.db_pool).await.is_ok();

    let body = format!("kv: {}\ndb: {}", status(kv_ok), status(db_ok));
    if kv_ok && db_ok {
        (StatusCode::OK, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body)
    }
}

fn status(ok: bool) -> &'static str {
    if ok { "up" } else { "down" }
}
