//! Connection lifecycle: heartbeats, disconnect grace and reclaim.
//!
//! A user is online while at least one connection heartbeats. Losing the
//! last connection while seated writes a disconnect ticket; reconnecting
//! within the grace window consumes the ticket and resumes the room. A
//! cleanup worker on every node turns expired tickets into real leaves.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use protocol::RoomMessage;
use tokio::sync::watch;

use crate::error::{CoreError, CoreResult};
use crate::runtime::RoomRuntime;

pub struct SessionManager {
    runtime: Arc<RoomRuntime>,
}

impl SessionManager {
    pub fn new(runtime: Arc<RoomRuntime>) -> Self {
        SessionManager { runtime }
    }

    fn grace_secs(&self) -> u64 {
        self.runtime.config.session.reconnection_grace_period_seconds
    }

    /// Registers a fresh connection. When a disconnect ticket exists the
    /// session resumes into that room and the room hears about it.
    pub async fn on_connect(
        &self,
        user_id: &str,
        user_name: &str,
        connection_id: &str,
    ) -> CoreResult<Option<String>> {
        let registry = &self.runtime.registry;
        registry.touch_connection(user_id, connection_id).await?;
        registry.remember_user_name(user_id, user_name).await?;

        let Some(room_id) = registry.take_disconnect_ticket(user_id).await? else {
            return Ok(None);
        };
        self.clear_meta_grace(&room_id, user_id).await;
        self.runtime
            .broadcaster
            .publish(
                &room_id,
                RoomMessage::PlayerReconnected {
                    room_id: room_id.clone(),
                    user_id: user_id.to_string(),
                    user_name: user_name.to_string(),
                },
            )
            .await;
        tracing::info!(user_id, room_id, "session resumed within grace period");
        Ok(Some(room_id))
    }

    /// Refreshes the heartbeat score of one connection.
    pub async fn heartbeat(&self, user_id: &str, connection_id: &str) -> CoreResult<()> {
        self.runtime
            .registry
            .touch_connection(user_id, connection_id)
            .await
    }

    /// Unregisters a connection. The last connection of a seated user
    /// starts the grace countdown instead of leaving immediately.
    pub async fn on_disconnect(
        &self,
        user_id: &str,
        user_name: &str,
        connection_id: &str,
    ) -> CoreResult<()> {
        let registry = &self.runtime.registry;
        let remaining = registry.remove_connection(user_id, connection_id).await?;
        if remaining > 0 {
            return Ok(());
        }
        let Some(room_id) = registry.user_room(user_id).await? else {
            return Ok(());
        };

        let grace = self.grace_secs();
        let expires_at = Utc::now() + chrono::Duration::seconds(grace as i64);
        registry
            .write_disconnect_ticket(user_id, &room_id, expires_at)
            .await?;
        self.record_meta_grace(&room_id, user_id, expires_at).await;

        self.runtime
            .broadcaster
            .publish(
                &room_id,
                RoomMessage::PlayerDisconnected {
                    room_id: room_id.clone(),
                    user_id: user_id.to_string(),
                    user_name: user_name.to_string(),
                    grace_period_seconds: grace,
                },
            )
            .await;
        tracing::info!(user_id, room_id, grace, "player disconnected, grace running");
        Ok(())
    }

    /// Best-effort note of the grace deadline in the room meta so engines
    /// can show a countdown.
    async fn record_meta_grace(
        &self,
        room_id: &str,
        user_id: &str,
        expires_at: chrono::DateTime<Utc>,
    ) {
        if let Err(err) = self
            .mutate_meta_grace(room_id, user_id, Some(expires_at))
            .await
        {
            tracing::debug!(room_id, user_id, %err, "could not record grace in meta");
        }
    }

    async fn clear_meta_grace(&self, room_id: &str, user_id: &str) {
        if let Err(err) = self.mutate_meta_grace(room_id, user_id, None).await {
            tracing::debug!(room_id, user_id, %err, "could not clear grace in meta");
        }
    }

    async fn mutate_meta_grace(
        &self,
        room_id: &str,
        user_id: &str,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> CoreResult<()> {
        let Some(game_type) = self.runtime.registry.game_type_of(room_id).await? else {
            return Ok(());
        };
        for _ in 0..3 {
            let Some((expected_json, meta)) = self
                .runtime
                .store
                .load_meta_raw(&game_type, room_id)
                .await?
            else {
                return Ok(());
            };
            let mut updated = meta.clone();
            match expires_at {
                Some(at) => {
                    updated.disconnect_grace.insert(user_id.to_string(), at);
                }
                None => {
                    updated.disconnect_grace.remove(user_id);
                }
            }
            if self
                .runtime
                .store
                .compare_and_swap_meta(&game_type, room_id, &expected_json, &updated)
                .await?
            {
                return Ok(());
            }
        }
        Err(CoreError::ConcurrencyConflict)
    }
}

/// Turns expired disconnect tickets into real leaves. Runs on every node;
/// the ticket take below is effectively idempotent because the leave and
/// the mapping cleanup are.
pub struct SessionCleanupWorker {
    runtime: Arc<RoomRuntime>,
}

impl SessionCleanupWorker {
    pub fn new(runtime: Arc<RoomRuntime>) -> Self {
        SessionCleanupWorker { runtime }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.sweep().await {
                        tracing::error!(%err, "session cleanup sweep failed");
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

    /// One bounded sweep over expired tickets.
    pub async fn sweep(&self) -> CoreResult<()> {
        const BATCH: isize = 50;
        let expired = self
            .runtime
            .registry
            .expired_disconnect_tickets(Utc::now(), BATCH)
            .await?;

        for (user_id, room_id) in expired {
            self.runtime
                .registry
                .clear_disconnect_ticket(&user_id)
                .await?;
            let user_name = self
                .runtime
                .registry
                .user_name(&user_id)
                .await?
                .unwrap_or_else(|| user_id.clone());

            let Some(game_type) = self.runtime.registry.game_type_of(&room_id).await? else {
                self.runtime.registry.clear_user_room(&user_id).await?;
                continue;
            };
            let service = self.runtime.modules.service(&game_type)?;
            match service.leave_room(&room_id, &user_id).await {
                Ok(()) | Err(CoreError::NotInRoom) | Err(CoreError::RoomNotFound) => {}
                Err(err) => {
                    tracing::error!(user_id, room_id, %err, "grace-expiry leave failed");
                    continue;
                }
            }
            self.runtime.registry.clear_user_room(&user_id).await?;

            self.runtime
                .broadcaster
                .publish(
                    &room_id,
                    RoomMessage::PlayerLeft {
                        room_id: room_id.clone(),
                        user_id: user_id.clone(),
                        user_name,
                    },
                )
                .await;
            tracing::info!(user_id, room_id, "grace expired, player removed from room");
        }
        Ok(())
    }
}
