//! Default fee-aware room service modules embed.
//!
//! Join is the delicate path: the seat must not become visible before the
//! entry fee is reserved, and a lost meta write must refund the
//! reservation. Seat mutations go through a compare-and-swap on the meta
//! document so two concurrent joins can never take the same seat.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::codec::RoomState;
use crate::economy::EconomyService;
use crate::error::{CoreError, CoreResult};
use crate::module::{JoinOutcome, RoomMeta, RoomService};
use crate::store::RoomStore;

/// Builds the initial state for a fresh room of one game type.
pub type StateFactory<T> = Box<dyn Fn(&RoomMeta) -> T + Send + Sync>;

pub struct StandardRoomService<T: RoomState> {
    game_type: String,
    store: Arc<RoomStore>,
    economy: Arc<dyn EconomyService>,
    new_state: StateFactory<T>,
}

impl<T: RoomState> StandardRoomService<T> {
    pub fn new(
        game_type: impl Into<String>,
        store: Arc<RoomStore>,
        economy: Arc<dyn EconomyService>,
        new_state: StateFactory<T>,
    ) -> Self {
        StandardRoomService {
            game_type: game_type.into(),
            store,
            economy,
            new_state,
        }
    }

    /// CAS retries before a join or leave gives up.
    const CAS_ATTEMPTS: u32 = 3;
}

#[async_trait]
impl<T: RoomState> RoomService for StandardRoomService<T> {
    async fn create_room(&self, mut meta: RoomMeta) -> CoreResult<String> {
        meta.game_type = self.game_type.clone();
        let room_id = Uuid::new_v4().simple().to_string();
        let state = (self.new_state)(&meta);
        self.store
            .save(&self.game_type, &room_id, &state, &meta)
            .await?;
        if self
            .store
            .registry()
            .allocate_short_code(&room_id)
            .await?
            .is_none()
        {
            // The room works without a code; joining just needs the id.
            tracing::warn!(room_id, "room created without a short code");
        }
        tracing::info!(game_type = %self.game_type, room_id, "room created");
        Ok(room_id)
    }

    async fn join_room(&self, room_id: &str, user_id: &str) -> CoreResult<JoinOutcome> {
        let registry = self.store.registry().clone();
        for _ in 0..Self::CAS_ATTEMPTS {
            let Some((expected_json, meta)) =
                self.store.load_meta_raw(&self.game_type, room_id).await?
            else {
                return Err(CoreError::RoomNotFound);
            };

            if meta.seats.contains_key(user_id) {
                return Err(CoreError::AlreadyInRoom);
            }
            let Some(seat) = meta.lowest_free_seat() else {
                return Err(CoreError::RoomFull);
            };

            // One active room per user, enforced by the registry key.
            if !registry.try_set_user_room(user_id, room_id).await? {
                return Err(CoreError::AlreadyInRoom);
            }

            // Reserve before the seat becomes visible.
            let reservation = if meta.entry_fee > 0 {
                match self
                    .economy
                    .reserve_entry_fee(user_id, meta.entry_fee, room_id)
                    .await
                {
                    Ok(reservation) => Some(reservation),
                    Err(err) => {
                        registry.clear_user_room(user_id).await?;
                        return Err(err);
                    }
                }
            } else {
                None
            };

            let mut updated = meta.clone();
            updated.seats.insert(user_id.to_string(), seat);

            if self
                .store
                .compare_and_swap_meta(&self.game_type, room_id, &expected_json, &updated)
                .await?
            {
                if let Some(reservation) = &reservation {
                    if let Err(err) = self.economy.commit_entry_fee(reservation).await {
                        tracing::warn!(room_id, user_id, %err, "entry fee commit failed");
                    }
                }
                registry
                    .update_room_activity(&self.game_type, room_id)
                    .await?;
                return Ok(JoinOutcome { seat });
            }

            // Lost the race: compensate and try again against fresh meta.
            if let Some(reservation) = &reservation {
                self.economy.refund_entry_fee(reservation).await?;
            }
            registry.clear_user_room(user_id).await?;
        }
        Err(CoreError::ConcurrencyConflict)
    }

    async fn leave_room(&self, room_id: &str, user_id: &str) -> CoreResult<()> {
        let registry = self.store.registry().clone();
        for _ in 0..Self::CAS_ATTEMPTS {
            let Some((expected_json, meta)) =
                self.store.load_meta_raw(&self.game_type, room_id).await?
            else {
                // The room is already gone; drop any stale mapping.
                registry.clear_user_room(user_id).await?;
                return Ok(());
            };

            if !meta.seats.contains_key(user_id) {
                registry.clear_user_room(user_id).await?;
                return Err(CoreError::NotInRoom);
            }

            let mut updated = meta.clone();
            updated.seats.remove(user_id);
            updated.disconnect_grace.remove(user_id);

            if self
                .store
                .compare_and_swap_meta(&self.game_type, room_id, &expected_json, &updated)
                .await?
            {
                registry.clear_user_room(user_id).await?;
                if updated.seats.is_empty() {
                    self.delete_room(room_id).await?;
                } else {
                    registry
                        .update_room_activity(&self.game_type, room_id)
                        .await?;
                }
                tracing::info!(game_type = %self.game_type, room_id, user_id, "player left room");
                return Ok(());
            }
        }
        Err(CoreError::ConcurrencyConflict)
    }

    async fn room_meta(&self, room_id: &str) -> CoreResult<Option<RoomMeta>> {
        self.store.load_meta(&self.game_type, room_id).await
    }

    async fn delete_room(&self, room_id: &str) -> CoreResult<()> {
        self.store.delete(&self.game_type, room_id).await?;
        tracing::info!(game_type = %self.game_type, room_id, "room deleted");
        Ok(())
    }
}
