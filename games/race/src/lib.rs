//! A four-seat dice race: roll, advance, first piece past the finish line
//! takes the pot. The module exercises the whole turn-based surface of the
//! runtime (turn ownership, timeouts, ranked payouts).

pub mod engine;
pub mod state;

use std::sync::Arc;

use room_core::economy::EconomyService;
use room_core::module::GameModule;
use room_core::service::StandardRoomService;
use room_core::store::RoomStore;

use crate::engine::RaceEngine;
use crate::state::RaceState;

/// Game type key this module registers under.
pub const GAME_TYPE: &str = "race";

/// Builds the module descriptor for registration at process init.
pub fn module(store: Arc<RoomStore>, economy: Arc<dyn EconomyService>) -> GameModule {
    GameModule {
        game_type: GAME_TYPE.to_string(),
        engine: Arc::new(RaceEngine::new(store.clone())),
        service: Arc::new(StandardRoomService::<RaceState>::new(
            GAME_TYPE,
            store,
            economy,
            Box::new(|meta| RaceState::new(meta.max_seats)),
        )),
    }
}
