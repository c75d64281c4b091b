//! A single-player reveal game: a hidden grid holds a handful of mines,
//! every safe tile raises the prize, cashing out banks it and one mine
//! loses the stake. There is no turn concept, so the module does not
//! implement the timeout surface.

pub mod engine;
pub mod state;

use std::sync::Arc;

use room_core::economy::EconomyService;
use room_core::module::GameModule;
use room_core::service::StandardRoomService;
use room_core::store::RoomStore;

use crate::engine::RevealEngine;
use crate::state::RevealState;

/// Game type key this module registers under.
pub const GAME_TYPE: &str = "reveal";

/// Builds the module descriptor for registration at process init.
pub fn module(store: Arc<RoomStore>, economy: Arc<dyn EconomyService>) -> GameModule {
    GameModule {
        game_type: GAME_TYPE.to_string(),
        engine: Arc::new(RevealEngine::new(store.clone())),
        service: Arc::new(StandardRoomService::<RevealState>::new(
            GAME_TYPE,
            store,
            economy,
            Box::new(|_meta| RevealState::with_random_mines(&mut rand::rng())),
        )),
    }
}
