//! The reveal engine. Single seat, no turn clock, terminal on mine or
//! cash-out.

use std::sync::Arc;

use async_trait::async_trait;
use room_core::error::{CoreError, CoreResult};
use room_core::module::{
    ActionResult, GameCommand, GameEngine, GameEvent, GameOutcome, RoomMeta, StateResponse,
};
use room_core::store::RoomStore;
use serde_json::json;

use crate::GAME_TYPE;
use crate::state::{GRID_TILES, MINE_COUNT, RevealPhase, RevealState, RevealTransition};

pub struct RevealEngine {
    store: Arc<RoomStore>,
}

impl RevealEngine {
    pub fn new(store: Arc<RoomStore>) -> Self {
        RevealEngine { store }
    }

    /// Public snapshot. Mine positions stay hidden until the round ends.
    fn view(state: &RevealState, meta: &RoomMeta) -> serde_json::Value {
        let over = state.phase != RevealPhase::Playing;
        json!({
            "grid_tiles": GRID_TILES,
            "mine_count": MINE_COUNT,
            "phase": state.phase,
            "revealed": state.revealed,
            "revealed_count": state.revealed_count(),
            "prize": state.prize(meta.entry_fee),
            "mines": if over { Some(state.mines) } else { None },
        })
    }

    fn transition_events(
        transition: &RevealTransition,
        state: &RevealState,
        meta: &RoomMeta,
    ) -> Vec<GameEvent> {
        match transition {
            RevealTransition::Safe {
                tile,
                revealed_count,
            } => vec![GameEvent::new(
                "TileRevealed",
                json!({
                    "tile": tile,
                    "safe": true,
                    "revealed_count": revealed_count,
                    "prize": state.prize(meta.entry_fee),
                }),
            )],
            RevealTransition::Mine { tile } => vec![GameEvent::new(
                "MineHit",
                json!({ "tile": tile }),
            )],
            RevealTransition::CashedOut { revealed_count } => vec![GameEvent::new(
                "CashedOut",
                json!({
                    "revealed_count": revealed_count,
                    "prize": state.prize(meta.entry_fee),
                }),
            )],
        }
    }

    fn outcome(state: &RevealState, meta: &RoomMeta, user_id: &str) -> GameOutcome {
        match state.phase {
            RevealPhase::CashedOut => GameOutcome {
                winner_user_id: Some(user_id.to_string()),
                ranking: None,
                final_state: Self::view(state, meta),
                // The prize is what the house honors for this round.
                total_pot: state.prize(meta.entry_fee),
            },
            _ => GameOutcome {
                // Busted: the stake stays with the house.
                winner_user_id: None,
                ranking: None,
                final_state: Self::view(state, meta),
                total_pot: 0,
            },
        }
    }
}

#[async_trait]
impl GameEngine for RevealEngine {
    fn game_type(&self) -> &str {
        GAME_TYPE
    }

    async fn execute(&self, room_id: &str, command: GameCommand) -> CoreResult<ActionResult> {
        let Some((mut state, meta)) = self.store.load::<RevealState>(GAME_TYPE, room_id).await?
        else {
            return Err(CoreError::RoomNotFound);
        };
        if meta.seat_of(&command.user_id).is_none() {
            return Err(CoreError::NotInRoom);
        }

        let transition = match command.action.as_str() {
            "reveal" => {
                let tile = command
                    .payload
                    .get("tile")
                    .and_then(|value| value.as_u64())
                    .ok_or_else(|| CoreError::IllegalMove("reveal needs a tile index".into()))?;
                state.reveal(tile as u8)
            }
            "cash_out" => state.cash_out(),
            other => return Err(CoreError::UnknownAction(other.to_string())),
        };

        let transition = match transition {
            Ok(transition) => transition,
            Err(reason) => return Ok(ActionResult::error(reason)),
        };

        self.store.save(GAME_TYPE, room_id, &state, &meta).await?;

        let mut result = ActionResult::ok(Self::view(&state, &meta));
        result.events = Self::transition_events(&transition, &state, &meta);
        if state.phase != RevealPhase::Playing {
            result = result.ended(Self::outcome(&state, &meta, &command.user_id));
        }
        Ok(result)
    }

    async fn legal_actions(&self, room_id: &str, user_id: &str) -> CoreResult<Vec<String>> {
        let Some((state, meta)) = self.store.load::<RevealState>(GAME_TYPE, room_id).await? else {
            return Err(CoreError::RoomNotFound);
        };
        if meta.seat_of(user_id).is_none() {
            return Ok(Vec::new());
        }
        Ok(state.legal_actions())
    }

    async fn state(&self, room_id: &str) -> CoreResult<Option<StateResponse>> {
        let Some((state, meta)) = self.store.load::<RevealState>(GAME_TYPE, room_id).await? else {
            return Ok(None);
        };
        Ok(Some(StateResponse {
            room_id: room_id.to_string(),
            game_type: GAME_TYPE.to_string(),
            legal_moves: state.legal_actions(),
            state: Self::view(&state, &meta),
            meta,
        }))
    }

    async fn states(&self, room_ids: &[String]) -> CoreResult<Vec<StateResponse>> {
        let rooms = self
            .store
            .load_many::<RevealState>(GAME_TYPE, room_ids)
            .await?;
        Ok(rooms
            .into_iter()
            .map(|(room_id, state, meta)| StateResponse {
                room_id,
                game_type: GAME_TYPE.to_string(),
                legal_moves: Vec::new(),
                state: Self::view(&state, &meta),
                meta,
            })
            .collect())
    }

    async fn metas(&self, room_ids: &[String]) -> CoreResult<Vec<(String, RoomMeta)>> {
        self.store.load_meta_many(GAME_TYPE, room_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solo_meta(fee: i64) -> RoomMeta {
        let mut meta = RoomMeta::new(GAME_TYPE, 1);
        meta.entry_fee = fee;
        meta.seats.insert("ada".to_string(), 0);
        meta
    }

    fn rigged() -> RevealState {
        let mut mines = [false; GRID_TILES];
        for tile in (GRID_TILES - MINE_COUNT)..GRID_TILES {
            mines[tile] = true;
        }
        RevealState {
            mines,
            revealed: [false; GRID_TILES],
            phase: RevealPhase::Playing,
        }
    }

    #[test]
    fn view_hides_mines_while_playing() {
        let meta = solo_meta(50);
        let mut state = rigged();
        state.reveal(0).unwrap();

        let view = RevealEngine::view(&state, &meta);
        assert!(view["mines"].is_null());
        assert_eq!(view["revealed_count"], 1);
        assert_eq!(view["prize"], 62); // 50 + 25%

        state.reveal((GRID_TILES - 1) as u8).unwrap();
        let view = RevealEngine::view(&state, &meta);
        assert!(view["mines"].is_array());
    }

    #[test]
    fn cash_out_outcome_awards_the_prize() {
        let meta = solo_meta(100);
        let mut state = rigged();
        state.reveal(0).unwrap();
        state.reveal(1).unwrap();
        state.cash_out().unwrap();

        let outcome = RevealEngine::outcome(&state, &meta, "ada");
        assert_eq!(outcome.winner_user_id.as_deref(), Some("ada"));
        assert_eq!(outcome.total_pot, 150);
        assert!(outcome.ranking.is_none());
    }

    #[test]
    fn busted_outcome_burns_the_stake() {
        let meta = solo_meta(100);
        let mut state = rigged();
        state.reveal((GRID_TILES - 1) as u8).unwrap();

        let outcome = RevealEngine::outcome(&state, &meta, "ada");
        assert!(outcome.winner_user_id.is_none());
        assert_eq!(outcome.total_pot, 0);
    }

    #[test]
    fn mine_hit_event_names_the_tile() {
        let meta = solo_meta(50);
        let mut state = rigged();
        let tile = (GRID_TILES - 1) as u8;
        let transition = state.reveal(tile).unwrap();

        let events = RevealEngine::transition_events(&transition, &state, &meta);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "MineHit");
        assert_eq!(events[0].data["tile"], tile);
    }
}
