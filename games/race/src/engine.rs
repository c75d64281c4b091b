//! The race engine: loads the board under the caller-held room lock,
//! applies one command, saves, and reports events for fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use room_core::error::{CoreError, CoreResult};
use room_core::module::{
    ActionResult, GameCommand, GameEngine, GameEvent, GameOutcome, RoomMeta, StateResponse,
    TurnBased,
};
use room_core::store::RoomStore;
use serde_json::json;

use crate::GAME_TYPE;
use crate::state::{RacePhase, RaceState, RaceTransition, TRACK_LENGTH};

/// Seconds a racer may sit on their turn.
const DEFAULT_TURN_TIMEOUT_SECS: u64 = 30;

pub struct RaceEngine {
    store: Arc<RoomStore>,
    turn_timeout_secs: u64,
}

impl RaceEngine {
    pub fn new(store: Arc<RoomStore>) -> Self {
        RaceEngine {
            store,
            turn_timeout_secs: DEFAULT_TURN_TIMEOUT_SECS,
        }
    }

    /// Public snapshot of the board.
    fn view(state: &RaceState, meta: &RoomMeta) -> serde_json::Value {
        let seats: Vec<serde_json::Value> = meta
            .users_by_seat()
            .into_iter()
            .map(|(seat, user)| {
                json!({
                    "seat": seat,
                    "user_id": user,
                    "position": state.positions[seat as usize],
                    "racing": state.racing[seat as usize],
                })
            })
            .collect();
        json!({
            "track_length": TRACK_LENGTH,
            "phase": state.phase,
            "current_seat": state.current_seat,
            "rolled": state.rolled,
            "winner_seat": state.winner_seat,
            "seats": seats,
        })
    }

    fn user_of_seat(meta: &RoomMeta, seat: u8) -> Option<String> {
        meta.seats
            .iter()
            .find(|(_, taken)| **taken == seat)
            .map(|(user, _)| user.clone())
    }

    /// Drops racers whose user is no longer seated. Returns the events the
    /// departures produced.
    fn reconcile_departures(state: &mut RaceState, meta: &RoomMeta) -> Vec<GameEvent> {
        let mut events = Vec::new();
        for seat in state.racers() {
            if Self::user_of_seat(meta, seat).is_none() {
                state.retire(seat);
                events.push(GameEvent::new("RacerRetired", json!({ "seat": seat })));
            }
        }
        events
    }

    fn transition_events(transition: &RaceTransition, meta: &RoomMeta) -> Vec<GameEvent> {
        match transition {
            RaceTransition::Started => vec![GameEvent::new("GameStarted", json!({}))],
            RaceTransition::Rolled { seat, value } => vec![GameEvent::new(
                "DiceRolled",
                json!({ "seat": seat, "value": value }),
            )],
            RaceTransition::Advanced {
                seat,
                from,
                to,
                next_seat,
            } => {
                let mut events = vec![GameEvent::new(
                    "PieceMoved",
                    json!({ "seat": seat, "from": from, "to": to }),
                )];
                if let Some(next) = next_seat {
                    events.push(GameEvent::new("TurnStarted", json!({ "seat": next })));
                }
                events
            }
            RaceTransition::Won { seat } => vec![GameEvent::new(
                "GameWon",
                json!({
                    "seat": seat,
                    "user_id": Self::user_of_seat(meta, *seat),
                }),
            )],
            RaceTransition::TurnSkipped { seat, next_seat } => vec![
                GameEvent::new("TurnSkipped", json!({ "seat": seat })),
                GameEvent::new("TurnStarted", json!({ "seat": next_seat })),
            ],
        }
    }

    fn outcome(state: &RaceState, meta: &RoomMeta) -> GameOutcome {
        let ranking: Vec<String> = state
            .ranking()
            .into_iter()
            .filter_map(|seat| Self::user_of_seat(meta, seat))
            .collect();
        GameOutcome {
            winner_user_id: state
                .winner_seat
                .and_then(|seat| Self::user_of_seat(meta, seat)),
            ranking: (ranking.len() >= 2).then_some(ranking),
            final_state: Self::view(state, meta),
            total_pot: meta.total_pot(),
        }
    }

    /// Stamps the turn clock after a successful transition.
    fn stamp_turn(state: &RaceState, meta: &mut RoomMeta) {
        meta.turn_started_at = match state.phase {
            RacePhase::Racing => Some(Utc::now()),
            _ => None,
        };
    }

    fn finish_result(
        state: &RaceState,
        meta: &RoomMeta,
        mut events: Vec<GameEvent>,
        transition_events: Vec<GameEvent>,
    ) -> ActionResult {
        events.extend(transition_events);
        let mut result = ActionResult::ok(Self::view(state, meta));
        result.events = events;
        if state.phase == RacePhase::Finished {
            result = result.ended(Self::outcome(state, meta));
        }
        result
    }
}

#[async_trait]
impl GameEngine for RaceEngine {
    fn game_type(&self) -> &str {
        GAME_TYPE
    }

    async fn execute(&self, room_id: &str, command: GameCommand) -> CoreResult<ActionResult> {
        let Some((mut state, mut meta)) = self.store.load::<RaceState>(GAME_TYPE, room_id).await?
        else {
            return Err(CoreError::RoomNotFound);
        };
        let Some(seat) = meta.seat_of(&command.user_id) else {
            return Err(CoreError::NotInRoom);
        };

        let departure_events = Self::reconcile_departures(&mut state, &meta);
        if state.phase == RacePhase::Finished && !departure_events.is_empty() {
            // Departures alone decided the race; the action itself is moot.
            Self::stamp_turn(&state, &mut meta);
            self.store.save(GAME_TYPE, room_id, &state, &meta).await?;
            return Ok(Self::finish_result(&state, &meta, departure_events, Vec::new()));
        }

        let transition = match command.action.as_str() {
            "start" => {
                let occupied: Vec<u8> = meta.seats.values().copied().collect();
                if seat != 0 {
                    Err("Only the room creator can start the race")
                } else {
                    state.start(&occupied)
                }
            }
            "roll" => {
                let value = rand::rng().random_range(1..=6);
                state.roll(seat, value)
            }
            "advance" => state.advance(seat),
            other => return Err(CoreError::UnknownAction(other.to_string())),
        };

        let transition = match transition {
            Ok(transition) => transition,
            Err(reason) => return Ok(ActionResult::error(reason)),
        };

        Self::stamp_turn(&state, &mut meta);
        self.store.save(GAME_TYPE, room_id, &state, &meta).await?;

        Ok(Self::finish_result(
            &state,
            &meta,
            departure_events,
            Self::transition_events(&transition, &meta),
        ))
    }

    async fn legal_actions(&self, room_id: &str, user_id: &str) -> CoreResult<Vec<String>> {
        let Some((mut state, meta)) = self.store.load::<RaceState>(GAME_TYPE, room_id).await?
        else {
            return Err(CoreError::RoomNotFound);
        };
        Self::reconcile_departures(&mut state, &meta);
        let Some(seat) = meta.seat_of(user_id) else {
            return Ok(Vec::new());
        };
        Ok(state.legal_actions(seat, meta.seats.len()))
    }

    async fn state(&self, room_id: &str) -> CoreResult<Option<StateResponse>> {
        let Some((state, meta)) = self.store.load::<RaceState>(GAME_TYPE, room_id).await? else {
            return Ok(None);
        };
        let legal_seat = match state.phase {
            RacePhase::Waiting => 0,
            _ => state.current_seat,
        };
        Ok(Some(StateResponse {
            room_id: room_id.to_string(),
            game_type: GAME_TYPE.to_string(),
            legal_moves: state.legal_actions(legal_seat, meta.seats.len()),
            state: Self::view(&state, &meta),
            meta,
        }))
    }

    async fn states(&self, room_ids: &[String]) -> CoreResult<Vec<StateResponse>> {
        let rooms = self.store.load_many::<RaceState>(GAME_TYPE, room_ids).await?;
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

    fn turn_based(&self) -> Option<&dyn TurnBased> {
        Some(self)
    }
}

#[async_trait]
impl TurnBased for RaceEngine {
    fn turn_timeout_secs(&self) -> u64 {
        self.turn_timeout_secs
    }

    async fn check_timeouts(&self, room_id: &str) -> CoreResult<Option<ActionResult>> {
        let Some((mut state, mut meta)) = self.store.load::<RaceState>(GAME_TYPE, room_id).await?
        else {
            return Ok(None);
        };
        if state.phase != RacePhase::Racing {
            return Ok(None);
        }
        let Some(turn_started_at) = meta.turn_started_at else {
            return Ok(None);
        };
        let deadline = turn_started_at + chrono::Duration::seconds(self.turn_timeout_secs as i64);
        let departure_events = Self::reconcile_departures(&mut state, &meta);

        if state.phase == RacePhase::Racing && Utc::now() < deadline {
            if departure_events.is_empty() {
                // The turn already advanced under us; nothing to do.
                return Ok(None);
            }
            // Departures alone changed the board; persist and report them.
            Self::stamp_turn(&state, &mut meta);
            self.store.save(GAME_TYPE, room_id, &state, &meta).await?;
            return Ok(Some(Self::finish_result(
                &state,
                &meta,
                departure_events,
                Vec::new(),
            )));
        }

        let timeout_events = if state.phase == RacePhase::Racing {
            let seat = state.current_seat;
            let transition = match state.resolve_timeout() {
                Ok(transition) => transition,
                Err(_) => return Ok(None),
            };
            let mut events = vec![GameEvent::new("TurnTimeout", json!({ "seat": seat }))];
            events.extend(Self::transition_events(&transition, &meta));
            events
        } else {
            Vec::new()
        };

        Self::stamp_turn(&state, &mut meta);
        self.store.save(GAME_TYPE, room_id, &state, &meta).await?;
        Ok(Some(Self::finish_result(
            &state,
            &meta,
            departure_events,
            timeout_events,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with(users: &[&str]) -> RoomMeta {
        let mut meta = RoomMeta::new(GAME_TYPE, 4);
        meta.entry_fee = 100;
        for (seat, user) in users.iter().enumerate() {
            meta.seats.insert(user.to_string(), seat as u8);
        }
        meta
    }

    #[test]
    fn view_lists_seats_in_order() {
        let meta = meta_with(&["alice", "bob"]);
        let mut state = RaceState::new(4);
        state.start(&[0, 1]).unwrap();
        state.positions[1] = 7;

        let view = RaceEngine::view(&state, &meta);
        assert_eq!(view["track_length"], TRACK_LENGTH);
        assert_eq!(view["seats"][0]["user_id"], "alice");
        assert_eq!(view["seats"][1]["user_id"], "bob");
        assert_eq!(view["seats"][1]["position"], 7);
    }

    #[test]
    fn outcome_maps_seats_to_users() {
        let meta = meta_with(&["alice", "bob", "carol"]);
        let mut state = RaceState::new(4);
        state.start(&[0, 1, 2]).unwrap();
        state.positions = [12, 30, 3, 0];
        state.winner_seat = Some(1);
        state.phase = RacePhase::Finished;

        let outcome = RaceEngine::outcome(&state, &meta);
        assert_eq!(outcome.winner_user_id.as_deref(), Some("bob"));
        assert_eq!(
            outcome.ranking,
            Some(vec![
                "bob".to_string(),
                "alice".to_string(),
                "carol".to_string()
            ])
        );
        assert_eq!(outcome.total_pot, 300);
    }

    #[test]
    fn departed_racers_are_reconciled_out() {
        let meta = meta_with(&["alice"]);
        let mut state = RaceState::new(4);
        state.start(&[0, 1]).unwrap();

        // Seat 1 has no user in meta anymore.
        let events = RaceEngine::reconcile_departures(&mut state, &meta);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "RacerRetired");
        // With one racer left the race is decided by forfeit.
        assert_eq!(state.phase, RacePhase::Finished);
        assert_eq!(state.winner_seat, Some(0));
    }

    #[test]
    fn won_transition_carries_the_winning_user() {
        let meta = meta_with(&["alice", "bob"]);
        let events =
            RaceEngine::transition_events(&RaceTransition::Won { seat: 1 }, &meta);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "GameWon");
        assert_eq!(events[0].data["user_id"], "bob");
    }

    #[test]
    fn skip_transition_emits_timeout_pair() {
        let meta = meta_with(&["alice", "bob"]);
        let events = RaceEngine::transition_events(
            &RaceTransition::TurnSkipped {
                seat: 0,
                next_seat: 1,
            },
            &meta,
        );
        let names: Vec<&str> = events.iter().map(|event| event.name.as_str()).collect();
        assert_eq!(names, vec!["TurnSkipped", "TurnStarted"]);
    }

    #[test]
    fn stamp_turn_clears_the_clock_when_finished() {
        let meta = &mut meta_with(&["alice", "bob"]);
        let mut state = RaceState::new(4);
        state.start(&[0, 1]).unwrap();

        RaceEngine::stamp_turn(&state, meta);
        assert!(meta.turn_started_at.is_some());

        state.phase = RacePhase::Finished;
        RaceEngine::stamp_turn(&state, meta);
        assert!(meta.turn_started_at.is_none());
    }
}
