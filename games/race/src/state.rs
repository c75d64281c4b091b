//! The race board and its rules, free of any I/O.

use room_core::codec::RoomState;
use serde::{Deserialize, Serialize};

/// Track position a piece must reach to finish.
pub const TRACK_LENGTH: u8 = 30;

/// Upper bound on seats the board supports.
pub const MAX_RACERS: usize = 4;

/// Phase of one race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RacePhase {
    /// Seats are filling; seat 0 may start once two racers are present.
    Waiting,
    Racing,
    Finished,
}

/// The authoritative race board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceState {
    pub positions: [u8; MAX_RACERS],
    /// Seats that take part in this race (frozen at start).
    pub racing: [bool; MAX_RACERS],
    pub phase: RacePhase,
    pub current_seat: u8,
    /// Die value waiting to be applied with an advance.
    pub rolled: Option<u8>,
    pub winner_seat: Option<u8>,
    pub seat_count: u8,
}

/// What a successfully applied action did, for event emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceTransition {
    Started,
    Rolled { seat: u8, value: u8 },
    Advanced { seat: u8, from: u8, to: u8, next_seat: Option<u8> },
    Won { seat: u8 },
    TurnSkipped { seat: u8, next_seat: u8 },
}

impl RoomState for RaceState {
    const VERSION: u8 = 1;
}

impl RaceState {
    pub fn new(seat_count: u8) -> Self {
        RaceState {
            positions: [0; MAX_RACERS],
            racing: [false; MAX_RACERS],
            phase: RacePhase::Waiting,
            current_seat: 0,
            rolled: None,
            winner_seat: None,
            seat_count: seat_count.min(MAX_RACERS as u8),
        }
    }

    /// Starts the race over the currently occupied seats.
    pub fn start(&mut self, occupied_seats: &[u8]) -> Result<RaceTransition, &'static str> {
        if self.phase != RacePhase::Waiting {
            return Err("The race already started");
        }
        if occupied_seats.len() < 2 {
            return Err("At least two racers are needed");
        }
        for seat in occupied_seats {
            if (*seat as usize) < MAX_RACERS {
                self.racing[*seat as usize] = true;
            }
        }
        self.phase = RacePhase::Racing;
        self.current_seat = self
            .next_racing_seat_from(0)
            .expect("a started race has racers");
        Ok(RaceTransition::Started)
    }

    /// Applies a die roll for the seat whose turn it is.
    pub fn roll(&mut self, seat: u8, value: u8) -> Result<RaceTransition, &'static str> {
        self.require_turn(seat)?;
        if self.rolled.is_some() {
            return Err("Already rolled, advance your piece");
        }
        if !(1..=6).contains(&value) {
            return Err("Die value out of range");
        }
        self.rolled = Some(value);
        Ok(RaceTransition::Rolled { seat, value })
    }

    /// Moves the current piece by the rolled amount and passes the turn.
    pub fn advance(&mut self, seat: u8) -> Result<RaceTransition, &'static str> {
        self.require_turn(seat)?;
        let Some(steps) = self.rolled.take() else {
            return Err("Roll before advancing");
        };
        let from = self.positions[seat as usize];
        let to = (from + steps).min(TRACK_LENGTH);
        self.positions[seat as usize] = to;

        if to >= TRACK_LENGTH {
            self.phase = RacePhase::Finished;
            self.winner_seat = Some(seat);
            return Ok(RaceTransition::Won { seat });
        }

        let next = self.pass_turn();
        Ok(RaceTransition::Advanced {
            seat,
            from,
            to,
            next_seat: Some(next),
        })
    }

    /// Turn-timeout resolution: an un-applied roll is advanced for the
    /// player, an idle turn is skipped.
    pub fn resolve_timeout(&mut self) -> Result<RaceTransition, &'static str> {
        if self.phase != RacePhase::Racing {
            return Err("No turn to time out");
        }
        let seat = self.current_seat;
        if self.rolled.is_some() {
            return self.advance(seat);
        }
        let next = self.pass_turn();
        Ok(RaceTransition::TurnSkipped { seat, next_seat: next })
    }

    /// Drops a seat from the race (player left mid-game). The race ends
    /// when fewer than two racers remain.
    pub fn retire(&mut self, seat: u8) -> Option<u8> {
        if (seat as usize) < MAX_RACERS {
            self.racing[seat as usize] = false;
        }
        if self.phase == RacePhase::Racing {
            if self.racers().len() < 2 {
                self.phase = RacePhase::Finished;
                self.winner_seat = self.racers().first().copied();
            } else if self.current_seat == seat {
                self.rolled = None;
                return Some(self.pass_turn());
            }
        }
        None
    }

    /// Seats still in the race.
    pub fn racers(&self) -> Vec<u8> {
        (0..MAX_RACERS as u8)
            .filter(|seat| self.racing[*seat as usize])
            .collect()
    }

    /// Seats ranked best-first by distance covered; the winner leads.
    pub fn ranking(&self) -> Vec<u8> {
        let mut seats = self.racers();
        seats.sort_by_key(|seat| {
            let won = Some(*seat) == self.winner_seat;
            (
                std::cmp::Reverse(won as u8),
                std::cmp::Reverse(self.positions[*seat as usize]),
                *seat,
            )
        });
        seats
    }

    /// Actions legal for `seat` right now.
    pub fn legal_actions(&self, seat: u8, occupied: usize) -> Vec<String> {
        match self.phase {
            RacePhase::Waiting if seat == 0 && occupied >= 2 => vec!["start".to_string()],
            RacePhase::Racing if seat == self.current_seat => {
                if self.rolled.is_some() {
                    vec!["advance".to_string()]
                } else {
                    vec!["roll".to_string()]
                }
            }
            _ => Vec::new(),
        }
    }

    fn require_turn(&self, seat: u8) -> Result<(), &'static str> {
        if self.phase != RacePhase::Racing {
            return Err("The race is not running");
        }
        if seat != self.current_seat {
            return Err("Not this seat's turn");
        }
        Ok(())
    }

    fn pass_turn(&mut self) -> u8 {
        self.rolled = None;
        let next = self
            .next_racing_seat_from(self.current_seat + 1)
            .unwrap_or(self.current_seat);
        self.current_seat = next;
        next
    }

    fn next_racing_seat_from(&self, start: u8) -> Option<u8> {
        (0..MAX_RACERS as u8)
            .map(|offset| (start + offset) % MAX_RACERS as u8)
            .find(|seat| self.racing[*seat as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(seats: &[u8]) -> RaceState {
        let mut state = RaceState::new(4);
        state.start(seats).unwrap();
        state
    }

    #[test]
    fn race_needs_two_racers_to_start() {
        let mut state = RaceState::new(4);
        assert!(state.start(&[0]).is_err());
        assert!(state.start(&[0, 2]).is_ok());
        assert_eq!(state.phase, RacePhase::Racing);
        assert_eq!(state.current_seat, 0);
        assert!(state.start(&[0, 2]).is_err()); // no double start
    }

    #[test]
    fn roll_then_advance_moves_the_piece_and_passes_the_turn() {
        let mut state = started(&[0, 1, 2]);
        assert!(state.advance(0).is_err()); // must roll first
        state.roll(0, 4).unwrap();
        assert!(state.roll(0, 2).is_err()); // no double roll
        let transition = state.advance(0).unwrap();
        assert_eq!(
            transition,
            RaceTransition::Advanced {
                seat: 0,
                from: 0,
                to: 4,
                next_seat: Some(1)
            }
        );
        assert_eq!(state.current_seat, 1);
        assert!(state.rolled.is_none());
    }

    #[test]
    fn turn_order_skips_non_racing_seats() {
        let mut state = started(&[0, 2]);
        state.roll(0, 3).unwrap();
        state.advance(0).unwrap();
        // Seat 1 never joined the race.
        assert_eq!(state.current_seat, 2);
        state.roll(2, 5).unwrap();
        state.advance(2).unwrap();
        assert_eq!(state.current_seat, 0);
    }

    #[test]
    fn wrong_seat_cannot_act() {
        let mut state = started(&[0, 1]);
        assert!(state.roll(1, 3).is_err());
    }

    #[test]
    fn reaching_the_finish_wins() {
        let mut state = started(&[0, 1]);
        state.positions[0] = TRACK_LENGTH - 2;
        state.roll(0, 6).unwrap();
        let transition = state.advance(0).unwrap();
        assert_eq!(transition, RaceTransition::Won { seat: 0 });
        assert_eq!(state.phase, RacePhase::Finished);
        assert_eq!(state.winner_seat, Some(0));
        // The piece never overshoots the track.
        assert_eq!(state.positions[0], TRACK_LENGTH);
    }

    #[test]
    fn timeout_skips_an_idle_turn_and_advances_a_rolled_one() {
        let mut state = started(&[0, 1]);
        let transition = state.resolve_timeout().unwrap();
        assert_eq!(
            transition,
            RaceTransition::TurnSkipped {
                seat: 0,
                next_seat: 1
            }
        );

        state.roll(1, 3).unwrap();
        let transition = state.resolve_timeout().unwrap();
        assert_eq!(
            transition,
            RaceTransition::Advanced {
                seat: 1,
                from: 0,
                to: 3,
                next_seat: Some(0)
            }
        );
    }

    #[test]
    fn retiring_down_to_one_racer_ends_the_race() {
        let mut state = started(&[0, 1, 3]);
        assert_eq!(state.retire(1), None);
        assert_eq!(state.phase, RacePhase::Racing);
        state.retire(3);
        assert_eq!(state.phase, RacePhase::Finished);
        assert_eq!(state.winner_seat, Some(0));
    }

    #[test]
    fn retiring_the_current_seat_passes_the_turn() {
        let mut state = started(&[0, 1, 2]);
        let next = state.retire(0);
        assert_eq!(next, Some(1));
        assert_eq!(state.current_seat, 1);
    }

    #[test]
    fn ranking_orders_by_distance_with_winner_first() {
        let mut state = started(&[0, 1, 2, 3]);
        state.positions = [5, 30, 12, 5];
        state.winner_seat = Some(1);
        state.phase = RacePhase::Finished;
        assert_eq!(state.ranking(), vec![1, 2, 0, 3]);
    }

    #[test]
    fn legal_actions_follow_the_phase() {
        let mut state = RaceState::new(4);
        assert_eq!(state.legal_actions(0, 2), vec!["start".to_string()]);
        assert!(state.legal_actions(1, 2).is_empty());
        assert!(state.legal_actions(0, 1).is_empty());

        state.start(&[0, 1]).unwrap();
        assert_eq!(state.legal_actions(0, 2), vec!["roll".to_string()]);
        state.roll(0, 2).unwrap();
        assert_eq!(state.legal_actions(0, 2), vec!["advance".to_string()]);
        assert!(state.legal_actions(1, 2).is_empty());
    }

    #[test]
    fn state_survives_the_codec_round_trip() {
        let mut state = started(&[0, 1]);
        state.roll(0, 6).unwrap();
        let blob = room_core::codec::encode_state(&state).unwrap();
        let back: RaceState =
            room_core::codec::decode_state(&blob, &room_core::codec::MigrationRegistry::new())
                .unwrap();
        assert_eq!(back, state);
    }
}
