//! The reveal grid and its rules, free of any I/O.

use rand::Rng;
use rand::seq::SliceRandom;
use room_core::codec::RoomState;
use serde::{Deserialize, Serialize};

/// Tiles on the grid.
pub const GRID_TILES: usize = 25;

/// Mines hidden among them.
pub const MINE_COUNT: usize = 5;

/// Prize growth per safe tile, in percent of the stake.
pub const STEP_PERCENT: i64 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevealPhase {
    Playing,
    Busted,
    CashedOut,
}

/// What one applied action did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevealTransition {
    Safe { tile: u8, revealed_count: u8 },
    Mine { tile: u8 },
    CashedOut { revealed_count: u8 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevealState {
    pub mines: [bool; GRID_TILES],
    pub revealed: [bool; GRID_TILES],
    pub phase: RevealPhase,
}

impl RoomState for RevealState {
    const VERSION: u8 = 1;
}

impl RevealState {
    /// Fresh grid with [`MINE_COUNT`] mines in random tiles.
    pub fn with_random_mines<R: Rng>(rng: &mut R) -> Self {
        let mut tiles: Vec<usize> = (0..GRID_TILES).collect();
        tiles.shuffle(rng);
        let mut mines = [false; GRID_TILES];
        for tile in tiles.into_iter().take(MINE_COUNT) {
            mines[tile] = true;
        }
        RevealState {
            mines,
            revealed: [false; GRID_TILES],
            phase: RevealPhase::Playing,
        }
    }

    pub fn revealed_count(&self) -> u8 {
        self.revealed.iter().filter(|tile| **tile).count() as u8
    }

    /// Uncovers one tile.
    pub fn reveal(&mut self, tile: u8) -> Result<RevealTransition, &'static str> {
        if self.phase != RevealPhase::Playing {
            return Err("The round is over");
        }
        let index = tile as usize;
        if index >= GRID_TILES {
            return Err("Tile out of range");
        }
        if self.revealed[index] {
            return Err("Tile already revealed");
        }
        self.revealed[index] = true;
        if self.mines[index] {
            self.phase = RevealPhase::Busted;
            return Ok(RevealTransition::Mine { tile });
        }
        Ok(RevealTransition::Safe {
            tile,
            revealed_count: self.revealed_count(),
        })
    }

    /// Banks the current prize. Needs at least one safe tile uncovered.
    pub fn cash_out(&mut self) -> Result<RevealTransition, &'static str> {
        if self.phase != RevealPhase::Playing {
            return Err("The round is over");
        }
        let revealed_count = self.revealed_count();
        if revealed_count == 0 {
            return Err("Reveal a tile before cashing out");
        }
        self.phase = RevealPhase::CashedOut;
        Ok(RevealTransition::CashedOut { revealed_count })
    }

    /// Prize for a stake of `entry_fee` at the current progress.
    pub fn prize(&self, entry_fee: i64) -> i64 {
        entry_fee + entry_fee * STEP_PERCENT * self.revealed_count() as i64 / 100
    }

    pub fn legal_actions(&self) -> Vec<String> {
        match self.phase {
            RevealPhase::Playing if self.revealed_count() > 0 => {
                vec!["reveal".to_string(), "cash_out".to_string()]
            }
            RevealPhase::Playing => vec!["reveal".to_string()],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A grid with mines on the last [`MINE_COUNT`] tiles.
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
    fn random_grid_has_exactly_the_mine_count() {
        let state = RevealState::with_random_mines(&mut rand::rng());
        assert_eq!(state.mines.iter().filter(|mine| **mine).count(), MINE_COUNT);
        assert_eq!(state.revealed_count(), 0);
        assert_eq!(state.phase, RevealPhase::Playing);
    }

    #[test]
    fn safe_reveals_accumulate() {
        let mut state = rigged();
        assert_eq!(
            state.reveal(0).unwrap(),
            RevealTransition::Safe {
                tile: 0,
                revealed_count: 1
            }
        );
        assert_eq!(
            state.reveal(1).unwrap(),
            RevealTransition::Safe {
                tile: 1,
                revealed_count: 2
            }
        );
        assert!(state.reveal(1).is_err()); // no double reveal
        assert!(state.reveal(99).is_err()); // out of range
    }

    #[test]
    fn hitting_a_mine_busts_the_round() {
        let mut state = rigged();
        let mine_tile = (GRID_TILES - 1) as u8;
        assert_eq!(
            state.reveal(mine_tile).unwrap(),
            RevealTransition::Mine { tile: mine_tile }
        );
        assert_eq!(state.phase, RevealPhase::Busted);
        assert!(state.reveal(0).is_err());
        assert!(state.cash_out().is_err());
    }

    #[test]
    fn cash_out_needs_progress_and_ends_the_round() {
        let mut state = rigged();
        assert!(state.cash_out().is_err());
        state.reveal(0).unwrap();
        assert_eq!(
            state.cash_out().unwrap(),
            RevealTransition::CashedOut { revealed_count: 1 }
        );
        assert_eq!(state.phase, RevealPhase::CashedOut);
    }

    #[test]
    fn prize_grows_per_safe_tile() {
        let mut state = rigged();
        assert_eq!(state.prize(100), 100);
        state.reveal(0).unwrap();
        assert_eq!(state.prize(100), 125);
        state.reveal(1).unwrap();
        state.reveal(2).unwrap();
        assert_eq!(state.prize(100), 175);
    }

    #[test]
    fn legal_actions_follow_the_phase() {
        let mut state = rigged();
        assert_eq!(state.legal_actions(), vec!["reveal".to_string()]);
        state.reveal(0).unwrap();
        assert_eq!(
            state.legal_actions(),
            vec!["reveal".to_string(), "cash_out".to_string()]
        );
        state.cash_out().unwrap();
        assert!(state.legal_actions().is_empty());
    }

    #[test]
    fn state_survives_the_codec_round_trip() {
        let mut state = rigged();
        state.reveal(3).unwrap();
        let blob = room_core::codec::encode_state(&state).unwrap();
        let back: RevealState =
            room_core::codec::decode_state(&blob, &room_core::codec::MigrationRegistry::new())
                .unwrap();
        assert_eq!(back, state);
    }
}
