//! The contract a game module satisfies to embed into the room runtime.
//!
//! A module registers exactly one [`GameEngine`] and one [`RoomService`] for
//! its game type. The runtime owns locking, persistence plumbing, timeout
//! driving and fan-out; the engine owns nothing but rules. Engines with a
//! turn concept additionally expose [`TurnBased`]; single-player reveal
//! games simply don't.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// Room visibility in lobby listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoomVisibility {
    #[default]
    Public,
    Private,
}

/// Metadata record stored next to every room state.
///
/// The seat map is an injection into `0..max_seats`; the game type never
/// changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMeta {
    pub game_type: String,
    /// userId -> seat index.
    pub seats: HashMap<String, u8>,
    pub max_seats: u8,
    pub visibility: RoomVisibility,
    pub entry_fee: i64,
    /// Module-interpreted settings (board size, speed, ...).
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Start of the turn currently awaiting input, if any.
    pub turn_started_at: Option<DateTime<Utc>>,
    /// userId -> instant their reconnect grace expires.
    #[serde(default)]
    pub disconnect_grace: HashMap<String, DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RoomMeta {
    pub fn new(game_type: impl Into<String>, max_seats: u8) -> Self {
        RoomMeta {
            game_type: game_type.into(),
            seats: HashMap::new(),
            max_seats,
            visibility: RoomVisibility::Public,
            entry_fee: 0,
            config: HashMap::new(),
            turn_started_at: None,
            disconnect_grace: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn seat_of(&self, user_id: &str) -> Option<u8> {
        self.seats.get(user_id).copied()
    }

    /// Lowest seat index not yet taken, if the room has space.
    pub fn lowest_free_seat(&self) -> Option<u8> {
        (0..self.max_seats).find(|seat| !self.seats.values().any(|taken| taken == seat))
    }

    pub fn is_full(&self) -> bool {
        self.seats.len() >= self.max_seats as usize
    }

    /// Users ordered by their seat index.
    pub fn users_by_seat(&self) -> Vec<(u8, String)> {
        let mut users: Vec<(u8, String)> = self
            .seats
            .iter()
            .map(|(user, seat)| (*seat, user.clone()))
            .collect();
        users.sort_unstable_by_key(|(seat, _)| *seat);
        users
    }

    /// Entry fees collected from every occupied seat.
    pub fn total_pot(&self) -> i64 {
        self.entry_fee * self.seats.len() as i64
    }
}

/// A player command as the hub hands it to an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameCommand {
    pub user_id: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

/// A typed event an engine emits for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEvent {
    pub name: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl GameEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        GameEvent {
            name: name.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Terminal outcome an engine reports when a game ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameOutcome {
    pub winner_user_id: Option<String>,
    /// Best-to-worst user ids; drives ranked payouts when present.
    pub ranking: Option<Vec<String>>,
    pub final_state: Value,
    pub total_pot: i64,
}

/// Result of one engine execution.
#[derive(Debug, Clone, Default)]
pub struct ActionResult {
    pub success: bool,
    pub error_message: Option<String>,
    pub new_state: Option<Value>,
    pub events: Vec<GameEvent>,
    pub game_ended: Option<GameOutcome>,
}

impl ActionResult {
    pub fn ok(new_state: Value) -> Self {
        ActionResult {
            success: true,
            new_state: Some(new_state),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ActionResult {
            success: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_event(mut self, event: GameEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn ended(mut self, outcome: GameOutcome) -> Self {
        self.game_ended = Some(outcome);
        self
    }
}

/// Full room snapshot for one client or an admin view.
#[derive(Debug, Clone, Serialize)]
pub struct StateResponse {
    pub room_id: String,
    pub game_type: String,
    pub meta: RoomMeta,
    pub state: Value,
    pub legal_moves: Vec<String>,
}

/// A rule engine. One singleton per game type; all hub-driven actions go
/// through [`execute`](GameEngine::execute), which loads and saves under the
/// room lock held by the caller.
#[async_trait]
pub trait GameEngine: Send + Sync {
    fn game_type(&self) -> &str;

    async fn execute(&self, room_id: &str, command: GameCommand) -> CoreResult<ActionResult>;

    /// Actions currently legal for `user_id` (empty when it is not their
    /// turn or they are not seated).
    async fn legal_actions(&self, room_id: &str, user_id: &str) -> CoreResult<Vec<String>>;

    async fn state(&self, room_id: &str) -> CoreResult<Option<StateResponse>>;

    /// Batched snapshot for admin/lobby views; missing rooms are omitted.
    async fn states(&self, room_ids: &[String]) -> CoreResult<Vec<StateResponse>>;

    /// Batched meta lookup; missing rooms are omitted.
    async fn metas(&self, room_ids: &[String]) -> CoreResult<Vec<(String, RoomMeta)>>;

    /// Present only for engines with a turn concept.
    fn turn_based(&self) -> Option<&dyn TurnBased> {
        None
    }
}

/// Optional timeout surface of an engine.
#[async_trait]
pub trait TurnBased: Send + Sync {
    /// Seconds a seat may sit on its turn before the scheduler intervenes.
    fn turn_timeout_secs(&self) -> u64;

    /// Invoked by the scheduler under the room lock once the due instant
    /// passed. `None` means the engine declined to act (e.g. the turn
    /// already advanced); the scheduler then drops the stale due entry and
    /// nothing else happens.
    async fn check_timeouts(&self, room_id: &str) -> CoreResult<Option<ActionResult>>;
}

/// Successful join outcome; failures travel as [`CoreError`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub seat: u8,
}

/// Room lifecycle operations of a module.
#[async_trait]
pub trait RoomService: Send + Sync {
    /// Creates a room from prepared meta and returns the new room id.
    async fn create_room(&self, meta: RoomMeta) -> CoreResult<String>;

    /// Seats `user_id` on the lowest free seat. Reserves the entry fee
    /// before the seat becomes visible and refunds it if the seat write
    /// fails.
    async fn join_room(&self, room_id: &str, user_id: &str) -> CoreResult<JoinOutcome>;

    async fn leave_room(&self, room_id: &str, user_id: &str) -> CoreResult<()>;

    async fn room_meta(&self, room_id: &str) -> CoreResult<Option<RoomMeta>>;

    async fn delete_room(&self, room_id: &str) -> CoreResult<()>;
}

/// One registered game module.
#[derive(Clone)]
pub struct GameModule {
    pub game_type: String,
    pub engine: Arc<dyn GameEngine>,
    pub service: Arc<dyn RoomService>,
}

/// Registration table keyed by game type. Built once at process init;
/// replaces any runtime discovery.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, GameModule>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: GameModule) {
        self.modules.insert(module.game_type.clone(), module);
    }

    pub fn get(&self, game_type: &str) -> CoreResult<&GameModule> {
        self.modules
            .get(game_type)
            .ok_or_else(|| CoreError::UnknownGameType(game_type.to_string()))
    }

    pub fn engine(&self, game_type: &str) -> CoreResult<Arc<dyn GameEngine>> {
        Ok(self.get(game_type)?.engine.clone())
    }

    pub fn service(&self, game_type: &str) -> CoreResult<Arc<dyn RoomService>> {
        Ok(self.get(game_type)?.service.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &GameModule> {
        self.modules.values()
    }

    /// Game types whose engine exposes the timeout surface.
    pub fn turn_based_types(&self) -> Vec<String> {
        self.modules
            .values()
            .filter(|module| module.engine.turn_based().is_some())
            .map(|module| module.game_type.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_seat_skips_taken_seats() {
        let mut meta = RoomMeta::new("race", 4);
        assert_eq!(meta.lowest_free_seat(), Some(0));
        meta.seats.insert("a".into(), 0);
        meta.seats.insert("c".into(), 2);
        assert_eq!(meta.lowest_free_seat(), Some(1));
        meta.seats.insert("b".into(), 1);
        meta.seats.insert("d".into(), 3);
        assert_eq!(meta.lowest_free_seat(), None);
        assert!(meta.is_full());
    }

    #[test]
    fn users_by_seat_is_ordered() {
        let mut meta = RoomMeta::new("race", 4);
        meta.seats.insert("second".into(), 1);
        meta.seats.insert("first".into(), 0);
        let ordered = meta.users_by_seat();
        assert_eq!(ordered[0], (0, "first".to_string()));
        assert_eq!(ordered[1], (1, "second".to_string()));
    }

    #[test]
    fn pot_tracks_occupied_seats() {
        let mut meta = RoomMeta::new("race", 4);
        meta.entry_fee = 100;
        meta.seats.insert("a".into(), 0);
        meta.seats.insert("b".into(), 1);
        assert_eq!(meta.total_pot(), 200);
    }

    #[test]
    fn meta_round_trips_through_json() {
        let mut meta = RoomMeta::new("reveal", 1);
        meta.entry_fee = 50;
        meta.config
            .insert("grid".into(), serde_json::json!({"size": 5}));
        let text = serde_json::to_string(&meta).unwrap();
        let back: RoomMeta = serde_json::from_str(&text).unwrap();
        assert_eq!(back.game_type, "reveal");
        assert_eq!(back.entry_fee, 50);
        assert_eq!(back.config["grid"]["size"], 5);
    }

    #[test]
    fn registry_reports_unknown_game_type() {
        let registry = ModuleRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(CoreError::UnknownGameType(_))
        ));
    }
}
