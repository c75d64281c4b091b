//! Error taxonomy of the room runtime.
//!
//! Player-facing variants carry the exact message the hub relays to the
//! acting connection; infrastructure variants wrap the underlying driver
//! error and are logged rather than shown.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    // Surfaced to the acting client.
    #[error("You are not in this room")]
    NotInRoom,
    #[error("You are already in a room")]
    AlreadyInRoom,
    #[error("It is not your turn")]
    NotYourTurn,
    #[error("Room is full")]
    RoomFull,
    #[error("Room not found")]
    RoomNotFound,
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Illegal move: {0}")]
    IllegalMove(String),
    #[error("Unknown game type: {0}")]
    UnknownGameType(String),
    #[error("Unknown room template: {0}")]
    UnknownTemplate(String),

    // Economy; retry is the caller's choice.
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Duplicate transaction")]
    DuplicateTransaction,
    #[error("Concurrent update conflict")]
    ConcurrencyConflict,

    // Transient runtime conditions.
    #[error("System overloaded")]
    SystemOverloaded,
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Room is busy, try again")]
    LockContention,
    #[error("Shutting down")]
    ShuttingDown,

    /// A stored state blob did not match any known layout. The room load
    /// reports the room as absent so the caller can decide to recreate.
    #[error("stored state for {type_name} is corrupted or incompatible (version {version}, {size} bytes)")]
    StateCorrupted {
        type_name: &'static str,
        version: u8,
        size: u32,
    },

    #[error("invalid input: {0}")]
    Validation(#[from] protocol::validate::ValidateError),

    // Infrastructure.
    #[error("key-value store error: {0}")]
    Kv(#[from] redis::RedisError),
    #[error("key-value pool error: {0}")]
    KvPool(#[from] deadpool_redis::PoolError),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("state encoding error: {0}")]
    Codec(#[from] postcard::Error),
    #[error("meta document error: {0}")]
    Meta(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// True for errors a client is expected to handle itself; these are
    /// relayed verbatim and never logged as server faults.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            CoreError::NotInRoom
                | CoreError::AlreadyInRoom
                | CoreError::NotYourTurn
                | CoreError::RoomFull
                | CoreError::RoomNotFound
                | CoreError::UnknownAction(_)
                | CoreError::IllegalMove(_)
                | CoreError::UnknownGameType(_)
                | CoreError::UnknownTemplate(_)
                | CoreError::InsufficientFunds
                | CoreError::DuplicateTransaction
                | CoreError::RateLimited
                | CoreError::Validation(_)
        )
    }

    /// Transient errors worth an automatic retry by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::LockContention | CoreError::SystemOverloaded | CoreError::ConcurrencyConflict
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_fault_classification() {
        assert!(CoreError::RoomFull.is_client_fault());
        assert!(CoreError::InsufficientFunds.is_client_fault());
        assert!(!CoreError::LockContention.is_client_fault());
        assert!(!CoreError::ShuttingDown.is_client_fault());
    }

    #[test]
    fn transient_classification() {
        assert!(CoreError::LockContention.is_transient());
        assert!(CoreError::ConcurrencyConflict.is_transient());
        assert!(!CoreError::RoomNotFound.is_transient());
    }

    #[test]
    fn corruption_error_names_the_triple() {
        let err = CoreError::StateCorrupted {
            type_name: "RaceState",
            version: 3,
            size: 64,
        };
        let text = err.to_string();
        assert!(text.contains("RaceState"));
        assert!(text.contains("version 3"));
        assert!(text.contains("64 bytes"));
    }
}
