//! Input validation applied before any state mutation.
//!
//! Every rule rejects early with a [`ValidateError`] naming the offending
//! field; nothing downstream of the hub ever sees an unvalidated value.

use thiserror::Error;

/// Maximum length of a room id.
pub const MAX_ROOM_ID_LEN: usize = 50;
/// Maximum length of a game type name.
pub const MAX_GAME_TYPE_LEN: usize = 50;
/// Maximum length of a room template name.
pub const MAX_TEMPLATE_NAME_LEN: usize = 100;
/// Maximum length of an idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 64;
/// Maximum length of a ledger reference id.
pub const MAX_REFERENCE_ID_LEN: usize = 100;
/// Maximum absolute coin amount accepted anywhere.
pub const MAX_COIN_AMOUNT: i64 = 1_000_000_000_000;
/// Maximum length of a serialized room config document.
pub const MAX_CONFIG_JSON_LEN: usize = 4096;
/// Maximum length of a chat message.
pub const MAX_CHAT_LEN: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidateError {
    #[error("{field} is empty")]
    Empty { field: &'static str },
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("{field} contains an illegal character")]
    IllegalCharacter { field: &'static str },
    #[error("coin amount out of range")]
    AmountOutOfRange,
    #[error("config document is not valid JSON")]
    MalformedJson,
}

type Result = std::result::Result<(), ValidateError>;

fn non_empty(field: &'static str, value: &str) -> Result {
    if value.is_empty() {
        return Err(ValidateError::Empty { field });
    }
    Ok(())
}

fn max_len(field: &'static str, value: &str, max: usize) -> Result {
    if value.len() > max {
        return Err(ValidateError::TooLong { field, max });
    }
    Ok(())
}

/// Room ids are lower/upper hex, at most 50 characters.
pub fn room_id(value: &str) -> Result {
    non_empty("room_id", value)?;
    max_len("room_id", value, MAX_ROOM_ID_LEN)?;
    if !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ValidateError::IllegalCharacter { field: "room_id" });
    }
    Ok(())
}

/// Game type names are alphanumeric, at most 50 characters.
pub fn game_type(value: &str) -> Result {
    non_empty("game_type", value)?;
    max_len("game_type", value, MAX_GAME_TYPE_LEN)?;
    if !value.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(ValidateError::IllegalCharacter { field: "game_type" });
    }
    Ok(())
}

/// Template names allow word characters plus `_()-.,` and spaces.
pub fn template_name(value: &str) -> Result {
    non_empty("template_name", value)?;
    max_len("template_name", value, MAX_TEMPLATE_NAME_LEN)?;
    let ok = value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b" _()-.,".contains(&b));
    if !ok {
        return Err(ValidateError::IllegalCharacter { field: "template_name" });
    }
    Ok(())
}

/// Idempotency keys allow word characters plus `_-`.
pub fn idempotency_key(value: &str) -> Result {
    non_empty("idempotency_key", value)?;
    max_len("idempotency_key", value, MAX_IDEMPOTENCY_KEY_LEN)?;
    let ok = value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if !ok {
        return Err(ValidateError::IllegalCharacter { field: "idempotency_key" });
    }
    Ok(())
}

/// Reference ids additionally allow `:` (used by compound keys such as
/// `win:<roomId>:<userId>`).
pub fn reference_id(value: &str) -> Result {
    non_empty("reference_id", value)?;
    max_len("reference_id", value, MAX_REFERENCE_ID_LEN)?;
    let ok = value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b':');
    if !ok {
        return Err(ValidateError::IllegalCharacter { field: "reference_id" });
    }
    Ok(())
}

/// Coin amounts are bounded to |v| <= 10^12.
pub fn coin_amount(value: i64) -> Result {
    if value.abs() > MAX_COIN_AMOUNT {
        return Err(ValidateError::AmountOutOfRange);
    }
    Ok(())
}

/// Config documents must be well-formed JSON and at most 4096 bytes.
pub fn config_json(value: &str) -> Result {
    max_len("config_json", value, MAX_CONFIG_JSON_LEN)?;
    if serde_json::from_str::<serde_json::Value>(value).is_err() {
        return Err(ValidateError::MalformedJson);
    }
    Ok(())
}

/// Chat messages are plain text with a bounded length.
pub fn chat_message(value: &str) -> Result {
    non_empty("message", value)?;
    max_len("message", value, MAX_CHAT_LEN)?;
    Ok(())
}

/// A room reference from the client is either a room id or a short code.
pub fn room_reference(value: &str) -> Result {
    if crate::is_short_code(value) {
        return Ok(());
    }
    room_id(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_accepts_hex_only() {
        assert!(room_id("0123456789abcdefABCDEF").is_ok());
        assert!(room_id("").is_err());
        assert!(room_id("xyz").is_err());
        assert!(room_id(&"a".repeat(51)).is_err());
        assert!(room_id(&"a".repeat(50)).is_ok());
    }

    #[test]
    fn game_type_is_alphanumeric() {
        assert!(game_type("race4").is_ok());
        assert!(game_type("race-4").is_err());
        assert!(game_type(&"r".repeat(51)).is_err());
    }

    #[test]
    fn template_name_charset() {
        assert!(template_name("Quick Race (4p) - v1.2, beta_").is_ok());
        assert!(template_name("nope;drop").is_err());
        assert!(template_name(&"t".repeat(101)).is_err());
    }

    #[test]
    fn idempotency_and_reference_keys() {
        assert!(idempotency_key("res_abc-123").is_ok());
        assert!(idempotency_key("res:abc").is_err());
        assert!(reference_id("win:room1:user2").is_ok());
        assert!(reference_id("win room").is_err());
        assert!(reference_id(&"r".repeat(101)).is_err());
    }

    #[test]
    fn coin_amount_bounds() {
        assert!(coin_amount(MAX_COIN_AMOUNT).is_ok());
        assert!(coin_amount(-MAX_COIN_AMOUNT).is_ok());
        assert!(coin_amount(MAX_COIN_AMOUNT + 1).is_err());
    }

    #[test]
    fn config_json_shape() {
        assert!(config_json(r#"{"speed": 2}"#).is_ok());
        assert!(config_json("not json").is_err());
        let big = format!("{{\"k\": \"{}\"}}", "v".repeat(MAX_CONFIG_JSON_LEN));
        assert!(config_json(&big).is_err());
    }

    #[test]
    fn room_reference_takes_code_or_id() {
        assert!(room_reference("AB2C3").is_ok()); // short code
        assert!(room_reference("deadbeef").is_ok()); // room id
        assert!(room_reference("not-a-room!").is_err());
    }
}
