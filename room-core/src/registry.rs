//! Global room indexes in the key-value store.
//!
//! The registry owns every index, short code and counter; room state and
//! meta belong to the store. Sorted sets carry the three per-game-type
//! indexes (creation order, last activity, turn due-time) so lobby paging,
//! idle eviction and the timeout sweep are all O(log N) pulls.

use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;

use crate::error::CoreResult;

/// Seconds a connection entry survives past its last heartbeat.
pub const CONNECTION_TTL_SECS: i64 = 120;

/// Extra lifetime of a disconnect ticket beyond its expiry, as a safety net
/// for tickets the cleanup worker never saw.
pub const TICKET_LINGER_SECS: i64 = 300;

const ROOM_REGISTRY_KEY: &str = "global:room_registry";
const SHORT_CODES_KEY: &str = "global:short_codes";
const ROOM_SHORT_CODES_KEY: &str = "global:room_short_codes";
const SHORT_CODE_COUNTER_KEY: &str = "global:short_code_counter";
const USER_ROOMS_KEY: &str = "global:user_rooms";
const USER_NAMES_KEY: &str = "global:user_names";
const ONLINE_USERS_KEY: &str = "global:online_users";
const DISCONNECT_INDEX_KEY: &str = "global:disconnected_players_index";

/// INCR and EXPIRE in one round-trip; the key only gets a TTL on first
/// touch so the window never slides.
const RATE_LIMIT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

fn rooms_index_key(game_type: &str) -> String {
    format!("index:rooms:{game_type}")
}

fn activity_index_key(game_type: &str) -> String {
    format!("index:activity:{game_type}")
}

fn timeout_index_key(game_type: &str) -> String {
    format!("index:timeouts:{game_type}")
}

fn connections_key(user_id: &str) -> String {
    format!("global:user_connections:{user_id}")
}

fn disconnect_ticket_key(user_id: &str) -> String {
    format!("global:disconnected_players:{user_id}")
}

fn rate_limit_key(user_id: &str) -> String {
    format!("ratelimit:{user_id}")
}

/// Double round of Knuth's multiplicative hashing. Spreads numerically
/// adjacent counter values across the whole code space so freshly created
/// rooms do not receive visually adjacent codes.
fn knuth_scramble(counter: u64) -> u64 {
    const KNUTH: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut h = counter.wrapping_mul(KNUTH);
    h ^= h >> 32;
    h = h.wrapping_mul(KNUTH);
    h ^ (h >> 29)
}

/// Lower 25 bits of the scramble as five alphabet characters.
fn short_code_from(counter: u64) -> String {
    let hash = knuth_scramble(counter);
    (0..protocol::SHORT_CODE_LEN)
        .map(|i| {
            let index = ((hash >> (5 * i)) & 31) as usize;
            protocol::SHORT_CODE_ALPHABET[index] as char
        })
        .collect()
}

pub struct RoomRegistry {
    pool: Pool,
}

impl RoomRegistry {
    pub fn new(pool: Pool) -> Self {
        RoomRegistry { pool }
    }

    // ---- room indexes ----

    /// Registers a room in the creation and activity indexes and the global
    /// room -> game type table.
    pub async fn register_room(
        &self,
        game_type: &str,
        room_id: &str,
        created_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now().timestamp() as f64;
        redis::pipe()
            .zadd(rooms_index_key(game_type), room_id, created_at.timestamp() as f64)
            .ignore()
            .zadd(activity_index_key(game_type), room_id, now)
            .ignore()
            .hset(ROOM_REGISTRY_KEY, room_id, game_type)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Removes a room from every index it may appear in.
    pub async fn unregister_room(&self, game_type: &str, room_id: &str) -> CoreResult<()> {
        let mut conn = self.pool.get().await?;
        redis::pipe()
            .zrem(rooms_index_key(game_type), room_id)
            .ignore()
            .zrem(activity_index_key(game_type), room_id)
            .ignore()
            .zrem(timeout_index_key(game_type), room_id)
            .ignore()
            .hdel(ROOM_REGISTRY_KEY, room_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Game type a room was registered under, if any.
    pub async fn game_type_of(&self, room_id: &str) -> CoreResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn.hget(ROOM_REGISTRY_KEY, room_id).await?)
    }

    /// Room ids of a game type in creation order, paged by rank.
    pub async fn rooms_by_game_type(
        &self,
        game_type: &str,
        offset: isize,
        count: isize,
    ) -> CoreResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn
            .zrange(rooms_index_key(game_type), offset, offset + count - 1)
            .await?)
    }

    pub async fn update_room_activity(&self, game_type: &str, room_id: &str) -> CoreResult<()> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now().timestamp() as f64;
        conn.zadd::<_, _, _, ()>(activity_index_key(game_type), room_id, now)
            .await?;
        Ok(())
    }

    /// Rooms whose last activity is older than `idle_for` seconds, oldest
    /// first. Feed for the eviction sweep.
    pub async fn idle_rooms(
        &self,
        game_type: &str,
        idle_for_secs: i64,
        limit: isize,
    ) -> CoreResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let cutoff = (Utc::now().timestamp() - idle_for_secs) as f64;
        Ok(conn
            .zrangebyscore_limit(activity_index_key(game_type), f64::NEG_INFINITY, cutoff, 0, limit)
            .await?)
    }

    // ---- turn due index ----

    /// (Re)inserts the due entry of a room; a later turn simply overwrites
    /// the previous score.
    pub async fn register_turn_timeout(
        &self,
        game_type: &str,
        room_id: &str,
        due_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut conn = self.pool.get().await?;
        conn.zadd::<_, _, _, ()>(timeout_index_key(game_type), room_id, due_at.timestamp() as f64)
            .await?;
        Ok(())
    }

    pub async fn unregister_turn_timeout(&self, game_type: &str, room_id: &str) -> CoreResult<()> {
        let mut conn = self.pool.get().await?;
        conn.zrem::<_, _, ()>(timeout_index_key(game_type), room_id)
            .await?;
        Ok(())
    }

    /// Rooms due at or before `now`, bounded. Ties keep sorted-set
    /// secondary (insertion) ordering.
    pub async fn rooms_due_for_timeout(
        &self,
        game_type: &str,
        now: DateTime<Utc>,
        limit: isize,
    ) -> CoreResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn
            .zrangebyscore_limit(
                timeout_index_key(game_type),
                f64::NEG_INFINITY,
                now.timestamp() as f64,
                0,
                limit,
            )
            .await?)
    }

    // ---- short codes ----

    /// Allocates a fresh short code for a room. Uniqueness comes from the
    /// conditional insert; collisions draw a new counter value, at most ten
    /// times.
    pub async fn allocate_short_code(&self, room_id: &str) -> CoreResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        for _ in 0..10 {
            let counter: u64 = conn.incr(SHORT_CODE_COUNTER_KEY, 1u64).await?;
            let code = short_code_from(counter);
            let inserted: bool = conn.hset_nx(SHORT_CODES_KEY, &code, room_id).await?;
            if inserted {
                conn.hset::<_, _, _, ()>(ROOM_SHORT_CODES_KEY, room_id, &code)
                    .await?;
                return Ok(Some(code));
            }
        }
        tracing::warn!(room_id, "short code allocation exhausted its attempts");
        Ok(None)
    }

    pub async fn room_by_short_code(&self, code: &str) -> CoreResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn.hget(SHORT_CODES_KEY, code).await?)
    }

    pub async fn short_code_of(&self, room_id: &str) -> CoreResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn.hget(ROOM_SHORT_CODES_KEY, room_id).await?)
    }

    /// Drops both directions of the code mapping for a deleted room.
    pub async fn release_short_code(&self, room_id: &str) -> CoreResult<()> {
        let mut conn = self.pool.get().await?;
        let code: Option<String> = conn.hget(ROOM_SHORT_CODES_KEY, room_id).await?;
        if let Some(code) = code {
            redis::pipe()
                .hdel(SHORT_CODES_KEY, &code)
                .ignore()
                .hdel(ROOM_SHORT_CODES_KEY, room_id)
                .ignore()
                .query_async::<()>(&mut conn)
                .await?;
        }
        Ok(())
    }

    // ---- user <-> room ----

    /// Claims the user's single active-room slot. Returns false when the
    /// user already sits in some room.
    pub async fn try_set_user_room(&self, user_id: &str, room_id: &str) -> CoreResult<bool> {
        let mut conn = self.pool.get().await?;
        Ok(conn.hset_nx(USER_ROOMS_KEY, user_id, room_id).await?)
    }

    pub async fn user_room(&self, user_id: &str) -> CoreResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn.hget(USER_ROOMS_KEY, user_id).await?)
    }

    pub async fn clear_user_room(&self, user_id: &str) -> CoreResult<()> {
        let mut conn = self.pool.get().await?;
        conn.hdel::<_, _, ()>(USER_ROOMS_KEY, user_id).await?;
        Ok(())
    }

    // ---- connections, heartbeats, online set ----

    /// Registers a connection and refreshes the user's online presence.
    /// Expired sibling entries are pruned on every touch.
    pub async fn touch_connection(&self, user_id: &str, connection_id: &str) -> CoreResult<()> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now().timestamp();
        let stale = (now - CONNECTION_TTL_SECS) as f64;
        let key = connections_key(user_id);
        redis::pipe()
            .zrembyscore(&key, f64::NEG_INFINITY, stale)
            .ignore()
            .zadd(&key, connection_id, now as f64)
            .ignore()
            .expire(&key, CONNECTION_TTL_SECS)
            .ignore()
            .zadd(ONLINE_USERS_KEY, user_id, now as f64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Stores the display name used in broadcasts about this user.
    pub async fn remember_user_name(&self, user_id: &str, user_name: &str) -> CoreResult<()> {
        let mut conn = self.pool.get().await?;
        conn.hset::<_, _, _, ()>(USER_NAMES_KEY, user_id, user_name)
            .await?;
        Ok(())
    }

    pub async fn user_name(&self, user_id: &str) -> CoreResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn.hget(USER_NAMES_KEY, user_id).await?)
    }

    /// Removes one connection; returns how many live connections remain.
    pub async fn remove_connection(&self, user_id: &str, connection_id: &str) -> CoreResult<u64> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now().timestamp();
        let stale = (now - CONNECTION_TTL_SECS) as f64;
        let key = connections_key(user_id);
        let (_, _, remaining): ((), (), u64) = redis::pipe()
            .zrem(&key, connection_id)
            .zrembyscore(&key, f64::NEG_INFINITY, stale)
            .zcard(&key)
            .query_async(&mut conn)
            .await?;
        Ok(remaining)
    }

    /// True while the user has at least one non-expired heartbeat.
    pub async fn is_online(&self, user_id: &str) -> CoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let stale = (Utc::now().timestamp() - CONNECTION_TTL_SECS) as f64;
        conn.zrembyscore::<_, _, _, ()>(ONLINE_USERS_KEY, f64::NEG_INFINITY, stale)
            .await?;
        let score: Option<f64> = conn.zscore(ONLINE_USERS_KEY, user_id).await?;
        Ok(score.is_some())
    }

    /// Currently online users, pruned lazily on access.
    pub async fn online_users(&self) -> CoreResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let stale = (Utc::now().timestamp() - CONNECTION_TTL_SECS) as f64;
        conn.zrembyscore::<_, _, _, ()>(ONLINE_USERS_KEY, f64::NEG_INFINITY, stale)
            .await?;
        Ok(conn.zrange(ONLINE_USERS_KEY, 0, -1).await?)
    }

    // ---- disconnect tickets ----

    /// Writes a reclaim ticket for a user who lost their last connection
    /// while seated.
    pub async fn write_disconnect_ticket(
        &self,
        user_id: &str,
        room_id: &str,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut conn = self.pool.get().await?;
        let linger = (expires_at.timestamp() - Utc::now().timestamp()).max(0) + TICKET_LINGER_SECS;
        redis::pipe()
            .zadd(DISCONNECT_INDEX_KEY, user_id, expires_at.timestamp() as f64)
            .ignore()
            .set_ex(disconnect_ticket_key(user_id), room_id, linger as u64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Consumes the user's ticket, returning the room to resume into.
    pub async fn take_disconnect_ticket(&self, user_id: &str) -> CoreResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        let room: Option<String> = conn.get(disconnect_ticket_key(user_id)).await?;
        if room.is_some() {
            redis::pipe()
                .del(disconnect_ticket_key(user_id))
                .ignore()
                .zrem(DISCONNECT_INDEX_KEY, user_id)
                .ignore()
                .query_async::<()>(&mut conn)
                .await?;
        }
        Ok(room)
    }

    /// Tickets whose grace ran out, paired with the room they point to.
    pub async fn expired_disconnect_tickets(
        &self,
        now: DateTime<Utc>,
        limit: isize,
    ) -> CoreResult<Vec<(String, String)>> {
        let mut conn = self.pool.get().await?;
        let users: Vec<String> = conn
            .zrangebyscore_limit(
                DISCONNECT_INDEX_KEY,
                f64::NEG_INFINITY,
                now.timestamp() as f64,
                0,
                limit,
            )
            .await?;
        let mut expired = Vec::with_capacity(users.len());
        for user_id in users {
            let room: Option<String> = conn.get(disconnect_ticket_key(&user_id)).await?;
            match room {
                Some(room_id) => expired.push((user_id, room_id)),
                // The string half already lapsed via TTL; drop the index entry.
                None => {
                    conn.zrem::<_, _, ()>(DISCONNECT_INDEX_KEY, &user_id).await?;
                }
            }
        }
        Ok(expired)
    }

    pub async fn clear_disconnect_ticket(&self, user_id: &str) -> CoreResult<()> {
        let mut conn = self.pool.get().await?;
        redis::pipe()
            .del(disconnect_ticket_key(user_id))
            .ignore()
            .zrem(DISCONNECT_INDEX_KEY, user_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    // ---- rate limiting ----

    /// True while the user stays at or under `max` actions in the current
    /// window.
    pub async fn check_rate_limit(
        &self,
        user_id: &str,
        max: u32,
        window_secs: u32,
    ) -> CoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let count: u64 = redis::Script::new(RATE_LIMIT_SCRIPT)
            .key(rate_limit_key(user_id))
            .arg(window_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(count <= max as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_codes_use_only_the_alphabet() {
        for counter in [0u64, 1, 2, 1000, u64::MAX] {
            let code = short_code_from(counter);
            assert!(protocol::is_short_code(&code), "bad code {code}");
        }
    }

    #[test]
    fn adjacent_counters_produce_distinct_scattered_codes() {
        let codes: std::collections::HashSet<String> =
            (1..=100u64).map(short_code_from).collect();
        assert_eq!(codes.len(), 100);
        // Raw base-32 of the counter would give every small input the same
        // tail of padding characters; the scramble must not.
        let first_chars: std::collections::HashSet<u8> =
            codes.iter().map(|code| code.as_bytes()[0]).collect();
        assert!(first_chars.len() > 10);
    }

    #[test]
    fn scramble_is_deterministic() {
        assert_eq!(short_code_from(42), short_code_from(42));
        assert_eq!(knuth_scramble(7), knuth_scramble(7));
    }

    #[test]
    fn key_builders_follow_the_keyspace() {
        assert_eq!(rooms_index_key("race"), "index:rooms:race");
        assert_eq!(activity_index_key("race"), "index:activity:race");
        assert_eq!(timeout_index_key("race"), "index:timeouts:race");
        assert_eq!(connections_key("u1"), "global:user_connections:u1");
        assert_eq!(disconnect_ticket_key("u1"), "global:disconnected_players:u1");
        assert_eq!(rate_limit_key("u1"), "ratelimit:u1");
    }
}
