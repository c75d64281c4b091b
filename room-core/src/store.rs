//! Room persistence and per-room distributed locking.
//!
//! All keys of one room share a hash tag (`game:<type>:{<roomId>}:state`)
//! so they land on the same cluster slot. The store owns state and meta
//! exclusively; everything index-shaped belongs to the registry, which the
//! store notifies on save and delete.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use deadpool_redis::Pool;
use redis::AsyncCommands;

use crate::codec::{self, MigrationRegistry, RoomState};
use crate::error::{CoreError, CoreResult};
use crate::module::RoomMeta;
use crate::registry::RoomRegistry;

/// Compare-and-delete: a worker only ever releases its own lock.
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Compare-and-swap on the meta document. Guards seat mutations against
/// concurrent joins without holding the room lock across the economy
/// round-trip.
const META_CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

pub fn state_key(game_type: &str, room_id: &str) -> String {
    format!("game:{game_type}:{{{room_id}}}:state")
}

pub fn meta_key(game_type: &str, room_id: &str) -> String {
    format!("game:{game_type}:{{{room_id}}}:meta")
}

pub fn lock_key(game_type: &str, room_id: &str) -> String {
    format!("game:{game_type}:{{{room_id}}}:lock")
}

pub struct RoomStore {
    pool: Pool,
    registry: Arc<RoomRegistry>,
    migrations: Arc<MigrationRegistry>,
    worker_id: String,
}

impl RoomStore {
    pub fn new(
        pool: Pool,
        registry: Arc<RoomRegistry>,
        migrations: Arc<MigrationRegistry>,
        worker_id: impl Into<String>,
    ) -> Self {
        RoomStore {
            pool,
            registry,
            migrations,
            worker_id: worker_id.into(),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Loads state and meta in one pipelined round-trip.
    ///
    /// A failed decode (unknown layout, partial write) is logged and
    /// reported as absent so the caller can decide to recreate the room.
    pub async fn load<T: RoomState>(
        &self,
        game_type: &str,
        room_id: &str,
    ) -> CoreResult<Option<(T, RoomMeta)>> {
        let mut conn = self.pool.get().await?;
        let (state_blob, meta_json): (Option<Vec<u8>>, Option<String>) = redis::pipe()
            .get(state_key(game_type, room_id))
            .get(meta_key(game_type, room_id))
            .query_async(&mut conn)
            .await?;

        let (state_blob, meta_json) = match (state_blob, meta_json) {
            (Some(state), Some(meta)) => (state, meta),
            (None, None) => return Ok(None),
            // One half of the pair is missing: a partial write happened.
            _ => {
                tracing::error!(game_type, room_id, "room has a partial state/meta pair");
                return Ok(None);
            }
        };

        let state = match codec::decode_state::<T>(&state_blob, &self.migrations) {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(game_type, room_id, %err, "failed to decode room state");
                return Ok(None);
            }
        };
        let meta: RoomMeta = match serde_json::from_str(&meta_json) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::error!(game_type, room_id, %err, "failed to decode room meta");
                return Ok(None);
            }
        };
        Ok(Some((state, meta)))
    }

    /// Writes state and meta in one pipelined round-trip and keeps the
    /// registry indexes in sync.
    pub async fn save<T: RoomState>(
        &self,
        game_type: &str,
        room_id: &str,
        state: &T,
        meta: &RoomMeta,
    ) -> CoreResult<()> {
        let blob = codec::encode_state(state)?;
        let meta_json = serde_json::to_string(meta)?;
        {
            let mut conn = self.pool.get().await?;
            redis::pipe()
                .set(state_key(game_type, room_id), blob.as_ref())
                .ignore()
                .set(meta_key(game_type, room_id), meta_json)
                .ignore()
                .query_async::<()>(&mut conn)
                .await?;
        }
        self.registry
            .register_room(game_type, room_id, meta.created_at)
            .await?;
        self.registry.update_room_activity(game_type, room_id).await
    }

    /// Batched load; rooms that are missing or fail to decode are omitted.
    pub async fn load_many<T: RoomState>(
        &self,
        game_type: &str,
        room_ids: &[String],
    ) -> CoreResult<Vec<(String, T, RoomMeta)>> {
        if room_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;
        let mut pipe = redis::pipe();
        for room_id in room_ids {
            pipe.get(state_key(game_type, room_id))
                .get(meta_key(game_type, room_id));
        }
        let rows: Vec<(Option<Vec<u8>>, Option<String>)> = pipe.query_async(&mut conn).await?;

        let mut loaded = Vec::with_capacity(room_ids.len());
        for (room_id, (state_blob, meta_json)) in room_ids.iter().zip(rows) {
            let (Some(blob), Some(json)) = (state_blob, meta_json) else {
                continue;
            };
            let Ok(state) = codec::decode_state::<T>(&blob, &self.migrations) else {
                tracing::error!(game_type, room_id, "skipping undecodable room in batch load");
                continue;
            };
            let Ok(meta) = serde_json::from_str::<RoomMeta>(&json) else {
                continue;
            };
            loaded.push((room_id.clone(), state, meta));
        }
        Ok(loaded)
    }

    /// Batched meta-only load; missing rooms are omitted.
    pub async fn load_meta_many(
        &self,
        game_type: &str,
        room_ids: &[String],
    ) -> CoreResult<Vec<(String, RoomMeta)>> {
        if room_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;
        let keys: Vec<String> = room_ids
            .iter()
            .map(|room_id| meta_key(game_type, room_id))
            .collect();
        let rows: Vec<Option<String>> = conn.mget(&keys).await?;

        let mut metas = Vec::with_capacity(room_ids.len());
        for (room_id, json) in room_ids.iter().zip(rows) {
            let Some(json) = json else { continue };
            if let Ok(meta) = serde_json::from_str::<RoomMeta>(&json) {
                metas.push((room_id.clone(), meta));
            }
        }
        Ok(metas)
    }

    /// Meta-only load for one room.
    pub async fn load_meta(&self, game_type: &str, room_id: &str) -> CoreResult<Option<RoomMeta>> {
        let mut conn = self.pool.get().await?;
        let json: Option<String> = conn.get(meta_key(game_type, room_id)).await?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json).map(Some).unwrap_or_else(|err| {
                tracing::error!(game_type, room_id, %err, "failed to decode room meta");
                None
            })),
            None => Ok(None),
        }
    }

    /// Swaps the meta document only if it still equals `expected`. Returns
    /// false when another writer got there first.
    pub async fn compare_and_swap_meta(
        &self,
        game_type: &str,
        room_id: &str,
        expected_json: &str,
        new_meta: &RoomMeta,
    ) -> CoreResult<bool> {
        let new_json = serde_json::to_string(new_meta)?;
        let mut conn = self.pool.get().await?;
        let swapped: i64 = redis::Script::new(META_CAS_SCRIPT)
            .key(meta_key(game_type, room_id))
            .arg(expected_json)
            .arg(new_json)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    /// Raw meta JSON, needed as the compare operand of
    /// [`compare_and_swap_meta`].
    pub async fn load_meta_raw(
        &self,
        game_type: &str,
        room_id: &str,
    ) -> CoreResult<Option<(String, RoomMeta)>> {
        let mut conn = self.pool.get().await?;
        let json: Option<String> = conn.get(meta_key(game_type, room_id)).await?;
        let Some(json) = json else { return Ok(None) };
        let meta: RoomMeta = serde_json::from_str(&json)?;
        Ok(Some((json, meta)))
    }

    /// `SET NX EX` with this worker's token. Returns whether the lock is
    /// now held by us.
    pub async fn try_lock(
        &self,
        game_type: &str,
        room_id: &str,
        ttl: Duration,
    ) -> CoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key(game_type, room_id))
            .arg(&self.worker_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    /// Releases our lock; a lock held by another worker is left alone.
    pub async fn unlock(&self, game_type: &str, room_id: &str) -> CoreResult<()> {
        let mut conn = self.pool.get().await?;
        let _released: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(lock_key(game_type, room_id))
            .arg(&self.worker_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Removes state, meta and lock and unregisters the room everywhere.
    pub async fn delete(&self, game_type: &str, room_id: &str) -> CoreResult<()> {
        {
            let mut conn = self.pool.get().await?;
            redis::pipe()
                .del(state_key(game_type, room_id))
                .ignore()
                .del(meta_key(game_type, room_id))
                .ignore()
                .del(lock_key(game_type, room_id))
                .ignore()
                .query_async::<()>(&mut conn)
                .await?;
        }
        self.registry.unregister_room(game_type, room_id).await?;
        self.registry.release_short_code(room_id).await
    }

    /// Runs `work` under the room lock, retrying the acquire briefly before
    /// giving up with [`CoreError::LockContention`]. The lock TTL bounds a
    /// stuck holder; `work` itself is expected to stay well under it.
    pub async fn with_lock<R, F, Fut>(
        &self,
        game_type: &str,
        room_id: &str,
        work: F,
    ) -> CoreResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<R>>,
    {
        const ACQUIRE_ATTEMPTS: u32 = 5;
        const LOCK_TTL: Duration = Duration::from_secs(10);

        let mut acquired = false;
        for attempt in 0..ACQUIRE_ATTEMPTS {
            if self.try_lock(game_type, room_id, LOCK_TTL).await? {
                acquired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(40 * (attempt as u64 + 1))).await;
        }
        if !acquired {
            return Err(CoreError::LockContention);
        }

        let started = Utc::now();
        let result = work().await;
        let held_for = Utc::now() - started;
        if held_for.num_seconds() >= LOCK_TTL.as_secs() as i64 {
            tracing::warn!(game_type, room_id, ?held_for, "room lock outlived its TTL");
        }
        self.unlock(game_type, room_id).await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_hash_tagged_per_room() {
        assert_eq!(state_key("race", "ab12"), "game:race:{ab12}:state");
        assert_eq!(meta_key("race", "ab12"), "game:race:{ab12}:meta");
        assert_eq!(lock_key("race", "ab12"), "game:race:{ab12}:lock");
        // All three share the same hash tag and therefore the same slot.
        for key in [
            state_key("race", "ab12"),
            meta_key("race", "ab12"),
            lock_key("race", "ab12"),
        ] {
            assert!(key.contains("{ab12}"));
        }
    }
}
