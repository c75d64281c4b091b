//! Versioned binary codec for room state.
//!
//! Wire layout: 1 byte version, 4 bytes little-endian declared size, then
//! exactly that many bytes of postcard-encoded state. Game layouts evolve
//! between deployments; pinning the `(type, version, size)` triple lets a
//! node load old blobs through an explicit migration and makes silent drift
//! a hard, named error instead of garbage state.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CoreError, CoreResult};

/// Upper bound on an encoded state body.
pub const MAX_STATE_BYTES: usize = 1024;

/// Version byte plus the little-endian size field.
pub const STATE_HEADER_LEN: usize = 5;

/// A persistable room state: serde-serializable, reference-free by
/// construction, with a module-declared layout version.
pub trait RoomState: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Bumped whenever the layout changes; decides decode compatibility.
    const VERSION: u8;
}

/// Last path segment of a type name, used in corruption reports.
pub(crate) fn short_type_name<T: 'static>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Encodes `state` behind the version/size header.
pub fn encode_state<T: RoomState>(state: &T) -> CoreResult<Bytes> {
    let body = postcard::to_allocvec(state)?;
    if body.len() > MAX_STATE_BYTES {
        return Err(CoreError::Internal(format!(
            "state {} exceeds {} bytes ({})",
            short_type_name::<T>(),
            MAX_STATE_BYTES,
            body.len()
        )));
    }
    let mut blob = BytesMut::with_capacity(STATE_HEADER_LEN + body.len());
    blob.put_u8(T::VERSION);
    blob.put_u32_le(body.len() as u32);
    blob.put_slice(&body);
    Ok(blob.freeze())
}

/// Decodes a blob produced by [`encode_state`].
///
/// A current-version blob parses directly. Any other version consults the
/// migration registry; without a registered migrator the stored triple is
/// reported via [`CoreError::StateCorrupted`].
pub fn decode_state<T: RoomState>(blob: &[u8], migrations: &MigrationRegistry) -> CoreResult<T> {
    if blob.len() < STATE_HEADER_LEN {
        return Err(CoreError::StateCorrupted {
            type_name: short_type_name::<T>(),
            version: 0,
            size: blob.len() as u32,
        });
    }
    let mut header = blob;
    let version = header.get_u8();
    let declared_size = header.get_u32_le();
    let body = &blob[STATE_HEADER_LEN..];

    let corrupted = || CoreError::StateCorrupted {
        type_name: short_type_name::<T>(),
        version,
        size: declared_size,
    };

    if body.len() != declared_size as usize {
        return Err(corrupted());
    }
    if version == T::VERSION {
        return postcard::from_bytes(body).map_err(|_| corrupted());
    }
    migrations
        .migrate::<T>(version, body)
        .ok_or_else(corrupted)
}

type ErasedMigrator = Box<dyn Fn(&[u8]) -> Option<Box<dyn Any + Send>> + Send + Sync>;

/// Registry of state migrators keyed by target type and source version.
///
/// A migrator receives the raw stored body (whose length is the declared
/// size) and returns a freshly built current-version state.
#[derive(Default)]
pub struct MigrationRegistry {
    migrators: HashMap<(TypeId, u8), ErasedMigrator>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a migrator for blobs of `T` stored at `from_version`.
    pub fn register<T, F>(&mut self, from_version: u8, migrate: F)
    where
        T: RoomState,
        F: Fn(&[u8]) -> Option<T> + Send + Sync + 'static,
    {
        self.migrators.insert(
            (TypeId::of::<T>(), from_version),
            Box::new(move |body| {
                migrate(body).map(|state| Box::new(state) as Box<dyn Any + Send>)
            }),
        );
    }

    fn migrate<T: RoomState>(&self, from_version: u8, body: &[u8]) -> Option<T> {
        let migrator = self.migrators.get(&(TypeId::of::<T>(), from_version))?;
        migrator(body)?.downcast::<T>().ok().map(|boxed| *boxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Board {
        cells: [u8; 9],
        turn: u8,
    }

    impl RoomState for Board {
        const VERSION: u8 = 2;
    }

    // The version-1 layout lacked the turn field.
    #[derive(Debug, Serialize, Deserialize)]
    struct BoardV1 {
        cells: [u8; 9],
    }

    fn sample() -> Board {
        Board {
            cells: [0, 1, 2, 0, 1, 0, 0, 0, 2],
            turn: 1,
        }
    }

    #[test]
    fn round_trip_preserves_identity() {
        let blob = encode_state(&sample()).unwrap();
        assert_eq!(blob[0], Board::VERSION);
        let size = u32::from_le_bytes(blob[1..5].try_into().unwrap()) as usize;
        assert_eq!(size, blob.len() - STATE_HEADER_LEN);

        let back: Board = decode_state(&blob, &MigrationRegistry::new()).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn truncated_blob_is_corrupted() {
        let blob = encode_state(&sample()).unwrap();
        let err = decode_state::<Board>(&blob[..blob.len() - 1], &MigrationRegistry::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::StateCorrupted { .. }));
    }

    #[test]
    fn unknown_version_names_the_stored_triple() {
        let mut blob = BytesMut::new();
        blob.put_u8(7);
        blob.put_u32_le(3);
        blob.put_slice(&[1, 2, 3]);
        let err = decode_state::<Board>(&blob, &MigrationRegistry::new()).unwrap_err();
        match err {
            CoreError::StateCorrupted {
                type_name,
                version,
                size,
            } => {
                assert_eq!(type_name, "Board");
                assert_eq!(version, 7);
                assert_eq!(size, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn registered_migrator_upgrades_old_blobs() {
        // Encode a v1 blob by hand.
        let body = postcard::to_allocvec(&BoardV1 {
            cells: [1, 0, 0, 0, 0, 0, 0, 0, 0],
        })
        .unwrap();
        let mut blob = BytesMut::new();
        blob.put_u8(1);
        blob.put_u32_le(body.len() as u32);
        blob.put_slice(&body);

        let mut migrations = MigrationRegistry::new();
        migrations.register::<Board, _>(1, |body| {
            let old: BoardV1 = postcard::from_bytes(body).ok()?;
            Some(Board {
                cells: old.cells,
                turn: 0,
            })
        });

        let board: Board = decode_state(&blob, &migrations).unwrap();
        assert_eq!(board.cells[0], 1);
        assert_eq!(board.turn, 0);
    }

    #[test]
    fn oversized_state_is_rejected_at_encode() {
        #[derive(Serialize, Deserialize)]
        struct Fat {
            bytes: Vec<u8>,
        }
        impl RoomState for Fat {
            const VERSION: u8 = 1;
        }
        let fat = Fat {
            bytes: vec![0xAB; MAX_STATE_BYTES + 1],
        };
        assert!(encode_state(&fat).is_err());
    }
}
