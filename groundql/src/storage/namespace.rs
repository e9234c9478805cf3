//! Generations of the index and the pointer to the active one.

use super::keys::{info_key, parse_generation, ACTIVE_KEY, GENERATION_KEY};
use super::{StorageBackend, WriteBatch};
use crate::error::StorageError;
use serde::{Deserialize, Serialize};

/// Metadata written into every generation before it is swapped in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub generation: u64,
    /// Version fingerprint of the type graph the generation was built with
    pub schema_version: String,
    pub sdl: String,
    /// The generation this one replaced when it was swapped in
    #[serde(default)]
    pub previous: Option<u64>,
}

impl NamespaceInfo {
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self).map_err(|e| StorageError::Corrupt {
            key: String::from_utf8_lossy(&info_key(self.generation)).into_owned(),
            message: e.to_string(),
        })
    }
}

/// The active generation together with the raw pointer bytes, which
/// callers use as a write guard.
pub fn active_pointer(storage: &dyn StorageBackend) -> Result<(Option<u64>, Option<Vec<u8>>), StorageError> {
    let Some(bytes) = storage.get(ACTIVE_KEY)? else {
        return Ok((None, None));
    };
    let generation = parse_generation(&bytes).ok_or_else(|| StorageError::Corrupt {
        key: String::from_utf8_lossy(ACTIVE_KEY).into_owned(),
        message: format!("not a generation number: {}", String::from_utf8_lossy(&bytes)),
    })?;
    Ok((Some(generation), Some(bytes)))
}

pub fn active_generation(storage: &dyn StorageBackend) -> Result<Option<u64>, StorageError> {
    Ok(active_pointer(storage)?.0)
}

pub fn read_info(storage: &dyn StorageBackend, generation: u64) -> Result<Option<NamespaceInfo>, StorageError> {
    let key = info_key(generation);
    match storage.get(&key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: String::from_utf8_lossy(&key).into_owned(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

const ALLOCATE_ATTEMPTS: usize = 5;

/// Hand out a generation number no other rebuild has used, bumping
/// `meta/generation` with a guarded write.
pub fn allocate_generation(storage: &dyn StorageBackend, active: Option<u64>) -> Result<u64, StorageError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = storage.get(GENERATION_KEY)?;
        let last = match &current {
            Some(bytes) => Some(parse_generation(bytes).ok_or_else(|| StorageError::Corrupt {
                key: String::from_utf8_lossy(GENERATION_KEY).into_owned(),
                message: format!("not a generation number: {}", String::from_utf8_lossy(bytes)),
            })?),
            None => None,
        };
        let next = last.max(active).map_or(1, |g| g + 1);

        let mut batch = WriteBatch::new();
        batch.put(GENERATION_KEY, next.to_string());
        batch.expect(GENERATION_KEY, current);
        match storage.write(batch) {
            Ok(()) => return Ok(next),
            Err(StorageError::Conflict { .. }) if attempt < ALLOCATE_ATTEMPTS => continue,
            Err(e) => return Err(e),
        }
    }
}

/// The active generation's metadata, if any generation was ever swapped in.
pub fn active_info(storage: &dyn StorageBackend) -> Result<Option<NamespaceInfo>, StorageError> {
    match active_generation(storage)? {
        Some(generation) => read_info(storage, generation),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    #[test]
    fn test_active_info() {
        let storage = MemoryBackend::new();
        assert!(active_info(&storage).unwrap().is_none());

        let info = NamespaceInfo {
            generation: 4,
            schema_version: "abc".into(),
            sdl: "type Query {}".into(),
            previous: Some(3),
        };
        storage.put(&info_key(4), &info.to_bytes().unwrap()).unwrap();
        storage.put(ACTIVE_KEY, b"4").unwrap();
        assert_eq!(active_info(&storage).unwrap(), Some(info));
        assert_eq!(active_pointer(&storage).unwrap().1, Some(b"4".to_vec()));
    }

    #[test]
    fn test_allocate_generation_never_repeats() {
        let storage = MemoryBackend::new();
        assert_eq!(allocate_generation(&storage, None).unwrap(), 1);
        assert_eq!(allocate_generation(&storage, None).unwrap(), 2);
        // an abandoned number is not handed out again
        assert_eq!(allocate_generation(&storage, Some(1)).unwrap(), 3);
        // an active pointer written before the counter existed is respected
        assert_eq!(allocate_generation(&storage, Some(9)).unwrap(), 10);
    }

    #[test]
    fn test_info_without_previous_field() {
        let info: NamespaceInfo =
            serde_json::from_str(r#"{"generation": 2, "schema_version": "v", "sdl": ""}"#).unwrap();
        assert_eq!(info.previous, None);
    }

    #[test]
    fn test_corrupt_pointer() {
        let storage = MemoryBackend::new();
        storage.put(ACTIVE_KEY, b"four").unwrap();
        assert!(matches!(
            active_generation(&storage),
            Err(StorageError::Corrupt { .. })
        ));
    }
}
