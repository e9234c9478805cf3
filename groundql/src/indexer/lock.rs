//! Rebuild lock and per-path write serialization.

use crate::error::{IndexError, StorageError};
use crate::storage::keys::LOCK_KEY;
use crate::storage::{StorageBackend, WriteBatch};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// The rebuild lock record stored under `meta/rebuild-lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildLock {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

impl RebuildLock {
    pub fn is_expired(&self, ttl_secs: u64, now: DateTime<Utc>) -> bool {
        let ttl = Duration::seconds(ttl_secs.min(i64::MAX as u64 / 1000) as i64);
        now.signed_duration_since(self.acquired_at) > ttl
    }

    fn in_progress(&self) -> IndexError {
        IndexError::RebuildInProgress {
            owner: self.owner.clone(),
            since: self.acquired_at.to_rfc3339(),
        }
    }
}

/// A lock this process holds, with the exact bytes it wrote.
#[derive(Debug)]
pub struct HeldLock {
    pub lock: RebuildLock,
    pub(crate) bytes: Vec<u8>,
}

fn decode(bytes: &[u8]) -> Option<RebuildLock> {
    serde_json::from_slice(bytes).ok()
}

fn encode(lock: &RebuildLock) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(lock).map_err(|e| StorageError::Corrupt {
        key: String::from_utf8_lossy(LOCK_KEY).into_owned(),
        message: e.to_string(),
    })
}

/// The current lock, if one is held and not expired.
pub fn live_lock(storage: &dyn StorageBackend, ttl_secs: u64) -> Result<Option<RebuildLock>, StorageError> {
    let Some(bytes) = storage.get(LOCK_KEY)? else {
        return Ok(None);
    };
    Ok(decode(&bytes).filter(|lock| !lock.is_expired(ttl_secs, Utc::now())))
}

/// Take the rebuild lock with a guarded write. Expired or unreadable locks
/// are taken over; a live one fails with `RebuildInProgress`.
pub fn acquire(storage: &dyn StorageBackend, ttl_secs: u64) -> Result<HeldLock, IndexError> {
    let current = storage.get(LOCK_KEY)?;
    if let Some(bytes) = &current {
        match decode(bytes) {
            Some(existing) if !existing.is_expired(ttl_secs, Utc::now()) => {
                return Err(existing.in_progress());
            }
            Some(existing) => log::warn!(
                "Taking over expired rebuild lock held by {} since {}",
                existing.owner,
                existing.acquired_at
            ),
            None => log::warn!("Replacing unreadable rebuild lock"),
        }
    }

    let lock = RebuildLock {
        owner: uuid::Uuid::new_v4().to_string(),
        acquired_at: Utc::now(),
    };
    let bytes = encode(&lock)?;

    let mut batch = WriteBatch::new();
    batch.put(LOCK_KEY, bytes.clone());
    batch.expect(LOCK_KEY, current);
    match storage.write(batch) {
        Ok(()) => Ok(HeldLock { lock, bytes }),
        Err(StorageError::Conflict { .. }) => {
            // Lost the race to another rebuild.
            let winner = storage.get(LOCK_KEY)?.as_deref().and_then(decode);
            Err(match winner {
                Some(winner) => winner.in_progress(),
                None => IndexError::RebuildInProgress {
                    owner: "unknown".into(),
                    since: Utc::now().to_rfc3339(),
                },
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Drop the lock if it is still ours.
pub fn release(storage: &dyn StorageBackend, held: &HeldLock) -> Result<(), StorageError> {
    let mut batch = WriteBatch::new();
    batch.delete(LOCK_KEY);
    batch.expect(LOCK_KEY, Some(held.bytes.clone()));
    match storage.write(batch) {
        Err(StorageError::Conflict { .. }) => {
            log::warn!("Rebuild lock {} was taken over before release", held.lock.owner);
            Ok(())
        }
        other => other,
    }
}

/// Keeps a held lock fresh during a long rebuild. Each `beat` rewrites
/// `acquired_at` once a third of the TTL has passed, guarded on the bytes we
/// last wrote, so a takeover is noticed instead of written over.
pub struct Heartbeat<'a> {
    storage: &'a dyn StorageBackend,
    interval: Duration,
    held: Mutex<HeldLock>,
}

impl<'a> Heartbeat<'a> {
    pub fn new(storage: &'a dyn StorageBackend, ttl_secs: u64, held: HeldLock) -> Self {
        let ttl = ttl_secs.min(i64::MAX as u64 / 1000) as i64;
        Heartbeat {
            storage,
            interval: Duration::seconds(ttl / 3),
            held: Mutex::new(held),
        }
    }

    pub fn owner(&self) -> String {
        self.held.lock().lock.owner.clone()
    }

    /// The lock bytes currently stored under `meta/rebuild-lock`.
    pub fn bytes(&self) -> Vec<u8> {
        self.held.lock().bytes.clone()
    }

    pub fn beat(&self) -> Result<(), IndexError> {
        let mut held = self.held.lock();
        let now = Utc::now();
        if now.signed_duration_since(held.lock.acquired_at) < self.interval {
            return Ok(());
        }

        let lock = RebuildLock {
            owner: held.lock.owner.clone(),
            acquired_at: now,
        };
        let bytes = encode(&lock)?;
        let mut batch = WriteBatch::new();
        batch.put(LOCK_KEY, bytes.clone());
        batch.expect(LOCK_KEY, Some(held.bytes.clone()));
        match self.storage.write(batch) {
            Ok(()) => {
                *held = HeldLock { lock, bytes };
                Ok(())
            }
            Err(StorageError::Conflict { .. }) => Err(IndexError::LockLost {
                owner: held.lock.owner.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn release(&self) -> Result<(), StorageError> {
        release(self.storage, &self.held.lock())
    }
}

const STRIPES: usize = 64;

/// Striped mutexes serializing in-process writes to the same document.
pub struct PathLocks {
    stripes: Vec<Mutex<()>>,
}

impl Default for PathLocks {
    fn default() -> Self {
        PathLocks {
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, collection: &str, path: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        collection.hash(&mut hasher);
        path.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[stripe].lock()
    }
}
