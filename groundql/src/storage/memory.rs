use super::{check_guards, BatchOp, Direction, KeyRange, KeyValue, StorageBackend, WriteBatch};
use crate::error::StorageError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// In-process backend: a `BTreeMap` behind a read/write lock.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Copy of every entry, for assertions in tests.
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.data.read().clone()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn scan(
        &self,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<KeyValue>, StorageError> {
        // BTreeMap::range panics on inverted bounds
        if range.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let end = match &range.end {
            Some(end) => Bound::Excluded(end.clone()),
            None => Bound::Unbounded,
        };
        let data = self.data.read();
        let entries = data.range((Bound::Included(range.start.clone()), end));
        let clone = |(k, v): (&Vec<u8>, &Vec<u8>)| (k.clone(), v.clone());
        Ok(match direction {
            Direction::Forward => entries.take(limit).map(clone).collect(),
            Direction::Reverse => entries.rev().take(limit).map(clone).collect(),
        })
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut data = self.data.write();
        check_guards(&batch, |key| Ok(data.get(key).cloned()))?;
        for op in batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let backend = MemoryBackend::new();
        backend.put(b"a", b"1").unwrap();
        assert_eq!(backend.get(b"a").unwrap(), Some(b"1".to_vec()));
        backend.delete(b"a").unwrap();
        assert!(backend.get(b"a").unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[test]
    fn test_guard_failure_writes_nothing() {
        let backend = MemoryBackend::new();
        backend.put(b"lock", b"owner-1").unwrap();

        let mut batch = WriteBatch::new();
        batch.put("x", "1").put("y", "2");
        batch.expect("lock", None);
        let err = backend.write(batch).unwrap_err();
        assert!(matches!(err, StorageError::Conflict { ref key } if key == "lock"));
        assert!(backend.get(b"x").unwrap().is_none());

        let mut batch = WriteBatch::new();
        batch.put("x", "1").delete("lock");
        batch.expect("lock", Some(b"owner-1".to_vec()));
        backend.write(batch).unwrap();
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_scan_bounds_and_limit() {
        let backend = MemoryBackend::new();
        for key in ["a", "b", "c", "d"] {
            backend.put(key.as_bytes(), b"").unwrap();
        }
        let range = KeyRange::new("b", Some(b"d".to_vec()));
        let keys: Vec<_> = backend
            .scan(&range, Direction::Forward, 10)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

        let last = backend.scan(&range, Direction::Reverse, 1).unwrap();
        assert_eq!(last[0].0, b"c".to_vec());

        let inverted = KeyRange::new("d", Some(b"b".to_vec()));
        assert!(backend.scan(&inverted, Direction::Forward, 10).unwrap().is_empty());
    }
}
