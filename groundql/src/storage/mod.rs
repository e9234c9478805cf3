//! Key-ordered storage for index records.
//!
//! The [`StorageBackend`] trait is the only thing the indexer and resolver
//! know about persistence. Keys and values are raw bytes; keys compare
//! lexicographically. Multi-key writes go through [`WriteBatch`], which is
//! applied atomically and may carry guards for optimistic concurrency.

pub mod keys;
mod memory;
pub mod namespace;
mod sqlite;

pub use memory::MemoryBackend;
pub use namespace::NamespaceInfo;
pub use sqlite::SqliteBackend;

use crate::error::StorageError;
use std::collections::VecDeque;

pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Half-open key range `[start, end)`. `end = None` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: Option<Vec<u8>>) -> Self {
        KeyRange {
            start: start.into(),
            end,
        }
    }

    /// Every key starting with `prefix`
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let start = prefix.into();
        let end = prefix_successor(&start);
        KeyRange { start, end }
    }

    /// Same upper bound, starting strictly after `key`.
    pub fn after(&self, key: &[u8]) -> Self {
        let mut start = key.to_vec();
        start.push(0);
        KeyRange {
            start,
            end: self.end.clone(),
        }
    }

    /// Same lower bound, ending strictly before `key`.
    pub fn before(&self, key: &[u8]) -> Self {
        KeyRange {
            start: self.start.clone(),
            end: Some(key.to_vec()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(&self.end, Some(end) if *end <= self.start)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && self.end.as_deref().map_or(true, |end| key < end)
    }
}

/// The smallest key greater than every key with this prefix, or `None`
/// when the prefix is all `0xFF`.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// A precondition on the current value of a key. `expected = None` means the
/// key must be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub key: Vec<u8>,
    pub expected: Option<Vec<u8>>,
}

/// Puts and deletes applied all-or-nothing. If any guard does not hold when
/// the batch is applied, nothing is written and the backend returns
/// [`StorageError::Conflict`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub ops: Vec<BatchOp>,
    pub guards: Vec<Guard>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn expect(&mut self, key: impl Into<Vec<u8>>, expected: Option<Vec<u8>>) -> &mut Self {
        self.guards.push(Guard {
            key: key.into(),
            expected,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// A key-ordered byte store.
///
/// Implementations must be safe to share across threads. `write` must apply
/// the whole batch atomically with respect to concurrent readers and writers.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Up to `limit` entries of `range`, in key order for `Forward` and
    /// reverse key order for `Reverse`.
    fn scan(
        &self,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<KeyValue>, StorageError>;

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch)
    }
}

const SCAN_CHUNK: usize = 256;

/// Lazy iterator over a key range, fetching `chunk` entries per backend call.
pub struct ScanIter<'a> {
    backend: &'a dyn StorageBackend,
    range: KeyRange,
    direction: Direction,
    chunk: usize,
    buffer: VecDeque<KeyValue>,
    exhausted: bool,
}

impl<'a> ScanIter<'a> {
    pub fn new(backend: &'a dyn StorageBackend, range: KeyRange, direction: Direction) -> Self {
        Self::with_chunk(backend, range, direction, SCAN_CHUNK)
    }

    pub fn with_chunk(
        backend: &'a dyn StorageBackend,
        range: KeyRange,
        direction: Direction,
        chunk: usize,
    ) -> Self {
        ScanIter {
            backend,
            range,
            direction,
            chunk: chunk.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn refill(&mut self) -> Result<(), StorageError> {
        let entries = self.backend.scan(&self.range, self.direction, self.chunk)?;
        if entries.len() < self.chunk {
            self.exhausted = true;
        }
        if let Some((last, _)) = entries.last() {
            self.range = match self.direction {
                Direction::Forward => self.range.after(last),
                Direction::Reverse => self.range.before(last),
            };
        }
        self.buffer.extend(entries);
        Ok(())
    }
}

impl Iterator for ScanIter<'_> {
    type Item = Result<KeyValue, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Delete every key in `range`, one batch per scanned chunk.
/// Returns the number of keys removed.
pub fn clear_range(backend: &dyn StorageBackend, range: &KeyRange) -> Result<usize, StorageError> {
    let mut removed = 0;
    loop {
        let entries = backend.scan(range, Direction::Forward, SCAN_CHUNK)?;
        if entries.is_empty() {
            return Ok(removed);
        }
        let mut batch = WriteBatch::new();
        for (key, _) in &entries {
            batch.delete(key.as_slice());
        }
        removed += batch.len();
        backend.write(batch)?;
    }
}

/// Check every guard of `batch` with `current` as the value lookup.
pub(crate) fn check_guards<F>(batch: &WriteBatch, mut current: F) -> Result<(), StorageError>
where
    F: FnMut(&[u8]) -> Result<Option<Vec<u8>>, StorageError>,
{
    for guard in &batch.guards {
        if current(&guard.key)? != guard.expected {
            return Err(StorageError::Conflict {
                key: String::from_utf8_lossy(&guard.key).into_owned(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        let mut batch = WriteBatch::new();
        for i in 0..10u8 {
            batch.put(format!("k/{i}"), vec![i]);
        }
        batch.put("other", "x");
        backend.write(batch).unwrap();
        backend
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(&[0x61, 0xFF]), Some(vec![0x62]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn test_range_contains() {
        let range = KeyRange::prefix("k/");
        assert!(range.contains(b"k/1"));
        assert!(!range.contains(b"other"));
        assert!(!range.after(b"k/9").contains(b"k/9"));
        assert!(KeyRange::new("b", Some(b"a".to_vec())).is_empty());
    }

    #[test]
    fn test_scan_iter_pages_through_range() {
        let backend = seeded();
        let keys: Vec<Vec<u8>> = ScanIter::with_chunk(&backend, KeyRange::prefix("k/"), Direction::Forward, 3)
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys.len(), 10);
        assert_eq!(keys[0], b"k/0".to_vec());
        assert_eq!(keys[9], b"k/9".to_vec());
    }

    #[test]
    fn test_scan_iter_reverse() {
        let backend = seeded();
        let values: Vec<u8> = ScanIter::with_chunk(&backend, KeyRange::prefix("k/"), Direction::Reverse, 4)
            .map(|r| r.unwrap().1[0])
            .collect();
        assert_eq!(values, vec![9, 8, 7, 6, 5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_clear_range() {
        let backend = seeded();
        assert_eq!(clear_range(&backend, &KeyRange::prefix("k/")).unwrap(), 10);
        assert!(backend.get(b"k/3").unwrap().is_none());
        assert_eq!(backend.get(b"other").unwrap(), Some(b"x".to_vec()));
    }
}
