//! Materializing content into index records.
//!
//! A full rebuild writes a freshly allocated generation while readers keep
//! using the active one, then swaps `meta/active` in a single guarded batch.
//! Incremental runs rewrite named paths in place inside the active
//! generation, one atomic batch per document.

pub mod lock;
pub mod normalize;

pub use lock::{Heartbeat, PathLocks, RebuildLock};
pub use normalize::{match_template, normalize_datetime};

use crate::config::DatabaseConfig;
use crate::error::{IndexError, SkipReason, SourceError, StorageError};
use crate::graph::{CollectionType, TypeGraph};
use crate::parser::DocumentParser;
use crate::record::DocumentRecord;
use crate::source::ContentSource;
use crate::storage::keys::{self, RefSource, ACTIVE_KEY, LOCK_KEY};
use crate::storage::namespace::{active_generation, active_pointer, allocate_generation, read_info, NamespaceInfo};
use crate::storage::{clear_range, prefix_successor, KeyRange, StorageBackend, WriteBatch};
use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

const MAX_WRITE_ATTEMPTS: usize = 3;

/// Shared cancellation switch, polled between documents.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for one indexing run.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Rebuild everything into a new generation
    pub full: bool,
    /// Changed paths for an incremental run; ignored when `full` is set
    pub paths: Vec<String>,
    pub cancel: CancelFlag,
}

impl IndexOptions {
    pub fn full() -> Self {
        IndexOptions {
            full: true,
            ..Default::default()
        }
    }

    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IndexOptions {
            full: false,
            paths: paths.into_iter().map(Into::into).collect(),
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDocument {
    pub path: String,
    pub reason: SkipReason,
}

/// Outcome of an indexing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    /// Generation the run wrote into
    pub generation: u64,
    pub indexed: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub skipped: Vec<SkippedDocument>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

enum Outcome {
    Indexed,
    Unchanged,
    Deleted,
    Missing,
    Skipped(SkipReason),
}

pub(crate) fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Every key/value a record owns inside one generation: the primary record,
/// both sort directions for each sortable field, and back-references.
pub(crate) fn record_entries(
    generation: u64,
    collection: &CollectionType,
    record: &DocumentRecord,
) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StorageError> {
    let mut entries = BTreeMap::new();
    entries.insert(
        keys::doc_key(generation, &record.collection, &record.path),
        record.to_bytes()?,
    );

    for field in collection.sortable_fields() {
        let value = record.fields.get(&field.name);
        for descending in [false, true] {
            entries.insert(
                keys::sort_key(generation, &collection.name, &field.name, descending, value, &record.path),
                record.path.clone().into_bytes(),
            );
        }
    }

    let mut references = Vec::new();
    for (name, value) in &record.fields {
        value.references(name, &mut references);
    }
    for (field, target) in references {
        let Some(target_collection) = &target.collection else {
            continue;
        };
        let source = RefSource {
            collection: record.collection.clone(),
            path: record.path.clone(),
            field,
        };
        entries.insert(
            keys::ref_key(generation, target_collection, &target.path, &source),
            Vec::new(),
        );
    }
    Ok(entries)
}

/// Runs indexing against one storage backend.
pub struct Indexer<'a> {
    graph: &'a TypeGraph,
    storage: &'a dyn StorageBackend,
    parser: &'a dyn DocumentParser,
    config: &'a DatabaseConfig,
    path_locks: &'a PathLocks,
}

impl<'a> Indexer<'a> {
    pub fn new(
        graph: &'a TypeGraph,
        storage: &'a dyn StorageBackend,
        parser: &'a dyn DocumentParser,
        config: &'a DatabaseConfig,
        path_locks: &'a PathLocks,
    ) -> Self {
        Indexer {
            graph,
            storage,
            parser,
            config,
            path_locks,
        }
    }

    pub fn run(&self, source: &dyn ContentSource, options: &IndexOptions) -> Result<IndexReport, IndexError> {
        let started = Instant::now();
        let mut report = if options.full {
            self.rebuild(source, options)?
        } else {
            self.incremental(source, options)?
        };
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(report)
    }

    /// Read, parse and normalize one document. `Err` is a per-document skip.
    fn load(
        &self,
        collection: &CollectionType,
        path: &str,
        bytes: &[u8],
        warnings: &mut Vec<String>,
    ) -> Result<DocumentRecord, SkipReason> {
        let raw = self
            .parser
            .parse(path, bytes)
            .map_err(|e| SkipReason::ParseFailure { message: e.message })?;
        let normalized = normalize::normalize_document(
            self.graph,
            collection,
            path,
            &raw,
            content_hash(bytes),
            self.config.template_policy,
        )?;
        warnings.extend(normalized.warnings);
        Ok(normalized.record)
    }

    // ── Full rebuild ─────────────────────────────────────────────────

    fn rebuild(&self, source: &dyn ContentSource, options: &IndexOptions) -> Result<IndexReport, IndexError> {
        let ttl = self.config.lock_ttl_secs;
        let heartbeat = Heartbeat::new(self.storage, ttl, lock::acquire(self.storage, ttl)?);
        let prepared = active_pointer(self.storage).and_then(|(active, active_bytes)| {
            let shadow = allocate_generation(self.storage, active)?;
            Ok((active, active_bytes, shadow))
        });
        let (active, active_bytes, shadow) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.release(&heartbeat);
                return Err(e.into());
            }
        };
        log::info!(
            "Full rebuild of generation {shadow} started (active: {active:?}, lock {})",
            heartbeat.owner()
        );

        match self.build_generation(source, options, active, shadow, &heartbeat) {
            Ok(mut report) => {
                let mut swap = WriteBatch::new();
                swap.put(ACTIVE_KEY, shadow.to_string());
                swap.delete(LOCK_KEY);
                swap.expect(ACTIVE_KEY, active_bytes);
                swap.expect(LOCK_KEY, Some(heartbeat.bytes()));
                if let Err(e) = self.storage.write(swap) {
                    let err = match e {
                        StorageError::Conflict { key } if key.as_bytes() == LOCK_KEY => IndexError::LockLost {
                            owner: heartbeat.owner(),
                        },
                        other => other.into(),
                    };
                    log::warn!("Generation {shadow} was not swapped in: {err}");
                    self.abandon(shadow, &heartbeat);
                    return Err(err);
                }
                log::info!(
                    "Generation {shadow} is active: {} indexed, {} skipped",
                    report.indexed,
                    report.skipped.len()
                );
                report.generation = shadow;
                Ok(report)
            }
            Err(e) => {
                match &e {
                    IndexError::Cancelled => log::info!("Full rebuild of generation {shadow} cancelled"),
                    other => log::warn!("Full rebuild of generation {shadow} failed: {other}"),
                }
                self.abandon(shadow, &heartbeat);
                Err(e)
            }
        }
    }

    fn build_generation(
        &self,
        source: &dyn ContentSource,
        options: &IndexOptions,
        active: Option<u64>,
        shadow: u64,
        heartbeat: &Heartbeat<'_>,
    ) -> Result<IndexReport, IndexError> {
        // Readers may still hold the generation the last swap retired.
        let previous = match active {
            Some(generation) => read_info(self.storage, generation)?.and_then(|info| info.previous),
            None => None,
        };
        let keep: Vec<u64> = active.into_iter().chain(previous).chain([shadow]).collect();
        self.clear_inactive(&keep)?;

        let mut work: Vec<(&CollectionType, String)> = Vec::new();
        for collection in self.graph.collections() {
            if options.cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            for path in source.list(&collection.path)? {
                let owner = self.graph.collection_for_path(&path);
                if owner.map_or(false, |c| c.name == collection.name) {
                    work.push((collection, path));
                }
            }
        }

        let index_one = |(collection, path): &(&CollectionType, String)| {
            if options.cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            heartbeat.beat()?;
            self.write_fresh(source, shadow, collection, path)
        };
        let outcomes: Vec<(Outcome, Vec<String>)> = if self.config.parallel {
            work.par_iter().map(index_one).collect::<Result<_, _>>()?
        } else {
            work.iter().map(index_one).collect::<Result<_, _>>()?
        };

        if options.cancel.is_cancelled() {
            return Err(IndexError::Cancelled);
        }

        let mut report = IndexReport::default();
        for ((_, path), (outcome, warnings)) in work.iter().zip(outcomes) {
            report.warnings.extend(warnings);
            match outcome {
                Outcome::Indexed => report.indexed += 1,
                Outcome::Skipped(reason) => report.skipped.push(SkippedDocument {
                    path: path.clone(),
                    reason,
                }),
                Outcome::Unchanged | Outcome::Deleted | Outcome::Missing => {}
            }
        }

        let info = NamespaceInfo {
            generation: shadow,
            schema_version: self.graph.version().to_string(),
            sdl: self.graph.to_sdl(),
            previous: active,
        };
        self.storage.put(&keys::info_key(shadow), &info.to_bytes()?)?;
        Ok(report)
    }

    /// Index one document into a generation nobody reads yet.
    fn write_fresh(
        &self,
        source: &dyn ContentSource,
        generation: u64,
        collection: &CollectionType,
        path: &str,
    ) -> Result<(Outcome, Vec<String>), IndexError> {
        let mut warnings = Vec::new();
        let bytes = match source.get(path) {
            Ok(bytes) => bytes,
            Err(SourceError::NotFound { .. }) => {
                log::warn!("{path} was listed but could not be found");
                warnings.push(format!("{path}: listed by the content source but not found"));
                return Ok((Outcome::Missing, warnings));
            }
            Err(e) => return Ok((self.skip(path, SkipReason::Unreadable { message: e.to_string() }), warnings)),
        };
        let record = match self.load(collection, path, &bytes, &mut warnings) {
            Ok(record) => record,
            Err(reason) => return Ok((self.skip(path, reason), warnings)),
        };

        let mut batch = WriteBatch::new();
        for (key, value) in record_entries(generation, collection, &record)? {
            batch.put(key, value);
        }
        self.storage.write(batch)?;
        log::debug!("Indexed {path} as {}.{}", collection.name, record.template);
        Ok((Outcome::Indexed, warnings))
    }

    /// Remove every generation not in `keep`: generations retired two or
    /// more swaps ago and leftovers from abandoned rebuilds.
    fn clear_inactive(&self, keep: &[u64]) -> Result<(), StorageError> {
        let all = KeyRange::prefix(b"ns/".to_vec());
        let mut keep = keep.to_vec();
        keep.sort_unstable();
        keep.dedup();

        let mut removed = 0;
        let mut start = all.start.clone();
        for generation in keep {
            let prefix = keys::ns_prefix(generation);
            removed += clear_range(self.storage, &KeyRange::new(start, Some(prefix.clone())))?;
            start = prefix_successor(&prefix).unwrap_or_default();
        }
        removed += clear_range(self.storage, &KeyRange::new(start, all.end.clone()))?;
        if removed > 0 {
            log::debug!("Cleared {removed} entries from inactive generations");
        }
        Ok(())
    }

    /// Drop a generation that will never be swapped in, unless it somehow
    /// is the active one.
    fn abandon(&self, shadow: u64, heartbeat: &Heartbeat<'_>) {
        match active_generation(self.storage) {
            Ok(Some(active)) if active == shadow => {
                log::warn!("Not clearing generation {shadow}: it is the active generation");
            }
            Ok(_) => {
                if let Err(e) = clear_range(self.storage, &KeyRange::prefix(keys::ns_prefix(shadow))) {
                    log::warn!("Could not clear abandoned generation {shadow}: {e}");
                }
            }
            Err(e) => log::warn!("Not clearing generation {shadow}, active pointer unreadable: {e}"),
        }
        self.release(heartbeat);
    }

    fn release(&self, heartbeat: &Heartbeat<'_>) {
        if let Err(e) = heartbeat.release() {
            log::warn!("Could not release rebuild lock {}: {e}", heartbeat.owner());
        }
    }

    fn skip(&self, path: &str, reason: SkipReason) -> Outcome {
        log::warn!("Skipping {path}: {reason}");
        Outcome::Skipped(reason)
    }

    // ── Incremental ──────────────────────────────────────────────────

    fn incremental(&self, source: &dyn ContentSource, options: &IndexOptions) -> Result<IndexReport, IndexError> {
        if let Some(held) = lock::live_lock(self.storage, self.config.lock_ttl_secs)? {
            return Err(IndexError::RebuildInProgress {
                owner: held.owner,
                since: held.acquired_at.to_rfc3339(),
            });
        }

        let (active, _) = active_pointer(self.storage)?;
        let info = match active {
            Some(generation) => read_info(self.storage, generation)?,
            None => None,
        };
        let generation = match info {
            Some(info) if info.schema_version == self.graph.version() => info.generation,
            other => {
                return Err(IndexError::SchemaMismatch {
                    expected: self.graph.version().to_string(),
                    found: other.map(|i| i.schema_version),
                })
            }
        };

        let mut report = IndexReport {
            generation,
            ..Default::default()
        };
        let mut seen = BTreeSet::new();
        for path in &options.paths {
            if !seen.insert(path.as_str()) {
                continue;
            }
            if options.cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            let Some(collection) = self.graph.collection_for_path(path) else {
                report
                    .warnings
                    .push(format!("{path}: no collection matches this path"));
                continue;
            };

            let _guard = self.path_locks.lock(&collection.name, path);
            let outcome = self.update_in_place(source, generation, collection, path, &mut report.warnings)?;
            match outcome {
                Outcome::Indexed => report.indexed += 1,
                Outcome::Unchanged => report.unchanged += 1,
                Outcome::Deleted => report.deleted += 1,
                Outcome::Missing => report
                    .warnings
                    .push(format!("{path}: not found in the content source and not indexed")),
                Outcome::Skipped(reason) => report.skipped.push(SkippedDocument {
                    path: path.clone(),
                    reason,
                }),
            }
        }
        Ok(report)
    }

    /// Re-index one path inside the active generation. The batch is guarded
    /// on the record it replaces and retried when another writer got there
    /// first.
    fn update_in_place(
        &self,
        source: &dyn ContentSource,
        generation: u64,
        collection: &CollectionType,
        path: &str,
        warnings: &mut Vec<String>,
    ) -> Result<Outcome, IndexError> {
        let doc_key = keys::doc_key(generation, &collection.name, path);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let old_bytes = self.storage.get(&doc_key)?;
            let old_entries = match &old_bytes {
                Some(bytes) => {
                    let old = DocumentRecord::from_bytes(&doc_key, bytes)?;
                    Some((old.content_hash.clone(), record_entries(generation, collection, &old)?))
                }
                None => None,
            };

            let mut doc_warnings = Vec::new();
            let (outcome, new_entries) = match source.get(path) {
                Err(SourceError::NotFound { .. }) if old_entries.is_some() => (Outcome::Deleted, BTreeMap::new()),
                Err(SourceError::NotFound { .. }) => return Ok(Outcome::Missing),
                Err(e) => {
                    return Ok(self.skip(path, SkipReason::Unreadable { message: e.to_string() }));
                }
                Ok(bytes) => {
                    let unchanged = old_entries
                        .as_ref()
                        .map_or(false, |(hash, _)| *hash == content_hash(&bytes));
                    if unchanged {
                        return Ok(Outcome::Unchanged);
                    }
                    match self.load(collection, path, &bytes, &mut doc_warnings) {
                        Ok(record) => (Outcome::Indexed, record_entries(generation, collection, &record)?),
                        Err(reason) => (self.skip(path, reason), BTreeMap::new()),
                    }
                }
            };

            let mut batch = WriteBatch::new();
            if let Some((_, old)) = &old_entries {
                for key in old.keys().filter(|k| !new_entries.contains_key(*k)) {
                    batch.delete(key.clone());
                }
            }
            for (key, value) in new_entries {
                batch.put(key, value);
            }
            if batch.is_empty() {
                warnings.extend(doc_warnings);
                return Ok(outcome);
            }
            batch.expect(doc_key.clone(), old_bytes);
            // The generation must still be the active one.
            batch.expect(ACTIVE_KEY, Some(generation.to_string().into_bytes()));

            match self.storage.write(batch) {
                Ok(()) => {
                    log::debug!("Updated {path} in generation {generation}");
                    warnings.extend(doc_warnings);
                    return Ok(outcome);
                }
                Err(StorageError::Conflict { key }) if attempt < MAX_WRITE_ATTEMPTS && key.as_bytes() != ACTIVE_KEY => {
                    log::debug!("Write conflict on {path}, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
