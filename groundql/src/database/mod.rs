//! The main entry point: one compiled graph, one storage backend.

use crate::config::DatabaseConfig;
use crate::error::{IndexError, ResolveError, StorageError};
use crate::graph::TypeGraph;
use crate::indexer::{IndexOptions, IndexReport, Indexer, PathLocks};
use crate::parser::{DocumentParser, FrontMatterParser};
use crate::resolver::{QueryRequest, QueryResult, Resolver};
use crate::source::ContentSource;
use crate::storage::keys::RefSource;
use crate::storage::namespace::{active_generation, active_info, NamespaceInfo};
use crate::storage::StorageBackend;
use std::sync::Arc;

/// Indexes content into a storage backend and answers queries against it.
///
/// A `Database` is cheap to share behind an `Arc`; indexing and resolving
/// may run concurrently from different threads.
pub struct Database {
    graph: Arc<TypeGraph>,
    storage: Arc<dyn StorageBackend>,
    parser: Arc<dyn DocumentParser>,
    config: DatabaseConfig,
    path_locks: PathLocks,
}

impl Database {
    /// Uses the front-matter parser and default configuration.
    pub fn new(graph: impl Into<Arc<TypeGraph>>, storage: Arc<dyn StorageBackend>) -> Self {
        Database {
            graph: graph.into(),
            storage,
            parser: Arc::new(FrontMatterParser::new()),
            config: DatabaseConfig::default(),
            path_locks: PathLocks::new(),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn DocumentParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_config(mut self, config: DatabaseConfig) -> Self {
        self.config = config;
        self
    }

    pub fn graph(&self) -> &TypeGraph {
        &self.graph
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn storage(&self) -> &dyn StorageBackend {
        &*self.storage
    }

    /// Run a full rebuild or an incremental update from `source`.
    pub fn index(&self, source: &dyn ContentSource, options: &IndexOptions) -> Result<IndexReport, IndexError> {
        let report = Indexer::new(
            &self.graph,
            &*self.storage,
            &*self.parser,
            &self.config,
            &self.path_locks,
        )
        .run(source, options)?;
        log::info!(
            "Index run finished: generation {}, {} indexed, {} unchanged, {} deleted, {} skipped in {}ms",
            report.generation,
            report.indexed,
            report.unchanged,
            report.deleted,
            report.skipped.len(),
            report.duration_ms
        );
        Ok(report)
    }

    pub fn resolve(&self, request: &QueryRequest) -> Result<QueryResult, ResolveError> {
        self.resolver().resolve(request)
    }

    pub fn referenced_by(&self, collection: &str, path: &str) -> Result<Vec<RefSource>, ResolveError> {
        self.resolver().referenced_by(collection, path)
    }

    /// Schema version and SDL installed with the active generation.
    pub fn stored_schema(&self) -> Result<Option<NamespaceInfo>, StorageError> {
        active_info(&*self.storage)
    }

    pub fn active_generation(&self) -> Result<Option<u64>, StorageError> {
        active_generation(&*self.storage)
    }

    /// Whether the active generation was built from a different graph
    /// version (or nothing is indexed yet).
    pub fn needs_rebuild(&self) -> Result<bool, StorageError> {
        Ok(self
            .stored_schema()?
            .map_or(true, |info| info.schema_version != self.graph.version()))
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.graph, &*self.storage, &self.config)
    }
}
