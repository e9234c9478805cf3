//! GroundQL compiles a declarative content schema into a type graph, indexes
//! content files into a key-ordered store, and resolves structured queries
//! against the index.
//!
//! ```no_run
//! use groundql::{compile, parse_schema_str, Database, FsSource, IndexOptions, QueryRequest, Selection, SqliteBackend};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> groundql::Result<()> {
//! let schema = parse_schema_str(&std::fs::read_to_string("schema.yaml")?)?;
//! let graph = compile(&schema)?;
//! let db = Database::new(graph, Arc::new(SqliteBackend::open(Path::new("index.db"))?));
//! db.index(&FsSource::new("content"), &IndexOptions::full())?;
//! let _posts = db.resolve(&QueryRequest::list("posts", Selection::fields(["title"])))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod graph;
pub mod indexer;
pub mod parser;
pub mod record;
pub mod resolver;
pub mod schema;
pub mod source;
pub mod storage;

pub use config::{DatabaseConfig, TemplateMatchPolicy};
pub use database::Database;
pub use error::{
    Error, IndexError, ParseError, ResolveError, Result, SchemaError, SchemaErrorKind, SkipReason, SourceError,
    StorageError,
};
pub use graph::{compile, CollectionType, FieldDescriptor, FieldKind, TemplateType, TypeGraph};
pub use indexer::{CancelFlag, IndexOptions, IndexReport, SkippedDocument};
pub use parser::{DocumentParser, FrontMatterParser};
pub use record::{DocumentRecord, FieldValue};
pub use resolver::{Filter, PageInfo, QueryRequest, QueryResult, Selection, Sort, SortOrder, Warning};
pub use schema::{parse_schema, parse_schema_str, SchemaDefinition};
pub use source::{ContentSource, FsSource, MemorySource};
pub use storage::keys::RefSource;
pub use storage::{MemoryBackend, NamespaceInfo, SqliteBackend, StorageBackend};
