use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Kind of a schema compilation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaErrorKind {
    DuplicateCollection,
    DuplicateTemplate,
    DuplicateField,
    DanglingReference,
    EmptyCollection,
    AmbiguousTemplate,
    InvalidField,
    InvalidDefinition,
}

impl fmt::Display for SchemaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchemaErrorKind::DuplicateCollection => "duplicate collection",
            SchemaErrorKind::DuplicateTemplate => "duplicate template",
            SchemaErrorKind::DuplicateField => "duplicate field",
            SchemaErrorKind::DanglingReference => "dangling reference",
            SchemaErrorKind::EmptyCollection => "empty collection",
            SchemaErrorKind::AmbiguousTemplate => "ambiguous template",
            SchemaErrorKind::InvalidField => "invalid field",
            SchemaErrorKind::InvalidDefinition => "invalid definition",
        };
        f.write_str(name)
    }
}

/// A schema compilation failure. `path` is the dotted location of the
/// offending element, e.g. `posts.post.author`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Schema error ({kind}) at '{path}': {message}")]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub path: String,
    pub message: String,
}

impl SchemaError {
    pub fn new(kind: SchemaErrorKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        SchemaError {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt index entry at {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("Write conflict on key {key}")]
    Conflict { key: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Content not found: {path}")]
    NotFound { path: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Content source error: {0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot parse {path}: {message}")]
pub struct ParseError {
    pub path: String,
    pub message: String,
}

/// Why a single document was left out of the index. Recorded in the
/// `IndexReport`, never fatal to the run.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    #[error("unreadable content: {message}")]
    Unreadable { message: String },

    #[error("parse failure: {message}")]
    ParseFailure { message: String },

    #[error("template mismatch: {message}")]
    TemplateMismatch { message: String },

    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("A full rebuild is already in progress (held by {owner} since {since})")]
    RebuildInProgress { owner: String, since: String },

    #[error("Rebuild lock {owner} was taken over by another rebuild")]
    LockLost { owner: String },

    #[error("Indexing run was cancelled")]
    Cancelled,

    #[error("Active index was built for schema {found:?}, expected {expected}; a full rebuild is required")]
    SchemaMismatch {
        expected: String,
        found: Option<String>,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Unknown collection: {collection}")]
    UnknownCollection { collection: String },

    #[error("Unknown field '{field}' on {owner}")]
    UnknownField { owner: String, field: String },

    #[error("Invalid selection for '{field}': {message}")]
    InvalidSelection { field: String, message: String },

    #[error("Document not found: {collection}/{path}")]
    NotFound { collection: String, path: String },

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid sort: {0}")]
    InvalidSort(String),

    #[error("Invalid page size {size} (allowed 1..={max})")]
    InvalidPageSize { size: usize, max: usize },

    #[error("Reference '{field}' points at {target}, outside the allowed collections {allowed:?}")]
    InvalidReference {
        field: String,
        target: String,
        allowed: Vec<String>,
    },

    #[error("Active index was built for schema {found:?}, resolver uses {expected}")]
    SchemaMismatch {
        expected: String,
        found: Option<String>,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
