//! Raw content access.
//!
//! A [`ContentSource`] is supplied by the host. Paths are relative,
//! `/`-separated, and compared byte-wise.

mod fs;
mod memory;

pub use fs::FsSource;
pub use memory::MemorySource;

use crate::error::SourceError;

pub trait ContentSource: Send + Sync {
    /// Raw bytes of one document, or `SourceError::NotFound`.
    fn get(&self, path: &str) -> Result<Vec<u8>, SourceError>;

    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), SourceError>;

    /// Every path under `prefix` (a directory, without trailing slash), sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, SourceError>;

    /// Remove a document. Deleting a missing path is not an error.
    fn delete(&self, path: &str) -> Result<(), SourceError>;
}

/// Whether `path` lies under the directory `prefix`.
pub(crate) fn under_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path.strip_prefix(prefix)
        .map_or(false, |rest| rest.starts_with('/'))
}
