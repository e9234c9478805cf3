use super::{under_prefix, ContentSource};
use crate::error::SourceError;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Content held in memory, keyed by path. Useful for tests and for hosts
/// that already have their documents loaded.
#[derive(Debug, Default)]
pub struct MemorySource {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source from `(path, content)` pairs.
    pub fn from_files<I, P, B>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, B)>,
        P: Into<String>,
        B: Into<Vec<u8>>,
    {
        let files = files
            .into_iter()
            .map(|(path, bytes)| (path.into(), bytes.into()))
            .collect();
        MemorySource {
            files: RwLock::new(files),
        }
    }
}

impl ContentSource for MemorySource {
    fn get(&self, path: &str) -> Result<Vec<u8>, SourceError> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| SourceError::NotFound {
                path: path.to_string(),
            })
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), SourceError> {
        self.files.write().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, SourceError> {
        Ok(self
            .files
            .read()
            .keys()
            .filter(|path| under_prefix(path, prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, path: &str) -> Result<(), SourceError> {
        self.files.write().remove(path);
        Ok(())
    }
}
