use super::ContentSource;
use crate::error::SourceError;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Content stored as files under a root directory.
#[derive(Debug, Clone)]
pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsSource { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SourceError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(SourceError::Other(format!(
                "Path '{path}' is not relative to the content root"
            )));
        }
        Ok(self.root.join(relative))
    }

    fn io_error(path: &str, source: std::io::Error) -> SourceError {
        if source.kind() == ErrorKind::NotFound {
            SourceError::NotFound {
                path: path.to_string(),
            }
        } else {
            SourceError::Io {
                path: path.to_string(),
                source,
            }
        }
    }
}

impl ContentSource for FsSource {
    fn get(&self, path: &str) -> Result<Vec<u8>, SourceError> {
        let file = self.resolve(path)?;
        std::fs::read(&file).map_err(|e| Self::io_error(path, e))
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), SourceError> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Self::io_error(path, e))?;
        }
        std::fs::write(&file, bytes).map_err(|e| Self::io_error(path, e))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, SourceError> {
        let prefix = prefix.trim_matches('/');
        let base = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix)?
        };
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let pattern = format!("{}/**/*", glob::Pattern::escape(&base.to_string_lossy()));
        let entries = glob::glob(&pattern)
            .map_err(|e| SourceError::Other(format!("Glob error: {e}")))?;

        let mut paths = Vec::new();
        for entry in entries {
            let file = entry.map_err(|e| SourceError::Other(format!("Glob error: {e}")))?;
            if !file.is_file() {
                continue;
            }
            let relative = file
                .strip_prefix(&self.root)
                .unwrap_or(&file)
                .to_string_lossy()
                .replace('\\', "/");
            paths.push(relative);
        }
        paths.sort();
        Ok(paths)
    }

    fn delete(&self, path: &str) -> Result<(), SourceError> {
        let file = self.resolve(path)?;
        match std::fs::remove_file(&file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_source_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FsSource::new(tmp.path());

        source.put("posts/2024/b.md", b"b").unwrap();
        source.put("posts/a.md", b"a").unwrap();
        source.put("authors/jane.md", b"jane").unwrap();

        assert_eq!(
            source.list("posts").unwrap(),
            vec!["posts/2024/b.md", "posts/a.md"]
        );
        assert_eq!(source.get("posts/a.md").unwrap(), b"a".to_vec());
        assert_eq!(source.list("").unwrap().len(), 3);

        source.delete("posts/a.md").unwrap();
        source.delete("posts/a.md").unwrap();
        assert!(matches!(
            source.get("posts/a.md"),
            Err(SourceError::NotFound { .. })
        ));
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FsSource::new(tmp.path());
        assert!(source.list("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FsSource::new(tmp.path());
        assert!(matches!(
            source.get("../etc/passwd"),
            Err(SourceError::Other(_))
        ));
    }
}
