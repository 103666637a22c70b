//! Local-disk fetcher for files already staged into the sandbox working directory

use super::FileFetcher;
use crate::error::FetchError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};

/// Reads `working_dir/<location>`; locations may not escape the directory
#[derive(Debug, Clone)]
pub struct LocalFileFetcher {
    root: PathBuf,
}

impl LocalFileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a location onto a path below the root
    pub fn resolve(&self, location: &str) -> Result<PathBuf, FetchError> {
        let invalid = |reason: &str| FetchError::InvalidLocation {
            location: location.to_string(),
            reason: reason.to_string(),
        };

        if location.is_empty() {
            return Err(invalid("location is empty"));
        }
        if location.bytes().any(|b| b == 0) {
            return Err(invalid("location contains a null byte"));
        }

        let relative = Path::new(location);
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => return Err(invalid("location must not contain `..`")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("location must be relative"))
                }
            }
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl FileFetcher for LocalFileFetcher {
    async fn fetch(&self, location: &str) -> Result<Bytes, FetchError> {
        let path = self.resolve(location)?;
        tracing::debug!(location = %location, path = %path.display(), "Reading staged file");

        let data = tokio::fs::read(&path).await.map_err(|source| FetchError::Io {
            location: location.to_string(),
            source,
        })?;
        Ok(Bytes::from(data))
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        std::fs::write(dir.path().join("uploads/report.txt"), b"quarterly").unwrap();

        let fetcher = LocalFileFetcher::new(dir.path());
        let bytes = fetcher.fetch("uploads/report.txt").await.unwrap();
        assert_eq!(&bytes[..], b"quarterly");
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = LocalFileFetcher::new(dir.path());
        let err = fetcher.fetch("nope.bin").await.unwrap_err();
        assert!(matches!(err, FetchError::Io { .. }));
    }

    #[test]
    fn test_rejects_escaping_locations() {
        let fetcher = LocalFileFetcher::new("/srv/scriptbox");
        assert!(fetcher.resolve("../etc/passwd").is_err());
        assert!(fetcher.resolve("a/../../b").is_err());
        assert!(fetcher.resolve("/etc/passwd").is_err());
        assert!(fetcher.resolve("").is_err());
        assert_eq!(
            fetcher.resolve("./a/b.txt").unwrap(),
            PathBuf::from("/srv/scriptbox/./a/b.txt")
        );
    }
}
