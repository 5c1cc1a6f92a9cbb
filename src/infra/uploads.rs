//! Local copies of offloadable resources.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("invalid stored path `{0}`")]
    InvalidPath(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<LocalStoreError> for std::io::Error {
    fn from(err: LocalStoreError) -> Self {
        match err {
            LocalStoreError::Io(io) => io,
            invalid @ LocalStoreError::InvalidPath(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, invalid.to_string())
            }
        }
    }
}

/// Filesystem-backed store rooted at the uploads directory.
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Initialise storage rooted at the provided directory, creating it if necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn size(&self, stored_path: &str) -> Result<u64, LocalStoreError> {
        let absolute = self.resolve(stored_path)?;
        Ok(fs::metadata(absolute).await?.len())
    }

    /// Remove the stored file. Missing files are treated as success.
    pub async fn delete(&self, stored_path: &str) -> Result<(), LocalStoreError> {
        let absolute = self.resolve(stored_path)?;
        match fs::remove_file(&absolute).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LocalStoreError::Io(err)),
        }
    }

    pub fn absolute_path(&self, stored_path: &str) -> Result<PathBuf, LocalStoreError> {
        self.resolve(stored_path)
    }

    fn resolve(&self, stored_path: &str) -> Result<PathBuf, LocalStoreError> {
        let relative = Path::new(stored_path);
        if stored_path.is_empty()
            || relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(LocalStoreError::InvalidPath(stored_path.to_string()));
        }

        Ok(self.root.join(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn size_and_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path().to_path_buf()).expect("store");
        std::fs::create_dir_all(dir.path().join("2024")).expect("mkdir");
        std::fs::write(dir.path().join("2024/a.jpg"), b"jpeg bytes").expect("seed");

        assert_eq!(store.size("2024/a.jpg").await.expect("size"), 10);

        store.delete("2024/a.jpg").await.expect("delete");
        assert!(!dir.path().join("2024/a.jpg").exists());

        store.delete("2024/a.jpg").await.expect("missing file is fine");
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path().to_path_buf()).expect("store");

        for bad in ["", "/etc/passwd", "../outside.jpg", "a/../../b"] {
            assert!(
                matches!(store.delete(bad).await, Err(LocalStoreError::InvalidPath(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
