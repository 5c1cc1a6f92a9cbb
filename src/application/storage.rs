//! Remote object storage boundary.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::types::UploadErrorKind;

/// Classified failure from an upload attempt.
#[derive(Debug, Clone, Error)]
#[error("upload failed ({}): {message}", .kind.as_str())]
pub struct StorageError {
    kind: UploadErrorKind,
    message: String,
}

impl StorageError {
    pub fn new(kind: UploadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            UploadErrorKind::Timeout,
            format!("upload did not finish within {}s", after.as_secs()),
        )
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(UploadErrorKind::Fatal, message)
    }

    pub fn kind(&self) -> UploadErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[async_trait]
pub trait ObjectStorageClient: Send + Sync {
    /// Upload the file at `local_path` as `remote_name`, returning the object's public URL.
    ///
    /// Implementations should give up once `timeout` elapses.
    async fn upload(
        &self,
        local_path: &Path,
        remote_name: &str,
        timeout: Duration,
    ) -> Result<String, StorageError>;
}
