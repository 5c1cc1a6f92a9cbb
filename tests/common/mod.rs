#![allow(dead_code)]

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use offsite::application::context::{AppContext, Backends};
use offsite::application::storage::{ObjectStorageClient, StorageError};
use offsite::config::Settings;
use offsite::domain::types::UploadErrorKind;
use offsite::infra::memory::MemoryRepositories;
use tempfile::TempDir;

pub struct Harness {
    pub ctx: AppContext,
    pub repos: Arc<MemoryRepositories>,
    pub dir: TempDir,
}

impl Harness {
    pub fn uploads(&self) -> &Path {
        self.ctx.local.root()
    }

    /// Write a file under the uploads directory and return its relative path.
    pub fn write_upload(&self, name: &str, bytes: &[u8]) -> String {
        let path = self.uploads().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create upload parent");
        }
        std::fs::write(&path, bytes).expect("write upload");
        name.to_string()
    }

    pub fn upload_exists(&self, name: &str) -> bool {
        self.uploads().join(name).exists()
    }
}

/// Defaults tuned for tests: scratch directories and no retry delay.
pub fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::from_defaults().expect("default settings");
    settings.uploads.directory = dir.join("uploads");
    settings.janitor.log_directory = dir.join("logs");
    settings.offload.backoff = vec![Duration::ZERO];
    settings
}

pub fn harness(storage: Arc<dyn ObjectStorageClient>) -> Harness {
    harness_with(storage, |_| {})
}

pub fn harness_with(
    storage: Arc<dyn ObjectStorageClient>,
    tweak: impl FnOnce(&mut Settings),
) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let mut settings = test_settings(dir.path());
    tweak(&mut settings);
    let repos = Arc::new(MemoryRepositories::new());
    let ctx = AppContext::build(&settings, Backends::from_repositories(repos.clone(), storage))
        .expect("build context");
    Harness { ctx, repos, dir }
}

pub fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).expect("non-zero")
}

/// Accepts every upload, optionally after a delay, tracking peak concurrency.
#[derive(Default)]
pub struct RecordingStorage {
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStorageClient for RecordingStorage {
    async fn upload(
        &self,
        _local_path: &Path,
        remote_name: &str,
        _timeout: Duration,
    ) -> Result<String, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("https://cdn.example.com/{remote_name}"))
    }
}

/// Fails every upload with the same kind.
pub struct FailingStorage {
    kind: UploadErrorKind,
    calls: AtomicUsize,
}

impl FailingStorage {
    pub fn new(kind: UploadErrorKind) -> Self {
        Self {
            kind,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStorageClient for FailingStorage {
    async fn upload(
        &self,
        _local_path: &Path,
        _remote_name: &str,
        _timeout: Duration,
    ) -> Result<String, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::new(self.kind, "simulated failure"))
    }
}
