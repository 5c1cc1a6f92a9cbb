//! Repository traits describing persistence adapters.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::entities::{
    Identity, LookupEntryRecord, OffloadPayload, OffloadTaskRecord, RemoteObjectRecord,
};
use crate::domain::keys::KeyHash;
use crate::domain::types::{TaskState, UploadErrorKind};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    /// Hiccups worth one immediate retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepoError::Timeout | RepoError::Unavailable(_))
    }
}

/// Outcome of the idempotent index repair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Rows that had no hash and received one.
    pub hashed: u64,
    /// Rows removed because a lower id already carried the same hash.
    pub duplicates_removed: u64,
    /// Whether the unique constraint had to be created.
    pub constraint_installed: bool,
}

#[async_trait]
pub trait LookupRepo: Send + Sync {
    async fn upsert_entry(
        &self,
        hash: &KeyHash,
        key_prefix: &str,
        identity: Identity,
    ) -> Result<(), RepoError>;

    async fn find_identity(&self, hash: &KeyHash) -> Result<Option<Identity>, RepoError>;

    /// Point lookup for many hashes in one round trip.
    async fn find_identities(
        &self,
        hashes: &[KeyHash],
    ) -> Result<HashMap<KeyHash, Identity>, RepoError>;

    async fn delete_by_identity(&self, identity: Identity) -> Result<u64, RepoError>;

    async fn scan_prefix(
        &self,
        prefix: &str,
        limit: u32,
    ) -> Result<Vec<LookupEntryRecord>, RepoError>;

    async fn repair_uniqueness(&self) -> Result<RepairReport, RepoError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogMatch {
    pub path: String,
    pub identity: Identity,
}

#[async_trait]
pub trait CatalogRepo: Send + Sync {
    /// Catalog resources whose normalized path equals one of `paths`.
    async fn find_by_paths(&self, paths: &[String]) -> Result<Vec<CatalogMatch>, RepoError>;
}

#[derive(Debug, Clone)]
pub struct NewOffloadTask {
    pub identity: Identity,
    pub payload: OffloadPayload,
    pub max_attempts: i32,
    pub next_attempt_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(Uuid),
    /// A non-terminal task already existed for the identity.
    Coalesced(Uuid),
}

impl EnqueueOutcome {
    pub fn task_id(self) -> Uuid {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Coalesced(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompleteTaskParams {
    pub id: Uuid,
    pub remote_url: String,
    pub remove_local_copy: bool,
    pub completed_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct FailTaskParams {
    pub id: Uuid,
    /// `Pending` to retry or `Abandoned`.
    pub state: TaskState,
    pub attempt_count: i32,
    pub next_attempt_at: OffsetDateTime,
    pub last_error: String,
    pub last_error_kind: Option<UploadErrorKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "task_id", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// A pending task was abandoned.
    Abandoned(Uuid),
    /// An in-flight task was flagged; its result will be discarded.
    Requested(Uuid),
    NothingToCancel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub uploading: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub pending_deletion: u64,
}

#[async_trait]
pub trait OffloadRepo: Send + Sync {
    /// Insert unless a pending or uploading task exists for the identity.
    async fn insert_task_if_absent(&self, task: NewOffloadTask)
    -> Result<EnqueueOutcome, RepoError>;

    /// Pending tasks with `next_attempt_at <= now`, oldest first.
    async fn due_tasks(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<OffloadTaskRecord>, RepoError>;

    /// Move a task from `pending` to `uploading`; `None` if another worker got there first.
    async fn claim_task(&self, id: Uuid) -> Result<Option<OffloadTaskRecord>, RepoError>;

    /// Mark an uploading task completed and persist its remote reference.
    ///
    /// Returns `None` without writing anything when the task was cancelled mid-flight.
    async fn complete_task(
        &self,
        params: CompleteTaskParams,
    ) -> Result<Option<OffloadTaskRecord>, RepoError>;

    /// Record a failed attempt on an uploading task.
    ///
    /// A task whose cancellation was requested mid-flight is abandoned with `cancelled`
    /// regardless of `params.state`.
    async fn fail_task(&self, params: FailTaskParams) -> Result<OffloadTaskRecord, RepoError>;

    async fn request_cancel(&self, identity: Identity) -> Result<CancelOutcome, RepoError>;

    /// Most recently created task for the identity.
    async fn latest_task(&self, identity: Identity)
    -> Result<Option<OffloadTaskRecord>, RepoError>;

    /// Remember the consumer's processing-complete signal on the latest live task.
    async fn record_processing_signal(
        &self,
        identity: Identity,
        at: OffsetDateTime,
    ) -> Result<Option<OffloadTaskRecord>, RepoError>;

    /// Completed tasks still holding a local copy that were either signalled or completed at
    /// or before `cutoff`, oldest completion first.
    async fn deletions_due(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<OffloadTaskRecord>, RepoError>;

    async fn mark_local_deleted(&self, id: Uuid, at: OffsetDateTime) -> Result<(), RepoError>;

    /// Put uploads orphaned by a crashed worker back to pending.
    async fn reset_stale_uploads(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError>;

    async fn find_remote_object(
        &self,
        identity: Identity,
    ) -> Result<Option<RemoteObjectRecord>, RepoError>;

    async fn list_tasks_by_state(
        &self,
        state: TaskState,
        limit: u32,
    ) -> Result<Vec<OffloadTaskRecord>, RepoError>;

    async fn count_tasks(&self) -> Result<TaskCounts, RepoError>;

    /// Delete terminal tasks last touched before `cutoff` whose local copy is settled.
    async fn purge_terminal_before(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError>;
}
