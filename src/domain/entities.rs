//! Domain entities mirrored from persistent storage.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::types::{LocalState, TaskState, UploadErrorKind};

/// Internal numeric handle a key resolves to.
pub type Identity = i64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LookupEntryRecord {
    pub id: i64,
    pub key_hash: String,
    pub key_prefix: String,
    pub identity: Identity,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Watchlist item for a key that keeps failing or running slow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub key: String,
    pub failure_count: u32,
    pub first_failure_at: OffsetDateTime,
    pub last_failure_at: OffsetDateTime,
}

/// What an offload task uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadPayload {
    /// Path relative to the local uploads root.
    pub local_path: String,
    /// Object name at the remote store.
    pub remote_name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OffloadTaskRecord {
    pub id: Uuid,
    pub identity: Identity,
    pub payload: OffloadPayload,
    pub state: TaskState,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub next_attempt_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub last_error: Option<String>,
    pub last_error_kind: Option<UploadErrorKind>,
    pub remote_url: Option<String>,
    pub cancel_requested: bool,
    pub local_state: LocalState,
    pub completed_at: Option<OffsetDateTime>,
    pub processing_signalled_at: Option<OffsetDateTime>,
    pub local_deleted_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteObjectRecord {
    pub identity: Identity,
    pub remote_url: String,
    pub uploaded_at: OffsetDateTime,
}
