//! Shared domain enumerations aligned with persisted values.

use serde::{Deserialize, Serialize};

/// One lookup strategy in the resolver's ordered chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Cache,
    Index,
    Fallback,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Cache, Tier::Index, Tier::Fallback];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Cache => "cache",
            Tier::Index => "index",
            Tier::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Uploading,
    Completed,
    Abandoned,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Uploading => "uploading",
            TaskState::Completed => "completed",
            TaskState::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Abandoned)
    }
}

impl TryFrom<&str> for TaskState {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(TaskState::Pending),
            "uploading" => Ok(TaskState::Uploading),
            "completed" => Ok(TaskState::Completed),
            "abandoned" => Ok(TaskState::Abandoned),
            _ => Err(()),
        }
    }
}

/// Lifecycle of the local copy of an offloaded resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalState {
    NotOffloaded,
    PendingDeletion,
    Deleted,
}

impl LocalState {
    pub fn as_str(self) -> &'static str {
        match self {
            LocalState::NotOffloaded => "not_offloaded",
            LocalState::PendingDeletion => "pending_deletion",
            LocalState::Deleted => "deleted",
        }
    }
}

impl TryFrom<&str> for LocalState {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "not_offloaded" => Ok(LocalState::NotOffloaded),
            "pending_deletion" => Ok(LocalState::PendingDeletion),
            "deleted" => Ok(LocalState::Deleted),
            _ => Err(()),
        }
    }
}

/// Classification of a failed upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadErrorKind {
    Timeout,
    SizeLimit,
    Auth,
    RateLimit,
    Transient,
    Fatal,
}

impl UploadErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadErrorKind::Timeout => "timeout",
            UploadErrorKind::SizeLimit => "size_limit",
            UploadErrorKind::Auth => "auth",
            UploadErrorKind::RateLimit => "rate_limit",
            UploadErrorKind::Transient => "transient",
            UploadErrorKind::Fatal => "fatal",
        }
    }

    /// Whether another attempt can possibly succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            UploadErrorKind::Timeout | UploadErrorKind::RateLimit | UploadErrorKind::Transient
        )
    }
}

impl TryFrom<&str> for UploadErrorKind {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "timeout" => Ok(UploadErrorKind::Timeout),
            "size_limit" => Ok(UploadErrorKind::SizeLimit),
            "auth" => Ok(UploadErrorKind::Auth),
            "rate_limit" => Ok(UploadErrorKind::RateLimit),
            "transient" => Ok(UploadErrorKind::Transient),
            "fatal" => Ok(UploadErrorKind::Fatal),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_round_trips_through_storage_names() {
        for state in [
            TaskState::Pending,
            TaskState::Uploading,
            TaskState::Completed,
            TaskState::Abandoned,
        ] {
            assert_eq!(TaskState::try_from(state.as_str()), Ok(state));
        }
        assert!(TaskState::try_from("Done").is_err());
    }

    #[test]
    fn only_network_class_failures_are_retryable() {
        assert!(UploadErrorKind::Timeout.is_retryable());
        assert!(UploadErrorKind::RateLimit.is_retryable());
        assert!(UploadErrorKind::Transient.is_retryable());
        assert!(!UploadErrorKind::Auth.is_retryable());
        assert!(!UploadErrorKind::SizeLimit.is_retryable());
        assert!(!UploadErrorKind::Fatal.is_retryable());
    }
}
