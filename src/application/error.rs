use thiserror::Error;

use crate::{
    application::{repos::RepoError, storage::StorageError},
    config::LoadError,
    domain::error::ValidationError,
    infra::error::InfraError,
};

/// Failures surfaced by the resolver. A miss is not an error.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("lookup store failed: {0}")]
    Store(#[from] RepoError),
}

#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("offload payload rejected: {message}")]
    InvalidPayload { message: String },
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("local storage error: {0}")]
    Local(#[from] std::io::Error),
}

impl OffloadError {
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Offload(#[from] OffloadError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit code for the command line.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) | AppError::Validation(_) => 2,
            AppError::Resolve(ResolveError::Validation(_)) => 2,
            AppError::Offload(OffloadError::InvalidPayload { .. }) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_exit_with_two() {
        let err = AppError::from(ResolveError::from(ValidationError::Empty));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(AppError::validation("bad").exit_code(), 2);
        assert_eq!(AppError::from(RepoError::Timeout).exit_code(), 1);
    }
}
