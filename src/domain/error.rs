use thiserror::Error;

/// Reasons a raw key cannot be turned into a lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("lookup key is empty")]
    Empty,
    #[error("lookup key exceeds {max} bytes")]
    TooLong { max: usize },
    #[error("lookup key contains control characters")]
    ControlCharacter,
    #[error("lookup key could not be parsed: {reason}")]
    Unparseable { reason: String },
}

impl ValidationError {
    pub fn unparseable(reason: impl Into<String>) -> Self {
        Self::Unparseable {
            reason: reason.into(),
        }
    }
}
