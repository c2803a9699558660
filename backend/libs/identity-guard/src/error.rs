//! Error types for the identity guard

use crate::Holder;
use thiserror::Error;

/// Result type for guard operations
pub type GuardResult<T> = Result<T, GuardError>;

/// Errors returned when acquiring a key
#[derive(Error, Debug, Clone)]
pub enum GuardError {
    /// Another operation holds the key (after waiting, in `Wait` mode)
    #[error("operation `{}` already in progress for `{key}`", holder.operation)]
    Conflict { key: String, holder: Holder },

    /// Key validation failed (empty or whitespace only)
    #[error("Invalid guard key: {0}")]
    InvalidKey(String),
}

impl GuardError {
    /// Check if the error means another operation is in flight
    pub fn is_conflict(&self) -> bool {
        matches!(self, GuardError::Conflict { .. })
    }

    /// Key the error refers to
    pub fn key(&self) -> &str {
        match self {
            GuardError::Conflict { key, .. } => key,
            GuardError::InvalidKey(key) => key,
        }
    }
}
