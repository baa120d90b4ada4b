//! Core error model.

use thiserror::Error;

/// Result type used by the core value types.
pub type CoreResult<T> = Result<T, CoreError>;

/// Validation failures for identifiers and tags.
///
/// Keep this focused on malformed values; transport and handler failures
/// have their own error types in the crates that own those seams.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. an empty kind tag).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
