//! Core error model.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error raised by core primitives.
///
/// Deterministic failures only (identifier parsing, version checks).
/// Storage and runtime faults are modelled by the executor crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid: unparsable UUID or blank name.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// An optimistic version check failed.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
