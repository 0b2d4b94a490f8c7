//! Error types for ctxver-core

use thiserror::Error;

/// Main error type for the ctxver-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Fragment lookup by id failed
    #[error("fragment not found: {0}")]
    FragmentNotFound(String),

    /// Malformed persisted session
    #[error("persisted session error: {0}")]
    Persist(String),

    /// A computed value failed or was cancelled
    #[error(transparent)]
    Cell(#[from] CellError),
}

/// Terminal failure of an [`AsyncCell`](crate::cell::AsyncCell).
///
/// Cloneable so every observer of a failed cell sees the same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CellError {
    /// The computation returned an error
    #[error("computation failed: {0}")]
    Failed(String),

    /// The computation panicked
    #[error("computation panicked: {0}")]
    Panicked(String),

    /// The cell was cancelled, or its job was dropped before running
    #[error("computation cancelled")]
    Cancelled,
}

/// Result type alias for ctxver-core
pub type Result<T> = std::result::Result<T, Error>;
