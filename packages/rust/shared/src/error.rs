//! Error types for codevec.
//!
//! Library crates use [`CodevecError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Only [`CodevecError::Config`] is fatal to a run. Every other variant is
//! unit-scoped: caught at the worker boundary, classified into the ledger,
//! and never propagated past the dispatcher.

use std::path::PathBuf;

/// Top-level error type for all codevec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodevecError {
    /// Configuration loading or validation error. Aborts before unit work.
    #[error("config error: {message}")]
    Config { message: String },

    /// Extraction subprocess failed, timed out, or produced no output.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// No record lines survived the structural filter.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Normalization subprocess error. Retryable up to the configured bound.
    #[error("preprocess error: {0}")]
    Preprocess(String),

    /// A stage exceeded its wall-clock budget and exited on SIGTERM.
    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: String, secs: u64 },

    /// A stage subprocess ignored graceful termination and was killed.
    #[error("{stage} ignored termination and was killed")]
    Killed { stage: String },

    /// Unclassified unit-scoped failure.
    #[error("failure: {0}")]
    Failure(String),

    /// Vocabulary segment lifecycle error.
    #[error("segment error: {0}")]
    Segment(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CodevecError>;

impl CodevecError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a timeout error for a named stage.
    pub fn timeout(stage: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            stage: stage.into(),
            secs,
        }
    }

    /// Create a killed error for a named stage.
    pub fn killed(stage: impl Into<String>) -> Self {
        Self::Killed {
            stage: stage.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error aborts the whole run rather than a single unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}
