//! Error types for PaperPipe.
//!
//! Library crates return [`PaperPipeError`] via `thiserror`.
//! The CLI wraps it with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all PaperPipe operations.
#[derive(Debug, thiserror::Error)]
pub enum PaperPipeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to a remote service.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed payload from a remote service (feed, JSON, ...).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A download that still failed after every retry attempt.
    #[error("failed to download {url} after {attempts} attempt(s): {source}")]
    Download {
        url: String,
        attempts: u32,
        #[source]
        source: Box<PaperPipeError>,
    },

    /// PDF text extraction error.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Embedding backend error (request, response shape, missing key).
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid input (non-positive limits, missing required target, ...).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PaperPipeError>;

impl PaperPipeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap the last attempt's error once retries are exhausted.
    pub fn download(url: impl Into<String>, attempts: u32, source: PaperPipeError) -> Self {
        Self::Download {
            url: url.into(),
            attempts,
            source: Box::new(source),
        }
    }
}
