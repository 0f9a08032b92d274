//! Error types for book-dl
//!
//! Two layers of failure exist in this crate:
//! - [`Error`] is returned directly to callers of the manager API (unknown id,
//!   lost take race, illegal transition, configuration problems).
//! - [`FailureCause`](crate::types::FailureCause) describes why a *download*
//!   failed and is stored in its snapshot. Transfer failures never surface as
//!   an [`Error`] from a caller-facing operation.

use crate::types::{DownloadId, Status};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for book-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for book-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "staging_dir")
        key: Option<String>,
    },

    /// Download-related error returned by a manager operation
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error while building the HTTP client
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new downloads
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,
}

/// Errors produced by per-download operations (`pause`, `resume`, `take`, ...)
#[derive(Debug, Error)]
pub enum DownloadError {
    /// No download with this identifier is tracked
    #[error("download {id} not found")]
    NotFound {
        /// The identifier that was not found
        id: DownloadId,
    },

    /// Another caller already took the completed file
    #[error("download {id} has already been taken")]
    AlreadyTaken {
        /// The identifier whose file was already taken
        id: DownloadId,
    },

    /// The operation is not valid in the download's current state
    #[error("cannot {operation} download {id} in state {current}")]
    IllegalStateTransition {
        /// The download that is in an invalid state for the operation
        id: DownloadId,
        /// The operation that was attempted (e.g., "resume", "take")
        operation: &'static str,
        /// The state that prevents the operation
        current: Status,
    },

    /// The request URL is not an absolute http(s) URL
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl {
        /// The URL as submitted
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Moving the completed file to its destination failed
    ///
    /// The staging file has been deleted and the download is spent.
    #[error("failed to take download {id} into {destination}: {reason}")]
    TakeFailed {
        /// The download whose take failed
        id: DownloadId,
        /// The destination the caller asked for
        destination: PathBuf,
        /// The underlying failure
        reason: String,
    },
}

impl Error {
    /// Machine-readable error code, stable across releases
    ///
    /// Intended for the UI/controller layer that maps errors to user messages.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Download(DownloadError::NotFound { .. }) => "not_found",
            Error::Download(DownloadError::AlreadyTaken { .. }) => "already_taken",
            Error::Download(DownloadError::IllegalStateTransition { .. }) => {
                "illegal_state_transition"
            }
            Error::Download(DownloadError::InvalidUrl { .. }) => "invalid_url",
            Error::Download(DownloadError::TakeFailed { .. }) => "take_failed",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::ShuttingDown => "shutting_down",
        }
    }

    pub(crate) fn not_found(id: &DownloadId) -> Self {
        Error::Download(DownloadError::NotFound { id: id.clone() })
    }

    pub(crate) fn illegal(id: &DownloadId, operation: &'static str, current: Status) -> Self {
        Error::Download(DownloadError::IllegalStateTransition {
            id: id.clone(),
            operation,
            current,
        })
    }

    /// True if this is the error a losing `take` caller receives
    pub fn is_already_taken(&self) -> bool {
        matches!(self, Error::Download(DownloadError::AlreadyTaken { .. }))
    }

    /// True if the operation referenced an unknown identifier
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Download(DownloadError::NotFound { .. }))
    }
}
