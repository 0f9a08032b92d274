//! Core types for book-dl

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique, stable identifier for a logical download (one per book or asset)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(pub String);

impl DownloadId {
    /// Create a new DownloadId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DownloadId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DownloadId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Download status
///
/// ```text
/// Queued → Started → ReceivingData → Completed
/// Queued ↘ Paused (pause before a worker slot is free)
/// Started/ReceivingData ↘ Paused → (resume) → Queued → Started
///    any non-terminal state ↘ Cancelled
///    Started/ReceivingData ↘ Failed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for a worker slot
    Queued,
    /// Worker slot acquired, transport being opened
    Started,
    /// At least one byte of the response body has been written
    ReceivingData,
    /// Stopped by the caller, bytes written so far are kept
    Paused,
    /// All bytes written and the staging file closed
    Completed,
    /// Terminated by an error, see [`DownloadSnapshot::failure_cause`]
    Failed,
    /// Terminated by the caller, staging file deleted
    Cancelled,
}

impl Status {
    /// Stable lowercase name, matching the serde representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Started => "started",
            Status::ReceivingData => "receiving_data",
            Status::Paused => "paused",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        }
    }

    /// Completed, Failed or Cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }

    /// A task currently owns the transport for this download
    pub fn is_running(&self) -> bool {
        matches!(self, Status::Started | Status::ReceivingData)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a download ended in [`Status::Failed`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// Connection refused/reset, timeout or interrupted body, after retries
    TransientNetwork {
        /// Last transport error message
        message: String,
    },
    /// The server answered with a non-2xx status
    HttpStatus {
        /// HTTP status code
        code: u16,
    },
    /// The body length did not match the advertised content length
    ContentLengthMismatch {
        /// Total bytes the server announced
        expected: u64,
        /// Total bytes actually received
        received: u64,
    },
    /// A non-transient transport failure (bad URL, TLS, protocol)
    Transport {
        /// Transport error message
        message: String,
    },
    /// Creating or writing the staging file failed
    Io {
        /// I/O error message
        message: String,
    },
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::TransientNetwork { message } => {
                write!(f, "transient network error: {message}")
            }
            FailureCause::HttpStatus { code } => write!(f, "server returned HTTP {code}"),
            FailureCause::ContentLengthMismatch { expected, received } => write!(
                f,
                "content length mismatch: expected {expected} bytes, received {received}"
            ),
            FailureCause::Transport { message } => write!(f, "transport error: {message}"),
            FailureCause::Io { message } => write!(f, "staging file error: {message}"),
        }
    }
}

/// Point-in-time view of one download, safe to share across threads
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    /// Download identifier
    pub id: DownloadId,
    /// Current status
    pub status: Status,
    /// Bytes written to the staging file so far
    pub bytes_received: u64,
    /// Total size, when the server announced a usable content length
    pub bytes_expected_total: Option<u64>,
    /// Staging file, assigned when the download first starts
    pub temporary_file_path: Option<PathBuf>,
    /// Present only when `status == Failed`
    pub failure_cause: Option<FailureCause>,
    /// The completed file has been handed to a consumer
    pub consumed: bool,
}

impl DownloadSnapshot {
    pub(crate) fn queued(id: DownloadId) -> Self {
        Self {
            id,
            status: Status::Queued,
            bytes_received: 0,
            bytes_expected_total: None,
            temporary_file_path: None,
            failure_cause: None,
            consumed: false,
        }
    }

    /// Progress in percent (0.0 to 100.0), when the total is known
    pub fn progress_percent(&self) -> Option<f32> {
        match self.bytes_expected_total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.bytes_received as f32 / total as f32) * 100.0),
            None => None,
        }
    }
}

/// Credentials attached to a download request
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum Auth {
    /// HTTP Basic authentication (library card number and PIN)
    Basic {
        /// User name
        username: String,
        /// Password, if the account has one; never serialized
        #[serde(default, skip_serializing)]
        password: Option<String>,
    },
    /// OAuth-style bearer token
    Bearer {
        /// Token value; never serialized
        #[serde(skip_serializing)]
        token: String,
    },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Auth::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// A request to download one resource under a given identifier
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Stable identifier for the download
    pub id: DownloadId,
    /// Resource URL
    pub url: String,
    /// Optional credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
}

impl DownloadRequest {
    /// Create an unauthenticated request
    pub fn new(id: impl Into<DownloadId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            auth: None,
        }
    }

    /// Attach credentials to the request
    #[must_use]
    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }
}

/// Notification emitted for every download transition
///
/// Each variant carries the snapshot as it was immediately after the
/// transition. Events for one identifier are delivered in transition order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Download accepted and waiting for a worker slot
    Queued {
        /// Snapshot after the transition
        snapshot: DownloadSnapshot,
    },
    /// Worker slot acquired, connection being opened
    Started {
        /// Snapshot after the transition
        snapshot: DownloadSnapshot,
    },
    /// First bytes of the body arrived
    StartedReceivingData {
        /// Snapshot after the transition
        snapshot: DownloadSnapshot,
    },
    /// Progress update (throttled)
    ReceivedData {
        /// Snapshot after the update
        snapshot: DownloadSnapshot,
    },
    /// Transfer stopped at the caller's request
    Paused {
        /// Snapshot after the transition
        snapshot: DownloadSnapshot,
    },
    /// Paused download re-queued
    Resumed {
        /// Snapshot after the transition
        snapshot: DownloadSnapshot,
    },
    /// All bytes received, file waiting to be taken
    Completed {
        /// Snapshot after the transition
        snapshot: DownloadSnapshot,
    },
    /// Download failed
    Failed {
        /// Snapshot after the transition
        snapshot: DownloadSnapshot,
        /// Failure cause (also present in the snapshot)
        cause: FailureCause,
    },
    /// Download cancelled and staging file deleted
    Cancelled {
        /// Snapshot after the transition
        snapshot: DownloadSnapshot,
    },
    /// A consumer took the completed file
    CompletedTake {
        /// Snapshot after the transition
        snapshot: DownloadSnapshot,
        /// Where the file now lives
        file: PathBuf,
    },
    /// Moving the completed file to the consumer failed
    CompletedTakeFailed {
        /// Snapshot after the transition
        snapshot: DownloadSnapshot,
        /// Error message
        error: String,
    },
    /// The completed download has been consumed
    CompletedTaken {
        /// Snapshot after the transition
        snapshot: DownloadSnapshot,
    },
    /// Bookkeeping removed for a handled download
    CleanedUp {
        /// Last snapshot before removal
        snapshot: DownloadSnapshot,
    },
    /// Manager shut down
    Shutdown,
}

impl Event {
    /// Snapshot carried by this event, if any
    pub fn snapshot(&self) -> Option<&DownloadSnapshot> {
        match self {
            Event::Queued { snapshot }
            | Event::Started { snapshot }
            | Event::StartedReceivingData { snapshot }
            | Event::ReceivedData { snapshot }
            | Event::Paused { snapshot }
            | Event::Resumed { snapshot }
            | Event::Completed { snapshot }
            | Event::Failed { snapshot, .. }
            | Event::Cancelled { snapshot }
            | Event::CompletedTake { snapshot, .. }
            | Event::CompletedTakeFailed { snapshot, .. }
            | Event::CompletedTaken { snapshot }
            | Event::CleanedUp { snapshot } => Some(snapshot),
            Event::Shutdown => None,
        }
    }

    /// Identifier this event refers to, if any
    pub fn id(&self) -> Option<&DownloadId> {
        self.snapshot().map(|s| &s.id)
    }

    /// Progress updates may be coalesced; every other event is a lifecycle event
    pub fn is_progress(&self) -> bool {
        matches!(self, Event::ReceivedData { .. })
    }
}
