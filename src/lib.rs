//! # book-dl
//!
//! Take-once HTTP download manager for e-reader content.
//!
//! ## Design Philosophy
//!
//! book-dl is designed to be:
//! - **Non-blocking for callers** - `submit`, `pause`, `take` never wait on the network
//! - **Take-once** - a completed file is handed to exactly one consumer
//! - **Cooperative** - pause and cancel take effect at the next transfer checkpoint
//! - **Event-driven** - listeners and subscribers see every transition, in order per download
//!
//! ## Quick Start
//!
//! ```no_run
//! use book_dl::{Config, DownloadManager, DownloadRequest, Event};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = DownloadManager::new(Config::default()).await?;
//!
//!     // Subscribe to events
//!     let mut events = manager.subscribe();
//!
//!     let id = manager
//!         .submit(DownloadRequest::new("book-1", "https://example.org/book-1.epub"))?
//!         .id;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let Event::Completed { snapshot } = event {
//!             if snapshot.id == id {
//!                 let file = manager.take(&id, "/data/library/book-1.epub")?;
//!                 println!("Stored at {}", file.display());
//!                 break;
//!             }
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Listener registry and notification dispatch
pub mod listener;
/// Download manager (decomposed into focused submodules)
pub mod manager;
/// Retry logic with exponential backoff
pub mod retry;
/// HTTP transport boundary
pub mod transport;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, DownloadConfig, HttpConfig, NotificationConfig, RetryConfig};
pub use error::{DownloadError, Error, Result};
pub use listener::{DownloadListener, ListenerId};
pub use manager::DownloadManager;
pub use transport::{
    ByteStream, HttpTransport, ReqwestTransport, TransportError, TransportRequest,
    TransportResponse,
};
pub use types::{Auth, DownloadId, DownloadRequest, DownloadSnapshot, Event, FailureCause, Status};

/// Helper function to run the manager with graceful signal handling.
///
/// Waits for a termination signal and then calls the manager's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use book_dl::{Config, DownloadManager, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = DownloadManager::new(Config::default()).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(manager).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(manager: DownloadManager) -> Result<()> {
    wait_for_signal().await;
    manager.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = sigint.recv() => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
