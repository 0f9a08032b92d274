//! Download manager split into focused submodules.
//!
//! The `DownloadManager` struct and its methods are organized by domain:
//! - [`control`] - Submission and lifecycle control (submit/pause/resume/cancel)
//! - [`handoff`] - Take-once delivery of completed files and cleanup
//! - [`queue_processor`] - Worker pool and run admission
//! - [`task`] - Transfer loop for one run of one download
//! - [`lifecycle`] - Shutdown coordination

mod control;
mod handoff;
mod lifecycle;
mod queue_processor;
mod task;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::listener::{DownloadListener, ListenerId, Notifier};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::types::{DownloadId, DownloadRequest, DownloadSnapshot, Event};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

/// What the caller asked a running task to do at its next checkpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopRequest {
    Pause,
    Cancel,
}

/// Control block for the run currently holding the staging file
pub(crate) struct RunControl {
    /// Fired together with `stop` so the task wakes from any await
    pub(crate) cancel: CancellationToken,
    pub(crate) stop: Option<StopRequest>,
    /// Last time a progress notification went out for this run
    pub(crate) last_progress: Option<Instant>,
}

impl RunControl {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            stop: None,
            last_progress: None,
        }
    }

    /// Record a stop request; a cancel replaces a pending pause, never the reverse
    pub(crate) fn request_stop(&mut self, request: StopRequest) {
        match (self.stop, request) {
            (Some(StopRequest::Cancel), _) => {}
            (Some(StopRequest::Pause), StopRequest::Pause) => {}
            _ => self.stop = Some(request),
        }
        self.cancel.cancel();
    }
}

/// Everything the manager tracks for one lifecycle of one identifier
pub(crate) struct DownloadEntry {
    pub(crate) snapshot: DownloadSnapshot,
    pub(crate) request: DownloadRequest,
    /// Distinguishes successive lifecycles of the same identifier
    pub(crate) generation: u64,
    /// Present while a task owns the staging file
    pub(crate) run: Option<RunControl>,
    /// Set while `take` moves the completed file out of staging
    pub(crate) taking: bool,
}

impl DownloadEntry {
    fn new(request: DownloadRequest, generation: u64) -> Self {
        Self {
            snapshot: DownloadSnapshot::queued(request.id.clone()),
            request,
            generation,
            run: None,
            taking: false,
        }
    }
}

pub(crate) type SharedEntry = Arc<Mutex<DownloadEntry>>;

/// Lock one entry, recovering the data if a previous holder panicked
pub(crate) fn lock_entry(entry: &Mutex<DownloadEntry>) -> MutexGuard<'_, DownloadEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One admission ticket in the FIFO queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct QueuedRun {
    pub(crate) id: DownloadId,
    pub(crate) generation: u64,
}

/// Queue and worker pool state
#[derive(Clone)]
pub(crate) struct QueueState {
    /// FIFO of runs waiting for a worker slot
    pub(crate) pending: Arc<Mutex<VecDeque<QueuedRun>>>,
    /// Wakes the queue processor when work is pushed
    pub(crate) wakeup: Arc<tokio::sync::Notify>,
    /// Limits concurrent transfers (max_concurrent_downloads permits)
    pub(crate) concurrent_limit: Arc<tokio::sync::Semaphore>,
    /// Cleared during shutdown
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Stops the queue processor
    pub(crate) processor_stop: CancellationToken,
}

impl QueueState {
    fn new(max_concurrent: usize) -> Self {
        Self {
            pending: Arc::new(Mutex::new(VecDeque::new())),
            wakeup: Arc::new(tokio::sync::Notify::new()),
            concurrent_limit: Arc::new(tokio::sync::Semaphore::new(max_concurrent)),
            accepting_new: Arc::new(AtomicBool::new(true)),
            processor_stop: CancellationToken::new(),
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<QueuedRun>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, id: DownloadId, generation: u64) {
        self.pending().push_back(QueuedRun { id, generation });
        self.wakeup.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<QueuedRun> {
        self.pending().pop_front()
    }

    /// Drop any queued admission for `id`
    pub(crate) fn remove(&self, id: &DownloadId) {
        self.pending().retain(|run| &run.id != id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending().len()
    }
}

/// Take-once HTTP download manager (cloneable - all fields are Arc-wrapped)
///
/// Downloads are keyed by [`DownloadId`]. Each identifier has at most one
/// active transfer; completed files stay in the staging directory until
/// exactly one caller [`take`](DownloadManager::take)s them.
///
/// Queued work is only admitted while at least one handle is alive; dropping
/// the last one stops the queue processor and, once running transfers end,
/// the notification thread.
#[derive(Clone)]
pub struct DownloadManager {
    pub(crate) config: Arc<Config>,
    pub(crate) transport: Arc<dyn HttpTransport>,
    /// Per-identifier entries; the map lock only guards membership
    pub(crate) entries: Arc<RwLock<HashMap<DownloadId, SharedEntry>>>,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) queue_state: QueueState,
    pub(crate) next_generation: Arc<AtomicU64>,
    /// Stops the queue processor once every caller-held handle is gone
    ///
    /// The processor's own handle carries `None`, so it never keeps the
    /// manager (and the notification thread) alive by itself.
    pub(crate) processor_guard: Option<Arc<DropGuard>>,
}

impl DownloadManager {
    /// Create a manager that fetches over HTTP with `reqwest`
    ///
    /// Validates the configuration, creates the staging directory, starts
    /// the notification thread and the queue processor.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use book_dl::*;
    /// # async fn example() -> Result<()> {
    /// let manager = DownloadManager::new(Config::default()).await?;
    /// let snapshot = manager.submit(DownloadRequest::new(
    ///     "book-1",
    ///     "https://library.example.org/fulfil/book-1.epub",
    /// ))?;
    /// assert_eq!(snapshot.status, Status::Queued);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(config: Config) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.http)?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Create a manager with a caller-supplied transport
    pub async fn with_transport(config: Config, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(config.staging_dir())
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create staging directory '{}': {}",
                        config.staging_dir().display(),
                        e
                    ),
                ))
            })?;

        let notifier = Notifier::start(
            config.notifications.listener_queue_capacity,
            config.notifications.event_channel_capacity,
        )?;

        let queue_state = QueueState::new(config.download.max_concurrent_downloads);
        let processor_guard = Arc::new(queue_state.processor_stop.clone().drop_guard());

        let manager = Self {
            queue_state,
            config: Arc::new(config),
            transport,
            entries: Arc::new(RwLock::new(HashMap::new())),
            notifier: Arc::new(notifier),
            next_generation: Arc::new(AtomicU64::new(1)),
            processor_guard: Some(processor_guard),
        };

        manager.start_queue_processor();

        tracing::info!(
            staging_dir = %manager.config.staging_dir().display(),
            max_concurrent = manager.config.download.max_concurrent_downloads,
            "Download manager started"
        );

        Ok(manager)
    }

    /// Subscribe to download events
    ///
    /// Subscribers that fall more than `event_channel_capacity` events behind
    /// receive `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.notifier.subscribe()
    }

    /// Register a listener; it receives every transition of every download
    pub fn add_listener(&self, listener: Arc<dyn DownloadListener>) -> ListenerId {
        self.notifier.add_listener(listener)
    }

    /// Unregister a listener; returns false if it was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.notifier.remove_listener(id)
    }

    /// Current state of one download
    pub fn snapshot_for(&self, id: &DownloadId) -> Option<DownloadSnapshot> {
        self.entry(id).map(|entry| lock_entry(&entry).snapshot.clone())
    }

    /// Current state of every tracked download, ordered by identifier
    pub fn snapshots(&self) -> Vec<DownloadSnapshot> {
        let entries: Vec<SharedEntry> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<DownloadSnapshot> = entries
            .iter()
            .map(|entry| lock_entry(entry).snapshot.clone())
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Progress notifications dropped because listeners fell behind
    pub fn dropped_progress_notifications(&self) -> u64 {
        self.notifier.dropped_progress()
    }

    pub(crate) fn entry(&self, id: &DownloadId) -> Option<SharedEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub(crate) fn staging_path(&self, id: &DownloadId, generation: u64) -> PathBuf {
        staging_path(self.config.staging_dir(), id, generation)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }
}

/// `<staging_dir>/<url-encoded id>-<generation>.part`
pub(crate) fn staging_path(staging_dir: &std::path::Path, id: &DownloadId, generation: u64) -> PathBuf {
    staging_dir.join(format!(
        "{}-{}.part",
        urlencoding::encode(id.as_str()),
        generation
    ))
}

/// Delete a staging file, treating "already gone" as success
pub(crate) fn remove_staging_file(id: &DownloadId, path: &std::path::Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(download_id = %id, path = %path.display(), "Removed staging file");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(
                download_id = %id,
                path = %path.display(),
                error = %e,
                "Failed to remove staging file"
            );
        }
    }
}
