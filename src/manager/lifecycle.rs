//! Shutdown coordination.

use std::sync::PoisonError;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::error::Result;
use crate::types::Event;

use super::{DownloadManager, SharedEntry, StopRequest, lock_entry};

/// How often shutdown re-checks for running transfers
const ACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl DownloadManager {
    /// Gracefully shut down the manager
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting submissions (`submit` returns `ShuttingDown`)
    /// 2. Pauses every running transfer, keeping the bytes written so far
    /// 3. Waits up to `shutdown_timeout` for the transfers to acknowledge
    /// 4. Stops the queue processor; queued downloads stay `Queued`
    /// 5. Emits [`Event::Shutdown`]
    ///
    /// Snapshots remain readable and completed files can still be taken,
    /// cancelled or cleaned up; listeners keep receiving those transitions
    /// until the last manager handle is dropped.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        // 1. Stop accepting new downloads
        self.queue_state.accepting_new.store(false, Ordering::SeqCst);

        // 2. Pause everything that is running
        let paused = self.pause_running_all();
        tracing::info!(paused, "Signaled pause to running downloads");

        // 3. Wait for running transfers with timeout
        let timeout = self.config.download.shutdown_timeout;
        if tokio::time::timeout(timeout, self.wait_for_running_downloads())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Timeout waiting for downloads to stop, proceeding with shutdown"
            );
        }

        // 4. Stop admitting queued work
        self.queue_state.processor_stop.cancel();

        // 5. Final notification
        self.notifier.emit(Event::Shutdown);

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// True once `shutdown()` has started
    pub fn is_shutting_down(&self) -> bool {
        !self.queue_state.accepting_new.load(Ordering::SeqCst)
    }

    fn all_entries(&self) -> Vec<SharedEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Ask every running transfer to pause; returns how many were signaled
    pub(crate) fn pause_running_all(&self) -> usize {
        let mut signaled = 0;
        for shared in self.all_entries() {
            let mut entry = lock_entry(&shared);
            if let Some(run) = entry.run.as_mut() {
                run.request_stop(StopRequest::Pause);
                signaled += 1;
            }
        }
        signaled
    }

    fn running_count(&self) -> usize {
        self.all_entries()
            .iter()
            .filter(|shared| lock_entry(shared).run.is_some())
            .count()
    }

    async fn wait_for_running_downloads(&self) {
        loop {
            let running = self.running_count();
            if running == 0 {
                return;
            }
            tracing::debug!(running, "Waiting for running downloads to stop");
            tokio::time::sleep(ACTIVE_POLL_INTERVAL).await;
        }
    }
}
