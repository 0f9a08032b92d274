//! Queue processor: admits queued runs into the worker pool and spawns their tasks.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::types::{Event, Status};

use super::task::{DownloadTaskContext, run_download_task};
use super::{DownloadManager, QueuedRun, RunControl, lock_entry};

impl DownloadManager {
    /// Start the queue processor task
    ///
    /// This spawns a background task that continuously:
    /// 1. Waits for the next queued run (FIFO)
    /// 2. Acquires a permit from the concurrency limiter (respects max_concurrent_downloads)
    /// 3. Moves the download to `Started` and spawns its transfer task
    /// 4. Repeats until shutdown
    ///
    /// A run whose download was paused, cancelled or replaced by a newer
    /// lifecycle while it waited is dropped and its permit released.
    ///
    /// The processor stops on `shutdown()` or when the last caller handle is
    /// dropped.
    pub(crate) fn start_queue_processor(&self) -> tokio::task::JoinHandle<()> {
        let manager = DownloadManager {
            processor_guard: None,
            ..self.clone()
        };
        let stop = self.queue_state.processor_stop.clone();

        tokio::spawn(async move {
            loop {
                let run = match manager.queue_state.pop() {
                    Some(run) => run,
                    None => {
                        tokio::select! {
                            _ = manager.queue_state.wakeup.notified() => {}
                            _ = stop.cancelled() => break,
                        }
                        continue;
                    }
                };

                // Blocks while max_concurrent_downloads transfers are running
                let permit = tokio::select! {
                    permit = manager.queue_state.concurrent_limit.clone().acquire_owned() => permit,
                    _ = stop.cancelled() => break,
                };
                let Ok(permit) = permit else {
                    break;
                };

                let Some(ctx) = manager.begin_run(&run) else {
                    continue;
                };

                tokio::spawn(async move {
                    let _permit = permit;
                    run_download_task(ctx).await;
                });
            }
            tracing::debug!("Queue processor stopped");
        })
    }

    /// Move a queued download to `Started` and build its task context
    ///
    /// Returns `None` if the run is stale.
    pub(crate) fn begin_run(&self, run: &QueuedRun) -> Option<DownloadTaskContext> {
        let shared = self.entry(&run.id)?;
        let mut entry = lock_entry(&shared);

        if entry.generation != run.generation
            || entry.snapshot.status != Status::Queued
            || entry.run.is_some()
        {
            tracing::debug!(
                download_id = %run.id,
                status = %entry.snapshot.status,
                "Skipping stale queue entry"
            );
            return None;
        }
        if !self.queue_state.accepting_new.load(Ordering::SeqCst) {
            return None;
        }

        let staging_path = self.staging_path(&run.id, run.generation);
        let control = RunControl::new();
        let cancel = control.cancel.clone();

        entry.run = Some(control);
        entry.snapshot.status = Status::Started;
        entry.snapshot.temporary_file_path = Some(staging_path.clone());
        self.notifier.emit(Event::Started {
            snapshot: entry.snapshot.clone(),
        });

        tracing::info!(
            download_id = %run.id,
            offset = entry.snapshot.bytes_received,
            "Download started"
        );

        Some(DownloadTaskContext {
            id: run.id.clone(),
            entry: Arc::clone(&shared),
            request: entry.request.clone(),
            staging_path,
            cancel,
            transport: Arc::clone(&self.transport),
            notifier: Arc::clone(&self.notifier),
            config: Arc::clone(&self.config),
        })
    }
}
