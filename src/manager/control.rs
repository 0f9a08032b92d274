//! Download lifecycle control: submit, pause, resume, cancel.

use crate::error::{DownloadError, Error, Result};
use crate::types::{DownloadId, DownloadRequest, DownloadSnapshot, Event, Status};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use super::{DownloadEntry, DownloadManager, StopRequest, lock_entry, remove_staging_file};

impl DownloadManager {
    /// Submit a download
    ///
    /// Never blocks on the worker pool: new work is queued and a `Queued`
    /// snapshot is returned immediately.
    ///
    /// Re-submitting an identifier returns the existing snapshot unchanged
    /// while that download is queued, running, paused, or completed and not
    /// yet taken. An identifier whose previous lifecycle was cancelled,
    /// failed, or taken starts a fresh lifecycle.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] after [`shutdown`](DownloadManager::shutdown)
    /// - [`DownloadError::InvalidUrl`] if the URL is not an absolute http(s) URL
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use book_dl::*;
    /// # async fn example(manager: DownloadManager) -> Result<()> {
    /// let request = DownloadRequest::new("book-1", "https://example.org/book-1.epub")
    ///     .with_auth(Auth::Bearer { token: "loan-token".into() });
    /// let first = manager.submit(request.clone())?;
    /// let again = manager.submit(request)?;
    /// assert_eq!(first.id, again.id);
    /// # Ok(())
    /// # }
    /// ```
    pub fn submit(&self, request: DownloadRequest) -> Result<DownloadSnapshot> {
        if !self.queue_state.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        validate_url(&request.url)?;

        let id = request.id.clone();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = entries.get(&id) {
            let entry = lock_entry(existing);
            let reusable = match entry.snapshot.status {
                Status::Cancelled | Status::Failed => true,
                Status::Completed => entry.snapshot.consumed,
                _ => false,
            };
            if !reusable {
                tracing::debug!(
                    download_id = %id,
                    status = %entry.snapshot.status,
                    "Download already tracked, returning existing snapshot"
                );
                return Ok(entry.snapshot.clone());
            }
        }

        let generation = self.next_generation();
        let entry = DownloadEntry::new(request, generation);
        let snapshot = entry.snapshot.clone();

        // Announce before the processor can see the run so Queued precedes Started
        self.notifier.emit(Event::Queued {
            snapshot: snapshot.clone(),
        });
        entries.insert(id.clone(), Arc::new(Mutex::new(entry)));
        drop(entries);

        self.queue_state.push(id.clone(), generation);
        tracing::info!(download_id = %id, generation, "Download queued");

        Ok(snapshot)
    }

    /// Pause a download
    ///
    /// A queued download is paused immediately. A running download is asked
    /// to stop; it keeps the bytes written so far and reports `Paused` at its
    /// next checkpoint. Pausing a download in any other state does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::NotFound`] for an unknown identifier.
    pub fn pause(&self, id: &DownloadId) -> Result<()> {
        let shared = self.entry(id).ok_or_else(|| Error::not_found(id))?;
        let mut entry = lock_entry(&shared);

        match entry.snapshot.status {
            Status::Queued => {
                self.queue_state.remove(id);
                entry.snapshot.status = Status::Paused;
                self.notifier.emit(Event::Paused {
                    snapshot: entry.snapshot.clone(),
                });
                tracing::info!(download_id = %id, "Queued download paused");
            }
            Status::Started | Status::ReceivingData => {
                if let Some(run) = entry.run.as_mut() {
                    run.request_stop(StopRequest::Pause);
                    tracing::debug!(download_id = %id, "Signaled pause to running download");
                }
            }
            Status::Paused | Status::Completed | Status::Failed | Status::Cancelled => {}
        }

        Ok(())
    }

    /// Resume a paused download
    ///
    /// The download goes back to `Queued` and waits for a worker slot like any
    /// other; its next run asks the server for the remaining bytes only.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] after [`shutdown`](DownloadManager::shutdown)
    /// - [`DownloadError::NotFound`] for an unknown identifier
    /// - [`DownloadError::IllegalStateTransition`] unless the download is
    ///   `Paused` (a pause that has not yet taken effect counts as running)
    pub fn resume(&self, id: &DownloadId) -> Result<()> {
        if !self.queue_state.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let shared = self.entry(id).ok_or_else(|| Error::not_found(id))?;
        let mut entry = lock_entry(&shared);

        if entry.snapshot.status != Status::Paused {
            return Err(Error::illegal(id, "resume", entry.snapshot.status));
        }

        entry.snapshot.status = Status::Queued;
        self.notifier.emit(Event::Resumed {
            snapshot: entry.snapshot.clone(),
        });
        self.queue_state.push(id.clone(), entry.generation);

        tracing::info!(
            download_id = %id,
            bytes_received = entry.snapshot.bytes_received,
            "Download resumed"
        );
        Ok(())
    }

    /// Cancel a download
    ///
    /// A queued or paused download is cancelled immediately and its staging
    /// file deleted. A running download is asked to stop; it deletes its
    /// staging file and reports `Cancelled` at its next checkpoint.
    /// Cancelling a finished download does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::NotFound`] for an unknown identifier.
    pub fn cancel(&self, id: &DownloadId) -> Result<()> {
        let shared = self.entry(id).ok_or_else(|| Error::not_found(id))?;
        let mut entry = lock_entry(&shared);

        match entry.snapshot.status {
            Status::Queued | Status::Paused => {
                self.queue_state.remove(id);
                if let Some(path) = &entry.snapshot.temporary_file_path {
                    remove_staging_file(id, path);
                }
                entry.snapshot.status = Status::Cancelled;
                self.notifier.emit(Event::Cancelled {
                    snapshot: entry.snapshot.clone(),
                });
                tracing::info!(download_id = %id, "Download cancelled");
            }
            Status::Started | Status::ReceivingData => {
                if let Some(run) = entry.run.as_mut() {
                    run.request_stop(StopRequest::Cancel);
                    tracing::debug!(download_id = %id, "Signaled cancel to running download");
                }
            }
            Status::Completed | Status::Failed | Status::Cancelled => {}
        }

        Ok(())
    }
}

/// Reject anything but absolute http(s) URLs before queueing
fn validate_url(raw: &str) -> Result<()> {
    let invalid = |reason: String| {
        Error::Download(DownloadError::InvalidUrl {
            url: raw.to_string(),
            reason,
        })
    };

    let url = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme '{other}'"))),
    }
}
