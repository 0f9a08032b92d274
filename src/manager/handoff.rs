//! Take-once delivery of completed files, and cleanup of handled downloads.

use crate::error::{DownloadError, Error, Result};
use crate::types::{DownloadId, Event, Status};
use std::path::{Path, PathBuf};
use std::sync::PoisonError;

use super::{DownloadManager, lock_entry, remove_staging_file};

impl DownloadManager {
    /// Take ownership of a completed download's file
    ///
    /// Moves the staging file to `destination` and marks the download
    /// consumed. Exactly one caller can win: the claim is made under the
    /// download's own lock, so a concurrent second call gets
    /// [`DownloadError::AlreadyTaken`]. The move itself runs outside the lock,
    /// so snapshots stay readable while a file is copied across devices.
    /// Never waits on network I/O.
    ///
    /// The destination's parent directory must already exist. An existing
    /// file at `destination` is replaced only once the new file is complete.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::NotFound`] for an unknown identifier
    /// - [`DownloadError::AlreadyTaken`] if the file was already taken
    /// - [`DownloadError::IllegalStateTransition`] unless the download is `Completed`
    /// - [`DownloadError::TakeFailed`] if the file could not be moved; the
    ///   staging file is then deleted and the download counts as consumed
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use book_dl::*;
    /// # fn example(manager: DownloadManager) -> Result<()> {
    /// let id = DownloadId::from("book-1");
    /// let file = manager.take(&id, "/data/library/book-1.epub")?;
    /// assert!(manager.take(&id, "/data/library/copy.epub").unwrap_err().is_already_taken());
    /// # let _ = file;
    /// # Ok(())
    /// # }
    /// ```
    pub fn take(&self, id: &DownloadId, destination: impl AsRef<Path>) -> Result<PathBuf> {
        let destination = destination.as_ref().to_path_buf();
        let shared = self.entry(id).ok_or_else(|| Error::not_found(id))?;

        let staging = {
            let mut entry = lock_entry(&shared);
            match entry.snapshot.status {
                Status::Completed if entry.snapshot.consumed || entry.taking => {
                    return Err(Error::Download(DownloadError::AlreadyTaken { id: id.clone() }));
                }
                Status::Completed => {}
                other => return Err(Error::illegal(id, "take", other)),
            }
            let Some(staging) = entry.snapshot.temporary_file_path.clone() else {
                return Err(Error::illegal(id, "take", entry.snapshot.status));
            };
            entry.taking = true;
            staging
        };

        let moved = move_file(&staging, &destination);

        let mut entry = lock_entry(&shared);
        entry.taking = false;
        entry.snapshot.consumed = true;

        match moved {
            Ok(()) => {
                self.notifier.emit(Event::CompletedTake {
                    snapshot: entry.snapshot.clone(),
                    file: destination.clone(),
                });
                self.notifier.emit(Event::CompletedTaken {
                    snapshot: entry.snapshot.clone(),
                });
                tracing::info!(
                    download_id = %id,
                    destination = %destination.display(),
                    "Completed download taken"
                );
                Ok(destination)
            }
            Err(e) => {
                remove_staging_file(id, &staging);
                self.notifier.emit(Event::CompletedTakeFailed {
                    snapshot: entry.snapshot.clone(),
                    error: e.to_string(),
                });
                tracing::warn!(
                    download_id = %id,
                    destination = %destination.display(),
                    error = %e,
                    "Failed to hand over completed download"
                );
                Err(Error::Download(DownloadError::TakeFailed {
                    id: id.clone(),
                    destination,
                    reason: e.to_string(),
                }))
            }
        }
    }

    /// Forget a download that has been dealt with
    ///
    /// Allowed for taken, cancelled and failed downloads. Deletes any leftover
    /// staging file, removes the entry and emits `CleanedUp`. The identifier
    /// can be submitted again afterwards.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::NotFound`] for an unknown identifier
    /// - [`DownloadError::IllegalStateTransition`] for a download that is
    ///   still active or completed but not yet taken
    pub fn clean_up(&self, id: &DownloadId) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let shared = entries.get(id).cloned().ok_or_else(|| Error::not_found(id))?;
        let entry = lock_entry(&shared);

        let handled = match entry.snapshot.status {
            Status::Completed => entry.snapshot.consumed,
            Status::Cancelled | Status::Failed => true,
            _ => false,
        };
        if !handled {
            return Err(Error::illegal(id, "clean up", entry.snapshot.status));
        }

        entries.remove(id);
        drop(entries);

        if let Some(path) = &entry.snapshot.temporary_file_path {
            remove_staging_file(id, path);
        }
        self.notifier.emit(Event::CleanedUp {
            snapshot: entry.snapshot.clone(),
        });
        tracing::debug!(download_id = %id, "Download cleaned up");
        Ok(())
    }
}

/// Rename, falling back to a copy when the rename crosses devices
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::debug!(
                from = %from.display(),
                to = %to.display(),
                error = %rename_err,
                "Rename failed, falling back to copy"
            );
            copy_into_place(from, to)
        }
    }
}

/// Copy next to `to`, then rename over it
///
/// A failed copy never touches an existing file at `to`. Once the copy is in
/// place the take has succeeded, even if the source cannot be removed.
fn copy_into_place(from: &Path, to: &Path) -> std::io::Result<()> {
    let mut partial = to.as_os_str().to_owned();
    partial.push(".book-dl-part");
    let partial = PathBuf::from(partial);

    if let Err(e) = std::fs::copy(from, &partial).and_then(|_| std::fs::rename(&partial, to)) {
        if let Err(cleanup) = std::fs::remove_file(&partial)
            && cleanup.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial copy");
        }
        return Err(e);
    }

    if let Err(e) = std::fs::remove_file(from) {
        tracing::warn!(
            path = %from.display(),
            error = %e,
            "File copied into place but staging copy could not be removed"
        );
    }
    Ok(())
}
