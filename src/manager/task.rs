//! Download task execution: one run of one download.
//!
//! A run owns the staging file from `Started` until it reports an outcome.
//! Stop requests are honoured before the transport is opened, while waiting
//! for the response, between chunks, and while waiting for the next chunk.
//! A chunk that has started to be written is always finished, so the staging
//! file length equals `bytes_received` at every checkpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::listener::Notifier;
use crate::retry::{IsRetryable, download_with_retry};
use crate::transport::{HttpTransport, TransportError, TransportRequest};
use crate::types::{DownloadId, DownloadRequest, Event, FailureCause, Status};

use super::{SharedEntry, StopRequest, lock_entry, remove_staging_file};

/// Shared state for a single run
pub(crate) struct DownloadTaskContext {
    pub(crate) id: DownloadId,
    pub(crate) entry: SharedEntry,
    pub(crate) request: DownloadRequest,
    pub(crate) staging_path: PathBuf,
    pub(crate) cancel: CancellationToken,
    pub(crate) transport: Arc<dyn HttpTransport>,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) config: Arc<Config>,
}

/// How a run ended, before stop requests are taken into account
#[derive(Debug)]
pub(crate) enum RunOutcome {
    /// Body fully written, file flushed and closed
    Finished,
    /// A stop request was observed at a checkpoint
    Stopped,
    /// The run failed after any retries
    Failed(FailureCause),
}

/// Errors from a single transfer attempt
#[derive(Debug, Error)]
pub(crate) enum TransferError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("server returned HTTP {0}")]
    HttpStatus(u16),

    #[error("staging file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stop requested")]
    Stopped,
}

impl IsRetryable for TransferError {
    fn is_retryable(&self) -> bool {
        match self {
            TransferError::Transport(e) => e.is_retryable(),
            TransferError::HttpStatus(_) | TransferError::Io(_) | TransferError::Stopped => false,
        }
    }
}

impl TransferError {
    fn into_outcome(self) -> RunOutcome {
        match self {
            TransferError::Stopped => RunOutcome::Stopped,
            TransferError::Transport(e) if e.is_retryable() => {
                RunOutcome::Failed(FailureCause::TransientNetwork {
                    message: e.to_string(),
                })
            }
            TransferError::Transport(e) => RunOutcome::Failed(FailureCause::Transport {
                message: e.to_string(),
            }),
            TransferError::HttpStatus(code) => RunOutcome::Failed(FailureCause::HttpStatus { code }),
            TransferError::Io(e) => RunOutcome::Failed(FailureCause::Io {
                message: e.to_string(),
            }),
        }
    }
}

/// Run one download to an outcome and publish the resulting transition
///
/// The transfer runs in its own task so that a panic anywhere inside it is
/// reported as `Failed` instead of leaving the download stuck in a running
/// state.
pub(crate) async fn run_download_task(ctx: DownloadTaskContext) {
    let ctx = Arc::new(ctx);
    let inner = Arc::clone(&ctx);

    let outcome = match tokio::spawn(async move { transfer(&inner).await }).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(download_id = %ctx.id, error = %e, "Download task aborted");
            RunOutcome::Failed(FailureCause::Transport {
                message: format!("download task aborted: {e}"),
            })
        }
    };

    finish_run(&ctx, outcome);
}

/// Retry wrapper around single attempts
async fn transfer(ctx: &DownloadTaskContext) -> RunOutcome {
    if ctx.cancel.is_cancelled() {
        return RunOutcome::Stopped;
    }

    match download_with_retry(&ctx.config.retry, &ctx.cancel, move || attempt(ctx)).await {
        Ok(()) => RunOutcome::Finished,
        // A stop that cut a backoff short takes precedence over the last error
        Err(_) if ctx.cancel.is_cancelled() => RunOutcome::Stopped,
        Err(e) => e.into_outcome(),
    }
}

/// One request: open, stream the body into the staging file, close
async fn attempt(ctx: &DownloadTaskContext) -> Result<(), TransferError> {
    if ctx.cancel.is_cancelled() {
        return Err(TransferError::Stopped);
    }

    let offset = ctx.bytes_received();
    let mut file = open_staging(&ctx.staging_path, offset).await?;

    let request = TransportRequest {
        url: ctx.request.url.clone(),
        auth: ctx.request.auth.clone(),
        offset,
    };
    let response = tokio::select! {
        response = ctx.transport.request(&request) => response?,
        _ = ctx.cancel.cancelled() => return Err(TransferError::Stopped),
    };

    if !response.is_success() {
        tracing::warn!(download_id = %ctx.id, status = response.status, "Server rejected request");
        return Err(TransferError::HttpStatus(response.status));
    }

    // A full (200) response to a ranged request repeats bytes we already hold
    let ranged = offset > 0 && response.partial;
    let mut skip = if ranged { 0 } else { offset };
    let expected_total = response
        .content_length
        .map(|len| if ranged { offset + len } else { len });
    ctx.set_expected_total(expected_total);

    if offset > 0 {
        tracing::debug!(
            download_id = %ctx.id,
            offset,
            honoured = ranged,
            "Continuing from previous bytes"
        );
    }

    let read_timeout = ctx.config.http.read_timeout;
    let mut body = response.body;
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(TransferError::Stopped),
            next = tokio::time::timeout(read_timeout, body.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                return Err(TransferError::Transport(TransportError::Timeout(format!(
                    "no data received for {read_timeout:?}"
                ))));
            }
            Ok(None) => break,
            Ok(Some(chunk)) => chunk?,
        };

        let mut data: &[u8] = &chunk;
        if skip > 0 {
            let n = usize::try_from(skip).unwrap_or(usize::MAX).min(data.len());
            data = &data[n..];
            skip -= n as u64;
        }
        if data.is_empty() {
            continue;
        }

        file.write_all(data).await?;
        ctx.record_bytes(data.len() as u64);
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    Ok(())
}

/// Open the staging file positioned at `offset`
///
/// A tail beyond `offset` (left by a write that failed half-way) is cut off.
async fn open_staging(path: &Path, offset: u64) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;

    let len = file.metadata().await?.len();
    if len < offset {
        return Err(std::io::Error::other(format!(
            "staging file holds {len} bytes, expected at least {offset}"
        )));
    }
    if len > offset {
        file.set_len(offset).await?;
    }
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    Ok(file)
}

impl DownloadTaskContext {
    fn bytes_received(&self) -> u64 {
        lock_entry(&self.entry).snapshot.bytes_received
    }

    fn set_expected_total(&self, total: Option<u64>) {
        lock_entry(&self.entry).snapshot.bytes_expected_total = total;
    }

    /// Count written bytes and emit throttled progress
    fn record_bytes(&self, n: u64) {
        let mut guard = lock_entry(&self.entry);
        let entry = &mut *guard;
        entry.snapshot.bytes_received += n;

        let now = Instant::now();
        let interval = self.config.download.progress_interval;

        if entry.snapshot.status == Status::Started {
            entry.snapshot.status = Status::ReceivingData;
            if let Some(run) = entry.run.as_mut() {
                run.last_progress = Some(now);
            }
            self.notifier.emit(Event::StartedReceivingData {
                snapshot: entry.snapshot.clone(),
            });
            return;
        }

        let Some(run) = entry.run.as_mut() else {
            return;
        };
        if run
            .last_progress
            .is_none_or(|last| now.duration_since(last) >= interval)
        {
            run.last_progress = Some(now);
            self.notifier.emit(Event::ReceivedData {
                snapshot: entry.snapshot.clone(),
            });
        }
    }
}

/// Apply a run's outcome to the entry and release the staging file lease
///
/// A cancel request wins over every outcome, including a finished transfer.
/// A pause request only wins over a stopped transfer.
pub(crate) fn finish_run(ctx: &DownloadTaskContext, outcome: RunOutcome) {
    let mut guard = lock_entry(&ctx.entry);
    let entry = &mut *guard;
    let stop = entry.run.take().and_then(|run| run.stop);
    let id = &ctx.id;

    let outcome = match (stop, outcome) {
        (Some(StopRequest::Cancel), _) => {
            remove_staging_file(id, &ctx.staging_path);
            entry.snapshot.status = Status::Cancelled;
            ctx.notifier.emit(Event::Cancelled {
                snapshot: entry.snapshot.clone(),
            });
            tracing::info!(download_id = %id, "Download cancelled");
            return;
        }
        (_, RunOutcome::Stopped) => {
            entry.snapshot.status = Status::Paused;
            ctx.notifier.emit(Event::Paused {
                snapshot: entry.snapshot.clone(),
            });
            tracing::info!(
                download_id = %id,
                bytes_received = entry.snapshot.bytes_received,
                "Download paused"
            );
            return;
        }
        (_, outcome) => outcome,
    };

    let cause = match outcome {
        RunOutcome::Finished => match entry.snapshot.bytes_expected_total {
            Some(expected) if expected != entry.snapshot.bytes_received => {
                FailureCause::ContentLengthMismatch {
                    expected,
                    received: entry.snapshot.bytes_received,
                }
            }
            _ => {
                entry.snapshot.status = Status::Completed;
                ctx.notifier.emit(Event::Completed {
                    snapshot: entry.snapshot.clone(),
                });
                tracing::info!(
                    download_id = %id,
                    bytes = entry.snapshot.bytes_received,
                    "Download complete"
                );
                return;
            }
        },
        RunOutcome::Failed(cause) => cause,
        RunOutcome::Stopped => return,
    };

    remove_staging_file(id, &ctx.staging_path);
    entry.snapshot.status = Status::Failed;
    entry.snapshot.failure_cause = Some(cause.clone());
    tracing::warn!(download_id = %id, cause = %cause, "Download failed");
    ctx.notifier.emit(Event::Failed {
        snapshot: entry.snapshot.clone(),
        cause,
    });
}
