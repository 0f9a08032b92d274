//! Shared test helpers: scripted transport, recording listener, manager setup.

use crate::config::Config;
use crate::listener::DownloadListener;
use crate::manager::DownloadManager;
use crate::transport::{HttpTransport, TransportError, TransportRequest, TransportResponse};
use crate::types::{DownloadId, DownloadSnapshot, FailureCause, Status};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

/// Deterministic payload so tests can check exact file contents
pub(crate) fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// In-memory transport serving one resource in fixed-size chunks
pub(crate) struct ScriptedTransport {
    content: Vec<u8>,
    chunk_size: usize,
    chunk_delay: Duration,
    honour_range: bool,
    status: u16,
    advertised_length: Option<Option<u64>>,
    failures: Mutex<VecDeque<TransportError>>,
    interrupt_after: Mutex<Option<usize>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            chunk_size: 100,
            chunk_delay: Duration::ZERO,
            honour_range: true,
            status: 200,
            advertised_length: None,
            failures: Mutex::new(VecDeque::new()),
            interrupt_after: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub(crate) fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Answer ranged requests with the full resource (HTTP 200)
    pub(crate) fn ignore_range(mut self) -> Self {
        self.honour_range = false;
        self
    }

    pub(crate) fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Override the content length header (`None` = header missing)
    pub(crate) fn advertise_length(mut self, length: Option<u64>) -> Self {
        self.advertised_length = Some(length);
        self
    }

    /// Fail the next request(s) before any response is produced
    pub(crate) fn fail_next(self, error: TransportError) -> Self {
        self.failures.lock().unwrap().push_back(error);
        self
    }

    /// Cut the first response body off after `bytes` with a connection reset
    pub(crate) fn interrupt_once_after(self, bytes: usize) -> Self {
        *self.interrupt_after.lock().unwrap() = Some(bytes);
        self
    }

    pub(crate) fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn offsets(&self) -> Vec<u64> {
        self.requests().iter().map(|r| r.offset).collect()
    }
}

#[async_trait::async_trait]
impl HttpTransport for ScriptedTransport {
    async fn request(
        &self,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());

        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        if !(200..300).contains(&self.status) {
            return Ok(TransportResponse {
                status: self.status,
                content_length: Some(0),
                partial: false,
                body: futures::stream::empty().boxed(),
            });
        }

        let offset = usize::try_from(request.offset).unwrap();
        let partial = offset > 0 && self.honour_range;
        let body = if partial {
            self.content[offset.min(self.content.len())..].to_vec()
        } else {
            self.content.clone()
        };
        let content_length = match self.advertised_length {
            Some(length) => length,
            None => Some(body.len() as u64),
        };

        let mut chunks: Vec<Result<Bytes, TransportError>> = body
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        if let Some(limit) = self.interrupt_after.lock().unwrap().take() {
            let keep = limit.div_ceil(self.chunk_size);
            chunks.truncate(keep);
            chunks.push(Err(TransportError::Interrupted("connection reset".into())));
        }

        let delay = self.chunk_delay;
        let body = futures::stream::iter(chunks)
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                chunk
            })
            .boxed();

        Ok(TransportResponse {
            status: if partial { 206 } else { 200 },
            content_length,
            partial,
            body,
        })
    }
}

/// Transport whose request panics
pub(crate) struct PanickingTransport;

#[async_trait::async_trait]
impl HttpTransport for PanickingTransport {
    async fn request(
        &self,
        _request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        panic!("transport bug");
    }
}

/// Listener that records every callback as `(name, snapshot)`
#[derive(Default)]
pub(crate) struct RecordingListener {
    seen: Mutex<Vec<(&'static str, DownloadSnapshot)>>,
}

impl RecordingListener {
    fn push(&self, name: &'static str, snapshot: &DownloadSnapshot) {
        self.seen.lock().unwrap().push((name, snapshot.clone()));
    }

    pub(crate) fn events_for(&self, id: &str) -> Vec<(&'static str, DownloadSnapshot)> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.id.as_str() == id)
            .cloned()
            .collect()
    }

    pub(crate) fn names_for(&self, id: &str) -> Vec<&'static str> {
        self.events_for(id).into_iter().map(|(n, _)| n).collect()
    }

    /// Names without progress updates
    pub(crate) fn lifecycle_for(&self, id: &str) -> Vec<&'static str> {
        self.names_for(id)
            .into_iter()
            .filter(|n| *n != "received_data")
            .collect()
    }

    /// Poll until `name` has been recorded for `id`
    pub(crate) async fn wait_for(&self, id: &str, name: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !self.names_for(id).iter().any(|n| *n == name) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {name} on {id}; saw {:?}",
                self.names_for(id)
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl DownloadListener for RecordingListener {
    fn download_queued(&self, s: &DownloadSnapshot) {
        self.push("queued", s)
    }
    fn download_started(&self, s: &DownloadSnapshot) {
        self.push("started", s)
    }
    fn download_started_receiving_data(&self, s: &DownloadSnapshot) {
        self.push("started_receiving_data", s)
    }
    fn download_received_data(&self, s: &DownloadSnapshot) {
        self.push("received_data", s)
    }
    fn download_paused(&self, s: &DownloadSnapshot) {
        self.push("paused", s)
    }
    fn download_resumed(&self, s: &DownloadSnapshot) {
        self.push("resumed", s)
    }
    fn download_completed(&self, s: &DownloadSnapshot) {
        self.push("completed", s)
    }
    fn download_failed(&self, s: &DownloadSnapshot, _cause: &FailureCause) {
        self.push("failed", s)
    }
    fn download_cancelled(&self, s: &DownloadSnapshot) {
        self.push("cancelled", s)
    }
    fn download_completed_take(&self, s: &DownloadSnapshot, _file: &Path) {
        self.push("completed_take", s)
    }
    fn download_completed_take_failed(&self, s: &DownloadSnapshot, _error: &str) {
        self.push("completed_take_failed", s)
    }
    fn download_completed_taken(&self, s: &DownloadSnapshot) {
        self.push("completed_taken", s)
    }
    fn download_cleaned_up(&self, s: &DownloadSnapshot) {
        self.push("cleaned_up", s)
    }
}

/// Config pointing at `staging_dir` with fast retries and progress
pub(crate) fn test_config(staging_dir: &Path) -> Config {
    let mut config = Config::default();
    config.download.staging_dir = staging_dir.to_path_buf();
    config.download.max_concurrent_downloads = 2;
    config.download.progress_interval = Duration::from_millis(5);
    config.download.shutdown_timeout = Duration::from_secs(5);
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.jitter = false;
    config
}

/// Helper to create a manager over `transport` with a recording listener.
/// Returns the tempdir too (which must be kept alive).
pub(crate) async fn create_test_manager(
    transport: Arc<dyn HttpTransport>,
) -> (DownloadManager, Arc<RecordingListener>, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let config = test_config(&temp_dir.path().join("staging"));
    create_test_manager_with(config, transport, temp_dir).await
}

pub(crate) async fn create_test_manager_with(
    config: Config,
    transport: Arc<dyn HttpTransport>,
    temp_dir: tempfile::TempDir,
) -> (DownloadManager, Arc<RecordingListener>, tempfile::TempDir) {
    let manager = DownloadManager::with_transport(config, transport)
        .await
        .unwrap();
    let listener = Arc::new(RecordingListener::default());
    manager.add_listener(listener.clone());
    (manager, listener, temp_dir)
}

/// Poll the snapshot until `pred` holds
pub(crate) async fn wait_until(
    manager: &DownloadManager,
    id: &str,
    pred: impl Fn(&DownloadSnapshot) -> bool,
) -> DownloadSnapshot {
    let id = DownloadId::from(id);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(snapshot) = manager.snapshot_for(&id)
            && pred(&snapshot)
        {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on {id}; last snapshot {:?}",
            manager.snapshot_for(&id)
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until the download reaches `status`
pub(crate) async fn wait_for_status(
    manager: &DownloadManager,
    id: &str,
    status: Status,
) -> DownloadSnapshot {
    wait_until(manager, id, |s| s.status == status).await
}
