//! Test configuration helpers for creating managers over temporary staging directories

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use book_dl::{Config, DownloadManager, HttpTransport, ReqwestTransport};

/// Config with a staging directory inside `temp_dir` and fast retries
pub fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.download.staging_dir = temp_dir.path().join("staging");
    config.download.progress_interval = Duration::from_millis(5);
    config.download.shutdown_timeout = Duration::from_secs(5);
    config.retry.initial_delay = Duration::from_millis(20);
    config.retry.jitter = false;
    config.http.connect_timeout = Duration::from_secs(2);
    config.http.read_timeout = Duration::from_secs(5);
    config
}

/// Manager over the real HTTP client
pub async fn create_http_manager() -> (DownloadManager, TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let manager = DownloadManager::new(test_config(&temp_dir))
        .await
        .expect("Failed to create manager");
    (manager, temp_dir)
}

/// Manager over a caller-supplied transport
pub async fn create_manager_with(transport: Arc<dyn HttpTransport>) -> (DownloadManager, TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let manager = DownloadManager::with_transport(test_config(&temp_dir), transport)
        .await
        .expect("Failed to create manager");
    (manager, temp_dir)
}

/// Real HTTP client built from the test config
pub fn http_transport() -> ReqwestTransport {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    ReqwestTransport::new(&test_config(&temp_dir).http).expect("Failed to build HTTP client")
}
