use super::test_helpers::*;
use super::*;
use crate::error::DownloadError;
use crate::transport::TransportError;
use crate::types::{FailureCause, Status};
use std::time::Duration;


/// Transport serving `len` bytes slowly enough to be caught mid-transfer
fn slow_transport(len: usize) -> Arc<ScriptedTransport> {
    Arc::new(
        ScriptedTransport::new(payload(len))
            .chunk_size(100)
            .chunk_delay(Duration::from_millis(20)),
    )
}

fn request(id: &str) -> DownloadRequest {
    DownloadRequest::new(id, format!("https://library.example.org/content/{id}.epub"))
}
