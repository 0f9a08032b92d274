//! Test fixtures: payloads and transport wrappers

use async_trait::async_trait;
use book_dl::{HttpTransport, TransportError, TransportRequest, TransportResponse};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Deterministic payload so tests can check exact file contents
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Port on localhost with nothing listening
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Transport wrapper that counts requests
pub struct CountingTransport<T> {
    inner: T,
    requests: Arc<AtomicUsize>,
}

impl<T> CountingTransport<T> {
    pub fn new(inner: T) -> (Self, Arc<AtomicUsize>) {
        let requests = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                requests: requests.clone(),
            },
            requests,
        )
    }
}

#[async_trait]
impl<T: HttpTransport> HttpTransport for CountingTransport<T> {
    async fn request(
        &self,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.inner.request(request).await
    }
}
