//! HTTP transport boundary
//!
//! The manager only needs a streamed GET with optional credentials and an
//! optional starting offset. [`HttpTransport`] is the seam; [`ReqwestTransport`]
//! is the production implementation.

use crate::config::HttpConfig;
use crate::error::Result;
use crate::retry::IsRetryable;
use crate::types::Auth;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use thiserror::Error;

/// Stream of body chunks
pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, TransportError>>;

/// Errors raised by a transport, classified for the retry policy
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Could not connect (refused, DNS failure, unreachable)
    #[error("connection failed: {0}")]
    Connect(String),

    /// Connect or read timed out
    #[error("timed out: {0}")]
    Timeout(String),

    /// The connection dropped while reading the body (reset, aborted)
    #[error("transfer interrupted: {0}")]
    Interrupted(String),

    /// The URL could not be used for a request
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Any other failure (TLS, protocol, redirect loop)
    #[error("{0}")]
    Other(String),
}

/// One GET request as seen by a transport
#[derive(Clone, Debug)]
pub struct TransportRequest {
    /// Absolute http(s) URL
    pub url: String,
    /// Optional credentials
    pub auth: Option<Auth>,
    /// Byte offset to start from; `0` means the whole resource
    pub offset: u64,
}

/// Response headers plus a streaming body
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Length of *this* body, if the server announced a parseable one
    pub content_length: Option<u64>,
    /// The server honoured the requested range (HTTP 206)
    pub partial: bool,
    /// Body chunks
    pub body: ByteStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("partial", &self.partial)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    /// 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Abstraction over HTTP fetching, enabling testability
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issue a GET and return once headers have arrived
    async fn request(
        &self,
        request: &TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// Production [`HttpTransport`] backed by a shared `reqwest::Client`
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client from the HTTP settings
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn request(
        &self,
        request: &TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let url = url::Url::parse(&request.url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", request.url, e)))?;

        let mut builder = self.client.get(url);
        builder = match &request.auth {
            Some(Auth::Basic { username, password }) => {
                builder.basic_auth(username, password.as_ref())
            }
            Some(Auth::Bearer { token }) => builder.bearer_auth(token),
            None => builder,
        };
        if request.offset > 0 {
            builder = builder.header(reqwest::header::RANGE, format!("bytes={}-", request.offset));
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;

        let status = response.status();
        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify_body_error))
            .boxed();

        Ok(TransportResponse {
            status: status.as_u16(),
            content_length,
            partial: status == reqwest::StatusCode::PARTIAL_CONTENT,
            body,
        })
    }
}

/// Map a request-phase reqwest error onto the retry classification
fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_builder() {
        TransportError::InvalidUrl(e.to_string())
    } else if has_transient_io_source(&e) {
        TransportError::Interrupted(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

/// Errors while streaming the body are interruptions unless they are timeouts
fn classify_body_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_body() || e.is_decode() || has_transient_io_source(&e) {
        TransportError::Interrupted(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

fn has_transient_io_source(e: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return io.is_retryable();
        }
        source = err.source();
    }
    false
}
