mod http_transport;
pub mod retry_policy;

use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

use crate::error::RelayError;

pub use http_transport::HttpTransport;

pub(crate) const STREAM_METHOD_PATH: &str = "streamGenerateContent?alt=sse";
const ERROR_BODY_MAX_BYTES: usize = 64 * 1024;

/// Response body as a fallible byte stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>;

/// One outbound streaming call.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub bearer: String,
    pub body: Bytes,
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: http::HeaderMap,
    pub body: ByteStream,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Seam between the failover engine and the network.
#[async_trait::async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Send a request and return once response headers have arrived.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] when no response was received.
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, RelayError>;
}

/// `<endpoint>/streamGenerateContent?alt=sse`; a base ending in `:` is
/// joined without a slash.
#[must_use]
pub fn stream_url(endpoint: &str) -> String {
    let base = endpoint.trim();
    let mut url = String::with_capacity(base.len() + STREAM_METHOD_PATH.len() + 1);
    if base.ends_with(':') {
        url.push_str(base);
    } else {
        url.push_str(base.trim_end_matches('/'));
        url.push('/');
    }
    url.push_str(STREAM_METHOD_PATH);
    url
}

/// Collect an error body as text, keeping at most 64 KiB.
pub async fn read_body_text(mut body: ByteStream) -> String {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                let room = ERROR_BODY_MAX_BYTES.saturating_sub(buf.len());
                buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
                if buf.len() >= ERROR_BODY_MAX_BYTES {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "error body read failed");
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
