use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::catalog::ContentHash;
use crate::config::PlatformTarget;

/// One bundle download request.
pub struct BundleRequest<'a> {
    pub target: &'a PlatformTarget,
    pub name: &'a str,
    /// Hash the catalog currently publishes for this bundle.
    pub hash: ContentHash,
    /// Set when the caller still holds the bytes for this hash locally; the
    /// transport may answer `NotModified` instead of re-sending them.
    pub if_none_match: Option<ContentHash>,
}

#[derive(Debug)]
pub enum FetchResponse {
    Content(Bytes),
    NotModified,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("connection error: {0}")]
    Connection(String),
    /// Body declared or delivered more than `limit` bytes.
    #[error("response of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
}

impl SourceError {
    /// HTTP status, or 0 when there is no usable one (server unreachable,
    /// body rejected).
    pub fn status_code(&self) -> u16 {
        match self {
            SourceError::Status(code) => *code,
            SourceError::Connection(_) | SourceError::TooLarge { .. } => 0,
        }
    }

    /// Client errors are final; timeouts, throttling, 5xx and connectivity
    /// errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            SourceError::Connection(_) => true,
            SourceError::TooLarge { .. } => false,
        }
    }
}

/// Receives `(bytes_received, content_length)` while a body streams in.
pub type ByteProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

#[async_trait]
pub trait BundleSource: Send + Sync {
    async fn fetch_manifest(&self, target: &PlatformTarget) -> Result<Bytes, SourceError>;

    async fn fetch_bundle(
        &self,
        request: &BundleRequest<'_>,
        on_bytes: ByteProgress<'_>,
    ) -> Result<FetchResponse, SourceError>;
}
