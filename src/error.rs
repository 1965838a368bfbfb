// Error taxonomy surfaced to callers of the bundle engine.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleError {
    /// The running platform has no target in the configuration.
    #[error("platform '{0}' has no configured bundle target")]
    PlatformNotConfigured(String),

    /// The manifest could not be fetched or parsed.
    #[error("bundle manifest unavailable: {0}")]
    ManifestUnavailable(String),

    /// Network retrieval failed and no packaged fallback exists. `status` is 0
    /// for connectivity errors.
    #[error("retrieval of bundle '{name}' failed (status {status})")]
    RetrievalFailed { name: String, status: u16 },

    /// The bytes arrived but the decoder rejected them, and no packaged
    /// fallback could be decoded either.
    #[error("bundle '{name}' could not be decoded: {reason}")]
    DecodeFailed { name: String, reason: String },

    #[error("cyclic dependency involving bundle '{0}'")]
    CyclicDependency(String),

    #[error("aborted: bundle engine is shutting down")]
    AbortedByShutdown,

    #[error("bundle '{0}' is not in the catalog")]
    UnknownBundle(String),

    #[error("bundle '{name}' still has {consumers} consumer(s)")]
    BundleInUse { name: String, consumers: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BundleError {
    /// Whether the caller should present this as "check connection and retry".
    pub fn is_retryable(&self) -> bool {
        matches!(self, BundleError::RetrievalFailed { .. })
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, BundleError::AbortedByShutdown)
    }
}

pub type BundleResult<T> = Result<T, BundleError>;
