//! Discovery error types.

use thiserror::Error;

/// Discovery errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Endpoint unreachable, returned an error status, or served a document
    /// with no usable nodes. Callers fall back to the default node set.
    #[error("Discovery unavailable: {0}")]
    Unavailable(String),

    /// Discovery URL is not an absolute http(s) URL
    #[error("Invalid discovery URL: {0}")]
    InvalidUrl(String),

    /// Relay node address is not `host:port`
    #[error("Invalid relay node address: {0:?}")]
    InvalidAddress(String),

    /// HTTP client could not be configured
    #[error("Discovery configuration error: {0}")]
    InvalidConfig(String),
}

impl DiscoveryError {
    /// Returns true if the failure happened at runtime and the default node
    /// set should be used instead
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        matches!(self, DiscoveryError::Unavailable(_))
    }
}
