//! Error types for proxy parsing and proxy handshakes.

use thiserror::Error;

/// Errors produced while parsing a proxy URL
///
/// Parsing never yields a partial directive: any of these errors means the
/// whole URL was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Scheme is not exactly `http` or `socks5`
    #[error("Unsupported proxy scheme: {0:?} (expected lowercase \"http\" or \"socks5\")")]
    UnsupportedScheme(String),

    /// Port is missing, non-numeric, zero or above 65535
    #[error("Invalid proxy port: {0:?}")]
    InvalidPort(String),

    /// Credentials contain malformed percent-encoding or unencoded reserved characters
    #[error("Invalid proxy credential encoding: {0}")]
    InvalidEncoding(String),

    /// Authority has no host
    #[error("Proxy URL has no host")]
    MissingHost,

    /// Structurally invalid URL
    #[error("Malformed proxy URL: {0}")]
    Malformed(String),
}

/// Errors produced while opening a tunnel through a proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Network I/O failure talking to the proxy
    #[error("Proxy I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Proxy did not answer within the handshake timeout
    #[error("Proxy handshake timed out")]
    Timeout,

    /// Proxy rejected the supplied credentials
    #[error("Proxy authentication failed: {0}")]
    AuthFailed(String),

    /// Proxy refused to open the tunnel
    #[error("Proxy refused tunnel: {0}")]
    Rejected(String),

    /// Proxy spoke something we did not expect
    #[error("Proxy protocol error: {0}")]
    Protocol(String),
}

impl ProxyError {
    /// Returns true if retrying the same proxy may succeed
    ///
    /// Authentication failures are permanent until the configuration changes.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProxyError::AuthFailed(_))
    }
}
