//! Error types for the relay client runtime
//!
//! Errors are split by the layer that produces them so callers can decide
//! how far a failure propagates:
//!
//! - **[`ClientError`]**: configuration and lifecycle errors returned
//!   synchronously by the facade
//! - **[`ConnectionError`]**: per-Session failures, absorbed by the
//!   Connection Manager (backoff + retry) and surfaced through `lastError`
//! - **[`StreamError`]**: per-Stream failures, closing only that Stream
//! - **[`ProtocolError`]**: wire framing failures, wrapped by the above
//!
//! # Example
//!
//! ```
//! use leaf_core::{ClientError, error_message};
//!
//! let err = ClientError::NoRuntime;
//! assert_eq!(error_message(err.code()), "no Tokio runtime available");
//! ```

use crate::session::SessionState;
use leaf_proxy::{ParseError, ProxyError};
use thiserror::Error;

/// Wire framing errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying transport failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),

    /// Frame payload is not a valid message
    #[error("Decode error: {0}")]
    Decode(String),

    /// Frame length exceeds the configured maximum
    #[error("Frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Announced or encoded size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Valid message arriving where it makes no sense
    #[error("Unexpected {0} message")]
    Unexpected(&'static str),
}

/// Per-Session connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Direct TCP connect failed
    #[error("Dial failed: {0}")]
    Dial(String),

    /// Proxy tunnel could not be opened
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// A phase did not complete in time
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Relay refused the handshake
    #[error("Relay rejected session (code {code}): {reason}")]
    Rejected {
        /// Relay-defined reject code
        code: u16,
        /// Human-readable reason
        reason: String,
    },

    /// Wire protocol violation or framing failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session ended (relay hung up, health timeout, write failure)
    #[error("Session closed: {0}")]
    Closed(String),

    /// Invalid state machine transition
    #[error("Invalid session transition {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: SessionState,
        /// Requested state
        to: SessionState,
    },
}

impl ConnectionError {
    /// Returns true if the failure is likely to clear up on its own
    ///
    /// Non-transient failures (relay rejects, proxy authentication errors)
    /// are still retried with backoff, but logged louder.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectionError::Dial(_)
            | ConnectionError::Timeout(_)
            | ConnectionError::Closed(_)
            | ConnectionError::Protocol(ProtocolError::Io(_)) => true,
            ConnectionError::Proxy(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Per-Stream errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Stream is closed (locally, remotely, or by Session teardown)
    #[error("Stream {0} is closed")]
    Closed(u64),

    /// Relay reset the stream
    #[error("Stream {0} was reset by the relay")]
    Reset(u64),

    /// Reader fell too far behind; the stream was reset locally
    #[error("Stream {0} inbound queue overflowed")]
    Overflow(u64),

    /// Parent Session is gone or can no longer send
    #[error("Session is closed")]
    SessionClosed,
}

/// Facade errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// A configured proxy URL failed to parse
    #[error("Invalid proxy #{index}: {source}")]
    InvalidProxy {
        /// Position in the configured list
        index: usize,
        /// Parse failure
        #[source]
        source: ParseError,
    },

    /// Discovery URL is not an absolute http(s) URL
    #[error("Invalid discovery URL: {0}")]
    InvalidDiscoveryUrl(String),

    /// Some other configuration value is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `start()` was called outside a Tokio runtime
    #[error("start() must be called from within a Tokio runtime")]
    NoRuntime,

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// No live Session to open a stream on
    #[error("No connected relay session")]
    NotConnected,

    /// Stream failure surfaced by the facade
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Stable numeric codes for [`ClientError`]
const ERROR_CODES: &[(u32, &str)] = &[
    (0, "success"),
    (1, "invalid proxy URL"),
    (2, "invalid discovery URL"),
    (3, "invalid configuration"),
    (4, "no Tokio runtime available"),
    (5, "operation not allowed in current state"),
    (6, "no connected relay session"),
    (7, "stream error"),
];

impl ClientError {
    /// Stable numeric code, see [`error_message`]
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            ClientError::InvalidProxy { .. } => 1,
            ClientError::InvalidDiscoveryUrl(_) => 2,
            ClientError::InvalidConfig(_) => 3,
            ClientError::NoRuntime => 4,
            ClientError::InvalidState(_) => 5,
            ClientError::NotConnected => 6,
            ClientError::Stream(_) => 7,
        }
    }

    /// Returns true if this error comes from configuration validation
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidProxy { .. }
                | ClientError::InvalidDiscoveryUrl(_)
                | ClientError::InvalidConfig(_)
        )
    }
}

/// Map an error code back to a short description
#[must_use]
pub fn error_message(code: u32) -> &'static str {
    ERROR_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map_or("unknown error", |(_, message)| message)
}
