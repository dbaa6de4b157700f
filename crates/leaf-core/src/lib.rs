//! # Relay Leaf Core
//!
//! Client runtime for the Relay Leaf relay network.
//!
//! This crate provides:
//! - [`RelayClient`]: the start/stop facade host applications embed
//! - Relay wire protocol (length-prefixed frames)
//! - Session state machine and per-node connection supervision
//! - Stream multiplexing over a Session
//! - Lock-free stats counters and JSON snapshots
//! - Error types with stable numeric codes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        RelayClient                               │
//! │   (lifecycle, config, discovery loop, stats snapshot)           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     ConnectionManager                            │
//! │   (one supervisor per node, backoff, proxy selection)           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Session  ──►  Streams                         │
//! │   (handshake, keepalive, health, multiplexed streams)           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │               Direct TCP  |  HTTP CONNECT  |  SOCKS5            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod mux;
pub mod protocol;
pub mod selection;
pub mod session;
pub mod stats;

pub use backoff::{Backoff, ProxySelection, RetryConfig};
pub use client::RelayClient;
pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionSettings};
pub use error::{ClientError, ConnectionError, ProtocolError, StreamError, error_message};
pub use mux::{STREAM_INBOUND_CAPACITY, Stream, StreamState};
pub use protocol::{
    DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, MAX_DATA_PAYLOAD, PARTNER_ID_HEADER,
    PROTOCOL_VERSION, RelayMessage, read_frame, write_frame,
};
pub use selection::ProxyPool;
pub use session::{Session, SessionState, Transport};
pub use stats::{ExitPoint, StatsAggregator, StatsSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library version string
#[must_use]
pub fn version() -> &'static str {
    VERSION
}
