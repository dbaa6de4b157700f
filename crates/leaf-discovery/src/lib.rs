//! # Relay Leaf Discovery
//!
//! Relay node discovery for the Relay Leaf client.
//!
//! This crate provides:
//! - [`RelayNode`] / [`NodeSet`]: the discovery snapshot model
//! - [`DiscoveryClient`]: fetches node lists from a discovery endpoint, or
//!   falls back to the built-in default set
//! - [`NodeDirectory`]: holds the current snapshot and swaps it atomically
//!
//! ## Snapshot semantics
//!
//! Each successful discovery round produces a complete [`NodeSet`] that
//! replaces the previous one wholesale. Entries are never merged, so a node
//! that disappears from the endpoint disappears from the snapshot in the same
//! swap.
//!
//! ## Example
//!
//! ```rust,no_run
//! use leaf_discovery::{DiscoveryClient, DiscoveryConfig};
//!
//! # async fn run() -> Result<(), leaf_discovery::DiscoveryError> {
//! let config = DiscoveryConfig::with_endpoint("https://discovery.example/relay/nodes")?;
//! let client = DiscoveryClient::new(config)?;
//!
//! let (nodes, error) = client.discover_or_fallback().await;
//! if let Some(error) = error {
//!     eprintln!("discovery failed, using defaults: {error}");
//! }
//! println!("{} relay nodes", nodes.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod directory;
pub mod document;
pub mod error;
pub mod node;

pub use client::{DiscoveryClient, DiscoveryConfig, validate_endpoint};
pub use directory::NodeDirectory;
pub use document::parse_document;
pub use error::DiscoveryError;
pub use node::{NodeSet, RelayNode, default_nodes};
