//! Relay node model and discovery snapshots.

use crate::error::DiscoveryError;
use serde::Serialize;
use std::collections::HashSet;
use std::net::Ipv6Addr;

/// Built-in relay nodes used when no discovery endpoint is configured or the
/// endpoint cannot be reached: (address, identifier)
const DEFAULT_RELAY_NODES: &[(&str, &str)] = &[
    ("relay-us-east.prx.network:443", "us-east-1"),
    ("relay-eu-west.prx.network:443", "eu-west-1"),
    ("relay-ap-southeast.prx.network:443", "ap-southeast-1"),
];

/// A relay node endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RelayNode {
    address: String,
    #[serde(skip)]
    host: String,
    #[serde(skip)]
    port: u16,
    identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    weight: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u32>,
}

impl RelayNode {
    /// Create a node from a `host:port` address
    ///
    /// An empty identifier defaults to the address.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidAddress`] if `address` is not
    /// `host:port` with a port in 1..=65535.
    pub fn new(address: &str, identifier: &str) -> Result<Self, DiscoveryError> {
        let address = address.trim();
        let (host, port) = split_address(address)
            .ok_or_else(|| DiscoveryError::InvalidAddress(address.to_string()))?;
        let identifier = if identifier.trim().is_empty() {
            address.to_string()
        } else {
            identifier.trim().to_string()
        };
        Ok(Self {
            address: address.to_string(),
            host,
            port,
            identifier,
            weight: None,
            latency_ms: None,
        })
    }

    /// Set the weight hint
    #[must_use]
    pub fn with_weight(mut self, weight: Option<u32>) -> Self {
        self.weight = weight;
        self
    }

    /// Set the latency hint
    #[must_use]
    pub fn with_latency_ms(mut self, latency_ms: Option<u32>) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// `host:port` as published
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Host part (IPv6 without brackets), unresolved
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Opaque node identifier
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Weight hint, if published
    #[must_use]
    pub fn weight(&self) -> Option<u32> {
        self.weight
    }

    /// Latency hint in milliseconds, if published
    #[must_use]
    pub fn latency_ms(&self) -> Option<u32> {
        self.latency_ms
    }
}

/// Split `host:port` / `[v6]:port`
fn split_address(address: &str) -> Option<(String, u16)> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        host.parse::<Ipv6Addr>().ok()?;
        (host, after.strip_prefix(':')?)
    } else {
        let (host, port) = address.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        (host, port)
    };

    if host.is_empty() || host.contains(char::is_whitespace) {
        return None;
    }
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some((host.to_string(), port)),
    }
}

/// One complete discovery snapshot
///
/// Addresses are unique; when a document lists an address twice the first
/// entry wins. Order follows the source document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSet {
    nodes: Vec<RelayNode>,
}

impl NodeSet {
    /// Empty set
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a set, dropping duplicate addresses
    #[must_use]
    pub fn from_nodes(nodes: impl IntoIterator<Item = RelayNode>) -> Self {
        let mut seen = HashSet::new();
        let nodes = nodes
            .into_iter()
            .filter(|node| seen.insert(node.address.clone()))
            .collect();
        Self { nodes }
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the set has no nodes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over nodes in document order
    pub fn iter(&self) -> impl Iterator<Item = &RelayNode> {
        self.nodes.iter()
    }

    /// Look up a node by address
    #[must_use]
    pub fn get(&self, address: &str) -> Option<&RelayNode> {
        self.nodes.iter().find(|node| node.address == address)
    }

    /// True if a node with this address is in the set
    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    /// Position of a node within the set
    #[must_use]
    pub fn position(&self, address: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.address == address)
    }

    /// Addresses in document order
    #[must_use]
    pub fn addresses(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.address.as_str()).collect()
    }

    /// JSON array of addresses
    #[must_use]
    pub fn addresses_json(&self) -> String {
        serde_json::to_string(&self.addresses()).unwrap_or_else(|_| "[]".to_string())
    }
}

impl<'a> IntoIterator for &'a NodeSet {
    type Item = &'a RelayNode;
    type IntoIter = std::slice::Iter<'a, RelayNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

/// The built-in default node set
#[must_use]
pub fn default_nodes() -> NodeSet {
    NodeSet::from_nodes(
        DEFAULT_RELAY_NODES
            .iter()
            .filter_map(|(address, id)| RelayNode::new(address, id).ok()),
    )
}
