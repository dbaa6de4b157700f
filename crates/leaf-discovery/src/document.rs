//! Discovery document parsing.
//!
//! The discovery endpoint is an external collaborator whose schema evolves,
//! so parsing is lenient about shape and strict about addresses:
//!
//! ```text
//! [ "host:port", {...}, ... ]                   top-level array
//! { "nodes":  [ ... ], "anything": ... }        wrapped ("relays" / "data" also accepted)
//!
//! entry := "host:port"
//!        | { "address" | "addr" | "endpoint": "host:port",
//!            "host": "...", "port": 443 | "443",
//!            "id" | "identifier" | "nodeId" | "node_id": "..." | 17,
//!            "weight": 10, "latencyMs" | "latency_ms": 42, ... }
//! ```
//!
//! Unknown fields are ignored. Entries without a usable address are skipped.

use crate::error::DiscoveryError;
use crate::node::{NodeSet, RelayNode};
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize)]
#[serde(untagged)]
enum DiscoveryDocument {
    List(Vec<NodeEntry>),
    Wrapped(WrappedDocument),
}

#[derive(Deserialize)]
struct WrappedDocument {
    #[serde(alias = "relays", alias = "data")]
    nodes: Vec<NodeEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NodeEntry {
    Address(String),
    Object(NodeObject),
    Other(Value),
}

#[derive(Deserialize, Default)]
struct NodeObject {
    #[serde(default, alias = "addr", alias = "endpoint")]
    address: Option<Value>,
    #[serde(default)]
    host: Option<Value>,
    #[serde(default)]
    port: Option<Value>,
    #[serde(default, alias = "identifier", alias = "nodeId", alias = "node_id")]
    id: Option<Value>,
    #[serde(default)]
    weight: Option<Value>,
    #[serde(default, alias = "latencyMs")]
    latency_ms: Option<Value>,
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
            .and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl NodeObject {
    fn address(&self) -> Option<String> {
        if let Some(address) = self.address.as_ref().and_then(value_to_string) {
            return Some(address);
        }
        let host = self.host.as_ref().and_then(value_to_string)?;
        let port = self.port.as_ref().and_then(value_to_string)?;
        if host.contains(':') && !host.starts_with('[') {
            Some(format!("[{host}]:{port}"))
        } else {
            Some(format!("{host}:{port}"))
        }
    }

    fn into_node(self) -> Option<RelayNode> {
        let address = self.address()?;
        let id = self
            .id
            .as_ref()
            .and_then(value_to_string)
            .unwrap_or_default();
        let node = RelayNode::new(&address, &id).ok()?;
        Some(
            node.with_weight(self.weight.as_ref().and_then(value_to_u32))
                .with_latency_ms(self.latency_ms.as_ref().and_then(value_to_u32)),
        )
    }
}

impl NodeEntry {
    fn into_node(self) -> Option<RelayNode> {
        match self {
            NodeEntry::Address(address) => RelayNode::new(&address, "").ok(),
            NodeEntry::Object(object) => object.into_node(),
            NodeEntry::Other(_) => None,
        }
    }
}

/// Parse a discovery document into a node set
///
/// # Errors
///
/// Returns [`DiscoveryError::Unavailable`] if the body is not a recognised
/// document or contains no usable node.
pub fn parse_document(body: &[u8]) -> Result<NodeSet, DiscoveryError> {
    let document: DiscoveryDocument = serde_json::from_slice(body)
        .map_err(|e| DiscoveryError::Unavailable(format!("malformed discovery document: {e}")))?;

    let entries = match document {
        DiscoveryDocument::List(entries) => entries,
        DiscoveryDocument::Wrapped(wrapped) => wrapped.nodes,
    };

    let total = entries.len();
    let nodes = NodeSet::from_nodes(entries.into_iter().filter_map(NodeEntry::into_node));

    if nodes.len() < total {
        tracing::debug!(
            "Discovery document: skipped {} of {} entries",
            total - nodes.len(),
            total
        );
    }

    if nodes.is_empty() {
        return Err(DiscoveryError::Unavailable(
            "discovery document lists no usable relay nodes".to_string(),
        ));
    }

    Ok(nodes)
}
