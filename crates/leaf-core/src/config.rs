//! Client configuration.

use crate::backoff::{ProxySelection, RetryConfig};
use crate::error::ClientError;
use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, MAX_DATA_PAYLOAD};
use leaf_discovery::{DiscoveryConfig, NodeSet, RelayNode, default_nodes, validate_endpoint};
use leaf_proxy::ProxyDirective;
use std::time::Duration;
use url::Url;

/// Smallest accepted `max_frame_size`: one full `Data` frame plus overhead
const MIN_FRAME_SIZE: usize = MAX_DATA_PAYLOAD + 64;

/// Relay client configuration
///
/// Every field has a default; construct with [`ClientConfig::default`] and
/// override what you need:
///
/// ```
/// use leaf_core::ClientConfig;
///
/// let config = ClientConfig::default()
///     .with_partner_id("acme")
///     .with_proxy("socks5://127.0.0.1:1080");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Discovery endpoint; absent or empty means the default node set
    pub discovery_url: Option<String>,
    /// Sent as the `x-partner-id` handshake header when non-empty
    pub partner_id: Option<String>,
    /// Ordered proxy URLs; empty means direct connections
    pub proxies: Vec<String>,
    /// Per-attempt / per-frame diagnostic logging
    pub verbose: bool,

    /// Device identifier sent in `Hello`; random when absent
    pub device_id: Option<String>,
    /// Replaces the built-in fallback node set
    pub default_nodes: Option<Vec<String>>,
    /// Reconnection backoff
    pub retry: RetryConfig,
    /// Proxy choice per dial attempt
    pub proxy_selection: ProxySelection,
    /// TCP connect / proxy tunnel timeout
    pub connect_timeout: Duration,
    /// Relay handshake timeout
    pub handshake_timeout: Duration,
    /// Discovery fetch timeout
    pub discovery_timeout: Duration,
    /// Time between discovery rounds
    pub rediscovery_interval: Duration,
    /// Time between keepalive pings
    pub keepalive_interval: Duration,
    /// Inbound silence before a Session is Degraded
    pub degraded_after: Duration,
    /// Inbound silence before a Session is closed
    pub dead_after: Duration,
    /// How long `stop()` waits for tasks before aborting them
    pub shutdown_grace: Duration,
    /// Largest accepted wire frame
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery_url: None,
            partner_id: None,
            proxies: Vec::new(),
            verbose: false,
            device_id: None,
            default_nodes: None,
            retry: RetryConfig::default(),
            proxy_selection: ProxySelection::default(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(10),
            rediscovery_interval: Duration::from_secs(300),
            keepalive_interval: Duration::from_secs(15),
            degraded_after: Duration::from_secs(30),
            dead_after: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Set the discovery endpoint
    #[must_use]
    pub fn with_discovery_url(mut self, url: impl Into<String>) -> Self {
        self.discovery_url = Some(url.into());
        self
    }

    /// Set the partner identifier
    #[must_use]
    pub fn with_partner_id(mut self, partner_id: impl Into<String>) -> Self {
        self.partner_id = Some(partner_id.into());
        self
    }

    /// Append a proxy URL
    #[must_use]
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxies.push(proxy.into());
        self
    }

    /// Enable diagnostic logging
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Replace the fallback node set
    #[must_use]
    pub fn with_default_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_nodes = Some(nodes.into_iter().map(Into::into).collect());
        self
    }

    /// Validate the whole configuration
    ///
    /// # Errors
    ///
    /// Returns the first problem found; proxy URLs are checked in list order.
    pub fn validate(&self) -> Result<(), ClientError> {
        self.resolve().map(|_| ())
    }

    /// Discovery settings for this configuration
    ///
    /// The fetch goes through the first proxy, if any.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`validate`](Self::validate).
    pub fn discovery_config(&self) -> Result<DiscoveryConfig, ClientError> {
        Ok(self.resolve()?.discovery_config(self.discovery_timeout))
    }

    /// Validate and parse into runtime form
    pub(crate) fn resolve(&self) -> Result<ResolvedConfig, ClientError> {
        let proxies = parse_proxies(&self.proxies)?;
        let discovery_url = parse_discovery_url(self.discovery_url.as_deref())?;
        let default_nodes = match &self.default_nodes {
            None => default_nodes(),
            Some(addresses) => parse_default_nodes(addresses)?,
        };

        if let Some(device_id) = &self.device_id {
            if device_id.trim().is_empty() || device_id.len() > 256 {
                return Err(ClientError::InvalidConfig(
                    "device_id must be 1..=256 characters".to_string(),
                ));
            }
        }

        self.retry.validate().map_err(ClientError::InvalidConfig)?;

        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("discovery_timeout", self.discovery_timeout),
            ("rediscovery_interval", self.rediscovery_interval),
            ("keepalive_interval", self.keepalive_interval),
            ("degraded_after", self.degraded_after),
            ("dead_after", self.dead_after),
        ] {
            if value.is_zero() {
                return Err(ClientError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }

        if self.keepalive_interval >= self.degraded_after {
            return Err(ClientError::InvalidConfig(
                "keepalive_interval must be shorter than degraded_after".to_string(),
            ));
        }
        if self.degraded_after > self.dead_after {
            return Err(ClientError::InvalidConfig(
                "degraded_after must not exceed dead_after".to_string(),
            ));
        }
        if self.max_frame_size < MIN_FRAME_SIZE || u32::try_from(self.max_frame_size).is_err() {
            return Err(ClientError::InvalidConfig(format!(
                "max_frame_size must be between {MIN_FRAME_SIZE} and {}",
                u32::MAX
            )));
        }

        Ok(ResolvedConfig {
            proxies,
            discovery_url,
            default_nodes,
        })
    }
}

/// Parsed, validated view of the parts of [`ClientConfig`] that are strings
#[derive(Debug, Clone)]
pub(crate) struct ResolvedConfig {
    pub proxies: Vec<ProxyDirective>,
    pub discovery_url: Option<Url>,
    pub default_nodes: NodeSet,
}

impl ResolvedConfig {
    pub fn discovery_config(&self, timeout: Duration) -> DiscoveryConfig {
        DiscoveryConfig {
            endpoint: self.discovery_url.clone(),
            proxy: self.proxies.first().cloned(),
            timeout,
            defaults: self.default_nodes.clone(),
            user_agent: format!("relay-leaf/{}", crate::VERSION),
        }
    }
}

/// Parse proxy URLs in order, failing on the first bad one
pub(crate) fn parse_proxies(proxies: &[String]) -> Result<Vec<ProxyDirective>, ClientError> {
    proxies
        .iter()
        .enumerate()
        .map(|(index, url)| {
            ProxyDirective::parse(url).map_err(|source| ClientError::InvalidProxy { index, source })
        })
        .collect()
}

/// Validate an optional discovery URL; empty counts as absent
pub(crate) fn parse_discovery_url(url: Option<&str>) -> Result<Option<Url>, ClientError> {
    match url.map(str::trim).filter(|url| !url.is_empty()) {
        None => Ok(None),
        Some(url) => validate_endpoint(url)
            .map(Some)
            .map_err(|e| ClientError::InvalidDiscoveryUrl(e.to_string())),
    }
}

fn parse_default_nodes(addresses: &[String]) -> Result<NodeSet, ClientError> {
    if addresses.is_empty() {
        return Err(ClientError::InvalidConfig(
            "default_nodes must list at least one address".to_string(),
        ));
    }
    let nodes = addresses
        .iter()
        .map(|address| {
            RelayNode::new(address, "").map_err(|e| ClientError::InvalidConfig(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(NodeSet::from_nodes(nodes))
}
