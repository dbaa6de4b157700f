//! Discovery endpoint client.

use crate::document::parse_document;
use crate::error::DiscoveryError;
use crate::node::{NodeSet, default_nodes};
use leaf_proxy::{ProxyDirective, ProxyScheme};
use std::time::Duration;
use url::Url;

/// Default timeout for one discovery fetch
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest discovery document accepted
const MAX_DOCUMENT_SIZE: usize = 1024 * 1024;

/// Validate a discovery endpoint URL
///
/// # Errors
///
/// Returns [`DiscoveryError::InvalidUrl`] unless `raw` is an absolute
/// `http` or `https` URL with a host.
pub fn validate_endpoint(raw: &str) -> Result<Url, DiscoveryError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| DiscoveryError::InvalidUrl(format!("{raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DiscoveryError::InvalidUrl(format!(
            "{raw:?}: scheme must be http or https"
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(DiscoveryError::InvalidUrl(format!("{raw:?}: missing host")));
    }
    Ok(url)
}

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Discovery endpoint; `None` means "use the default set"
    pub endpoint: Option<Url>,
    /// Proxy the fetch goes through, if any
    pub proxy: Option<ProxyDirective>,
    /// Timeout for one fetch (connect + body)
    pub timeout: Duration,
    /// Node set used when the endpoint is absent or unavailable
    pub defaults: NodeSet,
    /// `User-Agent` sent with the fetch
    pub user_agent: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            proxy: None,
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
            defaults: default_nodes(),
            user_agent: format!("relay-leaf/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DiscoveryConfig {
    /// Configuration for a given endpoint
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidUrl`] if the endpoint is invalid.
    pub fn with_endpoint(endpoint: &str) -> Result<Self, DiscoveryError> {
        Ok(Self {
            endpoint: Some(validate_endpoint(endpoint)?),
            ..Self::default()
        })
    }
}

/// Fetches relay node lists
pub struct DiscoveryClient {
    endpoint: Option<Url>,
    http: reqwest::Client,
    defaults: NodeSet,
}

impl DiscoveryClient {
    /// Build a discovery client
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidConfig`] if the HTTP client cannot be
    /// built (e.g. the proxy is unusable by the HTTP stack).
    pub fn new(config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .user_agent(config.user_agent);

        if let Some(directive) = &config.proxy {
            // socks5h: the endpoint host is resolved by the proxy
            let proxy_url = match directive.scheme() {
                ProxyScheme::Socks5 => format!("socks5h://{}", directive.authority()),
                ProxyScheme::Http => directive.url_without_credentials(),
            };
            let mut proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| DiscoveryError::InvalidConfig(e.to_string()))?;
            if let Some(creds) = directive.credentials() {
                proxy = proxy.basic_auth(creds.username(), creds.password());
            }
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        let http = builder
            .build()
            .map_err(|e| DiscoveryError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            endpoint: config.endpoint,
            http,
            defaults: config.defaults,
        })
    }

    /// Configured endpoint, if any
    #[must_use]
    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }

    /// Built-in fallback set
    #[must_use]
    pub fn defaults(&self) -> &NodeSet {
        &self.defaults
    }

    /// Run one discovery round
    ///
    /// Without an endpoint this returns the default set unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Unavailable`] if the endpoint is unreachable,
    /// answers with a non-success status, or serves an unusable document.
    pub async fn discover(&self) -> Result<NodeSet, DiscoveryError> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(self.defaults.clone());
        };

        tracing::debug!("Fetching relay nodes from {}", endpoint);

        let mut response = self
            .http
            .get(endpoint.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| DiscoveryError::Unavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Unavailable(format!(
                "endpoint answered HTTP {status}"
            )));
        }

        let too_large = |len: u64| {
            DiscoveryError::Unavailable(format!(
                "discovery document too large ({len} bytes, limit {MAX_DOCUMENT_SIZE})"
            ))
        };
        if let Some(len) = response
            .content_length()
            .filter(|&len| len > MAX_DOCUMENT_SIZE as u64)
        {
            return Err(too_large(len));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| DiscoveryError::Unavailable(format!("reading body failed: {e}")))?
        {
            if body.len() + chunk.len() > MAX_DOCUMENT_SIZE {
                return Err(too_large((body.len() + chunk.len()) as u64));
            }
            body.extend_from_slice(&chunk);
        }

        let nodes = parse_document(&body)?;
        tracing::info!("Discovered {} relay nodes from {}", nodes.len(), endpoint);
        Ok(nodes)
    }

    /// Run one discovery round, substituting the default set on failure
    ///
    /// The error, if any, is returned alongside so the caller can record it.
    pub async fn discover_or_fallback(&self) -> (NodeSet, Option<DiscoveryError>) {
        match self.discover().await {
            Ok(nodes) => (nodes, None),
            Err(e) => {
                tracing::warn!("{}; using {} default relay nodes", e, self.defaults.len());
                (self.defaults.clone(), Some(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::RelayNode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response, returning the endpoint URL
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = sock.write_all(response.as_bytes()).await;
        });
        format!("http://{addr}/relay/nodes")
    }

    /// Serve one response with raw extra headers, closing after the body
    async fn serve_once_owned(status: &'static str, headers: String, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let head = format!("HTTP/1.1 {status}\r\n{headers}Connection: close\r\n\r\n");
            let _ = sock.write_all(head.as_bytes()).await;
            let _ = sock.write_all(body.as_bytes()).await;
        });
        format!("http://{addr}/relay/nodes")
    }

    fn client_for(endpoint: &str) -> DiscoveryClient {
        let mut config = DiscoveryConfig::with_endpoint(endpoint).unwrap();
        config.timeout = Duration::from_secs(2);
        config.defaults = NodeSet::from_nodes([RelayNode::new("fallback.example:443", "fb").unwrap()]);
        DiscoveryClient::new(config).unwrap()
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("https://api.example/relay/nodes").is_ok());
        assert!(validate_endpoint("http://127.0.0.1:8080").is_ok());
        assert!(matches!(
            validate_endpoint("ftp://api.example/nodes"),
            Err(DiscoveryError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_endpoint("not a url"),
            Err(DiscoveryError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_no_endpoint_returns_defaults() {
        let client = DiscoveryClient::new(DiscoveryConfig::default()).unwrap();
        assert!(client.endpoint().is_none());
        let nodes = client.discover().await.unwrap();
        assert_eq!(nodes, default_nodes());
    }

    #[tokio::test]
    async fn test_discover_from_endpoint() {
        let endpoint = serve_once("200 OK", r#"{"nodes":[{"address":"r1.example:443","id":"r1"}]}"#).await;
        let client = client_for(&endpoint);
        let nodes = client.discover().await.unwrap();
        assert_eq!(nodes.addresses(), vec!["r1.example:443"]);
    }

    #[tokio::test]
    async fn test_error_status_is_unavailable() {
        let endpoint = serve_once("503 Service Unavailable", "{}").await;
        let client = client_for(&endpoint);
        assert!(matches!(
            client.discover().await,
            Err(DiscoveryError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_falls_back() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = client_for(&format!("http://127.0.0.1:{port}/nodes"));
        let (nodes, error) = client.discover_or_fallback().await;
        assert_eq!(nodes.addresses(), vec!["fallback.example:443"]);
        assert!(matches!(error, Some(DiscoveryError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_oversized_document_rejected() {
        let endpoint = serve_once_owned(
            "200 OK",
            format!("Content-Length: {}\r\n", MAX_DOCUMENT_SIZE + 1),
            String::new(),
        )
        .await;
        let err = client_for(&endpoint).discover().await.unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");

        // No length header: the body is cut off while streaming
        let endpoint = serve_once_owned(
            "200 OK",
            String::new(),
            "x".repeat(MAX_DOCUMENT_SIZE + 1),
        )
        .await;
        let err = client_for(&endpoint).discover().await.unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
    }

    #[tokio::test]
    async fn test_malformed_document_falls_back() {
        let endpoint = serve_once("200 OK", "not json").await;
        let client = client_for(&endpoint);
        let (nodes, error) = client.discover_or_fallback().await;
        assert_eq!(nodes.len(), 1);
        assert!(error.unwrap().is_fallback());
    }
}
