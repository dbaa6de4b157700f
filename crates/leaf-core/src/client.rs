//! Relay client facade.

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionSettings, signalled};
use crate::error::ClientError;
use crate::mux::Stream;
use crate::selection::ProxyPool;
use crate::stats::{StatsAggregator, StatsSnapshot};
use leaf_discovery::{DiscoveryClient, NodeDirectory, NodeSet};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time;

struct Running {
    shutdown: watch::Sender<bool>,
    manager: Arc<ConnectionManager>,
    discovery: JoinHandle<()>,
}

enum Lifecycle {
    Stopped,
    Running(Running),
    Stopping,
}

struct Inner {
    config: RwLock<ClientConfig>,
    device_id: String,
    stats: Arc<StatsAggregator>,
    directory: Arc<NodeDirectory>,
    lifecycle: Mutex<Lifecycle>,
    stop_done: Notify,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Lifecycle::Running(running) = self.lifecycle.get_mut() {
            running.shutdown.send_replace(true);
            running.discovery.abort();
        }
    }
}

/// Relay client
///
/// Owns discovery, the Connection Manager and the stats counters. Cheap to
/// clone; clones share the same client. Independent instances do not share
/// any state.
///
/// # Example
///
/// ```no_run
/// use leaf_core::{ClientConfig, RelayClient};
///
/// # async fn run() -> Result<(), leaf_core::ClientError> {
/// let client = RelayClient::new(
///     ClientConfig::default()
///         .with_partner_id("acme")
///         .with_proxy("socks5://127.0.0.1:1080"),
/// )?;
/// client.start()?;
/// println!("{}", client.stats().to_json());
/// client.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    /// Validate `config` and build a stopped client
    ///
    /// # Errors
    ///
    /// Returns the first configuration problem; a malformed proxy URL is
    /// never skipped.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let device_id = config
            .device_id
            .as_deref()
            .map(str::trim)
            .map_or_else(generate_device_id, str::to_string);

        Ok(Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                device_id,
                stats: Arc::new(StatsAggregator::new()),
                directory: Arc::new(NodeDirectory::new()),
                lifecycle: Mutex::new(Lifecycle::Stopped),
                stop_done: Notify::new(),
            }),
        })
    }

    /// Start discovery and connections in the background
    ///
    /// Returns immediately. Calling `start()` on a running client does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoRuntime`] outside a Tokio runtime and
    /// [`ClientError::InvalidState`] while a `stop()` is in progress.
    pub fn start(&self) -> Result<(), ClientError> {
        let handle = Handle::try_current().map_err(|_| ClientError::NoRuntime)?;

        let mut lifecycle = self.inner.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running(_) => return Ok(()),
            Lifecycle::Stopping => return Err(ClientError::InvalidState("stop() in progress")),
            Lifecycle::Stopped => {}
        }

        let config = self.inner.config.read().clone();
        let resolved = config.resolve()?;

        let discovery = DiscoveryClient::new(resolved.discovery_config(config.discovery_timeout))
            .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;

        let proxy_count = resolved.proxies.len();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let manager = Arc::new(ConnectionManager::new(
            ConnectionSettings::from_config(&config, &self.inner.device_id),
            ProxyPool::new(resolved.proxies, config.proxy_selection),
            Arc::clone(&self.inner.directory),
            Arc::clone(&self.inner.stats),
            shutdown_rx.clone(),
        ));

        self.inner.directory.clear();
        self.inner.stats.mark_started();

        let discovery = handle.spawn(discovery_loop(
            discovery,
            Arc::clone(&manager),
            Arc::clone(&self.inner.directory),
            Arc::clone(&self.inner.stats),
            config.rediscovery_interval,
            shutdown_rx,
        ));

        *lifecycle = Lifecycle::Running(Running {
            shutdown,
            manager,
            discovery,
        });

        tracing::info!(
            "Relay client started (device {}, {} proxies, discovery {})",
            self.inner.device_id,
            proxy_count,
            resolved
                .discovery_url
                .as_ref()
                .map_or_else(|| "built-in nodes".to_string(), ToString::to_string)
        );
        Ok(())
    }

    /// Stop everything and wait for background tasks
    ///
    /// Waits at most the configured shutdown grace period, then aborts
    /// what is left. Every Session and Stream is closed when this returns.
    /// Stopping a stopped client does nothing.
    pub async fn stop(&self) {
        let (running, in_progress) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Running(running) => (Some(running), None),
                Lifecycle::Stopping => (None, Some(self.inner.stop_done.notified())),
                Lifecycle::Stopped => {
                    *lifecycle = Lifecycle::Stopped;
                    return;
                }
            }
        };

        let Some(running) = running else {
            if let Some(in_progress) = in_progress {
                in_progress.await;
            }
            return;
        };

        let grace = self.inner.config.read().shutdown_grace;
        let deadline = Instant::now() + grace;
        running.shutdown.send_replace(true);

        let mut discovery = running.discovery;
        if time::timeout_at(deadline.into(), &mut discovery).await.is_err() {
            discovery.abort();
        }
        running.manager.shutdown(deadline).await;

        self.inner.directory.clear();
        self.inner.stats.mark_stopped();

        {
            let mut lifecycle = self.inner.lifecycle.lock();
            *lifecycle = Lifecycle::Stopped;
            self.inner.stop_done.notify_waiters();
        }
        tracing::info!("Relay client stopped");
    }

    /// Current statistics; never blocks on I/O
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let nodes = self.inner.directory.current();
        let exit_points = self
            .manager()
            .map(|manager| manager.exit_points(&nodes))
            .unwrap_or_default();
        self.inner.stats.snapshot(&exit_points, &nodes)
    }

    /// True between `start()` and `stop()`
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.inner.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// Device identifier sent in handshakes
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Current discovery snapshot
    #[must_use]
    pub fn nodes(&self) -> Arc<NodeSet> {
        self.inner.directory.current()
    }

    /// Copy of the current configuration
    #[must_use]
    pub fn config(&self) -> ClientConfig {
        self.inner.config.read().clone()
    }

    /// Library version
    #[must_use]
    pub fn version() -> &'static str {
        crate::VERSION
    }

    /// Open a stream on the healthiest connected Session
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidState`] when stopped,
    /// [`ClientError::NotConnected`] with no live Session, or the
    /// [`StreamError`](crate::StreamError) of the open.
    pub async fn open_stream(&self) -> Result<Stream, ClientError> {
        let manager = self
            .manager()
            .ok_or(ClientError::InvalidState("client is not running"))?;
        let session = manager
            .least_loaded_session()
            .ok_or(ClientError::NotConnected)?;
        Ok(session.open_stream().await?)
    }

    /// Change the discovery endpoint (empty clears it); only while stopped
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidDiscoveryUrl`] for a bad URL and
    /// [`ClientError::InvalidState`] while running.
    pub fn set_discovery_url(&self, url: &str) -> Result<(), ClientError> {
        let url = url.trim();
        self.update_config(|config| {
            config.discovery_url = (!url.is_empty()).then(|| url.to_string());
        })
    }

    /// Change the partner identifier (empty clears it); only while stopped
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidState`] while running.
    pub fn set_partner_id(&self, partner_id: &str) -> Result<(), ClientError> {
        let partner_id = partner_id.trim();
        self.update_config(|config| {
            config.partner_id = (!partner_id.is_empty()).then(|| partner_id.to_string());
        })
    }

    /// Append a proxy URL; only while stopped
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidProxy`] for a bad URL (the proxy list is
    /// left unchanged) and [`ClientError::InvalidState`] while running.
    pub fn add_proxy(&self, url: &str) -> Result<(), ClientError> {
        self.update_config(|config| config.proxies.push(url.to_string()))
    }

    fn update_config(&self, apply: impl FnOnce(&mut ClientConfig)) -> Result<(), ClientError> {
        let lifecycle = self.inner.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Stopped) {
            return Err(ClientError::InvalidState(
                "configuration can only change while stopped",
            ));
        }
        let mut config = self.inner.config.read().clone();
        apply(&mut config);
        config.validate()?;
        *self.inner.config.write() = config;
        Ok(())
    }

    fn manager(&self) -> Option<Arc<ConnectionManager>> {
        match &*self.inner.lifecycle.lock() {
            Lifecycle::Running(running) => Some(Arc::clone(&running.manager)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("device_id", &self.inner.device_id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn generate_device_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Periodic discovery; feeds the Connection Manager
///
/// A failed first round installs the default node set; a failed later
/// round keeps the current snapshot. Every failure lands in `lastError`.
async fn discovery_loop(
    discovery: DiscoveryClient,
    manager: Arc<ConnectionManager>,
    directory: Arc<NodeDirectory>,
    stats: Arc<StatsAggregator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut first_round = true;

    loop {
        let round = tokio::select! {
            result = discovery.discover() => result,
            () = signalled(&mut shutdown) => break,
        };

        match round {
            Ok(nodes) => {
                let count = nodes.len();
                let generation = directory.replace(nodes);
                tracing::debug!("Node snapshot #{} installed ({} nodes)", generation, count);
            }
            Err(e) => {
                stats.set_last_error(e.to_string());
                if first_round {
                    tracing::warn!(
                        "{}; using {} default relay nodes",
                        e,
                        discovery.defaults().len()
                    );
                    directory.replace(discovery.defaults().clone());
                } else {
                    tracing::warn!(
                        "{}; keeping {} current relay nodes",
                        e,
                        directory.current().len()
                    );
                }
            }
        }
        first_round = false;

        manager.sync_nodes(&directory.current());

        tokio::select! {
            () = time::sleep(interval) => {}
            () = signalled(&mut shutdown) => break,
        }
    }

    tracing::debug!("Discovery loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn fast_config(port: u16) -> ClientConfig {
        ClientConfig {
            shutdown_grace: Duration::from_secs(1),
            connect_timeout: Duration::from_millis(200),
            discovery_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        }
        .with_default_nodes([format!("127.0.0.1:{port}")])
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let client = RelayClient::new(ClientConfig::default()).unwrap();
        assert_eq!(client.start(), Err(ClientError::NoRuntime));
        assert!(!client.is_running());
    }

    #[test]
    fn test_new_rejects_bad_proxy() {
        let result = RelayClient::new(
            ClientConfig::default().with_proxy("http://user:p@ss:word@host:8080"),
        );
        assert!(matches!(result, Err(ClientError::InvalidProxy { index: 0, .. })));
    }

    #[test]
    fn test_device_id() {
        let generated = RelayClient::new(ClientConfig::default()).unwrap();
        assert_eq!(generated.device_id().len(), 32);

        let fixed = RelayClient::new(ClientConfig {
            device_id: Some("device-42".to_string()),
            ..ClientConfig::default()
        })
        .unwrap();
        assert_eq!(fixed.device_id(), "device-42");
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let client = RelayClient::new(fast_config(closed_port().await)).unwrap();

        client.start().unwrap();
        client.start().unwrap();
        assert!(client.is_running());

        client.stop().await;
        client.stop().await;
        assert!(!client.is_running());

        let stats = client.stats();
        assert!(!stats.connected);
        assert_eq!(stats.connected_nodes, 0);
        assert_eq!(stats.uptime_seconds, 0);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let client = RelayClient::new(fast_config(closed_port().await)).unwrap();
        client.start().unwrap();
        client.stop().await;
        client.start().unwrap();
        assert!(client.is_running());
        client.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_stops_both_wait() {
        let client = RelayClient::new(fast_config(closed_port().await)).unwrap();
        client.start().unwrap();

        let other = client.clone();
        tokio::join!(client.stop(), other.stop());
        assert!(!client.is_running());
        assert!(!other.is_running());
    }

    #[tokio::test]
    async fn test_unreachable_discovery_falls_back() {
        let port = closed_port().await;
        let config = fast_config(port).with_discovery_url(format!("http://127.0.0.1:{port}/nodes"));
        let client = RelayClient::new(config).unwrap();
        client.start().unwrap();

        let mut stats = client.stats();
        for _ in 0..100 {
            if !stats.node_addresses_json.contains("[]") && !stats.last_error.is_empty() {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
            stats = client.stats();
        }
        assert_eq!(stats.node_addresses_json, format!(r#"["127.0.0.1:{port}"]"#));
        assert!(!stats.last_error.is_empty());

        client.stop().await;
    }

    #[tokio::test]
    async fn test_setters_only_while_stopped() {
        let client = RelayClient::new(fast_config(closed_port().await)).unwrap();

        client.set_partner_id("acme").unwrap();
        client.add_proxy("socks5://127.0.0.1:1080").unwrap();
        assert!(matches!(
            client.add_proxy("HTTP://127.0.0.1:1"),
            Err(ClientError::InvalidProxy { index: 1, .. })
        ));
        assert!(matches!(
            client.set_discovery_url("not a url"),
            Err(ClientError::InvalidDiscoveryUrl(_))
        ));
        assert_eq!(client.config().proxies.len(), 1);
        assert_eq!(client.config().partner_id.as_deref(), Some("acme"));

        client.start().unwrap();
        assert_eq!(
            client.set_partner_id("other"),
            Err(ClientError::InvalidState(
                "configuration can only change while stopped"
            ))
        );
        client.stop().await;
    }

    #[tokio::test]
    async fn test_open_stream_requires_running_and_session() {
        let client = RelayClient::new(fast_config(closed_port().await)).unwrap();
        assert!(matches!(
            client.open_stream().await,
            Err(ClientError::InvalidState(_))
        ));
        client.start().unwrap();
        assert!(matches!(
            client.open_stream().await,
            Err(ClientError::NotConnected)
        ));
        client.stop().await;
    }
}
