//! Integration tests for the relay client against in-process mocks.
//!
//! Each test wires a `RelayClient` to a mock relay, optionally through a mock
//! HTTP CONNECT or SOCKS5 proxy and a mock discovery endpoint, and checks the
//! externally visible behavior: stats, handshake headers, stream traffic and
//! teardown.

use leaf_core::{ClientConfig, ClientError, PARTNER_ID_HEADER, RelayClient, StatsSnapshot};
use leaf_discovery::{DiscoveryClient, DiscoveryConfig};
use leaf_integration_tests::{
    MOCK_RELAY_ID, MockDiscovery, MockHttpProxy, MockRelay, MockSocks5Proxy, closed_port,
    nodes_document, wait_for,
};
use leaf_proxy::ProxyDirective;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config_for(relay: &MockRelay) -> ClientConfig {
    ClientConfig {
        shutdown_grace: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
    .with_default_nodes([relay.address.clone()])
}

async fn connected(client: &RelayClient) -> StatsSnapshot {
    assert!(
        wait_for(WAIT, || client.stats().connected).await,
        "client never connected: {:?}",
        client.stats()
    );
    client.stats()
}

// ============================================================================
// Direct connections
// ============================================================================

#[tokio::test]
async fn test_direct_session_reports_exit_point() {
    let relay = MockRelay::spawn().await;
    let client = RelayClient::new(config_for(&relay)).unwrap();
    client.start().unwrap();

    let stats = connected(&client).await;
    assert_eq!(stats.connected_nodes, 1);
    assert_eq!(stats.node_addresses_json, format!(r#"["{}"]"#, relay.address));

    let exit_points: serde_json::Value = serde_json::from_str(&stats.exit_points_json).unwrap();
    assert_eq!(exit_points[0]["relayId"], MOCK_RELAY_ID);
    assert_eq!(exit_points[0]["node"], relay.address.as_str());
    assert_eq!(exit_points[0]["transport"], "direct");

    client.stop().await;
}

#[tokio::test]
async fn test_partner_header_sent_only_when_set() {
    let relay = MockRelay::spawn().await;

    let client = RelayClient::new(config_for(&relay).with_partner_id("acme")).unwrap();
    client.start().unwrap();
    connected(&client).await;
    client.stop().await;

    let anonymous = RelayClient::new(config_for(&relay).with_partner_id("")).unwrap();
    anonymous.start().unwrap();
    connected(&anonymous).await;
    anonymous.stop().await;

    let hellos = relay.hellos();
    assert!(hellos.len() >= 2);
    assert_eq!(hellos[0].header(PARTNER_ID_HEADER), Some("acme"));
    assert_eq!(hellos.last().unwrap().header(PARTNER_ID_HEADER), None);
}

#[tokio::test]
async fn test_stream_traffic_updates_counters() {
    let relay = MockRelay::spawn().await;
    let client = RelayClient::new(config_for(&relay)).unwrap();
    client.start().unwrap();
    connected(&client).await;

    let mut stream = client.open_stream().await.unwrap();
    assert_eq!(client.stats().active_streams, 1);

    stream.write(b"hello relay").await.unwrap();
    let echoed = stream.read().await.unwrap().unwrap();
    assert_eq!(echoed, b"hello relay");

    stream.close().await.unwrap();
    assert!(wait_for(WAIT, || client.stats().active_streams == 0).await);

    let stats = client.stats();
    assert_eq!(stats.total_streams, 1);
    assert_eq!(stats.bytes_sent, 11);
    assert_eq!(stats.bytes_received, 11);

    client.stop().await;
}

#[tokio::test]
async fn test_large_write_is_chunked_and_echoed() {
    let relay = MockRelay::spawn().await;
    let client = RelayClient::new(config_for(&relay)).unwrap();
    client.start().unwrap();
    connected(&client).await;

    let mut stream = client.open_stream().await.unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(stream.write(&payload).await.unwrap(), payload.len());

    let mut received = Vec::new();
    while received.len() < payload.len() {
        let chunk = stream.read().await.unwrap().unwrap();
        assert!(chunk.len() <= leaf_core::MAX_DATA_PAYLOAD);
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, payload);

    client.stop().await;
}

// ============================================================================
// Proxied connections
// ============================================================================

#[tokio::test]
async fn test_session_through_http_connect_with_auth() {
    let relay = MockRelay::spawn().await;
    let proxy = MockHttpProxy::spawn(Some(("user", "p@ss:word"))).await;

    let config = config_for(&relay).with_proxy(proxy.url(Some("user:p%40ss%3Aword")));
    let client = RelayClient::new(config).unwrap();
    client.start().unwrap();

    let stats = connected(&client).await;
    let exit_points: serde_json::Value = serde_json::from_str(&stats.exit_points_json).unwrap();
    assert_eq!(
        exit_points[0]["transport"],
        format!("http://{}", proxy.address).as_str()
    );

    let requests = proxy.requests();
    assert!(
        requests
            .iter()
            .any(|head| head.starts_with(&format!("CONNECT {} HTTP/1.1", relay.address)))
    );

    client.stop().await;
}

#[tokio::test]
async fn test_session_through_socks5_with_auth() {
    let relay = MockRelay::spawn().await;
    let proxy = MockSocks5Proxy::spawn(Some(("user", "secret"))).await;

    let config = config_for(&relay).with_proxy(proxy.url(Some("user:secret")));
    let client = RelayClient::new(config).unwrap();
    client.start().unwrap();

    connected(&client).await;
    assert!(proxy.targets().contains(&relay.address));

    let mut stream = client.open_stream().await.unwrap();
    stream.write(b"via socks").await.unwrap();
    assert_eq!(stream.read().await.unwrap().unwrap(), b"via socks");

    client.stop().await;
}

#[tokio::test]
async fn test_wrong_proxy_credentials_never_connect() {
    let relay = MockRelay::spawn().await;
    let proxy = MockHttpProxy::spawn(Some(("user", "right"))).await;

    let config = config_for(&relay).with_proxy(proxy.url(Some("user:wrong")));
    let client = RelayClient::new(config).unwrap();
    client.start().unwrap();

    assert!(wait_for(WAIT, || !client.stats().last_error.is_empty()).await);
    let stats = client.stats();
    assert!(!stats.connected);
    assert!(relay.hellos().is_empty());

    client.stop().await;
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_discovery_document_drives_connections() {
    let relay = MockRelay::spawn().await;
    let body = format!(
        r#"{{"nodes":[{{"address":"{}","id":"relay-1","latencyMs":12}}]}}"#,
        relay.address
    );
    let discovery = MockDiscovery::spawn(body).await;

    let fallback = closed_port().await;
    let config = ClientConfig {
        shutdown_grace: Duration::from_secs(2),
        ..ClientConfig::default()
    }
    .with_discovery_url(discovery.url.clone())
    .with_default_nodes([format!("127.0.0.1:{fallback}")]);

    let client = RelayClient::new(config).unwrap();
    client.start().unwrap();

    let stats = connected(&client).await;
    assert_eq!(stats.node_addresses_json, format!(r#"["{}"]"#, relay.address));
    assert!(stats.last_error.is_empty());
    assert!(discovery.hits() >= 1);

    let exit_points: serde_json::Value = serde_json::from_str(&stats.exit_points_json).unwrap();
    assert_eq!(exit_points[0]["nodeId"], "relay-1");

    client.stop().await;
}

#[tokio::test]
async fn test_rediscovery_replaces_snapshot_and_keeps_it_on_failure() {
    let first = MockRelay::spawn().await;
    let second = MockRelay::spawn().await;
    let discovery = MockDiscovery::spawn(nodes_document(&[first.address.as_str()])).await;
    let fallback = closed_port().await;

    let config = ClientConfig {
        rediscovery_interval: Duration::from_millis(100),
        shutdown_grace: Duration::from_secs(2),
        ..ClientConfig::default()
    }
    .with_discovery_url(discovery.url.clone())
    .with_default_nodes([format!("127.0.0.1:{fallback}")]);
    let client = RelayClient::new(config).unwrap();
    client.start().unwrap();

    let only = |address: &str| format!(r#"["{address}"]"#);
    let stats = connected(&client).await;
    assert_eq!(stats.node_addresses_json, only(&first.address));

    // A successful round replaces the snapshot and drops the stale Session
    discovery.set_body(Some(nodes_document(&[second.address.as_str()])));
    assert!(
        wait_for(WAIT, || {
            let stats = client.stats();
            stats.node_addresses_json == only(&second.address) && stats.connected_nodes == 1
        })
        .await,
        "{:?}",
        client.stats()
    );
    assert!(wait_for(WAIT, || first.live_connections() == 0).await);
    let exit_points: serde_json::Value =
        serde_json::from_str(&client.stats().exit_points_json).unwrap();
    assert_eq!(exit_points.as_array().unwrap().len(), 1);
    assert_eq!(exit_points[0]["node"], second.address.as_str());

    // A failed round keeps the snapshot but records the error
    let hits = discovery.hits();
    discovery.set_body(None);
    assert!(wait_for(WAIT, || client.stats().last_error.contains("503")).await);
    assert!(discovery.hits() > hits);

    let stats = client.stats();
    assert_eq!(stats.node_addresses_json, only(&second.address));
    assert_eq!(stats.connected_nodes, 1);
    assert!(stats.connected);
    assert_eq!(second.live_connections(), 1);

    client.stop().await;
}

#[tokio::test]
async fn test_discovery_through_socks5_resolves_at_proxy() {
    let discovery =
        MockDiscovery::spawn_on("localhost", nodes_document(&["r1.example:443"])).await;
    let proxy = MockSocks5Proxy::spawn(None).await;

    let mut config = DiscoveryConfig::with_endpoint(&discovery.url).unwrap();
    config.proxy = Some(ProxyDirective::parse(&proxy.url(None)).unwrap());
    config.timeout = Duration::from_secs(5);
    let client = DiscoveryClient::new(config).unwrap();

    let nodes = client.discover().await.unwrap();
    assert_eq!(nodes.addresses(), vec!["r1.example:443"]);
    assert_eq!(proxy.targets(), vec![discovery.authority().to_string()]);
}

#[tokio::test]
async fn test_unavailable_discovery_falls_back_to_defaults() {
    let relay = MockRelay::spawn().await;
    let dead = closed_port().await;
    let config = config_for(&relay).with_discovery_url(format!("http://127.0.0.1:{dead}/nodes"));

    let client = RelayClient::new(config).unwrap();
    client.start().unwrap();

    let stats = connected(&client).await;
    assert_eq!(stats.node_addresses_json, format!(r#"["{}"]"#, relay.address));
    assert!(!stats.last_error.is_empty());

    client.stop().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_stop_tears_everything_down() {
    let relay = MockRelay::spawn().await;
    let client = RelayClient::new(config_for(&relay)).unwrap();
    client.start().unwrap();
    connected(&client).await;

    let mut stream = client.open_stream().await.unwrap();
    client.stop().await;

    let stats = client.stats();
    assert!(!stats.connected);
    assert_eq!(stats.connected_nodes, 0);
    assert_eq!(stats.active_streams, 0);
    assert_eq!(stats.uptime_seconds, 0);
    assert_eq!(stats.node_addresses_json, "[]");

    let after_stop = stream.read().await;
    assert!(matches!(after_stop, Ok(None) | Err(_)), "{after_stop:?}");
    assert!(stream.write(b"late").await.is_err());
    assert!(wait_for(WAIT, || relay.live_connections() == 0).await);
}

#[tokio::test]
async fn test_start_stop_repeatedly() {
    let relay = MockRelay::spawn().await;
    let client = RelayClient::new(config_for(&relay)).unwrap();

    for _ in 0..3 {
        client.start().unwrap();
        client.start().unwrap();
        connected(&client).await;
        client.stop().await;
        client.stop().await;
        assert!(!client.stats().connected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counters_monotonic_under_concurrent_streams() {
    const WORKERS: u64 = 8;
    const ROUNDS: u64 = 10;

    let relay = MockRelay::spawn().await;
    let client = RelayClient::new(config_for(&relay)).unwrap();
    client.start().unwrap();
    connected(&client).await;

    let running = Arc::new(AtomicBool::new(true));
    let sampler = {
        let client = client.clone();
        let running = Arc::clone(&running);
        tokio::spawn(async move {
            let mut last = client.stats();
            let mut samples = 0u64;
            while running.load(Ordering::SeqCst) {
                let now = client.stats();
                assert!(now.active_streams <= now.total_streams, "{now:?}");
                assert!(now.total_streams >= last.total_streams, "{last:?} -> {now:?}");
                assert!(now.bytes_sent >= last.bytes_sent, "{last:?} -> {now:?}");
                assert!(now.bytes_received >= last.bytes_received, "{last:?} -> {now:?}");
                last = now;
                samples += 1;
                tokio::task::yield_now().await;
            }
            samples
        })
    };

    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let client = client.clone();
            tokio::spawn(async move {
                for round in 0..ROUNDS {
                    let mut stream = client.open_stream().await.unwrap();
                    let payload = format!("worker {worker} round {round}");
                    stream.write(payload.as_bytes()).await.unwrap();
                    assert_eq!(stream.read().await.unwrap().unwrap(), payload.as_bytes());
                    stream.close().await.unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }

    running.store(false, Ordering::SeqCst);
    assert!(sampler.await.unwrap() > 0);

    assert!(wait_for(WAIT, || client.stats().active_streams == 0).await);
    let stats = client.stats();
    assert_eq!(stats.total_streams, WORKERS * ROUNDS);
    assert_eq!(stats.bytes_sent, stats.bytes_received);

    client.stop().await;
}

#[tokio::test]
async fn test_independent_clients_do_not_share_state() {
    let relay = MockRelay::spawn().await;
    let first = RelayClient::new(config_for(&relay)).unwrap();
    let second = RelayClient::new(config_for(&relay)).unwrap();

    first.start().unwrap();
    second.start().unwrap();
    connected(&first).await;
    connected(&second).await;

    let mut stream = first.open_stream().await.unwrap();
    stream.write(b"only first").await.unwrap();
    stream.read().await.unwrap();

    assert_eq!(first.stats().total_streams, 1);
    assert_eq!(second.stats().total_streams, 0);
    assert_eq!(second.stats().bytes_sent, 0);
    assert_ne!(first.device_id(), second.device_id());

    first.stop().await;
    assert!(second.stats().connected);
    second.stop().await;
}

#[tokio::test]
async fn test_open_stream_without_session() {
    let dead = closed_port().await;
    let config = ClientConfig {
        shutdown_grace: Duration::from_secs(1),
        ..ClientConfig::default()
    }
    .with_default_nodes([format!("127.0.0.1:{dead}")]);
    let client = RelayClient::new(config).unwrap();
    client.start().unwrap();

    assert!(matches!(
        client.open_stream().await,
        Err(ClientError::NotConnected)
    ));
    assert!(wait_for(WAIT, || !client.stats().last_error.is_empty()).await);
    assert!(client.stats().last_error.contains(&format!("127.0.0.1:{dead}")));

    client.stop().await;
}

#[test]
fn test_start_without_runtime() {
    let client = RelayClient::new(ClientConfig::default()).unwrap();
    assert_eq!(client.start(), Err(ClientError::NoRuntime));
    assert_eq!(ClientError::NoRuntime.code(), 4);
    assert_eq!(leaf_core::error_message(4), "no Tokio runtime available");
}

#[test]
fn test_invalid_proxy_is_rejected_not_skipped() {
    let result = RelayClient::new(
        ClientConfig::default()
            .with_proxy("socks5://127.0.0.1:1080")
            .with_proxy("Socks5://127.0.0.1:1081"),
    );
    match result {
        Err(ClientError::InvalidProxy { index, .. }) => assert_eq!(index, 1),
        other => panic!("expected InvalidProxy, got {other:?}"),
    }
}
