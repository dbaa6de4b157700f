//! Relay Leaf CLI
//!
//! Runs a relay client, prints stats periodically and stops on Ctrl-C.

mod config;

use clap::{Parser, Subcommand};
use leaf_core::{ClientConfig, PROTOCOL_VERSION, RelayClient, StatsSnapshot};
use leaf_discovery::DiscoveryClient;
use leaf_proxy::ProxyDirective;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use config::Config;

/// Relay Leaf - relay network client
#[derive(Parser)]
#[command(name = "relay-leaf")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path [default: <config dir>/relay-leaf/config.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Discovery endpoint (overrides the config file)
    #[arg(long, global = true)]
    discovery_url: Option<String>,

    /// Partner identifier (overrides the config file)
    #[arg(long, global = true)]
    partner_id: Option<String>,

    /// Proxy URL; repeat for several (replaces the config file list)
    #[arg(long = "proxy", global = true)]
    proxies: Vec<String>,

    /// Seconds between stats lines
    #[arg(long, global = true)]
    interval: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay client (default)
    Run,

    /// Run the relay client, printing stats as JSON
    StatsJson,

    /// Parse a proxy URL and show the result
    CheckProxy {
        /// Proxy URL
        #[arg(required = true)]
        url: String,
    },

    /// Run one discovery round and list the relay nodes
    Nodes,

    /// Show library and protocol versions
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli);

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            config.validate()?;
            run_client(config.to_client_config(cli.verbose), interval(&config), false).await?;
        }
        Commands::StatsJson => {
            config.validate()?;
            run_client(config.to_client_config(cli.verbose), interval(&config), true).await?;
        }
        Commands::CheckProxy { url } => {
            check_proxy(&url)?;
        }
        Commands::Nodes => {
            config.validate()?;
            list_nodes(&config.to_client_config(cli.verbose)).await?;
        }
        Commands::Version => {
            println!("Relay Leaf version: {}", leaf_core::version());
            println!("Protocol version: {PROTOCOL_VERSION}");
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(url) = &cli.discovery_url {
        config.client.discovery_url = Some(url.clone());
    }
    if let Some(partner_id) = &cli.partner_id {
        config.client.partner_id = Some(partner_id.clone());
    }
    if !cli.proxies.is_empty() {
        config.client.proxies.clone_from(&cli.proxies);
    }
    if let Some(interval) = cli.interval {
        config.output.interval_secs = interval;
    }
}

fn interval(config: &Config) -> Duration {
    Duration::from_secs(config.output.interval_secs)
}

/// Start the client and print stats until Ctrl-C
async fn run_client(config: ClientConfig, every: Duration, json: bool) -> anyhow::Result<()> {
    println!("Relay Leaf version: {}", leaf_core::version());

    let client = RelayClient::new(config)?;
    client.start()?;
    println!("Relay client started");
    tracing::info!("Device {}", client.device_id());

    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => print_stats(&client.stats(), json),
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    println!("Stopping relay...");
    client.stop().await;
    Ok(())
}

fn print_stats(stats: &StatsSnapshot, json: bool) {
    if json {
        println!("{}", stats.to_json());
        return;
    }

    println!(
        "Connected={} | Nodes={} | Uptime={}s | Streams={}/{} | Sent={} | Recv={}",
        stats.connected,
        stats.connected_nodes,
        stats.uptime_seconds,
        stats.active_streams,
        stats.total_streams,
        stats.bytes_sent,
        stats.bytes_received
    );

    if !stats.connected && !stats.last_error.is_empty() {
        println!("LastError: {}", stats.last_error);
    }
}

/// Parse a proxy URL; credentials are redacted in the output
fn check_proxy(url: &str) -> anyhow::Result<()> {
    let directive = ProxyDirective::parse(url)?;

    println!("Proxy: {directive}");
    println!("Scheme: {}", directive.scheme());
    println!("Host: {}", directive.host());
    println!("Port: {}", directive.port());
    match directive.credentials() {
        Some(creds) => println!("Auth: {} (password set)", creds.username()),
        None => println!("Auth: none"),
    }

    Ok(())
}

/// One discovery round through the first configured proxy
async fn list_nodes(config: &ClientConfig) -> anyhow::Result<()> {
    let client = DiscoveryClient::new(config.discovery_config()?)?;
    let (nodes, error) = client.discover_or_fallback().await;

    match client.endpoint() {
        Some(endpoint) => println!("Discovery: {endpoint}"),
        None => println!("Discovery: built-in nodes"),
    }
    if let Some(error) = error {
        println!("Discovery failed, using defaults: {error}");
    }

    println!("Nodes ({}):", nodes.len());
    for node in &nodes {
        print!("  {} ({})", node.address(), node.identifier());
        if let Some(latency) = node.latency_ms() {
            print!(" latency={latency}ms");
        }
        if let Some(weight) = node.weight() {
            print!(" weight={weight}");
        }
        println!();
    }

    Ok(())
}
