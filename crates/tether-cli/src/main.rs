//! Tether - cluster messaging node
//!
//! Runs one member of a Tether cluster until interrupted.

use clap::{Parser, Subcommand};
use tether_cluster::{ClusterNode, NodeEvent};
use tether_core::config::TetherConfig;
use tether_core::types::PeerAddress;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tether")]
#[command(author = "Tether Team")]
#[command(version = tether_core::VERSION)]
#[command(about = "Cluster messaging node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Server name, unique across the cluster
    #[arg(long, env = "TETHER_SERVER_NAME")]
    server_name: Option<String>,

    /// Bind host
    #[arg(long, env = "TETHER_HOST")]
    host: Option<String>,

    /// Broadcast (publish) port
    #[arg(long, env = "TETHER_PUBSUB_PORT")]
    pubsub_port: Option<u16>,

    /// Direct (pull) port
    #[arg(long, env = "TETHER_PIPELINE_PORT")]
    pipeline_port: Option<u16>,

    /// Peer to connect on start, as [name@]host[:pubsub_port[:pipeline_port]]
    #[arg(long = "peer", value_name = "ADDRESS")]
    peers: Vec<PeerAddress>,

    /// Log every message received on this topic
    #[arg(long = "subscribe", value_name = "TOPIC")]
    topics: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TETHER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, env = "TETHER_LOG_FORMAT")]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a cluster node
    Node,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Load or create config
    let mut config = if let Some(config_path) = &cli.config {
        TetherConfig::from_file(config_path)?
    } else {
        TetherConfig::from_env()
    };

    // Override with CLI args
    if let Some(name) = cli.server_name {
        config.node.server_name = Some(name);
    }
    if let Some(host) = cli.host {
        config.node.bind.host = host;
    }
    if let Some(port) = cli.pubsub_port {
        config.node.bind.pubsub_port = port;
    }
    if let Some(port) = cli.pipeline_port {
        config.node.bind.pipeline_port = port;
    }
    if !cli.peers.is_empty() {
        config.node.peers = cli.peers;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    config.validate()?;

    match cli.command {
        Some(Commands::Version) => {
            println!("tether {}", tether_core::VERSION);
        }
        Some(Commands::Node) | None => {
            init_logging(&config);
            run_node(config, cli.topics).await?;
        }
    }

    Ok(())
}

fn init_logging(config: &TetherConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init();
    }
}

async fn run_node(config: TetherConfig, topics: Vec<String>) -> anyhow::Result<()> {
    let node = ClusterNode::new(config.to_cluster_config());
    info!("Starting Tether node '{}'", node.server_name());

    for topic in topics {
        let label = topic.clone();
        node.subscribe(&topic, move |payload, origin| {
            info!("[{}] from {}: {}", label, origin, payload);
        });
    }

    let mut events = node.events();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(NodeEvent::Ready) => debug!("Node ready"),
                Ok(NodeEvent::PeerAdded(peer)) => info!("Peer added: {}", peer),
                Ok(NodeEvent::PeerRemoved(peer)) => info!("Peer removed: {}", peer),
                // Already logged where it was raised
                Ok(NodeEvent::Error(_)) => {}
                Ok(NodeEvent::Close) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} node events", skipped),
            }
        }
    });

    node.start().await?;
    if let Some(address) = node.local_address() {
        info!("Listening as {}", address);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    node.close().await?;
    let _ = event_log.await;

    Ok(())
}
