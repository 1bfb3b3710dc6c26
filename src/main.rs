use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use collabnet::{
    AccessLevel, ConnectionConfig, DiscoveryConfig, Node, NodeConfig, NodeType, DEFAULT_DATA_DIR,
    DEFAULT_DATA_PORT, DEFAULT_DISCOVERY_PORT, DEFAULT_MAX_CONNECTIONS,
};

#[derive(Parser, Debug)]
#[command(name = "collabnet")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short = 'p', long, default_value_t = DEFAULT_DATA_PORT)]
    data_port: u16,

    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// Send announcements to these addresses instead of broadcasting.
    #[arg(long = "announce-to", value_name = "ADDR")]
    announce_to: Vec<SocketAddr>,

    #[arg(long, default_value = "full")]
    node_type: NodeType,

    #[arg(long, value_delimiter = ',', default_value = "sync,storage,relay")]
    capabilities: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Share this directory on startup.
    #[arg(long, value_name = "DIR")]
    share: Option<PathBuf>,

    #[arg(long, default_value = "team")]
    access: AccessLevel,

    #[arg(short, long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = NodeConfig {
        data_dir: args.data_dir,
        data_bind: SocketAddr::new(args.bind, args.data_port),
        node_type: args.node_type,
        capabilities: args.capabilities,
        discovery: DiscoveryConfig {
            bind_addr: args.bind,
            port: args.discovery_port,
            targets: args.announce_to,
            ..DiscoveryConfig::default()
        },
        connection: ConnectionConfig {
            max_connections: args.max_connections,
            ..ConnectionConfig::default()
        },
        ..NodeConfig::default()
    };

    let node = Node::start(config).await?;
    info!("Node id: {}", node.node_id());

    if let Some(dir) = &args.share {
        match node.share_repository(dir, args.access).await {
            Ok(shares) => info!(dir = %dir.display(), files = shares.len(), "repository shared"),
            Err(e) => warn!(dir = %dir.display(), error = %e, "failed to share repository"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let status = node.get_network_status().await;
                info!(
                    discovered = status.discovered_peer_count,
                    connected = status.active_connection_count,
                    shared_files = status.shared_file_count,
                    remote_files = status.remote_files.len(),
                    "network status"
                );
            }
        }
    }

    node.stop().await;
    Ok(())
}
