//! meshkv node entry point.
//!
//! Starts one cache node: binds the RPC server, joins the cluster through
//! localhost discovery, and runs until interrupted.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use meshkv::cluster::{Cluster, ClusterConfig};
use meshkv::discovery::Localhost;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "meshkv", version, about = "meshkv: distributed in-memory cache node")]
struct Args {
    /// Host for the RPC server and the gossip socket
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Server-to-server RPC port
    #[arg(short, long, default_value_t = 7000)]
    port: u16,

    /// UDP port for gossip membership
    #[arg(short, long, default_value_t = 7949)]
    gossip_port: u16,

    /// Gossip ports of seed nodes on this host (comma-separated)
    #[arg(short = 's', long)]
    seed_ports: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshkv=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let seed_ports: Vec<String> = args
        .seed_ports
        .map(|ports| ports.split(',').map(|port| port.trim().to_string()).collect())
        .unwrap_or_default();

    info!("meshkv v{VERSION}");
    info!(
        host = %args.host,
        port = args.port,
        gossip_port = args.gossip_port,
        "starting node"
    );
    if !seed_ports.is_empty() {
        info!(?seed_ports, "seeding discovery");
    }

    let config = ClusterConfig {
        host: args.host,
        port: args.port.to_string(),
        gossip_port: args.gossip_port,
        ..ClusterConfig::default()
    };
    let disco = Arc::new(Localhost::new(seed_ports));

    let cluster = match Cluster::join(config, disco).await {
        Ok(cluster) => Arc::new(cluster),
        Err(err) => {
            error!(%err, "failed to start node");
            std::process::exit(1);
        }
    };

    // Status printer
    {
        let cluster = cluster.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!(
                    peers = cluster.peer_count(),
                    members = cluster.member_count(),
                    "status"
                );
            }
        });
    }

    info!(address = %cluster.address(), "node running");

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    cluster.shutdown(Duration::from_secs(1)).await;
}
