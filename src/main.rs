use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use metrics::{Metrics, MetricsServer};
use networking::{NetworkConfig, Node, PeerContact};
use protocol::{NodeId, PublicKey};
use tokio::task;
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    /// Listen address for inbound direct connections.
    #[arg(short, long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// Listen port for inbound direct connections; 0 picks a free port.
    #[arg(short, long, default_value_t = 8300)]
    port: u16,

    /// Relay endpoints (host:port) for the fallback path.
    #[arg(short, long)]
    relay: Vec<String>,

    /// Peers to connect to at start, as `node_id@pubkey_hex[@host:port]`.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Serve Prometheus metrics on this port.
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Send cover traffic.
    #[arg(long)]
    obfuscate: bool,

    /// Verbose logging.
    #[arg(long)]
    debug: bool,

    /// How often to log a stats snapshot, in seconds.
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,
}

fn parse_contact(spec: &str) -> Result<PeerContact> {
    let mut parts = spec.split('@');
    let node_id = parts
        .next()
        .ok_or_else(|| anyhow!("empty peer spec"))
        .and_then(|id| NodeId::parse(id).map_err(|err| anyhow!("{err}")))?;
    let public_key = parts
        .next()
        .ok_or_else(|| anyhow!("peer spec {spec:?} is missing a public key"))
        .and_then(|hex| PublicKey::from_hex(hex).map_err(|err| anyhow!("{err}")))?;
    let address = parts
        .next()
        .map(|addr| addr.parse::<SocketAddr>())
        .transpose()
        .with_context(|| format!("peer spec {spec:?} has a malformed address"))?;
    Ok(PeerContact {
        node_id,
        public_key,
        address,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = NetworkConfig::default()
        .with_direct_listen(SocketAddr::from((args.address, args.port)))
        .with_relay_servers(args.relay.clone());
    config.connection.enable_obfuscation = args.obfuscate;
    config.debug = args.debug;

    // The config option is the source of truth for verbosity; RUST_LOG
    // still wins when set explicitly.
    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let shared_metrics = Arc::new(Metrics::new());
    let node = Node::builder(config)
        .metrics(shared_metrics.clone())
        .build()
        .context("Failed to assemble node")?;

    node.start().await.context("Failed to start node")?;
    info!(
        node = %node.local_id(),
        public_key = %node.public_key().to_hex(),
        "Overlay node up; share this contact as id@pubkey@addr"
    );

    if let Some(metrics_port) = args.metrics_port {
        let server = MetricsServer::bind(
            SocketAddr::from((args.address, metrics_port)),
            shared_metrics.clone(),
        )
        .await
        .context("Failed to bind metrics endpoint")?;
        info!(addr = %server.local_addr()?, "Metrics endpoint bound");
        task::spawn(async move {
            if let Err(err) = server.run().await {
                eprintln!("metrics server exited: {err}");
            }
        });
    }

    for spec in &args.peers {
        let contact = parse_contact(spec)?;
        let peer_id = contact.node_id.clone();
        match node.connect(contact).await {
            Ok(true) => info!(peer = %peer_id, "Connected to introduced peer"),
            Ok(false) => info!(peer = %peer_id, "Introduced peer unreachable"),
            Err(err) => info!(peer = %peer_id, %err, "Introduction rejected"),
        }
    }

    let stats_node = node.clone();
    let stats_interval = Duration::from_secs(args.stats_interval.max(1));
    task::spawn(async move {
        loop {
            tokio::time::sleep(stats_interval).await;
            let stats = stats_node.stats();
            info!(
                peers = stats.connected_peers,
                sent = stats.messages_sent,
                received = stats.messages_received,
                avg_latency_ms = stats.average_latency_ms,
                gossip_efficiency = stats.gossip_efficiency,
                "Stats"
            );
        }
    });

    tokio::signal::ctrl_c().await.context("Signal handler failed")?;
    info!("Shutting down");
    node.shutdown().await;
    Ok(())
}
