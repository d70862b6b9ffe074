//! Standalone relay endpoint: forwards enveloped traffic between
//! registered nodes that cannot reach each other directly.

use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::Parser;
use networking::RelayServer;
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    address: IpAddr,

    #[arg(short, long, default_value_t = 8400)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let server = RelayServer::bind(&format!("{}:{}", args.address, args.port))
        .await
        .context("Failed to bind relay listener")?;
    info!(addr = %server.local_addr()?, "Relay listening");

    server.run().await;
    Ok(())
}
