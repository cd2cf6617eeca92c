//! Seikan Server
//!
//! Accepts authenticated client connections and:
//! - Dials destinations on behalf of clients (outbound tunnels)
//! - Opens local ports served by clients (inbound tunnels)

use anyhow::{Context, Result};
use clap::Parser;
use seikan::{config, crypto::KeyPair, Server, ServerConfig};
use tracing::info;

/// Seikan Server - point-to-point TCP tunnels
#[derive(Parser, Debug)]
#[command(name = "seikan-server")]
#[command(about = "Seikan Server - authenticated, multiplexed TCP tunnels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "server.toml")]
    config: String,

    /// Generate new keypair and exit
    #[arg(long)]
    generate_key: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_key {
        return generate_keypair();
    }

    let mut config: ServerConfig =
        config::load(&args.config).context("Failed to load configuration")?;
    config.log.init(args.log_level.as_deref());

    if let Some(listen) = args.listen {
        config.address = listen;
    }

    info!(version = seikan::VERSION, "Starting Seikan server");
    info!(
        clients = config.clients.len(),
        outbounds = config.outbounds.len(),
        "Configuration loaded"
    );

    let server = Server::new(config).await.context("Failed to start server")?;

    tokio::select! {
        result = server.listen() => result.context("Server stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }

    Ok(())
}

/// Generate and print a new keypair
fn generate_keypair() -> Result<()> {
    let keypair = KeyPair::generate().context("Failed to generate keypair")?;

    println!("Add to your server.toml:");
    println!("  secret = \"{}\"", keypair.private.to_text());
    println!("  public = \"{}\"", keypair.public.to_text());
    println!();
    println!("Share with clients ([server] section):");
    println!("  public = \"{}\"", keypair.public.to_text());

    Ok(())
}
