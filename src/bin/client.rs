//! Seikan Client
//!
//! Connects to a Seikan server and keeps the configured tunnels up:
//! - Local ports forwarded to destinations reachable from the server
//! - Destinations near the client served for ports opened on the server

use anyhow::{Context, Result};
use clap::Parser;
use seikan::{config, crypto::KeyPair, Client, ClientConfig};
use tracing::info;

/// Seikan Client - point-to-point TCP tunnels
#[derive(Parser, Debug)]
#[command(name = "seikan-client")]
#[command(about = "Seikan Client - authenticated, multiplexed TCP tunnels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "client.toml")]
    config: String,

    /// Generate new keypair and exit
    #[arg(long)]
    generate_key: bool,

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

    let config: ClientConfig =
        config::load(&args.config).context("Failed to load configuration")?;
    config.log.init(args.log_level.as_deref());

    info!(version = seikan::VERSION, "Starting Seikan client");
    info!(
        server = %config.server.address,
        identifier = %config.identifier,
        "Configuration loaded"
    );

    let client = Client::new(config).context("Invalid client configuration")?;
    let mut tunnels = client.dial().await.context("Failed to start tunnels")?;

    // Wait for shutdown signal
    tokio::select! {
        _ = async { while tunnels.join_next().await.is_some() {} } => {
            info!("All tunnels stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

/// Generate and print a new keypair
fn generate_keypair() -> Result<()> {
    let keypair = KeyPair::generate().context("Failed to generate keypair")?;

    println!("Add to your client.toml:");
    println!("  secret = \"{}\"", keypair.private.to_text());
    println!("  public = \"{}\"", keypair.public.to_text());
    println!();
    println!("Register on the server ([clients] section):");
    println!("  <identifier> = \"{}\"", keypair.public.to_text());

    Ok(())
}
