//! # Seikan
//!
//! Point-to-point TCP tunnels between a client and a server over a single
//! authenticated, encrypted and multiplexed connection.
//!
//! ## Features
//!
//! - **Mutual authentication** using the Noise Protocol (IK pattern)
//! - **Anonymous client recognition** through a salted derived identifier
//! - **Outbound tunnels**: a port on the client reaches a destination near the server
//! - **Inbound tunnels**: a port on the server reaches a destination near the client
//! - **Access filtering** with exact endpoints and CIDR blocks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Orchestration Layer                  │
//! │        (client/server roles, retry, registry)        │
//! ├─────────────────────────────────────────────────────┤
//! │                  Control Protocol                    │
//! │          (CBOR PDUs, correlated exchanges)           │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexing Layer                  │
//! │            (Multiple streams, flow control)          │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                       │
//! │        (Noise handshake, chunked AEAD, rekey)        │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │                        (TCP)                         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod filter;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use server::Server;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("control: {0}")]
    Control(#[from] protocol::ControlError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Filter error: {0}")]
    Filter(#[from] filter::FilterError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timeout")]
    Timeout,

    #[error("Unknown client")]
    UnknownClient,

    /// Stops a retry loop for good
    #[error("not retryable: {0}")]
    NotRetryable(Box<Error>),
}

impl Error {
    /// Wrap an error so that retrying stops
    pub fn not_retryable(err: impl Into<Error>) -> Self {
        Error::NotRetryable(Box::new(err.into()))
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::NotRetryable(_))
    }
}
