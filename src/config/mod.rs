//! Configuration management
//!
//! Server and client read their own TOML file. Keys use the `sk-`/`pk-`
//! text form produced by `--generate-key`.

use crate::crypto::{KeyPair, PublicKey};
use crate::filter::Approver;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Load a configuration file
pub fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, crate::Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

    parse(&content)
}

/// Parse configuration from TOML text
pub fn parse<T: DeserializeOwned>(content: &str) -> Result<T, crate::Error> {
    toml::from_str(content)
        .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address, `tcp://` prefix accepted
    pub address: String,
    /// Server private key
    pub secret: String,
    /// Server public key, checked against the private one when set
    #[serde(default)]
    pub public: String,
    /// Client identifier to client public key
    #[serde(default)]
    pub clients: HashMap<String, String>,
    #[serde(default)]
    pub log: LoggingConfig,
    /// Destinations clients may bind to; empty allows everything
    #[serde(default)]
    pub allow_list: Vec<Allow>,
    /// Ports opened on the server and served by a client
    #[serde(default)]
    pub outbounds: Vec<Outbound>,
}

impl ServerConfig {
    pub fn keypair(&self) -> Result<KeyPair, crate::Error> {
        keypair(&self.secret, &self.public)
    }

    /// Public key registered for a client identifier
    pub fn client_key(&self, identifier: &str) -> Result<PublicKey, crate::Error> {
        let text = self
            .clients
            .get(identifier)
            .ok_or(crate::Error::UnknownClient)?;
        Ok(text.parse()?)
    }

    pub fn approver(&self) -> Result<Approver, crate::Error> {
        approver(&self.allow_list)
    }
}

/// Where the client finds its server
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub address: String,
    /// Server public key
    pub public: String,
}

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Identifier shared with the server
    pub identifier: String,
    pub server: RemoteConfig,
    /// Client private key
    pub secret: String,
    #[serde(default)]
    pub public: String,
    #[serde(default)]
    pub log: LoggingConfig,
    /// Serve the tunnels the server declares for this client
    #[serde(default)]
    pub inbound: bool,
    /// Destinations the server may reach through this client
    #[serde(default)]
    pub allow_list: Vec<Allow>,
    /// Ports opened on the client and served by the server
    #[serde(default)]
    pub outbounds: Vec<Outbound>,
}

impl ClientConfig {
    pub fn keypair(&self) -> Result<KeyPair, crate::Error> {
        keypair(&self.secret, &self.public)
    }

    pub fn server_key(&self) -> Result<PublicKey, crate::Error> {
        Ok(self.server.public.parse()?)
    }

    pub fn approver(&self) -> Result<Approver, crate::Error> {
        approver(&self.allow_list)
    }
}

/// A tunnel from `source` to `destination`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Outbound {
    /// Client serving this outbound, server side only
    #[serde(default)]
    pub identifier: String,
    pub source: String,
    pub destination: String,
}

/// Kind of allow-list entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowKind {
    /// Exact `host:port` match
    Strict,
    /// Resolved address inside a block
    Cidr,
}

/// Allow-list entry
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "AllowEntry")]
pub struct Allow {
    pub kind: AllowKind,
    pub endpoint: String,
    /// Failures on this endpoint to log at debug level only
    pub ignore_errors: Vec<Regex>,
}

impl Allow {
    pub fn strict(endpoint: impl Into<String>) -> Self {
        Self {
            kind: AllowKind::Strict,
            endpoint: endpoint.into(),
            ignore_errors: Vec::new(),
        }
    }

    pub fn cidr(block: impl Into<String>) -> Self {
        Self {
            kind: AllowKind::Cidr,
            endpoint: block.into(),
            ignore_errors: Vec::new(),
        }
    }
}

/// Either a bare endpoint or a table
#[derive(Deserialize)]
#[serde(untagged)]
enum AllowEntry {
    Endpoint(String),
    Table {
        #[serde(default, rename = "type")]
        kind: String,
        endpoint: String,
        #[serde(default)]
        ignore_errors: Vec<String>,
    },
}

impl TryFrom<AllowEntry> for Allow {
    type Error = String;

    fn try_from(entry: AllowEntry) -> Result<Self, String> {
        let (kind, endpoint, patterns) = match entry {
            AllowEntry::Endpoint(endpoint) => return Ok(Allow::strict(endpoint)),
            AllowEntry::Table {
                kind,
                endpoint,
                ignore_errors,
            } => (kind, endpoint, ignore_errors),
        };

        let kind = match kind.as_str() {
            "" => AllowKind::Strict,
            "cidr" => AllowKind::Cidr,
            _ => return Err("type must be empty or a cidr".to_string()),
        };

        if kind == AllowKind::Cidr && !patterns.is_empty() {
            return Err("ignore_errors cannot be used for a cidr allow_list".to_string());
        }

        let ignore_errors = patterns
            .iter()
            .map(|expr| Regex::new(expr).map_err(|e| format!("`{}`: {}", expr, e)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Allow {
            kind,
            endpoint,
            ignore_errors,
        })
    }
}

fn keypair(secret: &str, public: &str) -> Result<KeyPair, crate::Error> {
    let public = (!public.is_empty()).then_some(public);
    Ok(KeyPair::from_text(secret, public)?)
}

/// Build the access filter for an allow-list
pub fn approver(allow_list: &[Allow]) -> Result<Approver, crate::Error> {
    let (cidrs, stricts): (Vec<&Allow>, Vec<&Allow>) = allow_list
        .iter()
        .partition(|allow| allow.kind == AllowKind::Cidr);

    let stricts = stricts.into_iter().map(|a| a.endpoint.clone()).collect();
    let cidrs: Vec<String> = cidrs.into_iter().map(|a| a.endpoint.clone()).collect();

    Ok(Approver::new(stricts, &cidrs)?)
}

/// Ignore patterns of the strict entries naming `endpoint`
pub fn ignore_errors_for(allow_list: &[Allow], endpoint: &str) -> Vec<Regex> {
    allow_list
        .iter()
        .filter(|allow| allow.kind == AllowKind::Strict && allow.endpoint == endpoint)
        .flat_map(|allow| allow.ignore_errors.iter().cloned())
        .collect()
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,
    /// Log format (pretty, compact, full)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install the global subscriber. `level` overrides the configured level.
    pub fn init(&self, level: Option<&str>) {
        let filter = EnvFilter::try_new(level.unwrap_or(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);

        let _ = match self.format.as_str() {
            "pretty" => builder.pretty().try_init(),
            "compact" => builder.compact().try_init(),
            _ => builder.try_init(),
        };
    }
}
