//! Access filter for tunnel destinations
//!
//! A host is allowed when it matches a strict entry exactly, or when its
//! name resolves into one of the allowed CIDR blocks.

mod resolver;

pub use resolver::{NameResolver, Resolve, SystemResolver, CACHE_TTL};

use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// Filter errors
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("host not allowed: {host}: {source}")]
    NotAllowed {
        host: String,
        #[source]
        source: Box<FilterError>,
    },

    #[error("rejected host: [domain/ip] {name}/{ip}")]
    Rejected { name: String, ip: IpAddr },

    #[error("[resolve] {name}: {source}")]
    Resolve {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),
}

/// Decides whether a `host:port` destination may be used
pub struct Approver {
    stricts: Vec<String>,
    resolver: NameResolver,
}

impl Approver {
    /// Create an approver using system DNS
    pub fn new(stricts: Vec<String>, cidrs: &[String]) -> Result<Self, FilterError> {
        Ok(Self {
            stricts,
            resolver: NameResolver::new(cidrs)?,
        })
    }

    pub fn with_resolver(stricts: Vec<String>, resolver: NameResolver) -> Self {
        Self { stricts, resolver }
    }

    /// Check `host`, usually of the form `host:port`
    pub async fn allowed(&self, host: &str) -> Result<(), FilterError> {
        if self.stricts.iter().any(|allowed| allowed == host) {
            return Ok(());
        }

        self.resolver
            .resolve(hostname(host))
            .await
            .map(|_| ())
            .map_err(|e| FilterError::NotAllowed {
                host: host.to_string(),
                source: Box::new(e),
            })
    }
}

/// Host part of `host:port`, without IPv6 brackets
fn hostname(host: &str) -> &str {
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
