//! CIDR-checking name resolver with a TTL cache
//!
//! Only resolutions that land inside an allowed block are cached, so a
//! rejected name is looked up again on every attempt.

use super::FilterError;
use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Lifetime of a cached resolution
pub const CACHE_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Resolves a hostname to one address
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, name: &str) -> io::Result<IpAddr>;
}

/// Resolver backed by the system's name service
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, name: &str) -> io::Result<IpAddr> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(ip);
        }

        let addrs: Vec<IpAddr> = tokio::net::lookup_host((name, 0))
            .await?
            .map(|addr| addr.ip())
            .collect();

        addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address found"))
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    ip: IpAddr,
    expires_at: Instant,
}

/// Accepts names resolving into one of the configured CIDR blocks
pub struct NameResolver {
    allows: Vec<IpNet>,
    resolver: Box<dyn Resolve>,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl NameResolver {
    /// Create a resolver using system DNS
    pub fn new(allows: &[String]) -> Result<Self, FilterError> {
        Self::with_resolver(allows, SystemResolver)
    }

    pub fn with_resolver(
        allows: &[String],
        resolver: impl Resolve + 'static,
    ) -> Result<Self, FilterError> {
        let allows = allows
            .iter()
            .map(|cidr| {
                cidr.parse::<IpNet>()
                    .map_err(|_| FilterError::InvalidCidr(cidr.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            allows,
            resolver: Box::new(resolver),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve `name` and return its address if it lies in an allowed block
    pub async fn resolve(&self, name: &str) -> Result<IpAddr, FilterError> {
        if let Some(ip) = self.cached(name) {
            trace!(name, %ip, "Resolution cache hit");
            return Ok(ip);
        }

        let ip = self
            .resolver
            .resolve(name)
            .await
            .map_err(|source| FilterError::Resolve {
                name: name.to_string(),
                source,
            })?;

        if self.allows.iter().any(|block| block.contains(&ip)) {
            self.cache.write().insert(
                name.to_string(),
                CacheEntry {
                    ip,
                    expires_at: Instant::now() + CACHE_TTL,
                },
            );
            return Ok(ip);
        }

        Err(FilterError::Rejected {
            name: name.to_string(),
            ip,
        })
    }

    fn cached(&self, name: &str) -> Option<IpAddr> {
        let now = Instant::now();
        {
            let cache = self.cache.read();
            match cache.get(name) {
                Some(entry) if entry.expires_at > now => return Some(entry.ip),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired, evict lazily
        let mut cache = self.cache.write();
        if cache.get(name).is_some_and(|entry| entry.expires_at <= now) {
            cache.remove(name);
        }
        None
    }

    /// Number of cached resolutions, expired ones included
    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }
}
