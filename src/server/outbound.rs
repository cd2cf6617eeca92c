//! Ports opened on the server and served by a client
//!
//! Listeners are bound once at startup. The registry is read-only afterwards,
//! so connection tasks share it without locking.

use crate::config::Outbound;
use crate::transport::DropListener;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub struct OutboundRegistry {
    outbounds: Vec<Outbound>,
    listeners: HashMap<String, Arc<DropListener>>,
}

impl OutboundRegistry {
    /// Bind a drop listener for every configured outbound
    pub async fn bind(outbounds: &[Outbound]) -> Result<Self> {
        let mut listeners = HashMap::with_capacity(outbounds.len());

        for outbound in outbounds {
            let listener = DropListener::bind(&outbound.source)
                .await
                .map_err(|source| Error::Listen {
                    address: outbound.source.clone(),
                    source,
                })?;

            let key = Self::key(&outbound.identifier, &outbound.destination);
            info!(key = %key, source = %outbound.source, "Outbound listening");
            listeners.insert(key, Arc::new(listener));
        }

        Ok(Self {
            outbounds: outbounds.to_vec(),
            listeners,
        })
    }

    fn key(identifier: &str, destination: &str) -> String {
        format!("{}.{}", identifier, destination)
    }

    /// Destinations a client is expected to serve, in configuration order
    pub fn destinations(&self, identifier: &str) -> Vec<String> {
        self.outbounds
            .iter()
            .filter(|o| o.identifier == identifier)
            .map(|o| o.destination.clone())
            .collect()
    }

    /// Listener registered for a client and destination
    pub fn get(&self, identifier: &str, destination: &str) -> Option<Arc<DropListener>> {
        self.listeners
            .get(&Self::key(identifier, destination))
            .cloned()
    }

    /// Bound address of a registered listener
    #[cfg(test)]
    pub fn local_addr(
        &self,
        identifier: &str,
        destination: &str,
    ) -> Option<std::net::SocketAddr> {
        self.get(identifier, destination)
            .map(|listener| listener.local_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(identifier: &str, destination: &str) -> Outbound {
        Outbound {
            identifier: identifier.to_string(),
            source: "127.0.0.1:0".to_string(),
            destination: destination.to_string(),
        }
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = OutboundRegistry::bind(&[
            outbound("laptop", "127.0.0.1:22"),
            outbound("laptop", "127.0.0.1:80"),
            outbound("desktop", "127.0.0.1:22"),
        ])
        .await
        .unwrap();

        assert_eq!(
            registry.destinations("laptop"),
            vec!["127.0.0.1:22", "127.0.0.1:80"]
        );
        assert!(registry.destinations("phone").is_empty());

        let laptop = registry.local_addr("laptop", "127.0.0.1:22").unwrap();
        let desktop = registry.local_addr("desktop", "127.0.0.1:22").unwrap();
        assert_ne!(laptop, desktop);
        assert!(registry.get("laptop", "127.0.0.1:443").is_none());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let mut bad = outbound("laptop", "127.0.0.1:22");
        bad.source = "udp://127.0.0.1:0".to_string();

        assert!(matches!(
            OutboundRegistry::bind(&[bad]).await,
            Err(Error::Listen { .. })
        ));
    }
}
