//! Tunnels from a local port to a destination near the server

use super::{report_attempt, Connector};
use crate::config::{self, Allow, Outbound};
use crate::protocol::{exchange, Bind, Body, Pdu};
use crate::retry::Backoff;
use crate::transport::DropListener;
use crate::tunnel::{ClientSession, Tunnel};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{error, info};

/// Bind the local port of a mapping
pub(super) async fn bind(
    connector: &Connector,
    mapping: &Outbound,
    allow_list: &[Allow],
) -> Result<(Tunnel, Arc<DropListener>)> {
    let listener = DropListener::bind(&mapping.source)
        .await
        .map_err(|source| Error::Listen {
            address: mapping.source.clone(),
            source,
        })?;
    info!(source = %mapping.source, local = %listener.local_addr(), "Outbound listening");

    let tunnel = Tunnel::new(
        mapping.source.as_str(),
        connector.address(),
        mapping.destination.as_str(),
    )
    .with_ignore_errors(config::ignore_errors_for(allow_list, &mapping.destination));

    Ok((tunnel, Arc::new(listener)))
}

/// Keep a tunnel established until the server refuses it
pub(super) async fn serve(
    connector: Arc<Connector>,
    tunnel: Tunnel,
    listener: Arc<DropListener>,
    backoff: Backoff,
) {
    let err = backoff
        .retry(|prev| {
            let connector = connector.clone();
            let tunnel = tunnel.clone();
            let listener = listener.clone();
            async move {
                let result = open(&connector, tunnel, &listener).await;
                report_attempt(prev.as_ref(), &result);
                result
            }
        })
        .await;

    error!(error = %err, "Tunnel stopped");
}

async fn open(connector: &Connector, tunnel: Tunnel, listener: &DropListener) -> Result<()> {
    let mut conn = connector.connect().await?;

    let request = Pdu::request(Body::BindClientToServer(Bind {
        identifier: connector.identifier().to_string(),
        address: tunnel.destination.clone(),
    }));
    match exchange(&mut conn, request).await {
        Ok(_) => {}
        Err(e) if e.is_rejection() => return Err(Error::not_retryable(e)),
        Err(e) => return Err(e.into()),
    }
    info!("Outbound bound");

    let session = ClientSession::new(tunnel, conn);
    let result = session.establish(listener).await.map_err(Error::from);
    session.shutdown().await;
    result
}
