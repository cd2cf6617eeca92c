//! Tunnels the server opens towards destinations near the client

use super::{report_attempt, Connector};
use crate::config::{self, Allow};
use crate::filter::Approver;
use crate::protocol::{exchange, Bind, Body, Inbounds, Pdu};
use crate::retry::Backoff;
use crate::tunnel::{ServerSession, Tunnel};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Source shown for tunnels whose listening side is on the server
const REMOTE_SIDE: &str = "remote_side";

/// Ask the server which destinations it expects this client to serve
pub(super) async fn tunnels(
    connector: &Connector,
    approver: &Approver,
    allow_list: &[Allow],
) -> Result<Vec<Tunnel>> {
    let mut conn = connector.connect().await?;

    let request = Pdu::request(Body::Inbounds(Inbounds {
        identifier: connector.identifier().to_string(),
    }));
    let destinations = match exchange(&mut conn, request).await?.body {
        Body::InboundsResp(resp) => resp.inbounds,
        _ => Vec::new(),
    };

    let mut tunnels = Vec::with_capacity(destinations.len());
    for destination in destinations {
        if let Err(e) = approver.allowed(&destination).await {
            warn!(error = %e, %destination, "Dropped destination");
            continue;
        }

        let ignore_errors = config::ignore_errors_for(allow_list, &destination);
        tunnels.push(
            Tunnel::new(REMOTE_SIDE, connector.address(), destination)
                .with_ignore_errors(ignore_errors),
        );
    }
    Ok(tunnels)
}

/// Keep a tunnel bound until a non-retryable failure
pub(super) async fn serve(connector: Arc<Connector>, tunnel: Tunnel, backoff: Backoff) {
    let err = backoff
        .retry(|prev| {
            let connector = connector.clone();
            let tunnel = tunnel.clone();
            async move {
                let result = open(&connector, tunnel).await;
                report_attempt(prev.as_ref(), &result);
                result
            }
        })
        .await;

    error!(error = %err, "Tunnel stopped");
}

async fn open(connector: &Connector, tunnel: Tunnel) -> Result<()> {
    let mut conn = connector.connect().await?;

    let request = Pdu::request(Body::BindServerToClient(Bind {
        identifier: connector.identifier().to_string(),
        address: tunnel.destination.clone(),
    }));
    exchange(&mut conn, request).await?;
    info!("Inbound bound");

    let mut session = ServerSession::new(tunnel, conn);
    let result = session.listen().await.map_err(Error::from);
    session.shutdown().await;
    result
}
