//! Request/response round trip

use super::{read_pdu, write_pdu, Body, ControlError, Pdu};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

/// Send `request` and wait for its response.
///
/// An Error PDU from the peer becomes [`ControlError::Status`]. Any other
/// response must echo the request's correlation id and carry the matching
/// response control id.
pub async fn exchange<S>(conn: &mut S, mut request: Pdu) -> Result<Pdu, ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = request.control_id();
    let expected = id.response().ok_or(ControlError::NotRequest(id))?;

    write_pdu(conn, &mut request).await?;
    let response = read_pdu(conn).await?;
    trace!(pid = %response.pid(), cid = %response.control_id(), "Received response");

    if let Body::Error(payload) = response.body {
        return Err(ControlError::Status {
            status: payload.status,
            message: payload.message,
        });
    }

    if response.pid() != request.pid() || response.control_id() != expected {
        return Err(ControlError::InvalidResponse(id));
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Ack, Inbounds, InboundsResp, STATUS_FORBIDDEN};

    /// Answer the next request with whatever `respond` builds from it
    fn peer<F>(respond: F) -> tokio::io::DuplexStream
    where
        F: FnOnce(Pdu) -> Pdu + Send + 'static,
    {
        let (local, mut remote) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let request = read_pdu(&mut remote).await.unwrap();
            let mut response = respond(request);
            write_pdu(&mut remote, &mut response).await.unwrap();
        });
        local
    }

    fn inbounds() -> Pdu {
        Pdu::request(Body::Inbounds(Inbounds {
            identifier: "id-1".to_string(),
        }))
    }

    #[tokio::test]
    async fn test_exchange_ok() {
        let mut conn = peer(|req| {
            Pdu::new(
                req.pid(),
                Body::InboundsResp(InboundsResp {
                    inbounds: vec!["@1".to_string(), "@2".to_string()],
                }),
            )
        });

        let response = exchange(&mut conn, inbounds()).await.unwrap();
        match response.body {
            Body::InboundsResp(resp) => assert_eq!(resp.inbounds, vec!["@1", "@2"]),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exchange_error_status() {
        let mut conn = peer(|_| Pdu::error("unrelated", STATUS_FORBIDDEN, "invalid identifier"));

        let err = exchange(&mut conn, inbounds()).await.unwrap_err();
        assert_eq!(err.status(), Some(STATUS_FORBIDDEN));
        assert_eq!(err.to_string(), "[403] invalid identifier");
    }

    #[tokio::test]
    async fn test_exchange_rejects_mismatch() {
        let mut conn = peer(|_| Pdu::new("other-id", Body::InboundsResp(InboundsResp::default())));
        assert!(matches!(
            exchange(&mut conn, inbounds()).await,
            Err(ControlError::InvalidResponse(_))
        ));

        let mut conn = peer(|req| Pdu::new(req.pid(), Body::BindClientToServerResp(Ack {})));
        let err = exchange(&mut conn, inbounds()).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid inbounds response");
    }

    #[tokio::test]
    async fn test_exchange_only_requests() {
        let (mut conn, _remote) = tokio::io::duplex(64);
        let response = Pdu::new("x", Body::InboundsResp(InboundsResp::default()));
        assert!(matches!(
            exchange(&mut conn, response).await,
            Err(ControlError::NotRequest(_))
        ));
    }
}
