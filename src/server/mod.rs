//! Server role
//!
//! Each accepted connection goes through four steps: the client's derived
//! identifier is matched against the configured clients, the Noise handshake
//! runs with the server as initiator, control PDUs are answered, and finally
//! the connection is handed to a session. Connections rejected at any step
//! are drained before being closed, so a refused probe looks like an idle one.

mod outbound;

pub use outbound::OutboundRegistry;

use crate::config::{self, Allow, ServerConfig};
use crate::crypto::{
    handshake, verify_identifier, Cipher, HandshakeOptions, HandshakeRole, KeyPair, PublicKey,
    DERIVED_ID_LEN,
};
use crate::filter::Approver;
use crate::protocol::{
    generate_id, read_pdu, write_pdu, Ack, Bind, Body, ControlError, InboundsResp, Pdu,
    HANDSHAKE_TIMEOUT, STATUS_BAD_REQUEST, STATUS_FORBIDDEN, STATUS_INTERNAL_ERROR,
    STATUS_NOT_FOUND, STATUS_UNPROCESSABLE,
};
use crate::transport::{self, drain, DropListener, NopClose};
use crate::tunnel::{ChunkedStream, ClientSession, ServerSession, Tunnel};
use crate::{Error, Result};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pause after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

type Conn = ChunkedStream<TcpStream>;

/// What to do after answering a control PDU
enum Next {
    /// Wait for another PDU
    Await,
    /// Stop talking to this client
    Close,
    /// Hand the connection to a session
    Stream(Streaming),
}

enum Streaming {
    /// Accept streams from the client and dial the tunnel destination
    Serve(Tunnel),
    /// Open streams towards the client for connections on a server port
    Open(Tunnel, Arc<DropListener>),
}

/// A known client
struct Peer {
    identifier: String,
    public: PublicKey,
}

pub struct Server {
    address: String,
    keypair: KeyPair,
    peers: Vec<Peer>,
    approver: Approver,
    allow_list: Vec<Allow>,
    outbound: OutboundRegistry,
}

impl Server {
    /// Build the server and bind its outbound listeners
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let keypair = config.keypair()?;
        let approver = config.approver()?;

        let mut peers = Vec::with_capacity(config.clients.len());
        for identifier in config.clients.keys() {
            let public = config.client_key(identifier).map_err(|e| {
                Error::Config(format!("invalid key for client {}: {}", identifier, e))
            })?;
            peers.push(Peer {
                identifier: identifier.clone(),
                public,
            });
        }

        let outbound = OutboundRegistry::bind(&config.outbounds).await?;

        Ok(Self {
            address: config.address,
            keypair,
            peers,
            approver,
            allow_list: config.allow_list,
            outbound,
        })
    }

    /// Bind the configured address and serve forever
    pub async fn listen(self) -> Result<()> {
        let listener = transport::listen(&self.address)
            .await
            .map_err(|source| Error::Listen {
                address: self.address.clone(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(address = %listener.local_addr()?, "Listening");
        let server = Arc::new(self);

        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let server = server.clone();
                    let span = info_span!("conn", id = %generate_id(), %peer);
                    tokio::spawn(async move { server.handle(conn).await }.instrument(span));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn handle(&self, mut conn: TcpStream) {
        if let Err(e) = transport::apply_tcp_options(&conn) {
            debug!(error = %e, "Failed to set TCP options");
        }
        info!("Handshake");

        let accepted = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.authenticate(&mut conn)).await;
        let (identifier, cipher) = match accepted {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                error!(error = %e, "Failed to perform handshake");
                drain(conn).await;
                return;
            }
            Err(_) => {
                error!("Handshake timed out");
                drain(conn).await;
                return;
            }
        };

        let mut conn = ChunkedStream::new(conn, cipher);
        let Some(streaming) = self.control(&identifier, &mut conn).await else {
            drain(conn.into_inner()).await;
            return;
        };

        if let Some(conn) = self.stream(streaming, conn).await {
            drain(conn.into_inner().into_inner()).await;
        }
    }

    /// Recognize the client and run the handshake
    async fn authenticate(&self, conn: &mut TcpStream) -> Result<(String, Cipher)> {
        debug!("Reading derived identifier");
        let mut token = [0u8; DERIVED_ID_LEN];
        conn.read_exact(&mut token).await?;

        let peer = self.recognize(&token).ok_or(Error::UnknownClient)?;
        debug!(identifier = %peer.identifier, "Recognized client");

        debug!("Performing Noise handshake");
        let options = HandshakeOptions::new(self.keypair.clone(), peer.public.clone());
        let cipher = handshake(conn, &options, HandshakeRole::Initiator).await?;

        Ok((peer.identifier.clone(), cipher))
    }

    fn recognize(&self, token: &[u8]) -> Option<&Peer> {
        self.peers
            .iter()
            .find(|peer| verify_identifier(token, &peer.identifier))
    }

    /// Answer control PDUs until one of them starts streaming
    async fn control(&self, identifier: &str, conn: &mut Conn) -> Option<Streaming> {
        loop {
            let request = match read_pdu(conn).await {
                Ok(pdu) => pdu,
                Err(ControlError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("Connection closed during control");
                    return None;
                }
                Err(e) => {
                    error!(error = %e, "Failed to receive control");
                    let mut response =
                        Pdu::error("unknown", STATUS_INTERNAL_ERROR, "failed to receive control");
                    let _ = write_pdu(conn, &mut response).await;
                    return None;
                }
            };

            let (mut response, next) = self.dispatch(identifier, request).await;
            if let Err(e) = write_pdu(conn, &mut response).await {
                error!(error = %e, "Failed to send control");
                return None;
            }

            match next {
                Next::Await => continue,
                Next::Close => {
                    info!("Closing connection");
                    return None;
                }
                Next::Stream(streaming) => return Some(streaming),
            }
        }
    }

    async fn dispatch(&self, session: &str, request: Pdu) -> (Pdu, Next) {
        let pid = request.pid().to_string();
        info!(control = %request.control_id(), "Performing control");

        match request.body {
            Body::Inbounds(req) => {
                if req.identifier.is_empty() {
                    return (
                        Pdu::error(pid, STATUS_UNPROCESSABLE, "missing identifier"),
                        Next::Close,
                    );
                }
                if req.identifier != session {
                    warn!(identifier = %req.identifier, "Forbidden");
                    return (
                        Pdu::error(pid, STATUS_FORBIDDEN, "invalid identifier"),
                        Next::Close,
                    );
                }

                let inbounds = self.outbound.destinations(session);
                (
                    Pdu::new(pid, Body::InboundsResp(InboundsResp { inbounds })),
                    Next::Await,
                )
            }
            Body::BindClientToServer(req) => {
                if let Some(rejection) = validate_bind(&pid, session, &req) {
                    return (rejection, Next::Await);
                }

                if !self.allow_list.is_empty() {
                    if let Err(e) = self.approver.allowed(&req.address).await {
                        warn!(error = %e, address = %req.address, "Rejected");
                        return (
                            Pdu::error(pid, STATUS_FORBIDDEN, "rejected address"),
                            Next::Await,
                        );
                    }
                }

                let ignore_errors = config::ignore_errors_for(&self.allow_list, &req.address);
                let tunnel = Tunnel::new(req.identifier, self.address.clone(), req.address)
                    .with_ignore_errors(ignore_errors);

                (
                    Pdu::new(pid, Body::BindClientToServerResp(Ack {})),
                    Next::Stream(Streaming::Serve(tunnel)),
                )
            }
            Body::BindServerToClient(req) => {
                if let Some(rejection) = validate_bind(&pid, session, &req) {
                    return (rejection, Next::Await);
                }

                let Some(listener) = self.outbound.get(session, &req.address) else {
                    warn!(address = %req.address, "Unknown outbound");
                    return (
                        Pdu::error(pid, STATUS_NOT_FOUND, "unknown outbound"),
                        Next::Await,
                    );
                };

                let tunnel = Tunnel::new(listener.address(), self.address.clone(), req.address);
                (
                    Pdu::new(pid, Body::BindServerToClientResp(Ack {})),
                    Next::Stream(Streaming::Open(tunnel, listener)),
                )
            }
            _ => (
                Pdu::error(pid, STATUS_BAD_REQUEST, "unsupported PDU"),
                Next::Close,
            ),
        }
    }

    /// Run the session and hand back the connection once it ends
    async fn stream(&self, streaming: Streaming, conn: Conn) -> Option<NopClose<Conn>> {
        let conn = NopClose::new(conn);

        match streaming {
            Streaming::Serve(tunnel) => {
                let mut session = ServerSession::new(tunnel, conn);
                if let Err(e) = session.listen().await {
                    error!(error = %e, "Stream closed");
                }
                session.shutdown().await
            }
            Streaming::Open(tunnel, listener) => {
                let session = ClientSession::new(tunnel, conn);
                if let Err(e) = session.establish(&listener).await {
                    error!(error = %e, "Stream closed");
                }
                session.shutdown().await
            }
        }
    }
}

fn validate_bind(pid: &str, session: &str, req: &Bind) -> Option<Pdu> {
    if req.identifier.is_empty() || req.address.is_empty() {
        return Some(Pdu::error(
            pid,
            STATUS_UNPROCESSABLE,
            "missing identifier or address",
        ));
    }
    if req.identifier != session {
        warn!(identifier = %req.identifier, "Forbidden");
        return Some(Pdu::error(pid, STATUS_FORBIDDEN, "invalid identifier"));
    }
    None
}
