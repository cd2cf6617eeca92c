//! Client role
//!
//! Every tunnel gets its own connection to the server. A connection starts
//! with the derived identifier token, runs the Noise handshake as responder,
//! then sends a single bind request before it turns into a session.

mod inbound;
mod outbound;

use crate::config::{Allow, ClientConfig, Outbound};
use crate::crypto::{
    derive_identifier, handshake, HandshakeOptions, HandshakeRole, KeyPair, PublicKey,
};
use crate::filter::Approver;
use crate::protocol::HANDSHAKE_TIMEOUT;
use crate::retry::{is_new_error, Backoff};
use crate::transport;
use crate::tunnel::ChunkedStream;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, Instrument};

/// Opens authenticated connections to the server
pub struct Connector {
    identifier: String,
    address: String,
    keypair: KeyPair,
    server_key: PublicKey,
}

impl Connector {
    pub fn new(
        identifier: impl Into<String>,
        address: impl Into<String>,
        keypair: KeyPair,
        server_key: PublicKey,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            address: address.into(),
            keypair,
            server_key,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Server address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Dial the server and authenticate
    pub async fn connect(&self) -> Result<ChunkedStream<TcpStream>> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.authenticate())
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn authenticate(&self) -> Result<ChunkedStream<TcpStream>> {
        let mut conn = transport::dial(&self.address).await?;

        let token = derive_identifier(&self.identifier)?;
        conn.write_all(&token).await?;

        let options = HandshakeOptions::new(self.keypair.clone(), self.server_key.clone());
        let cipher = handshake(&mut conn, &options, HandshakeRole::Responder).await?;
        debug!(server = %self.address, "Handshake complete");

        Ok(ChunkedStream::new(conn, cipher))
    }
}

pub struct Client {
    connector: Arc<Connector>,
    inbound: bool,
    approver: Approver,
    allow_list: Vec<Allow>,
    outbounds: Vec<Outbound>,
    backoff: Backoff,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let connector = Connector::new(
            config.identifier.clone(),
            config.server.address.clone(),
            config.keypair()?,
            config.server_key()?,
        );

        Ok(Self {
            connector: Arc::new(connector),
            inbound: config.inbound,
            approver: config.approver()?,
            allow_list: config.allow_list,
            outbounds: config.outbounds,
            backoff: Backoff::default(),
        })
    }

    /// Replace the delay schedule used when re-establishing tunnels
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start every configured tunnel.
    ///
    /// Fails if the inbound list cannot be fetched or a local port cannot be
    /// bound. Once running, each tunnel keeps re-establishing itself in its
    /// own task.
    pub async fn dial(&self) -> Result<JoinSet<()>> {
        let mut tasks = JoinSet::new();

        if self.inbound {
            let tunnels =
                inbound::tunnels(&self.connector, &self.approver, &self.allow_list).await?;
            info!(count = tunnels.len(), "Inbound tunnels");

            for tunnel in tunnels {
                let span = info_span!("tunnel", %tunnel);
                tasks.spawn(
                    inbound::serve(self.connector.clone(), tunnel, self.backoff).instrument(span),
                );
            }
        }

        for mapping in &self.outbounds {
            let (tunnel, listener) =
                outbound::bind(&self.connector, mapping, &self.allow_list).await?;

            let span = info_span!("tunnel", %tunnel);
            tasks.spawn(
                outbound::serve(self.connector.clone(), tunnel, listener, self.backoff)
                    .instrument(span),
            );
        }

        Ok(tasks)
    }
}

/// Log an attempt's failure, loudly only when it breaks a clean run
fn report_attempt(prev: Option<&Error>, result: &Result<()>) {
    let err = result.as_ref().err();
    match err {
        Some(e) if is_new_error(prev, err) => error!(error = %e, "Tunnel failed"),
        Some(e) => debug!(error = %e, "Tunnel failed again"),
        None => debug!("Tunnel session ended"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{verify_identifier, DERIVED_ID_LEN};
    use crate::protocol::{read_pdu, write_pdu, Ack, Body, Pdu};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Accept one client, check its token and run the initiator side
    async fn fake_server(
        server: KeyPair,
        client: PublicKey,
    ) -> (String, tokio::task::JoinHandle<Option<ChunkedStream<TcpStream>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let task = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut token = [0u8; DERIVED_ID_LEN];
            conn.read_exact(&mut token).await.unwrap();
            assert!(verify_identifier(&token, "laptop"));

            let options = HandshakeOptions::new(server, client);
            let cipher = handshake(&mut conn, &options, HandshakeRole::Initiator)
                .await
                .ok()?;
            Some(ChunkedStream::new(conn, cipher))
        });
        (address, task)
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let server = KeyPair::generate().unwrap();
        let client = KeyPair::generate().unwrap();
        let (address, task) = fake_server(server.clone(), client.public.clone()).await;

        let connector = Connector::new("laptop", address, client, server.public);
        let mut conn = connector.connect().await.unwrap();

        let mut server_conn = task.await.unwrap().unwrap();
        let mut request = Pdu::request(Body::BindServerToClientResp(Ack {}));
        write_pdu(&mut conn, &mut request).await.unwrap();
        assert_eq!(read_pdu(&mut server_conn).await.unwrap(), request);
    }

    #[tokio::test]
    async fn test_connect_rejects_wrong_server_key() {
        let server = KeyPair::generate().unwrap();
        let impostor = KeyPair::generate().unwrap();
        let client = KeyPair::generate().unwrap();
        let (address, _task) = fake_server(impostor, client.public.clone()).await;

        let connector = Connector::new("laptop", address, client, server.public);
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let keys = KeyPair::generate().unwrap();
        let connector = Connector::new("laptop", address, keys.clone(), keys.public);
        assert!(matches!(
            connector.connect().await,
            Err(Error::Connect { .. })
        ));
    }
}
