//! Tunnel sessions
//!
//! A session owns one multiplexer and moves TCP connections across it.
//! The client-role session takes local connections from a drop listener and
//! opens a stream for each; the server-role session accepts streams and
//! dials the destination for each.

use super::{Multiplexer, MuxStream, TunnelError};
use crate::transport::{self, is_timeout, relay, DropListener};
use regex::Regex;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

/// Endpoints joined by a session
#[derive(Debug, Clone, Default)]
pub struct Tunnel {
    pub source: String,
    pub remote: String,
    pub destination: String,
    /// Failures matching one of these are logged at debug level only
    pub ignore_errors: Vec<Regex>,
}

impl Tunnel {
    pub fn new(
        source: impl Into<String>,
        remote: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            remote: remote.into(),
            destination: destination.into(),
            ignore_errors: Vec::new(),
        }
    }

    pub fn with_ignore_errors(mut self, ignore_errors: Vec<Regex>) -> Self {
        self.ignore_errors = ignore_errors;
        self
    }

    /// Check if a failure message matches an ignore pattern
    pub fn is_ignored(&self, message: &str) -> bool {
        self.ignore_errors.iter().any(|re| re.is_match(message))
    }

    fn report(&self, what: &str, err: &dyn fmt::Display) {
        let message = err.to_string();
        if self.is_ignored(&message) {
            debug!(tunnel = %self, error = %message, "{}", what);
        } else {
            error!(tunnel = %self, error = %message, "{}", what);
        }
    }

    fn report_relay(&self, stream_id: u32, result: io::Result<(u64, u64)>) {
        match result {
            Ok((sent, received)) => debug!(stream_id, sent, received, "Relay finished"),
            Err(e) if is_timeout(&e) => debug!(stream_id, error = %e, "Relay deadline reached"),
            Err(e) => self.report("Relay failed", &e),
        }
    }

    async fn forward(&self, stream: MuxStream) {
        let stream_id = stream.id();
        let conn = match transport::dial(&self.destination).await {
            Ok(conn) => conn,
            Err(e) => {
                self.report("Failed to dial destination", &e);
                return;
            }
        };
        self.report_relay(stream_id, relay(stream, conn).await);
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {} <-> {}", self.source, self.remote, self.destination)
    }
}

/// Session that accepts streams and dials the destination for each
pub struct ServerSession<T> {
    tunnel: Arc<Tunnel>,
    mux: Multiplexer<T>,
}

impl<T> ServerSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(tunnel: Tunnel, conn: T) -> Self {
        Self {
            tunnel: Arc::new(tunnel),
            mux: Multiplexer::server(conn),
        }
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    /// Serve incoming streams until the peer ends the session.
    ///
    /// A clean end returns `Ok`, a broken transport returns the error.
    pub async fn listen(&mut self) -> Result<(), TunnelError> {
        info!(tunnel = %self.tunnel, "Session listening");
        while let Some(stream) = self.mux.accept().await? {
            let tunnel = self.tunnel.clone();
            tokio::spawn(async move { tunnel.forward(stream).await });
        }
        debug!(tunnel = %self.tunnel, "Session ended");
        Ok(())
    }

    /// Close the session and return the transport
    pub async fn shutdown(self) -> Option<T> {
        self.mux.shutdown().await
    }
}

/// Session that opens one stream per local connection
pub struct ClientSession<T> {
    tunnel: Arc<Tunnel>,
    mux: Multiplexer<T>,
}

impl<T> ClientSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(tunnel: Tunnel, conn: T) -> Self {
        Self {
            tunnel: Arc::new(tunnel),
            mux: Multiplexer::client(conn),
        }
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    /// Relay connections taken from `listener` until the session ends
    pub async fn establish(&self, listener: &DropListener) -> Result<(), TunnelError> {
        info!(tunnel = %self.tunnel, "Session established");
        loop {
            let conn = tokio::select! {
                _ = self.mux.closed() => break,
                conn = listener.accept() => match conn {
                    Some(conn) => conn,
                    None => return Err(TunnelError::SessionClosed),
                },
            };
            self.open(conn)?;
        }

        match self.mux.error() {
            Some(err) => Err(err),
            None => {
                debug!(tunnel = %self.tunnel, "Session ended");
                Ok(())
            }
        }
    }

    fn open(&self, conn: TcpStream) -> Result<(), TunnelError> {
        let stream = match self.mux.open_stream() {
            Ok(stream) => stream,
            Err(e) => {
                self.tunnel.report("Failed to open stream", &e);
                return Err(e);
            }
        };

        let tunnel = self.tunnel.clone();
        tokio::spawn(async move {
            let stream_id = stream.id();
            tunnel.report_relay(stream_id, relay(conn, stream).await);
        });
        Ok(())
    }

    /// Close the session and return the transport
    pub async fn shutdown(self) -> Option<T> {
        self.mux.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr.to_string()
    }

    #[test]
    fn test_tunnel_display_and_ignore() {
        let tunnel = Tunnel::new("127.0.0.1:80", "server:7000", "10.0.0.1:22")
            .with_ignore_errors(vec![Regex::new("connection refused").unwrap()]);

        assert_eq!(
            tunnel.to_string(),
            "127.0.0.1:80 <-> server:7000 <-> 10.0.0.1:22"
        );
        assert!(tunnel.is_ignored("dial: connection refused (os error 111)"));
        assert!(!tunnel.is_ignored("broken pipe"));
    }

    #[tokio::test]
    async fn test_sessions_relay_connections() {
        let destination = echo_server().await;
        let (a, b) = tokio::io::duplex(64 * 1024);

        let listener = Arc::new(DropListener::bind("127.0.0.1:0").await.unwrap());
        let source = listener.local_addr();

        let mut server = ServerSession::new(Tunnel::new("", "", destination.as_str()), a);
        let server_task = tokio::spawn(async move { server.listen().await });

        let client = ClientSession::new(Tunnel::new(source.to_string(), "", destination), b);
        let client_listener = listener.clone();
        let client_task =
            tokio::spawn(async move { client.establish(&client_listener).await });

        for round in 0..3u8 {
            let conn = TcpStream::connect(source).await.unwrap();
            let (mut reader, mut writer) = conn.into_split();
            let payload = vec![round; 100_000];
            let expected = payload.clone();
            tokio::spawn(async move { writer.write_all(&payload).await.unwrap() });

            let mut echoed = vec![0u8; expected.len()];
            reader.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, expected);
        }

        client_task.abort();
        let _ = client_task.await;
        assert!(server_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_client_session_ends_with_transport() {
        let (a, b) = tokio::io::duplex(1024);
        let listener = DropListener::bind("127.0.0.1:0").await.unwrap();
        let client = ClientSession::new(Tunnel::default(), b);

        drop(a);
        assert!(client.establish(&listener).await.is_ok());
        assert!(client.shutdown().await.is_some());
    }
}
