//! Transport helpers shared by both roles
//!
//! Provides:
//! - Address parsing for `tcp://`, `tcp4://` and `tcp6://` endpoints
//! - Bounded TCP dialing and listening
//! - A non-closing wrapper so a session can borrow a connection it does not own
//! - Bidirectional relaying with a drain deadline
//! - A depth-1 listener that sheds connections nobody is waiting for

mod drop_listener;
mod relay;

pub use drop_listener::DropListener;
pub use relay::{is_timeout, relay, RELAY_DRAIN_TIMEOUT};

use crate::{Error, Result};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::debug;

/// Upper bound on establishing one TCP connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle time before the kernel starts probing a silent peer
pub const KEEPALIVE_TIME: Duration = Duration::from_secs(15);

/// Address family requested by an endpoint scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

/// Split an endpoint into its address family and `host:port` part.
///
/// Endpoints without a scheme are taken as plain TCP.
pub fn parse_address(address: &str) -> io::Result<(Family, &str)> {
    match address.split_once("://") {
        None => Ok((Family::Any, address)),
        Some(("tcp", rest)) => Ok((Family::Any, rest)),
        Some(("tcp4", rest)) => Ok((Family::V4, rest)),
        Some(("tcp6", rest)) => Ok((Family::V6, rest)),
        Some((scheme, _)) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported protocol scheme: {}", scheme),
        )),
    }
}

async fn resolve(address: &str) -> io::Result<Vec<SocketAddr>> {
    let (family, target) = parse_address(address)?;
    let addrs: Vec<SocketAddr> = lookup_host(target)
        .await?
        .filter(|addr| family.accepts(addr))
        .collect();

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable address for {}", address),
        ));
    }
    Ok(addrs)
}

async fn connect_any(address: &str) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in resolve(address).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
}

/// Dial a TCP endpoint within [`CONNECT_TIMEOUT`]
pub async fn dial(address: &str) -> Result<TcpStream> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, connect_any(address))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|source| Error::Connect {
            address: address.to_string(),
            source,
        })?;

    if let Err(e) = apply_tcp_options(&stream) {
        debug!(address, error = %e, "Failed to set TCP options");
    }
    debug!(address, "Connected");

    Ok(stream)
}

/// Disable Nagle and enable TCP keepalive on a tunnel socket
pub fn apply_tcp_options(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Bind a TCP listener on the first usable address of `address`
pub async fn listen(address: &str) -> io::Result<TcpListener> {
    let mut last_error = None;
    for addr in resolve(address).await? {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
}

/// Discard everything the peer still sends, then let the connection close
pub async fn drain<T: AsyncRead + Unpin>(mut conn: T) {
    match tokio::io::copy(&mut conn, &mut tokio::io::sink()).await {
        Ok(n) => debug!(bytes = n, "Drained connection"),
        Err(e) => debug!(error = %e, "Drain ended with error"),
    }
}

/// Wrapper whose shutdown only flushes, leaving the inner stream open
#[derive(Debug)]
pub struct NopClose<T>(T);

impl<T> NopClose<T> {
    pub fn new(inner: T) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for NopClose<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for NopClose<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }
}
