//! Listener holding at most one pending connection
//!
//! Connections arriving while the slot is full are closed straight away
//! instead of queueing behind a session that may never come.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct DropListener {
    address: String,
    local_addr: SocketAddr,
    pending: Mutex<mpsc::Receiver<TcpStream>>,
    task: JoinHandle<()>,
}

impl DropListener {
    /// Bind `address` and start accepting
    pub async fn bind(address: &str) -> io::Result<Self> {
        let listener = super::listen(address).await?;
        Self::from_listener(address, listener)
    }

    /// Start accepting on an already bound listener
    pub fn from_listener(address: impl Into<String>, listener: TcpListener) -> io::Result<Self> {
        let address = address.into();
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(serve(listener, tx, address.clone()));

        Ok(Self {
            address,
            local_addr,
            pending: Mutex::new(rx),
            task,
        })
    }

    /// Configured address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take the pending connection, waiting for one if needed.
    ///
    /// Returns `None` once the accept loop has stopped.
    pub async fn accept(&self) -> Option<TcpStream> {
        self.pending.lock().await.recv().await
    }
}

impl Drop for DropListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(listener: TcpListener, pending: mpsc::Sender<TcpStream>, address: String) {
    loop {
        match listener.accept().await {
            Ok((conn, peer)) => match pending.try_send(conn) {
                Ok(()) => debug!(%peer, address = %address, "Connection waiting for session"),
                Err(TrySendError::Full(_)) => {
                    info!(%peer, address = %address, "No session for connection, dropping");
                }
                Err(TrySendError::Closed(_)) => return,
            },
            Err(e) => {
                warn!(error = %e, address = %address, "Accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}
