//! Stream multiplexer for the tunnel
//!
//! Manages multiple logical streams over a single encrypted connection.
//! A reader task dispatches incoming frames to per-stream channels and a
//! writer task drains the shared frame queue onto the connection. Stream
//! IDs opened by the client role are odd, those opened by the server role
//! are even.

use super::{
    Frame, FrameType, TunnelError, TunnelStream, ACCEPT_BACKLOG, DEFAULT_WINDOW_SIZE,
    MAX_PAYLOAD_SIZE, MAX_STREAMS,
};
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Frames coalesced into one write
const WRITE_BATCH_SIZE: usize = 64 * 1024;

/// How long `shutdown` waits for the writer to flush its last frames
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Which side of the session we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` belongs to the streams this role opens
    fn owns(self, id: u32) -> bool {
        (id % 2 == 1) == (self == Role::Client)
    }
}

enum Inbound {
    Data(Bytes),
    Reset,
}

/// Multiplexer state for a single stream
struct StreamSlot {
    stream: TunnelStream,
    /// Dropped once the peer closes its side
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    /// Writer parked on an empty send window
    send_waker: Option<Waker>,
}

struct Shared {
    role: Role,
    streams: Mutex<HashMap<u32, StreamSlot>>,
    frames: mpsc::UnboundedSender<Frame>,
    next_stream_id: AtomicU32,
    closed: watch::Sender<bool>,
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn send(&self, frame: Frame) {
        // Fails only once the writer is gone, at which point nobody cares
        let _ = self.frames.send(frame);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Mark the session closed and reset every stream still registered
    fn teardown(&self, failure: Option<String>) {
        if let Some(reason) = failure {
            let mut slot = self.failure.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }

        self.closed.send_replace(true);

        let streams = std::mem::take(&mut *self.streams.lock());
        for (_, mut slot) in streams {
            if let Some(tx) = slot.inbound.take() {
                let _ = tx.send(Inbound::Reset);
            }
            if let Some(waker) = slot.send_waker.take() {
                waker.wake();
            }
        }
    }
}

/// Stream multiplexer bound to one transport
pub struct Multiplexer<T> {
    shared: Arc<Shared>,
    incoming: mpsc::Receiver<MuxStream>,
    reader: Option<JoinHandle<ReadHalf<T>>>,
    writer: Option<JoinHandle<WriteHalf<T>>>,
}

impl<T> Multiplexer<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a client-side multiplexer
    pub fn client(conn: T) -> Self {
        Self::new(conn, Role::Client)
    }

    /// Create a server-side multiplexer
    pub fn server(conn: T) -> Self {
        Self::new(conn, Role::Server)
    }

    /// Start the reader and writer tasks over `conn`
    pub fn new(conn: T, role: Role) -> Self {
        let (read_half, write_half) = tokio::io::split(conn);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (closed, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            role,
            streams: Mutex::new(HashMap::new()),
            frames: frames_tx,
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            closed,
            failure: Mutex::new(None),
        });

        let reader = tokio::spawn(read_loop(read_half, shared.clone(), incoming_tx));
        let writer = tokio::spawn(write_loop(write_half, frames_rx, shared.clone()));

        Self {
            shared,
            incoming: incoming_rx,
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    /// Close the session and hand the transport back once both tasks stop.
    ///
    /// Returns `None` if the tasks could not be joined in time.
    pub async fn shutdown(mut self) -> Option<T> {
        self.close();

        let reader = self.reader.take()?.await.ok()?;
        let writer = match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.writer.take()?).await {
            Ok(joined) => joined.ok()?,
            Err(_) => {
                warn!("Session writer did not stop in time");
                return None;
            }
        };

        Some(reader.unsplit(writer))
    }
}

impl<T> Multiplexer<T> {
    /// Get the session role
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Open a new outgoing stream
    pub fn open_stream(&self) -> Result<MuxStream, TunnelError> {
        let mut streams = self.shared.streams.lock();
        if self.shared.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        if streams.len() >= MAX_STREAMS {
            return Err(TunnelError::TooManyStreams);
        }

        let stream_id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (stream, slot) = MuxStream::pair(stream_id, &self.shared);
        streams.insert(stream_id, slot);
        drop(streams);

        // Queued before any data the caller writes on the stream
        self.shared.send(Frame::open(stream_id));
        trace!(stream_id, "Opened stream");

        Ok(stream)
    }

    /// Wait for the next stream opened by the peer.
    ///
    /// `Ok(None)` means the session ended cleanly.
    pub async fn accept(&mut self) -> Result<Option<MuxStream>, TunnelError> {
        match self.incoming.recv().await {
            Some(stream) => Ok(Some(stream)),
            None => match self.error() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    /// Why the session failed, if it did
    pub fn error(&self) -> Option<TunnelError> {
        self.shared
            .failure
            .lock()
            .clone()
            .map(TunnelError::SessionFailed)
    }

    /// Resolve once the session has ended, for whatever reason
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Check if the session has ended
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Close the session. Calling this more than once has no further effect.
    pub fn close(&self) {
        if self.shared.is_closed() {
            return;
        }
        self.shared.send(Frame::go_away());
        self.shared.teardown(None);
    }
}

impl<T> Drop for Multiplexer<T> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<T: AsyncRead>(
    mut reader: ReadHalf<T>,
    shared: Arc<Shared>,
    incoming: mpsc::Sender<MuxStream>,
) -> ReadHalf<T> {
    let result = pump_frames(&mut reader, &shared, &incoming).await;
    if let Err(e) = &result {
        debug!(error = %e, "Session reader failed");
    }
    shared.teardown(result.err().map(|e| e.to_string()));
    reader
}

async fn pump_frames<T: AsyncRead>(
    reader: &mut ReadHalf<T>,
    shared: &Arc<Shared>,
    incoming: &mpsc::Sender<MuxStream>,
) -> Result<(), TunnelError> {
    let mut closed = shared.closed.subscribe();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        while let Some(frame) = Frame::decode(&mut buf)? {
            if !dispatch(shared, incoming, frame)? {
                return Ok(());
            }
        }

        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                if read? == 0 {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    return Err(TunnelError::InvalidFrame("truncated frame".to_string()));
                }
            }
            _ = closed.wait_for(|closed| *closed) => return Ok(()),
        }
    }
}

/// Handle an incoming frame. Returns `false` when the peer is going away.
fn dispatch(
    shared: &Arc<Shared>,
    incoming: &mpsc::Sender<MuxStream>,
    frame: Frame,
) -> Result<bool, TunnelError> {
    let stream_id = frame.stream_id;

    match frame.frame_type {
        FrameType::Data => {
            let mut streams = shared.streams.lock();
            match streams.get_mut(&stream_id) {
                Some(slot) => {
                    slot.stream.receive(frame.payload.len() as u32)?;
                    if let Some(tx) = &slot.inbound {
                        let _ = tx.send(Inbound::Data(frame.payload));
                    }
                }
                None => trace!(stream_id, "Data for unknown stream"),
            }
        }
        FrameType::Open => {
            if stream_id == 0 || shared.role.owns(stream_id) {
                return Err(TunnelError::InvalidFrame(format!(
                    "peer opened stream with local id {}",
                    stream_id
                )));
            }

            let stream = {
                let mut streams = shared.streams.lock();
                if streams.contains_key(&stream_id) {
                    return Err(TunnelError::InvalidFrame(format!(
                        "duplicate stream {}",
                        stream_id
                    )));
                }
                if streams.len() >= MAX_STREAMS {
                    drop(streams);
                    warn!(stream_id, "Too many streams, refusing");
                    shared.send(Frame::close(stream_id));
                    return Ok(true);
                }

                let (stream, slot) = MuxStream::pair(stream_id, shared);
                streams.insert(stream_id, slot);
                stream
            };

            // A refused stream is dropped here, which closes it towards the peer
            if incoming.try_send(stream).is_err() {
                warn!(stream_id, "Accept backlog full, refusing stream");
            }
        }
        FrameType::Close => {
            let mut streams = shared.streams.lock();
            if let Some(slot) = streams.get_mut(&stream_id) {
                slot.stream.close_remote();
                slot.inbound = None;
                if slot.stream.is_closed() {
                    streams.remove(&stream_id);
                }
            }
        }
        FrameType::WindowUpdate => {
            let increment = frame.increment()?;
            let mut streams = shared.streams.lock();
            if let Some(slot) = streams.get_mut(&stream_id) {
                slot.stream.update_send_window(increment);
                if let Some(waker) = slot.send_waker.take() {
                    waker.wake();
                }
            }
        }
        FrameType::GoAway => {
            debug!("Peer is going away");
            return Ok(false);
        }
    }

    Ok(true)
}

async fn write_loop<T: AsyncWrite>(
    mut writer: WriteHalf<T>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
) -> WriteHalf<T> {
    let result = drain_frames(&mut writer, &mut frames, &shared).await;
    if let Err(e) = &result {
        debug!(error = %e, "Session writer failed");
    }
    let _ = writer.shutdown().await;
    shared.teardown(result.err().map(|e| e.to_string()));
    writer
}

async fn drain_frames<T: AsyncWrite>(
    writer: &mut WriteHalf<T>,
    frames: &mut mpsc::UnboundedReceiver<Frame>,
    shared: &Shared,
) -> io::Result<()> {
    let mut closed = shared.closed.subscribe();
    let mut batch = BytesMut::with_capacity(WRITE_BATCH_SIZE);

    loop {
        // Queued frames win over the close signal so a final GoAway gets out
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => return Ok(()),
            },
            _ = closed.wait_for(|closed| *closed) => return Ok(()),
        };

        let mut going_away = frame.frame_type == FrameType::GoAway;
        frame.encode_into(&mut batch);
        while !going_away && batch.len() < WRITE_BATCH_SIZE {
            match frames.try_recv() {
                Ok(frame) => {
                    going_away = frame.frame_type == FrameType::GoAway;
                    frame.encode_into(&mut batch);
                }
                Err(_) => break,
            }
        }

        writer.write_all(&batch).await?;
        writer.flush().await?;
        batch.clear();

        if going_away {
            return Ok(());
        }
    }
}

/// One multiplexed stream, usable as a plain byte stream
pub struct MuxStream {
    id: u32,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    /// Received bytes not yet handed to the reader
    pending: Bytes,
    /// Bytes consumed since the last window update
    unacked: u32,
    read_closed: bool,
    write_closed: bool,
}

impl MuxStream {
    fn pair(id: u32, shared: &Arc<Shared>) -> (Self, StreamSlot) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = Self {
            id,
            shared: shared.clone(),
            inbound: rx,
            pending: Bytes::new(),
            unacked: 0,
            read_closed: false,
            write_closed: false,
        };
        let slot = StreamSlot {
            stream: TunnelStream::new(id),
            inbound: Some(tx),
            send_waker: None,
        };
        (stream, slot)
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Return consumed bytes to the peer once half a window has gone
    fn grant(&mut self, consumed: usize) {
        self.unacked += consumed as u32;
        if self.unacked < DEFAULT_WINDOW_SIZE / 2 {
            return;
        }

        let increment = std::mem::take(&mut self.unacked);
        let mut streams = self.shared.streams.lock();
        if let Some(slot) = streams.get_mut(&self.id) {
            slot.stream.apply_window_update(increment);
            drop(streams);
            self.shared.send(Frame::window_update(self.id, increment));
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.pending.is_empty() {
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.inbound.poll_recv(cx)) {
                Some(Inbound::Data(data)) => this.pending = data,
                Some(Inbound::Reset) => {
                    this.read_closed = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "session closed",
                    )));
                }
                None => this.read_closed = true,
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending[..n]);
        this.pending.advance(n);
        this.grant(n);

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed for writing",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut streams = this.shared.streams.lock();
        let slot = match streams.get_mut(&this.id) {
            Some(slot) if slot.stream.can_send() => slot,
            _ => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "stream reset",
                )))
            }
        };

        let window = slot.stream.send_window() as usize;
        if window == 0 {
            slot.send_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf.len().min(window).min(MAX_PAYLOAD_SIZE);
        slot.stream
            .consume_send_window(n as u32)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        drop(streams);

        this.shared
            .send(Frame::data(this.id, Bytes::copy_from_slice(&buf[..n])));
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Ok(()));
        }
        this.write_closed = true;

        let mut streams = this.shared.streams.lock();
        if let Some(slot) = streams.get_mut(&this.id) {
            slot.stream.close_local();
            if slot.stream.is_closed() {
                streams.remove(&this.id);
            }
            drop(streams);
            this.shared.send(Frame::close(this.id));
        }

        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let removed = self.shared.streams.lock().remove(&self.id);
        if removed.is_some() && !self.write_closed {
            self.shared.send(Frame::close(self.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn pair() -> (Multiplexer<DuplexStream>, Multiplexer<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Multiplexer::client(a), Multiplexer::server(b))
    }

    #[tokio::test]
    async fn test_multiplexer_stream_ids() {
        let (client, server) = pair();

        assert_eq!(client.open_stream().unwrap().id(), 1);
        assert_eq!(client.open_stream().unwrap().id(), 3);
        assert_eq!(server.open_stream().unwrap().id(), 2);
        assert_eq!(client.role(), Role::Client);
    }

    #[tokio::test]
    async fn test_open_accept_echo() {
        let (client, mut server) = pair();

        let mut outgoing = client.open_stream().unwrap();
        outgoing.write_all(b"ping").await.unwrap();

        let mut incoming = server.accept().await.unwrap().unwrap();
        assert_eq!(incoming.id(), 1);

        let mut buf = [0u8; 4];
        incoming.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        incoming.write_all(b"pong").await.unwrap();
        outgoing.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_half_close() {
        let (client, mut server) = pair();

        let mut outgoing = client.open_stream().unwrap();
        outgoing.write_all(b"request").await.unwrap();
        outgoing.shutdown().await.unwrap();
        assert!(outgoing.write_all(b"late").await.is_err());

        let mut incoming = server.accept().await.unwrap().unwrap();
        let mut request = Vec::new();
        incoming.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        incoming.write_all(b"response").await.unwrap();
        incoming.shutdown().await.unwrap();

        let mut response = Vec::new();
        outgoing.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");
    }

    #[tokio::test]
    async fn test_transfer_beyond_window() {
        let (client, mut server) = pair();
        let total = DEFAULT_WINDOW_SIZE as usize * 4 + 123;

        let mut outgoing = client.open_stream().unwrap();
        let writer = tokio::spawn(async move {
            let payload: Vec<u8> = (0..total).map(|i| (i % 253) as u8).collect();
            outgoing.write_all(&payload).await.unwrap();
            outgoing.shutdown().await.unwrap();
            outgoing
        });

        let mut incoming = server.accept().await.unwrap().unwrap();
        let mut received = Vec::new();
        incoming.read_to_end(&mut received).await.unwrap();

        assert_eq!(received.len(), total);
        assert!(received.iter().enumerate().all(|(i, b)| *b == (i % 253) as u8));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_streams() {
        let (client, mut server) = pair();

        let server_task = tokio::spawn(async move {
            while let Ok(Some(mut stream)) = server.accept().await {
                tokio::spawn(async move {
                    let mut data = Vec::new();
                    stream.read_to_end(&mut data).await.unwrap();
                    stream.write_all(&data).await.unwrap();
                    stream.shutdown().await.unwrap();
                });
            }
        });

        let mut tasks = Vec::new();
        for i in 0..16u8 {
            let mut stream = client.open_stream().unwrap();
            tasks.push(tokio::spawn(async move {
                let payload = vec![i; 40_000];
                stream.write_all(&payload).await.unwrap();
                stream.shutdown().await.unwrap();
                let mut echoed = Vec::new();
                stream.read_to_end(&mut echoed).await.unwrap();
                assert_eq!(echoed, payload);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        client.close();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_peer_cleanly() {
        let (client, mut server) = pair();
        let mut stream = client.open_stream().unwrap();
        let _accepted = server.accept().await.unwrap().unwrap();

        client.close();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(client.open_stream(), Err(TunnelError::SessionClosed)));

        let mut buf = [0u8; 8];
        assert!(stream.read(&mut buf).await.is_err());

        assert!(server.accept().await.unwrap().is_none());
        server.closed().await;
    }

    #[tokio::test]
    async fn test_transport_eof_ends_session() {
        let (a, b) = tokio::io::duplex(1024);
        let mut server = Multiplexer::server(b);
        drop(a);

        assert!(server.accept().await.unwrap().is_none());
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_garbage_fails_session() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut server = Multiplexer::server(b);
        a.write_all(&[0xEE; 16]).await.unwrap();

        assert!(matches!(
            server.accept().await,
            Err(TunnelError::SessionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_returns_transport() {
        let (client, server) = pair();
        drop(server);

        let conn = client.shutdown().await;
        assert!(conn.is_some());
    }
}
