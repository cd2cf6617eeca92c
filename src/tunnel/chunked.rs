//! Chunked encrypted stream
//!
//! Wire format, repeated:
//! ```text
//! +--------+--------+--------------------------+
//! |  Length (2B BE) |  Ciphertext (Length)     |
//! +--------+--------+--------------------------+
//! ```
//!
//! Each chunk is sealed independently with the direction's cipher state.
//! Every `REKEY_MASK + 1` chunks that direction is rekeyed.

use crate::crypto::{Cipher, CipherState, CryptoError, TAG_LEN};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Largest ciphertext carried by one chunk
pub const MAX_CHUNK_LEN: usize = 0xFFFF;

/// Largest plaintext carried by one chunk
pub const MAX_PLAINTEXT_LEN: usize = MAX_CHUNK_LEN - TAG_LEN;

/// A direction is rekeyed whenever its chunk counter has these bits clear
pub const REKEY_MASK: u64 = 16 * 1024 - 1;

const PREFIX_LEN: usize = 2;

enum ReadState {
    Prefix { buf: [u8; PREFIX_LEN], filled: usize },
    Body { len: usize, filled: usize },
    Eof,
}

/// A byte stream whose contents travel as authenticated chunks
pub struct ChunkedStream<S> {
    inner: S,
    send: CipherState,
    recv: CipherState,
    chunks_written: u64,
    chunks_read: u64,
    /// Encoded frame being written, with the number of bytes already sent
    wbuf: Vec<u8>,
    wpos: usize,
    rbuf: Box<[u8]>,
    rstate: ReadState,
    /// Decrypted plaintext still owed to the reader, as a range into `rbuf`
    plain_pos: usize,
    plain_end: usize,
}

impl<S> ChunkedStream<S> {
    /// Wrap `inner` with the cipher produced by a handshake
    pub fn new(inner: S, cipher: Cipher) -> Self {
        let (send, recv) = cipher.into_parts();
        Self {
            inner,
            send,
            recv,
            chunks_written: 0,
            chunks_read: 0,
            wbuf: Vec::with_capacity(PREFIX_LEN + MAX_CHUNK_LEN),
            wpos: 0,
            rbuf: vec![0u8; MAX_CHUNK_LEN].into_boxed_slice(),
            rstate: ReadState::Prefix {
                buf: [0u8; PREFIX_LEN],
                filled: 0,
            },
            plain_pos: 0,
            plain_end: 0,
        }
    }

    /// Unwrap the raw stream, dropping the cipher states
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Number of chunks sealed so far
    pub fn chunks_written(&self) -> u64 {
        self.chunks_written
    }

    /// Number of chunks opened so far
    pub fn chunks_read(&self) -> u64 {
        self.chunks_read
    }

    fn seal_chunk(&mut self, plaintext: &[u8]) -> io::Result<()> {
        self.chunks_written += 1;
        if self.chunks_written & REKEY_MASK == 0 {
            self.send.rekey().map_err(crypto_error)?;
        }

        self.wbuf.clear();
        self.wbuf.extend_from_slice(&[0u8; PREFIX_LEN]);
        self.wbuf.extend_from_slice(plaintext);
        let tag = self
            .send
            .seal(&mut self.wbuf[PREFIX_LEN..])
            .map_err(crypto_error)?;
        self.wbuf.extend_from_slice(&tag);

        let len = (self.wbuf.len() - PREFIX_LEN) as u16;
        self.wbuf[..PREFIX_LEN].copy_from_slice(&len.to_be_bytes());
        self.wpos = 0;
        Ok(())
    }

    fn open_chunk(&mut self, len: usize) -> io::Result<()> {
        self.chunks_read += 1;
        if self.chunks_read & REKEY_MASK == 0 {
            self.recv.rekey().map_err(crypto_error)?;
        }

        let plaintext = self
            .recv
            .open(&mut self.rbuf[..len])
            .map_err(crypto_error)?;
        self.plain_pos = 0;
        self.plain_end = plaintext.len();
        Ok(())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ChunkedStream<S> {
    /// Read and open the next chunk. `false` means end of stream.
    fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        loop {
            match &mut self.rstate {
                ReadState::Prefix { buf, filled } => {
                    let mut rb = ReadBuf::new(&mut buf[*filled..]);
                    ready!(Pin::new(&mut self.inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        self.rstate = ReadState::Eof;
                        return Poll::Ready(Ok(false));
                    }

                    *filled += n;
                    if *filled == PREFIX_LEN {
                        let len = u16::from_be_bytes(*buf) as usize;
                        if len < TAG_LEN {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("invalid chunk length {}", len),
                            )));
                        }
                        self.rstate = ReadState::Body { len, filled: 0 };
                    }
                }
                ReadState::Body { len, filled } => {
                    let len = *len;
                    let mut rb = ReadBuf::new(&mut self.rbuf[*filled..len]);
                    ready!(Pin::new(&mut self.inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        // A truncated chunk is reported as a plain end of stream
                        self.rstate = ReadState::Eof;
                        return Poll::Ready(Ok(false));
                    }

                    *filled += n;
                    if *filled == len {
                        self.rstate = ReadState::Prefix {
                            buf: [0u8; PREFIX_LEN],
                            filled: 0,
                        };
                        self.open_chunk(len)?;
                        return Poll::Ready(Ok(true));
                    }
                }
                ReadState::Eof => return Poll::Ready(Ok(false)),
            }
        }
    }

    /// Push out whatever is left of the current encoded chunk
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.wpos < self.wbuf.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.wbuf[self.wpos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.wpos += n;
        }
        self.wbuf.clear();
        self.wpos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ChunkedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.plain_pos < this.plain_end {
                let n = (this.plain_end - this.plain_pos).min(out.remaining());
                out.put_slice(&this.rbuf[this.plain_pos..this.plain_pos + n]);
                this.plain_pos += n;
                return Poll::Ready(Ok(()));
            }

            if !ready!(this.poll_chunk(cx))? {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ChunkedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_PLAINTEXT_LEN);
        this.seal_chunk(&buf[..n])?;

        // The chunk is accepted; a pending write finishes on the next call
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

fn crypto_error(err: CryptoError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{random_bytes, CipherKind, KEY_LEN};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn pair(kind: CipherKind) -> (ChunkedStream<DuplexStream>, ChunkedStream<DuplexStream>) {
        let a = [0x11u8; KEY_LEN];
        let b = [0x22u8; KEY_LEN];
        let (left, right) = tokio::io::duplex(64 * 1024);
        (
            ChunkedStream::new(left, Cipher::new(kind, &a, &b).unwrap()),
            ChunkedStream::new(right, Cipher::new(kind, &b, &a).unwrap()),
        )
    }

    #[tokio::test]
    async fn test_roundtrip_larger_than_chunk() {
        let (mut left, mut right) = pair(CipherKind::ChaChaPoly);

        let mut extra = [0u8; 1];
        random_bytes(&mut extra).unwrap();
        let mut payload = vec![0u8; 0xFFF0 + 1 + extra[0] as usize * 64];
        random_bytes(&mut payload).unwrap();

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            left.write_all(&payload).await.unwrap();
            left.flush().await.unwrap();
            left
        });

        let mut received = vec![0u8; expected.len()];
        right.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        let left = writer.await.unwrap();
        assert_eq!(left.chunks_written(), 2);
        assert_eq!(right.chunks_read(), 2);
    }

    #[tokio::test]
    async fn test_small_reads_buffer_leftover() {
        let (mut left, mut right) = pair(CipherKind::AesGcm);

        left.write_all(b"hello world").await.unwrap();
        left.flush().await.unwrap();

        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hell");
        let mut rest = [0u8; 7];
        right.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"o world");
        assert_eq!(right.chunks_read(), 1);
    }

    #[tokio::test]
    async fn test_rekey_boundary_keeps_continuity() {
        let (mut left, mut right) = pair(CipherKind::ChaChaPoly);
        let total = (REKEY_MASK as usize + 1) * 2 + 100;

        let writer = tokio::spawn(async move {
            for i in 0..total {
                left.write_all(&[(i % 251) as u8]).await.unwrap();
            }
            left.shutdown().await.unwrap();
            left
        });

        let mut received = Vec::with_capacity(total);
        right.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), total);
        assert!(received
            .iter()
            .enumerate()
            .all(|(i, b)| *b == (i % 251) as u8));

        let left = writer.await.unwrap();
        assert_eq!(left.chunks_written(), total as u64);
    }

    #[tokio::test]
    async fn test_tampered_chunk_fails() {
        let key = [0x33u8; KEY_LEN];
        let (raw, other) = tokio::io::duplex(1024);
        let mut reader = ChunkedStream::new(other, Cipher::new(CipherKind::ChaChaPoly, &key, &key).unwrap());
        let mut sealer = Cipher::new(CipherKind::ChaChaPoly, &key, &key).unwrap();

        let mut ciphertext = sealer.encrypt(b"secret").unwrap();
        ciphertext[2] ^= 0x80;

        let mut raw = raw;
        raw.write_all(&(ciphertext.len() as u16).to_be_bytes()).await.unwrap();
        raw.write_all(&ciphertext).await.unwrap();

        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_eof_is_clean() {
        let (left, mut right) = pair(CipherKind::ChaChaPoly);
        let mut raw = left.into_inner();

        // Half a prefix, then the peer goes away
        raw.write_all(&[0x00]).await.unwrap();
        drop(raw);

        let mut buf = [0u8; 16];
        assert_eq!(right.read(&mut buf).await.unwrap(), 0);
        assert_eq!(right.read(&mut buf).await.unwrap(), 0);
    }
}
