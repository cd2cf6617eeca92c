//! Bidirectional byte relay between two streams

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

/// How long the second direction may keep going after the first finished
pub const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Copy bytes both ways between `a` and `b` until both directions finish.
///
/// When one direction reaches EOF it half-closes its writer and arms a
/// deadline on the other direction, which then fails with
/// [`io::ErrorKind::TimedOut`] if it is still running when the deadline fires.
pub async fn relay<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let a_finished = Notify::new();
    let b_finished = Notify::new();

    let (forward, backward) = tokio::join!(
        copy_half(&mut a_read, &mut b_write, &a_finished, &b_finished),
        copy_half(&mut b_read, &mut a_write, &b_finished, &a_finished),
    );

    match (forward, backward) {
        (Ok(sent), Ok(received)) => Ok((sent, received)),
        // A real failure says more than the deadline it triggered
        (Err(e), Err(other)) if is_timeout(&e) && !is_timeout(&other) => Err(other),
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    finished: &Notify,
    deadline: &Notify,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let expiry = async {
        deadline.notified().await;
        tokio::time::sleep(RELAY_DRAIN_TIMEOUT).await;
    };
    tokio::pin!(expiry);

    let result = tokio::select! {
        copied = tokio::io::copy(reader, writer) => copied,
        _ = &mut expiry => Err(io::Error::new(io::ErrorKind::TimedOut, "relay deadline exceeded")),
    };

    let _ = writer.shutdown().await;
    finished.notify_one();
    result
}

/// Whether a relay failure is the drain deadline firing
pub fn is_timeout(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}
