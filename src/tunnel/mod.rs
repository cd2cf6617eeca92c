//! Tunnel layer - encrypted, multiplexed data plane
//!
//! Provides:
//! - Chunked AEAD framing over a raw connection
//! - Frame encoding/decoding for the multiplexer
//! - Stream multiplexing with per-stream flow control
//! - Client-role and server-role sessions relaying TCP connections

mod chunked;
mod frame;
mod multiplexer;
mod session;
mod stream;

pub use chunked::{ChunkedStream, MAX_PLAINTEXT_LEN, REKEY_MASK};
pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use multiplexer::{Multiplexer, MuxStream, Role};
pub use session::{ClientSession, ServerSession, Tunnel};
pub use stream::{StreamState, TunnelStream};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Too many streams")]
    TooManyStreams,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Flow control violation on stream {0}")]
    FlowControl(u32),

    #[error("Session closed")]
    SessionClosed,

    #[error("Session failed: {0}")]
    SessionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// Maximum number of concurrent streams per session
pub const MAX_STREAMS: usize = 1024;

/// Default window size for flow control (256 KB)
pub const DEFAULT_WINDOW_SIZE: u32 = 262144;

/// Streams waiting to be accepted before new ones are refused
pub const ACCEPT_BACKLOG: usize = 256;
