//! Control protocol spoken before a connection starts streaming
//!
//! Every PDU is a small binary header followed by a CBOR payload. Requests
//! carry a fresh correlation id which the matching response echoes.

mod exchange;
mod pdu;

pub use exchange::exchange;
pub use pdu::{
    read_pdu, write_pdu, Ack, Bind, Body, ControlId, ErrorPayload, Header, Inbounds,
    InboundsResp, Pdu, MIN_PDU_SIZE, PROTOCOL_VERSION,
};

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Control protocol errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("PDU too small: {0} bytes")]
    TooSmall(usize),

    #[error("PDU too large: {0} bytes")]
    TooLarge(usize),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown control id: {0:#04x}")]
    UnknownControlId(u8),

    #[error("Could not read PDU identifier")]
    InvalidIdentifier,

    #[error("CBOR payload: {0}")]
    Payload(String),

    #[error("{0} is not a request")]
    NotRequest(ControlId),

    #[error("invalid {0} response")]
    InvalidResponse(ControlId),

    /// Error PDU returned by the peer
    #[error("[{status}] {message}")]
    Status { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ControlError {
    /// Status carried by an Error PDU
    pub fn status(&self) -> Option<u16> {
        match self {
            ControlError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the peer refused the request itself, as opposed to failing
    pub fn is_rejection(&self) -> bool {
        matches!(self.status(), Some(400..=499))
    }
}

/// Malformed or unexpected PDU
pub const STATUS_BAD_REQUEST: u16 = 400;
/// Identifier or address not permitted
pub const STATUS_FORBIDDEN: u16 = 403;
/// No such outbound
pub const STATUS_NOT_FOUND: u16 = 404;
/// Required field left empty
pub const STATUS_UNPROCESSABLE: u16 = 422;
/// PDU could not be decoded
pub const STATUS_INTERNAL_ERROR: u16 = 500;

/// Token read plus all handshake round trips
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

const CORRELATION_ID_LEN: usize = 16;

/// Fresh correlation id: 16 random bytes in base58
pub fn generate_id() -> String {
    let raw: [u8; CORRELATION_ID_LEN] = rand::random();
    bs58::encode(raw).into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert_eq!(bs58::decode(&a).into_vec().unwrap().len(), CORRELATION_ID_LEN);
        assert!(!a.contains('\0'));
    }

    #[test]
    fn test_status_display() {
        let err = ControlError::Status {
            status: STATUS_FORBIDDEN,
            message: "rejected address".to_string(),
        };
        assert_eq!(err.to_string(), "[403] rejected address");
        assert!(err.is_rejection());

        let err = ControlError::Status {
            status: STATUS_INTERNAL_ERROR,
            message: "failed to receive control".to_string(),
        };
        assert!(!err.is_rejection());
        assert!(!ControlError::TooSmall(3).is_rejection());
    }
}
