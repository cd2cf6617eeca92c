//! Noise Protocol handshake implementation
//!
//! Uses the IK pattern:
//! - The initiator knows the responder's static key before the handshake
//! - The initiator's static key is sent encrypted in the first message
//! - The responder checks that key against the one it expects
//!
//! In seikan the server initiates, since it already knows which client it
//! is talking to from the derived identifier token.

use super::{Cipher, CipherKind, CryptoError, KeyPair, PublicKey, PROLOGUE};
use snow::params::NoiseParams;
use snow::Builder;
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Largest Noise message
const MAX_MESSAGE_LEN: usize = 65535;

/// Role in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Writes the first message and knows the peer's static key up front
    Initiator,
    /// Reads the first message and verifies the peer's static key afterwards
    Responder,
}

/// Handshake pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakePattern {
    #[default]
    IK,
}

/// Hash function used by the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashFunction {
    #[default]
    Blake2b,
    Blake2s,
}

/// AEAD used by the handshake and the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherFunction {
    #[default]
    ChaChaPoly,
    AesGcm,
}

impl fmt::Display for HandshakePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IK")
    }
}

impl fmt::Display for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashFunction::Blake2b => "BLAKE2b",
            HashFunction::Blake2s => "BLAKE2s",
        })
    }
}

impl fmt::Display for CipherFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CipherFunction::ChaChaPoly => "ChaChaPoly",
            CipherFunction::AesGcm => "AESGCM",
        })
    }
}

impl FromStr for HandshakePattern {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IK" => Ok(HandshakePattern::IK),
            _ => Err(unsupported("pattern", s)),
        }
    }
}

impl FromStr for HashFunction {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BLAKE2B" => Ok(HashFunction::Blake2b),
            "BLAKE2S" => Ok(HashFunction::Blake2s),
            _ => Err(unsupported("hash", s)),
        }
    }
}

impl FromStr for CipherFunction {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CHACHAPOLY" | "CHACHA20POLY1305" => Ok(CipherFunction::ChaChaPoly),
            "AESGCM" | "AES256GCM" => Ok(CipherFunction::AesGcm),
            _ => Err(unsupported("cipher", s)),
        }
    }
}

fn unsupported(kind: &'static str, name: &str) -> CryptoError {
    CryptoError::Unsupported {
        kind,
        name: name.to_string(),
    }
}

impl From<CipherFunction> for CipherKind {
    fn from(cipher: CipherFunction) -> Self {
        match cipher {
            CipherFunction::ChaChaPoly => CipherKind::ChaChaPoly,
            CipherFunction::AesGcm => CipherKind::AesGcm,
        }
    }
}

/// Everything needed to run one handshake
#[derive(Debug, Clone, Default)]
pub struct HandshakeOptions {
    pub pattern: HandshakePattern,
    pub hash: HashFunction,
    pub cipher: CipherFunction,
    /// Our static identity
    pub local: Option<KeyPair>,
    /// The static key the peer must present
    pub remote: Option<PublicKey>,
}

impl HandshakeOptions {
    /// Default suite with both identities filled in
    pub fn new(local: KeyPair, remote: PublicKey) -> Self {
        Self {
            local: Some(local),
            remote: Some(remote),
            ..Self::default()
        }
    }

    /// Check the options and build the Noise parameters they describe
    pub fn validate(&self) -> Result<NoiseParams, CryptoError> {
        if self.local.is_none() {
            return Err(CryptoError::MissingKey("local identity"));
        }
        if self.remote.is_none() {
            return Err(CryptoError::MissingKey("remote public key"));
        }

        let name = format!("Noise_{}_25519_{}_{}", self.pattern, self.cipher, self.hash);
        Ok(name.parse()?)
    }
}

/// Run a complete handshake over `stream`.
///
/// Messages are framed as a 2-byte big-endian length followed by the Noise
/// message. The stream is borrowed so the caller keeps ownership of the
/// connection whether the handshake succeeds or not.
pub async fn handshake<S>(
    stream: &mut S,
    options: &HandshakeOptions,
    role: HandshakeRole,
) -> Result<Cipher, CryptoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let params = options.validate()?;
    let (local, remote) = match (&options.local, &options.remote) {
        (Some(local), Some(remote)) => (local, remote),
        (None, _) => return Err(CryptoError::MissingKey("local identity")),
        (_, None) => return Err(CryptoError::MissingKey("remote public key")),
    };

    // IK: only the initiator holds the peer's static key before the first message
    let pre_peer_static = role == HandshakeRole::Initiator;

    let builder = Builder::new(params)
        .local_private_key(local.private.as_bytes())
        .prologue(PROLOGUE);
    let builder = if pre_peer_static {
        builder.remote_public_key(remote.as_bytes())
    } else {
        builder
    };

    let mut state = match role {
        HandshakeRole::Initiator => builder.build_initiator()?,
        HandshakeRole::Responder => builder.build_responder()?,
    };

    let mut message = vec![0u8; MAX_MESSAGE_LEN];
    let mut payload = vec![0u8; MAX_MESSAGE_LEN];
    let mut writing = role == HandshakeRole::Initiator;

    while !state.is_handshake_finished() {
        if writing {
            let len = state.write_message(&[], &mut message)?;
            let mut frame = Vec::with_capacity(2 + len);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
            frame.extend_from_slice(&message[..len]);
            stream.write_all(&frame).await?;
            stream.flush().await?;
            trace!(len, "Sent handshake message");
        } else {
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = u16::from_be_bytes(len_buf) as usize;
            stream.read_exact(&mut message[..len]).await?;
            state.read_message(&message[..len], &mut payload)?;
            trace!(len, "Received handshake message");
        }
        writing = !writing;
    }

    if !pre_peer_static {
        let peer = state.get_remote_static().ok_or(CryptoError::InvalidPeer)?;
        if !bool::from(peer.ct_eq(remote.as_bytes())) {
            return Err(CryptoError::InvalidPeer);
        }
    }

    let (initiator_key, responder_key) = state.dangerously_get_raw_split();
    let kind = CipherKind::from(options.cipher);
    match role {
        HandshakeRole::Initiator => Cipher::new(kind, &initiator_key, &responder_key),
        HandshakeRole::Responder => Cipher::new(kind, &responder_key, &initiator_key),
    }
}
