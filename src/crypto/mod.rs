//! Cryptographic primitives for seikan
//!
//! This module provides:
//! - X25519 identities with a base58 text form
//! - The anonymous identifier token sent before the handshake
//! - Noise IK handshake producing two directional cipher states
//! - Directional AEAD states with Noise-style rekeying

mod aead;
mod handshake;
mod kdf;
mod keys;

pub use aead::{Cipher, CipherKind, CipherState};
pub use handshake::{
    handshake, CipherFunction, HandshakeOptions, HandshakePattern, HandshakeRole, HashFunction,
};
pub use kdf::{derive_identifier, verify_identifier, Hkdf, DERIVED_ID_LEN, SALT_LEN};
pub use keys::{KeyPair, PrivateKey, PublicKey};

use thiserror::Error;

/// Label mixed into every handshake transcript
pub const PROLOGUE: &[u8] = b"seikan/1.0";

/// Length of symmetric and X25519 keys in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Unsupported {kind}: {name}")]
    Unsupported { kind: &'static str, name: String },

    #[error("Missing {0}")]
    MissingKey(&'static str),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("invalid peer")]
    InvalidPeer,

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed")]
    Decryption,

    #[error("Nonce exhausted")]
    NonceExhausted,

    #[error("Random generator failure")]
    Random,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new().fill(buf).map_err(|_| CryptoError::Random)
}
