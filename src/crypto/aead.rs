//! Directional AEAD cipher states
//!
//! The handshake hands over two raw keys, one per direction. Each key drives
//! its own [`CipherState`] with a private nonce counter, so the two
//! directions can be rekeyed independently and moved into separate halves
//! of a connection.

use super::{CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};

/// AEAD algorithm negotiated for the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    ChaChaPoly,
    AesGcm,
}

impl CipherKind {
    fn algorithm(self) -> &'static ring::aead::Algorithm {
        match self {
            CipherKind::ChaChaPoly => &CHACHA20_POLY1305,
            CipherKind::AesGcm => &AES_256_GCM,
        }
    }

    /// Noise nonce layout: 32 zero bits followed by the 64-bit counter,
    /// little-endian for ChaChaPoly and big-endian for AESGCM.
    fn nonce(self, counter: u64) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        match self {
            CipherKind::ChaChaPoly => nonce[4..].copy_from_slice(&counter.to_le_bytes()),
            CipherKind::AesGcm => nonce[4..].copy_from_slice(&counter.to_be_bytes()),
        }
        nonce
    }
}

/// One direction of an established transport
pub struct CipherState {
    kind: CipherKind,
    key: LessSafeKey,
    nonce_counter: u64,
}

impl CipherState {
    /// Create a cipher state from a 32-byte key
    pub fn new(kind: CipherKind, key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        Ok(Self {
            kind,
            key: bind_key(kind, key)?,
            nonce_counter: 0,
        })
    }

    /// Encrypt `in_out` in place and return the authentication tag
    pub fn seal(&mut self, in_out: &mut [u8]) -> Result<[u8; TAG_LEN], CryptoError> {
        let nonce = self.next_nonce()?;
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::empty(), in_out)
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(tag.as_ref());
        Ok(out)
    }

    /// Decrypt `in_out` (ciphertext followed by tag) in place.
    ///
    /// Returns the plaintext prefix of the buffer.
    pub fn open<'a>(&mut self, in_out: &'a mut [u8]) -> Result<&'a mut [u8], CryptoError> {
        let nonce = self.next_nonce()?;
        self.key
            .open_in_place(nonce, Aad::empty(), in_out)
            .map_err(|_| CryptoError::Decryption)
    }

    /// Replace the key with `ENCRYPT(k, 2^64-1, "", zeros)[..32]`.
    ///
    /// The nonce counter carries over unchanged.
    pub fn rekey(&mut self) -> Result<(), CryptoError> {
        let mut key = [0u8; KEY_LEN];
        let nonce = Nonce::assume_unique_for_key(self.kind.nonce(u64::MAX));
        self.key
            .seal_in_place_separate_tag(nonce, Aad::empty(), &mut key)
            .map_err(|_| CryptoError::Encryption)?;

        self.key = bind_key(self.kind, &key)?;
        Ok(())
    }

    /// Get current nonce counter value
    pub fn nonce_counter(&self) -> u64 {
        self.nonce_counter
    }

    fn next_nonce(&mut self) -> Result<Nonce, CryptoError> {
        // 2^64-1 is reserved for rekeying
        if self.nonce_counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let nonce = self.kind.nonce(self.nonce_counter);
        self.nonce_counter += 1;
        Ok(Nonce::assume_unique_for_key(nonce))
    }
}

fn bind_key(kind: CipherKind, key: &[u8; KEY_LEN]) -> Result<LessSafeKey, CryptoError> {
    let unbound =
        UnboundKey::new(kind.algorithm(), key).map_err(|_| CryptoError::InvalidKeyLength)?;
    Ok(LessSafeKey::new(unbound))
}

/// The pair of directional states produced by a completed handshake
pub struct Cipher {
    pub send: CipherState,
    pub recv: CipherState,
}

impl Cipher {
    /// Create a cipher from the raw send and receive keys
    pub fn new(
        kind: CipherKind,
        send_key: &[u8; KEY_LEN],
        recv_key: &[u8; KEY_LEN],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            send: CipherState::new(kind, send_key)?,
            recv: CipherState::new(kind, recv_key)?,
        })
    }

    /// Seal `plaintext` with the send state, returning ciphertext and tag
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = plaintext.to_vec();
        let tag = self.send.seal(&mut buffer)?;
        buffer.extend_from_slice(&tag);
        Ok(buffer)
    }

    /// Open a message sealed by the peer's send state
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = ciphertext.to_vec();
        let len = self.recv.open(&mut buffer)?.len();
        buffer.truncate(len);
        Ok(buffer)
    }

    /// Split into the send and receive states
    pub fn into_parts(self) -> (CipherState, CipherState) {
        (self.send, self.recv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(kind: CipherKind) -> (Cipher, Cipher) {
        let a = [0x42u8; KEY_LEN];
        let b = [0x24u8; KEY_LEN];
        (
            Cipher::new(kind, &a, &b).unwrap(),
            Cipher::new(kind, &b, &a).unwrap(),
        )
    }

    #[test]
    fn test_cipher_encrypt_decrypt() {
        for kind in [CipherKind::ChaChaPoly, CipherKind::AesGcm] {
            let (mut alice, mut bob) = pair(kind);

            let ciphertext = alice.encrypt(b"Hello, World!").unwrap();
            assert_eq!(ciphertext.len(), 13 + TAG_LEN);
            assert_eq!(bob.decrypt(&ciphertext).unwrap(), b"Hello, World!");

            let reply = bob.encrypt(b"Hi").unwrap();
            assert_eq!(alice.decrypt(&reply).unwrap(), b"Hi");
        }
    }

    #[test]
    fn test_nonce_advances() {
        let (mut alice, mut bob) = pair(CipherKind::ChaChaPoly);

        let first = alice.encrypt(b"same").unwrap();
        let second = alice.encrypt(b"same").unwrap();
        assert_ne!(first, second);
        assert_eq!(alice.send.nonce_counter(), 2);

        // Out of order delivery fails
        assert!(bob.decrypt(&second).is_err());
    }

    #[test]
    fn test_tamper_detection() {
        let (mut alice, mut bob) = pair(CipherKind::ChaChaPoly);

        let mut ciphertext = alice.encrypt(b"Hello, World!").unwrap();
        ciphertext[0] ^= 0xFF;

        assert!(bob.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_rekey_is_directional() {
        let (mut alice, mut bob) = pair(CipherKind::AesGcm);

        alice.send.rekey().unwrap();
        bob.recv.rekey().unwrap();
        let ciphertext = alice.encrypt(b"after rekey").unwrap();
        assert_eq!(bob.decrypt(&ciphertext).unwrap(), b"after rekey");

        // The other direction still uses the original key
        let reply = bob.encrypt(b"untouched").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"untouched");

        // A one-sided rekey breaks the direction
        alice.send.rekey().unwrap();
        let ciphertext = alice.encrypt(b"lost").unwrap();
        assert!(bob.decrypt(&ciphertext).is_err());
    }
}
