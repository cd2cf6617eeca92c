//! Key management for seikan identities
//!
//! Keys travel in configuration files as base58 text with a short prefix so
//! that a secret can never be mistaken for a public key.

use super::{CryptoError, KEY_LEN};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

/// Text prefix of an encoded private key
pub const PRIVATE_PREFIX: &str = "sk-";

/// Text prefix of an encoded public key
pub const PUBLIC_PREFIX: &str = "pk-";

/// X25519 key pair used as a static Noise identity
#[derive(Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Result<Self, CryptoError> {
        let params = "Noise_IK_25519_ChaChaPoly_BLAKE2b"
            .parse()
            .map_err(|e: snow::Error| CryptoError::KeyGeneration(e.to_string()))?;
        let keypair = snow::Builder::new(params)
            .generate_keypair()
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        Ok(Self {
            public: PublicKey::from_bytes(&keypair.public)?,
            private: PrivateKey::from_bytes(&keypair.private)?,
        })
    }

    /// Build a key pair from a private key, deriving the public half
    pub fn from_private(private: PrivateKey) -> Self {
        let secret = x25519_dalek::StaticSecret::from(private.0);
        let public = x25519_dalek::PublicKey::from(&secret);

        Self {
            public: PublicKey(public.to_bytes()),
            private,
        }
    }

    /// Parse a key pair from its text form.
    ///
    /// `public` is optional; when given it must match the key derived from
    /// `secret`.
    pub fn from_text(secret: &str, public: Option<&str>) -> Result<Self, CryptoError> {
        let keypair = Self::from_private(secret.parse()?);

        if let Some(public) = public.filter(|p| !p.is_empty()) {
            let configured: PublicKey = public.parse()?;
            if configured != keypair.public {
                return Err(CryptoError::InvalidKey(
                    "public key does not match secret".to_string(),
                ));
            }
        }

        Ok(keypair)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("private", &self.private)
            .finish()
    }
}

/// X25519 public key
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; KEY_LEN]);

impl PublicKey {
    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self(to_array(bytes)?))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encode as `pk-<base58>`
    pub fn to_text(&self) -> String {
        format!("{}{}", PUBLIC_PREFIX, bs58::encode(&self.0).into_string())
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = decode_text(s, PUBLIC_PREFIX)?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.to_text();
        write!(f, "PublicKey({}...)", &text[..text.len().min(11)])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// X25519 private key (kept secret)
#[derive(Clone)]
pub struct PrivateKey(pub [u8; KEY_LEN]);

impl PrivateKey {
    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self(to_array(bytes)?))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encode as `sk-<base58>` (be careful with this!)
    pub fn to_text(&self) -> String {
        format!("{}{}", PRIVATE_PREFIX, bs58::encode(&self.0).into_string())
    }
}

impl FromStr for PrivateKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = decode_text(s, PRIVATE_PREFIX)?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

fn decode_text(s: &str, prefix: &str) -> Result<Vec<u8>, CryptoError> {
    let s = s.trim();
    let encoded = s.strip_prefix(prefix).unwrap_or(s);
    bs58::decode(encoded)
        .into_vec()
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

fn to_array(bytes: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = KeyPair::generate().unwrap();
        assert_eq!(kp.public.as_bytes().len(), KEY_LEN);
        assert_ne!(kp.private.as_bytes(), &[0u8; KEY_LEN]);
    }

    #[test]
    fn test_public_key_derivation_matches_generator() {
        let kp = KeyPair::generate().unwrap();
        let derived = KeyPair::from_private(kp.private.clone());
        assert_eq!(derived.public, kp.public);
    }

    #[test]
    fn test_text_encoding() {
        let kp = KeyPair::generate().unwrap();

        let public = kp.public.to_text();
        let private = kp.private.to_text();
        assert!(public.starts_with("pk-"));
        assert!(private.starts_with("sk-"));

        assert_eq!(public.parse::<PublicKey>().unwrap(), kp.public);
        assert_eq!(
            private.parse::<PrivateKey>().unwrap().as_bytes(),
            kp.private.as_bytes()
        );
    }

    #[test]
    fn test_from_text_checks_public_half() {
        let kp = KeyPair::generate().unwrap();
        let other = KeyPair::generate().unwrap();

        let private = kp.private.to_text();
        assert!(KeyPair::from_text(&private, Some(&kp.public.to_text())).is_ok());
        assert!(KeyPair::from_text(&private, None).is_ok());
        assert!(KeyPair::from_text(&private, Some(&other.public.to_text())).is_err());
    }

    #[test]
    fn test_rejects_wrong_length() {
        let short = format!("pk-{}", bs58::encode([1u8; 16]).into_string());
        assert!(matches!(
            short.parse::<PublicKey>(),
            Err(CryptoError::InvalidKeyLength)
        ));
        assert!("pk-0OIl".parse::<PublicKey>().is_err());
    }
}
