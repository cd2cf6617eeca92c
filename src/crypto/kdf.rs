//! Key Derivation Functions
//!
//! HKDF-SHA256 plus the anonymous identifier token. The client sends the
//! token in clear before the handshake; the server recognizes which
//! configured identifier produced it without the identifier ever being
//! transmitted.

use super::{random_bytes, CryptoError, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};
use subtle::ConstantTimeEq;

/// Length of the random salt heading a token
pub const SALT_LEN: usize = 16;

/// Length of a derived identifier token (salt followed by derived bytes)
pub const DERIVED_ID_LEN: usize = SALT_LEN + KEY_LEN;

const IDENTIFIER_INFO: &[u8] = b"seikan derived identifier";

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zeros)
    /// * `ikm` - Input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };

        Self {
            prk: salt.extract(ikm),
        }
    }

    /// Fill `output` with key material bound to `info`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyGeneration("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyGeneration("HKDF fill failed".to_string()))
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive a fresh identifier token from `secret`.
///
/// Every call draws a new salt, so two tokens for the same secret never
/// compare equal on the wire.
pub fn derive_identifier(secret: &str) -> Result<[u8; DERIVED_ID_LEN], CryptoError> {
    let mut token = [0u8; DERIVED_ID_LEN];
    let (salt, derived) = token.split_at_mut(SALT_LEN);

    random_bytes(salt)?;
    Hkdf::new(Some(salt), secret.as_bytes()).expand(IDENTIFIER_INFO, derived)?;

    Ok(token)
}

/// Check whether `token` was derived from `secret`.
///
/// Any malformed input is reported as a mismatch.
pub fn verify_identifier(token: &[u8], secret: &str) -> bool {
    if token.len() != DERIVED_ID_LEN {
        return false;
    }

    let (salt, expected) = token.split_at(SALT_LEN);
    let mut derived = [0u8; KEY_LEN];
    if Hkdf::new(Some(salt), secret.as_bytes())
        .expand(IDENTIFIER_INFO, &mut derived)
        .is_err()
    {
        return false;
    }

    derived[..].ct_eq(expected).into()
}
