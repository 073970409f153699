//! # Digital Signatures
//!
//! A [`Signature`] is self-contained: it carries `r`, `s`, the signer's
//! public key and the signed message. Receipts and the identify handshake
//! ship it as-is, and the receiver checks it without any side lookup.
//!
//! Verification fails unless all four parts are present and the key is a
//! valid P-521 point. A missing field is not "probably fine", it's a
//! forged or truncated message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::P521_FIELD_LENGTH;

use super::hash::hex_bytes;
use super::keys::{NodeAddress, PrivateKey, PublicKey};

/// Why a signature was rejected. Every variant means "invalid signature".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid signature: missing {0}")]
    Missing(&'static str),

    #[error("invalid signature: malformed {0}")]
    Malformed(&'static str),

    #[error("invalid signature: verification failed")]
    Invalid,
}

/// An ECDSA P-521 signature bundled with its key and message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Big-endian `r` scalar.
    #[serde(default, with = "hex_bytes")]
    pub r: Vec<u8>,
    /// Big-endian `s` scalar.
    #[serde(default, with = "hex_bytes")]
    pub s: Vec<u8>,
    /// Signer's public key.
    #[serde(default)]
    pub key: Option<PublicKey>,
    /// The exact bytes that were signed.
    #[serde(default, with = "hex_bytes")]
    pub message: Vec<u8>,
}

impl Signature {
    /// Check the signature against its own key and message.
    pub fn verify(&self) -> Result<(), SignatureError> {
        let key = self.key.as_ref().ok_or(SignatureError::Missing("key"))?;
        if self.r.is_empty() {
            return Err(SignatureError::Missing("r"));
        }
        if self.s.is_empty() {
            return Err(SignatureError::Missing("s"));
        }
        if self.message.is_empty() {
            return Err(SignatureError::Missing("message"));
        }
        if self.r.len() != P521_FIELD_LENGTH {
            return Err(SignatureError::Malformed("r"));
        }
        if self.s.len() != P521_FIELD_LENGTH {
            return Err(SignatureError::Malformed("s"));
        }

        let mut raw = Vec::with_capacity(2 * P521_FIELD_LENGTH);
        raw.extend_from_slice(&self.r);
        raw.extend_from_slice(&self.s);

        if key.verify_raw(&self.message, &raw) {
            Ok(())
        } else {
            Err(SignatureError::Invalid)
        }
    }

    /// Address of the signing key, if the key is present.
    pub fn signer(&self) -> Option<NodeAddress> {
        self.key.as_ref().map(PublicKey::address)
    }
}

/// Sign `message` with `key`.
///
/// # Example
///
/// ```
/// use autoroute::crypto::{sign, PrivateKey};
///
/// let key = PrivateKey::generate();
/// let sig = sign(&key, b"route me");
/// assert!(sig.verify().is_ok());
/// ```
pub fn sign(key: &PrivateKey, message: &[u8]) -> Signature {
    key.sign(message)
}

/// Verify a standalone signature. `true` iff [`Signature::verify`] is `Ok`.
pub fn verify(signature: &Signature) -> bool {
    signature.verify().is_ok()
}
