//! # Key Management
//!
//! ECDSA over NIST P-521 key pairs and the node address derived from them.
//!
//! A node's identity is its public key; its *address* is the SHA-512 hash
//! of the key's canonical text form:
//!
//! ```text
//! "ecdsa:P521:" + decimal(X) + "," + decimal(Y)
//! ```
//!
//! where X and Y are the affine coordinates printed in base 10. The address
//! is self-certifying: anyone holding the public key can recompute it, and
//! nobody can claim an address without the matching private key.
//!
//! Key bytes are never logged. Loading and persisting key files is the
//! caller's business; this module only converts to and from raw bytes.

use std::fmt;
use std::hash::{Hash, Hasher};

use p521::ecdsa::signature::{Signer, Verifier};
use p521::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::config::{HASH_LENGTH, PUBLIC_KEY_TEXT_PREFIX};

use super::hash::{decode_hex64, hex64, sha512};
use super::signatures::Signature;

/// Errors from key parsing.
///
/// Kept vague on purpose; "which byte was wrong" is nobody's business.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid private key bytes")]
    InvalidPrivateKey,

    #[error("invalid public key bytes: not a P-521 curve point")]
    InvalidPublicKey,
}

// ---------------------------------------------------------------------------
// NodeAddress
// ---------------------------------------------------------------------------

/// SHA-512 of a public key's canonical text. Hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(#[serde(with = "hex64")] [u8; HASH_LENGTH]);

impl NodeAddress {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse a hex string. `None` unless it decodes to exactly 64 bytes.
    pub fn from_hex(text: &str) -> Option<Self> {
        decode_hex64(text).map(Self)
    }

    /// The raw digest.
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    /// Lowercase hex encoding, as used in status documents and logs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({}…)", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// PublicKey
// ---------------------------------------------------------------------------

/// The public half of a node identity. Serialized as hex of the
/// uncompressed SEC1 point.
#[derive(Clone)]
pub struct PublicKey {
    key: VerifyingKey,
}

impl PublicKey {
    /// Parse SEC1-encoded point bytes (compressed or not).
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let key = VerifyingKey::from_sec1_bytes(bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { key })
    }

    /// Uncompressed SEC1 encoding (`0x04 ‖ X ‖ Y`).
    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        self.key.to_encoded_point(false).as_bytes().to_vec()
    }

    /// Canonical text form: `ecdsa:P521:<X base 10>,<Y base 10>`.
    pub fn canonical_text(&self) -> String {
        let point = self.key.to_encoded_point(false);
        // Uncompressed encodings always carry both coordinates.
        let x = point.x().map(|x| decimal_string(x)).unwrap_or_default();
        let y = point.y().map(|y| decimal_string(y)).unwrap_or_default();
        format!("{PUBLIC_KEY_TEXT_PREFIX}{x},{y}")
    }

    /// The node address this key owns.
    pub fn address(&self) -> NodeAddress {
        NodeAddress(sha512(self.canonical_text().as_bytes()))
    }

    /// Check a raw `r ‖ s` signature over `message`.
    pub(crate) fn verify_raw(&self, message: &[u8], signature_bytes: &[u8]) -> bool {
        match EcdsaSignature::from_slice(signature_bytes) {
            Ok(sig) => self.key.verify(message, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_sec1_bytes() == other.to_sec1_bytes()
    }
}

impl Eq for PublicKey {}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_sec1_bytes().hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.address()).finish()
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.to_sec1_bytes()))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        let bytes = hex::decode(text).map_err(D::Error::custom)?;
        Self::from_sec1_bytes(&bytes).map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// PrivateKey
// ---------------------------------------------------------------------------

/// A node's signing key.
///
/// Deliberately neither `Clone` nor `Serialize`: share it behind an `Arc`,
/// and export it only through [`PrivateKey::to_hex`] when you mean to.
pub struct PrivateKey {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl PrivateKey {
    /// Generate a fresh key from the OS RNG.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Load a key from its 66-byte big-endian scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let signing_key = SigningKey::from_slice(bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// Load a key from hex. Convenient for devnets and CLI flags.
    pub fn from_hex(text: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(text.trim()).map_err(|_| KeyError::InvalidPrivateKey)?;
        Self::from_bytes(&bytes)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = PublicKey {
            key: VerifyingKey::from(&signing_key),
        };
        Self {
            signing_key,
            public_key,
        }
    }

    /// Export the raw scalar. Handle with care.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    /// Export the raw scalar as hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// The matching public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Shorthand for `public_key().address()`.
    pub fn address(&self) -> NodeAddress {
        self.public_key.address()
    }

    /// Sign `message`. The result carries the key and the message, so it
    /// verifies on its own.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig: EcdsaSignature = self.signing_key.sign(message);
        let (r, s) = sig.split_bytes();
        Signature {
            r: r.to_vec(),
            s: s.to_vec(),
            key: Some(self.public_key.clone()),
            message: message.to_vec(),
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Base-10 rendering of a big-endian unsigned integer.
///
/// Works on 10^9 limbs so a 66-byte coordinate takes a few hundred
/// multiply-adds.
fn decimal_string(be_bytes: &[u8]) -> String {
    const LIMB: u64 = 1_000_000_000;

    let mut limbs: Vec<u64> = vec![0];
    for &byte in be_bytes {
        let mut carry = byte as u64;
        for limb in limbs.iter_mut() {
            let value = *limb * 256 + carry;
            *limb = value % LIMB;
            carry = value / LIMB;
        }
        while carry > 0 {
            limbs.push(carry % LIMB);
            carry /= LIMB;
        }
    }

    let mut iter = limbs.iter().rev();
    let mut out = iter.next().map(|l| l.to_string()).unwrap_or_default();
    for limb in iter {
        out.push_str(&format!("{limb:09}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_string() {
        assert_eq!(decimal_string(&[]), "0");
        assert_eq!(decimal_string(&[0, 0, 0]), "0");
        assert_eq!(decimal_string(&[0x01, 0x00]), "256");
        assert_eq!(decimal_string(&[0xff; 8]), u64::MAX.to_string());
        assert_eq!(
            decimal_string(&[0x01, 0, 0, 0, 0, 0, 0, 0, 0]),
            "18446744073709551616"
        );
    }

    #[test]
    fn test_address_is_hash_of_canonical_text() {
        let key = PrivateKey::generate();
        let text = key.public_key().canonical_text();
        assert!(text.starts_with("ecdsa:P521:"));
        assert_eq!(text.matches(',').count(), 1);
        assert_eq!(key.address().as_bytes(), &sha512(text.as_bytes()));
    }

    #[test]
    fn test_distinct_keys_distinct_addresses() {
        let a = PrivateKey::generate();
        let b = PrivateKey::generate();
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn test_private_key_hex_roundtrip() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(restored.address(), key.address());
        assert!(PrivateKey::from_hex("not hex").is_err());
        assert!(PrivateKey::from_bytes(&[0u8; 66]).is_err());
    }

    #[test]
    fn test_public_key_serde_roundtrip() {
        let key = PrivateKey::generate();
        let json = serde_json::to_string(key.public_key()).unwrap();
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, key.public_key());
        assert_eq!(back.address(), key.address());
    }

    #[test]
    fn test_public_key_rejects_garbage() {
        assert!(PublicKey::from_sec1_bytes(&[4u8; 133]).is_err());
        assert!(serde_json::from_str::<PublicKey>("\"0102\"").is_err());
    }

    #[test]
    fn test_node_address_hex() {
        let addr = PrivateKey::generate().address();
        assert_eq!(NodeAddress::from_hex(&addr.to_hex()), Some(addr));
        assert_eq!(addr.to_hex().len(), 128);
    }
}
