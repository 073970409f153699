//! # Hashing Utilities
//!
//! SHA-512 is the only digest that appears on the wire: node addresses,
//! packet hashes, Merkle nodes and the session id are all SHA-512 outputs.
//! BLAKE3 is used internally for key derivation (see [`super::pfs`]) and
//! never leaves the process.
//!
//! Both 64-byte identifiers travel as lowercase hex strings in JSON; the
//! [`hex64`] serde helper does that conversion for fixed arrays.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::config::HASH_LENGTH;

use super::keys::NodeAddress;

/// Compute the SHA-512 digest of `data`.
///
/// # Example
///
/// ```
/// use autoroute::crypto::sha512;
///
/// let digest = sha512(b"autoroute");
/// assert_eq!(digest.len(), 64);
/// ```
pub fn sha512(data: &[u8]) -> [u8; HASH_LENGTH] {
    sha512_multi(&[data])
}

/// SHA-512 over several slices fed in order, without concatenating them.
pub fn sha512_multi(parts: &[&[u8]]) -> [u8; HASH_LENGTH] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; HASH_LENGTH];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Serde adapter: `[u8; 64]` <-> lowercase hex string.
pub(crate) mod hex64 {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    use crate::config::HASH_LENGTH;

    pub fn serialize<S: Serializer>(bytes: &[u8; HASH_LENGTH], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; HASH_LENGTH], D::Error> {
        let text = String::deserialize(d)?;
        super::decode_hex64(&text).ok_or_else(|| D::Error::custom("expected 64 hex-encoded bytes"))
    }
}

/// Serde adapter: `Vec<u8>` <-> lowercase hex string.
pub(crate) mod hex_bytes {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(D::Error::custom)
    }
}

/// Decode exactly 64 bytes of hex. `None` on bad hex or wrong length.
pub(crate) fn decode_hex64(text: &str) -> Option<[u8; HASH_LENGTH]> {
    let bytes = hex::decode(text).ok()?;
    if bytes.len() != HASH_LENGTH {
        return None;
    }
    let mut out = [0u8; HASH_LENGTH];
    out.copy_from_slice(&bytes);
    Some(out)
}

// ---------------------------------------------------------------------------
// PacketHash
// ---------------------------------------------------------------------------

/// Identity of a packet: `SHA-512(dest ‖ data)`.
///
/// The amount is deliberately left out, so a packet keeps its identity if
/// a relay re-prices it. This is the join key between the routing handler,
/// the receipt handler and the ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketHash(#[serde(with = "hex64")] [u8; HASH_LENGTH]);

impl PacketHash {
    /// Hash a destination and payload.
    pub fn compute(dest: &NodeAddress, data: &[u8]) -> Self {
        Self(sha512_multi(&[dest.as_bytes(), data]))
    }

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

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PacketHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PacketHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketHash({}…)", &self.to_hex()[..16])
    }
}
