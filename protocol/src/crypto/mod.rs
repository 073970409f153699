//! # Cryptographic Primitives for AutoRoute
//!
//! Everything security-related in the router flows through here:
//!
//! - **ECDSA P-521** for node identity and receipt signatures.
//! - **SHA-512** for addresses, packet hashes and Merkle nodes.
//! - **X25519 + BLAKE3** for per-session key agreement.
//! - **AES-256-GCM** for sealing session frames.
//!
//! None of it is home-grown. These are thin typed wrappers around the
//! RustCrypto and dalek implementations.

pub mod encryption;
pub mod hash;
pub mod keys;
pub mod pfs;
pub mod signatures;

pub use encryption::{EncryptionError, FrameCipher};
pub use hash::{sha512, sha512_multi, PacketHash};
pub use keys::{KeyError, NodeAddress, PrivateKey, PublicKey};
pub use pfs::{EphemeralExchange, Role, SessionSecrets};
pub use signatures::{sign, verify, Signature, SignatureError};
