//! # Ephemeral Key Exchange
//!
//! Each peer session starts with a fresh X25519 exchange. Long-term P-521
//! keys never encrypt anything; they only sign the session id during the
//! identify step, which binds "who you are" to "this particular session".
//!
//! ## Roles
//!
//! The handshake is asymmetric only in naming: the side that opened the
//! TCP connection is the *dialer*, the other the *listener*. Both derive:
//!
//! ```text
//! session_key = BLAKE3-derive-key(ctx, dh ‖ dialer_eph ‖ listener_eph)
//! session_id  = SHA-512(dialer_eph ‖ listener_eph ‖ "autoroute-session")
//! ```
//!
//! The session id is public. It is what each side signs to prove key
//! ownership, and it doubles as AEAD associated data for every frame.

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::config::{AES_KEY_LENGTH, HASH_LENGTH, SESSION_ID_TAG, SESSION_KDF_CONTEXT};

use super::hash::sha512_multi;

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Listener,
}

/// One side of an in-progress exchange. Consumed by [`EphemeralExchange::complete`].
pub struct EphemeralExchange {
    secret: EphemeralSecret,
    public_key: PublicKey,
    role: Role,
}

/// Output of a finished exchange.
#[derive(Debug)]
pub struct SessionSecrets {
    /// AES-256-GCM key for this session.
    pub key: [u8; AES_KEY_LENGTH],
    /// Public transcript hash.
    pub id: [u8; HASH_LENGTH],
}

impl EphemeralExchange {
    /// Generate a fresh ephemeral keypair.
    pub fn new(role: Role) -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret);
        Self {
            secret,
            public_key,
            role,
        }
    }

    /// Our ephemeral public key, to go in the preamble.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key.to_bytes()
    }

    /// Finish the exchange with the peer's ephemeral key.
    pub fn complete(self, peer_public: &[u8; 32]) -> SessionSecrets {
        let ours = self.public_key.to_bytes();
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));

        let (dialer, listener) = match self.role {
            Role::Dialer => (&ours, peer_public),
            Role::Listener => (peer_public, &ours),
        };

        SessionSecrets {
            key: derive_session_key(shared.as_bytes(), dialer, listener),
            id: session_id(dialer, listener),
        }
    }
}

fn derive_session_key(
    shared: &[u8; 32],
    dialer: &[u8; 32],
    listener: &[u8; 32],
) -> [u8; AES_KEY_LENGTH] {
    let mut hasher = blake3::Hasher::new_derive_key(SESSION_KDF_CONTEXT);
    hasher.update(shared);
    hasher.update(dialer);
    hasher.update(listener);

    let mut key = [0u8; AES_KEY_LENGTH];
    hasher.finalize_xof().fill(&mut key);
    key
}

/// Transcript hash both sides sign during identify.
pub fn session_id(dialer: &[u8; 32], listener: &[u8; 32]) -> [u8; HASH_LENGTH] {
    sha512_multi(&[dialer, listener, SESSION_ID_TAG])
}
