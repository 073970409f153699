//! # Frame Encryption
//!
//! Every frame on a peer session is sealed with AES-256-GCM under the
//! session key negotiated in [`super::pfs`].
//!
//! ## Wire format
//!
//! A sealed frame is `nonce ‖ ciphertext ‖ tag`: a fresh random 96-bit
//! nonce followed by the GCM output. The session id is bound in as
//! associated data, so a frame lifted from one session will not open in
//! another even if the keys somehow matched.
//!
//! Random nonces give a birthday bound of ~2^48 frames per key. Sessions
//! are per-connection and re-keyed on every reconnect, so we never get
//! anywhere near it.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use thiserror::Error;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH};

/// GCM authentication tag length.
const TAG_LENGTH: usize = 16;

/// Errors from sealing or opening a frame.
///
/// "Wrong key" and "tampered frame" are the same error on purpose.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key or corrupted frame")]
    DecryptFailed,

    #[error("frame too short: must be at least {} bytes", AES_NONCE_LENGTH + TAG_LENGTH)]
    FrameTooShort,
}

/// Seals and opens frames for one session.
///
/// Holds the expanded AES key schedule so it isn't rebuilt per frame.
#[derive(Clone)]
pub struct FrameCipher {
    cipher: Aes256Gcm,
    aad: Vec<u8>,
}

impl FrameCipher {
    /// Build a cipher from a session key, binding `aad` into every frame.
    pub fn new(key: &[u8; AES_KEY_LENGTH], aad: &[u8]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            aad: aad.to_vec(),
        }
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    ///
    /// # Example
    ///
    /// ```
    /// use autoroute::crypto::FrameCipher;
    ///
    /// let cipher = FrameCipher::new(&[7u8; 32], b"session");
    /// let sealed = cipher.seal(b"hello").unwrap();
    /// assert_eq!(cipher.open(&sealed).unwrap(), b"hello");
    /// ```
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &self.aad,
                },
            )
            .map_err(|_| EncryptionError::EncryptFailed)?;

        let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a frame produced by [`FrameCipher::seal`].
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if frame.len() < AES_NONCE_LENGTH + TAG_LENGTH {
            return Err(EncryptionError::FrameTooShort);
        }
        let (nonce_bytes, ciphertext) = frame.split_at(AES_NONCE_LENGTH);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &self.aad,
                },
            )
            .map_err(|_| EncryptionError::DecryptFailed)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher").finish_non_exhaustive()
    }
}
