//! Symmetric payload encryption.
//!
//! Payloads may be sealed with a symmetric key before they are framed, so the length header
//! always describes the bytes actually on the wire. The key used for a connection is its own
//! override when one is set, otherwise the server-wide default. An empty key means the payload
//! travels in the clear.
//!
//! [`Cipher`] is the seam; [`XChaCha`] (XChaCha20-Poly1305 with a random 24-byte nonce
//! prepended to the ciphertext) is the implementation used unless another one is configured.
use std::{borrow::Cow, fmt::Debug};

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use thiserror::Error;

/// Key size expected by [`XChaCha`].
pub const KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 24;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("invalid key length {0}")]
    InvalidKey(usize),
    #[error("failed to encrypt payload")]
    Encrypt,
    #[error("ciphertext is corrupt or sealed with a different key")]
    Decrypt,
}

/// Encrypt/decrypt service applied to payloads above the frame boundary.
pub trait Cipher: Send + Sync + Debug {
    fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError>;

    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Whether `key` can be used with this cipher.
    fn validate_key(&self, _key: &[u8]) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct XChaCha;

impl Cipher for XChaCha {
    fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
        let aead =
            XChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::InvalidKey(key.len()))?;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = aead
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
        let aead =
            XChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::InvalidKey(key.len()))?;

        if ciphertext.len() < NONCE_SIZE {
            return Err(CipherError::Decrypt);
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);

        aead.decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Decrypt)
    }

    fn validate_key(&self, key: &[u8]) -> bool {
        validate_key(key)
    }
}

/// Generates a random key suitable for [`XChaCha`].
pub fn generate_key() -> Vec<u8> {
    let mut key = vec![0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

pub fn validate_key(key: &[u8]) -> bool {
    key.len() == KEY_SIZE
}

/// Encrypts `payload` with `key`, or passes it through untouched when the key is empty.
pub fn seal<'a>(
    cipher: &dyn Cipher,
    key: &[u8],
    payload: &'a [u8],
) -> Result<Cow<'a, [u8]>, CipherError> {
    if key.is_empty() {
        Ok(Cow::Borrowed(payload))
    } else {
        cipher.encrypt(payload, key).map(Cow::Owned)
    }
}

/// Inverse of [`seal`].
pub fn open(cipher: &dyn Cipher, key: &[u8], data: Vec<u8>) -> Result<Vec<u8>, CipherError> {
    if key.is_empty() {
        Ok(data)
    } else {
        cipher.decrypt(&data, key)
    }
}
