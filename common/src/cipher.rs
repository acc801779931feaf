//! Authenticated symmetric encryption for opaque payloads.
//!
//! Payloads are sealed with AES-256-GCM under a key derived from the OIDC
//! client secret (SHA-256 of the secret), so the key never has to be
//! distributed on its own. The wire form is `base64url(nonce || ciphertext || tag)`
//! without padding, which is safe to put in cookies and query strings.

use core::fmt;

use aes_gcm::{
    Aes256Gcm, KeyInit as _, Nonce,
    aead::Aead as _,
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest as _, Sha256};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Failure while sealing or opening a payload.
///
/// Opening fails closed: any corruption, truncation or key mismatch is an error,
/// a partially decoded value is never returned.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload could not be encrypted")]
    Encrypt,
    #[error("payload could not be decrypted")]
    Decrypt,
    #[error("payload is not valid base64url")]
    Encoding,
    #[error("payload is not the expected JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Symmetric cipher keyed from the client secret.
#[derive(Clone)]
pub struct Cipher {
    aead: Aes256Gcm,
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Derives the encryption key deterministically from `secret`.
    #[must_use]
    pub fn from_secret(secret: &SecretString) -> Self {
        let key = Sha256::digest(secret.expose_secret().as_bytes());
        Self {
            aead: Aes256Gcm::new(&key),
        }
    }

    /// Encrypts `plaintext` with a fresh random nonce, returned as the prefix of the output.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut nonce = [0_u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CodecError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts the output of [`Cipher::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CodecError::Decrypt);
        }
        let (nonce, ciphertext) = data.split_at_checked(NONCE_LEN).ok_or(CodecError::Decrypt)?;
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CodecError::Decrypt)
    }

    /// Serializes `value` as JSON, encrypts it and encodes the result as base64url.
    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<String, CodecError> {
        let payload = serde_json::to_vec(value)?;
        Ok(URL_SAFE_NO_PAD.encode(self.encrypt(&payload)?))
    }

    /// Reverses [`Cipher::seal_json`].
    pub fn open_json<T: DeserializeOwned>(&self, sealed: &str) -> Result<T, CodecError> {
        let raw = URL_SAFE_NO_PAD
            .decode(sealed)
            .map_err(|_| CodecError::Encoding)?;
        let plaintext = self.decrypt(&raw)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
