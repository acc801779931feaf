//! Payloads the gateway hands to browsers and reads back.
//!
//! - [`Credential`]: the session, sealed into the `authgate-sso` cookie.
//! - [`CsrfState`]: the OIDC `state` value, sealed, consumed once by the callback.
//! - [`SignedRedirect`]: the login link the filter hands out, signed but readable.

use core::{fmt, time::Duration};

use authgate_common::{
    Cipher, CodecError, generate_token, is_timestamp_in_window, sign_hmac, unix_time_seconds,
    verify_hmac,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::oidc::payload_segment;

const NONCE_LEN: usize = 32;
// RFC 7636 allows 43 to 128 characters.
const PKCE_VERIFIER_LEN: usize = 64;

/// The session: an ID token plus the refresh token to renew it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Credential {
    pub id_token: String,
    /// Empty when the provider did not issue one; such sessions cannot be refreshed.
    #[serde(default)]
    pub refresh_token: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id_token_len", &self.id_token.len())
            .field("has_refresh_token", &!self.refresh_token.is_empty())
            .finish()
    }
}

impl Credential {
    pub(crate) fn seal(&self, cipher: &Cipher) -> Result<String, CodecError> {
        cipher.seal_json(self)
    }

    pub(crate) fn open(sealed: &str, cipher: &Cipher) -> Result<Self, CodecError> {
        cipher.open_json(sealed)
    }

    /// The ID token's claims segment, still base64url encoded.
    pub(crate) fn userinfo(&self) -> Option<&str> {
        payload_segment(&self.id_token)
    }
}

/// OIDC `state`: binds the callback to the login that started it.
///
/// The nonce doubles as the OIDC nonce, so the returned ID token is bound to it too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CsrfState {
    pub nonce: String,
    pub original_url: String,
    pub pkce_verifier: String,
}

impl CsrfState {
    pub(crate) fn new(original_url: String) -> Self {
        Self {
            nonce: generate_token(NONCE_LEN),
            original_url,
            pkce_verifier: generate_token(PKCE_VERIFIER_LEN),
        }
    }

    pub(crate) fn seal(&self, cipher: &Cipher) -> Result<String, CodecError> {
        cipher.seal_json(self)
    }

    pub(crate) fn open(sealed: &str, cipher: &Cipher) -> Result<Self, CodecError> {
        cipher.open_json(sealed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum EnvelopeError {
    #[error("signature does not match")]
    SignatureMismatch,
    #[error("timestamp is not a unix time")]
    MalformedTimestamp,
    #[error("login link has expired")]
    Stale,
}

/// Login link parameters: the URL to return to, when the link was issued, and a keyed
/// signature over both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SignedRedirect {
    pub original_url: String,
    pub now: String,
    pub sign: String,
}

impl SignedRedirect {
    /// Signs `original_url` with the current time.
    pub(crate) fn issue(original_url: String, secret: &SecretString) -> Self {
        let now = unix_time_seconds().to_string();
        let sign = sign_hmac(&signed_message(&original_url, &now), secret);
        Self {
            original_url,
            now,
            sign,
        }
    }

    /// `login_url` with the envelope as query parameters.
    pub(crate) fn to_login_url(&self, login_url: &Url) -> Url {
        let mut url = login_url.clone();
        url.query_pairs_mut()
            .append_pair("original_url", &self.original_url)
            .append_pair("now", &self.now)
            .append_pair("sign", &self.sign);
        url
    }

    /// Checks the signature, then that the link is younger than `max_age`.
    pub(crate) fn verify(
        &self,
        secret: &SecretString,
        max_age: Duration,
    ) -> Result<(), EnvelopeError> {
        if !verify_hmac(
            &signed_message(&self.original_url, &self.now),
            &self.sign,
            secret,
        ) {
            return Err(EnvelopeError::SignatureMismatch);
        }
        let issued_at: u64 = self
            .now
            .parse()
            .map_err(|_| EnvelopeError::MalformedTimestamp)?;
        if !is_timestamp_in_window(issued_at, max_age) {
            return Err(EnvelopeError::Stale);
        }
        Ok(())
    }
}

fn signed_message(original_url: &str, now: &str) -> String {
    format!("{original_url}{now}")
}
