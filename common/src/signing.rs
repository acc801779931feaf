//! HMAC signing utilities for the signed login hand-off.
//!
//! The filter signs `original_url || now` with the OIDC client secret, the
//! login endpoint recomputes the signature and compares it in constant time.

use core::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac as _};
use secrecy::{ExposeSecret as _, SecretString};
use sha2::Sha256;

/// Creates an HMAC instance for the given message and secret.
#[expect(
    clippy::missing_panics_doc,
    reason = "Expectation should never be false"
)]
#[must_use]
pub fn create_hmac(message: &str, secret: &[u8]) -> Hmac<Sha256> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC can take a key of any size");
    mac.update(message.as_bytes());
    mac
}

/// Signs a message with HMAC using the provided secret, hex encoded.
#[must_use]
pub fn sign_hmac(message: &str, secret: &SecretString) -> String {
    let mac = create_hmac(message, secret.expose_secret().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Checks a hex encoded signature produced by [`sign_hmac`].
///
/// The comparison runs in constant time. Anything that is not valid hex is rejected.
#[must_use]
pub fn verify_hmac(message: &str, received_signature: &str, secret: &SecretString) -> bool {
    let Ok(received) = hex::decode(received_signature) else {
        return false;
    };
    create_hmac(message, secret.expose_secret().as_bytes())
        .verify_slice(&received)
        .is_ok()
}

/// Gets the current Unix timestamp in seconds.
#[expect(
    clippy::missing_panics_doc,
    reason = "Expectation should never be false"
)]
#[must_use]
pub fn unix_time_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs()
}

/// Returns `true` if `timestamp` is no further than `window` away from now, in either direction.
#[must_use]
pub fn is_timestamp_in_window(timestamp: u64, window: Duration) -> bool {
    unix_time_seconds().abs_diff(timestamp) <= window.as_secs()
}
