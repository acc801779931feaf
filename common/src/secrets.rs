//! Random token generation.

use rand::{Rng as _, distr::Alphanumeric};

/// Generates a random alphanumeric string of `len` characters.
///
/// Uses the thread-local CSPRNG, suitable for CSRF nonces.
#[must_use]
pub fn generate_token(len: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
