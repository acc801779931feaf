//! Codec shared by the authgate services.
//!
//! This crate provides:
//! - Authenticated symmetric encryption of opaque credential payloads
//! - Keyed HMAC signatures for the cross-domain login hand-off
//! - Random token generation
#![expect(
    clippy::missing_errors_doc,
    reason = "The situation it maps to errors should be obvious."
)]

extern crate alloc;
extern crate core;

mod cipher;
mod secrets;
mod signing;

pub use cipher::*;
pub use secrets::*;
pub use signing::*;
