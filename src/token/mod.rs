//! Signed token encoding and verification.
//!
//! [`TokenCodec`] owns the resolved key material together with the issuer,
//! leeway and default expiry policy. [`Claims`] is the payload it reads and
//! writes.

pub mod claims;
mod codec;

pub use claims::Claims;
pub use codec::TokenCodec;
