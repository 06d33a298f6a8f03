//! Cryptographic primitives and identity management.
//!
//! Long-term Ed25519 identities, the HMAC/HKDF helpers the session engines
//! build their key schedules from, and the at-rest cipher used for storage.

pub mod at_rest;
pub mod identity;
pub mod mac;

pub use at_rest::{AtRestCipher, AtRestScheme};
pub use identity::*;
