//! Cryptography for the Find My accessory core.
//!
//! Built on RustCrypto curve and AEAD crates; this crate only composes them:
//! - `ec`: P-224/P-256 import, arithmetic and the reduced scalar multiplication
//! - `kdf`: ANSI X9.63 over SHA-256
//! - `ckg`: cooperative key generation (both sides)
//! - `ecies`: encryption to the server key
//! - `keys`: key rolling, LTK, server shared secret, E3, S2 and KSN
//!
//! Randomness is always injected through [`rand_core::CryptoRngCore`].

#![forbid(unsafe_code)]

pub mod aead;
pub mod ckg;
pub mod der;
pub mod ec;
pub mod ecies;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod keys;

#[cfg(test)]
mod proptests;

pub use error::CryptoError;
