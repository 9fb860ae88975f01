//! Wire formats for the Find My accessory core.
//!
//! This crate knows nothing about cryptography. It covers:
//! - GATT control-point framing (fragment flag, opcode, fixed-length bodies)
//! - Pairing message codecs (InitiatePairing, FinalizePairing and their responses)
//! - Owner configuration commands and indications
//! - Advertising payload encoders for every accessory state
//! - Field-size validation shared by the other crates

#![forbid(unsafe_code)]

pub mod adv;
pub mod control;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod opcode;
pub mod pairing;
pub mod validation;

#[cfg(test)]
mod proptests;

pub use error::WireError;
pub use frame::Frame;
pub use opcode::{Opcode, Status};
