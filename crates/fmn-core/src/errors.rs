//! Error types for the accessory core.
//!
//! [`FmnError`] is the single error surfaced by pairing, key rotation and the
//! state machine. It knows how each failure is reported to the peer: as a
//! command response status, or by dropping the link.

use fmn_crypto::CryptoError;
use fmn_proto::{Status, WireError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum FmnError {
    /// Malformed or out-of-range caller arguments
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Entropy source failure
    #[error("random number generator failed")]
    Rng,

    /// Untrusted point failed validation
    #[error("curve validation failed")]
    CurveValidation,

    /// AEAD tag mismatch or bad signature
    #[error("authentication failed")]
    Authentication,

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Command received outside the state it requires
    #[error("protocol state violation: {0}")]
    ProtocolStateViolation(String),

    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<CryptoError> for FmnError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidInput(what) => FmnError::InvalidInput(what.to_string()),
            CryptoError::RngError => FmnError::Rng,
            CryptoError::CurveValidationFailure => FmnError::CurveValidation,
            CryptoError::AuthenticationFailure => FmnError::Authentication,
        }
    }
}

impl FmnError {
    pub fn state(msg: impl Into<String>) -> Self {
        FmnError::ProtocolStateViolation(msg.into())
    }

    /// Status reported in a command response.
    pub fn status(&self) -> Status {
        match self {
            FmnError::Wire(e) => Status::from(e),
            FmnError::InvalidInput(_) => Status::InvalidParam,
            FmnError::ProtocolStateViolation(_) => Status::InvalidState,
            FmnError::Config(_) => Status::InvalidConfiguration,
            FmnError::Storage(_) | FmnError::Rng => Status::InvalidState,
            FmnError::CurveValidation | FmnError::Authentication => Status::InvalidParam,
        }
    }

    /// Whether the failure indicates a hostile or broken peer whose link
    /// should be dropped rather than answered.
    pub fn warrants_disconnect(&self) -> bool {
        matches!(
            self,
            FmnError::CurveValidation
                | FmnError::Authentication
                | FmnError::Wire(WireError::InvalidFragmentFlag(_))
                | FmnError::Wire(WireError::ReassemblyOverflow(_))
        )
    }
}
