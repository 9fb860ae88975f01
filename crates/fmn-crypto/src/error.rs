//! Error type shared by every crypto operation.

use thiserror::Error;

/// Crypto failures. None of the variants carry secret material, and
/// authentication failures deliberately do not say which stage failed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("random number generator failed")]
    RngError,
    #[error("point is not on the curve")]
    CurveValidationFailure,
    #[error("authentication failed")]
    AuthenticationFailure,
}

pub type Result<T> = core::result::Result<T, CryptoError>;
