//! Wire error types.

use thiserror::Error;

/// Errors raised while decoding or encoding GATT payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("field '{field}' has invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unknown opcode 0x{0:04x}")]
    UnknownOpcode(u16),

    #[error("invalid fragment flag 0x{0:02x}")]
    InvalidFragmentFlag(u8),

    #[error("reassembly buffer overflow: {0} bytes")]
    ReassemblyOverflow(usize),

    #[error("invalid parameter '{field}': {reason}")]
    InvalidParameter {
        field: &'static str,
        reason: &'static str,
    },
}

impl WireError {
    /// Shorthand for length mismatches.
    pub fn length(field: &'static str, expected: usize, actual: usize) -> Self {
        WireError::InvalidLength {
            field,
            expected,
            actual,
        }
    }
}
