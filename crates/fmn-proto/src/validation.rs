//! Field-size validation shared by the codecs and the crypto layer.
//!
//! Every pairing field has an exact length; nothing on the control point is
//! variable-sized except the fragment stream that carries it.

use crate::error::WireError;

/// Constants for field sizes.
pub mod sizes {
    /// CKG commitment sent by the accessory.
    pub const C1: usize = 32;
    /// Owner CKG message: uncompressed P-224 point plus 32B random.
    pub const C2: usize = 89;
    /// CKG reveal: P-224 private scalar plus r1.
    pub const C3: usize = 60;
    /// Opaque owner blob forwarded to the server.
    pub const E1: usize = 113;
    /// ECIES of the InitiatePairing server payload.
    pub const E2: usize = 1326;
    /// Server-encrypted software authentication token.
    pub const E3: usize = 1040;
    /// ECIES of the pairing status server payload.
    pub const E4: usize = 1286;
    /// DER signature, zero padded.
    pub const S2: usize = 100;

    pub const SESSION_NONCE: usize = 32;
    pub const SEEDS: usize = 32;
    pub const SEED_K1: usize = 32;
    pub const ICLOUD_ID: usize = 60;
    pub const SYMMETRIC_KEY: usize = 32;
    pub const SERVER_SHARED_SECRET: usize = 32;
    /// x coordinate of a P-224 point.
    pub const PUBLIC_KEY: usize = 28;
    /// 0x04 || X || Y on P-224.
    pub const MASTER_PUBLIC_KEY: usize = 57;
    /// 0x04 || X || Y on P-256.
    pub const SERVER_PUBLIC_KEY: usize = 65;
    pub const LTK: usize = 16;

    pub const SW_AUTH_TOKEN: usize = 1024;
    pub const SW_AUTH_UUID: usize = 16;
    pub const SERIAL_NUMBER: usize = 16;
    pub const PRODUCT_DATA: usize = 8;
    pub const CATEGORY: usize = 8;
    pub const FW_VERSION: usize = 4;
    pub const STATUS: usize = 4;

    /// AES-GCM tag appended by ECIES.
    pub const GCM_TAG: usize = 16;

    /// Plaintext carried inside E2.
    pub const E2_PLAINTEXT: usize = SESSION_NONCE
        + SW_AUTH_TOKEN
        + SW_AUTH_UUID
        + SERIAL_NUMBER
        + PRODUCT_DATA
        + FW_VERSION
        + E1
        + SEED_K1;

    /// Plaintext carried inside E4.
    pub const E4_PLAINTEXT: usize =
        SW_AUTH_UUID + SERIAL_NUMBER + SESSION_NONCE + E1 + SW_AUTH_TOKEN + STATUS;

    /// Largest reassembled control-point write (opcode + FinalizePairing body).
    pub const MAX_CONTROL_POINT_PAYLOAD: usize = 2 + C2 + E3 + SEEDS + ICLOUD_ID + S2;
}

/// Validate that a byte field has the expected exact size.
pub fn validate_exact_size(field: &'static str, data: &[u8], expected: usize) -> Result<(), WireError> {
    if data.len() != expected {
        return Err(WireError::length(field, expected, data.len()));
    }
    Ok(())
}

/// Copy a slice into a fixed array, checking its length first.
pub fn to_array<const N: usize>(field: &'static str, data: &[u8]) -> Result<[u8; N], WireError> {
    validate_exact_size(field, data, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(data);
    Ok(out)
}

/// Validate that an integer lies in an inclusive range.
pub fn validate_range<T: PartialOrd>(
    field: &'static str,
    value: T,
    min: T,
    max: T,
) -> Result<(), WireError> {
    if value < min || value > max {
        return Err(WireError::InvalidParameter {
            field,
            reason: "out of range",
        });
    }
    Ok(())
}
