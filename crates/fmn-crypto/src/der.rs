//! Minimal DER decoder for ECDSA-P256 signatures.
//!
//! Accepts `SEQUENCE { INTEGER r, INTEGER s }` with short-form lengths and
//! returns the fixed-width `r || s`. Bytes after the sequence are ignored,
//! since signatures arrive zero padded to a fixed field size.

use crate::error::{CryptoError, Result};

const TAG_SEQUENCE: u8 = 0x30;
const TAG_INTEGER: u8 = 0x02;
const COMPONENT_LEN: usize = 32;

fn malformed() -> CryptoError {
    CryptoError::InvalidInput("malformed DER signature")
}

/// Read one INTEGER at `input`, returning the right-aligned value and the
/// remaining bytes.
fn read_integer(input: &[u8]) -> Result<([u8; COMPONENT_LEN], &[u8])> {
    let (&tag, rest) = input.split_first().ok_or_else(malformed)?;
    if tag != TAG_INTEGER {
        return Err(malformed());
    }
    let (&len, rest) = rest.split_first().ok_or_else(malformed)?;
    let len = len as usize;
    if len == 0 || len > 0x7F || rest.len() < len {
        return Err(malformed());
    }
    let (mut value, rest) = rest.split_at(len);
    while let [0, tail @ ..] = value {
        value = tail;
    }
    if value.len() > COMPONENT_LEN {
        return Err(malformed());
    }
    let mut out = [0u8; COMPONENT_LEN];
    out[COMPONENT_LEN - value.len()..].copy_from_slice(value);
    Ok((out, rest))
}

/// Decode a DER ECDSA signature into raw `r || s`.
pub fn decode_der_signature(der: &[u8]) -> Result<[u8; 2 * COMPONENT_LEN]> {
    let (&tag, rest) = der.split_first().ok_or_else(malformed)?;
    if tag != TAG_SEQUENCE {
        return Err(malformed());
    }
    let (&seq_len, rest) = rest.split_first().ok_or_else(malformed)?;
    let seq_len = seq_len as usize;
    if seq_len > 0x7F || rest.len() < seq_len {
        return Err(malformed());
    }
    let body = &rest[..seq_len];

    let (r, body) = read_integer(body)?;
    let (s, body) = read_integer(body)?;
    if !body.is_empty() {
        return Err(malformed());
    }

    let mut out = [0u8; 2 * COMPONENT_LEN];
    out[..COMPONENT_LEN].copy_from_slice(&r);
    out[COMPONENT_LEN..].copy_from_slice(&s);
    Ok(out)
}
