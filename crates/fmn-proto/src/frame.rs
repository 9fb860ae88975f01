//! Opcode framing for reassembled control-point payloads.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::opcode::Opcode;

/// Size of the opcode prefix.
pub const OPCODE_LEN: usize = 2;

/// A reassembled control-point message: opcode plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub body: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, body: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            body: body.into(),
        }
    }

    /// Split a payload into opcode and body.
    ///
    /// An unknown opcode yields [`WireError::UnknownOpcode`] carrying the raw
    /// value so the caller can still answer with a command response.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < OPCODE_LEN {
            return Err(WireError::length("opcode", OPCODE_LEN, payload.len()));
        }
        let raw = u16::from_le_bytes([payload[0], payload[1]]);
        let opcode = Opcode::try_from(raw)?;
        Ok(Self {
            opcode,
            body: Bytes::copy_from_slice(&payload[OPCODE_LEN..]),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(OPCODE_LEN + self.body.len());
        buf.put_u16_le(self.opcode.as_u16());
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Peek at the raw opcode of a payload without validating it.
    pub fn raw_opcode(payload: &[u8]) -> Option<u16> {
        match payload {
            [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }
}
