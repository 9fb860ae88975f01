//! Control-point fragment reassembly.
//!
//! Every write starts with a one-byte flag: `0x00` means more fragments
//! follow, `0x01` marks the final fragment. The reassembled payload is handed
//! to [`crate::Frame::decode`].

use bytes::{Bytes, BytesMut};

use crate::error::WireError;
use crate::validation::sizes;

pub const FLAG_CONTINUE: u8 = 0x00;
pub const FLAG_FINAL: u8 = 0x01;

/// Accumulates fragments for one control point of one connection.
#[derive(Debug)]
pub struct Reassembler {
    buf: BytesMut,
    max_len: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(sizes::MAX_CONTROL_POINT_PAYLOAD)
    }
}

impl Reassembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_len,
        }
    }

    /// Feed one GATT write. Returns the full payload once the final fragment
    /// arrives. Any error discards the partial buffer.
    pub fn push(&mut self, write: &[u8]) -> Result<Option<Bytes>, WireError> {
        let Some((&flag, data)) = write.split_first() else {
            self.reset();
            return Err(WireError::length("fragment", 1, 0));
        };
        if flag != FLAG_CONTINUE && flag != FLAG_FINAL {
            self.reset();
            return Err(WireError::InvalidFragmentFlag(flag));
        }
        let total = self.buf.len() + data.len();
        if total > self.max_len {
            self.reset();
            return Err(WireError::ReassemblyOverflow(total));
        }
        self.buf.extend_from_slice(data);
        if flag == FLAG_FINAL {
            Ok(Some(self.buf.split().freeze()))
        } else {
            Ok(None)
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Split an outgoing payload into fragments of at most `chunk` data bytes.
pub fn fragment(payload: &[u8], chunk: usize) -> Vec<Vec<u8>> {
    let chunk = chunk.max(1);
    if payload.is_empty() {
        return vec![vec![FLAG_FINAL]];
    }
    let count = payload.len().div_ceil(chunk);
    payload
        .chunks(chunk)
        .enumerate()
        .map(|(i, part)| {
            let flag = if i + 1 == count { FLAG_FINAL } else { FLAG_CONTINUE };
            let mut out = Vec::with_capacity(part.len() + 1);
            out.push(flag);
            out.extend_from_slice(part);
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_final_fragment() {
        let mut r = Reassembler::default();
        let out = r.push(&[FLAG_FINAL, 0x09, 0x02]).unwrap();
        assert_eq!(out.as_deref(), Some(&[0x09, 0x02][..]));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_multi_fragment() {
        let mut r = Reassembler::default();
        assert!(r.push(&[FLAG_CONTINUE, 1, 2]).unwrap().is_none());
        assert!(r.push(&[FLAG_CONTINUE, 3]).unwrap().is_none());
        let out = r.push(&[FLAG_FINAL, 4]).unwrap().unwrap();
        assert_eq!(&out[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_bad_flag_discards_partial() {
        let mut r = Reassembler::default();
        r.push(&[FLAG_CONTINUE, 1, 2]).unwrap();
        assert_eq!(r.push(&[0x02, 3]), Err(WireError::InvalidFragmentFlag(0x02)));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_overflow_rejected() {
        let mut r = Reassembler::new(4);
        r.push(&[FLAG_CONTINUE, 1, 2, 3]).unwrap();
        assert_eq!(r.push(&[FLAG_FINAL, 4, 5]), Err(WireError::ReassemblyOverflow(5)));
    }

    #[test]
    fn test_empty_write_rejected() {
        let mut r = Reassembler::default();
        assert!(r.push(&[]).is_err());
    }

    #[test]
    fn test_fragment_then_reassemble() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1500).collect();
        let mut r = Reassembler::default();
        let mut result = None;
        for part in fragment(&payload, 180) {
            result = r.push(&part).unwrap();
        }
        assert_eq!(result.unwrap().as_ref(), payload.as_slice());
    }
}
