//! Pairing control-point message bodies.
//!
//! All bodies are fixed length; decoders reject anything else before a single
//! field is interpreted.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::frame::Frame;
use crate::opcode::Opcode;
use crate::validation::{sizes, to_array, validate_exact_size};

/// Body of `InitiatePairing` sent by the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatePairing {
    pub session_nonce: [u8; sizes::SESSION_NONCE],
    pub e1: [u8; sizes::E1],
}

impl InitiatePairing {
    pub const LEN: usize = sizes::SESSION_NONCE + sizes::E1;

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        validate_exact_size("initiate_pairing", body, Self::LEN)?;
        let (nonce, e1) = body.split_at(sizes::SESSION_NONCE);
        Ok(Self {
            session_nonce: to_array("session_nonce", nonce)?,
            e1: to_array("e1", e1)?,
        })
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_slice(&self.session_nonce);
        buf.put_slice(&self.e1);
        Frame::new(Opcode::InitiatePairing, buf.freeze())
    }
}

/// Body of `SendPairingData`: the accessory's answer to `InitiatePairing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingData {
    pub c1: [u8; sizes::C1],
    pub e2: Bytes,
}

impl PairingData {
    pub const LEN: usize = sizes::C1 + sizes::E2;

    pub fn new(c1: [u8; sizes::C1], e2: Bytes) -> Result<Self, WireError> {
        validate_exact_size("e2", &e2, sizes::E2)?;
        Ok(Self { c1, e2 })
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        validate_exact_size("pairing_data", body, Self::LEN)?;
        let (c1, e2) = body.split_at(sizes::C1);
        Ok(Self {
            c1: to_array("c1", c1)?,
            e2: Bytes::copy_from_slice(e2),
        })
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_slice(&self.c1);
        buf.put_slice(&self.e2);
        Frame::new(Opcode::SendPairingData, buf.freeze())
    }
}

/// Body of `FinalizePairing` sent by the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizePairing {
    pub c2: [u8; sizes::C2],
    pub e3: Bytes,
    pub seeds: [u8; sizes::SEEDS],
    pub icloud_id: [u8; sizes::ICLOUD_ID],
    pub s2: [u8; sizes::S2],
}

impl FinalizePairing {
    pub const LEN: usize = sizes::C2 + sizes::E3 + sizes::SEEDS + sizes::ICLOUD_ID + sizes::S2;

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        validate_exact_size("finalize_pairing", body, Self::LEN)?;
        let (c2, rest) = body.split_at(sizes::C2);
        let (e3, rest) = rest.split_at(sizes::E3);
        let (seeds, rest) = rest.split_at(sizes::SEEDS);
        let (icloud_id, s2) = rest.split_at(sizes::ICLOUD_ID);
        Ok(Self {
            c2: to_array("c2", c2)?,
            e3: Bytes::copy_from_slice(e3),
            seeds: to_array("seeds", seeds)?,
            icloud_id: to_array("icloud_id", icloud_id)?,
            s2: to_array("s2", s2)?,
        })
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_slice(&self.c2);
        buf.put_slice(&self.e3);
        buf.put_slice(&self.seeds);
        buf.put_slice(&self.icloud_id);
        buf.put_slice(&self.s2);
        Frame::new(Opcode::FinalizePairing, buf.freeze())
    }
}

/// Body of `SendPairingStatus`: the accessory's answer to `FinalizePairing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingStatus {
    pub c3: [u8; sizes::C3],
    pub status: u32,
    pub e4: Bytes,
}

impl PairingStatus {
    pub const LEN: usize = sizes::C3 + sizes::STATUS + sizes::E4;

    pub fn new(c3: [u8; sizes::C3], status: u32, e4: Bytes) -> Result<Self, WireError> {
        validate_exact_size("e4", &e4, sizes::E4)?;
        Ok(Self { c3, status, e4 })
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        validate_exact_size("pairing_status", body, Self::LEN)?;
        let (c3, rest) = body.split_at(sizes::C3);
        let (status, e4) = rest.split_at(sizes::STATUS);
        Ok(Self {
            c3: to_array("c3", c3)?,
            status: u32::from_le_bytes(to_array("status", status)?),
            e4: Bytes::copy_from_slice(e4),
        })
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_slice(&self.c3);
        buf.put_u32_le(self.status);
        buf.put_slice(&self.e4);
        Frame::new(Opcode::SendPairingStatus, buf.freeze())
    }
}

/// `PairingComplete` carries no body.
pub fn decode_pairing_complete(body: &[u8]) -> Result<(), WireError> {
    validate_exact_size("pairing_complete", body, 0)
}
