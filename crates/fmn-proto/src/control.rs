//! Owner configuration control point: commands and indications.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::frame::Frame;
use crate::opcode::{Opcode, Status};
use crate::validation::{to_array, validate_exact_size};

/// A decoded owner command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerCommand {
    SoundStart,
    SoundStop,
    PersistentConnectionStatus { enabled: bool },
    SetNearbyTimeout { seconds: u16 },
    Unpair,
    ConfigureSeparatedState {
        next_primary_key_roll_ms: u32,
        secondary_key_evaluation_index: u32,
    },
    LatchSeparatedKey,
    SetMaxConnections { max: u8 },
    SetUtc { epoch_ms: u64 },
    GetMultiStatus,
}

impl OwnerCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            OwnerCommand::SoundStart => Opcode::SoundStart,
            OwnerCommand::SoundStop => Opcode::SoundStop,
            OwnerCommand::PersistentConnectionStatus { .. } => Opcode::PersistentConnectionStatus,
            OwnerCommand::SetNearbyTimeout { .. } => Opcode::SetNearbyTimeout,
            OwnerCommand::Unpair => Opcode::Unpair,
            OwnerCommand::ConfigureSeparatedState { .. } => Opcode::ConfigureSeparatedState,
            OwnerCommand::LatchSeparatedKey => Opcode::LatchSeparatedKey,
            OwnerCommand::SetMaxConnections { .. } => Opcode::SetMaxConnections,
            OwnerCommand::SetUtc { .. } => Opcode::SetUtc,
            OwnerCommand::GetMultiStatus => Opcode::GetMultiStatus,
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self, WireError> {
        let body = &frame.body[..];
        let cmd = match frame.opcode {
            Opcode::SoundStart => {
                validate_exact_size("sound_start", body, 0)?;
                OwnerCommand::SoundStart
            }
            Opcode::SoundStop => {
                validate_exact_size("sound_stop", body, 0)?;
                OwnerCommand::SoundStop
            }
            Opcode::PersistentConnectionStatus => {
                let [flag] = to_array::<1>("persistent_connection", body)?;
                if flag > 1 {
                    return Err(WireError::InvalidParameter {
                        field: "persistent_connection",
                        reason: "must be 0 or 1",
                    });
                }
                OwnerCommand::PersistentConnectionStatus { enabled: flag == 1 }
            }
            Opcode::SetNearbyTimeout => OwnerCommand::SetNearbyTimeout {
                seconds: u16::from_le_bytes(to_array("nearby_timeout", body)?),
            },
            Opcode::Unpair => {
                validate_exact_size("unpair", body, 0)?;
                OwnerCommand::Unpair
            }
            Opcode::ConfigureSeparatedState => {
                let raw: [u8; 8] = to_array("configure_separated_state", body)?;
                OwnerCommand::ConfigureSeparatedState {
                    next_primary_key_roll_ms: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                    secondary_key_evaluation_index: u32::from_le_bytes([
                        raw[4], raw[5], raw[6], raw[7],
                    ]),
                }
            }
            Opcode::LatchSeparatedKey => {
                validate_exact_size("latch_separated_key", body, 0)?;
                OwnerCommand::LatchSeparatedKey
            }
            Opcode::SetMaxConnections => {
                let [max] = to_array::<1>("max_connections", body)?;
                OwnerCommand::SetMaxConnections { max }
            }
            Opcode::SetUtc => OwnerCommand::SetUtc {
                epoch_ms: u64::from_le_bytes(to_array("utc", body)?),
            },
            Opcode::GetMultiStatus => {
                validate_exact_size("get_multi_status", body, 0)?;
                OwnerCommand::GetMultiStatus
            }
            other => return Err(WireError::UnknownOpcode(other.as_u16())),
        };
        Ok(cmd)
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::new();
        match *self {
            OwnerCommand::PersistentConnectionStatus { enabled } => buf.put_u8(enabled as u8),
            OwnerCommand::SetNearbyTimeout { seconds } => buf.put_u16_le(seconds),
            OwnerCommand::ConfigureSeparatedState {
                next_primary_key_roll_ms,
                secondary_key_evaluation_index,
            } => {
                buf.put_u32_le(next_primary_key_roll_ms);
                buf.put_u32_le(secondary_key_evaluation_index);
            }
            OwnerCommand::SetMaxConnections { max } => buf.put_u8(max),
            OwnerCommand::SetUtc { epoch_ms } => buf.put_u64_le(epoch_ms),
            _ => {}
        }
        Frame::new(self.opcode(), buf.freeze())
    }
}

/// `CommandResponse`: echoes the command opcode (raw, so unknown opcodes can
/// be answered) and a status.
pub fn command_response(opcode: u16, status: Status) -> Frame {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16_le(opcode);
    buf.put_u16_le(status.as_u16());
    Frame::new(Opcode::CommandResponse, buf.freeze())
}

/// Parse a `CommandResponse` body into `(opcode, status)`.
pub fn decode_command_response(body: &[u8]) -> Result<(u16, u16), WireError> {
    let raw: [u8; 4] = to_array("command_response", body)?;
    Ok((
        u16::from_le_bytes([raw[0], raw[1]]),
        u16::from_le_bytes([raw[2], raw[3]]),
    ))
}

pub fn multi_status_response(bits: u8) -> Frame {
    Frame::new(Opcode::GetMultiStatusResponse, Bytes::copy_from_slice(&[bits]))
}

pub fn keyroll_indication(primary_index: u32) -> Frame {
    Frame::new(
        Opcode::KeyrollIndication,
        Bytes::copy_from_slice(&primary_index.to_le_bytes()),
    )
}

pub fn latch_separated_key_response(primary_index: u32) -> Frame {
    Frame::new(
        Opcode::LatchSeparatedKeyResponse,
        Bytes::copy_from_slice(&primary_index.to_le_bytes()),
    )
}

pub fn sound_completed() -> Frame {
    Frame::new(Opcode::SoundCompleted, Bytes::new())
}

/// Parse a 4-byte little-endian index body (keyroll and latch responses).
pub fn decode_index(body: &[u8]) -> Result<u32, WireError> {
    Ok(u32::from_le_bytes(to_array("index", body)?))
}
