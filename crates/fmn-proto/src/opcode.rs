//! GATT opcodes and command status codes.
//!
//! Multi-byte values travel little-endian on the wire.

use crate::error::WireError;

/// Every opcode understood or emitted by the accessory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    // Pairing control point
    InitiatePairing = 0x0100,
    SendPairingData = 0x0101,
    FinalizePairing = 0x0102,
    SendPairingStatus = 0x0103,
    PairingComplete = 0x0104,

    // Owner configuration control point
    SoundStart = 0x0200,
    SoundStop = 0x0201,
    PersistentConnectionStatus = 0x0202,
    SetNearbyTimeout = 0x0203,
    Unpair = 0x0204,
    ConfigureSeparatedState = 0x0205,
    LatchSeparatedKey = 0x0206,
    SetMaxConnections = 0x0207,
    SetUtc = 0x0208,
    GetMultiStatus = 0x0209,
    KeyrollIndication = 0x020A,
    CommandResponse = 0x020B,
    GetMultiStatusResponse = 0x020C,
    SoundCompleted = 0x020D,
    LatchSeparatedKeyResponse = 0x020E,
}

impl Opcode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Opcodes that belong to the pairing control point.
    pub fn is_pairing(self) -> bool {
        (self.as_u16() & 0xFF00) == 0x0100
    }

    /// Opcodes an owner may write (as opposed to indications we emit).
    pub fn is_owner_command(self) -> bool {
        matches!(
            self,
            Opcode::SoundStart
                | Opcode::SoundStop
                | Opcode::PersistentConnectionStatus
                | Opcode::SetNearbyTimeout
                | Opcode::Unpair
                | Opcode::ConfigureSeparatedState
                | Opcode::LatchSeparatedKey
                | Opcode::SetMaxConnections
                | Opcode::SetUtc
                | Opcode::GetMultiStatus
        )
    }
}

impl TryFrom<u16> for Opcode {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let op = match value {
            0x0100 => Opcode::InitiatePairing,
            0x0101 => Opcode::SendPairingData,
            0x0102 => Opcode::FinalizePairing,
            0x0103 => Opcode::SendPairingStatus,
            0x0104 => Opcode::PairingComplete,
            0x0200 => Opcode::SoundStart,
            0x0201 => Opcode::SoundStop,
            0x0202 => Opcode::PersistentConnectionStatus,
            0x0203 => Opcode::SetNearbyTimeout,
            0x0204 => Opcode::Unpair,
            0x0205 => Opcode::ConfigureSeparatedState,
            0x0206 => Opcode::LatchSeparatedKey,
            0x0207 => Opcode::SetMaxConnections,
            0x0208 => Opcode::SetUtc,
            0x0209 => Opcode::GetMultiStatus,
            0x020A => Opcode::KeyrollIndication,
            0x020B => Opcode::CommandResponse,
            0x020C => Opcode::GetMultiStatusResponse,
            0x020D => Opcode::SoundCompleted,
            0x020E => Opcode::LatchSeparatedKeyResponse,
            other => return Err(WireError::UnknownOpcode(other)),
        };
        Ok(op)
    }
}

/// Status carried in a command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Success = 0x0000,
    InvalidState = 0x0001,
    InvalidConfiguration = 0x0002,
    InvalidLength = 0x0003,
    InvalidParam = 0x0004,
    NoCommandResponse = 0xFFFE,
    InvalidCommand = 0xFFFF,
}

impl Status {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Status::Success),
            0x0001 => Some(Status::InvalidState),
            0x0002 => Some(Status::InvalidConfiguration),
            0x0003 => Some(Status::InvalidLength),
            0x0004 => Some(Status::InvalidParam),
            0xFFFE => Some(Status::NoCommandResponse),
            0xFFFF => Some(Status::InvalidCommand),
            _ => None,
        }
    }
}

impl From<&WireError> for Status {
    fn from(e: &WireError) -> Self {
        match e {
            WireError::InvalidLength { .. } => Status::InvalidLength,
            WireError::UnknownOpcode(_) => Status::InvalidCommand,
            WireError::InvalidParameter { .. } => Status::InvalidParam,
            WireError::InvalidFragmentFlag(_) | WireError::ReassemblyOverflow(_) => {
                Status::InvalidLength
            }
        }
    }
}
