//! Advertising payload encoders.
//!
//! Paired payloads carry a rotating P-224 x coordinate split between the BLE
//! address and the manufacturer data; unpaired payloads carry FMN service
//! data so owners can discover the accessory.

use crate::validation::sizes;

/// Apple company identifier, little-endian on air.
pub const COMPANY_ID: u16 = 0x004C;
/// Manufacturer data type for offline finding.
pub const PAYLOAD_TYPE: u8 = 0x12;
/// FMN service data UUID.
pub const FMN_SERVICE_UUID: u16 = 0xFD44;

/// Advertising intervals in 0.625 ms units.
pub mod interval {
    pub const PAIRING: u16 = 0x0030;
    pub const PERSISTENT_RECONNECT: u16 = 0x0030;
    pub const NEARBY: u16 = 0x0C80;
    pub const SEPARATED: u16 = 0x0C80;
}

const AD_TYPE_MANUFACTURER: u8 = 0xFF;
const AD_TYPE_SERVICE_DATA: u8 = 0x16;
const NEARBY_KEY_LEN: u8 = 0x02;
const SEPARATED_KEY_LEN: u8 = 0x19;
const MAINTAINED_BIT: u8 = 1 << 2;
const BATTERY_SHIFT: u8 = 6;
const ADDRESS_LEN: usize = 6;

/// Battery state reported in advertising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BatteryState {
    #[default]
    Full = 0,
    Medium = 1,
    Low = 2,
    CriticallyLow = 3,
}

impl BatteryState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BatteryState::Full),
            1 => Some(BatteryState::Medium),
            2 => Some(BatteryState::Low),
            3 => Some(BatteryState::CriticallyLow),
            _ => None,
        }
    }
}

/// Status byte shared by the nearby and separated payloads.
pub fn status_byte(battery: BatteryState, maintained: bool) -> u8 {
    let mut status = (battery as u8) << BATTERY_SHIFT;
    if maintained {
        status |= MAINTAINED_BIT;
    }
    status
}

/// Random static address derived from the first six key bytes.
pub fn random_static_address(key: &[u8; sizes::PUBLIC_KEY]) -> [u8; ADDRESS_LEN] {
    let mut addr = [0u8; ADDRESS_LEN];
    addr.copy_from_slice(&key[..ADDRESS_LEN]);
    addr[0] |= 0b1100_0000;
    addr
}

/// What the host should put on air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// `None` lets the host pick its own resolvable address.
    pub address: Option<[u8; ADDRESS_LEN]>,
    pub payload: Vec<u8>,
    pub interval: u16,
}

impl Advertisement {
    /// Unpaired (pairing mode) service data payload.
    pub fn unpaired(
        product_data: &[u8; sizes::PRODUCT_DATA],
        category: &[u8; sizes::CATEGORY],
        battery: BatteryState,
    ) -> Self {
        let mut payload = Vec::with_capacity(25);
        payload.push(0x18);
        payload.push(AD_TYPE_SERVICE_DATA);
        payload.extend_from_slice(&FMN_SERVICE_UUID.to_le_bytes());
        payload.extend_from_slice(product_data);
        payload.extend_from_slice(category);
        payload.extend_from_slice(&[0u8; 4]);
        payload.push(battery as u8);
        Self {
            address: None,
            payload,
            interval: interval::PAIRING,
        }
    }

    /// Short payload used while Connected or Nearby.
    pub fn nearby(primary_key: &[u8; sizes::PUBLIC_KEY], status: u8, fast: bool) -> Self {
        let mut payload = Vec::with_capacity(8);
        payload.push(0x07);
        payload.push(AD_TYPE_MANUFACTURER);
        payload.extend_from_slice(&COMPANY_ID.to_le_bytes());
        payload.push(PAYLOAD_TYPE);
        payload.push(NEARBY_KEY_LEN);
        payload.push(status);
        payload.push(primary_key[0] >> 6);
        Self {
            address: Some(random_static_address(primary_key)),
            payload,
            interval: if fast {
                interval::PERSISTENT_RECONNECT
            } else {
                interval::NEARBY
            },
        }
    }

    /// Full-key payload used while Separated. The hint byte lets an owner
    /// match the separated key against the primary schedule.
    pub fn separated(
        separated_key: &[u8; sizes::PUBLIC_KEY],
        primary_key: &[u8; sizes::PUBLIC_KEY],
        status: u8,
    ) -> Self {
        let mut payload = Vec::with_capacity(31);
        payload.push(0x1E);
        payload.push(AD_TYPE_MANUFACTURER);
        payload.extend_from_slice(&COMPANY_ID.to_le_bytes());
        payload.push(PAYLOAD_TYPE);
        payload.push(SEPARATED_KEY_LEN);
        payload.push(status);
        payload.extend_from_slice(&separated_key[ADDRESS_LEN..]);
        payload.push(separated_key[0] >> 6);
        payload.push(primary_key[5]);
        Self {
            address: Some(random_static_address(separated_key)),
            payload,
            interval: interval::SEPARATED,
        }
    }

    /// Recover the full 28-byte key from a separated advertisement.
    pub fn separated_key(&self) -> Option<[u8; sizes::PUBLIC_KEY]> {
        let addr = self.address?;
        if self.payload.len() != 31 || self.payload[5] != SEPARATED_KEY_LEN {
            return None;
        }
        let mut key = [0u8; sizes::PUBLIC_KEY];
        key[..ADDRESS_LEN].copy_from_slice(&addr);
        key[0] = (addr[0] & 0b0011_1111) | (self.payload[29] << 6);
        key[ADDRESS_LEN..].copy_from_slice(&self.payload[7..29]);
        Some(key)
    }
}
