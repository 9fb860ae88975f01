//! Per-connection bookkeeping.
//!
//! Records live in a fixed table. A disconnect only marks its record; the
//! record is removed by a later [`ConnectionTable::sweep`] so that a burst of
//! disconnect events is observed in one consistent pass.

use bitflags::bitflags;
use fmn_proto::fragment::Reassembler;

use crate::host::ControlPoint;

/// Hard upper bound on simultaneous links.
pub const MAX_CONNECTIONS: usize = 20;

pub type ConnHandle = u16;

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MultiStatus: u8 {
        const PLAYING_SOUND = 1 << 0;
        const UPDATING_FIRMWARE = 1 << 1;
        const OWNER_CONNECTED = 1 << 2;
        const MULTIPLE_OWNERS = 1 << 3;
        const PERSISTENT_CONNECTION = 1 << 4;
    }
}

/// Link security as reported by the BLE stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SecurityLevel {
    #[default]
    Open,
    /// Encrypted with a key we derived (an owner's LTK).
    Encrypted,
    /// Encrypted and authenticated (fresh pairing).
    Authenticated,
}

#[derive(Debug)]
pub struct ConnectionRecord {
    pub handle: ConnHandle,
    pub status: MultiStatus,
    pub security: SecurityLevel,
    pub is_disconnecting: bool,
    pairing_rx: Reassembler,
    config_rx: Reassembler,
}

impl ConnectionRecord {
    fn new(handle: ConnHandle) -> Self {
        Self {
            handle,
            status: MultiStatus::empty(),
            security: SecurityLevel::Open,
            is_disconnecting: false,
            pairing_rx: Reassembler::default(),
            config_rx: Reassembler::default(),
        }
    }

    pub fn is_owner(&self) -> bool {
        self.status.contains(MultiStatus::OWNER_CONNECTED)
    }

    pub fn reassembler(&mut self, point: ControlPoint) -> &mut Reassembler {
        match point {
            ControlPoint::Pairing => &mut self.pairing_rx,
            ControlPoint::Configuration => &mut self.config_rx,
        }
    }
}

pub struct ConnectionTable {
    slots: [Option<ConnectionRecord>; MAX_CONNECTIONS],
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }
}

impl ConnectionTable {
    /// Add a record. Returns `false` if the table is full or the handle is
    /// already present.
    pub fn insert(&mut self, handle: ConnHandle) -> bool {
        if self.get(handle).is_some() {
            return false;
        }
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(ConnectionRecord::new(handle));
                true
            }
            None => false,
        }
    }

    pub fn get(&self, handle: ConnHandle) -> Option<&ConnectionRecord> {
        self.iter().find(|r| r.handle == handle)
    }

    pub fn get_mut(&mut self, handle: ConnHandle) -> Option<&mut ConnectionRecord> {
        self.slots.iter_mut().flatten().find(|r| r.handle == handle)
    }

    /// Live (not disconnecting) record.
    pub fn active(&self, handle: ConnHandle) -> Option<&ConnectionRecord> {
        self.get(handle).filter(|r| !r.is_disconnecting)
    }

    pub fn active_mut(&mut self, handle: ConnHandle) -> Option<&mut ConnectionRecord> {
        self.get_mut(handle).filter(|r| !r.is_disconnecting)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.slots.iter().flatten()
    }

    pub fn active_handles(&self) -> Vec<ConnHandle> {
        self.iter()
            .filter(|r| !r.is_disconnecting)
            .map(|r| r.handle)
            .collect()
    }

    pub fn owner_handles(&self) -> Vec<ConnHandle> {
        self.iter()
            .filter(|r| !r.is_disconnecting && r.is_owner())
            .map(|r| r.handle)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.iter().filter(|r| !r.is_disconnecting).count()
    }

    pub fn owner_count(&self) -> usize {
        self.iter().filter(|r| !r.is_disconnecting && r.is_owner()).count()
    }

    /// Mark a record as going away. Returns its status if it was live.
    pub fn mark_disconnecting(&mut self, handle: ConnHandle) -> Option<MultiStatus> {
        let record = self.active_mut(handle)?;
        record.is_disconnecting = true;
        Some(record.status)
    }

    /// Drop every record marked as disconnecting.
    pub fn sweep(&mut self) -> usize {
        let mut removed = 0;
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|r| r.is_disconnecting) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    /// Status bits reported to `handle` by GetMultiStatus.
    pub fn multi_status(&self, handle: ConnHandle) -> MultiStatus {
        let mut status = self.get(handle).map(|r| r.status).unwrap_or_default();
        // Sound state is accessory-wide.
        if self.iter().any(|r| r.status.contains(MultiStatus::PLAYING_SOUND)) {
            status |= MultiStatus::PLAYING_SOUND;
        }
        if self.owner_count() > 1 {
            status |= MultiStatus::MULTIPLE_OWNERS;
        }
        status
    }
}
