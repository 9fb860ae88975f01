//! Generation-tagged timer bookkeeping.
//!
//! The accessory never blocks on a timer. It asks the host to deliver an
//! expiry for `(id, generation)` later, and keeps the generation it expects
//! here. An expiry whose generation no longer matches was cancelled or
//! re-armed in the meantime and is dropped, which makes cancellation
//! idempotent and race free.

use std::collections::HashMap;

use crate::conn::ConnHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Pairing-mode advertising window.
    PairingMode,
    /// Nearby -> Separated transition.
    NearbySeparated,
    /// Primary key rotation period.
    KeyRotation,
    /// Fast advertising after a persistent-connection owner drops.
    PersistentFastAdvertising,
    /// Per-connection security upgrade deadline.
    Security(ConnHandle),
}

#[derive(Debug, Default)]
pub struct Timers {
    armed: HashMap<TimerId, u64>,
    next_generation: u64,
}

impl Timers {
    /// Arm (or re-arm) `id` and return the generation to hand to the host.
    pub fn arm(&mut self, id: TimerId) -> u64 {
        self.next_generation = self.next_generation.wrapping_add(1);
        self.armed.insert(id, self.next_generation);
        self.next_generation
    }

    /// Returns true if the timer was armed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.armed.remove(&id).is_some()
    }

    /// Consume an expiry. Returns false for stale or cancelled expiries.
    pub fn accept(&mut self, id: TimerId, generation: u64) -> bool {
        if self.armed.get(&id) == Some(&generation) {
            self.armed.remove(&id);
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.armed.contains_key(&id)
    }

    /// Drop every timer, returning the ids that were armed.
    pub fn cancel_all(&mut self) -> Vec<TimerId> {
        self.armed.drain().map(|(id, _)| id).collect()
    }
}
