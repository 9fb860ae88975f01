//! Seams between the accessory core and its surroundings.
//!
//! The core never talks to a radio or a clock directly. Every side effect
//! goes through [`BleHost`] and [`TimerHost`], and every application-facing
//! notification goes through [`AccessoryCallbacks`]. Implementations are
//! injected when the accessory is constructed.

use std::time::Duration;

use fmn_proto::adv::Advertisement;
use fmn_proto::Frame;

use crate::conn::ConnHandle;
use crate::timer::TimerId;
use crate::AccessoryState;

/// GATT control point a frame was written to or is indicated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlPoint {
    Pairing,
    Configuration,
}

/// BLE stack operations used by the core.
pub trait BleHost: Send {
    /// Replace whatever is currently on air.
    fn start_advertising(&mut self, adv: &Advertisement);
    fn stop_advertising(&mut self);
    fn disconnect(&mut self, conn: ConnHandle);
    /// Remove the link-layer bond for `conn`.
    fn remove_bond(&mut self, conn: ConnHandle);
    fn indicate(&mut self, conn: ConnHandle, point: ControlPoint, frame: &Frame);
    /// Key the stack should offer when an owner re-encrypts the link.
    fn set_long_term_key(&mut self, ltk: &[u8; 16]);
}

/// Deferred expiry delivery.
///
/// After `after`, the host must feed `(id, generation)` back through
/// [`crate::Accessory::handle_timer`]. Cancellation is best effort; stale
/// expiries are filtered by the core.
pub trait TimerHost: Send {
    fn arm_timer(&mut self, id: TimerId, generation: u64, after: Duration);
    fn cancel_timer(&mut self, _id: TimerId) {}
}

/// Application hooks. All methods default to no-ops.
pub trait AccessoryCallbacks: Send {
    fn state_changed(&mut self, _from: AccessoryState, _to: AccessoryState) {}
    fn pairing_completed(&mut self) {}
    fn pairing_failed(&mut self) {}
    fn sound_start(&mut self) {}
    fn sound_stop(&mut self) {}
    fn unpaired(&mut self) {}
}

/// Callbacks that ignore everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl AccessoryCallbacks for NoopCallbacks {}
