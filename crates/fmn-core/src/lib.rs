//! FMN Core - protocol state for a Find My network accessory.
//!
//! This crate implements:
//! - The pairing handshake state machine (single session, accessory side)
//! - Rotating key schedule with checkpointed persistence
//! - The accessory state machine and advertising selection
//! - Owner configuration commands and serial number protection
//! - Persistent storage abstraction
//! - A serialized tokio service wrapping all of the above

#![forbid(unsafe_code)]

// Core state machines
pub mod accessory;
pub mod pairing;
pub mod keys;

// Services
pub mod serial_number;
pub mod service;

// Infrastructure
pub mod conn;
pub mod host;
pub mod storage;
pub mod timer;

// Supporting modules
pub mod config;
pub mod errors;
#[cfg(any(test, feature = "test-harness"))]
pub mod harness;

#[cfg(test)]
mod proptests;

pub use accessory::{Accessory, AccessoryState};
pub use config::AccessoryConfig;
pub use conn::{ConnHandle, SecurityLevel};
pub use errors::FmnError;
pub use host::{AccessoryCallbacks, BleHost, ControlPoint, NoopCallbacks, TimerHost};
pub use keys::{KeyReader, KeySnapshot};
pub use service::{AccessoryHandle, AccessoryService};
pub use storage::{FileStorage, InMemoryStorage, Storage, StorageKey};
