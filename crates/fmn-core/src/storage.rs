//! Persistent key-value storage for pairing and rotation state.
//!
//! The storage engine is outside the core; it only has to provide atomic
//! load/save/delete by small integer key. Two implementations ship here:
//! [`InMemoryStorage`] for tests and [`FileStorage`] (one file per key,
//! replaced atomically via rename).

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("stored value for {key:?} has length {actual}, expected {expected}")]
    Corrupt {
        key: StorageKey,
        expected: usize,
        actual: usize,
    },

    #[error("value for {key:?} has length {actual}, expected {expected}")]
    InvalidLength {
        key: StorageKey,
        expected: usize,
        actual: usize,
    },

    #[error("stored value {value} for {key:?} is out of range")]
    OutOfRange { key: StorageKey, value: u64 },

    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

// ============================================================================
// Keys
// ============================================================================

/// Size of a [`StorageKey::PendingCheckpoint`] record.
pub const CHECKPOINT_RECORD_LEN: usize = 32 + 32 + 4 + 4 + 4;

/// Persisted entries and their fixed sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    MasterPublicKey,
    PrimarySk,
    SecondarySk,
    PrimaryKeyIndex,
    KeysIndexDiff,
    ServerSharedSecret,
    SnQueryCounter,
    IcloudId,
    /// Secondary rotation count (u32 LE) || secondary rotation delta (u32 LE).
    SecondaryKeyState,
    /// Journal of a checkpoint being written: primary sk || secondary sk ||
    /// primary index || secondary index || secondary delta (u32s LE).
    PendingCheckpoint,
    SoftwareAuthUuid,
    SoftwareAuthToken,
    SerialNumber,
}

impl StorageKey {
    /// Everything a pairing creates. Deleted on unpair and factory reset.
    pub const PAIRING_KEYS: [StorageKey; 10] = [
        StorageKey::MasterPublicKey,
        StorageKey::PrimarySk,
        StorageKey::SecondarySk,
        StorageKey::PrimaryKeyIndex,
        StorageKey::KeysIndexDiff,
        StorageKey::ServerSharedSecret,
        StorageKey::SnQueryCounter,
        StorageKey::IcloudId,
        StorageKey::SecondaryKeyState,
        StorageKey::PendingCheckpoint,
    ];

    pub fn id(self) -> u16 {
        match self {
            StorageKey::MasterPublicKey => 0,
            StorageKey::PrimarySk => 1,
            StorageKey::SecondarySk => 2,
            StorageKey::PrimaryKeyIndex => 3,
            StorageKey::KeysIndexDiff => 4,
            StorageKey::ServerSharedSecret => 5,
            StorageKey::SnQueryCounter => 6,
            StorageKey::IcloudId => 7,
            StorageKey::SecondaryKeyState => 8,
            StorageKey::PendingCheckpoint => 9,
            StorageKey::SoftwareAuthUuid => 997,
            StorageKey::SoftwareAuthToken => 998,
            StorageKey::SerialNumber => 999,
        }
    }

    pub fn size(self) -> usize {
        match self {
            StorageKey::MasterPublicKey => 57,
            StorageKey::PrimarySk | StorageKey::SecondarySk => 32,
            StorageKey::PrimaryKeyIndex => 4,
            StorageKey::KeysIndexDiff => 2,
            StorageKey::ServerSharedSecret => 32,
            StorageKey::SnQueryCounter => 8,
            StorageKey::IcloudId => 60,
            StorageKey::SecondaryKeyState => 8,
            StorageKey::PendingCheckpoint => CHECKPOINT_RECORD_LEN,
            StorageKey::SoftwareAuthUuid => 16,
            StorageKey::SoftwareAuthToken => 1024,
            StorageKey::SerialNumber => 16,
        }
    }
}

// ============================================================================
// Storage trait
// ============================================================================

/// Atomic key-value persistence.
///
/// Implementations must make `save` all-or-nothing per key. Values are
/// length-checked against [`StorageKey::size`] on both paths.
pub trait Storage: Send {
    fn load(&self, key: StorageKey) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError>;
    fn save(&mut self, key: StorageKey, value: &[u8]) -> Result<(), StorageError>;
    fn delete(&mut self, key: StorageKey) -> Result<(), StorageError>;

    /// Load a value of exactly `N` bytes.
    fn load_array<const N: usize>(
        &self,
        key: StorageKey,
    ) -> Result<Option<Zeroizing<[u8; N]>>, StorageError>
    where
        Self: Sized,
    {
        let Some(raw) = self.load(key)? else {
            return Ok(None);
        };
        if raw.len() != N {
            return Err(StorageError::Corrupt {
                key,
                expected: N,
                actual: raw.len(),
            });
        }
        let mut out = Zeroizing::new([0u8; N]);
        out.copy_from_slice(&raw);
        Ok(Some(out))
    }

    fn load_u16(&self, key: StorageKey) -> Result<Option<u16>, StorageError>
    where
        Self: Sized,
    {
        Ok(self.load_array::<2>(key)?.map(|b| u16::from_le_bytes(*b)))
    }

    fn load_u32(&self, key: StorageKey) -> Result<Option<u32>, StorageError>
    where
        Self: Sized,
    {
        Ok(self.load_array::<4>(key)?.map(|b| u32::from_le_bytes(*b)))
    }

    fn load_u64(&self, key: StorageKey) -> Result<Option<u64>, StorageError>
    where
        Self: Sized,
    {
        Ok(self.load_array::<8>(key)?.map(|b| u64::from_le_bytes(*b)))
    }

    /// Delete every pairing-derived entry. Stops at the first failure.
    fn delete_pairing_data(&mut self) -> Result<(), StorageError>
    where
        Self: Sized,
    {
        for key in StorageKey::PAIRING_KEYS {
            self.delete(key)?;
        }
        Ok(())
    }
}

fn check_len(key: StorageKey, value: &[u8]) -> Result<(), StorageError> {
    if value.len() != key.size() {
        return Err(StorageError::InvalidLength {
            key,
            expected: key.size(),
            actual: value.len(),
        });
    }
    Ok(())
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    values: HashMap<StorageKey, Zeroizing<Vec<u8>>>,
    fail_writes: bool,
    writes: usize,
}

/// In-memory storage. Clones share the same map, so a test can keep a handle
/// after moving one into an accessory.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryInner) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Make every subsequent save/delete fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.with(|inner| inner.fail_writes = fail);
    }

    /// Number of successful saves and deletes so far.
    pub fn write_count(&self) -> usize {
        self.with(|inner| inner.writes)
    }

    pub fn contains(&self, key: StorageKey) -> bool {
        self.with(|inner| inner.values.contains_key(&key))
    }
}

impl Storage for InMemoryStorage {
    fn load(&self, key: StorageKey) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        Ok(self.with(|inner| inner.values.get(&key).cloned()))
    }

    fn save(&mut self, key: StorageKey, value: &[u8]) -> Result<(), StorageError> {
        check_len(key, value)?;
        self.with(|inner| {
            if inner.fail_writes {
                return Err(StorageError::OperationFailed("injected write failure".to_string()));
            }
            inner.values.insert(key, Zeroizing::new(value.to_vec()));
            inner.writes += 1;
            Ok(())
        })
    }

    fn delete(&mut self, key: StorageKey) -> Result<(), StorageError> {
        self.with(|inner| {
            if inner.fail_writes {
                return Err(StorageError::OperationFailed("injected write failure".to_string()));
            }
            inner.values.remove(&key);
            inner.writes += 1;
            Ok(())
        })
    }
}

// ============================================================================
// File-backed implementation
// ============================================================================

/// One file per key inside `dir`, written via temp file + rename.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err)?;
        Ok(Self { dir })
    }

    fn path(&self, key: StorageKey) -> PathBuf {
        self.dir.join(format!("{}.bin", key.id()))
    }
}

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::OperationFailed(e.to_string())
}

impl Storage for FileStorage {
    fn load(&self, key: StorageKey) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        match fs::read(self.path(key)) {
            Ok(bytes) => {
                let bytes = Zeroizing::new(bytes);
                if bytes.len() != key.size() {
                    return Err(StorageError::Corrupt {
                        key,
                        expected: key.size(),
                        actual: bytes.len(),
                    });
                }
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    fn save(&mut self, key: StorageKey, value: &[u8]) -> Result<(), StorageError> {
        check_len(key, value)?;
        let path = self.path(key);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(value).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, &path).map_err(io_err)?;
        debug!(key = key.id(), "persisted");
        Ok(())
    }

    fn delete(&mut self, key: StorageKey) -> Result<(), StorageError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }
}
