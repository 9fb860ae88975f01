//! Key rotation service.
//!
//! Primary keys roll every period. Secondary keys roll once per 96 primary
//! periods, at a phase the owner can move with "configure separated state".
//! Full key material is checkpointed every [`STORAGE_UPDATE_PERIOD`]
//! rotations; in between only a 2-byte index diff is written, and a restore
//! replays the KDF chain forward from the checkpoint. A checkpoint spans
//! several entries, so it is journaled in one record first and the journal
//! is removed only after every entry landed.
//!
//! Readers never see a half-rolled state: every committed state is published
//! as an immutable [`KeySnapshot`] swapped in under a lock.

use std::sync::{Arc, RwLock};

use fmn_crypto::ckg::CkgOutput;
use fmn_crypto::keys::{derive_ltk, derive_rotating_public_key, roll_symmetric_key};
use fmn_proto::validation::sizes;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::errors::FmnError;
use crate::storage::{Storage, StorageError, StorageKey, CHECKPOINT_RECORD_LEN};

pub const PRIMARY_KEYS_PER_SECONDARY_KEY: u32 = 96;
pub const STORAGE_UPDATE_PERIOD: u32 = 16;

type PublicKey = [u8; sizes::PUBLIC_KEY];

// ============================================================================
// Snapshots
// ============================================================================

/// Immutable view of the keys for one primary period.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeySnapshot {
    pub primary_index: u32,
    pub secondary_index: u32,
    pub primary_key: PublicKey,
    pub secondary_key: PublicKey,
    /// Primary key frozen by a latch request, with its index.
    #[zeroize(skip)]
    pub latched: Option<(u32, PublicKey)>,
    pub ltk: [u8; sizes::LTK],
}

impl KeySnapshot {
    /// Key advertised while separated.
    pub fn separated_key(&self) -> &PublicKey {
        match &self.latched {
            Some((_, key)) => key,
            None => &self.secondary_key,
        }
    }
}

impl std::fmt::Debug for KeySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySnapshot")
            .field("primary_index", &self.primary_index)
            .field("secondary_index", &self.secondary_index)
            .field("primary_key", &hex::encode(self.primary_key))
            .field("latched", &self.latched.as_ref().map(|(i, _)| *i))
            .finish_non_exhaustive()
    }
}

/// Cloneable read handle onto the current snapshot.
#[derive(Clone, Default)]
pub struct KeyReader {
    current: Arc<RwLock<Option<Arc<KeySnapshot>>>>,
}

impl KeyReader {
    pub fn current(&self) -> Option<Arc<KeySnapshot>> {
        let guard = self.current.read().unwrap_or_else(|p| p.into_inner());
        guard.clone()
    }

    pub fn primary_key(&self) -> Option<PublicKey> {
        self.current().map(|s| s.primary_key)
    }

    pub fn separated_key(&self) -> Option<PublicKey> {
        self.current().map(|s| *s.separated_key())
    }

    fn publish(&self, snapshot: Option<Arc<KeySnapshot>>) {
        let mut guard = self.current.write().unwrap_or_else(|p| p.into_inner());
        *guard = snapshot;
    }
}

// ============================================================================
// Rotating state
// ============================================================================

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct RotatingKeyState {
    #[zeroize(skip)]
    master_public_key: [u8; sizes::MASTER_PUBLIC_KEY],
    primary_sk: [u8; sizes::SYMMETRIC_KEY],
    secondary_sk: [u8; sizes::SYMMETRIC_KEY],
    primary_index: u32,
    secondary_index: u32,
    secondary_delta: u32,
    checkpoint_index: u32,
    /// Restored from a journal; the next write must be a full checkpoint.
    checkpoint_pending: bool,
    #[zeroize(skip)]
    latched: Option<(u32, PublicKey)>,
}

/// Whether entering `primary_index` rolls the secondary key.
///
/// The secondary normally rolls when `primary_index` hits the configured
/// phase, but is held to `ceil(primary_index / 96)` rolls at most and forced
/// when it falls more than one epoch behind, so a moved phase can never
/// break the lag bound.
pub fn secondary_rolls_at(primary_index: u32, secondary_index: u32, delta: u32) -> bool {
    let expected = primary_index.div_ceil(PRIMARY_KEYS_PER_SECONDARY_KEY);
    if secondary_index.saturating_add(1) < expected {
        return true;
    }
    secondary_index < expected
        && primary_index % PRIMARY_KEYS_PER_SECONDARY_KEY
            == (delta + 1) % PRIMARY_KEYS_PER_SECONDARY_KEY
}

impl RotatingKeyState {
    fn advance(&self) -> Result<(Self, bool), FmnError> {
        let mut next = self.clone();
        next.primary_index = self
            .primary_index
            .checked_add(1)
            .ok_or_else(|| FmnError::state("primary key index exhausted"))?;
        next.primary_sk = *roll_symmetric_key(&self.primary_sk)?;

        let rolled = secondary_rolls_at(next.primary_index, self.secondary_index, self.secondary_delta);
        if rolled {
            next.secondary_sk = *roll_symmetric_key(&self.secondary_sk)?;
            next.secondary_index += 1;
            next.latched = None;
        }
        Ok((next, rolled))
    }

    fn snapshot(&self) -> Result<KeySnapshot, FmnError> {
        Ok(KeySnapshot {
            primary_index: self.primary_index,
            secondary_index: self.secondary_index,
            primary_key: derive_rotating_public_key(&self.primary_sk, &self.master_public_key)?,
            secondary_key: derive_rotating_public_key(&self.secondary_sk, &self.master_public_key)?,
            latched: self.latched,
            ltk: *derive_ltk(&self.primary_sk)?,
        })
    }

    fn index_diff(&self) -> u32 {
        self.primary_index - self.checkpoint_index
    }

    fn secondary_record(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.secondary_index.to_le_bytes());
        out[4..].copy_from_slice(&self.secondary_delta.to_le_bytes());
        out
    }

    fn checkpoint_record(&self) -> Zeroizing<[u8; CHECKPOINT_RECORD_LEN]> {
        let mut out = Zeroizing::new([0u8; CHECKPOINT_RECORD_LEN]);
        out[..32].copy_from_slice(&self.primary_sk);
        out[32..64].copy_from_slice(&self.secondary_sk);
        out[64..68].copy_from_slice(&self.primary_index.to_le_bytes());
        out[68..].copy_from_slice(&self.secondary_record());
        out
    }

    fn from_checkpoint_record(
        master_public_key: [u8; sizes::MASTER_PUBLIC_KEY],
        record: &[u8; CHECKPOINT_RECORD_LEN],
    ) -> Self {
        let mut primary_sk = [0u8; sizes::SYMMETRIC_KEY];
        let mut secondary_sk = [0u8; sizes::SYMMETRIC_KEY];
        primary_sk.copy_from_slice(&record[..32]);
        secondary_sk.copy_from_slice(&record[32..64]);
        let word = |at: usize| u32::from_le_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]]);
        let primary_index = word(64);
        Self {
            master_public_key,
            primary_sk,
            secondary_sk,
            primary_index,
            secondary_index: word(68),
            secondary_delta: word(72),
            checkpoint_index: primary_index,
            checkpoint_pending: true,
            latched: None,
        }
    }

    /// Write this state, as a checkpoint if due or forced. Updates
    /// `checkpoint_index` only after every write succeeded.
    fn persist<S: Storage>(&mut self, storage: &mut S, force_checkpoint: bool) -> Result<(), FmnError> {
        if force_checkpoint || self.checkpoint_pending || self.index_diff() >= STORAGE_UPDATE_PERIOD {
            self.write_checkpoint(storage)?;
        } else {
            let diff = self.index_diff() as u16;
            storage.save(StorageKey::KeysIndexDiff, &diff.to_le_bytes())?;
        }
        Ok(())
    }

    /// While the journal exists a restore trusts it over the individual
    /// entries, so a failure at any step leaves either the previous
    /// checkpoint or the complete new one readable.
    fn write_checkpoint<S: Storage>(&mut self, storage: &mut S) -> Result<(), FmnError> {
        storage.save(StorageKey::PendingCheckpoint, self.checkpoint_record().as_slice())?;
        storage.save(StorageKey::PrimarySk, &self.primary_sk)?;
        storage.save(StorageKey::SecondarySk, &self.secondary_sk)?;
        storage.save(StorageKey::PrimaryKeyIndex, &self.primary_index.to_le_bytes())?;
        storage.save(StorageKey::SecondaryKeyState, &self.secondary_record())?;
        storage.save(StorageKey::KeysIndexDiff, &0u16.to_le_bytes())?;
        storage.delete(StorageKey::PendingCheckpoint)?;
        self.checkpoint_index = self.primary_index;
        self.checkpoint_pending = false;
        debug!(index = self.primary_index, "key checkpoint written");
        Ok(())
    }
}

/// Outcome of one primary rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    pub primary_index: u32,
    pub secondary_rolled: bool,
}

// ============================================================================
// Service
// ============================================================================

#[derive(Default)]
pub struct KeyRotationService {
    state: Option<RotatingKeyState>,
    reader: KeyReader,
}

impl KeyRotationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reader(&self) -> KeyReader {
        self.reader.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    pub fn snapshot(&self) -> Option<Arc<KeySnapshot>> {
        self.reader.current()
    }

    fn running(&self) -> Result<&RotatingKeyState, FmnError> {
        self.state
            .as_ref()
            .ok_or_else(|| FmnError::state("key rotation is not running"))
    }

    fn commit(&mut self, state: RotatingKeyState, snapshot: KeySnapshot) {
        self.state = Some(state);
        self.reader.publish(Some(Arc::new(snapshot)));
    }

    /// Begin rotation from freshly agreed pairing keys. Index 0 is persisted
    /// as the first checkpoint, then the keys roll to index 1.
    pub fn start<S: Storage>(&mut self, storage: &mut S, keys: &CkgOutput) -> Result<Rotation, FmnError> {
        let mut initial = RotatingKeyState {
            master_public_key: keys.master_public_key,
            primary_sk: keys.primary_sk,
            secondary_sk: keys.secondary_sk,
            primary_index: 0,
            secondary_index: 0,
            secondary_delta: 0,
            checkpoint_index: 0,
            checkpoint_pending: false,
            latched: None,
        };
        storage.save(StorageKey::MasterPublicKey, &initial.master_public_key)?;
        initial.persist(storage, true)?;

        let (mut next, secondary_rolled) = initial.advance()?;
        let snapshot = next.snapshot()?;
        next.persist(storage, false)?;
        self.commit(next, snapshot);
        info!("key rotation started");
        Ok(Rotation {
            primary_index: 1,
            secondary_rolled,
        })
    }

    /// Rebuild state from storage. Returns `false` if nothing is paired.
    pub fn restore<S: Storage>(&mut self, storage: &S) -> Result<bool, FmnError> {
        let Some(master) = storage.load_array::<{ sizes::MASTER_PUBLIC_KEY }>(StorageKey::MasterPublicKey)? else {
            return Ok(false);
        };
        if let Some(record) = storage.load_array::<CHECKPOINT_RECORD_LEN>(StorageKey::PendingCheckpoint)? {
            let state = RotatingKeyState::from_checkpoint_record(*master, &record);
            let snapshot = state.snapshot()?;
            info!(
                index = state.primary_index,
                "key rotation restored from interrupted checkpoint"
            );
            self.commit(state, snapshot);
            return Ok(true);
        }

        let missing = |key: StorageKey| {
            FmnError::Storage(StorageError::Corrupt {
                key,
                expected: key.size(),
                actual: 0,
            })
        };
        let primary_sk = storage
            .load_array::<{ sizes::SYMMETRIC_KEY }>(StorageKey::PrimarySk)?
            .ok_or_else(|| missing(StorageKey::PrimarySk))?;
        let secondary_sk = storage
            .load_array::<{ sizes::SYMMETRIC_KEY }>(StorageKey::SecondarySk)?
            .ok_or_else(|| missing(StorageKey::SecondarySk))?;
        let checkpoint_index = storage
            .load_u32(StorageKey::PrimaryKeyIndex)?
            .ok_or_else(|| missing(StorageKey::PrimaryKeyIndex))?;
        let secondary = storage
            .load_array::<8>(StorageKey::SecondaryKeyState)?
            .ok_or_else(|| missing(StorageKey::SecondaryKeyState))?;
        let diff = storage.load_u16(StorageKey::KeysIndexDiff)?.unwrap_or(0);
        if u32::from(diff) >= STORAGE_UPDATE_PERIOD {
            return Err(FmnError::Storage(StorageError::OutOfRange {
                key: StorageKey::KeysIndexDiff,
                value: u64::from(diff),
            }));
        }

        let mut state = RotatingKeyState {
            master_public_key: *master,
            primary_sk: *primary_sk,
            secondary_sk: *secondary_sk,
            primary_index: checkpoint_index,
            secondary_index: u32::from_le_bytes([secondary[0], secondary[1], secondary[2], secondary[3]]),
            secondary_delta: u32::from_le_bytes([secondary[4], secondary[5], secondary[6], secondary[7]]),
            checkpoint_index,
            checkpoint_pending: false,
            latched: None,
        };
        for _ in 0..diff {
            state = state.advance()?.0;
        }
        let snapshot = state.snapshot()?;
        info!(
            index = state.primary_index,
            replayed = diff,
            "key rotation restored from checkpoint"
        );
        self.commit(state, snapshot);
        Ok(true)
    }

    /// Roll to the next primary period. On failure nothing changes and the
    /// caller retries at the next tick.
    pub fn rotate<S: Storage>(&mut self, storage: &mut S) -> Result<Rotation, FmnError> {
        let (mut next, secondary_rolled) = self.running()?.advance()?;
        let snapshot = next.snapshot()?;
        next.persist(storage, false)?;
        let primary_index = next.primary_index;
        self.commit(next, snapshot);
        debug!(index = primary_index, secondary_rolled, "primary key rotated");
        Ok(Rotation {
            primary_index,
            secondary_rolled,
        })
    }

    /// Move the secondary phase so that the next secondary roll happens when
    /// the primary index reaches `evaluation_index`.
    pub fn configure_separated_state<S: Storage>(
        &mut self,
        storage: &mut S,
        evaluation_index: u32,
    ) -> Result<(), FmnError> {
        let current = self.running()?;
        let lo = current.primary_index;
        let hi = lo.saturating_add(PRIMARY_KEYS_PER_SECONDARY_KEY);
        if evaluation_index <= lo || evaluation_index > hi {
            return Err(FmnError::InvalidInput(format!(
                "secondary evaluation index {evaluation_index} outside ({lo}, {hi}]"
            )));
        }
        let mut next = current.clone();
        next.secondary_delta = (evaluation_index - 1) % PRIMARY_KEYS_PER_SECONDARY_KEY;
        next.persist(storage, true)?;
        let snapshot = next.snapshot()?;
        debug!(delta = next.secondary_delta, "secondary key phase moved");
        self.commit(next, snapshot);
        Ok(())
    }

    /// Freeze the current primary key as the separated key until the next
    /// secondary roll. Returns the latched primary index.
    pub fn latch(&mut self) -> Result<u32, FmnError> {
        let current = self.running()?;
        if let Some((index, _)) = current.latched {
            return Ok(index);
        }
        let snapshot = self
            .snapshot()
            .ok_or_else(|| FmnError::state("no key snapshot"))?;
        let mut next = current.clone();
        next.latched = Some((snapshot.primary_index, snapshot.primary_key));
        let index = snapshot.primary_index;
        let mut updated = (*snapshot).clone();
        updated.latched = next.latched;
        info!(index, "separated key latched");
        self.commit(next, updated);
        Ok(index)
    }

    /// Forget all key state. Storage is left to the caller.
    pub fn stop(&mut self) {
        if self.state.take().is_some() {
            info!("key rotation stopped");
        }
        self.reader.publish(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    /// Lets `budget` writes through, then fails every save and delete.
    struct FailAfter {
        inner: InMemoryStorage,
        budget: usize,
    }

    impl FailAfter {
        fn spend(&mut self) -> Result<(), StorageError> {
            if self.budget == 0 {
                return Err(StorageError::OperationFailed("write budget spent".to_string()));
            }
            self.budget -= 1;
            Ok(())
        }
    }

    impl Storage for FailAfter {
        fn load(&self, key: StorageKey) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
            self.inner.load(key)
        }

        fn save(&mut self, key: StorageKey, value: &[u8]) -> Result<(), StorageError> {
            self.spend()?;
            self.inner.save(key, value)
        }

        fn delete(&mut self, key: StorageKey) -> Result<(), StorageError> {
            self.spend()?;
            self.inner.delete(key)
        }
    }

    /// Snapshots for primary indices 1..=17 from an undisturbed run.
    fn reference_chain(keys: &CkgOutput) -> Vec<Arc<KeySnapshot>> {
        let mut storage = InMemoryStorage::new();
        let mut svc = KeyRotationService::new();
        svc.start(&mut storage, keys).unwrap();
        let mut chain = vec![svc.snapshot().unwrap()];
        for _ in 0..16 {
            svc.rotate(&mut storage).unwrap();
            chain.push(svc.snapshot().unwrap());
        }
        chain
    }

    fn test_keys() -> CkgOutput {
        use fmn_crypto::ckg::{CkgContext, OwnerCkg};
        use rand_chacha::rand_core::SeedableRng;

        let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(5);
        let mut ctx = CkgContext::init(&mut rng).unwrap();
        let (_, c2) = OwnerCkg::respond(&mut rng, &ctx.gen_c1()).unwrap();
        ctx.gen_c3(&c2).unwrap();
        ctx.finish().unwrap()
    }

    #[test]
    fn test_start_rolls_to_index_one() {
        let mut storage = InMemoryStorage::new();
        let mut svc = KeyRotationService::new();
        let keys = test_keys();
        let rotation = svc.start(&mut storage, &keys).unwrap();
        assert_eq!(rotation, Rotation { primary_index: 1, secondary_rolled: true });

        let snap = svc.snapshot().unwrap();
        let sk1 = roll_symmetric_key(&keys.primary_sk).unwrap();
        assert_eq!(snap.primary_key, derive_rotating_public_key(&sk1, &keys.master_public_key).unwrap());
        assert_eq!(snap.ltk, *derive_ltk(&sk1).unwrap());
        assert_eq!(snap.secondary_index, 1);
        assert_eq!(storage.load_u16(StorageKey::KeysIndexDiff).unwrap(), Some(1));
        assert_eq!(storage.load_u32(StorageKey::PrimaryKeyIndex).unwrap(), Some(0));
    }

    #[test]
    fn test_checkpoint_every_sixteen_rotations() {
        let mut storage = InMemoryStorage::new();
        let mut svc = KeyRotationService::new();
        svc.start(&mut storage, &test_keys()).unwrap();
        for _ in 1..16 {
            svc.rotate(&mut storage).unwrap();
        }
        assert_eq!(storage.load_u32(StorageKey::PrimaryKeyIndex).unwrap(), Some(16));
        assert_eq!(storage.load_u16(StorageKey::KeysIndexDiff).unwrap(), Some(0));
        assert!(!storage.contains(StorageKey::PendingCheckpoint));
        svc.rotate(&mut storage).unwrap();
        assert_eq!(storage.load_u16(StorageKey::KeysIndexDiff).unwrap(), Some(1));
    }

    #[test]
    fn test_interrupted_checkpoint_never_mislabels_keys() {
        let keys = test_keys();
        let chain = reference_chain(&keys);
        let at = |index: u32| chain[index as usize - 1].clone();

        // The checkpoint at index 16 takes seven writes.
        for allowed in 0..=7 {
            let storage = InMemoryStorage::new();
            let mut writer = FailAfter {
                inner: storage.clone(),
                budget: usize::MAX,
            };
            let mut running = KeyRotationService::new();
            running.start(&mut writer, &keys).unwrap();
            for _ in 1..15 {
                running.rotate(&mut writer).unwrap();
            }
            assert_eq!(running.snapshot().unwrap().primary_index, 15);

            writer.budget = allowed;
            let result = running.rotate(&mut writer);
            assert_eq!(result.is_ok(), allowed == 7, "allowed {allowed}");

            let mut restored = KeyRotationService::new();
            assert!(restored.restore(&storage).unwrap());
            let snap = restored.snapshot().unwrap();
            assert!(
                snap.primary_index == 15 || snap.primary_index == 16,
                "allowed {allowed}: restored index {}",
                snap.primary_index
            );
            assert_eq!(snap, at(snap.primary_index), "allowed {allowed}");

            // The retried rotation and a later restore agree again.
            writer.budget = usize::MAX;
            if result.is_err() {
                running.rotate(&mut writer).unwrap();
            }
            running.rotate(&mut writer).unwrap();
            assert_eq!(running.snapshot().unwrap(), at(17));
            let mut again = KeyRotationService::new();
            again.restore(&storage).unwrap();
            assert_eq!(again.snapshot(), running.snapshot());
        }
    }

    #[test]
    fn test_restore_from_journal_finishes_checkpoint_on_next_rotation() {
        let keys = test_keys();
        let chain = reference_chain(&keys);
        let storage = InMemoryStorage::new();
        let mut writer = FailAfter {
            inner: storage.clone(),
            budget: usize::MAX,
        };
        let mut svc = KeyRotationService::new();
        svc.start(&mut writer, &keys).unwrap();
        for _ in 1..15 {
            svc.rotate(&mut writer).unwrap();
        }
        // Only the journal lands.
        writer.budget = 1;
        assert!(svc.rotate(&mut writer).is_err());
        assert!(storage.contains(StorageKey::PendingCheckpoint));

        let mut rebooted = KeyRotationService::new();
        rebooted.restore(&storage).unwrap();
        assert_eq!(rebooted.snapshot().unwrap(), chain[15]);

        let mut storage_rw = storage.clone();
        rebooted.rotate(&mut storage_rw).unwrap();
        assert!(!storage.contains(StorageKey::PendingCheckpoint));
        assert_eq!(storage.load_u32(StorageKey::PrimaryKeyIndex).unwrap(), Some(17));

        let mut again = KeyRotationService::new();
        again.restore(&storage).unwrap();
        assert_eq!(again.snapshot().unwrap(), chain[16]);
    }

    #[test]
    fn test_restore_rejects_out_of_range_diff() {
        let mut storage = InMemoryStorage::new();
        let mut svc = KeyRotationService::new();
        svc.start(&mut storage, &test_keys()).unwrap();
        for diff in [STORAGE_UPDATE_PERIOD as u16, u16::MAX] {
            storage.save(StorageKey::KeysIndexDiff, &diff.to_le_bytes()).unwrap();
            let mut restored = KeyRotationService::new();
            assert!(matches!(
                restored.restore(&storage),
                Err(FmnError::Storage(StorageError::OutOfRange {
                    key: StorageKey::KeysIndexDiff,
                    ..
                }))
            ));
            assert!(!restored.is_running());
        }
    }

    #[test]
    fn test_restore_replays_from_checkpoint() {
        let mut storage = InMemoryStorage::new();
        let mut svc = KeyRotationService::new();
        svc.start(&mut storage, &test_keys()).unwrap();
        for _ in 0..20 {
            svc.rotate(&mut storage).unwrap();
        }
        let mut restored = KeyRotationService::new();
        assert!(restored.restore(&storage).unwrap());
        assert_eq!(restored.snapshot(), svc.snapshot());
        assert_eq!(restored.snapshot().unwrap().primary_index, 21);
    }

    #[test]
    fn test_restore_without_pairing() {
        let storage = InMemoryStorage::new();
        let mut svc = KeyRotationService::new();
        assert!(!svc.restore(&storage).unwrap());
        assert!(!svc.is_running());
    }

    #[test]
    fn test_failed_rotation_leaves_state_unchanged() {
        let mut storage = InMemoryStorage::new();
        let mut svc = KeyRotationService::new();
        svc.start(&mut storage, &test_keys()).unwrap();
        let before = svc.snapshot().unwrap();

        storage.set_fail_writes(true);
        assert!(matches!(svc.rotate(&mut storage), Err(FmnError::Storage(_))));
        assert_eq!(svc.snapshot().unwrap(), before);

        storage.set_fail_writes(false);
        assert_eq!(svc.rotate(&mut storage).unwrap().primary_index, 2);
    }

    #[test]
    fn test_default_secondary_schedule() {
        assert!(secondary_rolls_at(1, 0, 0));
        assert!(!secondary_rolls_at(2, 1, 0));
        assert!(!secondary_rolls_at(96, 1, 0));
        assert!(secondary_rolls_at(97, 1, 0));
        assert!(secondary_rolls_at(193, 2, 0));
    }

    #[test]
    fn test_configure_moves_secondary_phase() {
        let mut storage = InMemoryStorage::new();
        let mut svc = KeyRotationService::new();
        svc.start(&mut storage, &test_keys()).unwrap();
        for _ in 0..99 {
            svc.rotate(&mut storage).unwrap();
        }
        // Index 100, secondary 2 (rolled at 1 and 97).
        assert_eq!(svc.snapshot().unwrap().secondary_index, 2);
        assert!(svc.configure_separated_state(&mut storage, 100).is_err());
        assert!(svc.configure_separated_state(&mut storage, 197).is_err());
        svc.configure_separated_state(&mut storage, 196).unwrap();

        let mut rolled_at = None;
        for _ in 0..96 {
            let r = svc.rotate(&mut storage).unwrap();
            if r.secondary_rolled {
                rolled_at = Some(r.primary_index);
                break;
            }
        }
        assert_eq!(rolled_at, Some(196));

        let mut restored = KeyRotationService::new();
        restored.restore(&storage).unwrap();
        assert_eq!(restored.snapshot(), svc.snapshot());
    }

    #[test]
    fn test_latch_holds_until_secondary_roll() {
        let mut storage = InMemoryStorage::new();
        let mut svc = KeyRotationService::new();
        svc.start(&mut storage, &test_keys()).unwrap();
        for _ in 0..9 {
            svc.rotate(&mut storage).unwrap();
        }
        let latched_key = svc.snapshot().unwrap().primary_key;
        assert_eq!(svc.latch().unwrap(), 10);
        svc.rotate(&mut storage).unwrap();
        assert_eq!(svc.latch().unwrap(), 10);

        let reader = svc.reader();
        assert_eq!(reader.separated_key(), Some(latched_key));
        while !svc.rotate(&mut storage).unwrap().secondary_rolled {}
        let snap = reader.current().unwrap();
        assert_eq!(snap.primary_index, 97);
        assert!(snap.latched.is_none());
        assert_eq!(*snap.separated_key(), snap.secondary_key);
    }

    #[test]
    fn test_stop_clears_readers() {
        let mut storage = InMemoryStorage::new();
        let mut svc = KeyRotationService::new();
        svc.start(&mut storage, &test_keys()).unwrap();
        let reader = svc.reader();
        svc.stop();
        assert!(reader.current().is_none());
        assert!(svc.rotate(&mut storage).is_err());
        assert!(svc.latch().is_err());
    }
}
