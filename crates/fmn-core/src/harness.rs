//! Test harness for the accessory core.
//!
//! Stands in for everything on the far side of the radio: a provisioning
//! step, the key server that seals and opens the pairing blobs, an owner
//! device running its half of the key generation, and a host that records
//! what the core asked it to do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fmn_crypto::ckg::{OwnerCkg, OwnerCkgOutput};
use fmn_crypto::ec::export_p256_point;
use fmn_crypto::ecies::ecies_decrypt;
use fmn_crypto::hash::sha256;
use fmn_crypto::keys::{derive_server_shared_secret, encrypt_e3};
use fmn_proto::adv::Advertisement;
use fmn_proto::fragment::fragment;
use fmn_proto::pairing::{FinalizePairing, InitiatePairing, PairingData, PairingStatus};
use fmn_proto::validation::sizes;
use fmn_proto::{Frame, Opcode};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use zeroize::Zeroizing;

use crate::accessory::{Accessory, AccessoryState};
use crate::config::{AccessoryConfig, ServerKeys, ServerKeysConfig};
use crate::conn::{ConnHandle, SecurityLevel};
use crate::host::{AccessoryCallbacks, BleHost, ControlPoint, TimerHost};
use crate::storage::{Storage, StorageKey};
use crate::timer::TimerId;

pub const TEST_SERIAL: &[u8; 16] = b"FMN-TEST-0000001";
pub const TEST_UUID: [u8; 16] = [
    0x6f, 0x1c, 0x2e, 0x40, 0x9a, 0x31, 0x4b, 0x8d, 0xa2, 0x07, 0x5e, 0x19, 0xc3, 0x44, 0x10, 0x7b,
];
const FACTORY_TOKEN: u8 = 0xA5;
const SERVER_TOKEN: u8 = 0x3C;
const TEST_ICLOUD_ID: [u8; sizes::ICLOUD_ID] = [0x1C; sizes::ICLOUD_ID];

// E2 plaintext layout.
const E2_UUID: std::ops::Range<usize> = 1056..1072;
const E2_SEED_K1: std::ops::Range<usize> = 1213..1245;

/// Write the factory provisioning entries.
pub fn provision<S: Storage>(storage: &mut S) {
    storage
        .save(StorageKey::SoftwareAuthUuid, &TEST_UUID)
        .expect("provision uuid");
    storage
        .save(StorageKey::SoftwareAuthToken, &[FACTORY_TOKEN; sizes::SW_AUTH_TOKEN])
        .expect("provision token");
    storage
        .save(StorageKey::SerialNumber, TEST_SERIAL)
        .expect("provision serial");
}

/// Default accessory config pointed at `server`.
pub fn test_config(server: &TestServer) -> AccessoryConfig {
    AccessoryConfig {
        server_keys: Some(server.keys_config()),
        ..AccessoryConfig::default()
    }
}

// ============================================================================
// Key server
// ============================================================================

/// Simulated key server: owns the ECIES and S2 signing key pairs.
pub struct TestServer {
    encryption: p256::SecretKey,
    signing: SigningKey,
}

impl TestServer {
    pub fn new(seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed ^ 0x5e7e);
        Self {
            encryption: p256::SecretKey::random(&mut rng),
            signing: SigningKey::random(&mut rng),
        }
    }

    pub fn keys(&self) -> ServerKeys {
        ServerKeys {
            encryption_key: export_p256_point(&self.encryption.public_key()),
            signature_key: export_p256_point(&p256::PublicKey::from(self.signing.verifying_key())),
        }
    }

    pub fn keys_config(&self) -> ServerKeysConfig {
        let keys = self.keys();
        ServerKeysConfig {
            encryption_key: hex::encode(keys.encryption_key),
            signature_key: hex::encode(keys.signature_key),
        }
    }

    /// ECIES-open anything the accessory sealed to this server.
    pub fn open(&self, ciphertext: &[u8]) -> Zeroizing<Vec<u8>> {
        ecies_decrypt(&self.encryption, ciphertext).expect("ecies open")
    }

    pub fn open_e2(&self, e2: &[u8]) -> Zeroizing<Vec<u8>> {
        let plain = self.open(e2);
        assert_eq!(plain.len(), sizes::E2_PLAINTEXT);
        plain
    }

    pub fn open_e4(&self, e4: &[u8]) -> Zeroizing<Vec<u8>> {
        let plain = self.open(e4);
        assert_eq!(plain.len(), sizes::E4_PLAINTEXT);
        plain
    }

    /// Token the server hands out in E3.
    pub fn next_token(&self) -> [u8; sizes::SW_AUTH_TOKEN] {
        [SERVER_TOKEN; sizes::SW_AUTH_TOKEN]
    }

    /// Server half of finalize: pick SeedS, seal the new token into E3 and
    /// sign the session transcript.
    fn finalize_material(
        &self,
        rng: &mut ChaCha20Rng,
        e2_plain: &[u8],
        session_nonce: &[u8; sizes::SESSION_NONCE],
        e1: &[u8; sizes::E1],
        c2: &[u8; sizes::C2],
    ) -> ([u8; sizes::SEEDS], Vec<u8>, [u8; sizes::S2]) {
        let mut seeds = [0u8; sizes::SEEDS];
        rng.fill_bytes(&mut seeds);
        let mut seed_k1 = [0u8; sizes::SEED_K1];
        seed_k1.copy_from_slice(&e2_plain[E2_SEED_K1]);

        let server_shared_secret = derive_server_shared_secret(&seeds, &seed_k1).expect("sss");
        let e3 = encrypt_e3(&server_shared_secret, &self.next_token()).expect("e3");

        let mut signed = Vec::new();
        signed.extend_from_slice(&e2_plain[E2_UUID]);
        signed.extend_from_slice(session_nonce);
        signed.extend_from_slice(&seeds);
        signed.extend_from_slice(&sha256(c2));
        signed.extend_from_slice(e1);
        signed.extend_from_slice(&e3);
        let signature: Signature = self.signing.sign(&signed);
        let der = signature.to_der();
        let mut s2 = [0u8; sizes::S2];
        s2[..der.as_bytes().len()].copy_from_slice(der.as_bytes());
        (seeds, e3, s2)
    }
}

// ============================================================================
// Owner device
// ============================================================================

/// Simulated owner device driving the pairing handshake.
pub struct OwnerDevice {
    rng: ChaCha20Rng,
    session_nonce: [u8; sizes::SESSION_NONCE],
    e1: [u8; sizes::E1],
    ckg: Option<OwnerCkg>,
}

impl OwnerDevice {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            session_nonce: [0u8; sizes::SESSION_NONCE],
            e1: [0u8; sizes::E1],
            ckg: None,
        }
    }

    pub fn initiate(&mut self) -> InitiatePairing {
        self.rng.fill_bytes(&mut self.session_nonce);
        self.rng.fill_bytes(&mut self.e1);
        InitiatePairing {
            session_nonce: self.session_nonce,
            e1: self.e1,
        }
    }

    /// Answer `SendPairingData`, relaying through `server` for E3 and S2.
    pub fn finalize(&mut self, server: &TestServer, data: &PairingData, e2_plain: &[u8]) -> FinalizePairing {
        let (ckg, c2) = OwnerCkg::respond(&mut self.rng, &data.c1).expect("ckg respond");
        self.ckg = Some(ckg);
        let (seeds, e3, s2) =
            server.finalize_material(&mut self.rng, e2_plain, &self.session_nonce, &self.e1, &c2);
        FinalizePairing {
            c2,
            e3: e3.into(),
            seeds,
            icloud_id: TEST_ICLOUD_ID,
            s2,
        }
    }

    pub fn complete(&mut self, c3: &[u8]) -> OwnerCkgOutput {
        self.ckg
            .take()
            .expect("finalize before complete")
            .finish(c3)
            .expect("ckg finish")
    }
}

// ============================================================================
// Recording host
// ============================================================================

#[derive(Debug, Default)]
pub struct HostLog {
    pub advertising: Option<Advertisement>,
    pub advertising_starts: usize,
    pub disconnects: Vec<ConnHandle>,
    pub removed_bonds: Vec<ConnHandle>,
    pub indications: Vec<(ConnHandle, ControlPoint, Frame)>,
    pub ltk: Option<[u8; 16]>,
    pub timers: HashMap<TimerId, (u64, Duration)>,
}

/// Host that records every request. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingHost {
    log: Arc<Mutex<HostLog>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> MutexGuard<'_, HostLog> {
        self.log.lock().expect("host log poisoned")
    }

    pub fn advertising(&self) -> Option<Advertisement> {
        self.log().advertising.clone()
    }

    pub fn disconnects(&self) -> Vec<ConnHandle> {
        self.log().disconnects.clone()
    }

    /// Armed timer `(generation, duration)`, if the core has not cancelled it.
    pub fn timer(&self, id: TimerId) -> Option<(u64, Duration)> {
        self.log().timers.get(&id).copied()
    }

    /// Drain indications sent on `conn`.
    pub fn take_indications(&self, conn: ConnHandle) -> Vec<(ControlPoint, Frame)> {
        let mut log = self.log();
        let (mine, rest): (Vec<_>, Vec<_>) = log.indications.drain(..).partition(|(c, _, _)| *c == conn);
        log.indications = rest;
        mine.into_iter().map(|(_, point, frame)| (point, frame)).collect()
    }

    /// Last indication on `conn`, dropping everything before it.
    pub fn last_indication(&self, conn: ConnHandle) -> Option<Frame> {
        self.take_indications(conn).pop().map(|(_, frame)| frame)
    }
}

impl BleHost for RecordingHost {
    fn start_advertising(&mut self, adv: &Advertisement) {
        let mut log = self.log();
        log.advertising = Some(adv.clone());
        log.advertising_starts += 1;
    }

    fn stop_advertising(&mut self) {
        self.log().advertising = None;
    }

    fn disconnect(&mut self, conn: ConnHandle) {
        self.log().disconnects.push(conn);
    }

    fn remove_bond(&mut self, conn: ConnHandle) {
        self.log().removed_bonds.push(conn);
    }

    fn indicate(&mut self, conn: ConnHandle, point: ControlPoint, frame: &Frame) {
        self.log().indications.push((conn, point, frame.clone()));
    }

    fn set_long_term_key(&mut self, ltk: &[u8; 16]) {
        self.log().ltk = Some(*ltk);
    }
}

impl TimerHost for RecordingHost {
    fn arm_timer(&mut self, id: TimerId, generation: u64, after: Duration) {
        self.log().timers.insert(id, (generation, after));
    }

    fn cancel_timer(&mut self, id: TimerId) {
        self.log().timers.remove(&id);
    }
}

// ============================================================================
// Recording callbacks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackEvent {
    StateChanged(AccessoryState, AccessoryState),
    PairingCompleted,
    PairingFailed,
    SoundStart,
    SoundStop,
    Unpaired,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingCallbacks {
    events: Arc<Mutex<Vec<CallbackEvent>>>,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().expect("callback log poisoned").clone()
    }

    pub fn contains(&self, event: CallbackEvent) -> bool {
        self.events().contains(&event)
    }

    fn push(&self, event: CallbackEvent) {
        self.events.lock().expect("callback log poisoned").push(event);
    }
}

impl AccessoryCallbacks for RecordingCallbacks {
    fn state_changed(&mut self, from: AccessoryState, to: AccessoryState) {
        self.push(CallbackEvent::StateChanged(from, to));
    }

    fn pairing_completed(&mut self) {
        self.push(CallbackEvent::PairingCompleted);
    }

    fn pairing_failed(&mut self) {
        self.push(CallbackEvent::PairingFailed);
    }

    fn sound_start(&mut self) {
        self.push(CallbackEvent::SoundStart);
    }

    fn sound_stop(&mut self) {
        self.push(CallbackEvent::SoundStop);
    }

    fn unpaired(&mut self) {
        self.push(CallbackEvent::Unpaired);
    }
}

// ============================================================================
// Flow helpers
// ============================================================================

/// Fragment `frame` into GATT writes and feed them to the accessory.
pub fn write_frame<S, C>(
    accessory: &mut Accessory<S, RecordingHost, C>,
    conn: ConnHandle,
    point: ControlPoint,
    frame: &Frame,
) where
    S: Storage,
    C: AccessoryCallbacks,
{
    for write in fragment(&frame.encode(), 128) {
        accessory.handle_write(conn, point, &write);
    }
}

/// Fire the armed timer `id` as if its deadline had passed.
pub fn fire_timer<S, C>(accessory: &mut Accessory<S, RecordingHost, C>, id: TimerId) -> bool
where
    S: Storage,
    C: AccessoryCallbacks,
{
    let armed = accessory.host().timer(id);
    match armed {
        Some((generation, _)) => {
            accessory.host().log().timers.remove(&id);
            accessory.handle_timer(id, generation);
            true
        }
        None => false,
    }
}

/// Connect `conn`, run the whole pairing handshake and return what the
/// owner learned. Panics if the accessory does not answer as expected.
pub fn run_pairing_flow<S, C>(
    accessory: &mut Accessory<S, RecordingHost, C>,
    owner: &mut OwnerDevice,
    server: &TestServer,
    conn: ConnHandle,
) -> OwnerCkgOutput
where
    S: Storage,
    C: AccessoryCallbacks,
{
    accessory.on_connected(conn);
    accessory.on_security_changed(conn, SecurityLevel::Authenticated);

    write_frame(accessory, conn, ControlPoint::Pairing, &owner.initiate().encode());
    let frame = accessory
        .host()
        .last_indication(conn)
        .expect("SendPairingData indication");
    assert_eq!(frame.opcode, Opcode::SendPairingData);
    let data = PairingData::decode(&frame.body).expect("pairing data");

    let e2 = server.open_e2(&data.e2);
    let finalize = owner.finalize(server, &data, &e2);
    write_frame(accessory, conn, ControlPoint::Pairing, &finalize.encode());
    let frame = accessory
        .host()
        .last_indication(conn)
        .expect("SendPairingStatus indication");
    assert_eq!(frame.opcode, Opcode::SendPairingStatus);
    let status = PairingStatus::decode(&frame.body).expect("pairing status");

    write_frame(
        accessory,
        conn,
        ControlPoint::Pairing,
        &Frame::new(Opcode::PairingComplete, Vec::new()),
    );
    owner.complete(&status.c3)
}
