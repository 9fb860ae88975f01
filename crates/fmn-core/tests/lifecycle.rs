//! Integration tests for the accessory lifecycle: pairing, owner
//! connections, separation, unpair and reset.

use std::time::Duration;

use fmn_core::conn::MultiStatus;
use fmn_core::harness::{
    fire_timer, provision, run_pairing_flow, test_config, write_frame, CallbackEvent, OwnerDevice,
    RecordingCallbacks, RecordingHost, TestServer, TEST_SERIAL,
};
use fmn_core::serial_number::QuerySource;
use fmn_core::timer::TimerId;
use fmn_core::{
    Accessory, AccessoryConfig, AccessoryState, ControlPoint, FmnError, InMemoryStorage,
    SecurityLevel, Storage, StorageKey,
};
use fmn_crypto::ckg::OwnerCkgOutput;
use fmn_proto::adv::interval;
use fmn_proto::control::{decode_command_response, decode_index, OwnerCommand};
use fmn_proto::pairing::{PairingData, PairingStatus};
use fmn_proto::{Frame, Opcode, Status};
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;

type TestAccessory = Accessory<InMemoryStorage, RecordingHost, RecordingCallbacks>;

struct Rig {
    accessory: TestAccessory,
    storage: InMemoryStorage,
    host: RecordingHost,
    callbacks: RecordingCallbacks,
    server: TestServer,
    owner: OwnerDevice,
}

fn rig(seed: u64, tweak: impl FnOnce(&mut AccessoryConfig)) -> Rig {
    let server = TestServer::new(seed);
    let mut config = test_config(&server);
    tweak(&mut config);
    let mut storage = InMemoryStorage::new();
    provision(&mut storage);
    let host = RecordingHost::new();
    let callbacks = RecordingCallbacks::new();
    let accessory = Accessory::new(config, storage.clone(), host.clone(), callbacks.clone())
        .unwrap()
        .with_rng(ChaCha20Rng::seed_from_u64(seed));
    Rig {
        accessory,
        storage,
        host,
        callbacks,
        server,
        owner: OwnerDevice::new(seed + 1000),
    }
}

/// Enabled and paired with an owner on connection 1.
fn paired(seed: u64, tweak: impl FnOnce(&mut AccessoryConfig)) -> (Rig, OwnerCkgOutput) {
    let mut r = rig(seed, tweak);
    r.accessory.enable().unwrap();
    let owner_keys = run_pairing_flow(&mut r.accessory, &mut r.owner, &r.server, 1);
    assert_eq!(r.accessory.state(), AccessoryState::Connected);
    (r, owner_keys)
}

/// Send an owner command on `conn` and return what came back.
fn command(r: &mut Rig, conn: u16, cmd: OwnerCommand) -> Frame {
    write_frame(&mut r.accessory, conn, ControlPoint::Configuration, &cmd.encode());
    r.host.last_indication(conn).expect("owner command answered")
}

fn response_status(frame: &Frame) -> Status {
    assert_eq!(frame.opcode, Opcode::CommandResponse);
    let (_, status) = decode_command_response(&frame.body).unwrap();
    Status::from_u16(status).unwrap()
}

#[test]
fn test_pairing_reaches_connected() {
    let (r, owner_keys) = paired(1, |_| {});

    assert!(r.callbacks.contains(CallbackEvent::PairingCompleted));
    assert!(r
        .callbacks
        .contains(CallbackEvent::StateChanged(AccessoryState::Unpaired, AccessoryState::Connected)));

    let snapshot = r.accessory.key_reader().current().unwrap();
    assert_eq!(snapshot.primary_index, 1);
    assert_eq!(r.host.log().ltk, Some(snapshot.ltk));
    assert_eq!(
        r.host.timer(TimerId::KeyRotation).map(|(_, after)| after),
        Some(Duration::from_secs(900))
    );
    assert_eq!(r.host.timer(TimerId::PairingMode), None);

    let stored = r.storage.load(StorageKey::MasterPublicKey).unwrap().unwrap();
    assert_eq!(stored.as_slice(), &owner_keys.keys.master_public_key[..]);
    assert_eq!(r.storage.load_u64(StorageKey::SnQueryCounter).unwrap(), Some(0));
}

#[test]
fn test_owner_leaves_then_separated() {
    let (mut r, _) = paired(2, |_| {});

    r.accessory.on_disconnected(1);
    assert_eq!(r.accessory.state(), AccessoryState::Nearby);
    assert_eq!(
        r.host.timer(TimerId::NearbySeparated).map(|(_, after)| after),
        Some(Duration::from_secs(30))
    );
    let nearby = r.host.advertising().unwrap();
    assert_eq!(nearby.payload.len(), 8);

    assert!(fire_timer(&mut r.accessory, TimerId::NearbySeparated));
    assert_eq!(r.accessory.state(), AccessoryState::Separated);
    let separated = r.host.advertising().unwrap();
    assert_eq!(
        separated.separated_key(),
        r.accessory.key_reader().separated_key()
    );

    // An owner re-encrypting the link brings the accessory back.
    r.accessory.on_connected(2);
    r.accessory.on_security_changed(2, SecurityLevel::Encrypted);
    assert_eq!(r.accessory.state(), AccessoryState::Connected);
    assert!(r.accessory.connections().get(2).unwrap().is_owner());
}

#[test]
fn test_zero_nearby_timeout_goes_straight_to_separated() {
    let (mut r, _) = paired(3, |_| {});
    let reply = command(&mut r, 1, OwnerCommand::SetNearbyTimeout { seconds: 0 });
    assert_eq!(response_status(&reply), Status::Success);

    r.accessory.on_disconnected(1);
    assert_eq!(r.accessory.state(), AccessoryState::Separated);
    assert_eq!(r.host.timer(TimerId::NearbySeparated), None);
}

#[test]
fn test_nearby_timeout_out_of_range() {
    let (mut r, _) = paired(4, |_| {});
    let reply = command(&mut r, 1, OwnerCommand::SetNearbyTimeout { seconds: 3601 });
    assert_eq!(response_status(&reply), Status::InvalidParam);
    assert_eq!(r.accessory.nearby_timeout_secs(), 30);
}

#[test]
fn test_second_pairing_attempt_refused() {
    let mut r = rig(5, |c| c.max_connections = 3);
    r.accessory.enable().unwrap();

    r.accessory.on_connected(1);
    r.accessory.on_security_changed(1, SecurityLevel::Authenticated);
    assert!(r.accessory.pairing_in_progress());

    r.accessory.on_connected(2);
    r.accessory.on_security_changed(2, SecurityLevel::Authenticated);
    assert!(r.host.log().removed_bonds.contains(&2));
    assert!(r.host.disconnects().contains(&2));
    assert!(r.accessory.pairing_in_progress());

    // Losing the session owner fails the pairing and reopens pairing mode.
    r.accessory.on_disconnected(2);
    r.accessory.on_disconnected(1);
    assert!(!r.accessory.pairing_in_progress());
    assert!(r.callbacks.contains(CallbackEvent::PairingFailed));
    assert!(r.host.log().removed_bonds.contains(&1));
    let adv = r.host.advertising().unwrap();
    assert_eq!(adv.address, None);
    assert_eq!(r.accessory.state(), AccessoryState::Unpaired);
}

#[test]
fn test_pairing_command_without_session_disconnects() {
    let mut r = rig(6, |c| c.max_connections = 2);
    r.accessory.enable().unwrap();
    r.accessory.on_connected(3);
    r.accessory.on_security_changed(3, SecurityLevel::Encrypted);

    let initiate = r.owner.initiate();
    write_frame(&mut r.accessory, 3, ControlPoint::Pairing, &initiate.encode());
    assert_eq!(r.host.disconnects(), vec![3]);
    assert!(r.host.take_indications(3).is_empty());
}

#[test]
fn test_forged_signature_fails_pairing() {
    let mut r = rig(7, |_| {});
    r.accessory.enable().unwrap();
    r.accessory.on_connected(1);
    r.accessory.on_security_changed(1, SecurityLevel::Authenticated);

    let initiate = r.owner.initiate();
    write_frame(&mut r.accessory, 1, ControlPoint::Pairing, &initiate.encode());
    let frame = r.host.last_indication(1).unwrap();
    let data = PairingData::decode(&frame.body).unwrap();
    let e2 = r.server.open_e2(&data.e2);
    let mut finalize = r.owner.finalize(&r.server, &data, &e2);
    finalize.s2[10] ^= 0x01;
    write_frame(&mut r.accessory, 1, ControlPoint::Pairing, &finalize.encode());

    assert!(r.host.take_indications(1).is_empty());
    assert_eq!(r.host.disconnects(), vec![1]);
    assert!(r.callbacks.contains(CallbackEvent::PairingFailed));
    assert!(!r.accessory.pairing_in_progress());
    assert!(!r.storage.contains(StorageKey::ServerSharedSecret));
    assert_eq!(r.accessory.state(), AccessoryState::Unpaired);

    r.accessory.on_disconnected(1);
    assert!(r.host.advertising().is_some());
}

#[test]
fn test_unpair_on_owner_disconnect() {
    let (mut r, _) = paired(8, |_| {});
    let reply = command(&mut r, 1, OwnerCommand::Unpair);
    assert_eq!(response_status(&reply), Status::Success);
    assert!(r.accessory.unpair_pending());
    assert_eq!(r.accessory.state(), AccessoryState::Connected);

    r.accessory.on_disconnected(1);
    assert_eq!(r.accessory.state(), AccessoryState::Unpaired);
    assert!(r.callbacks.contains(CallbackEvent::Unpaired));
    assert!(!r.storage.contains(StorageKey::MasterPublicKey));
    assert!(r.accessory.key_reader().current().is_none());
    assert_eq!(r.host.timer(TimerId::KeyRotation), None);
    // Pairing mode comes back on its own.
    assert!(r.host.advertising().is_some());
    assert!(r.host.timer(TimerId::PairingMode).is_some());
}

#[test]
fn test_unpair_storage_failure_stays_paired() {
    let (mut r, _) = paired(9, |_| {});
    command(&mut r, 1, OwnerCommand::Unpair);
    r.storage.set_fail_writes(true);

    r.accessory.on_disconnected(1);
    assert_eq!(r.accessory.state(), AccessoryState::Nearby);
    assert!(r.accessory.unpair_pending());
    assert!(r.accessory.key_reader().current().is_some());
}

#[test]
fn test_factory_reset_blocked_by_storage() {
    let (mut r, _) = paired(10, |_| {});
    r.storage.set_fail_writes(true);
    let err = r.accessory.factory_reset().unwrap_err();
    assert!(matches!(err, FmnError::Storage(_)));
    assert_eq!(r.accessory.state(), AccessoryState::Connected);
    assert!(r.host.disconnects().is_empty());

    r.storage.set_fail_writes(false);
    r.accessory.factory_reset().unwrap();
    assert_eq!(r.accessory.state(), AccessoryState::Unpaired);
    assert!(r.host.log().removed_bonds.contains(&1));
    assert_eq!(r.host.disconnects(), vec![1]);
    assert!(r.accessory.connections().active_count() == 0);
    for key in StorageKey::PAIRING_KEYS {
        assert!(!r.storage.contains(key), "{key:?} survived reset");
    }
    assert!(r.storage.contains(StorageKey::SerialNumber));
}

#[test]
fn test_key_rotation_indicates_owner() {
    let (mut r, _) = paired(11, |_| {});
    r.host.take_indications(1);
    let before = r.accessory.key_reader().current().unwrap();

    assert!(fire_timer(&mut r.accessory, TimerId::KeyRotation));
    let after = r.accessory.key_reader().current().unwrap();
    assert_eq!(after.primary_index, 2);
    assert_ne!(after.primary_key, before.primary_key);
    assert_eq!(r.host.log().ltk, Some(after.ltk));

    let frame = r.host.last_indication(1).unwrap();
    assert_eq!(frame.opcode, Opcode::KeyrollIndication);
    assert_eq!(decode_index(&frame.body).unwrap(), 2);
    assert!(r.host.timer(TimerId::KeyRotation).is_some());
}

#[test]
fn test_stale_rotation_expiry_ignored() {
    let (mut r, _) = paired(12, |_| {});
    let (stale, _) = r.host.timer(TimerId::KeyRotation).unwrap();
    // Reconfiguring re-arms rotation with a new generation.
    let reply = command(
        &mut r,
        1,
        OwnerCommand::ConfigureSeparatedState {
            next_primary_key_roll_ms: 1_000,
            secondary_key_evaluation_index: 50,
        },
    );
    assert_eq!(response_status(&reply), Status::Success);
    let (fresh, after) = r.host.timer(TimerId::KeyRotation).unwrap();
    assert_ne!(stale, fresh);
    assert_eq!(after, Duration::from_millis(1_000));

    r.accessory.handle_timer(TimerId::KeyRotation, stale);
    assert_eq!(r.accessory.key_reader().current().unwrap().primary_index, 1);
}

#[test]
fn test_burst_disconnect_restarts_advertising_once() {
    let (mut r, _) = paired(13, |c| c.max_connections = 2);
    assert!(r.host.advertising().is_some());

    r.accessory.on_connected(2);
    assert_eq!(r.host.advertising(), None);
    let starts = r.host.log().advertising_starts;

    r.accessory.on_disconnected(1);
    r.accessory.on_disconnected(2);
    assert_eq!(r.host.log().advertising_starts, starts + 1);
    assert_eq!(r.accessory.state(), AccessoryState::Nearby);
    assert!(r.host.advertising().is_some());
    assert_eq!(r.accessory.connections().active_count(), 0);
}

#[test]
fn test_security_timeout_disconnects() {
    let mut r = rig(14, |_| {});
    r.accessory.enable().unwrap();
    r.accessory.on_connected(5);
    assert!(fire_timer(&mut r.accessory, TimerId::Security(5)));
    assert_eq!(r.host.disconnects(), vec![5]);
}

#[test]
fn test_sound_commands() {
    let (mut r, _) = paired(15, |_| {});

    let reply = command(&mut r, 1, OwnerCommand::SoundStart);
    assert_eq!(response_status(&reply), Status::Success);
    assert!(r.callbacks.contains(CallbackEvent::SoundStart));
    let reply = command(&mut r, 1, OwnerCommand::SoundStart);
    assert_eq!(response_status(&reply), Status::InvalidState);

    r.accessory.sound_completed();
    let frame = r.host.last_indication(1).unwrap();
    assert_eq!(frame.opcode, Opcode::SoundCompleted);
    let reply = command(&mut r, 1, OwnerCommand::SoundStop);
    assert_eq!(response_status(&reply), Status::InvalidState);
}

#[test]
fn test_latch_and_multi_status() {
    let (mut r, _) = paired(16, |_| {});

    let reply = command(&mut r, 1, OwnerCommand::LatchSeparatedKey);
    assert_eq!(reply.opcode, Opcode::LatchSeparatedKeyResponse);
    assert_eq!(decode_index(&reply.body).unwrap(), 1);
    let snapshot = r.accessory.key_reader().current().unwrap();
    assert_eq!(snapshot.separated_key(), &snapshot.primary_key);

    let reply = command(&mut r, 1, OwnerCommand::GetMultiStatus);
    assert_eq!(reply.opcode, Opcode::GetMultiStatusResponse);
    let bits = MultiStatus::from_bits_truncate(reply.body[0]);
    assert!(bits.contains(MultiStatus::OWNER_CONNECTED));
    assert!(!bits.contains(MultiStatus::MULTIPLE_OWNERS));
}

#[test]
fn test_owner_command_from_stranger_rejected() {
    let (mut r, _) = paired(17, |c| c.max_connections = 3);
    r.accessory.on_connected(2);
    let reply = command(&mut r, 2, OwnerCommand::SetMaxConnections { max: 5 });
    assert_eq!(response_status(&reply), Status::InvalidState);
    assert_eq!(r.accessory.max_connections(), 3);
    assert!(r.host.disconnects().is_empty());
}

#[test]
fn test_unknown_owner_opcode_answered() {
    let (mut r, _) = paired(18, |_| {});
    // A valid opcode that is not an owner command.
    let frame = Frame::new(Opcode::KeyrollIndication, Vec::new());
    write_frame(&mut r.accessory, 1, ControlPoint::Configuration, &frame);
    let reply = r.host.last_indication(1).unwrap();
    assert_eq!(response_status(&reply), Status::InvalidCommand);
    let (opcode, _) = decode_command_response(&reply.body).unwrap();
    assert_eq!(opcode, Opcode::KeyrollIndication.as_u16());
}

#[test]
fn test_restart_restores_keys() {
    let (mut r, _) = paired(19, |_| {});
    fire_timer(&mut r.accessory, TimerId::KeyRotation);
    fire_timer(&mut r.accessory, TimerId::KeyRotation);
    let expected = r.accessory.key_reader().current().unwrap();
    assert_eq!(expected.primary_index, 3);
    drop(r.accessory);

    let host = RecordingHost::new();
    let mut rebooted = Accessory::new(
        test_config(&r.server),
        r.storage.clone(),
        host.clone(),
        RecordingCallbacks::new(),
    )
    .unwrap();
    assert_eq!(rebooted.enable().unwrap(), AccessoryState::Separated);
    let restored = rebooted.key_reader().current().unwrap();
    assert_eq!(restored.primary_index, 3);
    assert_eq!(restored.primary_key, expected.primary_key);
    assert_eq!(host.log().ltk, Some(expected.ltk));
    assert!(host.timer(TimerId::KeyRotation).is_some());
}

#[test]
fn test_serial_number_after_pairing() {
    let (mut r, _) = paired(20, |_| {});
    let payload = r.accessory.serial_number_payload(QuerySource::Nfc).unwrap();
    let plain = r.server.open(&payload);
    assert_eq!(&plain[..16], TEST_SERIAL);
    assert_eq!(&plain[16..24], &1u64.to_le_bytes());
    assert_eq!(&plain[plain.len() - 4..], b"Tap ");
}

#[test]
fn test_disabled_refuses_connections() {
    let mut r = rig(21, |_| {});
    assert_eq!(r.accessory.state(), AccessoryState::Disabled);
    r.accessory.on_connected(1);
    assert_eq!(r.host.disconnects(), vec![1]);
    assert!(r.accessory.enter_pairing_mode().is_err());
}

#[test]
fn test_disable_stops_everything() {
    let (mut r, _) = paired(22, |_| {});
    r.accessory.disable();
    assert_eq!(r.accessory.state(), AccessoryState::Disabled);
    assert_eq!(r.host.advertising(), None);
    assert!(r.host.log().timers.is_empty());
    assert!(r.accessory.key_reader().current().is_none());
    assert_eq!(r.host.disconnects(), vec![1]);

    // Pairing survives a disable/enable cycle.
    assert_eq!(r.accessory.enable().unwrap(), AccessoryState::Separated);
}

#[test]
fn test_disable_during_pairing_reports_failure() {
    let mut r = rig(23, |_| {});
    r.accessory.enable().unwrap();
    r.accessory.on_connected(1);
    r.accessory.on_security_changed(1, SecurityLevel::Authenticated);
    let initiate = r.owner.initiate();
    write_frame(&mut r.accessory, 1, ControlPoint::Pairing, &initiate.encode());
    assert!(r.accessory.pairing_in_progress());

    r.accessory.disable();
    assert!(!r.accessory.pairing_in_progress());
    assert!(r.callbacks.contains(CallbackEvent::PairingFailed));
    assert!(r.host.log().removed_bonds.contains(&1));
    assert_eq!(r.host.disconnects(), vec![1]);
    assert!(!r.storage.contains(StorageKey::ServerSharedSecret));
    assert_eq!(r.accessory.state(), AccessoryState::Disabled);
    assert_eq!(r.host.timer(TimerId::PairingMode), None);
}

/// What the accessory sent the pairing owner on connection 1.
struct PairingTranscript {
    data: Frame,
    status: Frame,
    primary_key: Vec<u8>,
}

/// Pair on connection 1. With `intrude`, connection 2 replays its own
/// Initiate and Finalize in the middle of the session.
fn pair_with_intruder(seed: u64, intrude: bool) -> (Rig, PairingTranscript) {
    let mut r = rig(seed, |c| c.max_connections = 3);
    let mut intruder = OwnerDevice::new(seed + 2000);
    r.accessory.enable().unwrap();
    r.accessory.on_connected(1);
    r.accessory.on_security_changed(1, SecurityLevel::Authenticated);
    if intrude {
        r.accessory.on_connected(2);
        r.accessory.on_security_changed(2, SecurityLevel::Encrypted);
    }

    write_frame(&mut r.accessory, 1, ControlPoint::Pairing, &r.owner.initiate().encode());
    if intrude {
        write_frame(&mut r.accessory, 2, ControlPoint::Pairing, &intruder.initiate().encode());
    }
    let data_frame = r.host.last_indication(1).unwrap();
    let data = PairingData::decode(&data_frame.body).unwrap();
    let e2 = r.server.open_e2(&data.e2);

    let finalize = r.owner.finalize(&r.server, &data, &e2);
    if intrude {
        let forged = intruder.finalize(&r.server, &data, &e2);
        write_frame(&mut r.accessory, 2, ControlPoint::Pairing, &forged.encode());
    }
    write_frame(&mut r.accessory, 1, ControlPoint::Pairing, &finalize.encode());
    let status_frame = r.host.last_indication(1).unwrap();
    assert_eq!(status_frame.opcode, Opcode::SendPairingStatus);
    let status = PairingStatus::decode(&status_frame.body).unwrap();

    write_frame(
        &mut r.accessory,
        1,
        ControlPoint::Pairing,
        &Frame::new(Opcode::PairingComplete, Vec::new()),
    );
    let owner_keys = r.owner.complete(&status.c3);
    assert_eq!(r.accessory.state(), AccessoryState::Connected);
    let stored = r.storage.load(StorageKey::MasterPublicKey).unwrap().unwrap();
    assert_eq!(stored.as_slice(), &owner_keys.keys.master_public_key[..]);

    let transcript = PairingTranscript {
        data: data_frame,
        status: status_frame,
        primary_key: r.accessory.key_reader().current().unwrap().primary_key.to_vec(),
    };
    (r, transcript)
}

#[test]
fn test_second_link_cannot_join_pairing_session() {
    let (_, clean) = pair_with_intruder(24, false);
    let (r, disturbed) = pair_with_intruder(24, true);

    // The intruder never hears back and is dropped on every write.
    assert!(r.host.take_indications(2).is_empty());
    assert_eq!(r.host.disconnects(), vec![2, 2]);
    assert!(!r.callbacks.contains(CallbackEvent::PairingFailed));

    // C1/E2 and C3/E4 are byte-for-byte what an undisturbed run produces.
    assert_eq!(disturbed.data, clean.data);
    assert_eq!(disturbed.status, clean.status);
    assert_eq!(disturbed.primary_key, clean.primary_key);
    assert!(r.accessory.connections().get(1).unwrap().is_owner());
}

#[test]
fn test_persistent_connection_fast_reconnect_window() {
    let (mut r, _) = paired(25, |_| {});
    let reply = command(&mut r, 1, OwnerCommand::PersistentConnectionStatus { enabled: true });
    assert_eq!(response_status(&reply), Status::Success);

    r.accessory.on_disconnected(1);
    assert_eq!(r.accessory.state(), AccessoryState::Nearby);
    assert_eq!(
        r.host.timer(TimerId::PersistentFastAdvertising).map(|(_, after)| after),
        Some(Duration::from_secs(3))
    );
    let fast = r.host.advertising().unwrap();
    assert_eq!(fast.interval, interval::PERSISTENT_RECONNECT);
    assert_eq!(fast.interval, 0x0030);

    assert!(fire_timer(&mut r.accessory, TimerId::PersistentFastAdvertising));
    assert_eq!(r.accessory.state(), AccessoryState::Nearby);
    let slow = r.host.advertising().unwrap();
    assert_eq!(slow.interval, interval::NEARBY);
    assert_eq!(slow.interval, 0x0C80);
    assert_eq!(slow.payload, fast.payload);
}

#[test]
fn test_reconnect_from_nearby_cancels_separation() {
    let (mut r, _) = paired(26, |_| {});
    r.accessory.on_disconnected(1);
    assert_eq!(r.accessory.state(), AccessoryState::Nearby);
    let (stale, _) = r.host.timer(TimerId::NearbySeparated).unwrap();

    r.accessory.on_connected(2);
    r.accessory.on_security_changed(2, SecurityLevel::Encrypted);
    assert_eq!(r.accessory.state(), AccessoryState::Connected);
    assert_eq!(r.host.timer(TimerId::NearbySeparated), None);

    // The old deadline arriving late changes nothing.
    r.accessory.handle_timer(TimerId::NearbySeparated, stale);
    assert_eq!(r.accessory.state(), AccessoryState::Connected);
    assert!(r.accessory.connections().get(2).unwrap().is_owner());
}
