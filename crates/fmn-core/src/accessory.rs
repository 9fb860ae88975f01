//! Accessory state machine.
//!
//! [`Accessory`] owns every piece of mutable protocol state: the connection
//! table, the pairing session, the rotating keys and the timers. All entry
//! points take `&mut self`; the host serializes calls (see
//! [`crate::service`]) so nothing here needs interior locking.
//!
//! ```text
//! Unpaired --pairing complete--> Connected --last owner leaves--> Nearby
//!    ^                            ^   |                              |
//!    |                            |   +--unpair pending--> Unpaired  | timeout
//!    |                            +------owner reconnects-------- Separated
//! any --disable--> Disabled --enable--> Unpaired | Separated
//! ```

use std::time::Duration;

use fmn_proto::adv::{status_byte, Advertisement, BatteryState};
use fmn_proto::control::{self, OwnerCommand};
use fmn_proto::pairing::{decode_pairing_complete, FinalizePairing, InitiatePairing};
use fmn_proto::validation::validate_range;
use fmn_proto::{Frame, Opcode, Status, WireError};
use rand_core::{CryptoRngCore, OsRng};
use tracing::{debug, error, info, warn};

use crate::config::{AccessoryConfig, ProductInfo, ServerKeys, MAX_NEARBY_TIMEOUT_SECS};
use crate::conn::{ConnHandle, ConnectionTable, MultiStatus, SecurityLevel, MAX_CONNECTIONS};
use crate::errors::FmnError;
use crate::host::{AccessoryCallbacks, BleHost, ControlPoint, TimerHost};
use crate::keys::{KeyReader, KeyRotationService};
use crate::pairing::PairingManager;
use crate::serial_number::{encrypted_serial_number, QuerySource};
use crate::storage::Storage;
use crate::timer::{TimerId, Timers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessoryState {
    Unpaired,
    Connected,
    Nearby,
    Separated,
    Disabled,
}

impl AccessoryState {
    pub fn is_paired(self) -> bool {
        matches!(
            self,
            AccessoryState::Connected | AccessoryState::Nearby | AccessoryState::Separated
        )
    }
}

pub struct Accessory<S, H, C> {
    config: AccessoryConfig,
    server_keys: ServerKeys,
    product: ProductInfo,
    battery: BatteryState,

    storage: S,
    host: H,
    callbacks: C,
    rng: Box<dyn CryptoRngCore + Send>,

    state: AccessoryState,
    conns: ConnectionTable,
    timers: Timers,
    pairing: PairingManager,
    keys: KeyRotationService,
    advertising: Option<Advertisement>,

    pairing_mode: bool,
    unpair_pending: bool,
    /// An owner was connected during the current primary key period.
    maintained: bool,
    fast_reconnect: bool,
    max_connections: u8,
    nearby_timeout_secs: u16,
}

impl<S, H, C> Accessory<S, H, C>
where
    S: Storage,
    H: BleHost + TimerHost,
    C: AccessoryCallbacks,
{
    /// Build a disabled accessory. The configuration is validated here, so
    /// every later step can rely on it.
    pub fn new(config: AccessoryConfig, storage: S, host: H, callbacks: C) -> Result<Self, FmnError> {
        config.validate()?;
        let server_keys = config.server_keys()?;
        let product = config.product_info()?;
        let battery = config.battery()?;
        Ok(Self {
            max_connections: config.max_connections,
            nearby_timeout_secs: config.nearby_timeout_secs,
            config,
            server_keys,
            product,
            battery,
            storage,
            host,
            callbacks,
            rng: Box::new(OsRng),
            state: AccessoryState::Disabled,
            conns: ConnectionTable::default(),
            timers: Timers::default(),
            pairing: PairingManager::new(),
            keys: KeyRotationService::new(),
            advertising: None,
            pairing_mode: false,
            unpair_pending: false,
            maintained: false,
            fast_reconnect: false,
        })
    }

    /// Replace the randomness source.
    pub fn with_rng(mut self, rng: impl CryptoRngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> AccessoryState {
        self.state
    }

    pub fn advertisement(&self) -> Option<&Advertisement> {
        self.advertising.as_ref()
    }

    pub fn key_reader(&self) -> KeyReader {
        self.keys.reader()
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.conns
    }

    pub fn is_timer_armed(&self, id: TimerId) -> bool {
        self.timers.is_armed(id)
    }

    pub fn pairing_in_progress(&self) -> bool {
        self.pairing.in_progress()
    }

    pub fn unpair_pending(&self) -> bool {
        self.unpair_pending
    }

    pub fn nearby_timeout_secs(&self) -> u16 {
        self.nearby_timeout_secs
    }

    pub fn max_connections(&self) -> u8 {
        self.max_connections
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Leave `Disabled`, restoring pairing state if any was persisted.
    pub fn enable(&mut self) -> Result<AccessoryState, FmnError> {
        if self.state != AccessoryState::Disabled {
            return Err(FmnError::state("accessory already enabled"));
        }
        if self.keys.restore(&self.storage)? {
            self.install_ltk();
            self.maintained = false;
            self.arm_rotation(self.rotation_period());
            self.transition(AccessoryState::Separated);
        } else {
            self.transition(AccessoryState::Unpaired);
            if self.config.pairing_mode_auto_enter {
                self.start_pairing_mode();
            }
        }
        Ok(self.state)
    }

    /// Enter `Disabled` from any state.
    pub fn disable(&mut self) {
        if self.state == AccessoryState::Disabled {
            return;
        }
        self.shutdown_links();
        if self.state != AccessoryState::Unpaired {
            self.keys.stop();
        }
        self.pairing_mode = false;
        self.fast_reconnect = false;
        self.transition(AccessoryState::Disabled);
    }

    /// Delete all pairing data and return to `Unpaired`.
    ///
    /// A storage failure aborts the reset before any in-memory state or
    /// link is touched.
    pub fn factory_reset(&mut self) -> Result<(), FmnError> {
        self.storage.delete_pairing_data()?;
        let owners = self.conns.owner_handles();
        for conn in owners {
            self.host.remove_bond(conn);
        }
        self.shutdown_links();
        self.keys.stop();
        self.unpair_pending = false;
        self.maintained = false;
        self.fast_reconnect = false;
        self.pairing_mode = false;
        info!("factory reset");
        self.callbacks.unpaired();
        self.transition(AccessoryState::Unpaired);
        if self.config.pairing_mode_auto_enter {
            self.start_pairing_mode();
        }
        Ok(())
    }

    /// Start (or restart) pairing-mode advertising.
    pub fn enter_pairing_mode(&mut self) -> Result<(), FmnError> {
        if self.state != AccessoryState::Unpaired {
            return Err(FmnError::state(format!(
                "pairing mode requires Unpaired, accessory is {:?}",
                self.state
            )));
        }
        self.start_pairing_mode();
        Ok(())
    }

    pub fn set_battery(&mut self, battery: BatteryState) {
        self.battery = battery;
        self.refresh_advertising();
    }

    /// The application finished playing a sound on its own.
    pub fn sound_completed(&mut self) {
        let players: Vec<ConnHandle> = self
            .conns
            .iter()
            .filter(|r| !r.is_disconnecting && r.status.contains(MultiStatus::PLAYING_SOUND))
            .map(|r| r.handle)
            .collect();
        for conn in players {
            if let Some(record) = self.conns.get_mut(conn) {
                record.status.remove(MultiStatus::PLAYING_SOUND);
            }
            self.host
                .indicate(conn, ControlPoint::Configuration, &control::sound_completed());
        }
    }

    /// Encrypted serial number for a GATT read or an NFC tap.
    pub fn serial_number_payload(&mut self, source: QuerySource) -> Result<Vec<u8>, FmnError> {
        if !self.state.is_paired() {
            return Err(FmnError::state("serial number requested while unpaired"));
        }
        encrypted_serial_number(&mut self.storage, self.rng.as_mut(), &self.server_keys, source)
    }

    // ------------------------------------------------------------------
    // BLE events
    // ------------------------------------------------------------------

    pub fn on_connected(&mut self, conn: ConnHandle) {
        if self.state == AccessoryState::Disabled {
            self.host.disconnect(conn);
            return;
        }
        if !self.conns.insert(conn) {
            warn!(conn, "connection table full or duplicate handle");
            self.host.disconnect(conn);
            return;
        }
        debug!(conn, active = self.conns.active_count(), "connected");
        self.arm(
            TimerId::Security(conn),
            Duration::from_secs(self.config.security_timeout_secs),
        );
        self.refresh_advertising();
    }

    pub fn on_security_changed(&mut self, conn: ConnHandle, level: SecurityLevel) {
        let Some(record) = self.conns.active_mut(conn) else {
            return;
        };
        record.security = level;
        self.cancel(TimerId::Security(conn));
        debug!(conn, ?level, "security changed");

        match self.state {
            AccessoryState::Unpaired if level == SecurityLevel::Authenticated => {
                if let Err(e) = self.pairing.begin(conn) {
                    warn!(conn, error = %e, "concurrent pairing attempt refused");
                    self.host.remove_bond(conn);
                    self.host.disconnect(conn);
                    return;
                }
                self.refresh_advertising();
            }
            state if state.is_paired() && level >= SecurityLevel::Encrypted => {
                self.owner_connected(conn);
            }
            _ => {}
        }
    }

    /// The link failed to reach the requested security level.
    pub fn on_security_failed(&mut self, conn: ConnHandle) {
        warn!(conn, "security upgrade failed");
        if self.pairing.owner() == Some(conn) {
            self.fail_pairing(conn, &FmnError::Authentication);
        } else {
            self.host.disconnect(conn);
        }
    }

    pub fn on_disconnected(&mut self, conn: ConnHandle) {
        let Some(status) = self.conns.mark_disconnecting(conn) else {
            return;
        };
        self.cancel(TimerId::Security(conn));
        debug!(conn, "disconnected");

        if self.pairing.abort(conn) {
            self.pairing_failed_cleanup(conn);
        }

        if status.contains(MultiStatus::OWNER_CONNECTED)
            && self.conns.owner_count() == 0
            && self.state == AccessoryState::Connected
        {
            if self.unpair_pending {
                self.unpair();
            } else {
                if status.contains(MultiStatus::PERSISTENT_CONNECTION) {
                    self.fast_reconnect = true;
                    self.arm(
                        TimerId::PersistentFastAdvertising,
                        Duration::from_secs(self.config.persistent_reconnect_fast_adv_secs),
                    );
                }
                self.enter_nearby();
            }
        }

        self.conns.sweep();
        self.refresh_advertising();
    }

    /// A GATT write to one of the control points.
    pub fn handle_write(&mut self, conn: ConnHandle, point: ControlPoint, data: &[u8]) {
        if self.state == AccessoryState::Disabled {
            return;
        }
        let Some(record) = self.conns.active_mut(conn) else {
            debug!(conn, "write from unknown connection dropped");
            return;
        };
        let payload = match record.reassembler(point).push(data) {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                warn!(conn, error = %e, "control point reassembly failed");
                match point {
                    ControlPoint::Pairing => self.reject_pairing_command(conn, &e.into()),
                    ControlPoint::Configuration => self.host.disconnect(conn),
                }
                return;
            }
        };
        match point {
            ControlPoint::Pairing => self.handle_pairing_payload(conn, &payload),
            ControlPoint::Configuration => self.handle_config_payload(conn, &payload),
        }
    }

    /// Deliver a timer expiry previously requested through [`TimerHost`].
    pub fn handle_timer(&mut self, id: TimerId, generation: u64) {
        if !self.timers.accept(id, generation) {
            debug!(?id, "stale timer expiry ignored");
            return;
        }
        match id {
            TimerId::PairingMode => {
                info!("pairing mode timed out");
                self.pairing_mode = false;
                self.refresh_advertising();
            }
            TimerId::NearbySeparated => {
                if self.state == AccessoryState::Nearby {
                    self.transition(AccessoryState::Separated);
                }
            }
            TimerId::KeyRotation => self.rotate_keys(),
            TimerId::PersistentFastAdvertising => {
                self.fast_reconnect = false;
                self.refresh_advertising();
            }
            TimerId::Security(conn) => {
                if self
                    .conns
                    .active(conn)
                    .is_some_and(|r| r.security == SecurityLevel::Open)
                {
                    warn!(conn, "security upgrade timed out");
                    self.on_security_failed(conn);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Pairing control point
    // ------------------------------------------------------------------

    fn handle_pairing_payload(&mut self, conn: ConnHandle, payload: &[u8]) {
        if self.state != AccessoryState::Unpaired || self.pairing.owner() != Some(conn) {
            warn!(conn, state = ?self.state, "pairing command without a session");
            self.host.disconnect(conn);
            return;
        }
        if let Err(e) = self.run_pairing_command(conn, payload) {
            self.reject_pairing_command(conn, &e);
        }
    }

    fn run_pairing_command(&mut self, conn: ConnHandle, payload: &[u8]) -> Result<(), FmnError> {
        let frame = Frame::decode(payload)?;
        match frame.opcode {
            Opcode::InitiatePairing => {
                let msg = InitiatePairing::decode(&frame.body)?;
                let response = self.pairing.handle_initiate(
                    conn,
                    &msg,
                    &self.storage,
                    self.rng.as_mut(),
                    &self.server_keys,
                    &self.product,
                )?;
                self.host.indicate(conn, ControlPoint::Pairing, &response.encode());
            }
            Opcode::FinalizePairing => {
                let msg = FinalizePairing::decode(&frame.body)?;
                let response = self.pairing.handle_finalize(
                    conn,
                    &msg,
                    &mut self.storage,
                    self.rng.as_mut(),
                    &self.server_keys,
                )?;
                self.host.indicate(conn, ControlPoint::Pairing, &response.encode());
            }
            Opcode::PairingComplete => {
                decode_pairing_complete(&frame.body)?;
                let keys = self.pairing.handle_complete(conn)?;
                if let Err(e) = self.keys.start(&mut self.storage, &keys) {
                    self.fail_pairing(conn, &e);
                    return Ok(());
                }
                self.complete_pairing(conn);
            }
            other => return Err(WireError::UnknownOpcode(other.as_u16()).into()),
        }
        Ok(())
    }

    fn complete_pairing(&mut self, conn: ConnHandle) {
        self.install_ltk();
        if let Some(record) = self.conns.active_mut(conn) {
            record.status.insert(MultiStatus::OWNER_CONNECTED);
        }
        self.maintained = true;
        self.pairing_mode = false;
        self.cancel(TimerId::PairingMode);
        self.arm_rotation(self.rotation_period());
        self.transition(AccessoryState::Connected);
        self.callbacks.pairing_completed();
    }

    fn reject_pairing_command(&mut self, conn: ConnHandle, err: &FmnError) {
        if self.pairing.owner() == Some(conn) {
            self.fail_pairing(conn, err);
        } else {
            self.host.disconnect(conn);
        }
    }

    fn fail_pairing(&mut self, conn: ConnHandle, err: &FmnError) {
        warn!(conn, error = %err, "pairing failed");
        self.pairing.abort(conn);
        self.pairing_failed_cleanup(conn);
        self.host.disconnect(conn);
    }

    /// Remove partial pairing artifacts for `conn` and report the failure.
    fn pairing_failed_cleanup(&mut self, conn: ConnHandle) {
        if let Err(e) = self.storage.delete_pairing_data() {
            error!(error = %e, "failed to purge partial pairing data");
        }
        self.host.remove_bond(conn);
        self.callbacks.pairing_failed();
        if self.state == AccessoryState::Unpaired && self.config.pairing_mode_auto_enter {
            self.start_pairing_mode();
        }
    }

    // ------------------------------------------------------------------
    // Configuration control point
    // ------------------------------------------------------------------

    fn handle_config_payload(&mut self, conn: ConnHandle, payload: &[u8]) {
        let raw = Frame::raw_opcode(payload).unwrap_or_default();
        let command = Frame::decode(payload).and_then(|frame| OwnerCommand::decode(&frame));
        let command = match command {
            Ok(command) => command,
            Err(e) => {
                warn!(conn, error = %e, "malformed owner command");
                self.respond(conn, raw, Status::from(&e));
                return;
            }
        };

        match self.execute(conn, command) {
            Ok(Some(frame)) => self.host.indicate(conn, ControlPoint::Configuration, &frame),
            Ok(None) => self.respond(conn, raw, Status::Success),
            Err(e) => {
                warn!(conn, ?command, error = %e, "owner command rejected");
                if e.warrants_disconnect() {
                    self.host.disconnect(conn);
                } else {
                    self.respond(conn, raw, e.status());
                }
            }
        }
    }

    fn respond(&mut self, conn: ConnHandle, opcode: u16, status: Status) {
        self.host.indicate(
            conn,
            ControlPoint::Configuration,
            &control::command_response(opcode, status),
        );
    }

    fn require_owner(&self, conn: ConnHandle) -> Result<(), FmnError> {
        let owner = self.conns.active(conn).is_some_and(|r| r.is_owner());
        if self.state == AccessoryState::Connected && owner {
            Ok(())
        } else {
            Err(FmnError::state(format!(
                "command requires a connected owner, accessory is {:?}",
                self.state
            )))
        }
    }

    /// Unpaired accessories answer anyone; paired ones only their owners.
    fn require_authorized(&self, conn: ConnHandle) -> Result<(), FmnError> {
        if self.state.is_paired() {
            self.require_owner(conn)
        } else {
            Ok(())
        }
    }

    /// Run one owner command. `Ok(None)` means "answer with success".
    fn execute(&mut self, conn: ConnHandle, command: OwnerCommand) -> Result<Option<Frame>, FmnError> {
        match command {
            OwnerCommand::SoundStart => {
                self.require_authorized(conn)?;
                if self.conns.multi_status(conn).contains(MultiStatus::PLAYING_SOUND) {
                    return Err(FmnError::state("sound already playing"));
                }
                self.set_status(conn, MultiStatus::PLAYING_SOUND, true);
                self.callbacks.sound_start();
            }
            OwnerCommand::SoundStop => {
                self.require_authorized(conn)?;
                if !self.conns.multi_status(conn).contains(MultiStatus::PLAYING_SOUND) {
                    return Err(FmnError::state("no sound playing"));
                }
                for handle in self.conns.active_handles() {
                    self.set_status(handle, MultiStatus::PLAYING_SOUND, false);
                }
                self.callbacks.sound_stop();
            }
            OwnerCommand::PersistentConnectionStatus { enabled } => {
                self.require_owner(conn)?;
                self.set_status(conn, MultiStatus::PERSISTENT_CONNECTION, enabled);
            }
            OwnerCommand::SetNearbyTimeout { seconds } => {
                self.require_owner(conn)?;
                validate_range("nearby_timeout", seconds, 0, MAX_NEARBY_TIMEOUT_SECS)?;
                self.nearby_timeout_secs = seconds;
                info!(seconds, "nearby timeout updated");
            }
            OwnerCommand::Unpair => {
                self.require_owner(conn)?;
                self.unpair_pending = true;
                info!(conn, "unpair requested");
            }
            OwnerCommand::ConfigureSeparatedState {
                next_primary_key_roll_ms,
                secondary_key_evaluation_index,
            } => {
                self.require_owner(conn)?;
                let period_ms = self.config.key_rotation_period_secs.saturating_mul(1000);
                validate_range(
                    "next_primary_key_roll",
                    u64::from(next_primary_key_roll_ms),
                    0,
                    period_ms,
                )?;
                self.keys
                    .configure_separated_state(&mut self.storage, secondary_key_evaluation_index)?;
                if next_primary_key_roll_ms > 0 {
                    self.arm_rotation(Duration::from_millis(u64::from(next_primary_key_roll_ms)));
                }
            }
            OwnerCommand::LatchSeparatedKey => {
                self.require_owner(conn)?;
                let index = self.keys.latch()?;
                return Ok(Some(control::latch_separated_key_response(index)));
            }
            OwnerCommand::SetMaxConnections { max } => {
                self.require_owner(conn)?;
                validate_range("max_connections", max as usize, 1, MAX_CONNECTIONS)?;
                self.max_connections = max;
                self.refresh_advertising();
            }
            OwnerCommand::SetUtc { epoch_ms } => {
                debug!(epoch_ms, "utc received");
            }
            OwnerCommand::GetMultiStatus => {
                self.require_authorized(conn)?;
                let bits = self.conns.multi_status(conn).bits();
                return Ok(Some(control::multi_status_response(bits)));
            }
        }
        Ok(None)
    }

    fn set_status(&mut self, conn: ConnHandle, flag: MultiStatus, on: bool) {
        if let Some(record) = self.conns.active_mut(conn) {
            record.status.set(flag, on);
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn transition(&mut self, to: AccessoryState) {
        let from = self.state;
        if from != to {
            if from == AccessoryState::Nearby {
                self.cancel(TimerId::NearbySeparated);
            }
            self.state = to;
            info!(?from, ?to, "state transition");
            self.callbacks.state_changed(from, to);
        }
        self.refresh_advertising();
    }

    fn enter_nearby(&mut self) {
        if self.nearby_timeout_secs == 0 {
            self.transition(AccessoryState::Separated);
            return;
        }
        self.arm(
            TimerId::NearbySeparated,
            Duration::from_secs(u64::from(self.nearby_timeout_secs)),
        );
        self.transition(AccessoryState::Nearby);
    }

    fn owner_connected(&mut self, conn: ConnHandle) {
        self.set_status(conn, MultiStatus::OWNER_CONNECTED, true);
        self.maintained = true;
        self.fast_reconnect = false;
        self.cancel(TimerId::PersistentFastAdvertising);
        self.cancel(TimerId::NearbySeparated);
        info!(conn, owners = self.conns.owner_count(), "owner connected");
        self.transition(AccessoryState::Connected);
    }

    fn unpair(&mut self) {
        if let Err(e) = self.storage.delete_pairing_data() {
            error!(error = %e, "unpair failed, staying paired");
            self.enter_nearby();
            return;
        }
        self.keys.stop();
        self.cancel(TimerId::KeyRotation);
        self.cancel(TimerId::NearbySeparated);
        self.unpair_pending = false;
        self.maintained = false;
        info!("unpaired");
        self.callbacks.unpaired();
        self.transition(AccessoryState::Unpaired);
        if self.config.pairing_mode_auto_enter {
            self.start_pairing_mode();
        }
    }

    fn start_pairing_mode(&mut self) {
        self.pairing_mode = true;
        if self.config.pairing_mode_timeout_secs > 0 {
            self.arm(
                TimerId::PairingMode,
                Duration::from_secs(self.config.pairing_mode_timeout_secs),
            );
        }
        self.refresh_advertising();
    }

    /// Disconnect everything and forget per-link state.
    fn shutdown_links(&mut self) {
        for id in self.timers.cancel_all() {
            self.host.cancel_timer(id);
        }
        for conn in self.conns.active_handles() {
            if self.pairing.abort(conn) {
                warn!(conn, "pairing aborted by shutdown");
                if let Err(e) = self.storage.delete_pairing_data() {
                    error!(error = %e, "failed to purge partial pairing data");
                }
                self.host.remove_bond(conn);
                self.callbacks.pairing_failed();
            }
            self.host.disconnect(conn);
        }
        self.conns.clear();
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    fn rotation_period(&self) -> Duration {
        Duration::from_secs(self.config.key_rotation_period_secs)
    }

    fn arm_rotation(&mut self, after: Duration) {
        self.arm(TimerId::KeyRotation, after);
    }

    fn install_ltk(&mut self) {
        if let Some(snapshot) = self.keys.snapshot() {
            self.host.set_long_term_key(&snapshot.ltk);
        }
    }

    fn rotate_keys(&mut self) {
        match self.keys.rotate(&mut self.storage) {
            Ok(rotation) => {
                self.install_ltk();
                self.maintained = self.conns.owner_count() > 0;
                let indication = control::keyroll_indication(rotation.primary_index);
                for conn in self.conns.owner_handles() {
                    self.host.indicate(conn, ControlPoint::Configuration, &indication);
                }
                self.refresh_advertising();
            }
            Err(e) => error!(error = %e, "key rotation failed, retrying next period"),
        }
        self.arm_rotation(self.rotation_period());
    }

    // ------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------

    fn desired_advertisement(&self) -> Option<Advertisement> {
        if self.conns.active_count() >= usize::from(self.max_connections) {
            return None;
        }
        let status = status_byte(self.battery, self.maintained);
        match self.state {
            AccessoryState::Disabled => None,
            AccessoryState::Unpaired => (self.pairing_mode && !self.pairing.in_progress()).then(|| {
                Advertisement::unpaired(&self.product.product_data, &self.product.category, self.battery)
            }),
            AccessoryState::Connected | AccessoryState::Nearby => {
                let snapshot = self.keys.snapshot()?;
                Some(Advertisement::nearby(&snapshot.primary_key, status, self.fast_reconnect))
            }
            AccessoryState::Separated => {
                let snapshot = self.keys.snapshot()?;
                Some(Advertisement::separated(
                    snapshot.separated_key(),
                    &snapshot.primary_key,
                    status,
                ))
            }
        }
    }

    /// Push the advertisement the current state calls for, touching the
    /// host only when it differs from what is already on air.
    fn refresh_advertising(&mut self) {
        let desired = self.desired_advertisement();
        if desired == self.advertising {
            return;
        }
        match &desired {
            Some(adv) => self.host.start_advertising(adv),
            None => self.host.stop_advertising(),
        }
        self.advertising = desired;
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn arm(&mut self, id: TimerId, after: Duration) {
        let generation = self.timers.arm(id);
        self.host.arm_timer(id, generation, after);
    }

    fn cancel(&mut self, id: TimerId) {
        if self.timers.cancel(id) {
            self.host.cancel_timer(id);
        }
    }
}
