//! Serialized accessory service.
//!
//! A single tokio task owns the [`Accessory`]. BLE callbacks, GATT writes and
//! timer expiries arrive as [`Event`]s over an unbounded channel, so the
//! producer side never blocks and events are handled strictly in arrival
//! order. Timers are `tokio::time::sleep` tasks that post
//! [`Event::TimerExpired`] back into the same channel.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use fmn_proto::adv::{Advertisement, BatteryState};
use fmn_proto::Frame;
use rand_core::CryptoRngCore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::accessory::{Accessory, AccessoryState};
use crate::config::AccessoryConfig;
use crate::conn::{ConnHandle, SecurityLevel};
use crate::errors::FmnError;
use crate::host::{AccessoryCallbacks, BleHost, ControlPoint, TimerHost};
use crate::keys::KeyReader;
use crate::serial_number::QuerySource;
use crate::storage::Storage;
use crate::timer::TimerId;

type Reply<T> = oneshot::Sender<T>;

/// Everything that can happen to the accessory.
#[derive(Debug)]
pub enum Event {
    Connected(ConnHandle),
    SecurityChanged(ConnHandle, SecurityLevel),
    SecurityFailed(ConnHandle),
    Disconnected(ConnHandle),
    Write {
        conn: ConnHandle,
        point: ControlPoint,
        data: Bytes,
    },
    TimerExpired {
        id: TimerId,
        generation: u64,
    },
    SetBattery(BatteryState),
    SoundCompleted,
    Enable(Reply<Result<AccessoryState, FmnError>>),
    Disable(Reply<()>),
    EnterPairingMode(Reply<Result<(), FmnError>>),
    FactoryReset(Reply<Result<(), FmnError>>),
    SerialNumber(QuerySource, Reply<Result<Vec<u8>, FmnError>>),
    Status(Reply<StatusReport>),
    Shutdown,
}

/// Point-in-time view of the accessory, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: AccessoryState,
    pub advertising: Option<Advertisement>,
    pub primary_index: Option<u32>,
    pub active_connections: usize,
    pub owner_connections: usize,
    pub pairing_in_progress: bool,
    pub unpair_pending: bool,
}

// ============================================================================
// Host adapter
// ============================================================================

/// Wraps a [`BleHost`] and realizes timers as sleeping tokio tasks.
pub struct ServiceHost<B> {
    ble: B,
    events: mpsc::WeakUnboundedSender<Event>,
    /// Sleep task per timer, tagged with the generation it will report.
    timers: HashMap<TimerId, (u64, JoinHandle<()>)>,
}

impl<B: BleHost> ServiceHost<B> {
    fn new(ble: B, events: mpsc::WeakUnboundedSender<Event>) -> Self {
        Self {
            ble,
            events,
            timers: HashMap::new(),
        }
    }

    pub fn ble(&self) -> &B {
        &self.ble
    }

    /// Forget the task behind an expiry, unless a newer arm replaced it.
    fn expired(&mut self, id: TimerId, generation: u64) {
        if self.timers.get(&id).is_some_and(|(armed, _)| *armed == generation) {
            self.timers.remove(&id);
        }
    }
}

impl<B: BleHost> BleHost for ServiceHost<B> {
    fn start_advertising(&mut self, adv: &Advertisement) {
        self.ble.start_advertising(adv);
    }

    fn stop_advertising(&mut self) {
        self.ble.stop_advertising();
    }

    fn disconnect(&mut self, conn: ConnHandle) {
        self.ble.disconnect(conn);
    }

    fn remove_bond(&mut self, conn: ConnHandle) {
        self.ble.remove_bond(conn);
    }

    fn indicate(&mut self, conn: ConnHandle, point: ControlPoint, frame: &Frame) {
        self.ble.indicate(conn, point, frame);
    }

    fn set_long_term_key(&mut self, ltk: &[u8; 16]) {
        self.ble.set_long_term_key(ltk);
    }
}

impl<B: BleHost> TimerHost for ServiceHost<B> {
    fn arm_timer(&mut self, id: TimerId, generation: u64, after: Duration) {
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(events) = events.upgrade() {
                let _ = events.send(Event::TimerExpired { id, generation });
            }
        });
        if let Some((_, previous)) = self.timers.insert(id, (generation, task)) {
            previous.abort();
        }
    }

    fn cancel_timer(&mut self, id: TimerId) {
        if let Some((_, task)) = self.timers.remove(&id) {
            task.abort();
        }
    }
}

impl<B> Drop for ServiceHost<B> {
    fn drop(&mut self) {
        for (_, (_, task)) in self.timers.drain() {
            task.abort();
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable producer side of the service.
#[derive(Clone)]
pub struct AccessoryHandle {
    events: mpsc::UnboundedSender<Event>,
    enable_timeout: Duration,
    keys: KeyReader,
}

impl AccessoryHandle {
    fn send(&self, event: Event) -> Result<(), FmnError> {
        self.events
            .send(event)
            .map_err(|_| FmnError::state("accessory service stopped"))
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Event) -> Result<T, FmnError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| FmnError::state("accessory service stopped"))
    }

    /// Bounded rendezvous for enable/disable. Expiry means the serialized
    /// context is wedged; there is nothing sane left to do.
    async fn rendezvous<T>(&self, make: impl FnOnce(Reply<T>) -> Event) -> Result<T, FmnError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        match tokio::time::timeout(self.enable_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(FmnError::state("accessory service stopped")),
            Err(_) => {
                error!(timeout = ?self.enable_timeout, "accessory enable/disable timed out");
                std::process::abort();
            }
        }
    }

    pub fn connected(&self, conn: ConnHandle) -> Result<(), FmnError> {
        self.send(Event::Connected(conn))
    }

    pub fn security_changed(&self, conn: ConnHandle, level: SecurityLevel) -> Result<(), FmnError> {
        self.send(Event::SecurityChanged(conn, level))
    }

    pub fn security_failed(&self, conn: ConnHandle) -> Result<(), FmnError> {
        self.send(Event::SecurityFailed(conn))
    }

    pub fn disconnected(&self, conn: ConnHandle) -> Result<(), FmnError> {
        self.send(Event::Disconnected(conn))
    }

    pub fn write(&self, conn: ConnHandle, point: ControlPoint, data: impl Into<Bytes>) -> Result<(), FmnError> {
        self.send(Event::Write {
            conn,
            point,
            data: data.into(),
        })
    }

    pub fn set_battery(&self, battery: BatteryState) -> Result<(), FmnError> {
        self.send(Event::SetBattery(battery))
    }

    pub fn sound_completed(&self) -> Result<(), FmnError> {
        self.send(Event::SoundCompleted)
    }

    pub async fn enable(&self) -> Result<AccessoryState, FmnError> {
        self.rendezvous(Event::Enable).await?
    }

    pub async fn disable(&self) -> Result<(), FmnError> {
        self.rendezvous(Event::Disable).await
    }

    pub async fn enter_pairing_mode(&self) -> Result<(), FmnError> {
        self.request(Event::EnterPairingMode).await?
    }

    pub async fn factory_reset(&self) -> Result<(), FmnError> {
        self.request(Event::FactoryReset).await?
    }

    pub async fn serial_number(&self, source: QuerySource) -> Result<Vec<u8>, FmnError> {
        self.request(|tx| Event::SerialNumber(source, tx)).await?
    }

    pub async fn status(&self) -> Result<StatusReport, FmnError> {
        self.request(Event::Status).await
    }

    /// Ask the service task to exit after the events already queued.
    pub fn shutdown(&self) -> Result<(), FmnError> {
        self.send(Event::Shutdown)
    }

    /// Lock-free view of the current rotating keys.
    pub fn keys(&self) -> &KeyReader {
        &self.keys
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct AccessoryService<S, B, C> {
    accessory: Accessory<S, ServiceHost<B>, C>,
    events: mpsc::UnboundedReceiver<Event>,
    handle: AccessoryHandle,
}

impl<S, B, C> AccessoryService<S, B, C>
where
    S: Storage + 'static,
    B: BleHost + 'static,
    C: AccessoryCallbacks + 'static,
{
    pub fn new(config: AccessoryConfig, storage: S, ble: B, callbacks: C) -> Result<Self, FmnError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let enable_timeout = Duration::from_secs(config.enable_timeout_secs);
        let accessory = Accessory::new(config, storage, ServiceHost::new(ble, tx.downgrade()), callbacks)?;
        let handle = AccessoryHandle {
            events: tx,
            enable_timeout,
            keys: accessory.key_reader(),
        };
        Ok(Self {
            accessory,
            events: rx,
            handle,
        })
    }

    pub fn with_rng(mut self, rng: impl CryptoRngCore + Send + 'static) -> Self {
        self.accessory = self.accessory.with_rng(rng);
        self
    }

    pub fn handle(&self) -> AccessoryHandle {
        self.handle.clone()
    }

    /// Spawn the event loop on the current runtime.
    pub fn spawn(self) -> (AccessoryHandle, JoinHandle<Accessory<S, ServiceHost<B>, C>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Process events until [`Event::Shutdown`] or every handle is dropped,
    /// then hand the accessory back.
    pub async fn run(self) -> Accessory<S, ServiceHost<B>, C> {
        let AccessoryService {
            mut accessory,
            mut events,
            handle,
        } = self;
        // Timer tasks only hold weak senders, so the loop ends once the
        // last external handle is gone.
        drop(handle);
        info!("accessory service started");
        while let Some(event) = events.recv().await {
            if !dispatch(&mut accessory, event) {
                break;
            }
        }
        accessory.disable();
        info!("accessory service stopped");
        accessory
    }
}

/// Apply one event. Returns `false` when the loop should exit.
fn dispatch<S, B, C>(accessory: &mut Accessory<S, ServiceHost<B>, C>, event: Event) -> bool
where
    S: Storage,
    B: BleHost,
    C: AccessoryCallbacks,
{
    debug!(?event, "service event");
    match event {
        Event::Connected(conn) => accessory.on_connected(conn),
        Event::SecurityChanged(conn, level) => accessory.on_security_changed(conn, level),
        Event::SecurityFailed(conn) => accessory.on_security_failed(conn),
        Event::Disconnected(conn) => accessory.on_disconnected(conn),
        Event::Write { conn, point, data } => accessory.handle_write(conn, point, &data),
        Event::TimerExpired { id, generation } => {
            accessory.host_mut().expired(id, generation);
            accessory.handle_timer(id, generation);
        }
        Event::SetBattery(battery) => accessory.set_battery(battery),
        Event::SoundCompleted => accessory.sound_completed(),
        Event::Enable(reply) => {
            let _ = reply.send(accessory.enable());
        }
        Event::Disable(reply) => {
            accessory.disable();
            let _ = reply.send(());
        }
        Event::EnterPairingMode(reply) => {
            let _ = reply.send(accessory.enter_pairing_mode());
        }
        Event::FactoryReset(reply) => {
            let _ = reply.send(accessory.factory_reset());
        }
        Event::SerialNumber(source, reply) => {
            let _ = reply.send(accessory.serial_number_payload(source));
        }
        Event::Status(reply) => {
            let _ = reply.send(status_report(accessory));
        }
        Event::Shutdown => return false,
    }
    true
}

fn status_report<S, H, C>(accessory: &Accessory<S, H, C>) -> StatusReport
where
    S: Storage,
    H: BleHost + TimerHost,
    C: AccessoryCallbacks,
{
    StatusReport {
        state: accessory.state(),
        advertising: accessory.advertisement().cloned(),
        primary_index: accessory.key_reader().current().map(|k| k.primary_index),
        active_connections: accessory.connections().active_count(),
        owner_connections: accessory.connections().owner_count(),
        pairing_in_progress: accessory.pairing_in_progress(),
        unpair_pending: accessory.unpair_pending(),
    }
}
