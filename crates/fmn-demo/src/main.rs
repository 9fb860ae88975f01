//! FMN demo: runs an accessory against a simulated owner in-process.
//!
//! The owner pairs, reads the encrypted serial number, walks away long
//! enough for the accessory to separate and rotate keys, comes back and
//! finally unpairs.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fmn_core::harness::{provision, OwnerDevice, TestServer};
use fmn_core::serial_number::QuerySource;
use fmn_core::{
    AccessoryConfig, AccessoryHandle, AccessoryService, AccessoryState, BleHost, ConnHandle,
    ControlPoint, FileStorage, InMemoryStorage, NoopCallbacks, SecurityLevel, Storage, StorageKey,
};
use fmn_proto::adv::Advertisement;
use fmn_proto::control::{decode_command_response, OwnerCommand};
use fmn_proto::fragment::fragment;
use fmn_proto::pairing::{PairingData, PairingStatus};
use fmn_proto::{Frame, Opcode};

const OWNER_CONN: ConnHandle = 1;
const WRITE_CHUNK: usize = 180;

#[derive(Parser, Debug)]
#[command(name = "fmn-demo", about = "Find My accessory core demo")]
struct Cli {
    /// Accessory config (TOML). Falls back to FMN_* environment overrides.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persist accessory state here instead of in memory.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Seed for the simulated key server and owner.
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Primary key rotation period used by the demo.
    #[arg(long, default_value_t = 2)]
    rotation_secs: u64,

    /// Rotations to wait for while separated.
    #[arg(long, default_value_t = 3)]
    rotations: u32,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    debug: bool,
}

/// Host that logs radio activity and forwards indications to the owner.
struct DemoHost {
    indications: mpsc::UnboundedSender<(ConnHandle, ControlPoint, Frame)>,
}

impl BleHost for DemoHost {
    fn start_advertising(&mut self, adv: &Advertisement) {
        info!(
            address = ?adv.address.map(hex::encode),
            payload = %hex::encode(&adv.payload),
            interval = adv.interval,
            "advertising"
        );
    }

    fn stop_advertising(&mut self) {
        info!("advertising stopped");
    }

    fn disconnect(&mut self, conn: ConnHandle) {
        info!(conn, "link dropped by accessory");
    }

    fn remove_bond(&mut self, conn: ConnHandle) {
        info!(conn, "bond removed");
    }

    fn indicate(&mut self, conn: ConnHandle, point: ControlPoint, frame: &Frame) {
        let _ = self.indications.send((conn, point, frame.clone()));
    }

    fn set_long_term_key(&mut self, _ltk: &[u8; 16]) {
        info!("long term key updated");
    }
}

struct Owner {
    device: OwnerDevice,
    server: TestServer,
    handle: AccessoryHandle,
    indications: mpsc::UnboundedReceiver<(ConnHandle, ControlPoint, Frame)>,
}

impl Owner {
    async fn send(&self, point: ControlPoint, frame: &Frame) -> anyhow::Result<()> {
        for write in fragment(&frame.encode(), WRITE_CHUNK) {
            self.handle.write(OWNER_CONN, point, write)?;
        }
        Ok(())
    }

    async fn expect(&mut self, opcode: Opcode) -> anyhow::Result<Frame> {
        loop {
            let (conn, _, frame) = timeout(Duration::from_secs(5), self.indications.recv())
                .await
                .context("timed out waiting for an indication")?
                .context("accessory service stopped")?;
            if conn == OWNER_CONN && frame.opcode == opcode {
                return Ok(frame);
            }
            info!(conn, opcode = ?frame.opcode, "indication");
        }
    }

    async fn pair(&mut self) -> anyhow::Result<()> {
        self.handle.connected(OWNER_CONN)?;
        self.handle
            .security_changed(OWNER_CONN, SecurityLevel::Authenticated)?;

        let initiate = self.device.initiate();
        self.send(ControlPoint::Pairing, &initiate.encode()).await?;
        let frame = self.expect(Opcode::SendPairingData).await?;
        let data = PairingData::decode(&frame.body)?;

        let e2 = self.server.open_e2(&data.e2);
        let finalize = self.device.finalize(&self.server, &data, &e2);
        self.send(ControlPoint::Pairing, &finalize.encode()).await?;
        let frame = self.expect(Opcode::SendPairingStatus).await?;
        let status = PairingStatus::decode(&frame.body)?;

        self.send(
            ControlPoint::Pairing,
            &Frame::new(Opcode::PairingComplete, Vec::new()),
        )
        .await?;
        let keys = self.device.complete(&status.c3);
        info!(
            master_public_key = %hex::encode(keys.keys.master_public_key),
            "owner derived pairing keys"
        );
        Ok(())
    }

    async fn command(&mut self, cmd: OwnerCommand) -> anyhow::Result<u16> {
        self.send(ControlPoint::Configuration, &cmd.encode()).await?;
        let frame = self.expect(Opcode::CommandResponse).await?;
        let (_, status) = decode_command_response(&frame.body)?;
        Ok(status)
    }
}

async fn wait_for_state(handle: &AccessoryHandle, want: AccessoryState) -> anyhow::Result<()> {
    for _ in 0..50 {
        if handle.status().await?.state == want {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }
    bail!("accessory never reached {want:?}")
}

async fn run<S: Storage + 'static>(
    cli: &Cli,
    config: AccessoryConfig,
    storage: S,
    server: TestServer,
) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let host = DemoHost { indications: tx };
    let service = AccessoryService::new(config, storage, host, NoopCallbacks)?;
    let (handle, task) = service.spawn();

    let state = handle.enable().await?;
    info!(?state, "accessory enabled");

    let mut owner = Owner {
        device: OwnerDevice::new(cli.seed.wrapping_add(1)),
        server,
        handle: handle.clone(),
        indications: rx,
    };

    if state == AccessoryState::Unpaired {
        owner.pair().await?;
        wait_for_state(&handle, AccessoryState::Connected).await?;

        let payload = handle.serial_number(QuerySource::Gatt).await?;
        let plain = owner.server.open(&payload);
        info!(
            serial = %String::from_utf8_lossy(&plain[..16]),
            counter = u64::from_le_bytes(plain[16..24].try_into()?),
            "serial number verified by server"
        );

        owner.command(OwnerCommand::SetNearbyTimeout { seconds: 1 }).await?;
        handle.disconnected(OWNER_CONN)?;
    }

    wait_for_state(&handle, AccessoryState::Separated).await?;
    let start = handle.keys().current().map(|k| k.primary_index).unwrap_or(0);
    let separated_for = Duration::from_secs(cli.rotation_secs * u64::from(cli.rotations));
    sleep(separated_for + Duration::from_millis(500)).await;
    let report = handle.status().await?;
    info!(
        from = start,
        to = ?report.primary_index,
        separated_key = ?handle.keys().separated_key().map(hex::encode),
        "keys rotated while separated"
    );

    // Owner comes back and unpairs.
    handle.connected(OWNER_CONN)?;
    handle.security_changed(OWNER_CONN, SecurityLevel::Encrypted)?;
    wait_for_state(&handle, AccessoryState::Connected).await?;
    let status = owner.command(OwnerCommand::Unpair).await?;
    info!(status, "unpair acknowledged");
    handle.disconnected(OWNER_CONN)?;
    wait_for_state(&handle, AccessoryState::Unpaired).await?;

    handle.disable().await?;
    handle.shutdown()?;
    let accessory = task.await?;
    info!(
        paired = accessory.storage().load(StorageKey::MasterPublicKey)?.is_some(),
        "demo finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = match &cli.config {
        Some(path) => AccessoryConfig::load_from_file(path)?,
        None => AccessoryConfig::load_from_env(),
    };
    let server = TestServer::new(cli.seed);
    let config = AccessoryConfig {
        server_keys: Some(server.keys_config()),
        key_rotation_period_secs: cli.rotation_secs,
        ..config
    };
    config.validate()?;

    match &cli.state_dir {
        Some(dir) => {
            let mut storage = FileStorage::open(dir)?;
            if storage.load(StorageKey::SerialNumber)?.is_none() {
                provision(&mut storage);
                info!(dir = %dir.display(), "provisioned new accessory");
            }
            run(&cli, config, storage, server).await
        }
        None => {
            let mut storage = InMemoryStorage::new();
            provision(&mut storage);
            run(&cli, config, storage, server).await
        }
    }
}
