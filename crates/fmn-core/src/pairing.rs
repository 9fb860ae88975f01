//! Pairing handshake state machine.
//!
//! Accessory side of the three-command handshake:
//!
//! 1. `InitiatePairing(nonce, E1)` -> `SendPairingData(C1, E2)`
//! 2. `FinalizePairing(C2, E3, seeds, iCloud id, S2)` -> `SendPairingStatus(C3, 0, E4)`
//! 3. `PairingComplete` -> keys handed to the rotation service
//!
//! At most one session exists accessory-wide. It is bound to the connection
//! that first reached an authenticated security level; every other
//! connection is refused.

use bytes::Bytes;
use fmn_crypto::ckg::{CkgContext, CkgOutput};
use fmn_crypto::ecies::encrypt_to_server;
use fmn_crypto::ec::generate_random;
use fmn_crypto::hash::sha256;
use fmn_crypto::keys::{decrypt_e3, derive_server_shared_secret, verify_s2};
use fmn_proto::pairing::{FinalizePairing, InitiatePairing, PairingData, PairingStatus};
use fmn_proto::validation::sizes;
use rand_core::CryptoRngCore;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::{ProductInfo, ServerKeys};
use crate::conn::ConnHandle;
use crate::errors::FmnError;
use crate::storage::{Storage, StorageKey};

/// Status reported in `SendPairingStatus` on success.
pub const PAIRING_STATUS_SUCCESS: u32 = 0;

// ============================================================================
// Session
// ============================================================================

enum Stage {
    /// Link authenticated, waiting for `InitiatePairing`.
    AwaitingInitiate,
    AwaitingFinalize {
        session_nonce: [u8; sizes::SESSION_NONCE],
        e1: Box<[u8; sizes::E1]>,
        seed_k1: Zeroizing<[u8; sizes::SEED_K1]>,
        ckg: CkgContext,
    },
    AwaitingComplete {
        ckg: CkgContext,
    },
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::AwaitingInitiate => "awaiting_initiate",
            Stage::AwaitingFinalize { .. } => "awaiting_finalize",
            Stage::AwaitingComplete { .. } => "awaiting_complete",
        }
    }
}

struct PairingSession {
    conn: ConnHandle,
    stage: Stage,
}

/// Provisioned identity read from storage before the first pairing.
struct Provisioning {
    uuid: [u8; sizes::SW_AUTH_UUID],
    serial: [u8; sizes::SERIAL_NUMBER],
    token: Zeroizing<[u8; sizes::SW_AUTH_TOKEN]>,
}

impl Provisioning {
    fn load<S: Storage>(storage: &S) -> Result<Self, FmnError> {
        let missing = |what: &str| FmnError::state(format!("accessory not provisioned: missing {what}"));
        let uuid = storage
            .load_array::<{ sizes::SW_AUTH_UUID }>(StorageKey::SoftwareAuthUuid)?
            .ok_or_else(|| missing("software auth uuid"))?;
        let serial = storage
            .load_array::<{ sizes::SERIAL_NUMBER }>(StorageKey::SerialNumber)?
            .ok_or_else(|| missing("serial number"))?;
        let token = storage
            .load_array::<{ sizes::SW_AUTH_TOKEN }>(StorageKey::SoftwareAuthToken)?
            .ok_or_else(|| missing("software auth token"))?;
        Ok(Self {
            uuid: *uuid,
            serial: *serial,
            token,
        })
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Owns the single pairing session.
#[derive(Default)]
pub struct PairingManager {
    session: Option<PairingSession>,
}

impl PairingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection holding the session, if any.
    pub fn owner(&self) -> Option<ConnHandle> {
        self.session.as_ref().map(|s| s.conn)
    }

    pub fn in_progress(&self) -> bool {
        self.session.is_some()
    }

    /// Open a session for `conn` after its link was authenticated.
    pub fn begin(&mut self, conn: ConnHandle) -> Result<(), FmnError> {
        match &self.session {
            Some(s) if s.conn == conn => Ok(()),
            Some(s) => Err(FmnError::state(format!(
                "pairing already in progress on connection {}",
                s.conn
            ))),
            None => {
                self.session = Some(PairingSession {
                    conn,
                    stage: Stage::AwaitingInitiate,
                });
                debug!(conn, "pairing session opened");
                Ok(())
            }
        }
    }

    /// Drop the session if `conn` holds it. Returns whether it did.
    pub fn abort(&mut self, conn: ConnHandle) -> bool {
        if self.owner() == Some(conn) {
            let stage = self.session.take().map(|s| s.stage.name()).unwrap_or_default();
            warn!(conn, stage, "pairing session aborted");
            true
        } else {
            false
        }
    }

    fn session_for(&mut self, conn: ConnHandle) -> Result<&mut PairingSession, FmnError> {
        match self.session.as_mut() {
            Some(s) if s.conn == conn => Ok(s),
            Some(_) => Err(FmnError::state("pairing command from a connection without the session")),
            None => Err(FmnError::state("no pairing session")),
        }
    }

    /// Handle `InitiatePairing` and build `SendPairingData`.
    pub fn handle_initiate<S: Storage, R: CryptoRngCore + ?Sized>(
        &mut self,
        conn: ConnHandle,
        msg: &InitiatePairing,
        storage: &S,
        rng: &mut R,
        server_keys: &ServerKeys,
        product: &ProductInfo,
    ) -> Result<PairingData, FmnError> {
        let session = self.session_for(conn)?;
        if !matches!(session.stage, Stage::AwaitingInitiate) {
            return Err(FmnError::state(format!(
                "InitiatePairing while {}",
                session.stage.name()
            )));
        }
        let provisioning = Provisioning::load(storage)?;

        let ckg = CkgContext::init(rng)?;
        let c1 = ckg.gen_c1();
        let mut seed_k1 = Zeroizing::new([0u8; sizes::SEED_K1]);
        generate_random(rng, seed_k1.as_mut_slice())?;

        let mut plaintext = Zeroizing::new(Vec::with_capacity(sizes::E2_PLAINTEXT));
        plaintext.extend_from_slice(&msg.session_nonce);
        plaintext.extend_from_slice(provisioning.token.as_slice());
        plaintext.extend_from_slice(&provisioning.uuid);
        plaintext.extend_from_slice(&provisioning.serial);
        plaintext.extend_from_slice(&product.product_data);
        plaintext.extend_from_slice(&product.fw_version.to_le_bytes());
        plaintext.extend_from_slice(&msg.e1);
        plaintext.extend_from_slice(seed_k1.as_slice());
        let e2 = encrypt_to_server(rng, &server_keys.encryption_key, &plaintext)?;
        let response = PairingData::new(c1, Bytes::from(e2))?;

        session.stage = Stage::AwaitingFinalize {
            session_nonce: msg.session_nonce,
            e1: Box::new(msg.e1),
            seed_k1,
            ckg,
        };
        debug!(conn, "pairing data sent");
        Ok(response)
    }

    /// Handle `FinalizePairing` and build `SendPairingStatus`.
    ///
    /// On error the caller must [`abort`](Self::abort) the session and
    /// delete whatever pairing data was already written.
    pub fn handle_finalize<S: Storage, R: CryptoRngCore + ?Sized>(
        &mut self,
        conn: ConnHandle,
        msg: &FinalizePairing,
        storage: &mut S,
        rng: &mut R,
        server_keys: &ServerKeys,
    ) -> Result<PairingStatus, FmnError> {
        let session = self.session_for(conn)?;
        let Stage::AwaitingFinalize {
            session_nonce,
            e1,
            seed_k1,
            ckg,
        } = &mut session.stage
        else {
            return Err(FmnError::state(format!(
                "FinalizePairing while {}",
                session.stage.name()
            )));
        };
        let provisioning = Provisioning::load(storage)?;

        let server_shared_secret = derive_server_shared_secret(&msg.seeds, seed_k1)?;

        let h1 = sha256(&msg.c2);
        let mut signed = Vec::with_capacity(
            sizes::SW_AUTH_UUID + sizes::SESSION_NONCE + sizes::SEEDS + h1.len() + sizes::E1 + sizes::E3,
        );
        signed.extend_from_slice(&provisioning.uuid);
        signed.extend_from_slice(&session_nonce[..]);
        signed.extend_from_slice(&msg.seeds);
        signed.extend_from_slice(&h1);
        signed.extend_from_slice(e1.as_slice());
        signed.extend_from_slice(&msg.e3);
        if let Err(e) = verify_s2(&server_keys.signature_key, &msg.s2, &signed) {
            warn!(conn, "S2 verification failed");
            return Err(e.into());
        }

        let new_token = decrypt_e3(&server_shared_secret, &msg.e3)?;
        if new_token.len() != sizes::SW_AUTH_TOKEN {
            return Err(FmnError::InvalidInput(format!(
                "decrypted token is {} bytes",
                new_token.len()
            )));
        }
        storage.save(StorageKey::SoftwareAuthToken, &new_token)?;
        storage.save(StorageKey::ServerSharedSecret, server_shared_secret.as_slice())?;
        storage.save(StorageKey::SnQueryCounter, &0u64.to_le_bytes())?;
        storage.save(StorageKey::IcloudId, &msg.icloud_id)?;

        let c3 = ckg.gen_c3(&msg.c2)?;

        let mut plaintext = Zeroizing::new(Vec::with_capacity(sizes::E4_PLAINTEXT));
        plaintext.extend_from_slice(&provisioning.uuid);
        plaintext.extend_from_slice(&provisioning.serial);
        plaintext.extend_from_slice(&session_nonce[..]);
        plaintext.extend_from_slice(e1.as_slice());
        plaintext.extend_from_slice(&new_token);
        plaintext.extend_from_slice(&PAIRING_STATUS_SUCCESS.to_le_bytes());
        let e4 = encrypt_to_server(rng, &server_keys.encryption_key, &plaintext)?;

        let mut c3_out = [0u8; sizes::C3];
        c3_out.copy_from_slice(c3.as_slice());
        let response = PairingStatus::new(c3_out, PAIRING_STATUS_SUCCESS, Bytes::from(e4))?;

        let stage = std::mem::replace(&mut session.stage, Stage::AwaitingInitiate);
        if let Stage::AwaitingFinalize { ckg, .. } = stage {
            session.stage = Stage::AwaitingComplete { ckg };
        }
        debug!(conn, "pairing status sent");
        Ok(response)
    }

    /// Handle `PairingComplete`: close the session and return the agreed keys.
    pub fn handle_complete(&mut self, conn: ConnHandle) -> Result<CkgOutput, FmnError> {
        let session = self.session_for(conn)?;
        if !matches!(session.stage, Stage::AwaitingComplete { .. }) {
            return Err(FmnError::state(format!(
                "PairingComplete while {}",
                session.stage.name()
            )));
        }
        let Some(PairingSession {
            stage: Stage::AwaitingComplete { ckg },
            ..
        }) = self.session.take()
        else {
            return Err(FmnError::state("pairing session vanished"));
        };
        let keys = ckg.finish()?;
        info!(conn, "pairing handshake complete");
        Ok(keys)
    }
}
