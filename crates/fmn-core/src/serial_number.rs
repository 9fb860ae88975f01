//! Encrypted serial number responses.
//!
//! A paired accessory never reveals its serial number in the clear. Each
//! query returns `ECIES(server, serial || counter || HMAC || op)` where the
//! HMAC key is derived from the server shared secret, and the counter is
//! bumped and persisted before the payload is built so a replayed response
//! is always detectable.

use fmn_crypto::ecies::{encrypt_to_server, OVERHEAD};
use fmn_crypto::keys::authenticate_with_ksn;
use fmn_proto::validation::sizes;
use rand_core::CryptoRngCore;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::ServerKeys;
use crate::errors::FmnError;
use crate::storage::{Storage, StorageKey};

const COUNTER_LEN: usize = 8;
const HMAC_LEN: usize = 32;
const OP_LEN: usize = 4;

pub const PLAINTEXT_LEN: usize = sizes::SERIAL_NUMBER + COUNTER_LEN + HMAC_LEN + OP_LEN;
pub const PAYLOAD_LEN: usize = PLAINTEXT_LEN + OVERHEAD;

/// Where the query came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySource {
    Gatt,
    Nfc,
}

impl QuerySource {
    pub fn op(self) -> &'static [u8; OP_LEN] {
        match self {
            QuerySource::Gatt => b"BTLE",
            QuerySource::Nfc => b"Tap ",
        }
    }
}

/// Build the encrypted serial number payload.
pub fn encrypted_serial_number<S: Storage, R: CryptoRngCore + ?Sized>(
    storage: &mut S,
    rng: &mut R,
    server_keys: &ServerKeys,
    source: QuerySource,
) -> Result<Vec<u8>, FmnError> {
    let serial = storage
        .load_array::<{ sizes::SERIAL_NUMBER }>(StorageKey::SerialNumber)?
        .ok_or_else(|| FmnError::state("serial number not provisioned"))?;
    let server_shared_secret = storage
        .load_array::<{ sizes::SERVER_SHARED_SECRET }>(StorageKey::ServerSharedSecret)?
        .ok_or_else(|| FmnError::state("serial number query while unpaired"))?;

    let counter = storage
        .load_u64(StorageKey::SnQueryCounter)?
        .unwrap_or(0)
        .checked_add(1)
        .ok_or_else(|| FmnError::state("serial number query counter exhausted"))?;
    storage.save(StorageKey::SnQueryCounter, &counter.to_le_bytes())?;

    let op = source.op();
    let mut authenticated = [0u8; sizes::SERIAL_NUMBER + COUNTER_LEN + OP_LEN];
    authenticated[..sizes::SERIAL_NUMBER].copy_from_slice(serial.as_slice());
    authenticated[sizes::SERIAL_NUMBER..sizes::SERIAL_NUMBER + COUNTER_LEN]
        .copy_from_slice(&counter.to_le_bytes());
    authenticated[sizes::SERIAL_NUMBER + COUNTER_LEN..].copy_from_slice(op);
    let hmac = authenticate_with_ksn(&server_shared_secret, &authenticated)?;

    let mut plaintext = Zeroizing::new(Vec::with_capacity(PLAINTEXT_LEN));
    plaintext.extend_from_slice(serial.as_slice());
    plaintext.extend_from_slice(&counter.to_le_bytes());
    plaintext.extend_from_slice(&hmac);
    plaintext.extend_from_slice(op);

    let payload = encrypt_to_server(rng, &server_keys.encryption_key, &plaintext)?;
    debug!(counter, "serial number payload built");
    Ok(payload)
}
