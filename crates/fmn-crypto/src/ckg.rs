//! Cooperative key generation.
//!
//! Accessory and owner each contribute a P-224 share so that neither side
//! alone picks the master key `P = S' + s*G`:
//!
//! 1. accessory -> owner: `C1 = SHA256(s || r1)`
//! 2. owner -> accessory: `C2 = S' || r2`
//! 3. accessory -> owner: `C3 = s || r1`, which the owner checks against `C1`
//!
//! Both sides then derive `SKN || SKS = KDF(x(P), r1 || r2, 64)`.

use constant_time_eq::constant_time_eq;
use p224::elliptic_curve::ff::PrimeField;
use rand_core::CryptoRngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::ec::{self, P224_POINT_LEN, P224_SCALAR_LEN};
use crate::error::{CryptoError, Result};
use crate::hash::sha256;
use crate::kdf::kdf;

pub const C1_LEN: usize = 32;
pub const C2_LEN: usize = P224_POINT_LEN + NONCE_LEN;
pub const C3_LEN: usize = P224_SCALAR_LEN + NONCE_LEN;
const NONCE_LEN: usize = 32;

/// Keys agreed by a completed exchange.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CkgOutput {
    #[zeroize(skip)]
    pub master_public_key: [u8; P224_POINT_LEN],
    pub primary_sk: [u8; 32],
    pub secondary_sk: [u8; 32],
}

impl core::fmt::Debug for CkgOutput {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CkgOutput")
            .field("master_public_key", &hex_prefix(&self.master_public_key))
            .finish_non_exhaustive()
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

fn derive_output(p: &p224::PublicKey, r1: &[u8; 32], r2: &[u8; 32]) -> Result<CkgOutput> {
    let x = ec::p224_x(p);
    let mut info = Zeroizing::new([0u8; 64]);
    info[..32].copy_from_slice(r1);
    info[32..].copy_from_slice(r2);
    let keys = kdf::<64>(&x, info.as_slice())?;

    let mut out = CkgOutput {
        master_public_key: ec::export_p224_point(p),
        primary_sk: [0u8; 32],
        secondary_sk: [0u8; 32],
    };
    out.primary_sk.copy_from_slice(&keys[..32]);
    out.secondary_sk.copy_from_slice(&keys[32..]);
    Ok(out)
}

/// Accessory side of the exchange.
pub struct CkgContext {
    secret: p224::SecretKey,
    r1: Zeroizing<[u8; 32]>,
    r2: Option<Zeroizing<[u8; 32]>>,
    point: Option<p224::PublicKey>,
}

impl CkgContext {
    pub fn init<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Result<Self> {
        let secret = ec::generate_p224_keypair(rng)?;
        let mut r1 = Zeroizing::new([0u8; 32]);
        ec::generate_random(rng, r1.as_mut_slice())?;
        Ok(Self {
            secret,
            r1,
            r2: None,
            point: None,
        })
    }

    fn reveal(&self) -> Zeroizing<[u8; C3_LEN]> {
        let mut c3 = Zeroizing::new([0u8; C3_LEN]);
        c3[..P224_SCALAR_LEN].copy_from_slice(ec::p224_secret_bytes(&self.secret).as_slice());
        c3[P224_SCALAR_LEN..].copy_from_slice(self.r1.as_slice());
        c3
    }

    /// Commitment `SHA256(s || r1)`.
    pub fn gen_c1(&self) -> [u8; C1_LEN] {
        sha256(self.reveal().as_slice())
    }

    /// Consume the owner's `C2` and reveal `C3`.
    pub fn gen_c3(&mut self, c2: &[u8]) -> Result<Zeroizing<[u8; C3_LEN]>> {
        if c2.len() != C2_LEN {
            return Err(CryptoError::InvalidInput("c2 length"));
        }
        let (s_prime, r2) = c2.split_at(P224_POINT_LEN);
        let s_prime = ec::import_p224_point(s_prime)?;
        let point = ec::points_add(&s_prime, &self.secret.public_key())?;

        let mut stored = Zeroizing::new([0u8; NONCE_LEN]);
        stored.copy_from_slice(r2);
        self.r2 = Some(stored);
        self.point = Some(point);
        Ok(self.reveal())
    }

    /// Derive the agreed master key and seeds.
    pub fn finish(&self) -> Result<CkgOutput> {
        match (&self.point, &self.r2) {
            (Some(p), Some(r2)) => derive_output(p, &self.r1, r2),
            _ => Err(CryptoError::InvalidInput("ckg not advanced to c3")),
        }
    }
}

/// Owner side of the exchange, used by simulators and tests.
pub struct OwnerCkg {
    secret: p224::SecretKey,
    r2: Zeroizing<[u8; 32]>,
    c1: [u8; C1_LEN],
}

/// What the owner learns: the agreed keys plus the master private scalar.
pub struct OwnerCkgOutput {
    pub keys: CkgOutput,
    pub master_secret: Zeroizing<[u8; P224_SCALAR_LEN]>,
}

impl OwnerCkg {
    /// Answer `C1` with `C2 = S' || r2`.
    pub fn respond<R: CryptoRngCore + ?Sized>(
        rng: &mut R,
        c1: &[u8; C1_LEN],
    ) -> Result<(Self, [u8; C2_LEN])> {
        let secret = ec::generate_p224_keypair(rng)?;
        let mut r2 = Zeroizing::new([0u8; 32]);
        ec::generate_random(rng, r2.as_mut_slice())?;

        let mut c2 = [0u8; C2_LEN];
        c2[..P224_POINT_LEN].copy_from_slice(&ec::export_p224_point(&secret.public_key()));
        c2[P224_POINT_LEN..].copy_from_slice(r2.as_slice());
        Ok((Self { secret, r2, c1: *c1 }, c2))
    }

    /// Check `C3` against the commitment and derive the same keys.
    pub fn finish(self, c3: &[u8]) -> Result<OwnerCkgOutput> {
        if c3.len() != C3_LEN {
            return Err(CryptoError::InvalidInput("c3 length"));
        }
        if !constant_time_eq(&sha256(c3), &self.c1) {
            return Err(CryptoError::AuthenticationFailure);
        }
        let (s, r1) = c3.split_at(P224_SCALAR_LEN);
        let s_point = ec::scalar_mult(s, None)?;
        let point = ec::points_add(&self.secret.public_key(), &s_point)?;

        let mut r1_arr = Zeroizing::new([0u8; 32]);
        r1_arr.copy_from_slice(r1);
        let keys = derive_output(&point, &r1_arr, &self.r2)?;

        let s = Option::<p224::Scalar>::from(p224::Scalar::from_repr(
            p224::FieldBytes::clone_from_slice(s),
        ))
        .ok_or(CryptoError::InvalidInput("c3 scalar"))?;
        let d = s + *self.secret.to_nonzero_scalar();
        let mut master_secret = Zeroizing::new([0u8; P224_SCALAR_LEN]);
        master_secret.copy_from_slice(&d.to_repr());

        Ok(OwnerCkgOutput { keys, master_secret })
    }
}
