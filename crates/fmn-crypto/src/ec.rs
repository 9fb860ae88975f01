//! P-224 and P-256 point and scalar operations.
//!
//! Every import of an untrusted point checks the uncompressed `0x04` tag,
//! the exact length, and curve membership before the point is used.

use crypto_bigint::{Encoding, NonZero, U384};
use p224::elliptic_curve::ff::PrimeField;
use p224::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::CryptoRngCore;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoError, Result};

pub const P224_SCALAR_LEN: usize = 28;
pub const P224_POINT_LEN: usize = 57;
pub const P256_SCALAR_LEN: usize = 32;
pub const P256_POINT_LEN: usize = 65;
/// Pre-scalars are 36 bytes: enough bias-free headroom over the 224-bit order.
pub const PRE_SCALAR_LEN: usize = 36;

const UNCOMPRESSED_TAG: u8 = 0x04;
const MAX_KEYGEN_ATTEMPTS: usize = 64;

/// P-224 group order minus one, zero extended to 384 bits.
const P224_ORDER_MINUS_ONE: U384 = U384::from_be_hex(concat!(
    "0000000000000000000000000000000000000000",
    "FFFFFFFFFFFFFFFFFFFFFFFFFFFF16A2E0B8F03E13DD29455C5C2A3C",
));

/// Fill `buf` with randomness, surfacing RNG failure instead of panicking.
pub fn generate_random<R: CryptoRngCore + ?Sized>(rng: &mut R, buf: &mut [u8]) -> Result<()> {
    rng.try_fill_bytes(buf).map_err(|_| {
        buf.zeroize();
        CryptoError::RngError
    })
}

fn generate_secret<R, K>(
    rng: &mut R,
    len: usize,
    parse: impl Fn(&[u8]) -> Option<K>,
) -> Result<K>
where
    R: CryptoRngCore + ?Sized,
{
    let mut buf = Zeroizing::new(vec![0u8; len]);
    for _ in 0..MAX_KEYGEN_ATTEMPTS {
        generate_random(rng, &mut buf)?;
        // Zero or >= n: draw again.
        if let Some(key) = parse(&buf) {
            return Ok(key);
        }
    }
    Err(CryptoError::RngError)
}

/// Random P-224 key pair. The public half is `secret.public_key()`.
pub fn generate_p224_keypair<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Result<p224::SecretKey> {
    generate_secret(rng, P224_SCALAR_LEN, |b| p224::SecretKey::from_slice(b).ok())
}

/// Random P-256 key pair.
pub fn generate_p256_keypair<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Result<p256::SecretKey> {
    generate_secret(rng, P256_SCALAR_LEN, |b| p256::SecretKey::from_slice(b).ok())
}

fn check_uncompressed(bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() != expected {
        return Err(CryptoError::InvalidInput("point length"));
    }
    if bytes[0] != UNCOMPRESSED_TAG {
        return Err(CryptoError::CurveValidationFailure);
    }
    Ok(())
}

/// Import an untrusted uncompressed P-224 point.
pub fn import_p224_point(bytes: &[u8]) -> Result<p224::PublicKey> {
    check_uncompressed(bytes, P224_POINT_LEN)?;
    p224::PublicKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::CurveValidationFailure)
}

/// Import an untrusted uncompressed P-256 point.
pub fn import_p256_point(bytes: &[u8]) -> Result<p256::PublicKey> {
    check_uncompressed(bytes, P256_POINT_LEN)?;
    p256::PublicKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::CurveValidationFailure)
}

pub fn export_p224_point(point: &p224::PublicKey) -> [u8; P224_POINT_LEN] {
    let mut out = [0u8; P224_POINT_LEN];
    out.copy_from_slice(point.to_encoded_point(false).as_bytes());
    out
}

pub fn export_p256_point(point: &p256::PublicKey) -> [u8; P256_POINT_LEN] {
    let mut out = [0u8; P256_POINT_LEN];
    out.copy_from_slice(point.to_encoded_point(false).as_bytes());
    out
}

/// x coordinate of a P-224 point (the rotating public key on air).
pub fn p224_x(point: &p224::PublicKey) -> [u8; P224_SCALAR_LEN] {
    let mut out = [0u8; P224_SCALAR_LEN];
    out.copy_from_slice(&point.to_encoded_point(false).as_bytes()[1..1 + P224_SCALAR_LEN]);
    out
}

/// Big-endian bytes of a P-224 secret scalar.
pub fn p224_secret_bytes(secret: &p224::SecretKey) -> Zeroizing<[u8; P224_SCALAR_LEN]> {
    let mut out = Zeroizing::new([0u8; P224_SCALAR_LEN]);
    out.copy_from_slice(&secret.to_bytes());
    out
}

fn to_public(point: p224::ProjectivePoint) -> Result<p224::PublicKey> {
    // The identity has no affine encoding.
    p224::PublicKey::from_affine(point.to_affine()).map_err(|_| CryptoError::CurveValidationFailure)
}

/// `a + b`.
pub fn points_add(a: &p224::PublicKey, b: &p224::PublicKey) -> Result<p224::PublicKey> {
    to_public(a.to_projective() + b.to_projective())
}

/// `k * point`, or `k * G` when `point` is `None`.
pub fn scalar_mult(scalar: &[u8], point: Option<&p224::PublicKey>) -> Result<p224::PublicKey> {
    if scalar.len() != P224_SCALAR_LEN {
        return Err(CryptoError::InvalidInput("scalar length"));
    }
    let k = Option::<p224::Scalar>::from(p224::Scalar::from_repr(
        p224::FieldBytes::clone_from_slice(scalar),
    ))
    .ok_or(CryptoError::InvalidInput("scalar out of range"))?;
    let base = point.map_or(p224::ProjectivePoint::GENERATOR, |p| p.to_projective());
    to_public(base * k)
}

/// Reduce a 36-byte pre-scalar to `s mod (q - 1) + 1`.
///
/// The result always lies in `[1, q - 1]`. This is not a uniform reduction mod
/// q; it must be reproduced exactly for interoperability.
pub fn reduce_pre_scalar(pre: &[u8; PRE_SCALAR_LEN]) -> Result<p224::Scalar> {
    let modulus = Option::<NonZero<U384>>::from(NonZero::new(P224_ORDER_MINUS_ONE))
        .ok_or(CryptoError::InvalidInput("modulus"))?;

    let mut wide = Zeroizing::new([0u8; 48]);
    wide[48 - PRE_SCALAR_LEN..].copy_from_slice(pre);
    let s = U384::from_be_slice(&wide[..]);
    let reduced = s.rem(&modulus).wrapping_add(&U384::ONE);

    let be = Zeroizing::new(reduced.to_be_bytes());
    let scalar = p224::Scalar::from_repr(p224::FieldBytes::clone_from_slice(
        &be[48 - P224_SCALAR_LEN..],
    ));
    Option::from(scalar).ok_or(CryptoError::InvalidInput("reduced scalar"))
}

/// `(s mod (q-1) + 1) * point`.
pub fn scalar_mult_reduced(
    pre: &[u8; PRE_SCALAR_LEN],
    point: &p224::PublicKey,
) -> Result<p224::PublicKey> {
    let k = reduce_pre_scalar(pre)?;
    to_public(point.to_projective() * k)
}

/// `u' * point + v' * G` with both pre-scalars reduced as above.
pub fn twin_scalar_mult_reduced(
    u: &[u8; PRE_SCALAR_LEN],
    v: &[u8; PRE_SCALAR_LEN],
    point: &p224::PublicKey,
) -> Result<p224::PublicKey> {
    let u = reduce_pre_scalar(u)?;
    let v = reduce_pre_scalar(v)?;
    to_public(point.to_projective() * u + p224::ProjectivePoint::GENERATOR * v)
}

/// P-256 ECDH; returns the x coordinate of the shared point.
pub fn ecdh_p256(secret: &p256::SecretKey, public: &p256::PublicKey) -> Zeroizing<[u8; 32]> {
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(shared.raw_secret_bytes());
    out
}

/// ECDSA-P256/SHA-256 verification over a raw `r || s` signature.
pub fn ecdsa_p256_verify(public: &p256::PublicKey, message: &[u8], raw_sig: &[u8; 64]) -> Result<()> {
    use p256::ecdsa::signature::Verifier;

    let vk = p256::ecdsa::VerifyingKey::from(public);
    let sig = p256::ecdsa::Signature::from_slice(raw_sig)
        .map_err(|_| CryptoError::AuthenticationFailure)?;
    vk.verify(message, &sig)
        .map_err(|_| CryptoError::AuthenticationFailure)
}
