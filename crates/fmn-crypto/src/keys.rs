//! Symmetric key chain and pairing-time derivations.

use zeroize::Zeroizing;

use crate::aead;
use crate::der::decode_der_signature;
use crate::ec::{self, P224_SCALAR_LEN, PRE_SCALAR_LEN};
use crate::error::{CryptoError, Result};
use crate::hash::hmac_sha256;
use crate::kdf::kdf;

pub const SYMMETRIC_KEY_LEN: usize = 32;
pub const LTK_LEN: usize = 16;

const LABEL_UPDATE: &[u8] = b"update";
const LABEL_DIVERSIFY: &[u8] = b"diversify";
const LABEL_INTERMEDIATE: &[u8] = b"intermediate";
const LABEL_CONNECT: &[u8] = b"connect";
const LABEL_SERVER_SHARED_SECRET: &[u8] = b"ServerSharedSecret";
const LABEL_PAIRING_SESSION: &[u8] = b"PairingSession";
const LABEL_SERIAL_NUMBER: &[u8] = b"SerialNumberProtection";

pub type SymmetricKey = Zeroizing<[u8; SYMMETRIC_KEY_LEN]>;

/// `sk' = KDF(sk, "update", 32)`.
pub fn roll_symmetric_key(sk: &[u8; SYMMETRIC_KEY_LEN]) -> Result<SymmetricKey> {
    kdf::<SYMMETRIC_KEY_LEN>(sk, LABEL_UPDATE)
}

/// Roll `sk` forward `steps` times.
pub fn roll_symmetric_key_n(sk: &[u8; SYMMETRIC_KEY_LEN], steps: u32) -> Result<SymmetricKey> {
    let mut current = Zeroizing::new(*sk);
    for _ in 0..steps {
        current = roll_symmetric_key(&current)?;
    }
    Ok(current)
}

/// BLE long-term key for the current primary period.
pub fn derive_ltk(skn: &[u8; SYMMETRIC_KEY_LEN]) -> Result<Zeroizing<[u8; LTK_LEN]>> {
    let ik = kdf::<32>(skn, LABEL_INTERMEDIATE)?;
    kdf::<LTK_LEN>(ik.as_slice(), LABEL_CONNECT)
}

fn diversify(sk: &[u8; SYMMETRIC_KEY_LEN]) -> Result<(Zeroizing<[u8; PRE_SCALAR_LEN]>, Zeroizing<[u8; PRE_SCALAR_LEN]>)> {
    let uv = kdf::<{ 2 * PRE_SCALAR_LEN }>(sk, LABEL_DIVERSIFY)?;
    let mut u = Zeroizing::new([0u8; PRE_SCALAR_LEN]);
    let mut v = Zeroizing::new([0u8; PRE_SCALAR_LEN]);
    u.copy_from_slice(&uv[..PRE_SCALAR_LEN]);
    v.copy_from_slice(&uv[PRE_SCALAR_LEN..]);
    Ok((u, v))
}

/// x coordinate of `u' * MasterPK + v' * G` where `(u, v) = KDF(sk, "diversify", 72)`.
pub fn derive_rotating_public_key(
    sk: &[u8; SYMMETRIC_KEY_LEN],
    master_pk: &[u8],
) -> Result<[u8; P224_SCALAR_LEN]> {
    let master = ec::import_p224_point(master_pk)?;
    let (u, v) = diversify(sk)?;
    let point = ec::twin_scalar_mult_reduced(&u, &v, &master)?;
    Ok(ec::p224_x(&point))
}

/// Owner-side private key matching [`derive_rotating_public_key`]:
/// `d_i = d * u' + v'`.
pub fn derive_rotating_private_key(
    sk: &[u8; SYMMETRIC_KEY_LEN],
    master_secret: &[u8; P224_SCALAR_LEN],
) -> Result<Zeroizing<[u8; P224_SCALAR_LEN]>> {
    use p224::elliptic_curve::ff::PrimeField;

    let d = Option::<p224::Scalar>::from(p224::Scalar::from_repr(
        p224::FieldBytes::clone_from_slice(master_secret),
    ))
    .ok_or(CryptoError::InvalidInput("master secret"))?;
    let (u, v) = diversify(sk)?;
    let di = d * ec::reduce_pre_scalar(&u)? + ec::reduce_pre_scalar(&v)?;
    let mut out = Zeroizing::new([0u8; P224_SCALAR_LEN]);
    out.copy_from_slice(&di.to_repr());
    Ok(out)
}

/// `KDF(seeds || seed_k1, "ServerSharedSecret", 32)`.
pub fn derive_server_shared_secret(seeds: &[u8; 32], seed_k1: &[u8; 32]) -> Result<SymmetricKey> {
    let mut z = Zeroizing::new([0u8; 64]);
    z[..32].copy_from_slice(seeds);
    z[32..].copy_from_slice(seed_k1);
    kdf::<32>(z.as_slice(), LABEL_SERVER_SHARED_SECRET)
}

/// Decrypt E3 (`ciphertext || tag`) with the pairing session key.
pub fn decrypt_e3(server_shared_secret: &[u8; 32], e3: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if e3.len() < aead::TAG_LEN {
        return Err(CryptoError::InvalidInput("e3 length"));
    }
    let material = kdf::<32>(server_shared_secret, LABEL_PAIRING_SESSION)?;
    let (key, iv) = aead::split_key_iv(&material);
    let (body, tag) = e3.split_at(e3.len() - aead::TAG_LEN);
    let mut tag_arr = [0u8; aead::TAG_LEN];
    tag_arr.copy_from_slice(tag);

    let mut plaintext = Zeroizing::new(body.to_vec());
    aead::decrypt_in_place(&key, &iv, &mut plaintext, &tag_arr)?;
    Ok(plaintext)
}

/// Server-side counterpart of [`decrypt_e3`].
pub fn encrypt_e3(server_shared_secret: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let material = kdf::<32>(server_shared_secret, LABEL_PAIRING_SESSION)?;
    let (key, iv) = aead::split_key_iv(&material);
    let mut out = plaintext.to_vec();
    let tag = aead::encrypt_in_place(&key, &iv, &mut out)?;
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Verify the server's DER signature `S2` over `message`.
///
/// Fails closed with [`CryptoError::AuthenticationFailure`] whatever went
/// wrong; a malformed signature still runs a full verification against a
/// dummy value.
pub fn verify_s2(server_verify_pub: &[u8], der_signature: &[u8], message: &[u8]) -> Result<()> {
    let key = ec::import_p256_point(server_verify_pub)
        .map_err(|_| CryptoError::AuthenticationFailure)?;
    let (raw, decoded) = match decode_der_signature(der_signature) {
        Ok(raw) => (raw, true),
        Err(_) => ([0x01; 64], false),
    };
    let verified = ec::ecdsa_p256_verify(&key, message, &raw).is_ok();
    if verified && decoded {
        Ok(())
    } else {
        Err(CryptoError::AuthenticationFailure)
    }
}

/// `HMAC-SHA256(KDF(serverss, "SerialNumberProtection", 32), message)`.
pub fn authenticate_with_ksn(server_shared_secret: &[u8; 32], message: &[u8]) -> Result<[u8; 32]> {
    let ksn = kdf::<32>(server_shared_secret, LABEL_SERIAL_NUMBER)?;
    hmac_sha256(ksn.as_slice(), &[message])
}
