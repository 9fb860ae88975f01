//! ECIES to the Find My server over P-256.
//!
//! Output layout: `Q(65) || AES-128-GCM(K, IV, m) || tag(16)` where `Q` is an
//! ephemeral public key and `K || IV = KDF(x(dQ_s), Q || Q_s, 32)`.

use rand_core::CryptoRngCore;
use zeroize::Zeroizing;

use crate::aead::{self, TAG_LEN};
use crate::ec::{self, P256_POINT_LEN};
use crate::error::{CryptoError, Result};
use crate::kdf::kdf;

/// Bytes ECIES adds around a plaintext.
pub const OVERHEAD: usize = P256_POINT_LEN + TAG_LEN;

fn derive_key_iv(
    shared_x: &[u8; 32],
    ephemeral: &[u8; P256_POINT_LEN],
    recipient: &[u8; P256_POINT_LEN],
) -> Result<Zeroizing<[u8; 32]>> {
    let mut info = [0u8; 2 * P256_POINT_LEN];
    info[..P256_POINT_LEN].copy_from_slice(ephemeral);
    info[P256_POINT_LEN..].copy_from_slice(recipient);
    kdf::<32>(shared_x, &info)
}

/// Encrypt `plaintext` to the server key `server_pub` (uncompressed P-256).
///
/// The server key is validated before any randomness is drawn.
pub fn encrypt_to_server<R: CryptoRngCore + ?Sized>(
    rng: &mut R,
    server_pub: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let server = ec::import_p256_point(server_pub)?;
    let server_bytes = ec::export_p256_point(&server);

    let ephemeral = ec::generate_p256_keypair(rng)?;
    let q = ec::export_p256_point(&ephemeral.public_key());
    let shared = ec::ecdh_p256(&ephemeral, &server);
    let material = derive_key_iv(&shared, &q, &server_bytes)?;
    let (key, iv) = aead::split_key_iv(&material);

    let mut out = Vec::with_capacity(OVERHEAD + plaintext.len());
    out.extend_from_slice(&q);
    out.extend_from_slice(plaintext);
    let tag = aead::encrypt_in_place(&key, &iv, &mut out[P256_POINT_LEN..])?;
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Server-side inverse of [`encrypt_to_server`].
pub fn ecies_decrypt(secret: &p256::SecretKey, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if ciphertext.len() < OVERHEAD {
        return Err(CryptoError::InvalidInput("ciphertext too short"));
    }
    let (q_bytes, rest) = ciphertext.split_at(P256_POINT_LEN);
    let (body, tag) = rest.split_at(rest.len() - TAG_LEN);

    let q = ec::import_p256_point(q_bytes)?;
    let q_bytes = ec::export_p256_point(&q);
    let own = ec::export_p256_point(&secret.public_key());
    let shared = ec::ecdh_p256(secret, &q);
    let material = derive_key_iv(&shared, &q_bytes, &own)?;
    let (key, iv) = aead::split_key_iv(&material);

    let mut tag_arr = [0u8; TAG_LEN];
    tag_arr.copy_from_slice(tag);
    let mut plaintext = Zeroizing::new(body.to_vec());
    aead::decrypt_in_place(&key, &iv, &mut plaintext, &tag_arr)?;
    Ok(plaintext)
}
