//! AES-128-GCM with a 16-byte IV and 16-byte tag, no associated data.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes128;
use aes_gcm::AesGcm;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoError, Result};

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

type Aes128Gcm16 = AesGcm<Aes128, U16>;

fn cipher(key: &[u8; KEY_LEN]) -> Result<Aes128Gcm16> {
    Aes128Gcm16::new_from_slice(key).map_err(|_| CryptoError::InvalidInput("aes key"))
}

/// Encrypt `buf` in place and return the tag.
pub fn encrypt_in_place(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], buf: &mut [u8]) -> Result<[u8; TAG_LEN]> {
    let tag = cipher(key)?
        .encrypt_in_place_detached(GenericArray::from_slice(iv), &[], buf)
        .map_err(|_| CryptoError::InvalidInput("plaintext too long"))?;
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Decrypt `buf` in place. On tag mismatch the buffer is zeroed so no
/// unauthenticated plaintext escapes.
pub fn decrypt_in_place(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    buf: &mut [u8],
    tag: &[u8; TAG_LEN],
) -> Result<()> {
    let result = cipher(key)?.decrypt_in_place_detached(
        GenericArray::from_slice(iv),
        &[],
        buf,
        GenericArray::from_slice(tag),
    );
    if result.is_err() {
        buf.zeroize();
        return Err(CryptoError::AuthenticationFailure);
    }
    Ok(())
}

/// Split a 32-byte KDF output into an AES key and IV.
pub fn split_key_iv(material: &[u8; KEY_LEN + IV_LEN]) -> (Zeroizing<[u8; KEY_LEN]>, [u8; IV_LEN]) {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&material[..KEY_LEN]);
    iv.copy_from_slice(&material[KEY_LEN..]);
    (key, iv)
}
