//! ANSI X9.63 key derivation over SHA-256.
//!
//! `block_i = SHA256(Z || BE32(i) || SharedInfo)` for `i = 1, 2, ...`,
//! concatenated and truncated to the requested length.

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoError, Result};

const BLOCK_LEN: usize = 32;

/// Largest output we agree to produce (255 blocks, the HKDF bound).
pub const MAX_OUTPUT_LEN: usize = 255 * BLOCK_LEN;

/// Fill `out` with KDF output. On error `out` is left zeroed.
pub fn ansi_x963_kdf(z: &[u8], shared_info: &[u8], out: &mut [u8]) -> Result<()> {
    if out.is_empty() || out.len() > MAX_OUTPUT_LEN {
        out.zeroize();
        return Err(CryptoError::InvalidInput("kdf output length"));
    }

    let mut counter: u32 = 1;
    for chunk in out.chunks_mut(BLOCK_LEN) {
        let mut sha = Sha256::new();
        sha.update(z);
        sha.update(counter.to_be_bytes());
        sha.update(shared_info);
        let mut block = sha.finalize();
        chunk.copy_from_slice(&block[..chunk.len()]);
        block.as_mut_slice().zeroize();
        counter += 1;
    }
    Ok(())
}

/// Fixed-size convenience wrapper returning a zeroizing buffer.
pub fn kdf<const N: usize>(z: &[u8], shared_info: &[u8]) -> Result<Zeroizing<[u8; N]>> {
    let mut out = Zeroizing::new([0u8; N]);
    ansi_x963_kdf(z, shared_info, out.as_mut())?;
    Ok(out)
}
