#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use rand_core::RngCore;

    use crate::ckg::{CkgContext, OwnerCkg};
    use crate::der::decode_der_signature;
    use crate::ec;
    use crate::ecies::{ecies_decrypt, encrypt_to_server};
    use crate::error::CryptoError;
    use crate::kdf::ansi_x963_kdf;

    /// Counts draws so tests can assert that no randomness was consumed.
    struct CountingRng {
        inner: ChaCha20Rng,
        draws: usize,
    }

    impl RngCore for CountingRng {
        fn next_u32(&mut self) -> u32 {
            self.draws += 1;
            self.inner.next_u32()
        }
        fn next_u64(&mut self) -> u64 {
            self.draws += 1;
            self.inner.next_u64()
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            self.draws += 1;
            self.inner.fill_bytes(dest)
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.draws += 1;
            self.inner.try_fill_bytes(dest)
        }
    }

    impl rand_core::CryptoRng for CountingRng {}

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // Counter mode: a longer output extends a shorter one.
        #[test]
        fn prop_kdf_prefix(
            z in prop::collection::vec(any::<u8>(), 0..64),
            info in prop::collection::vec(any::<u8>(), 0..64),
            short in 1usize..64,
            extra in 0usize..64,
        ) {
            let mut a = vec![0u8; short];
            let mut b = vec![0u8; short + extra];
            ansi_x963_kdf(&z, &info, &mut a).unwrap();
            ansi_x963_kdf(&z, &info, &mut b).unwrap();
            prop_assert_eq!(&b[..short], a.as_slice());
        }

        #[test]
        fn prop_ckg_agreement(seed in any::<u64>()) {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let mut accessory = CkgContext::init(&mut rng).unwrap();
            let (owner, c2) = OwnerCkg::respond(&mut rng, &accessory.gen_c1()).unwrap();
            let c3 = accessory.gen_c3(&c2).unwrap();
            let ours = accessory.finish().unwrap();
            let theirs = owner.finish(c3.as_slice()).unwrap();
            prop_assert_eq!(ours.master_public_key, theirs.keys.master_public_key);
            prop_assert_eq!(ours.primary_sk, theirs.keys.primary_sk);
            prop_assert_eq!(ours.secondary_sk, theirs.keys.secondary_sk);
        }

        #[test]
        fn prop_ecies_round_trip(seed in any::<u64>(), msg in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let server = ec::generate_p256_keypair(&mut rng).unwrap();
            let server_pub = ec::export_p256_point(&server.public_key());
            let ct = encrypt_to_server(&mut rng, &server_pub, &msg).unwrap();
            prop_assert_eq!(ecies_decrypt(&server, &ct).unwrap().to_vec(), msg);
        }

        // Off-curve keys fail before a single random byte is drawn.
        #[test]
        fn prop_ecies_rejects_off_curve_before_rng(x in prop::array::uniform32(any::<u8>()), y in prop::array::uniform32(any::<u8>())) {
            let mut key = [0u8; 65];
            key[0] = 0x04;
            key[1..33].copy_from_slice(&x);
            key[33..].copy_from_slice(&y);
            prop_assume!(p256::PublicKey::from_sec1_bytes(&key).is_err());

            let mut rng = CountingRng { inner: ChaCha20Rng::seed_from_u64(0), draws: 0 };
            prop_assert_eq!(
                encrypt_to_server(&mut rng, &key, b"m").unwrap_err(),
                CryptoError::CurveValidationFailure
            );
            prop_assert_eq!(rng.draws, 0);
        }

        #[test]
        fn prop_der_decoder_never_panics(data in prop::collection::vec(any::<u8>(), 0..120)) {
            let _ = decode_der_signature(&data);
        }
    }
}
