#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::keys::{secondary_rolls_at, KeyRotationService, PRIMARY_KEYS_PER_SECONDARY_KEY};
    use crate::storage::InMemoryStorage;
    use fmn_crypto::ckg::{CkgContext, CkgOutput, OwnerCkg};
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn agreed_keys(seed: u64) -> CkgOutput {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let mut ckg = CkgContext::init(&mut rng).unwrap();
        let (_, c2) = OwnerCkg::respond(&mut rng, &ckg.gen_c1()).unwrap();
        ckg.gen_c3(&c2).unwrap();
        ckg.finish().unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        // A reboot at any point lands on exactly the keys the running
        // service had, checkpoint or not.
        #[test]
        fn prop_restore_matches_running_state(
            seed in any::<u64>(),
            rotations in 0u32..40,
            reconfigure in proptest::option::of(1u32..=96),
        ) {
            let keys = agreed_keys(seed);
            let mut storage = InMemoryStorage::new();
            let mut running = KeyRotationService::new();
            running.start(&mut storage, &keys).unwrap();
            for i in 0..rotations {
                if i == rotations / 2 {
                    if let Some(offset) = reconfigure {
                        let index = running.snapshot().unwrap().primary_index;
                        running.configure_separated_state(&mut storage, index + offset).unwrap();
                    }
                }
                running.rotate(&mut storage).unwrap();
            }

            let mut restored = KeyRotationService::new();
            prop_assert!(restored.restore(&storage).unwrap());
            let a = running.snapshot().unwrap();
            let b = restored.snapshot().unwrap();
            prop_assert_eq!(a.primary_index, b.primary_index);
            prop_assert_eq!(a.secondary_index, b.secondary_index);
            prop_assert_eq!(a.primary_key, b.primary_key);
            prop_assert_eq!(a.secondary_key, b.secondary_key);
            prop_assert_eq!(a.ltk, b.ltk);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        // However the phase is moved, the secondary count stays within one
        // epoch of ceil(N / 96).
        #[test]
        fn prop_secondary_lag_bounded(
            moves in prop::collection::vec((0u32..600, 0u32..96), 0..6),
            horizon in 1u32..1500,
        ) {
            let mut secondary = 0u32;
            let mut delta = 0u32;
            for n in 1..=horizon {
                if let Some((_, d)) = moves.iter().find(|(at, _)| *at == n) {
                    delta = *d;
                }
                if secondary_rolls_at(n, secondary, delta) {
                    secondary += 1;
                }
                let expected = n.div_ceil(PRIMARY_KEYS_PER_SECONDARY_KEY);
                prop_assert!(secondary <= expected, "n={} secondary={}", n, secondary);
                prop_assert!(secondary + 1 >= expected, "n={} secondary={}", n, secondary);
            }
        }
    }
}
