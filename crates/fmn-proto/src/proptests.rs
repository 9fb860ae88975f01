#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::control::OwnerCommand;
    use crate::fragment::{fragment, Reassembler};
    use crate::frame::Frame;
    use crate::pairing::{FinalizePairing, InitiatePairing, PairingStatus};
    use crate::validation::sizes;

    prop_compose! {
        fn any_owner_command()(
            kind in 0u8..10,
            flag in any::<bool>(),
            secs in any::<u16>(),
            roll in any::<u32>(),
            index in any::<u32>(),
            max in any::<u8>(),
            utc in any::<u64>(),
        ) -> OwnerCommand {
            match kind {
                0 => OwnerCommand::SoundStart,
                1 => OwnerCommand::SoundStop,
                2 => OwnerCommand::PersistentConnectionStatus { enabled: flag },
                3 => OwnerCommand::SetNearbyTimeout { seconds: secs },
                4 => OwnerCommand::Unpair,
                5 => OwnerCommand::ConfigureSeparatedState {
                    next_primary_key_roll_ms: roll,
                    secondary_key_evaluation_index: index,
                },
                6 => OwnerCommand::LatchSeparatedKey,
                7 => OwnerCommand::SetMaxConnections { max },
                8 => OwnerCommand::SetUtc { epoch_ms: utc },
                _ => OwnerCommand::GetMultiStatus,
            }
        }
    }

    proptest! {
        // Any chunking of a payload reassembles to the same bytes.
        #[test]
        fn prop_fragmentation_is_lossless(
            payload in prop::collection::vec(any::<u8>(), 0..sizes::MAX_CONTROL_POINT_PAYLOAD),
            chunk in 1usize..300,
        ) {
            let mut r = Reassembler::default();
            let mut out = None;
            for part in fragment(&payload, chunk) {
                prop_assert!(out.is_none());
                out = r.push(&part).unwrap();
            }
            prop_assert_eq!(out.unwrap().to_vec(), payload);
        }

        // Decoders reject or accept arbitrary input without panicking.
        #[test]
        fn prop_decoders_never_panic(data in prop::collection::vec(any::<u8>(), 0..1500)) {
            let _ = Frame::decode(&data);
            let _ = InitiatePairing::decode(&data);
            let _ = FinalizePairing::decode(&data);
            let _ = PairingStatus::decode(&data);
            if let Ok(frame) = Frame::decode(&data) {
                let _ = OwnerCommand::decode(&frame);
            }
        }

        #[test]
        fn prop_owner_command_survives_the_wire(cmd in any_owner_command()) {
            let bytes = cmd.encode().encode();
            let frame = Frame::decode(&bytes).unwrap();
            prop_assert_eq!(OwnerCommand::decode(&frame).unwrap(), cmd);
        }

        #[test]
        fn prop_fixed_bodies_reject_wrong_lengths(len in 0usize..1400) {
            prop_assume!(len != InitiatePairing::LEN);
            prop_assert!(InitiatePairing::decode(&vec![0u8; len]).is_err());
        }
    }
}
