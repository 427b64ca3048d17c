//! Property-Based Tests
//!
//! Invariants over the identifier index, the attribute tri-state, the NAS
//! counts and the IE-equality predicate, driven by proptest.

use crate::attach::{ies_have_changed, AttachRequestIes, AttachType};
use crate::context::{
    Attribute, EnbUeKey, EpsGuti, Imsi, KeyUpdates, PlmnId, UeContextIndex, UeCtxId,
};
use crate::nas_security::{select_algorithms, NasCount, UeSecurityCapability};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

fn arb_imsi() -> impl Strategy<Value = Imsi> {
    (100_000_000_000_000u64..=999_999_999_999_999u64)
        .prop_map(|n| Imsi::from_bcd(&n.to_string()).unwrap())
}

fn arb_guti() -> impl Strategy<Value = EpsGuti> {
    (any::<u32>(), any::<u16>(), any::<u8>()).prop_map(|(m_tmsi, mme_gid, mme_code)| EpsGuti {
        plmn_id: PlmnId::new("001", "01"),
        mme_gid,
        mme_code,
        m_tmsi,
    })
}

#[derive(Debug, Clone)]
enum IndexOp {
    Create { enb_ue: u32, ran_id: u32 },
    RekeyImsi { slot: usize, imsi: Imsi },
    RekeyGuti { slot: usize, guti: EpsGuti },
    DropGuti { slot: usize },
    Remove { slot: usize },
}

fn arb_index_op() -> impl Strategy<Value = IndexOp> {
    prop_oneof![
        (1u32..64, 1u32..4096).prop_map(|(enb_ue, ran_id)| IndexOp::Create { enb_ue, ran_id }),
        (0usize..8, arb_imsi()).prop_map(|(slot, imsi)| IndexOp::RekeyImsi { slot, imsi }),
        (0usize..8, arb_guti()).prop_map(|(slot, guti)| IndexOp::RekeyGuti { slot, guti }),
        (0usize..8).prop_map(|slot| IndexOp::DropGuti { slot }),
        (0usize..8).prop_map(|slot| IndexOp::Remove { slot }),
    ]
}

fn arb_ies() -> impl Strategy<Value = AttachRequestIes> {
    (
        prop_oneof![
            Just(AttachType::Eps),
            Just(AttachType::CombinedEpsImsi),
            Just(AttachType::Emergency),
        ],
        0u8..8,
        any::<bool>(),
        proptest::option::of(arb_imsi()),
        proptest::option::of(arb_guti()),
    )
        .prop_map(|(attach_type, ksi, is_native_sc, imsi, guti)| AttachRequestIes {
            attach_type,
            ksi,
            is_native_sc,
            imsi,
            guti,
            ..Default::default()
        })
}

// ============================================================================
// Identifier Index
// ============================================================================

fn apply_ops(index: &UeContextIndex, ops: &[IndexOp]) -> Vec<UeCtxId> {
    let mut live: Vec<UeCtxId> = Vec::new();
    for op in ops {
        match op {
            IndexOp::Create { enb_ue, ran_id } => {
                let key = EnbUeKey {
                    enb_id: 0x1001,
                    enb_ue_s1ap_id: *enb_ue,
                };
                if let Ok(ctx) = index.create(key, *ran_id) {
                    live.push(ctx.lock().unwrap().id);
                }
            }
            IndexOp::RekeyImsi { slot, imsi } => {
                if let Some(&id) = live.get(slot % live.len().max(1)) {
                    let _ = index.rekey(
                        id,
                        KeyUpdates {
                            imsi: Some(imsi.clone()),
                            ..Default::default()
                        },
                    );
                }
            }
            IndexOp::RekeyGuti { slot, guti } => {
                if let Some(&id) = live.get(slot % live.len().max(1)) {
                    let _ = index.rekey(
                        id,
                        KeyUpdates {
                            guti: Some(Some(*guti)),
                            ..Default::default()
                        },
                    );
                }
            }
            IndexOp::DropGuti { slot } => {
                if let Some(&id) = live.get(slot % live.len().max(1)) {
                    let _ = index.rekey(
                        id,
                        KeyUpdates {
                            guti: Some(None),
                            ..Default::default()
                        },
                    );
                }
            }
            IndexOp::Remove { slot } => {
                if !live.is_empty() {
                    let id = live.remove(slot % live.len());
                    index.remove(id);
                }
            }
        }
    }
    live
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Every context is reachable by every identifier it currently holds,
    /// after any sequence of index operations.
    #[test]
    fn prop_index_lookup_consistency(ops in proptest::collection::vec(arb_index_op(), 1..40)) {
        let index = UeContextIndex::new();
        apply_ops(&index, &ops);

        for id in index.ids() {
            let keys = index.keys_of(id).unwrap();
            if let Some(ran_id) = keys.ran_id {
                prop_assert_eq!(index.id_by_ran_id(ran_id), Some(id));
            }
            if let Some(enb_key) = keys.enb_key {
                prop_assert_eq!(index.id_by_enb_key(&enb_key), Some(id));
            }
            if let Some(ref imsi) = keys.imsi {
                prop_assert_eq!(index.id_by_imsi(imsi), Some(id));
            }
            if let Some(ref guti) = keys.guti {
                prop_assert_eq!(index.id_by_guti(guti), Some(id));
            }
        }
    }

    /// No two contexts ever share an identifier.
    #[test]
    fn prop_index_no_shared_identifiers(ops in proptest::collection::vec(arb_index_op(), 1..40)) {
        let index = UeContextIndex::new();
        apply_ops(&index, &ops);

        let ids = index.ids();
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                let ka = index.keys_of(a).unwrap();
                let kb = index.keys_of(b).unwrap();
                if ka.ran_id.is_some() {
                    prop_assert_ne!(ka.ran_id, kb.ran_id);
                }
                if ka.enb_key.is_some() {
                    prop_assert_ne!(ka.enb_key, kb.enb_key);
                }
                if ka.imsi.is_some() {
                    prop_assert_ne!(ka.imsi.clone(), kb.imsi.clone());
                }
                if ka.guti.is_some() {
                    prop_assert_ne!(ka.guti, kb.guti);
                }
            }
        }
    }

    /// Removal purges every identifier of the removed context.
    #[test]
    fn prop_index_remove_purges(ops in proptest::collection::vec(arb_index_op(), 1..30)) {
        let index = UeContextIndex::new();
        let live = apply_ops(&index, &ops);

        for id in live {
            let keys = index.keys_of(id).unwrap();
            index.remove(id);
            if let Some(ran_id) = keys.ran_id {
                prop_assert_eq!(index.id_by_ran_id(ran_id), None);
            }
            if let Some(enb_key) = keys.enb_key {
                prop_assert_eq!(index.id_by_enb_key(&enb_key), None);
            }
            if let Some(ref imsi) = keys.imsi {
                prop_assert_eq!(index.id_by_imsi(imsi), None);
            }
            if let Some(ref guti) = keys.guti {
                prop_assert_eq!(index.id_by_guti(guti), None);
            }
        }
    }
}

// ============================================================================
// Attribute Tri-State
// ============================================================================

proptest! {
    /// valid implies present, under any mutation sequence.
    #[test]
    fn prop_attribute_valid_implies_present(ops in proptest::collection::vec(0u8..4, 0..20)) {
        let mut attr: Attribute<u32> = Attribute::Absent;
        for (i, op) in ops.iter().enumerate() {
            match op {
                0 => attr.set(i as u32),
                1 => attr.set_valid(i as u32),
                2 => attr.validate(),
                _ => attr.clear(),
            }
            if attr.is_valid() {
                prop_assert!(attr.is_present());
                prop_assert!(attr.valid().is_some());
            }
            if !attr.is_present() {
                prop_assert!(!attr.is_valid());
            }
        }
    }
}

// ============================================================================
// NAS Counts
// ============================================================================

proptest! {
    /// The flat count value is strictly monotonic over increments.
    #[test]
    fn prop_nas_count_monotonic(start_seq in any::<u8>(), start_overflow in 0u32..0xffff, steps in 1usize..600) {
        let mut count = NasCount { overflow: start_overflow, seq_num: start_seq };
        let mut last = count.value();
        for _ in 0..steps {
            count.increment();
            prop_assert!(count.value() > last);
            last = count.value();
        }
    }
}

// ============================================================================
// Algorithm Selection
// ============================================================================

proptest! {
    /// The selected algorithms are always either supported by the UE or
    /// the null algorithm.
    #[test]
    fn prop_selected_algorithms_supported_or_null(eea in any::<u8>(), eia in any::<u8>()) {
        let capability = UeSecurityCapability { eea, eia, ..Default::default() };
        let selected = select_algorithms(&capability, &[2, 1, 0], &[2, 1, 0]);
        prop_assert!(selected.encryption == 0 || capability.supports_eea(selected.encryption));
        prop_assert!(selected.integrity == 0 || capability.supports_eia(selected.integrity));
    }
}

// ============================================================================
// IE Equality
// ============================================================================

proptest! {
    /// Reflexive: a request never differs from itself.
    #[test]
    fn prop_ies_reflexive(ies in arb_ies()) {
        prop_assert!(!ies_have_changed(1, &ies, &ies));
    }

    /// Symmetric: comparison order does not matter.
    #[test]
    fn prop_ies_symmetric(a in arb_ies(), b in arb_ies()) {
        prop_assert_eq!(ies_have_changed(1, &a, &b), ies_have_changed(1, &b, &a));
    }

    /// A single-field perturbation is always detected.
    #[test]
    fn prop_ies_ksi_perturbation_detected(ies in arb_ies(), delta in 1u8..7) {
        let mut other = ies.clone();
        other.ksi = (other.ksi + delta) % 8;
        prop_assert!(ies_have_changed(1, &ies, &other));
    }
}
