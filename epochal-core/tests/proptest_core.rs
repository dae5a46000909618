//! Property-based tests for core components using proptest.

use std::collections::BTreeMap;

use proptest::prelude::*;

use epochal_core::persistence::{INTERNAL_STATE_FILE, load_state_file, save_state_file};
use epochal_core::{
    LearningRate, LossRegister, LossRegisterPool, LrMap, ParamGroup, ParamGroupSet, ParamGroups,
    Phase, read_lrs, scale_lrs, write_lrs,
};

fn group_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,11}"
}

fn lr_map() -> impl Strategy<Value = LrMap> {
    prop::collection::btree_map(group_name(), 1e-8f64..10.0, 1..8)
}

// --- Optimizer boundary properties ---

proptest! {
    #[test]
    fn write_then_read_returns_written_rates(initial in lr_map(), factor in 0.0f64..2.0) {
        let mut opt = ParamGroups::new(
            initial
                .iter()
                .enumerate()
                .map(|(i, (name, lr))| {
                    if i % 2 == 0 {
                        ParamGroup::new(name.as_str(), *lr)
                    } else {
                        ParamGroup::tensor(name.as_str(), *lr)
                    }
                })
                .collect(),
        );
        let scaled = scale_lrs(&initial, factor);
        write_lrs(&mut opt, &scaled).unwrap();
        prop_assert_eq!(read_lrs(&opt).unwrap(), scaled);
    }

    #[test]
    fn write_preserves_rate_representation(initial in lr_map()) {
        let mut opt = ParamGroups::new(
            initial.iter().map(|(name, lr)| ParamGroup::tensor(name.as_str(), *lr)).collect(),
        );
        write_lrs(&mut opt, &scale_lrs(&initial, 0.5)).unwrap();
        for group in opt.param_groups() {
            prop_assert!(matches!(&group.lr, LearningRate::Tensor(buf) if buf.len() == 1));
        }
    }

    #[test]
    fn multi_element_tensor_is_rejected(name in group_name(), len in 2usize..6) {
        let lr = LearningRate::Tensor(vec![0.1; len]);
        prop_assert!(lr.get(&name).is_err());
    }
}

// --- Loss register properties ---

proptest! {
    #[test]
    fn register_keeps_append_order(totals in prop::collection::vec(0.0f64..100.0, 1..30)) {
        let mut register = LossRegister::new();
        for total in &totals {
            register.push_epoch(*total);
        }
        prop_assert_eq!(register.history(), totals.as_slice());
        prop_assert_eq!(register.last(), totals.last().copied());
        prop_assert_eq!(register.nth_back(totals.len()), None);
        if totals.len() >= 2 {
            prop_assert_eq!(register.nth_back(1), Some(totals[totals.len() - 2]));
        }
    }

    #[test]
    fn pool_last_losses_match_registers(
        epochs in prop::collection::vec(
            prop::collection::btree_map("(cls|box|attr)", 0.0f64..10.0, 1..3),
            1..6,
        )
    ) {
        let mut pool = LossRegisterPool::new();
        let mut expected = BTreeMap::new();
        for epoch in &epochs {
            for (key, total) in epoch {
                pool.record(Phase::Val, key.as_str(), *total);
                expected.insert(key.clone(), *total);
            }
        }
        prop_assert_eq!(pool.last_epoch_losses(Phase::Val), expected);
        prop_assert!(pool.last_epoch_losses(Phase::Train).is_empty());
    }
}

// --- Persistence properties ---

proptest! {
    #[test]
    fn saved_rates_load_bit_identical(rates in lr_map()) {
        let dir = tempfile::TempDir::new().unwrap();
        save_state_file(dir.path(), INTERNAL_STATE_FILE, &rates).unwrap();
        let loaded: LrMap = load_state_file(dir.path(), INTERNAL_STATE_FILE).unwrap();
        for (name, lr) in &rates {
            prop_assert_eq!(loaded[name].to_bits(), lr.to_bits());
        }
    }
}
