//! Property-based invariant tests for the flatten engine.
//!
//! Random [`TreeOp`] sequences drive a [`Forest`]; after every op the engine
//! is checked against reachability computed straight from the collections.
//!
//! 1. The view equals the reachable set, under both update policies
//! 2. The output stream never emits a change that does not fit its history
//! 3. Parent links and depths match the forest
//! 4. One subscription per live node, plus the root
//! 5. A late subscriber's snapshot equals the live subscriber's mirror
//! 6. Dispose leaves no subscription anywhere in the forest

use arbor_flatten::{FlattenConfig, FlattenEngine, UpdatePolicy};
use arbor_harness::{
    ChangeRecorder, Forest, TreeNode, TreeOp, check_flattened, reachable_keys, start_engine_with,
};
use proptest::prelude::*;

// ── Helpers ──────────────────────────────────────────────────────────

const MAX_ID: u32 = 24;

fn arb_op() -> impl Strategy<Value = TreeOp> {
    prop_oneof![
        2 => (0..MAX_ID).prop_map(|id| TreeOp::AddRoot { id }),
        5 => (0..MAX_ID, 0..MAX_ID).prop_map(|(parent, id)| TreeOp::AddChild { parent, id }),
        3 => (0..MAX_ID).prop_map(|id| TreeOp::Remove { id }),
        2 => (0..MAX_ID).prop_map(|id| TreeOp::Restore { id }),
        2 => (0..MAX_ID).prop_map(|id| TreeOp::Relabel { id }),
        1 => (0..MAX_ID).prop_map(|id| TreeOp::Refresh { id }),
    ]
}

fn arb_ops() -> impl Strategy<Value = Vec<TreeOp>> {
    proptest::collection::vec(arb_op(), 1..=80)
}

fn arb_policy() -> impl Strategy<Value = UpdatePolicy> {
    prop_oneof![
        Just(UpdatePolicy::RetainChildren),
        Just(UpdatePolicy::Resubscribe)
    ]
}

fn engine_for(forest: &Forest, policy: UpdatePolicy) -> FlattenEngine<u32, TreeNode> {
    start_engine_with(
        forest.roots(),
        FlattenConfig::default().with_update_policy(policy),
    )
}

fn forest_subscribers(forest: &Forest) -> usize {
    forest.roots().subscriber_count()
        + forest
            .ids()
            .into_iter()
            .filter_map(|id| forest.node(id))
            .map(|node| node.children().subscriber_count())
            .sum::<usize>()
}

// ═════════════════════════════════════════════════════════════════════════
// 1–2. View matches reachability; stream stays consistent
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn view_tracks_reachable_set(ops in arb_ops(), policy in arb_policy()) {
        let mut forest = Forest::new();
        let engine = engine_for(&forest, policy);
        let recorder = ChangeRecorder::attach(&engine.connect());

        for op in ops {
            forest.apply(op);
            if let Err(mismatch) = check_flattened(&engine, forest.roots()) {
                return Err(TestCaseError::fail(format!("after {op:?}: {mismatch}")));
            }
            let reachable: Vec<u32> = reachable_keys(forest.roots()).into_iter().collect();
            prop_assert_eq!(recorder.keys(), reachable);
        }
        prop_assert!(recorder.violations().is_empty(), "{:?}", recorder.violations());
        prop_assert!(engine.error().is_none());
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3–4. Structure and subscription accounting
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn parents_and_subscriptions_match_forest(ops in arb_ops(), policy in arb_policy()) {
        let mut forest = Forest::new();
        let engine = engine_for(&forest, policy);

        for op in ops {
            forest.apply(op);
        }

        let reachable = reachable_keys(forest.roots());
        for &key in &reachable {
            let parent = forest.parent_of(key);
            prop_assert_eq!(engine.parent_of(&key), parent, "parent of {}", key);
            let depth = engine.depth_of(&key);
            match parent {
                None => prop_assert_eq!(depth, Some(0)),
                Some(p) => prop_assert_eq!(depth, engine.depth_of(&p).map(|d| d + 1)),
            }
        }

        let stats = engine.stats();
        prop_assert_eq!(stats.live_nodes, reachable.len());
        prop_assert_eq!(stats.live_subscriptions, reachable.len() + 1);
        prop_assert_eq!(forest_subscribers(&forest), reachable.len() + 1);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 5. Late subscribers
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn late_snapshot_matches_live_mirror(
        before in arb_ops(),
        after in arb_ops(),
    ) {
        let mut forest = Forest::new();
        let engine = engine_for(&forest, UpdatePolicy::RetainChildren);
        let early = ChangeRecorder::attach(&engine.connect());

        for op in before {
            forest.apply(op);
        }
        let late = ChangeRecorder::attach(&engine.connect());
        prop_assert_eq!(late.set_count(), usize::from(engine.count() > 0));
        prop_assert_eq!(late.keys(), early.keys());

        for op in after {
            forest.apply(op);
        }
        prop_assert_eq!(late.keys(), early.keys());
        prop_assert!(late.violations().is_empty(), "{:?}", late.violations());
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 6. Dispose releases everything
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn dispose_leaves_no_subscription(ops in arb_ops(), policy in arb_policy()) {
        let mut forest = Forest::new();
        let engine = engine_for(&forest, policy);
        let recorder = ChangeRecorder::attach(&engine.connect());

        for op in ops {
            forest.apply(op);
        }
        engine.dispose();

        prop_assert!(engine.is_disposed());
        prop_assert_eq!(engine.count(), 0);
        prop_assert_eq!(engine.stats().live_subscriptions, 0);
        prop_assert_eq!(forest_subscribers(&forest), 0);
        prop_assert!(recorder.keys().is_empty(), "removes were published");
        prop_assert!(recorder.violations().is_empty(), "{:?}", recorder.violations());
    }
}
