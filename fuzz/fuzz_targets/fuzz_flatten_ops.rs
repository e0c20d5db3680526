#![no_main]

use arbitrary::Arbitrary;
use arbor_flatten::{FlattenConfig, UpdatePolicy};
use arbor_harness::{ChangeRecorder, Forest, TreeOp, check_flattened, start_engine_with};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum FuzzOp {
    AddRoot(u8),
    AddChild { parent: u8, id: u8 },
    Remove(u8),
    Restore(u8),
    Relabel(u8),
    Refresh(u8),
}

impl FuzzOp {
    fn to_tree_op(&self) -> TreeOp {
        // Small id space so ops keep hitting existing nodes.
        let id = |b: &u8| u32::from(*b % 32);
        match self {
            FuzzOp::AddRoot(b) => TreeOp::AddRoot { id: id(b) },
            FuzzOp::AddChild { parent, id: child } => TreeOp::AddChild {
                parent: id(parent),
                id: id(child),
            },
            FuzzOp::Remove(b) => TreeOp::Remove { id: id(b) },
            FuzzOp::Restore(b) => TreeOp::Restore { id: id(b) },
            FuzzOp::Relabel(b) => TreeOp::Relabel { id: id(b) },
            FuzzOp::Refresh(b) => TreeOp::Refresh { id: id(b) },
        }
    }
}

#[derive(Arbitrary, Debug)]
struct Input {
    resubscribe: bool,
    ops: Vec<FuzzOp>,
}

fuzz_target!(|input: Input| {
    let policy = if input.resubscribe {
        UpdatePolicy::Resubscribe
    } else {
        UpdatePolicy::RetainChildren
    };
    let mut forest = Forest::new();
    let engine = start_engine_with(
        forest.roots(),
        FlattenConfig::default().with_update_policy(policy),
    );
    let recorder = ChangeRecorder::attach(&engine.connect());

    for op in input.ops.iter().take(512) {
        let op = op.to_tree_op();
        forest.apply(op);
        if let Err(mismatch) = check_flattened(&engine, forest.roots()) {
            panic!("after {op:?}: {mismatch}");
        }
    }
    assert!(recorder.violations().is_empty(), "{:?}", recorder.violations());

    engine.dispose();
    assert_eq!(engine.stats().live_subscriptions, 0);
    assert_eq!(forest.roots().subscriber_count(), 0);
});
