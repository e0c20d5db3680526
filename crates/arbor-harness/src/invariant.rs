#![forbid(unsafe_code)]

//! Independent reachability check for flattened views.
//!
//! Walks the live collections from the roots without going through the
//! engine, so a mismatch points at the engine rather than at the checker.

use std::collections::BTreeSet;
use std::fmt;

use arbor_core::KeyedCollection;
use arbor_flatten::FlattenEngine;

use crate::fixture::TreeNode;

/// Every key reachable from `roots` through child collections.
///
/// Cycles are cut at the first revisit.
#[must_use]
pub fn reachable_keys(roots: &KeyedCollection<u32, TreeNode>) -> BTreeSet<u32> {
    let mut seen = BTreeSet::new();
    let mut stack = roots.items();
    while let Some(node) = stack.pop() {
        if seen.insert(node.id()) {
            stack.extend(node.children().items());
        }
    }
    seen
}

/// Difference between the flattened view and the reachable set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mismatch {
    /// Reachable keys missing from the view.
    pub missing: Vec<u32>,
    /// Keys in the view that are not reachable.
    pub unexpected: Vec<u32>,
}

impl Mismatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flattened view diverged: missing {:?}, unexpected {:?}",
            self.missing, self.unexpected
        )
    }
}

/// Compare a set of flattened keys with the reachable set.
#[must_use]
pub fn diff_keys(flattened: impl IntoIterator<Item = u32>, reachable: &BTreeSet<u32>) -> Mismatch {
    let flattened: BTreeSet<u32> = flattened.into_iter().collect();
    Mismatch {
        missing: reachable.difference(&flattened).copied().collect(),
        unexpected: flattened.difference(reachable).copied().collect(),
    }
}

/// Check that `engine`'s view holds exactly the keys reachable from `roots`.
///
/// # Errors
///
/// Returns the [`Mismatch`] when the two sets differ.
pub fn check_flattened(
    engine: &FlattenEngine<u32, TreeNode>,
    roots: &KeyedCollection<u32, TreeNode>,
) -> Result<(), Mismatch> {
    let mismatch = diff_keys(engine.keys(), &reachable_keys(roots));
    if mismatch.is_empty() {
        Ok(())
    } else {
        Err(mismatch)
    }
}
