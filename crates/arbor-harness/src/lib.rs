#![forbid(unsafe_code)]

//! Test harness and reference fixtures for Arbor.
//!
//! - [`fixture`]: [`TreeNode`], a value owning its child collection, with the
//!   matching selectors.
//! - [`forest`]: a [`Forest`] model driven by [`TreeOp`] sequences.
//! - [`invariant`]: reachability computed straight from the collections.
//! - [`recorder`]: a [`ChangeRecorder`] that mirrors a stream and flags
//!   changes that do not fit.

pub mod fixture;
pub mod forest;
pub mod invariant;
pub mod recorder;

pub use fixture::{TreeNode, chain, children_of, key_of, start_engine, start_engine_with};
pub use forest::{Forest, TreeOp};
pub use invariant::{Mismatch, check_flattened, diff_keys, reachable_keys};
pub use recorder::ChangeRecorder;
