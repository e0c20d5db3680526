#![forbid(unsafe_code)]

//! Hierarchical change-set flattening.
//!
//! Turns a tree of keyed reactive collections, where every node may own a
//! collection of children, into one flat keyed view that tracks additions,
//! updates and removals at any depth.
//!
//! - [`flatten`] / [`FlattenExt::flatten_tree`]: stream operator; each
//!   subscriber gets its own engine.
//! - [`FlattenEngine`]: explicit engine handle with structural queries and
//!   [`FlattenStats`].
//! - [`FlattenConfig`]: update and duplicate-key policies.
//!
//! # Example
//!
//! ```
//! use arbor_core::KeyedCollection;
//! use arbor_flatten::{FlattenConfig, FlattenEngine};
//!
//! #[derive(Clone)]
//! struct Node {
//!     id: u32,
//!     children: KeyedCollection<u32, Node>,
//! }
//!
//! let leaf = Node { id: 2, children: KeyedCollection::new() };
//! let root_node = Node { id: 1, children: KeyedCollection::new() };
//! root_node.children.upsert(leaf.id, leaf);
//!
//! let roots = KeyedCollection::new();
//! roots.upsert(root_node.id, root_node.clone());
//!
//! let engine = FlattenEngine::start(
//!     roots.connect(),
//!     |n: &Node| Ok(n.children.connect()),
//!     |n: &Node| n.id,
//!     FlattenConfig::default(),
//! );
//! assert_eq!(engine.count(), 2);
//!
//! roots.remove(&1);
//! assert_eq!(engine.count(), 0);
//! assert_eq!(root_node.children.count(), 1);
//! ```

mod arena;
pub mod config;
pub mod engine;
mod gate;
pub mod operator;

pub use config::{DuplicateKeyPolicy, FlattenConfig, UpdatePolicy};
pub use engine::{ChildSelector, FlattenEngine, FlattenStats, KeySelector};
pub use operator::{FlattenExt, flatten, flatten_with};
