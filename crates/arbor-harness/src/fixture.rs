#![forbid(unsafe_code)]

//! Reference node type and selectors.

use std::fmt;

use arbor_core::{ChangeStream, KeyedCollection, StreamError};
use arbor_flatten::{FlattenConfig, FlattenEngine};

/// A tree node that owns the collection of its direct children.
///
/// Cloning shares the child collection, so a relabeled copy of a node keeps
/// the same children.
#[derive(Clone)]
pub struct TreeNode {
    id: u32,
    label: String,
    children: KeyedCollection<u32, TreeNode>,
}

impl TreeNode {
    pub fn new(id: u32, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            children: KeyedCollection::new(),
        }
    }

    /// A node labeled `n{id}`.
    pub fn leaf(id: u32) -> Self {
        Self::new(id, format!("n{id}"))
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn children(&self) -> &KeyedCollection<u32, TreeNode> {
        &self.children
    }

    /// Add `child` and return `self`, for building trees inline.
    #[must_use]
    pub fn with_child(self, child: TreeNode) -> Self {
        self.add_child(child);
        self
    }

    pub fn add_child(&self, child: TreeNode) {
        self.children.upsert(child.id, child);
    }

    pub fn remove_child(&self, id: u32) -> Option<TreeNode> {
        self.children.remove(&id)
    }

    /// Same node and children under a new label.
    #[must_use]
    pub fn relabeled(&self, label: impl Into<String>) -> Self {
        Self {
            id: self.id,
            label: label.into(),
            children: self.children.clone(),
        }
    }

    /// Same id and label with a fresh, empty child collection.
    #[must_use]
    pub fn detached_copy(&self) -> Self {
        Self::new(self.id, self.label.clone())
    }
}

impl PartialEq for TreeNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.label == other.label && self.children.ptr_eq(&other.children)
    }
}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeNode")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("children", &self.children.count())
            .finish()
    }
}

/// Child selector for [`TreeNode`].
pub fn children_of(node: &TreeNode) -> Result<ChangeStream<u32, TreeNode>, StreamError> {
    Ok(node.children.connect())
}

/// Key selector for [`TreeNode`].
#[must_use]
pub fn key_of(node: &TreeNode) -> u32 {
    node.id
}

/// Start an engine over `roots` with the default configuration.
pub fn start_engine(roots: &KeyedCollection<u32, TreeNode>) -> FlattenEngine<u32, TreeNode> {
    start_engine_with(roots, FlattenConfig::default())
}

pub fn start_engine_with(
    roots: &KeyedCollection<u32, TreeNode>,
    config: FlattenConfig,
) -> FlattenEngine<u32, TreeNode> {
    FlattenEngine::start(roots.connect(), children_of, key_of, config)
}

/// Linear chain `ids[0] -> ids[1] -> ...`, returned root first.
///
/// # Panics
///
/// Panics if `ids` is empty.
#[must_use]
pub fn chain(ids: &[u32]) -> Vec<TreeNode> {
    assert!(!ids.is_empty(), "chain needs at least one node");
    let nodes: Vec<TreeNode> = ids.iter().map(|&id| TreeNode::leaf(id)).collect();
    for pair in nodes.windows(2) {
        pair[0].add_child(pair[1].clone());
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relabeled_shares_children() {
        let node = TreeNode::leaf(1).with_child(TreeNode::leaf(2));
        let renamed = node.relabeled("root");
        assert_eq!(renamed.children().count(), 1);
        renamed.add_child(TreeNode::leaf(3));
        assert_eq!(node.children().count(), 2);
        assert_ne!(node, renamed);
        assert_eq!(renamed, renamed.clone());
    }

    #[test]
    fn chain_links_each_level() {
        let nodes = chain(&[1, 2, 3]);
        assert_eq!(nodes[0].children().keys(), vec![2]);
        assert_eq!(nodes[1].children().keys(), vec![3]);
        assert!(nodes[2].children().is_empty());
    }

    #[test]
    fn detached_copy_has_no_children() {
        let node = TreeNode::leaf(1).with_child(TreeNode::leaf(2));
        let copy = node.detached_copy();
        assert_eq!(copy.id(), 1);
        assert_eq!(copy.label(), "n1");
        assert!(copy.children().is_empty());
    }
}
