#![forbid(unsafe_code)]

//! A mutable forest of [`TreeNode`]s driven by [`TreeOp`] sequences.
//!
//! The forest owns the root collection and remembers every node it created,
//! including detached ones, so random operation sequences can address nodes
//! by id. Ids are never reused, which keeps keys unique across the tree.

use ahash::AHashMap;
use arbor_core::KeyedCollection;
use tracing::trace;

use crate::fixture::TreeNode;

/// One mutation of a [`Forest`].
///
/// Ops naming unknown ids, or ids in the wrong state, are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOp {
    /// Create node `id` as a root.
    AddRoot { id: u32 },
    /// Create node `id` under `parent`, attached or not.
    AddChild { parent: u32, id: u32 },
    /// Take node `id` out of its container. Its subtree stays intact.
    Remove { id: u32 },
    /// Put a detached node back as a root, subtree included.
    Restore { id: u32 },
    /// Upsert node `id` under a new label in its container.
    Relabel { id: u32 },
    /// Refresh node `id` in its container.
    Refresh { id: u32 },
}

/// Where a node lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Root,
    Child(u32),
    Detached,
}

pub struct Forest {
    roots: KeyedCollection<u32, TreeNode>,
    nodes: AHashMap<u32, TreeNode>,
    slots: AHashMap<u32, Slot>,
    relabels: u32,
}

impl Default for Forest {
    fn default() -> Self {
        Self::new()
    }
}

impl Forest {
    #[must_use]
    pub fn new() -> Self {
        Self {
            roots: KeyedCollection::new(),
            nodes: AHashMap::new(),
            slots: AHashMap::new(),
            relabels: 0,
        }
    }

    #[must_use]
    pub fn roots(&self) -> &KeyedCollection<u32, TreeNode> {
        &self.roots
    }

    /// The node with `id`, attached or not.
    #[must_use]
    pub fn node(&self, id: u32) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    /// Ids of every node ever created.
    #[must_use]
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Parent id of an attached child node.
    #[must_use]
    pub fn parent_of(&self, id: u32) -> Option<u32> {
        match self.slots.get(&id) {
            Some(Slot::Child(parent)) => Some(*parent),
            _ => None,
        }
    }

    /// Apply `op`. Returns whether it changed anything.
    pub fn apply(&mut self, op: TreeOp) -> bool {
        let applied = match op {
            TreeOp::AddRoot { id } => self.add_root(id),
            TreeOp::AddChild { parent, id } => self.add_child(parent, id),
            TreeOp::Remove { id } => self.remove(id),
            TreeOp::Restore { id } => self.restore(id),
            TreeOp::Relabel { id } => self.relabel(id),
            TreeOp::Refresh { id } => self.refresh(id),
        };
        trace!(?op, applied, "forest op");
        applied
    }

    fn add_root(&mut self, id: u32) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        let node = TreeNode::leaf(id);
        self.nodes.insert(id, node.clone());
        self.slots.insert(id, Slot::Root);
        self.roots.upsert(id, node);
        true
    }

    fn add_child(&mut self, parent: u32, id: u32) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        let Some(parent_node) = self.nodes.get(&parent) else {
            return false;
        };
        let node = TreeNode::leaf(id);
        parent_node.add_child(node.clone());
        self.nodes.insert(id, node);
        self.slots.insert(id, Slot::Child(parent));
        true
    }

    fn remove(&mut self, id: u32) -> bool {
        let Some(container) = self.container(id) else {
            return false;
        };
        container.remove(&id);
        self.slots.insert(id, Slot::Detached);
        true
    }

    fn restore(&mut self, id: u32) -> bool {
        if self.slots.get(&id) != Some(&Slot::Detached) {
            return false;
        }
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        self.roots.upsert(id, node.clone());
        self.slots.insert(id, Slot::Root);
        true
    }

    fn relabel(&mut self, id: u32) -> bool {
        let Some(container) = self.container(id) else {
            return false;
        };
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        self.relabels += 1;
        let renamed = node.relabeled(format!("n{id}.v{}", self.relabels));
        container.upsert(id, renamed.clone());
        self.nodes.insert(id, renamed);
        true
    }

    fn refresh(&mut self, id: u32) -> bool {
        self.container(id)
            .is_some_and(|container| container.refresh(&id))
    }

    /// The collection currently holding `id`.
    fn container(&self, id: u32) -> Option<KeyedCollection<u32, TreeNode>> {
        match self.slots.get(&id)? {
            Slot::Root => Some(self.roots.clone()),
            Slot::Child(parent) => self.nodes.get(parent).map(|p| p.children().clone()),
            Slot::Detached => None,
        }
    }
}
