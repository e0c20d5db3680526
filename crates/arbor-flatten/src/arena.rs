#![forbid(unsafe_code)]

//! Subscription-node arena.
//!
//! Each live node is stored once, keyed by its collection key, with its parent
//! key, depth, child keys and the subscription to its own child stream. A
//! separate `owners` map resolves the numeric [`NodeId`] stamped on every
//! message back to the key that owns it; a message whose id is missing there
//! was produced by a node that has since been torn down.
//!
//! # Invariants
//!
//! 1. Every key appears at most once in `nodes`.
//! 2. `owners` and `nodes` stay in bijection: one id per live node.
//! 3. A node is either in `roots` (no parent) or in exactly one parent's
//!    `children` set.
//! 4. Removing a node removes its whole subtree and drops every subscription
//!    in it. Removal walks an explicit stack, so depth is unbounded.

use ahash::{AHashMap, AHashSet};
use arbor_core::{CollectionKey, CollectionValue, Subscription};

/// Identity of one attachment of a node.
///
/// A node gets a fresh id each time it (re)connects to its child stream, so
/// deliveries from an earlier connection are recognisably stale.
pub(crate) type NodeId = u64;

/// Where a key sits relative to a prospective parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Absent,
    /// Live under the same parent.
    Here,
    /// Live under a different parent.
    Elsewhere,
}

struct SubscriptionNode<K, V> {
    id: NodeId,
    value: V,
    parent: Option<K>,
    depth: usize,
    children: AHashSet<K>,
    subscription: Option<Subscription>,
}

pub(crate) struct NodeArena<K, V> {
    nodes: AHashMap<K, SubscriptionNode<K, V>>,
    owners: AHashMap<NodeId, K>,
    roots: AHashSet<K>,
    next_id: NodeId,
}

impl<K: CollectionKey, V: CollectionValue> NodeArena<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            nodes: AHashMap::new(),
            owners: AHashMap::new(),
            roots: AHashSet::new(),
            next_id: 1,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn owner(&self, id: NodeId) -> Option<&K> {
        self.owners.get(&id)
    }

    pub(crate) fn parent_of(&self, key: &K) -> Option<Option<&K>> {
        self.nodes.get(key).map(|node| node.parent.as_ref())
    }

    pub(crate) fn depth_of(&self, key: &K) -> Option<usize> {
        self.nodes.get(key).map(|node| node.depth)
    }

    /// Nodes currently holding a child subscription.
    pub(crate) fn live_subscriptions(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| node.subscription.as_ref().is_some_and(Subscription::is_active))
            .count()
    }

    pub(crate) fn placement(&self, key: &K, parent: Option<&K>) -> Placement {
        match self.nodes.get(key) {
            None => Placement::Absent,
            Some(node) if node.parent.as_ref() == parent => Placement::Here,
            Some(_) => Placement::Elsewhere,
        }
    }

    // ── Mutation ─────────────────────────────────────────────────────

    /// Insert a node without a subscription and return its id.
    ///
    /// The key must be absent and `parent`, if any, must be live.
    pub(crate) fn insert(&mut self, key: K, value: V, parent: Option<K>) -> NodeId {
        debug_assert!(!self.nodes.contains_key(&key), "key already live: {key:?}");
        let depth = match &parent {
            Some(p) => match self.nodes.get_mut(p) {
                Some(parent_node) => {
                    parent_node.children.insert(key.clone());
                    parent_node.depth + 1
                }
                None => 0,
            },
            None => {
                self.roots.insert(key.clone());
                0
            }
        };
        let id = self.fresh_id();
        self.owners.insert(id, key.clone());
        self.nodes.insert(
            key,
            SubscriptionNode {
                id,
                value,
                parent,
                depth,
                children: AHashSet::new(),
                subscription: None,
            },
        );
        id
    }

    /// Store the child subscription for `key`, if `key` still carries `id`.
    ///
    /// A mismatched or missing node drops the subscription instead.
    pub(crate) fn set_subscription(&mut self, key: &K, id: NodeId, subscription: Subscription) {
        if let Some(node) = self.nodes.get_mut(key)
            && node.id == id
        {
            node.subscription = Some(subscription);
        }
    }

    pub(crate) fn set_value(&mut self, key: &K, value: V) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.value = value;
        }
    }

    /// Drop `key`'s child subscription, store `value` and give the node a
    /// fresh id. Its children must already be gone.
    pub(crate) fn renew(&mut self, key: &K, value: V) -> Option<NodeId> {
        let id = self.fresh_id();
        let node = self.nodes.get_mut(key)?;
        node.subscription = None;
        node.value = value;
        self.owners.remove(&node.id);
        node.id = id;
        self.owners.insert(id, key.clone());
        Some(id)
    }

    /// Remove `key` and its subtree. Returns the removed keys, parents first.
    pub(crate) fn remove(&mut self, key: &K) -> Vec<K> {
        let parent = match self.nodes.get(key) {
            Some(node) => node.parent.clone(),
            None => return Vec::new(),
        };
        match parent {
            Some(p) => {
                if let Some(parent_node) = self.nodes.get_mut(&p) {
                    parent_node.children.remove(key);
                }
            }
            None => {
                self.roots.remove(key);
            }
        }
        self.remove_subtrees(vec![key.clone()])
    }

    /// Remove every descendant of `key`, keeping `key` itself.
    pub(crate) fn remove_children(&mut self, key: &K) -> Vec<K> {
        let children = match self.nodes.get_mut(key) {
            Some(node) => std::mem::take(&mut node.children),
            None => return Vec::new(),
        };
        self.remove_subtrees(children.into_iter().collect())
    }

    /// Remove every node. Returns the removed keys, parents first.
    pub(crate) fn clear(&mut self) -> Vec<K> {
        let roots: Vec<K> = self.roots.drain().collect();
        let removed = self.remove_subtrees(roots);
        debug_assert!(self.nodes.is_empty() && self.owners.is_empty());
        removed
    }

    fn remove_subtrees(&mut self, mut stack: Vec<K>) -> Vec<K> {
        let mut removed = Vec::new();
        while let Some(key) = stack.pop() {
            let Some(node) = self.nodes.remove(&key) else {
                continue;
            };
            let SubscriptionNode {
                id,
                children,
                subscription,
                ..
            } = node;
            self.owners.remove(&id);
            drop(subscription);
            stack.extend(children);
            removed.push(key);
        }
        removed
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

// ---- Tests ----
