#![forbid(unsafe_code)]

//! Change events and change sets.
//!
//! A [`ChangeSet`] is the unit of notification: every subscriber of a
//! collection receives the changes of one mutation (or one batched edit) as a
//! single set. Replaying every set from the start reconstructs the collection.

use std::fmt::Debug;
use std::hash::Hash;

/// Bounds required of a collection key.
pub trait CollectionKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> CollectionKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Bounds required of a collection value.
pub trait CollectionValue: Clone + Send + Sync + 'static {}

impl<T> CollectionValue for T where T: Clone + Send + Sync + 'static {}

/// Why a change was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeReason {
    /// The key was absent and is now present.
    Add,
    /// The key was present and its value was replaced.
    Update,
    /// The key was present and is now absent.
    Remove,
    /// The key is unchanged but observers should re-evaluate it.
    Refresh,
}

/// A single keyed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<K, V> {
    /// Reason for the change.
    pub reason: ChangeReason,
    /// Key of the affected entry.
    pub key: K,
    /// Value after the change. For `Remove`, the value that was removed.
    pub current: V,
    /// Value before the change. `Some` only for `Update`.
    pub previous: Option<V>,
}

impl<K, V> Change<K, V> {
    /// An `Add` change.
    #[must_use]
    pub fn add(key: K, current: V) -> Self {
        Self {
            reason: ChangeReason::Add,
            key,
            current,
            previous: None,
        }
    }

    /// An `Update` change replacing `previous` with `current`.
    #[must_use]
    pub fn update(key: K, current: V, previous: V) -> Self {
        Self {
            reason: ChangeReason::Update,
            key,
            current,
            previous: Some(previous),
        }
    }

    /// A `Remove` change carrying the removed value.
    #[must_use]
    pub fn remove(key: K, removed: V) -> Self {
        Self {
            reason: ChangeReason::Remove,
            key,
            current: removed,
            previous: None,
        }
    }

    /// A `Refresh` change.
    #[must_use]
    pub fn refresh(key: K, current: V) -> Self {
        Self {
            reason: ChangeReason::Refresh,
            key,
            current,
            previous: None,
        }
    }
}

/// An ordered batch of changes delivered as one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet<K, V> {
    changes: Vec<Change<K, V>>,
}

impl<K, V> Default for ChangeSet<K, V> {
    fn default() -> Self {
        Self {
            changes: Vec::new(),
        }
    }
}

impl<K, V> ChangeSet<K, V> {
    /// An empty change set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty change set with room for `capacity` changes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            changes: Vec::with_capacity(capacity),
        }
    }

    /// Append a change.
    pub fn push(&mut self, change: Change<K, V>) {
        self.changes.push(change);
    }

    /// Number of changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether the set carries no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of `Add` changes.
    #[must_use]
    pub fn adds(&self) -> usize {
        self.count(ChangeReason::Add)
    }

    /// Number of `Update` changes.
    #[must_use]
    pub fn updates(&self) -> usize {
        self.count(ChangeReason::Update)
    }

    /// Number of `Remove` changes.
    #[must_use]
    pub fn removes(&self) -> usize {
        self.count(ChangeReason::Remove)
    }

    /// Number of `Refresh` changes.
    #[must_use]
    pub fn refreshes(&self) -> usize {
        self.count(ChangeReason::Refresh)
    }

    /// Iterate the changes in emission order.
    pub fn iter(&self) -> std::slice::Iter<'_, Change<K, V>> {
        self.changes.iter()
    }

    fn count(&self, reason: ChangeReason) -> usize {
        self.changes.iter().filter(|c| c.reason == reason).count()
    }
}

impl<K, V> From<Vec<Change<K, V>>> for ChangeSet<K, V> {
    fn from(changes: Vec<Change<K, V>>) -> Self {
        Self { changes }
    }
}

impl<K, V> FromIterator<Change<K, V>> for ChangeSet<K, V> {
    fn from_iter<I: IntoIterator<Item = Change<K, V>>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

impl<K, V> IntoIterator for ChangeSet<K, V> {
    type Item = Change<K, V>;
    type IntoIter = std::vec::IntoIter<Change<K, V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a, K, V> IntoIterator for &'a ChangeSet<K, V> {
    type Item = &'a Change<K, V>;
    type IntoIter = std::slice::Iter<'a, Change<K, V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}
