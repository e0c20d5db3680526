#![forbid(unsafe_code)]

//! The `flatten` stream operator.
//!
//! Each subscription to a flattened stream starts its own [`FlattenEngine`]
//! and owns it: dropping the subscription disposes the engine and releases
//! every child subscription it held.

use std::sync::Arc;

use arbor_core::{ChangeStream, CollectionKey, CollectionValue, StreamError, Subscription};

use crate::config::FlattenConfig;
use crate::engine::{ChildSelector, FlattenEngine, KeySelector};

/// Flatten a tree of change streams into one stream of every reachable node.
///
/// `children_of` maps a node to the stream of its direct children and
/// `key_of` maps any node to its key. Keys must be unique across the tree.
pub fn flatten<K, V, C, F>(source: ChangeStream<K, V>, children_of: C, key_of: F) -> ChangeStream<K, V>
where
    K: CollectionKey,
    V: CollectionValue,
    C: Fn(&V) -> Result<ChangeStream<K, V>, StreamError> + Send + Sync + 'static,
    F: Fn(&V) -> K + Send + Sync + 'static,
{
    flatten_with(source, children_of, key_of, FlattenConfig::default())
}

/// [`flatten`] with an explicit configuration.
pub fn flatten_with<K, V, C, F>(
    source: ChangeStream<K, V>,
    children_of: C,
    key_of: F,
    config: FlattenConfig,
) -> ChangeStream<K, V>
where
    K: CollectionKey,
    V: CollectionValue,
    C: Fn(&V) -> Result<ChangeStream<K, V>, StreamError> + Send + Sync + 'static,
    F: Fn(&V) -> K + Send + Sync + 'static,
{
    let children_of: Arc<ChildSelector<K, V>> = Arc::new(children_of);
    let key_of: Arc<KeySelector<K, V>> = Arc::new(key_of);
    ChangeStream::from_fn(move |sink| {
        let engine = FlattenEngine::start_shared(
            source.clone(),
            Arc::clone(&children_of),
            Arc::clone(&key_of),
            config.clone(),
        );
        let mut output = engine.connect().subscribe_sink(sink);
        Subscription::new(move || {
            output.unsubscribe();
            engine.dispose();
        })
    })
}

/// Method-call form of [`flatten`].
pub trait FlattenExt<K: CollectionKey, V: CollectionValue> {
    /// See [`flatten`].
    fn flatten_tree<C, F>(self, children_of: C, key_of: F) -> ChangeStream<K, V>
    where
        C: Fn(&V) -> Result<ChangeStream<K, V>, StreamError> + Send + Sync + 'static,
        F: Fn(&V) -> K + Send + Sync + 'static;

    /// See [`flatten_with`].
    fn flatten_tree_with<C, F>(self, children_of: C, key_of: F, config: FlattenConfig) -> ChangeStream<K, V>
    where
        C: Fn(&V) -> Result<ChangeStream<K, V>, StreamError> + Send + Sync + 'static,
        F: Fn(&V) -> K + Send + Sync + 'static;
}

impl<K: CollectionKey, V: CollectionValue> FlattenExt<K, V> for ChangeStream<K, V> {
    fn flatten_tree<C, F>(self, children_of: C, key_of: F) -> ChangeStream<K, V>
    where
        C: Fn(&V) -> Result<ChangeStream<K, V>, StreamError> + Send + Sync + 'static,
        F: Fn(&V) -> K + Send + Sync + 'static,
    {
        flatten(self, children_of, key_of)
    }

    fn flatten_tree_with<C, F>(self, children_of: C, key_of: F, config: FlattenConfig) -> ChangeStream<K, V>
    where
        C: Fn(&V) -> Result<ChangeStream<K, V>, StreamError> + Send + Sync + 'static,
        F: Fn(&V) -> K + Send + Sync + 'static,
    {
        flatten_with(self, children_of, key_of, config)
    }
}
