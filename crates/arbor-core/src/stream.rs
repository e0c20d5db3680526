#![forbid(unsafe_code)]

//! Subscribable change-set streams.
//!
//! A [`ChangeStream`] is cold: nothing happens until `subscribe` is called,
//! and every subscription gets its own independent feed. Keyed collections
//! hand out streams through [`KeyedCollection::connect`], and operators (such
//! as flattening) build new streams with [`ChangeStream::from_fn`].
//!
//! [`KeyedCollection::connect`]: crate::collection::KeyedCollection::connect

use std::fmt;
use std::sync::Arc;

use crate::change::ChangeSet;
use crate::error::StreamError;
use crate::subscription::Subscription;

/// What a subscriber receives.
#[derive(Debug)]
pub enum Notification<'a, K, V> {
    /// One atomic batch of changes.
    Changes(&'a ChangeSet<K, V>),
    /// Terminal failure. Nothing follows it.
    Error(&'a StreamError),
}

impl<K, V> Clone for Notification<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for Notification<'_, K, V> {}

/// Shared subscriber callback.
pub type Sink<K, V> = Arc<dyn Fn(Notification<'_, K, V>) + Send + Sync>;

type SubscribeFn<K, V> = dyn Fn(Sink<K, V>) -> Subscription + Send + Sync;

/// A cold, cloneable stream of change sets.
pub struct ChangeStream<K, V> {
    subscribe: Arc<SubscribeFn<K, V>>,
}

impl<K, V> Clone for ChangeStream<K, V> {
    fn clone(&self) -> Self {
        Self {
            subscribe: Arc::clone(&self.subscribe),
        }
    }
}

impl<K, V> fmt::Debug for ChangeStream<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream").finish_non_exhaustive()
    }
}

impl<K: 'static, V: 'static> ChangeStream<K, V> {
    /// Build a stream from a subscribe function.
    ///
    /// `subscribe` is called once per subscriber with that subscriber's sink
    /// and must return the guard that detaches it.
    pub fn from_fn(subscribe: impl Fn(Sink<K, V>) -> Subscription + Send + Sync + 'static) -> Self {
        Self {
            subscribe: Arc::new(subscribe),
        }
    }

    /// A stream that never emits.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_fn(|_| Subscription::empty())
    }

    /// A stream that fails with `error` as soon as it is subscribed.
    #[must_use]
    pub fn failed(error: StreamError) -> Self {
        Self::from_fn(move |sink| {
            sink(Notification::Error(&error));
            Subscription::empty()
        })
    }

    /// Subscribe a closure.
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(Notification<'_, K, V>) + Send + Sync + 'static,
    {
        self.subscribe_sink(Arc::new(f))
    }

    /// Subscribe an already-shared sink.
    pub fn subscribe_sink(&self, sink: Sink<K, V>) -> Subscription {
        (self.subscribe)(sink)
    }
}
