#![forbid(unsafe_code)]

//! Change-stream recorder.
//!
//! Subscribes to a stream, keeps every change set it receives, and replays
//! them into a local mirror. The mirror flags any change that does not fit the
//! state built so far (an `Add` of a present key, a `Remove` of an absent
//! one), which makes protocol slips visible in tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use arbor_core::sync::lock;
use arbor_core::{ChangeReason, ChangeSet, ChangeStream, Notification, StreamError, Subscription};

#[derive(Debug)]
struct Log<V> {
    sets: Vec<ChangeSet<u32, V>>,
    errors: Vec<StreamError>,
    mirror: BTreeMap<u32, V>,
    violations: Vec<String>,
}

/// Records change sets from one subscription.
pub struct ChangeRecorder<V> {
    log: Arc<Mutex<Log<V>>>,
    subscription: Subscription,
}

impl<V: Clone + Send + Sync + 'static> ChangeRecorder<V> {
    /// Subscribe to `stream` and start recording.
    pub fn attach(stream: &ChangeStream<u32, V>) -> Self {
        Self::attach_with(stream, |_, _| {})
    }

    /// Like [`attach`](Self::attach), also calling `observe` with each change
    /// set and the mirror it produced.
    pub fn attach_with<F>(stream: &ChangeStream<u32, V>, observe: F) -> Self
    where
        F: Fn(&ChangeSet<u32, V>, &BTreeMap<u32, V>) + Send + Sync + 'static,
    {
        let log = Arc::new(Mutex::new(Log {
            sets: Vec::new(),
            errors: Vec::new(),
            mirror: BTreeMap::new(),
            violations: Vec::new(),
        }));
        let sink_log = Arc::clone(&log);
        let subscription = stream.subscribe(move |notification| {
            let mut log = lock(&sink_log);
            match notification {
                Notification::Changes(set) => {
                    log.apply(set);
                    observe(set, &log.mirror);
                }
                Notification::Error(err) => log.errors.push(err.clone()),
            }
        });
        Self { log, subscription }
    }

    /// Every change set received, in order.
    #[must_use]
    pub fn sets(&self) -> Vec<ChangeSet<u32, V>> {
        lock(&self.log).sets.clone()
    }

    #[must_use]
    pub fn set_count(&self) -> usize {
        lock(&self.log).sets.len()
    }

    #[must_use]
    pub fn last(&self) -> Option<ChangeSet<u32, V>> {
        lock(&self.log).sets.last().cloned()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<StreamError> {
        lock(&self.log).errors.clone()
    }

    /// Keys currently in the mirror.
    #[must_use]
    pub fn keys(&self) -> Vec<u32> {
        lock(&self.log).mirror.keys().copied().collect()
    }

    #[must_use]
    pub fn get(&self, key: u32) -> Option<V> {
        lock(&self.log).mirror.get(&key).cloned()
    }

    /// Changes that did not fit the mirror.
    #[must_use]
    pub fn violations(&self) -> Vec<String> {
        lock(&self.log).violations.clone()
    }

    /// Forget recorded sets; the mirror is kept.
    pub fn clear(&self) {
        lock(&self.log).sets.clear();
    }

    pub fn unsubscribe(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl<V: Clone> Log<V> {
    fn apply(&mut self, set: &ChangeSet<u32, V>) {
        for change in set {
            let present = self.mirror.contains_key(&change.key);
            match change.reason {
                ChangeReason::Add => {
                    if present {
                        self.violations.push(format!("add of present key {}", change.key));
                    }
                    self.mirror.insert(change.key, change.current.clone());
                }
                ChangeReason::Update => {
                    if !present {
                        self.violations.push(format!("update of absent key {}", change.key));
                    }
                    self.mirror.insert(change.key, change.current.clone());
                }
                ChangeReason::Remove => {
                    if self.mirror.remove(&change.key).is_none() {
                        self.violations.push(format!("remove of absent key {}", change.key));
                    }
                }
                ChangeReason::Refresh => {
                    if !present {
                        self.violations.push(format!("refresh of absent key {}", change.key));
                    }
                }
            }
        }
        self.sets.push(set.clone());
    }
}
