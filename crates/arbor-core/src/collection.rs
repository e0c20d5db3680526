#![forbid(unsafe_code)]

//! Thread-safe keyed reactive collection.
//!
//! # Design
//!
//! [`KeyedCollection<K, V>`] keeps its entries behind shared, reference-counted
//! storage. Every mutation (or batched [`edit`](KeyedCollection::edit))
//! produces one [`ChangeSet`] that is pushed to all current subscribers.
//!
//! Three locks cooperate:
//!
//! - `emit` serializes mutation and delivery across threads, so every
//!   subscriber sees change sets in mutation order and a new subscriber's
//!   snapshot never interleaves with a live mutation. It is reentrant: a
//!   callback may subscribe to the collection that is calling it, and gets a
//!   snapshot that already includes the change being delivered.
//! - `state` guards the entries and is released before subscribers run, so a
//!   callback may read the collection it is observing.
//! - `subscribers` is only held to copy or edit the list, so unsubscribing
//!   never waits behind a delivery in progress.
//!
//! # Invariants
//!
//! 1. `upsert` of an absent key emits `Add`; of a present key emits `Update`.
//! 2. `remove` of an absent key emits nothing.
//! 3. `connect()` replays the current entries as one set of `Add`s before any
//!    live change reaches that subscriber.
//! 4. An edit that changes nothing emits nothing.
//! 5. After `fail` or `dispose`, mutations are ignored and no further change
//!    sets are emitted.
//!
//! # Failure Modes
//!
//! - **Re-entrant mutation**: mutating a collection from inside one of its own
//!   subscriber callbacks delivers the nested change set immediately, so
//!   subscribers later in the list see it before the outer one. Callbacks
//!   should hand such work to another owner (the flatten engine queues it).
//! - **Mutation inside `edit`**: calling back into the same collection from
//!   an `edit` closure deadlocks on `state`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use ahash::AHashMap;
use parking_lot::ReentrantMutex;
use tracing::{debug, warn};

use crate::change::{Change, ChangeSet, CollectionKey, CollectionValue};
use crate::error::StreamError;
use crate::stream::{ChangeStream, Notification, Sink};
use crate::subscription::Subscription;
use crate::sync::lock;

#[derive(Debug, Clone)]
enum Status {
    Live,
    Faulted(StreamError),
    Disposed,
}

impl Status {
    fn name(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Faulted(_) => "faulted",
            Self::Disposed => "disposed",
        }
    }
}

struct State<K, V> {
    entries: AHashMap<K, V>,
    status: Status,
}

struct Subscriber<K, V> {
    id: u64,
    sink: Sink<K, V>,
    alive: Arc<AtomicBool>,
}

struct Shared<K, V> {
    emit: ReentrantMutex<()>,
    state: Mutex<State<K, V>>,
    subscribers: Mutex<Vec<Subscriber<K, V>>>,
    next_subscriber: AtomicU64,
}

impl<K: CollectionKey, V: CollectionValue> Shared<K, V> {
    /// Deliver to every subscriber registered right now. Caller holds `emit`.
    fn broadcast(&self, notification: Notification<'_, K, V>) {
        let targets: Vec<(Sink<K, V>, Arc<AtomicBool>)> = lock(&self.subscribers)
            .iter()
            .map(|s| (Arc::clone(&s.sink), Arc::clone(&s.alive)))
            .collect();
        for (sink, alive) in targets {
            if alive.load(Ordering::Acquire) {
                sink(notification);
            }
        }
    }

    fn detach_all(&self) {
        for subscriber in lock(&self.subscribers).drain(..) {
            subscriber.alive.store(false, Ordering::Release);
        }
    }
}

enum Attach<K, V> {
    Snapshot(ChangeSet<K, V>),
    Faulted(StreamError),
    Disposed,
}

/// A keyed collection that publishes its mutations as change sets.
///
/// Cloning a `KeyedCollection` creates a new handle to the **same** entries.
pub struct KeyedCollection<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for KeyedCollection<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: CollectionKey, V: CollectionValue> Default for KeyedCollection<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CollectionKey, V: CollectionValue> fmt::Debug for KeyedCollection<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("KeyedCollection")
            .field("count", &state.entries.len())
            .field("status", &state.status.name())
            .field("subscribers", &lock(&self.shared.subscribers).len())
            .finish()
    }
}

impl<K: CollectionKey, V: CollectionValue> KeyedCollection<K, V> {
    /// An empty, live collection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                emit: ReentrantMutex::new(()),
                state: Mutex::new(State {
                    entries: AHashMap::new(),
                    status: Status::Live,
                }),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// Whether two handles refer to the same collection.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // ── Mutation ─────────────────────────────────────────────────────

    /// Apply several mutations and emit them as one change set.
    ///
    /// Returns `None` without calling `f` when the collection has failed or
    /// been disposed.
    pub fn edit<R>(&self, f: impl FnOnce(&mut Updater<'_, K, V>) -> R) -> Option<R> {
        let _emit = self.shared.emit.lock();
        let (result, changes) = {
            let mut state = lock(&self.shared.state);
            if !matches!(state.status, Status::Live) {
                warn!(status = state.status.name(), "mutation ignored on closed collection");
                return None;
            }
            let mut updater = Updater {
                entries: &mut state.entries,
                changes: ChangeSet::new(),
            };
            let result = f(&mut updater);
            (result, updater.changes)
        };
        if !changes.is_empty() {
            self.shared.broadcast(Notification::Changes(&changes));
        }
        Some(result)
    }

    /// Insert `value` under `key`, replacing any existing value.
    pub fn upsert(&self, key: K, value: V) {
        self.edit(|u| u.upsert(key, value));
    }

    /// Remove `key`, returning the removed value.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.edit(|u| u.remove(key)).flatten()
    }

    /// Emit a `Refresh` for `key` if present.
    pub fn refresh(&self, key: &K) -> bool {
        self.edit(|u| u.refresh(key)).unwrap_or(false)
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.edit(|u| u.clear());
    }

    /// Fail the collection: subscribers receive `error` once and are detached.
    ///
    /// Later subscribers receive the same error immediately. No-op unless the
    /// collection is live.
    pub fn fail(&self, error: StreamError) {
        let _emit = self.shared.emit.lock();
        {
            let mut state = lock(&self.shared.state);
            if !matches!(state.status, Status::Live) {
                return;
            }
            state.status = Status::Faulted(error.clone());
        }
        debug!(%error, "collection faulted");
        self.shared.broadcast(Notification::Error(&error));
        self.shared.detach_all();
    }

    /// Detach every subscriber and stop accepting mutations.
    ///
    /// Entries stay readable. Calling it twice is a no-op.
    pub fn dispose(&self) {
        let _emit = self.shared.emit.lock();
        {
            let mut state = lock(&self.shared.state);
            if matches!(state.status, Status::Live) {
                state.status = Status::Disposed;
            }
        }
        self.shared.detach_all();
    }

    // ── Observation ──────────────────────────────────────────────────

    /// Stream of this collection's change sets, starting with a snapshot.
    #[must_use]
    pub fn connect(&self) -> ChangeStream<K, V> {
        let shared = Arc::clone(&self.shared);
        ChangeStream::from_fn(move |sink| attach(&shared, sink))
    }

    /// Number of entries.
    #[must_use]
    pub fn count(&self) -> usize {
        lock(&self.shared.state).entries.len()
    }

    /// Whether the collection holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Clone of the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        lock(&self.shared.state).entries.get(key).cloned()
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        lock(&self.shared.state).entries.contains_key(key)
    }

    /// Every key, in no particular order.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        lock(&self.shared.state).entries.keys().cloned().collect()
    }

    /// Every value, in no particular order.
    #[must_use]
    pub fn items(&self) -> Vec<V> {
        lock(&self.shared.state).entries.values().cloned().collect()
    }

    /// The terminal error, if the collection failed.
    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        match &lock(&self.shared.state).status {
            Status::Faulted(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Whether [`dispose`](Self::dispose) has been called on a live collection.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        matches!(lock(&self.shared.state).status, Status::Disposed)
    }

    /// Number of attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.subscribers).len()
    }
}

fn attach<K: CollectionKey, V: CollectionValue>(
    shared: &Arc<Shared<K, V>>,
    sink: Sink<K, V>,
) -> Subscription {
    let _emit = shared.emit.lock();
    let attach = {
        let state = lock(&shared.state);
        match &state.status {
            Status::Live => Attach::Snapshot(
                state
                    .entries
                    .iter()
                    .map(|(k, v)| Change::add(k.clone(), v.clone()))
                    .collect(),
            ),
            Status::Faulted(err) => Attach::Faulted(err.clone()),
            Status::Disposed => Attach::Disposed,
        }
    };

    let snapshot = match attach {
        Attach::Snapshot(snapshot) => snapshot,
        Attach::Faulted(err) => {
            sink(Notification::Error(&err));
            return Subscription::empty();
        }
        Attach::Disposed => return Subscription::empty(),
    };

    let id = shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
    let alive = Arc::new(AtomicBool::new(true));
    lock(&shared.subscribers).push(Subscriber {
        id,
        sink: Arc::clone(&sink),
        alive: Arc::clone(&alive),
    });

    if !snapshot.is_empty() {
        sink(Notification::Changes(&snapshot));
    }

    let weak: Weak<Shared<K, V>> = Arc::downgrade(shared);
    Subscription::new(move || {
        alive.store(false, Ordering::Release);
        if let Some(shared) = weak.upgrade() {
            lock(&shared.subscribers).retain(|s| s.id != id);
        }
    })
}

/// Mutable view handed to [`KeyedCollection::edit`].
///
/// Every operation records the change it causes; the whole edit is emitted as
/// one change set when the closure returns.
pub struct Updater<'a, K, V> {
    entries: &'a mut AHashMap<K, V>,
    changes: ChangeSet<K, V>,
}

impl<K: CollectionKey, V: CollectionValue> Updater<'_, K, V> {
    /// Insert or replace.
    pub fn upsert(&mut self, key: K, value: V) {
        match self.entries.insert(key.clone(), value.clone()) {
            Some(previous) => self.changes.push(Change::update(key, value, previous)),
            None => self.changes.push(Change::add(key, value)),
        }
    }

    /// Remove `key` if present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key)?;
        self.changes
            .push(Change::remove(key.clone(), removed.clone()));
        Some(removed)
    }

    /// Record a `Refresh` for `key` if present.
    pub fn refresh(&mut self, key: &K) -> bool {
        match self.entries.get(key) {
            Some(value) => {
                self.changes.push(Change::refresh(key.clone(), value.clone()));
                true
            }
            None => false,
        }
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        for (key, value) in self.entries.drain() {
            self.changes.push(Change::remove(key, value));
        }
    }

    /// Current value under `key`, including edits made so far.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Current entry count, including edits made so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the collection is empty, including edits made so far.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeReason;
    use std::thread;

    type Log = Arc<Mutex<Vec<ChangeSet<u32, String>>>>;

    fn record(collection: &KeyedCollection<u32, String>) -> (Subscription, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let sub = collection.connect().subscribe(move |n| {
            if let Notification::Changes(set) = n {
                l.lock().unwrap().push(set.clone());
            }
        });
        (sub, log)
    }

    fn reasons(log: &Log) -> Vec<ChangeReason> {
        log.lock()
            .unwrap()
            .iter()
            .flat_map(|set| set.iter().map(|c| c.reason).collect::<Vec<_>>())
            .collect()
    }

    #[test]
    fn upsert_same_pair_twice_is_add_then_update() {
        let c = KeyedCollection::new();
        let (_sub, log) = record(&c);

        c.upsert(1, "a".to_string());
        c.upsert(1, "a".to_string());

        assert_eq!(reasons(&log), vec![ChangeReason::Add, ChangeReason::Update]);
        assert_eq!(c.count(), 1);
        let sets = log.lock().unwrap();
        assert_eq!(sets[1].iter().next().unwrap().previous.as_deref(), Some("a"));
    }

    #[test]
    fn remove_absent_key_emits_nothing() {
        let c: KeyedCollection<u32, String> = KeyedCollection::new();
        let (_sub, log) = record(&c);
        assert_eq!(c.remove(&9), None);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn remove_present_key_carries_removed_value() {
        let c = KeyedCollection::new();
        c.upsert(3, "three".to_string());
        let (_sub, log) = record(&c);
        assert_eq!(c.remove(&3).as_deref(), Some("three"));
        let sets = log.lock().unwrap();
        let last = sets.last().unwrap().iter().next().unwrap().clone();
        assert_eq!(last.reason, ChangeReason::Remove);
        assert_eq!(last.current, "three");
        assert!(c.is_empty());
    }

    #[test]
    fn connect_replays_snapshot_then_live() {
        let c = KeyedCollection::new();
        c.upsert(1, "a".to_string());
        c.upsert(2, "b".to_string());

        let (_sub, log) = record(&c);
        {
            let sets = log.lock().unwrap();
            assert_eq!(sets.len(), 1);
            assert_eq!(sets[0].adds(), 2);
        }

        c.upsert(3, "c".to_string());
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn empty_collection_replays_nothing() {
        let c: KeyedCollection<u32, String> = KeyedCollection::new();
        let (_sub, log) = record(&c);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn subscribers_are_independent() {
        let c = KeyedCollection::new();
        let (mut first, log1) = record(&c);
        c.upsert(1, "a".to_string());
        let (_second, log2) = record(&c);
        first.unsubscribe();
        c.upsert(2, "b".to_string());

        assert_eq!(log1.lock().unwrap().len(), 1);
        // Snapshot of key 1, then the live add of key 2.
        assert_eq!(log2.lock().unwrap().len(), 2);
        assert_eq!(c.subscriber_count(), 1);
    }

    #[test]
    fn edit_batches_into_one_set() {
        let c = KeyedCollection::new();
        let (_sub, log) = record(&c);
        c.edit(|u| {
            u.upsert(1, "a".to_string());
            u.upsert(2, "b".to_string());
            u.remove(&1);
            assert_eq!(u.len(), 1);
        });
        let sets = log.lock().unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].adds(), 2);
        assert_eq!(sets[0].removes(), 1);
    }

    #[test]
    fn empty_edit_emits_nothing() {
        let c: KeyedCollection<u32, String> = KeyedCollection::new();
        let (_sub, log) = record(&c);
        c.edit(|u| {
            u.remove(&1);
            u.refresh(&1);
        });
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn refresh_and_clear() {
        let c = KeyedCollection::new();
        c.upsert(1, "a".to_string());
        c.upsert(2, "b".to_string());
        let (_sub, log) = record(&c);
        assert!(c.refresh(&1));
        assert!(!c.refresh(&7));
        c.clear();
        assert!(c.is_empty());
        let sets = log.lock().unwrap();
        assert_eq!(sets[1].refreshes(), 1);
        assert_eq!(sets[2].removes(), 2);
    }

    #[test]
    fn fail_is_terminal() {
        let c = KeyedCollection::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        let _sub = c.connect().subscribe(move |n| {
            if let Notification::Error(err) = n {
                e.lock().unwrap().push(err.clone());
            }
        });

        c.fail(StreamError::upstream("gone"));
        c.fail(StreamError::upstream("again"));
        c.upsert(1, "ignored".to_string());

        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(c.count(), 0);
        assert_eq!(c.subscriber_count(), 0);
        assert_eq!(c.error(), Some(StreamError::upstream("gone")));

        // Late subscribers see the error straight away.
        let late = Arc::new(Mutex::new(None));
        let l = Arc::clone(&late);
        let _late_sub = c.connect().subscribe(move |n| {
            if let Notification::Error(err) = n {
                *l.lock().unwrap() = Some(err.clone());
            }
        });
        assert_eq!(*late.lock().unwrap(), Some(StreamError::upstream("gone")));
    }

    #[test]
    fn dispose_detaches_and_freezes() {
        let c = KeyedCollection::new();
        c.upsert(1, "a".to_string());
        let (_sub, log) = record(&c);
        c.dispose();
        c.dispose();
        c.upsert(2, "b".to_string());
        assert!(c.is_disposed());
        assert_eq!(c.subscriber_count(), 0);
        assert_eq!(c.count(), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn dropping_subscription_detaches() {
        let c: KeyedCollection<u32, String> = KeyedCollection::new();
        let (sub, _log) = record(&c);
        assert_eq!(c.subscriber_count(), 1);
        drop(sub);
        assert_eq!(c.subscriber_count(), 0);
    }

    #[test]
    fn callback_may_read_observed_collection() {
        let c = KeyedCollection::new();
        let reader = c.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = c.connect().subscribe(move |_| {
            s.lock().unwrap().push(reader.count());
        });
        c.upsert(1, "a".to_string());
        c.upsert(2, "b".to_string());
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn concurrent_writers_replay_consistently() {
        let c = KeyedCollection::new();
        let (_sub, log) = record(&c);

        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let c = c.clone();
                thread::spawn(move || {
                    for i in 0..50u32 {
                        c.upsert(t * 1000 + i, format!("{t}-{i}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(c.count(), 200);
        let sets = log.lock().unwrap();
        let adds: usize = sets.iter().map(ChangeSet::adds).sum();
        assert_eq!(adds, 200);
    }

    #[test]
    fn subscribe_from_own_callback_sees_current_change_in_snapshot() {
        let c: KeyedCollection<u32, String> = KeyedCollection::new();
        let inner: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let snapshot_keys = Arc::new(Mutex::new(Vec::new()));

        let handle = c.clone();
        let subs = Arc::clone(&inner);
        let keys = Arc::clone(&snapshot_keys);
        let _outer = c.connect().subscribe(move |n| {
            if !matches!(n, Notification::Changes(_)) || !subs.lock().unwrap().is_empty() {
                return;
            }
            let k = Arc::clone(&keys);
            let sub = handle.connect().subscribe(move |n| {
                if let Notification::Changes(set) = n {
                    k.lock().unwrap().extend(set.iter().map(|ch| ch.key));
                }
            });
            subs.lock().unwrap().push(sub);
        });

        c.upsert(7, "seven".into());
        assert_eq!(snapshot_keys.lock().unwrap().as_slice(), &[7]);
        c.upsert(8, "eight".into());
        assert_eq!(snapshot_keys.lock().unwrap().as_slice(), &[7, 8]);
    }

    #[test]
    fn debug_format() {
        let c = KeyedCollection::new();
        c.upsert(1u32, 1u32);
        let dbg = format!("{c:?}");
        assert!(dbg.contains("KeyedCollection"));
        assert!(dbg.contains("count: 1"));
    }
}
