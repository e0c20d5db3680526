#![forbid(unsafe_code)]

//! The flatten engine.
//!
//! # Design
//!
//! A [`FlattenEngine`] subscribes to a root [`ChangeStream`] and, for every
//! node that stream produces, to that node's own child stream, recursively.
//! The union of all live nodes is mirrored into one output
//! [`KeyedCollection`], so consumers observe an arbitrarily deep tree as a
//! flat keyed set.
//!
//! Every delivery, whatever its depth or thread, goes through the engine's
//! [`Gate`](crate::gate). The thread that drains the gate applies messages to
//! the node arena in rounds:
//!
//! ```text
//!   lock state ─► pop messages ─► update arena, collect ops + connects
//!       ▲                                          │
//!       │                      unlock, subscribe to new child streams
//!       │                       (their snapshots re-enter the queue)
//!       └────────── while connects were made ──────┘
//!                              │
//!                   publish ops as ONE change set
//! ```
//!
//! # Invariants
//!
//! 1. The output's key set equals the set of keys reachable from the root
//!    through live child streams.
//! 2. Each drain round publishes at most one output change set, so a node
//!    added together with its pre-existing descendants appears atomically.
//! 3. Removing a node removes its whole subtree from the output and drops
//!    every subscription underneath it.
//! 4. Deliveries from a node that has been torn down (or re-subscribed) are
//!    discarded and counted as stale.
//! 5. After `dispose` or a terminal failure no subscription is left alive.
//! 6. Handle queries (`get`, `contains_key`, `parent_of`, `depth_of`, `keys`,
//!    `count`) read only what has been published, so they never show a round
//!    half applied. After a failure they keep answering from the last
//!    published view; [`FlattenStats`] reports the released nodes.
//!
//! # Failure Modes
//!
//! - **Selector or child stream error**: the engine tears down every node,
//!   discards the round in progress, and fails its output with the error.
//! - **Duplicate key across branches**: terminal `DuplicateKey` error under
//!   [`DuplicateKeyPolicy::Fail`]; replacement under `Replace`.
//! - **Selectors calling back into the engine**: `children_of` and `key_of`
//!   run while the engine state is locked; calling `stats`, `error` or
//!   `is_disposed` from them deadlocks.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use ahash::AHashMap;
use arbor_core::sync::lock;
use arbor_core::{
    Change, ChangeReason, ChangeStream, CollectionKey, CollectionValue, KeyedCollection,
    Notification, Sink, StreamError, Subscription, Updater,
};
use tracing::{debug, debug_span, error, field, trace};

use crate::arena::{NodeArena, NodeId, Placement};
use crate::config::{DuplicateKeyPolicy, FlattenConfig, UpdatePolicy};
use crate::gate::{Enqueue, Gate, Msg, Origin};

/// Maps a node's value to the stream of its direct children.
pub type ChildSelector<K, V> =
    dyn Fn(&V) -> Result<ChangeStream<K, V>, StreamError> + Send + Sync;

/// Maps a value to its key.
pub type KeySelector<K, V> = dyn Fn(&V) -> K + Send + Sync;

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlattenStats {
    /// Nodes currently in the flattened view.
    pub live_nodes: usize,
    /// Open subscriptions: child streams plus the root stream.
    pub live_subscriptions: usize,
    /// Messages taken off the gate.
    pub events: u64,
    /// Deliveries dropped because their node was already gone.
    pub stale_events: u64,
    /// Drain rounds run. Each publishes at most one change set.
    pub rounds: u64,
}

// ── Internal state ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    Faulted,
    Disposed,
}

/// Where a published node sits in the tree.
#[derive(Debug, Clone)]
struct Link<K> {
    parent: Option<K>,
    depth: usize,
}

enum Op<K, V> {
    Upsert(K, V, Link<K>),
    Remove(K),
    Refresh(K),
}

impl<K: CollectionKey, V: CollectionValue> Op<K, V> {
    fn apply(self, updater: &mut Updater<'_, K, V>, links: &mut AHashMap<K, Link<K>>) {
        match self {
            Self::Upsert(key, value, link) => {
                links.insert(key.clone(), link);
                updater.upsert(key, value);
            }
            Self::Remove(key) => {
                links.remove(&key);
                updater.remove(&key);
            }
            Self::Refresh(key) => {
                updater.refresh(&key);
            }
        }
    }
}

/// A child stream resolved under the state lock, subscribed after it.
struct Connect<K, V> {
    key: K,
    id: NodeId,
    stream: ChangeStream<K, V>,
}

struct Round<K, V> {
    ops: Vec<Op<K, V>>,
    connects: Vec<Connect<K, V>>,
    failure: Option<StreamError>,
    disposed: bool,
}

impl<K, V> Round<K, V> {
    fn new() -> Self {
        Self {
            ops: Vec::new(),
            connects: Vec::new(),
            failure: None,
            disposed: false,
        }
    }
}

struct EngineState<K, V> {
    arena: NodeArena<K, V>,
    root: Option<Subscription>,
    lifecycle: Lifecycle,
    error: Option<StreamError>,
    events: u64,
    stale_events: u64,
    rounds: u64,
}

struct EngineCore<K, V> {
    gate: Gate<K, V>,
    state: Mutex<EngineState<K, V>>,
    output: KeyedCollection<K, V>,
    /// Parent links of the published view. Written only inside the output edit.
    links: Mutex<AHashMap<K, Link<K>>>,
    children_of: Arc<ChildSelector<K, V>>,
    key_of: Arc<KeySelector<K, V>>,
    config: FlattenConfig,
}

impl<K: CollectionKey, V: CollectionValue> EngineCore<K, V> {
    /// Sink tagging every delivery with `origin`.
    ///
    /// Holds the engine weakly: a stream outliving the engine delivers into
    /// nothing.
    fn sink(self: &Arc<Self>, origin: Origin) -> Sink<K, V> {
        let core: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |notification: Notification<'_, K, V>| {
            let Some(core) = core.upgrade() else {
                return;
            };
            let msg = match notification {
                Notification::Changes(changes) => Msg::Changes {
                    origin,
                    changes: changes.clone(),
                },
                Notification::Error(err) => Msg::Failed(err.clone()),
            };
            core.dispatch(msg);
        })
    }

    fn dispatch(self: &Arc<Self>, msg: Msg<K, V>) {
        if self.gate.enqueue(msg) == Enqueue::Drain {
            self.drain();
        }
    }

    /// Apply queued messages until the gate is empty. Caller owns the drainer
    /// slot.
    fn drain(self: &Arc<Self>) {
        let span = debug_span!(
            "flatten.drain",
            label = self.config.label.as_deref().unwrap_or(""),
            events = field::Empty,
            changes = field::Empty,
        );
        let _guard = span.enter();

        let mut events = 0u64;
        let mut changes = 0u64;
        loop {
            let round = self.collect_round(&mut events);
            changes += round.ops.len() as u64;
            self.publish(round);
            if self.gate.try_release() {
                break;
            }
        }
        span.record("events", events);
        span.record("changes", changes);
    }

    fn collect_round(self: &Arc<Self>, events: &mut u64) -> Round<K, V> {
        let mut round = Round::new();
        lock(&self.state).rounds += 1;
        loop {
            {
                let mut state = lock(&self.state);
                while let Some(msg) = self.gate.pop() {
                    *events += 1;
                    state.events += 1;
                    if let Err(err) = self.apply(&mut state, msg, &mut round) {
                        self.fault(&mut state, &err);
                        round.connects.clear();
                        round.failure = Some(err);
                    }
                }
            }
            if round.connects.is_empty() {
                return round;
            }

            // Snapshots replayed here only enqueue; the next pass applies them.
            let connected: Vec<_> = round
                .connects
                .drain(..)
                .map(|connect| {
                    let subscription = connect
                        .stream
                        .subscribe_sink(self.sink(Origin::Node(connect.id)));
                    (connect.key, connect.id, subscription)
                })
                .collect();
            let mut state = lock(&self.state);
            for (key, id, subscription) in connected {
                state.arena.set_subscription(&key, id, subscription);
            }
        }
    }

    fn publish(&self, round: Round<K, V>) {
        let Round {
            ops,
            failure,
            disposed,
            ..
        } = round;
        if let Some(err) = failure {
            self.output.fail(err);
            return;
        }
        if !ops.is_empty() {
            self.output.edit(|updater| {
                let mut links = lock(&self.links);
                for op in ops {
                    op.apply(updater, &mut links);
                }
            });
        }
        if disposed {
            self.output.dispose();
        }
    }

    // ── Message handling ─────────────────────────────────────────────

    fn apply(
        &self,
        state: &mut EngineState<K, V>,
        msg: Msg<K, V>,
        round: &mut Round<K, V>,
    ) -> Result<(), StreamError> {
        match msg {
            Msg::Changes { origin, changes } => {
                for change in changes {
                    let Some(parent) = resolve(state, origin) else {
                        state.stale_events += 1;
                        trace!(?origin, "dropping delivery from detached node");
                        break;
                    };
                    self.apply_change(state, origin, parent, change, round)?;
                }
                Ok(())
            }
            Msg::Failed(err) => Err(err),
            Msg::Dispose => {
                self.shutdown(state, round);
                round.connects.clear();
                Ok(())
            }
        }
    }

    fn apply_change(
        &self,
        state: &mut EngineState<K, V>,
        origin: Origin,
        parent: Option<K>,
        change: Change<K, V>,
        round: &mut Round<K, V>,
    ) -> Result<(), StreamError> {
        let Change {
            reason, current, ..
        } = change;
        let key = (self.key_of)(&current);
        let placement = state.arena.placement(&key, parent.as_ref());
        match reason {
            ChangeReason::Add | ChangeReason::Update => match placement {
                Placement::Absent => self.attach(state, key, current, parent, round),
                Placement::Here => self.update(state, key, current, round),
                Placement::Elsewhere => self.collide(state, origin, key, current, round),
            },
            ChangeReason::Remove => {
                if placement == Placement::Here {
                    detach(state, &key, &mut round.ops);
                }
                Ok(())
            }
            ChangeReason::Refresh => {
                if placement == Placement::Here {
                    round.ops.push(Op::Refresh(key));
                }
                Ok(())
            }
        }
    }

    fn attach(
        &self,
        state: &mut EngineState<K, V>,
        key: K,
        value: V,
        parent: Option<K>,
        round: &mut Round<K, V>,
    ) -> Result<(), StreamError> {
        let id = state.arena.insert(key.clone(), value.clone(), parent);
        let link = link_of(state, &key);
        trace!(key = ?key, depth = link.depth, "node attached");
        round.ops.push(Op::Upsert(key.clone(), value.clone(), link));
        self.plan_connect(key, id, &value, round)
    }

    fn update(
        &self,
        state: &mut EngineState<K, V>,
        key: K,
        value: V,
        round: &mut Round<K, V>,
    ) -> Result<(), StreamError> {
        match self.config.update_policy {
            UpdatePolicy::RetainChildren => {
                state.arena.set_value(&key, value.clone());
                let link = link_of(state, &key);
                round.ops.push(Op::Upsert(key, value, link));
                Ok(())
            }
            UpdatePolicy::Resubscribe => {
                let removed = state.arena.remove_children(&key);
                round.ops.extend(removed.into_iter().map(Op::Remove));
                let Some(id) = state.arena.renew(&key, value.clone()) else {
                    return Ok(());
                };
                trace!(key = ?key, "node resubscribed");
                let link = link_of(state, &key);
                round.ops.push(Op::Upsert(key.clone(), value.clone(), link));
                self.plan_connect(key, id, &value, round)
            }
        }
    }

    fn collide(
        &self,
        state: &mut EngineState<K, V>,
        origin: Origin,
        key: K,
        value: V,
        round: &mut Round<K, V>,
    ) -> Result<(), StreamError> {
        match self.config.duplicate_keys {
            DuplicateKeyPolicy::Fail => {
                error!(key = ?key, "key reached from two branches");
                Err(StreamError::duplicate_key(&key))
            }
            DuplicateKeyPolicy::Replace => {
                detach(state, &key, &mut round.ops);
                // The replaced subtree may have contained the origin itself.
                match resolve(state, origin) {
                    Some(parent) => self.attach(state, key, value, parent, round),
                    None => Ok(()),
                }
            }
        }
    }

    fn plan_connect(
        &self,
        key: K,
        id: NodeId,
        value: &V,
        round: &mut Round<K, V>,
    ) -> Result<(), StreamError> {
        let stream = (self.children_of)(value).inspect_err(|err| {
            error!(key = ?key, %err, "child selector failed");
        })?;
        round.connects.push(Connect { key, id, stream });
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────────

    fn shutdown(&self, state: &mut EngineState<K, V>, round: &mut Round<K, V>) {
        state.lifecycle = Lifecycle::Disposed;
        state.root = None;
        let removed = state.arena.clear();
        debug!(removed = removed.len(), "flatten engine disposed");
        round.ops.extend(removed.into_iter().map(Op::Remove));
        round.disposed = true;
        self.gate.close();
    }

    fn fault(&self, state: &mut EngineState<K, V>, err: &StreamError) {
        error!(%err, live_nodes = state.arena.len(), "flatten engine failed");
        state.lifecycle = Lifecycle::Faulted;
        state.error = Some(err.clone());
        state.root = None;
        state.arena.clear();
        self.gate.close();
    }
}

/// Parent key for deliveries from `origin`, or `None` if `origin` is stale.
fn resolve<K: CollectionKey, V: CollectionValue>(
    state: &EngineState<K, V>,
    origin: Origin,
) -> Option<Option<K>> {
    match origin {
        Origin::Root => Some(None),
        Origin::Node(id) => state.arena.owner(id).cloned().map(Some),
    }
}

fn link_of<K: CollectionKey, V: CollectionValue>(state: &EngineState<K, V>, key: &K) -> Link<K> {
    Link {
        parent: state.arena.parent_of(key).flatten().cloned(),
        depth: state.arena.depth_of(key).unwrap_or_default(),
    }
}

fn detach<K: CollectionKey, V: CollectionValue>(
    state: &mut EngineState<K, V>,
    key: &K,
    ops: &mut Vec<Op<K, V>>,
) {
    let removed = state.arena.remove(key);
    trace!(key = ?key, removed = removed.len(), "subtree detached");
    ops.extend(removed.into_iter().map(Op::Remove));
}

// ── Public handle ────────────────────────────────────────────────────

/// A running flatten over one root stream.
///
/// Queries answer from the published view: the state as of the last change
/// set emitted on [`connect`](Self::connect). Dropping the handle disposes the
/// engine.
pub struct FlattenEngine<K: CollectionKey, V: CollectionValue> {
    core: Arc<EngineCore<K, V>>,
}

impl<K: CollectionKey, V: CollectionValue> FlattenEngine<K, V> {
    /// Subscribe to `source` and start flattening.
    ///
    /// Nodes already present in `source` and their existing descendants are
    /// materialized before this returns.
    pub fn start<C, F>(
        source: ChangeStream<K, V>,
        children_of: C,
        key_of: F,
        config: FlattenConfig,
    ) -> Self
    where
        C: Fn(&V) -> Result<ChangeStream<K, V>, StreamError> + Send + Sync + 'static,
        F: Fn(&V) -> K + Send + Sync + 'static,
    {
        Self::start_shared(source, Arc::new(children_of), Arc::new(key_of), config)
    }

    pub(crate) fn start_shared(
        source: ChangeStream<K, V>,
        children_of: Arc<ChildSelector<K, V>>,
        key_of: Arc<KeySelector<K, V>>,
        config: FlattenConfig,
    ) -> Self {
        let core = Arc::new(EngineCore {
            gate: Gate::new(),
            state: Mutex::new(EngineState {
                arena: NodeArena::new(),
                root: None,
                lifecycle: Lifecycle::Running,
                error: None,
                events: 0,
                stale_events: 0,
                rounds: 0,
            }),
            output: KeyedCollection::new(),
            links: Mutex::new(AHashMap::new()),
            children_of,
            key_of,
            config,
        });
        let root = source.subscribe_sink(core.sink(Origin::Root));
        let rejected = {
            let mut state = lock(&core.state);
            if state.lifecycle == Lifecycle::Running {
                state.root = Some(root);
                None
            } else {
                Some(root)
            }
        };
        drop(rejected);
        Self { core }
    }

    /// Stream of the flattened view, starting with a snapshot.
    #[must_use]
    pub fn connect(&self) -> ChangeStream<K, V> {
        self.core.output.connect()
    }

    /// Number of nodes in the flattened view.
    #[must_use]
    pub fn count(&self) -> usize {
        self.core.output.count()
    }

    /// Value of a node in the published view.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.core.output.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.core.output.contains_key(key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.core.output.keys()
    }

    #[must_use]
    pub fn items(&self) -> Vec<V> {
        self.core.output.items()
    }

    /// Key of the node whose child stream produced `key`.
    ///
    /// `None` for root-level nodes and for unknown keys.
    #[must_use]
    pub fn parent_of(&self, key: &K) -> Option<K> {
        lock(&self.core.links)
            .get(key)
            .and_then(|link| link.parent.clone())
    }

    /// Distance from the root stream: `0` for nodes the root produced.
    #[must_use]
    pub fn depth_of(&self, key: &K) -> Option<usize> {
        lock(&self.core.links).get(key).map(|link| link.depth)
    }

    #[must_use]
    pub fn stats(&self) -> FlattenStats {
        let state = lock(&self.core.state);
        let root = usize::from(state.root.as_ref().is_some_and(Subscription::is_active));
        FlattenStats {
            live_nodes: state.arena.len(),
            live_subscriptions: state.arena.live_subscriptions() + root,
            events: state.events,
            stale_events: state.stale_events,
            rounds: state.rounds,
        }
    }

    /// The terminal error, if the engine failed.
    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        lock(&self.core.state).error.clone()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        lock(&self.core.state).lifecycle == Lifecycle::Disposed
    }

    /// Tear down every node, emit their removal, and close the output.
    ///
    /// Safe to call repeatedly and from inside the engine's own callbacks:
    /// there the teardown is queued and runs before the current drain ends.
    /// From any other thread it waits for a running drain to finish it.
    pub fn dispose(&self) {
        match self.core.gate.enqueue(Msg::Dispose) {
            Enqueue::Drain => self.core.drain(),
            Enqueue::Deferred | Enqueue::Closed => {
                if !self.core.gate.drains_here() {
                    self.core.gate.wait_idle();
                }
            }
        }
    }
}

impl<K: CollectionKey, V: CollectionValue> Drop for FlattenEngine<K, V> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<K: CollectionKey, V: CollectionValue> fmt::Debug for FlattenEngine<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlattenEngine")
            .field("label", &self.core.config.label)
            .field("stats", &self.stats())
            .field("error", &self.error())
            .finish()
    }
}

// ---- Tests ----
