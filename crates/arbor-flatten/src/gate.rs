#![forbid(unsafe_code)]

//! Per-engine serialization gate.
//!
//! Every change set bound for one engine, from the root source or from any
//! node's child stream, is pushed onto a single queue. The first producer to
//! find the gate idle becomes the *drainer* and applies queued messages until
//! the queue is empty; producers arriving meanwhile only enqueue and return.
//!
//! # Invariants
//!
//! 1. At most one thread drains at a time.
//! 2. The drainer slot is released only while holding the queue lock with the
//!    queue empty, so no message is ever stranded.
//! 3. A producer never blocks on another producer's work, and a drainer never
//!    re-acquires the gate from inside its own callbacks.
//! 4. Once closed, the gate drops every queued and future message.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use arbor_core::sync::lock;
use arbor_core::{ChangeSet, StreamError};

use crate::arena::NodeId;

/// Where a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// The root source stream.
    Root,
    /// The child stream of the node with this id.
    Node(NodeId),
}

pub(crate) enum Msg<K, V> {
    Changes {
        origin: Origin,
        changes: ChangeSet<K, V>,
    },
    Failed(StreamError),
    Dispose,
}

/// Outcome of [`Gate::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    /// The caller now owns the drainer slot and must drain.
    Drain,
    /// Another drain is running and will apply the message.
    Deferred,
    /// The gate is closed; the message was dropped.
    Closed,
}

struct GateState<K, V> {
    queue: VecDeque<Msg<K, V>>,
    drainer: Option<ThreadId>,
    closed: bool,
}

pub(crate) struct Gate<K, V> {
    state: Mutex<GateState<K, V>>,
    idle: Condvar,
}

impl<K, V> Gate<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                queue: VecDeque::new(),
                drainer: None,
                closed: false,
            }),
            idle: Condvar::new(),
        }
    }

    pub(crate) fn enqueue(&self, msg: Msg<K, V>) -> Enqueue {
        let mut state = lock(&self.state);
        if state.closed {
            return Enqueue::Closed;
        }
        state.queue.push_back(msg);
        if state.drainer.is_some() {
            return Enqueue::Deferred;
        }
        state.drainer = Some(thread::current().id());
        Enqueue::Drain
    }

    /// Whether the calling thread is the current drainer.
    pub(crate) fn drains_here(&self) -> bool {
        lock(&self.state).drainer == Some(thread::current().id())
    }

    pub(crate) fn pop(&self) -> Option<Msg<K, V>> {
        lock(&self.state).queue.pop_front()
    }

    /// Release the drainer slot if the queue is empty.
    ///
    /// Returns `false` when more work arrived and the caller must keep
    /// draining.
    pub(crate) fn try_release(&self) -> bool {
        let mut state = lock(&self.state);
        if !state.queue.is_empty() {
            return false;
        }
        state.drainer = None;
        self.idle.notify_all();
        true
    }

    /// Drop everything queued and refuse further messages.
    pub(crate) fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.queue.clear();
    }

    /// Block until no drain is running.
    pub(crate) fn wait_idle(&self) {
        let mut state = lock(&self.state);
        while state.drainer.is_some() {
            state = self
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn changes(origin: Origin) -> Msg<u32, u32> {
        Msg::Changes {
            origin,
            changes: ChangeSet::new(),
        }
    }

    #[test]
    fn first_producer_drains_later_ones_defer() {
        let gate = Gate::<u32, u32>::new();
        assert_eq!(gate.enqueue(changes(Origin::Root)), Enqueue::Drain);
        assert_eq!(gate.enqueue(changes(Origin::Node(1))), Enqueue::Deferred);
        assert!(gate.drains_here());
        assert!(gate.pop().is_some());
        assert!(!gate.try_release(), "one message still queued");
        assert!(gate.pop().is_some());
        assert!(gate.try_release());
        assert_eq!(gate.enqueue(changes(Origin::Root)), Enqueue::Drain);
    }

    #[test]
    fn other_thread_is_not_reentrant() {
        let gate = Arc::new(Gate::<u32, u32>::new());
        assert_eq!(gate.enqueue(changes(Origin::Root)), Enqueue::Drain);
        let g = Arc::clone(&gate);
        let (outcome, here) = std::thread::spawn(move || (g.enqueue(Msg::Dispose), g.drains_here()))
            .join()
            .unwrap();
        assert_eq!(outcome, Enqueue::Deferred);
        assert!(!here);
    }

    #[test]
    fn closed_gate_drops_messages() {
        let gate = Gate::<u32, u32>::new();
        assert_eq!(gate.enqueue(changes(Origin::Root)), Enqueue::Drain);
        gate.close();
        assert!(gate.pop().is_none());
        assert_eq!(gate.enqueue(Msg::Dispose), Enqueue::Closed);
        assert!(lock(&gate.state).closed);
        assert!(gate.try_release());
    }

    #[test]
    fn wait_idle_returns_after_release() {
        let gate = Arc::new(Gate::<u32, u32>::new());
        assert_eq!(gate.enqueue(changes(Origin::Root)), Enqueue::Drain);
        let released = Arc::new(AtomicBool::new(false));

        let g = Arc::clone(&gate);
        let r = Arc::clone(&released);
        let waiter = std::thread::spawn(move || {
            g.wait_idle();
            r.load(Ordering::SeqCst)
        });

        std::thread::sleep(Duration::from_millis(20));
        gate.pop();
        released.store(true, Ordering::SeqCst);
        assert!(gate.try_release());
        assert!(waiter.join().unwrap(), "waiter woke before release");
    }
}
