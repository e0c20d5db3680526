#![forbid(unsafe_code)]

//! RAII subscription guards.

use std::fmt;

/// Guard returned by every `subscribe` call.
///
/// Dropping the guard (or calling [`unsubscribe`](Self::unsubscribe)) runs its
/// detach action exactly once. Detaching never waits for a notification that
/// is already running on another thread.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// A guard that runs `detach` when dropped.
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// A guard with nothing to detach.
    pub fn empty() -> Self {
        Self { detach: None }
    }

    /// Detach now. Later calls and the eventual drop are no-ops.
    pub fn unsubscribe(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }

    /// Whether the detach action has not run yet.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.detach.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
