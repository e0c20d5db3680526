#![forbid(unsafe_code)]

//! Engine configuration.

/// What an `Update` of a live node does to its subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePolicy {
    /// Replace the payload and keep the existing child subscription.
    ///
    /// The new value's child stream is never consulted.
    #[default]
    RetainChildren,
    /// Tear down the node's subtree and child subscription, then rebuild both
    /// from the child stream of the new value.
    Resubscribe,
}

/// What happens when a key arrives that is already live under another parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateKeyPolicy {
    /// Fail the engine with `StreamError::DuplicateKey`.
    #[default]
    Fail,
    /// Tear down the existing node and its subtree, then attach the new one.
    Replace,
}

/// Configuration for a flatten engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlattenConfig {
    /// Behavior of `Update` on a live node.
    pub update_policy: UpdatePolicy,
    /// Behavior on a cross-branch key collision.
    pub duplicate_keys: DuplicateKeyPolicy,
    /// Name recorded on tracing spans.
    pub label: Option<String>,
}

impl FlattenConfig {
    /// Set the update policy.
    #[must_use]
    pub fn with_update_policy(mut self, policy: UpdatePolicy) -> Self {
        self.update_policy = policy;
        self
    }

    /// Set the duplicate-key policy.
    #[must_use]
    pub fn with_duplicate_keys(mut self, policy: DuplicateKeyPolicy) -> Self {
        self.duplicate_keys = policy;
        self
    }

    /// Set the tracing label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
