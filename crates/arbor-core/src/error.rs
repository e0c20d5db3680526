#![forbid(unsafe_code)]

use std::fmt::Debug;

use thiserror::Error;

/// Terminal failure carried on a change stream.
///
/// Errors are broadcast to every subscriber, so they are cheap to clone and
/// render keys with `Debug` instead of carrying the key type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The child selector could not produce a stream for a node.
    #[error("child selector failed for key {key}: {message}")]
    ChildSelector { key: String, message: String },

    /// A source or child stream failed.
    #[error("upstream failed: {message}")]
    Upstream { message: String },

    /// Two live nodes in different branches resolved to the same key.
    #[error("duplicate key {key} reached from two branches")]
    DuplicateKey { key: String },
}

impl StreamError {
    #[must_use]
    pub fn child_selector(key: &impl Debug, message: impl Into<String>) -> Self {
        Self::ChildSelector {
            key: format!("{key:?}"),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn duplicate_key(key: &impl Debug) -> Self {
        Self::DuplicateKey {
            key: format!("{key:?}"),
        }
    }
}
