#![forbid(unsafe_code)]

//! Arbor public facade crate.
//!
//! Re-exports the keyed collection layer and, with the default `flatten`
//! feature, the hierarchical flattening operator.

pub use arbor_core as core;
#[cfg(feature = "flatten")]
pub use arbor_flatten as flatten;

pub mod prelude {
    pub use arbor_core::{
        Change, ChangeReason, ChangeSet, ChangeStream, KeyedCollection, Notification, StreamError,
        Subscription,
    };

    #[cfg(feature = "flatten")]
    pub use arbor_flatten::{
        DuplicateKeyPolicy, FlattenConfig, FlattenEngine, FlattenExt, UpdatePolicy,
    };
}
