#![forbid(unsafe_code)]

//! Core: change sets, keyed reactive collections, and change streams.
//!
//! - [`KeyedCollection`]: a thread-safe keyed collection publishing every
//!   mutation as a [`ChangeSet`].
//! - [`ChangeStream`]: a cold, subscribable stream of change sets.
//! - [`Subscription`]: RAII guard that detaches on drop.
//! - [`StreamError`]: terminal failure carried on a stream.
//!
//! # Example
//!
//! ```
//! use arbor_core::{KeyedCollection, Notification};
//! use std::sync::{Arc, Mutex};
//!
//! let users = KeyedCollection::new();
//! users.upsert(1u32, "ada".to_string());
//!
//! let seen = Arc::new(Mutex::new(0usize));
//! let s = Arc::clone(&seen);
//! let _sub = users.connect().subscribe(move |n| {
//!     if let Notification::Changes(set) = n {
//!         *s.lock().unwrap() += set.len();
//!     }
//! });
//!
//! users.upsert(2, "grace".to_string());
//! assert_eq!(*seen.lock().unwrap(), 2);
//! ```

pub mod change;
pub mod collection;
pub mod error;
pub mod stream;
pub mod subscription;
pub mod sync;

pub use change::{Change, ChangeReason, ChangeSet, CollectionKey, CollectionValue};
pub use collection::{KeyedCollection, Updater};
pub use error::StreamError;
pub use stream::{ChangeStream, Notification, Sink};
pub use subscription::Subscription;
