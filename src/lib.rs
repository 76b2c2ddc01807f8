#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

extern crate alloc;

/// A segment-backed elastic array of optional elements.
///
/// This module provides `CapacityStore`, which grows and shrinks atomically,
/// compacts occupied cells, and sorts and searches its contents under a
/// caller-chosen ordering.
pub mod capacity_store;

mod error;

/// A key/value index built on two capacity stores.
///
/// This module provides `HashIndex`, an open-addressing table whose probe
/// sequences are salted per table instance and repaired on delete.
pub mod hash_index;

pub mod keystream;

mod sortable;

pub use capacity_store::CapacityStore;
pub use capacity_store::SEGMAX;
pub use capacity_store::WALK_LIMIT;
pub use error::Component;
pub use error::Error;
pub use error::ErrorKind;
pub use error::Result;
pub use hash_index::DefaultHashBuilder;
pub use hash_index::HashIndex;
pub use hash_index::INITIAL_CAPACITY;
pub use hash_index::MAX_OVERFLOW_RESIZES;
pub use keystream::KEYSTREAM_ROUNDS;
pub use sortable::Direction;
pub use sortable::Metric;
pub use sortable::Mode;
pub use sortable::Ordering;
pub use sortable::SearchMode;
pub use sortable::Sortable;
