use alloc::collections::TryReserveError;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Numeric failure kind, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorKind {
    /// An allocation for store cells failed.
    OutOfCapacityMemory = 1,
    /// A logical index fell outside the store.
    IndexOutOfRange = 2,
    /// The store's backing segments were released.
    NullBackingStore = 3,
    /// A stored element could not be ordered.
    NotSortable = 4,
    /// A search target could not be ordered.
    UnsortableTarget = 5,
    /// A search was attempted on an unsorted store.
    NotSorted = 6,
    /// A key could not be placed within its probe budget.
    ProbeOverflow = 7,
}

/// The component a failure originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Component {
    /// [`CapacityStore`](crate::CapacityStore).
    CapacityStore = 1,
    /// [`HashIndex`](crate::HashIndex).
    HashIndex = 2,
}

impl core::fmt::Display for Component {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Component::CapacityStore => f.write_str("capacity store"),
            Component::HashIndex => f.write_str("hash index"),
        }
    }
}

/// Errors raised by [`CapacityStore`](crate::CapacityStore) and
/// [`HashIndex`](crate::HashIndex).
///
/// A failed operation never leaves a partially-applied mutation behind.
#[derive(Debug, Error)]
pub enum Error {
    /// Allocating `requested` cells failed. `current` is the capacity the
    /// store still holds.
    #[error(
        "{component}: out of memory allocating {requested} cells (~{bytes} bytes); capacity remains {current}"
    )]
    OutOfCapacityMemory {
        /// Cells the failed allocation asked for.
        requested: u64,
        /// Approximate byte size of the failed allocation.
        bytes: u64,
        /// Capacity held by the store after the rollback.
        current: u64,
        /// Structure whose operation needed the allocation.
        component: Component,
        /// Allocator failure.
        #[source]
        source: TryReserveError,
    },

    /// `index` does not address a cell of a store with `capacity` cells.
    #[error("index {index} out of range for capacity {capacity}")]
    IndexOutOfRange {
        /// Requested logical index.
        index: u64,
        /// Capacity at the time of the call.
        capacity: u64,
    },

    /// The store was released and has no backing segments.
    #[error("backing store is not initialized")]
    NullBackingStore,

    /// The element at `index` does not satisfy [`Sortable`](crate::Sortable)
    /// for the requested ordering.
    #[error("element at index {index} is not sortable under the requested ordering")]
    NotSortable {
        /// Logical index of the offending cell.
        index: u64,
    },

    /// The search target does not provide the requested metric.
    #[error("search target is not sortable under the requested ordering")]
    UnsortableTarget,

    /// Search requires a successful sort with no mutation since.
    #[error("store is not sorted")]
    NotSorted,

    /// A key could not be placed even after `attempts` forced resizes.
    #[error("probe sequence overflowed {attempts} times; capacity reached {capacity}")]
    ProbeOverflow {
        /// Index capacity after the last resize.
        capacity: u64,
        /// Forced resizes performed before giving up.
        attempts: u32,
    },
}

impl Error {
    /// Returns the numeric kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfCapacityMemory { .. } => ErrorKind::OutOfCapacityMemory,
            Error::IndexOutOfRange { .. } => ErrorKind::IndexOutOfRange,
            Error::NullBackingStore => ErrorKind::NullBackingStore,
            Error::NotSortable { .. } => ErrorKind::NotSortable,
            Error::UnsortableTarget => ErrorKind::UnsortableTarget,
            Error::NotSorted => ErrorKind::NotSorted,
            Error::ProbeOverflow { .. } => ErrorKind::ProbeOverflow,
        }
    }

    /// Returns the component that raised this error.
    pub fn component(&self) -> Component {
        match self {
            Error::OutOfCapacityMemory { component, .. } => *component,
            Error::ProbeOverflow { .. } => Component::HashIndex,
            _ => Component::CapacityStore,
        }
    }

    /// Attributes an allocation failure to `by`.
    pub(crate) fn raised_by(mut self, by: Component) -> Self {
        if let Error::OutOfCapacityMemory { component, .. } = &mut self {
            *component = by;
        }
        self
    }

    /// Combined component/kind code: `component << 16 | kind`.
    pub fn code(&self) -> u32 {
        ((self.component() as u32) << 16) | self.kind() as u32
    }
}
