use alloc::collections::TryReserveError;
use alloc::vec::Vec;
use core::cmp::Ordering as CmpOrdering;
use core::fmt::Debug;

use parking_lot::RwLock;
use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::error::Component;
use crate::error::Error;
use crate::error::Result;
use crate::sortable::Direction;
use crate::sortable::Key;
use crate::sortable::Mode;
use crate::sortable::Ordering;
use crate::sortable::SearchMode;
use crate::sortable::Sortable;

/// Maximum number of cells held by one segment.
pub const SEGMAX: u64 = (1 << 31) - 1;

/// Maximum number of steps a floor/ceiling search walks away from its
/// landing position.
pub const WALK_LIMIT: u64 = 3;

const CAPACITY_MASK: u64 = i64::MAX as u64;

/// Number of segments and the length of the last one for `capacity` cells.
#[inline(always)]
fn layout(capacity: u64, segment_cells: u64) -> (u64, u64) {
    if capacity == 0 {
        return (0, 0);
    }
    let count = capacity.div_ceil(segment_cells);
    let last = capacity - (count - 1) * segment_cells;
    (count, last)
}

#[inline(always)]
fn cell_bytes<T>(cells: u64) -> u64 {
    cells.saturating_mul(core::mem::size_of::<Option<T>>() as u64)
}

/// The segment array and capacity, guarded together by the data lock.
struct Backing<T, const SEGMENT_CELLS: u64> {
    /// `None` once released.
    segments: Option<Vec<Vec<Option<T>>>>,
    capacity: u64,
}

impl<T, const SEGMENT_CELLS: u64> Backing<T, SEGMENT_CELLS> {
    fn allocate(capacity: u64, current: u64) -> Result<Self> {
        let (count, last) = layout(capacity, SEGMENT_CELLS);
        let oom = |source| {
            error!(
                requested = capacity,
                bytes = cell_bytes::<T>(capacity),
                current,
                "capacity store allocation failed"
            );
            Error::OutOfCapacityMemory {
                requested: capacity,
                bytes: cell_bytes::<T>(capacity),
                current,
                component: Component::CapacityStore,
                source,
            }
        };

        let count_usize = usize::try_from(count).unwrap_or(usize::MAX);
        let mut segments = Vec::new();
        segments.try_reserve_exact(count_usize).map_err(oom)?;
        for s in 0..count {
            let len = (if s + 1 == count { last } else { SEGMENT_CELLS }) as usize;
            let mut segment = Vec::new();
            segment.try_reserve_exact(len).map_err(oom)?;
            segment.resize_with(len, || None);
            segments.push(segment);
        }

        Ok(Self {
            segments: Some(segments),
            capacity,
        })
    }

    fn segments(&self) -> Result<&Vec<Vec<Option<T>>>> {
        self.segments.as_ref().ok_or(Error::NullBackingStore)
    }

    /// Maps a logical index to `(segment, offset)`.
    #[inline]
    fn locate(&self, index: u64) -> Result<(usize, usize)> {
        let segments = self.segments()?;
        let out_of_range = Error::IndexOutOfRange {
            index,
            capacity: self.capacity,
        };
        if index >= self.capacity {
            return Err(out_of_range);
        }

        let segment = usize::try_from(index / SEGMENT_CELLS).unwrap_or(usize::MAX);
        let offset = (index % SEGMENT_CELLS) as usize;
        match segments.get(segment) {
            Some(cells) if offset < cells.len() => Ok((segment, offset)),
            _ => Err(out_of_range),
        }
    }

    #[inline]
    fn cell(&self, index: u64) -> Result<Option<&T>> {
        let (segment, offset) = self.locate(index)?;
        Ok(self.segments()?[segment][offset].as_ref())
    }

    #[inline]
    fn cell_mut(&mut self, index: u64) -> Result<&mut Option<T>> {
        let (segment, offset) = self.locate(index)?;
        match self.segments.as_mut() {
            Some(segments) => Ok(&mut segments[segment][offset]),
            None => Err(Error::NullBackingStore),
        }
    }

    #[inline]
    fn replace(&mut self, index: u64, element: Option<T>) -> Result<Option<T>> {
        Ok(core::mem::replace(self.cell_mut(index)?, element))
    }

    #[inline]
    fn take(&mut self, index: u64) -> Result<Option<T>> {
        Ok(self.cell_mut(index)?.take())
    }

    /// Resizes in place. Every allocation happens before the first cell is
    /// touched, so a failure leaves the layout exactly as it was.
    fn resize(&mut self, requested: u64) -> Result<()> {
        let capacity = requested & CAPACITY_MASK;
        let current = self.capacity;

        let Some(segments) = self.segments.as_mut() else {
            *self = Self::allocate(capacity, 0)?;
            return Ok(());
        };

        let (count, last) = layout(capacity, SEGMENT_CELLS);
        let target = |s: u64| (if s + 1 == count { last } else { SEGMENT_CELLS }) as usize;
        let oom = |source| {
            error!(
                requested = capacity,
                bytes = cell_bytes::<T>(capacity),
                current,
                "capacity store resize failed, layout rolled back"
            );
            Error::OutOfCapacityMemory {
                requested: capacity,
                bytes: cell_bytes::<T>(capacity),
                current,
                component: Component::CapacityStore,
                source,
            }
        };

        let kept = (segments.len() as u64).min(count);
        let mut fresh = Vec::new();
        let reserved = (|| -> core::result::Result<(), TryReserveError> {
            for s in 0..kept {
                let segment = &mut segments[s as usize];
                let len = target(s);
                if len > segment.len() {
                    segment.try_reserve_exact(len - segment.len())?;
                }
            }
            if count > kept {
                let extra = usize::try_from(count - kept).unwrap_or(usize::MAX);
                segments.try_reserve_exact(extra)?;
                fresh.try_reserve_exact(extra)?;
                for s in kept..count {
                    let mut segment: Vec<Option<T>> = Vec::new();
                    segment.try_reserve_exact(target(s))?;
                    fresh.push(segment);
                }
            }
            Ok(())
        })();

        if let Err(source) = reserved {
            for segment in segments.iter_mut() {
                segment.shrink_to_fit();
            }
            return Err(oom(source));
        }

        segments.truncate(count as usize);
        for (s, segment) in segments.iter_mut().enumerate() {
            let len = target(s as u64);
            if len < segment.len() {
                segment.truncate(len);
                segment.shrink_to_fit();
            } else {
                segment.resize_with(len, || None);
            }
        }
        for (s, mut segment) in (kept..count).zip(fresh) {
            segment.resize_with(target(s), || None);
            segments.push(segment);
        }
        self.capacity = capacity;

        debug!(from = current, to = capacity, segments = count, "resized capacity store");
        Ok(())
    }

    /// Stable compaction of occupied cells towards index 0.
    ///
    /// Returns the first empty index, or `None` if every cell is occupied.
    fn defragment(&mut self) -> Result<Option<u64>> {
        self.segments()?;
        let capacity = self.capacity;

        let mut write = 0;
        let mut read = 0;
        let mut moved = 0u64;
        while read < capacity {
            if self.cell(read)?.is_none() {
                read += 1;
                continue;
            }

            while read < capacity && self.cell(read)?.is_some() {
                if read != write {
                    let element = self.take(read)?;
                    self.replace(write, element)?;
                    moved += 1;
                }
                read += 1;
                write += 1;
            }
        }

        trace!(capacity, occupied = write, moved, "defragmented capacity store");
        Ok(if write == capacity { None } else { Some(write) })
    }

    fn trim(&mut self) -> Result<()> {
        if let Some(boundary) = self.defragment()? {
            self.resize(boundary.max(1))?;
        }
        Ok(())
    }

    fn count_occupied(&self) -> Result<u64> {
        Ok(self
            .segments()?
            .iter()
            .flat_map(|segment| segment.iter())
            .filter(|cell| cell.is_some())
            .count() as u64)
    }
}

impl<T: Clone, const SEGMENT_CELLS: u64> Backing<T, SEGMENT_CELLS> {
    /// Clones the backing store, reporting allocation failure instead of
    /// aborting.
    fn try_clone(&self) -> Result<Self> {
        let segments = self.segments()?;
        let oom = |source| Error::OutOfCapacityMemory {
            requested: self.capacity,
            bytes: cell_bytes::<T>(self.capacity),
            current: self.capacity,
            component: Component::CapacityStore,
            source,
        };

        let mut copy = Vec::new();
        copy.try_reserve_exact(segments.len()).map_err(oom)?;
        for segment in segments {
            let mut cells = Vec::new();
            cells.try_reserve_exact(segment.len()).map_err(oom)?;
            cells.extend(segment.iter().cloned());
            copy.push(cells);
        }

        Ok(Self {
            segments: Some(copy),
            capacity: self.capacity,
        })
    }
}

impl<T: Sortable + Clone, const SEGMENT_CELLS: u64> Backing<T, SEGMENT_CELLS> {
    fn key_at(&self, index: u64, mode: Mode) -> Result<Key<'_, T>> {
        self.cell(index)?
            .and_then(|element| Key::of(element, mode))
            .ok_or(Error::NotSortable { index })
    }

    /// Orders the element at `index` against `pivot` in sort direction.
    fn rank(
        &self,
        index: u64,
        pivot: &Key<'_, T>,
        mode: Mode,
        direction: Direction,
    ) -> Result<CmpOrdering> {
        let ordering = self
            .key_at(index, mode)?
            .cmp(pivot)
            .ok_or(Error::NotSortable { index })?;
        Ok(match direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        })
    }

    fn swap(&mut self, a: u64, b: u64) -> Result<()> {
        let first = self.take(a)?;
        let second = self.replace(b, first)?;
        self.replace(a, second)?;
        Ok(())
    }

    /// Hoare-partition quicksort over logical indices.
    ///
    /// Ranges are kept on an explicit stack so the recursion depth is never
    /// bounded by the thread stack.
    fn quicksort(&mut self, ordering: Ordering) -> Result<()> {
        let Ordering { direction, mode } = ordering;
        if self.capacity == 1 {
            if self.cell(0)?.is_some() {
                self.key_at(0, mode)?;
            }
            return Ok(());
        }

        let mut ranges: Vec<(i64, i64)> = Vec::new();
        if self.capacity > 1 {
            ranges.push((0, (self.capacity - 1) as i64));
        }

        while let Some((lo, hi)) = ranges.pop() {
            if lo >= hi {
                continue;
            }

            let mid = lo + (hi - lo) / 2;
            let pivot = self
                .cell(mid as u64)?
                .cloned()
                .ok_or(Error::NotSortable { index: mid as u64 })?;
            let pivot_key = Key::of(&pivot, mode).ok_or(Error::NotSortable { index: mid as u64 })?;

            let (mut i, mut j) = (lo, hi);
            while i <= j {
                while i < hi && self.rank(i as u64, &pivot_key, mode, direction)? == CmpOrdering::Less
                {
                    i += 1;
                }
                while j > lo
                    && self.rank(j as u64, &pivot_key, mode, direction)? == CmpOrdering::Greater
                {
                    j -= 1;
                }
                if i <= j {
                    if i != j {
                        self.swap(i as u64, j as u64)?;
                    }
                    i += 1;
                    j -= 1;
                }
            }

            if lo < j {
                ranges.push((lo, j));
            }
            if i < hi {
                ranges.push((i, hi));
            }
        }

        // Validate the elements no comparison touched (ranges of one).
        for index in 0..self.capacity {
            self.key_at(index, mode)?;
        }

        Ok(())
    }

    fn search(&self, target: &T, search: SearchMode, mode: Mode) -> Result<Option<u64>> {
        self.segments()?;
        let target_key = Key::of(target, mode).ok_or(Error::UnsortableTarget)?;
        let capacity = self.capacity;
        if capacity == 0 || self.cell(0)?.is_none() {
            return Ok(None);
        }

        let last = capacity - 1;
        let descending = self
            .key_at(0, mode)?
            .cmp(&self.key_at(last, mode)?)
            .ok_or(Error::NotSortable { index: 0 })?
            == CmpOrdering::Greater;
        let direction = if descending {
            Direction::Descending
        } else {
            Direction::Ascending
        };

        let (mut lo, mut hi) = (0i64, last as i64);
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            match self.rank(mid as u64, &target_key, mode, direction)? {
                CmpOrdering::Equal => return Ok(Some(mid as u64)),
                CmpOrdering::Less => lo = mid + 1,
                CmpOrdering::Greater => hi = mid - 1,
            }
        }

        // `lo` is the first position ranked after the target.
        let below = if descending { lo } else { lo - 1 };
        let above = if descending { lo - 1 } else { lo };
        let step = if descending { 1 } else { -1 };
        match search {
            SearchMode::Exact => Ok(None),
            SearchMode::Floor => self.walk(below, step, &target_key, mode, CmpOrdering::Greater),
            SearchMode::Ceiling => self.walk(above, -step, &target_key, mode, CmpOrdering::Less),
            SearchMode::Nearest => {
                let landing = lo.min(last as i64);
                let mut best: Option<(i64, f64)> = None;
                for candidate in [landing, landing - 1, landing + 1] {
                    if candidate < 0 || candidate > last as i64 {
                        continue;
                    }
                    let Some(distance) = self.key_at(candidate as u64, mode)?.distance(&target_key)
                    else {
                        // Comparator-only elements carry no distance.
                        return match self.walk(below, step, &target_key, mode, CmpOrdering::Greater)? {
                            Some(floor) => Ok(Some(floor)),
                            None => {
                                self.walk(above, -step, &target_key, mode, CmpOrdering::Less)
                            }
                        };
                    };
                    if best.is_none_or(|(_, d)| distance < d) {
                        best = Some((candidate, distance));
                    }
                }
                Ok(best.map(|(index, _)| index as u64))
            }
        }
    }

    /// Walks at most [`WALK_LIMIT`] steps from `start` until an element whose
    /// order against the target is not `reject` is found.
    fn walk(
        &self,
        start: i64,
        step: i64,
        target: &Key<'_, T>,
        mode: Mode,
        reject: CmpOrdering,
    ) -> Result<Option<u64>> {
        let mut index = start;
        for _ in 0..=WALK_LIMIT {
            if index < 0 || index >= self.capacity as i64 {
                return Ok(None);
            }
            let ordering = self
                .key_at(index as u64, mode)?
                .cmp(target)
                .ok_or(Error::NotSortable {
                    index: index as u64,
                })?;
            if ordering != reject {
                return Ok(Some(index as u64));
            }
            index += step;
        }
        Ok(None)
    }
}

/// A resizable array of `Option<T>` cells addressed by a 64-bit logical
/// index and backed by segments of at most `SEGMENT_CELLS` cells.
///
/// The store guards its segments and its `sorted` flag with two independent
/// reader-writer locks, always acquired data-first. Every operation takes
/// `&self`, so a store can be shared between threads behind an `Arc`.
///
/// ## Example
///
/// ```rust
/// use elastic_store::CapacityStore;
///
/// let store: CapacityStore<u32> = CapacityStore::new(5).unwrap();
/// store.set(0, Some(10)).unwrap();
/// store.set(2, Some(20)).unwrap();
/// store.set(4, Some(30)).unwrap();
///
/// assert_eq!(store.defragment().unwrap(), Some(3));
/// assert_eq!(store.get(1).unwrap(), Some(20));
/// ```
pub struct CapacityStore<T, const SEGMENT_CELLS: u64 = SEGMAX> {
    data: RwLock<Backing<T, SEGMENT_CELLS>>,
    sorted: RwLock<bool>,
}

impl<T, const SEGMENT_CELLS: u64> Debug for CapacityStore<T, SEGMENT_CELLS> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let data = self.data.read();
        f.debug_struct("CapacityStore")
            .field("capacity", &data.capacity)
            .field(
                "segments",
                &data.segments.as_ref().map(|segments| segments.len()),
            )
            .field("segment_cells", &SEGMENT_CELLS)
            .field("sorted", &*self.sorted.read())
            .finish()
    }
}

impl<T, const SEGMENT_CELLS: u64> CapacityStore<T, SEGMENT_CELLS> {
    const VALID_SEGMENT: () = assert!(SEGMENT_CELLS > 0 && SEGMENT_CELLS <= SEGMAX);

    /// Creates a store of `capacity` empty cells.
    ///
    /// `capacity` is masked into the non-negative `i64` range.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfCapacityMemory`] if the segments cannot be allocated.
    pub fn new(capacity: u64) -> Result<Self> {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_SEGMENT;

        Ok(Self {
            data: RwLock::new(Backing::allocate(capacity & CAPACITY_MASK, 0)?),
            sorted: RwLock::new(false),
        })
    }

    /// Returns the number of addressable cells.
    pub fn capacity(&self) -> u64 {
        self.data.read().capacity
    }

    /// Returns `true` if the store was sorted and not mutated since.
    pub fn is_sorted(&self) -> bool {
        let _data = self.data.read();
        *self.sorted.read()
    }

    /// Clears the sorted flag without blocking. Called with the data write
    /// lock held; the sort lock is only ever taken under the data lock, so
    /// the attempt cannot contend.
    fn mark_unsorted(&self) {
        match self.sorted.try_write() {
            Some(mut sorted) => *sorted = false,
            None => debug_assert!(false, "sort lock held without the data lock"),
        }
    }

    /// Reads the cell at `index` by reference.
    ///
    /// # Errors
    ///
    /// [`Error::IndexOutOfRange`] or [`Error::NullBackingStore`].
    pub fn with<R>(&self, index: u64, f: impl FnOnce(Option<&T>) -> R) -> Result<R> {
        let data = self.data.read();
        Ok(f(data.cell(index)?))
    }

    /// Stores `element` at `index` and returns the previous content.
    ///
    /// Passing `None` empties the cell. Clears the sorted flag.
    ///
    /// # Errors
    ///
    /// [`Error::IndexOutOfRange`] or [`Error::NullBackingStore`].
    pub fn set(&self, index: u64, element: Option<T>) -> Result<Option<T>> {
        let mut data = self.data.write();
        let previous = data.replace(index, element)?;
        self.mark_unsorted();
        Ok(previous)
    }

    /// Empties the cell at `index` and returns its content.
    pub fn take(&self, index: u64) -> Result<Option<T>> {
        self.set(index, None)
    }

    /// Resizes the store to `capacity` cells.
    ///
    /// Growing keeps every cell and appends empty ones; shrinking keeps the
    /// prefix `[0, capacity)`. On a released store this allocates a fresh
    /// backing.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfCapacityMemory`], with the previous layout intact.
    pub fn resize(&self, capacity: u64) -> Result<()> {
        let mut data = self.data.write();
        self.mark_unsorted();
        data.resize(capacity)
    }

    /// Compacts occupied cells to the front, keeping their relative order.
    ///
    /// Returns the index of the first empty cell afterwards, or `None` if the
    /// store had no empty cell.
    ///
    /// # Errors
    ///
    /// [`Error::NullBackingStore`] if the store was released.
    pub fn defragment(&self) -> Result<Option<u64>> {
        let mut data = self.data.write();
        let mut sorted = self.sorted.write();
        let boundary = data.defragment()?;
        if boundary.is_some() {
            *sorted = false;
        }
        Ok(boundary)
    }

    /// Defragments, then shrinks the store to its occupied prefix (at least
    /// one cell). A fully occupied store keeps its capacity.
    pub fn trim(&self) -> Result<()> {
        let mut data = self.data.write();
        let mut sorted = self.sorted.write();
        let before = data.capacity;
        data.trim()?;
        if data.capacity != before {
            *sorted = false;
        }
        Ok(())
    }

    /// Number of occupied cells.
    pub fn count_occupied(&self) -> Result<u64> {
        self.data.read().count_occupied()
    }

    /// Drops the backing segments. Until the next [`resize`](Self::resize),
    /// cell access fails with [`Error::NullBackingStore`].
    pub fn release(&self) {
        let mut data = self.data.write();
        let mut sorted = self.sorted.write();
        data.segments = None;
        data.capacity = 0;
        *sorted = false;
    }
}

impl<T: Clone, const SEGMENT_CELLS: u64> CapacityStore<T, SEGMENT_CELLS> {
    /// Returns a clone of the cell at `index`.
    ///
    /// # Errors
    ///
    /// [`Error::IndexOutOfRange`] or [`Error::NullBackingStore`].
    pub fn get(&self, index: u64) -> Result<Option<T>> {
        self.with(index, |cell| cell.cloned())
    }

    /// Copies the store, reporting allocation failure instead of aborting.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfCapacityMemory`] or [`Error::NullBackingStore`].
    pub fn try_clone(&self) -> Result<Self> {
        let data = self.data.read();
        let sorted = *self.sorted.read();
        Ok(Self {
            data: RwLock::new(data.try_clone()?),
            sorted: RwLock::new(sorted),
        })
    }

    /// Returns `(index, element)` for every occupied cell, in index order.
    pub fn snapshot(&self) -> Result<Vec<(u64, T)>> {
        let data = self.data.read();
        let segments = data.segments()?;
        Ok(segments
            .iter()
            .flat_map(|segment| segment.iter())
            .enumerate()
            .filter_map(|(index, cell)| cell.as_ref().map(|e| (index as u64, e.clone())))
            .collect())
    }
}

impl<T: Sortable + Clone, const SEGMENT_CELLS: u64> CapacityStore<T, SEGMENT_CELLS> {
    /// Trims the store and sorts it in place by `ordering`.
    ///
    /// The sort works on a copy that replaces the store only on success, so
    /// a failed sort leaves both contents and capacity untouched.
    ///
    /// # Errors
    ///
    /// - [`Error::NotSortable`] naming the first element that cannot be
    ///   ordered.
    /// - [`Error::OutOfCapacityMemory`] if the working copy cannot be
    ///   allocated.
    /// - [`Error::NullBackingStore`] if the store was released.
    pub fn sort(&self, ordering: Ordering) -> Result<()> {
        let mut data = self.data.write();
        let mut sorted = self.sorted.write();

        let mut work = data.try_clone()?;
        work.trim()?;
        work.quicksort(ordering)?;
        *data = work;
        *sorted = true;

        debug!(capacity = data.capacity, ?ordering, "sorted capacity store");
        Ok(())
    }

    /// Binary-searches a sorted store for `target`.
    ///
    /// The direction is detected from the first and last elements, so
    /// `ordering.direction` is ignored; `ordering.mode` selects the metric.
    /// Returns `None` when no element qualifies.
    ///
    /// For [`SearchMode::Nearest`] ties prefer the landing element, then the
    /// lower neighbour, then the upper one. Landing is positional (the first
    /// element ordered after the target), so an exact tie resolves to the
    /// larger element in an ascending store and to the smaller one in a
    /// descending store. Comparator-only
    /// ([`Mode::Relative`]) searches have no distance and resolve to the floor,
    /// else the ceiling.
    ///
    /// # Errors
    ///
    /// - [`Error::NotSorted`] unless the last mutation was a sort.
    /// - [`Error::UnsortableTarget`] if `target` lacks the metric.
    pub fn search(&self, target: &T, search: SearchMode, ordering: Ordering) -> Result<Option<u64>> {
        let data = self.data.read();
        let sorted = self.sorted.read();
        if !*sorted {
            return Err(Error::NotSorted);
        }
        data.search(target, search, ordering.mode)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use rand::Rng;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    use super::*;
    use crate::sortable::Metric;

    #[derive(Debug, Clone, PartialEq)]
    struct Sample {
        id: u32,
        weight: f64,
    }

    impl Sortable for Sample {
        fn integer_metric(&self) -> Option<i64> {
            Some(self.id as i64)
        }

        fn floating_metric(&self) -> Option<f64> {
            Some(self.weight)
        }

        fn compare(&self, other: &Self) -> Option<CmpOrdering> {
            self.weight.partial_cmp(&other.weight)
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Unranked(u8);

    impl Sortable for Unranked {}

    const INT_ASC: Ordering = Ordering::ascending(Mode::Absolute(Metric::Integer));
    const INT_DESC: Ordering = Ordering::descending(Mode::Absolute(Metric::Integer));

    fn contents<T: Clone, const S: u64>(store: &CapacityStore<T, S>) -> Vec<Option<T>> {
        (0..store.capacity()).map(|i| store.get(i).unwrap()).collect()
    }

    #[test]
    fn create_is_empty() {
        for capacity in [1u64, 2, 7, 31, 64] {
            let store: CapacityStore<u32, 8> = CapacityStore::new(capacity).unwrap();
            assert_eq!(store.capacity(), capacity);
            assert!(contents(&store).iter().all(|c| c.is_none()));
            assert!(!store.is_sorted());
        }
    }

    #[test]
    fn layout_matches_segment_rules() {
        assert_eq!(layout(0, 8), (0, 0));
        assert_eq!(layout(8, 8), (1, 8));
        assert_eq!(layout(9, 8), (2, 1));
        assert_eq!(layout(16, 8), (2, 8));
        assert_eq!(layout(SEGMAX + 1, SEGMAX), (2, 1));
    }

    #[test]
    fn capacity_is_masked_non_negative() {
        let store: CapacityStore<u8, 4> = CapacityStore::new(0).unwrap();
        let masked = (1u64 << 63) | 3;
        store.resize(masked).unwrap();
        assert_eq!(store.capacity(), 3);
    }

    #[test]
    fn set_get_across_segments() {
        let store: CapacityStore<u64, 4> = CapacityStore::new(10).unwrap();
        for i in 0..10 {
            assert_eq!(store.set(i, Some(i * 100)).unwrap(), None);
        }
        for i in 0..10 {
            assert_eq!(store.get(i).unwrap(), Some(i * 100));
        }
        assert_eq!(store.set(5, None).unwrap(), Some(500));
        assert_eq!(store.get(5).unwrap(), None);
        assert_eq!(store.with(9, |c| c.copied()).unwrap(), Some(900));
    }

    #[test]
    fn out_of_range_and_released() {
        let store: CapacityStore<u64, 4> = CapacityStore::new(6).unwrap();
        assert!(matches!(
            store.get(6),
            Err(Error::IndexOutOfRange {
                index: 6,
                capacity: 6
            })
        ));
        assert!(matches!(
            store.set(u64::MAX, Some(1)),
            Err(Error::IndexOutOfRange { .. })
        ));

        store.release();
        assert_eq!(store.capacity(), 0);
        assert!(matches!(store.get(0), Err(Error::NullBackingStore)));
        assert!(matches!(store.defragment(), Err(Error::NullBackingStore)));

        store.resize(3).unwrap();
        assert_eq!(store.capacity(), 3);
        assert_eq!(store.get(2).unwrap(), None);
    }

    #[test]
    fn grow_preserves_and_fills_empty() {
        let store: CapacityStore<u32, 4> = CapacityStore::new(5).unwrap();
        for i in 0..5 {
            store.set(i, Some(i as u32)).unwrap();
        }
        store.resize(13).unwrap();
        let cells = contents(&store);
        assert_eq!(cells.len(), 13);
        for i in 0..5 {
            assert_eq!(cells[i], Some(i as u32));
        }
        assert!(cells[5..].iter().all(|c| c.is_none()));
    }

    #[test]
    fn shrink_keeps_prefix() {
        let store: CapacityStore<u32, 4> = CapacityStore::new(17).unwrap();
        for i in 0..17 {
            store.set(i, Some(i as u32 + 1)).unwrap();
        }
        store.resize(9).unwrap();
        store.resize(6).unwrap();
        assert_eq!(
            contents(&store),
            (1..=6).map(Some).collect::<Vec<_>>()
        );
        store.resize(0).unwrap();
        assert_eq!(store.capacity(), 0);
        store.resize(2).unwrap();
        assert_eq!(contents(&store), vec![None, None]);
    }

    #[test]
    fn failed_allocation_rolls_back() {
        // One-cell segments make the segment table itself unreservable.
        let store: CapacityStore<u64, 1> = CapacityStore::new(4).unwrap();
        store.set(1, Some(11)).unwrap();
        let err = store.resize(i64::MAX as u64).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfCapacityMemory { current: 4, .. }
        ));
        assert_eq!(store.capacity(), 4);
        assert_eq!(store.get(1).unwrap(), Some(11));
    }

    #[test]
    fn defragment_scenario() {
        let store: CapacityStore<&str> = CapacityStore::new(5).unwrap();
        store.set(0, Some("a")).unwrap();
        store.set(2, Some("b")).unwrap();
        store.set(4, Some("c")).unwrap();
        assert_eq!(store.defragment().unwrap(), Some(3));
        assert_eq!(
            contents(&store),
            vec![Some("a"), Some("b"), Some("c"), None, None]
        );
    }

    #[test]
    fn defragment_dense_and_empty() {
        let store: CapacityStore<u8, 2> = CapacityStore::new(3).unwrap();
        assert_eq!(store.defragment().unwrap(), Some(0));
        for i in 0..3 {
            store.set(i, Some(i as u8)).unwrap();
        }
        assert_eq!(store.defragment().unwrap(), None);
    }

    #[test]
    fn defragment_random_patterns_are_stable() {
        let mut rng = SmallRng::seed_from_u64(0x5EED);
        for round in 0..200 {
            let capacity = rng.random_range(1..60u64);
            let store: CapacityStore<u64, 7> = CapacityStore::new(capacity).unwrap();
            let mut expected = Vec::new();
            for i in 0..capacity {
                if rng.random_bool(0.5) {
                    let value = round * 1000 + i;
                    store.set(i, Some(value)).unwrap();
                    expected.push(value);
                }
            }

            let boundary = store.defragment().unwrap();
            let k = expected.len() as u64;
            assert_eq!(boundary, if k == capacity { None } else { Some(k) });

            let cells = contents(&store);
            let (front, back) = cells.split_at(k as usize);
            assert_eq!(front.iter().map(|c| c.unwrap()).collect::<Vec<_>>(), expected);
            assert!(back.iter().all(|c| c.is_none()));
        }
    }

    #[test]
    fn trim_shrinks_to_boundary_with_floor_of_one() {
        let store: CapacityStore<u8, 4> = CapacityStore::new(10).unwrap();
        store.set(3, Some(1)).unwrap();
        store.set(8, Some(2)).unwrap();
        store.trim().unwrap();
        assert_eq!(contents(&store), vec![Some(1), Some(2)]);

        let empty: CapacityStore<u8, 4> = CapacityStore::new(10).unwrap();
        empty.trim().unwrap();
        assert_eq!(empty.capacity(), 1);

        let dense: CapacityStore<u8, 4> = CapacityStore::new(2).unwrap();
        dense.set(0, Some(1)).unwrap();
        dense.set(1, Some(1)).unwrap();
        dense.trim().unwrap();
        assert_eq!(dense.capacity(), 2);
    }

    #[test]
    fn sort_integers_both_directions() {
        let mut rng = SmallRng::seed_from_u64(42);
        let values: Vec<i64> = (0..300).map(|_| rng.random_range(-500..500)).collect();

        for ordering in [INT_ASC, INT_DESC] {
            let store: CapacityStore<i64, 16> = CapacityStore::new(400).unwrap();
            for (i, v) in values.iter().enumerate() {
                store.set(i as u64 * 4 / 3, Some(*v)).unwrap();
            }
            store.sort(ordering).unwrap();
            assert!(store.is_sorted());
            assert_eq!(store.capacity(), values.len() as u64);

            let sorted: Vec<i64> = contents(&store).into_iter().map(|c| c.unwrap()).collect();
            let mut expected = values.clone();
            expected.sort();
            if ordering.direction == Direction::Descending {
                expected.reverse();
            }
            assert_eq!(sorted, expected);
        }
    }

    #[test]
    fn sort_by_floating_and_relative() {
        let samples: Vec<Sample> = [3.5, -1.0, 9.25, 0.0, 2.75, 2.5]
            .iter()
            .enumerate()
            .map(|(i, w)| Sample {
                id: 10 - i as u32,
                weight: *w,
            })
            .collect();

        for mode in [Mode::Absolute(Metric::Floating), Mode::Relative] {
            let store: CapacityStore<Sample, 4> = CapacityStore::new(6).unwrap();
            for (i, s) in samples.iter().enumerate() {
                store.set(i as u64, Some(s.clone())).unwrap();
            }
            store.sort(Ordering::ascending(mode)).unwrap();
            let weights: Vec<f64> = contents(&store)
                .into_iter()
                .map(|c| c.unwrap().weight)
                .collect();
            assert_eq!(weights, vec![-1.0, 0.0, 2.5, 2.75, 3.5, 9.25]);
        }
    }

    #[test]
    fn sort_failure_names_index_and_leaves_store_untouched() {
        let store: CapacityStore<Unranked, 4> = CapacityStore::new(6).unwrap();
        store.set(1, Some(Unranked(1))).unwrap();
        store.set(4, Some(Unranked(2))).unwrap();
        let before = contents(&store);

        let err = store.sort(INT_ASC).unwrap_err();
        assert!(matches!(err, Error::NotSortable { index } if index < 2));
        assert_eq!(contents(&store), before);
        assert_eq!(store.capacity(), 6);
        assert!(!store.is_sorted());
    }

    #[test]
    fn nan_is_not_sortable() {
        let store: CapacityStore<f64> = CapacityStore::new(3).unwrap();
        store.set(0, Some(1.0)).unwrap();
        store.set(1, Some(f64::NAN)).unwrap();
        store.set(2, Some(0.5)).unwrap();
        let err = store
            .sort(Ordering::ascending(Mode::Absolute(Metric::Floating)))
            .unwrap_err();
        assert!(matches!(err, Error::NotSortable { index: 1 }));
    }

    #[test]
    fn mutation_clears_sorted() {
        let store: CapacityStore<i64> = CapacityStore::new(3).unwrap();
        for i in 0..3 {
            store.set(i, Some(3 - i as i64)).unwrap();
        }
        store.sort(INT_ASC).unwrap();
        assert!(store.is_sorted());
        assert!(store.search(&2, SearchMode::Exact, INT_ASC).is_ok());

        store.set(0, Some(7)).unwrap();
        assert!(!store.is_sorted());
        assert!(matches!(
            store.search(&2, SearchMode::Exact, INT_ASC),
            Err(Error::NotSorted)
        ));

        store.sort(INT_ASC).unwrap();
        store.resize(5).unwrap();
        assert!(!store.is_sorted());
    }

    #[test]
    fn exact_search_finds_every_element() {
        let mut rng = SmallRng::seed_from_u64(7);
        let values: Vec<i64> = (0..257).map(|_| rng.random_range(-10_000..10_000)).collect();

        for ordering in [
            INT_ASC,
            INT_DESC,
            Ordering::ascending(Mode::Relative),
            Ordering::descending(Mode::Relative),
        ] {
            let store: CapacityStore<i64, 32> = CapacityStore::new(values.len() as u64).unwrap();
            for (i, v) in values.iter().enumerate() {
                store.set(i as u64, Some(*v)).unwrap();
            }
            store.sort(ordering).unwrap();
            for v in &values {
                let at = store
                    .search(v, SearchMode::Exact, ordering)
                    .unwrap()
                    .expect("inserted value must be found");
                assert_eq!(store.get(at).unwrap(), Some(*v));
            }
            assert_eq!(store.search(&20_001, SearchMode::Exact, ordering).unwrap(), None);
        }
    }

    #[test]
    fn exact_search_finds_every_float() {
        const FLOAT_ASC: Ordering = Ordering::ascending(Mode::Absolute(Metric::Floating));
        const FLOAT_DESC: Ordering = Ordering::descending(Mode::Absolute(Metric::Floating));

        let mut rng = SmallRng::seed_from_u64(11);
        let values: Vec<f64> = (0..193).map(|_| rng.random_range(-1e3..1e3)).collect();

        for ordering in [
            FLOAT_ASC,
            FLOAT_DESC,
            Ordering::ascending(Mode::Relative),
            Ordering::descending(Mode::Relative),
        ] {
            let store: CapacityStore<f64, 16> = CapacityStore::new(values.len() as u64).unwrap();
            for (i, v) in values.iter().enumerate() {
                store.set(i as u64, Some(*v)).unwrap();
            }
            store.sort(ordering).unwrap();

            let sorted: Vec<f64> = contents(&store).into_iter().map(|c| c.unwrap()).collect();
            let in_order = sorted.windows(2).all(|w| match ordering.direction {
                Direction::Ascending => w[0] <= w[1],
                Direction::Descending => w[0] >= w[1],
            });
            assert!(in_order, "{ordering:?}");

            for v in &values {
                let at = store
                    .search(v, SearchMode::Exact, ordering)
                    .unwrap()
                    .expect("inserted value must be found");
                assert_eq!(store.get(at).unwrap(), Some(*v));
            }
            assert_eq!(store.search(&5e3, SearchMode::Exact, ordering).unwrap(), None);
        }
    }

    #[test]
    fn floating_descending_floor_ceiling_nearest() {
        let ordering = Ordering::descending(Mode::Absolute(Metric::Floating));
        let store: CapacityStore<f64, 2> = CapacityStore::new(4).unwrap();
        for (i, v) in [0.5, 1.5, 2.5, 3.5].into_iter().enumerate() {
            store.set(i as u64, Some(v)).unwrap();
        }
        store.sort(ordering).unwrap();
        assert_eq!(contents(&store), vec![Some(3.5), Some(2.5), Some(1.5), Some(0.5)]);

        let find = |t: f64, m| {
            store
                .search(&t, m, ordering)
                .unwrap()
                .map(|i| store.get(i).unwrap().unwrap())
        };
        assert_eq!(find(2.0, SearchMode::Floor), Some(1.5));
        assert_eq!(find(2.0, SearchMode::Ceiling), Some(2.5));
        assert_eq!(find(0.1, SearchMode::Floor), None);
        assert_eq!(find(0.1, SearchMode::Ceiling), Some(0.5));
        assert_eq!(find(4.0, SearchMode::Ceiling), None);
        assert_eq!(find(4.0, SearchMode::Floor), Some(3.5));
        assert_eq!(find(2.2, SearchMode::Nearest), Some(2.5));
        assert_eq!(find(1.9, SearchMode::Nearest), Some(1.5));
        assert_eq!(find(-5.0, SearchMode::Nearest), Some(0.5));
        assert_eq!(find(9.0, SearchMode::Nearest), Some(3.5));
        assert_eq!(find(1.5, SearchMode::Floor), Some(1.5));
    }

    #[test]
    fn nearest_tie_follows_store_direction() {
        for (ordering, expected) in [
            (Ordering::ascending(Mode::Absolute(Metric::Floating)), 0.0),
            (Ordering::descending(Mode::Absolute(Metric::Floating)), -0.5),
        ] {
            let store: CapacityStore<f64> = CapacityStore::new(2).unwrap();
            store.set(0, Some(-0.5)).unwrap();
            store.set(1, Some(0.0)).unwrap();
            store.sort(ordering).unwrap();

            let at = store
                .search(&-0.25, SearchMode::Nearest, ordering)
                .unwrap()
                .unwrap();
            assert_eq!(store.get(at).unwrap(), Some(expected), "{ordering:?}");
        }
    }

    #[test]
    fn try_clone_is_independent() {
        let store: CapacityStore<i64, 3> = CapacityStore::new(7).unwrap();
        for i in 0..7 {
            store.set(i, Some(7 - i as i64)).unwrap();
        }
        store.sort(INT_ASC).unwrap();

        let copy = store.try_clone().unwrap();
        assert!(copy.is_sorted());
        assert_eq!(contents(&copy), contents(&store));

        copy.set(0, Some(100)).unwrap();
        assert!(!copy.is_sorted());
        assert!(store.is_sorted());
        assert_eq!(store.get(0).unwrap(), Some(1));

        store.release();
        assert!(matches!(store.try_clone(), Err(Error::NullBackingStore)));
    }

    #[test]
    fn set_clears_sorted_while_flag_is_polled() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;
        use std::sync::atomic::Ordering as AtomicOrdering;
        use std::thread;

        let store: Arc<CapacityStore<i64, 8>> = Arc::new(CapacityStore::new(16).unwrap());
        for i in 0..16 {
            store.set(i, Some(i as i64)).unwrap();
        }
        let done = Arc::new(AtomicBool::new(false));
        let pollers: Vec<_> = (0..3)
            .map(|_| {
                let store = Arc::clone(&store);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    while !done.load(AtomicOrdering::Relaxed) {
                        let _ = store.is_sorted();
                    }
                })
            })
            .collect();

        for round in 0..200 {
            store.sort(INT_ASC).unwrap();
            assert!(store.is_sorted());
            store.set(round % 16, Some(round as i64)).unwrap();
            assert!(!store.is_sorted());
            assert!(matches!(
                store.search(&0, SearchMode::Exact, INT_ASC),
                Err(Error::NotSorted)
            ));
        }

        done.store(true, AtomicOrdering::Relaxed);
        for p in pollers {
            p.join().unwrap();
        }
    }

    fn sorted_store(values: &[i64], ordering: Ordering) -> CapacityStore<i64, 4> {
        let store = CapacityStore::new(values.len() as u64).unwrap();
        for (i, v) in values.iter().enumerate() {
            store.set(i as u64, Some(*v)).unwrap();
        }
        store.sort(ordering).unwrap();
        store
    }

    fn value_at(store: &CapacityStore<i64, 4>, hit: Option<u64>) -> Option<i64> {
        hit.map(|i| store.get(i).unwrap().unwrap())
    }

    #[test]
    fn floor_and_ceiling_ascending() {
        let store = sorted_store(&[10, 20, 20, 30, 40], INT_ASC);
        let find = |t: i64, m| value_at(&store, store.search(&t, m, INT_ASC).unwrap());

        assert_eq!(find(25, SearchMode::Floor), Some(20));
        assert_eq!(find(25, SearchMode::Ceiling), Some(30));
        assert_eq!(find(20, SearchMode::Floor), Some(20));
        assert_eq!(find(5, SearchMode::Floor), None);
        assert_eq!(find(5, SearchMode::Ceiling), Some(10));
        assert_eq!(find(45, SearchMode::Ceiling), None);
        assert_eq!(find(45, SearchMode::Floor), Some(40));
    }

    #[test]
    fn floor_and_ceiling_descending() {
        let store = sorted_store(&[10, 20, 30, 40, 50], INT_DESC);
        let find = |t: i64, m| value_at(&store, store.search(&t, m, INT_DESC).unwrap());

        assert_eq!(find(35, SearchMode::Floor), Some(30));
        assert_eq!(find(35, SearchMode::Ceiling), Some(40));
        assert_eq!(find(60, SearchMode::Ceiling), None);
        assert_eq!(find(60, SearchMode::Floor), Some(50));
        assert_eq!(find(1, SearchMode::Floor), None);
    }

    #[test]
    fn nearest_prefers_landing_then_lower() {
        let store = sorted_store(&[10, 20, 30, 40], INT_ASC);
        let find = |t: i64| value_at(&store, store.search(&t, SearchMode::Nearest, INT_ASC).unwrap());

        assert_eq!(find(22), Some(20));
        assert_eq!(find(28), Some(30));
        // Equidistant: the landing element (first above) wins.
        assert_eq!(find(25), Some(30));
        assert_eq!(find(-100), Some(10));
        assert_eq!(find(100), Some(40));
        assert_eq!(find(40), Some(40));
    }

    #[test]
    fn relative_nearest_resolves_to_floor_then_ceiling() {
        let ordering = Ordering::ascending(Mode::Relative);
        let store = sorted_store(&[10, 20, 30], ordering);
        let find = |t: i64| value_at(&store, store.search(&t, SearchMode::Nearest, ordering).unwrap());
        assert_eq!(find(28), Some(20));
        assert_eq!(find(1), Some(10));
    }

    #[test]
    fn search_target_must_provide_metric() {
        let store: CapacityStore<f64> = CapacityStore::new(2).unwrap();
        store.set(0, Some(1.0)).unwrap();
        store.set(1, Some(2.0)).unwrap();
        let ordering = Ordering::ascending(Mode::Absolute(Metric::Floating));
        store.sort(ordering).unwrap();
        assert!(matches!(
            store.search(&f64::NAN, SearchMode::Exact, ordering),
            Err(Error::UnsortableTarget)
        ));
    }

    #[test]
    fn empty_store_sorts_and_finds_nothing() {
        let store: CapacityStore<i64> = CapacityStore::new(8).unwrap();
        store.sort(INT_ASC).unwrap();
        assert_eq!(store.capacity(), 1);
        assert_eq!(store.search(&1, SearchMode::Nearest, INT_ASC).unwrap(), None);
    }

    #[test]
    fn snapshot_and_count() {
        let store: CapacityStore<u8, 3> = CapacityStore::new(7).unwrap();
        store.set(1, Some(4)).unwrap();
        store.set(5, Some(9)).unwrap();
        assert_eq!(store.count_occupied().unwrap(), 2);
        assert_eq!(store.snapshot().unwrap(), vec![(1, 4), (5, 9)]);
    }

    #[test]
    fn concurrent_readers_and_writers() {
        use std::sync::Arc;
        use std::thread;

        let store: Arc<CapacityStore<u64, 16>> = Arc::new(CapacityStore::new(256).unwrap());
        let writers: Vec<_> = (0..4u64)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in (t..256).step_by(4) {
                        store.set(i, Some(i)).unwrap();
                    }
                })
            })
            .collect();
        let reader = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..100 {
                    for i in 0..256 {
                        if let Some(v) = store.get(i).unwrap() {
                            assert_eq!(v, i);
                        }
                    }
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(store.count_occupied().unwrap(), 256);
    }
}
