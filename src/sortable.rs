use core::cmp::Ordering as CmpOrdering;

/// Capability required of elements passed through
/// [`CapacityStore::sort`](crate::CapacityStore::sort) and
/// [`CapacityStore::search`](crate::CapacityStore::search).
///
/// Every method defaults to `None`, meaning "not provided". An element that
/// cannot answer the metric an ordering asks for makes the sort fail with
/// [`Error::NotSortable`](crate::Error::NotSortable) naming its index.
///
/// # Examples
///
/// ```rust
/// use core::cmp::Ordering;
///
/// use elastic_store::Sortable;
///
/// #[derive(Clone)]
/// struct Reading {
///     millis: i64,
///     volts: f64,
/// }
///
/// impl Sortable for Reading {
///     fn integer_metric(&self) -> Option<i64> {
///         Some(self.millis)
///     }
///
///     fn floating_metric(&self) -> Option<f64> {
///         Some(self.volts)
///     }
///
///     fn compare(&self, other: &Self) -> Option<Ordering> {
///         Some(self.millis.cmp(&other.millis))
///     }
/// }
/// ```
pub trait Sortable {
    /// Integer key used by [`Metric::Integer`].
    fn integer_metric(&self) -> Option<i64> {
        None
    }

    /// Floating key used by [`Metric::Floating`]. NaN is treated as not
    /// provided.
    fn floating_metric(&self) -> Option<f64> {
        None
    }

    /// Three-way comparison used by [`Mode::Relative`].
    fn compare(&self, other: &Self) -> Option<CmpOrdering> {
        let _ = other;
        None
    }
}

macro_rules! sortable_int {
    ($($ty:ty),*) => {
        $(
            impl Sortable for $ty {
                fn integer_metric(&self) -> Option<i64> {
                    i64::try_from(*self).ok()
                }

                fn floating_metric(&self) -> Option<f64> {
                    Some(*self as f64)
                }

                fn compare(&self, other: &Self) -> Option<CmpOrdering> {
                    Some(self.cmp(other))
                }
            }
        )*
    };
}

sortable_int!(i8, i16, i32, i64, u8, u16, u32, u64, isize, usize);

macro_rules! sortable_float {
    ($($ty:ty),*) => {
        $(
            impl Sortable for $ty {
                fn integer_metric(&self) -> Option<i64> {
                    if self.is_finite() {
                        Some(*self as i64)
                    } else {
                        None
                    }
                }

                fn floating_metric(&self) -> Option<f64> {
                    Some(*self as f64)
                }

                fn compare(&self, other: &Self) -> Option<CmpOrdering> {
                    self.partial_cmp(other)
                }
            }
        )*
    };
}

sortable_float!(f32, f64);

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// Scalar metric used by [`Mode::Absolute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Metric {
    /// [`Sortable::integer_metric`].
    #[default]
    Integer,
    /// [`Sortable::floating_metric`].
    Floating,
}

/// How two elements are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Compare the scalar metric of each element.
    Absolute(Metric),
    /// Compare elements with [`Sortable::compare`].
    Relative,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Absolute(Metric::Integer)
    }
}

/// A full ordering request: direction plus comparison mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ordering {
    /// Direction of the sort. Searches detect direction themselves.
    pub direction: Direction,
    /// Comparison mode.
    pub mode: Mode,
}

impl Ordering {
    /// Ascending by the given mode.
    pub const fn ascending(mode: Mode) -> Self {
        Self {
            direction: Direction::Ascending,
            mode,
        }
    }

    /// Descending by the given mode.
    pub const fn descending(mode: Mode) -> Self {
        Self {
            direction: Direction::Descending,
            mode,
        }
    }
}

/// What a search is looking for relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SearchMode {
    /// An element equal to the target.
    #[default]
    Exact,
    /// The element closest to the target.
    Nearest,
    /// The greatest element not above the target.
    Floor,
    /// The least element not below the target.
    Ceiling,
}

/// A scalar key extracted from an element, or the element itself for
/// relative comparisons.
pub(crate) enum Key<'a, T> {
    Integer(i64),
    Floating(f64),
    Relative(&'a T),
}

impl<'a, T: Sortable> Key<'a, T> {
    /// Extracts the key `mode` asks for, or `None` if `element` cannot
    /// provide it.
    pub(crate) fn of(element: &'a T, mode: Mode) -> Option<Self> {
        match mode {
            Mode::Absolute(Metric::Integer) => element.integer_metric().map(Key::Integer),
            Mode::Absolute(Metric::Floating) => element
                .floating_metric()
                .filter(|f| !f.is_nan())
                .map(Key::Floating),
            Mode::Relative => element
                .compare(element)
                .filter(|o| *o == CmpOrdering::Equal)
                .map(|_| Key::Relative(element)),
        }
    }

    /// Three-way comparison of two keys of the same mode.
    pub(crate) fn cmp(&self, other: &Key<'_, T>) -> Option<CmpOrdering> {
        match (self, other) {
            (Key::Integer(a), Key::Integer(b)) => Some(a.cmp(b)),
            (Key::Floating(a), Key::Floating(b)) => a.partial_cmp(b),
            (Key::Relative(a), Key::Relative(b)) => a.compare(b),
            _ => None,
        }
    }

    /// Absolute distance between two scalar keys. Relative keys carry no
    /// distance.
    pub(crate) fn distance(&self, other: &Key<'_, T>) -> Option<f64> {
        match (self, other) {
            (Key::Integer(a), Key::Integer(b)) => {
                Some((*a as i128 - *b as i128).unsigned_abs() as f64)
            }
            (Key::Floating(a), Key::Floating(b)) => Some((a - b).abs()),
            _ => None,
        }
    }
}
