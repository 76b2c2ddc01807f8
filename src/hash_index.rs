use alloc::vec::Vec;
use core::fmt::Debug;
use core::fmt::Display;
use core::hash::BuildHasher;
use core::hash::Hash;

use parking_lot::RwLock;
use rand::TryRngCore;
use rand::rngs::OsRng;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::capacity_store::CapacityStore;
use crate::error::Component;
use crate::error::Error;
use crate::error::Result;
use crate::keystream::Keystream;
use crate::keystream::ProbeSeq;

cfg_if::cfg_if! {
    if #[cfg(feature = "foldhash")] {
        /// Hasher builder used when none is supplied.
        pub type DefaultHashBuilder = foldhash::fast::RandomState;
    } else {
        /// Hasher builder used when none is supplied.
        pub type DefaultHashBuilder = std::hash::RandomState;
    }
}

/// Capacity of a new index, and the floor it never shrinks below.
pub const INITIAL_CAPACITY: u64 = 16;

/// Forced growth resizes a single insertion may trigger when its probe
/// sequence overflows, and regrow retries a rebuild may make when its own
/// reinsertion overflows, before failing with [`Error::ProbeOverflow`].
pub const MAX_OVERFLOW_RESIZES: u32 = 1;

#[cfg(feature = "stats")]
const HISTOGRAM_BINS: usize = 16;

#[inline(always)]
fn should_grow(populated: u64, capacity: u64) -> bool {
    populated as u128 * 32 >= capacity as u128 * 29
}

#[inline(always)]
fn should_shrink(populated: u64, capacity: u64) -> bool {
    populated as u128 * 4 <= capacity as u128
}

#[inline(always)]
fn grown(capacity: u64) -> u64 {
    capacity.saturating_add(capacity / 4).max(INITIAL_CAPACITY)
}

#[inline(always)]
fn shrunk(capacity: u64) -> u64 {
    (capacity / 2).max(INITIAL_CAPACITY)
}

/// Seed for the salt generator, from the OS when it is available.
fn salt_seed() -> u64 {
    match OsRng.try_next_u64() {
        Ok(seed) => seed,
        Err(err) => {
            warn!(%err, "os entropy unavailable, seeding salts from the clock");
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos() as u64)
                .unwrap_or(0)
        }
    }
}

enum Placement<K, V> {
    /// Stored; carries the value it replaced, if any.
    Placed(Option<V>),
    /// No empty or matching slot within `2·M` probes.
    Overflow(K, V),
}

/// One table instance: capacity, salt and the two index-aligned stores.
struct Table<K, V> {
    keys: CapacityStore<K>,
    vals: CapacityStore<V>,
    capacity: u64,
    populated: u64,
    salt: u64,
}

impl<K, V> Table<K, V>
where
    K: Eq + Clone,
    V: Clone,
{
    fn new(capacity: u64, salt: u64) -> Result<Self> {
        let tagged = |err: Error| err.raised_by(Component::HashIndex);
        Ok(Self {
            keys: CapacityStore::new(capacity).map_err(tagged)?,
            vals: CapacityStore::new(capacity).map_err(tagged)?,
            capacity,
            populated: 0,
            salt,
        })
    }

    fn try_clone(&self) -> Result<Self> {
        let tagged = |err: Error| err.raised_by(Component::HashIndex);
        Ok(Self {
            keys: self.keys.try_clone().map_err(tagged)?,
            vals: self.vals.try_clone().map_err(tagged)?,
            capacity: self.capacity,
            populated: self.populated,
            salt: self.salt,
        })
    }

    #[inline]
    fn probe_limit(&self) -> u64 {
        self.capacity.saturating_mul(2)
    }

    /// Walks `seq` until `key` or an empty slot is found. Returns the probe
    /// number and slot of the key.
    fn find(&self, key: &K, seq: &ProbeSeq) -> Result<Option<(u64, u64)>> {
        for i in 0..self.probe_limit() {
            let slot = seq.slot(i, self.capacity);
            match self.keys.with(slot, |cell| cell.map(|k| k == key))? {
                None => return Ok(None),
                Some(true) => return Ok(Some((i, slot))),
                Some(false) => {}
            }
        }
        Ok(None)
    }

    fn place(&mut self, key: K, val: V, seq: &ProbeSeq) -> Result<Placement<K, V>> {
        for i in 0..self.probe_limit() {
            let slot = seq.slot(i, self.capacity);
            match self.keys.with(slot, |cell| cell.map(|k| *k == key))? {
                None => {
                    self.keys.set(slot, Some(key))?;
                    self.vals.set(slot, Some(val))?;
                    self.populated += 1;
                    return Ok(Placement::Placed(None));
                }
                Some(true) => {
                    let previous = self.vals.set(slot, Some(val))?;
                    return Ok(Placement::Placed(previous));
                }
                Some(false) => {}
            }
        }
        Ok(Placement::Overflow(key, val))
    }

    /// Empties `slot` in both stores.
    fn evict(&mut self, slot: u64) -> Result<Option<(K, V)>> {
        let key = self.keys.take(slot)?;
        let val = self.vals.take(slot)?;
        Ok(match (key, val) {
            (Some(key), Some(val)) => {
                self.populated -= 1;
                Some((key, val))
            }
            _ => None,
        })
    }

    /// Live pairs in slot order.
    fn entries(&self) -> Result<Vec<(K, V)>> {
        let mut entries = Vec::with_capacity(self.populated as usize);
        for (slot, key) in self.keys.snapshot()? {
            match self.vals.get(slot)? {
                Some(val) => entries.push((key, val)),
                None => warn!(slot, "hash index key without value skipped"),
            }
        }
        Ok(entries)
    }
}

struct Inner<K, V> {
    table: Table<K, V>,
    /// Source of per-table salts; advanced on every rebuild.
    salts: Keystream,
}

/// A key/value index using salted, randomized open addressing over two
/// [`CapacityStore`]s.
///
/// Each key's probe sequence is derived from its hash, its `Display` form
/// and the table salt: the hash is avalanched against a keystream seeded by
/// the key string, salted, and a Damm check digit of the result perturbs the
/// quadratic probe. The table grows by 5/4 once 29/32 of its slots are live
/// and halves (never below [`INITIAL_CAPACITY`]) once a quarter or fewer
/// are. Every resize builds a fresh table with a fresh salt.
///
/// Deletion does not leave tombstones. After clearing a key's slot, the
/// occupants along the rest of that key's probe sequence are re-inserted,
/// and a consistency check rebuilds the table if any key became
/// unreachable.
///
/// All operations take `&self`; lookups share a read lock and mutations
/// hold the write lock for their whole duration.
///
/// ## Example
///
/// ```rust
/// use elastic_store::HashIndex;
///
/// let index: HashIndex<String, u32> = HashIndex::new().unwrap();
/// index.put("apple".to_string(), Some(3)).unwrap();
/// assert_eq!(index.get(&"apple".to_string()).unwrap(), Some(3));
///
/// index.put("apple".to_string(), None).unwrap();
/// assert_eq!(index.get(&"apple".to_string()).unwrap(), None);
/// ```
pub struct HashIndex<K, V, S = DefaultHashBuilder> {
    inner: RwLock<Inner<K, V>>,
    hash_builder: S,
}

impl<K, V, S> Debug for HashIndex<K, V, S>
where
    K: Debug + Eq + Clone,
    V: Debug + Clone,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.read();
        let mut map = f.debug_map();
        if let Ok(entries) = inner.table.entries() {
            for (k, v) in entries {
                map.entry(&k, &v);
            }
        }
        map.finish()
    }
}

impl<K, V, S> HashIndex<K, V, S>
where
    K: Hash + Eq + Display + Clone,
    V: Clone,
    S: BuildHasher,
{
    /// Creates an empty index with [`INITIAL_CAPACITY`] slots.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfCapacityMemory`] if the stores cannot be allocated.
    pub fn with_hasher(hash_builder: S) -> Result<Self> {
        Self::with_capacity_and_hasher(INITIAL_CAPACITY, hash_builder)
    }

    /// Creates an empty index with `capacity` slots (at least
    /// [`INITIAL_CAPACITY`]).
    pub fn with_capacity_and_hasher(capacity: u64, hash_builder: S) -> Result<Self> {
        Self::build(capacity, Keystream::from_u64(salt_seed()), hash_builder)
    }

    /// Creates an empty index whose salts are drawn from a generator seeded
    /// with `seed`, so table layouts are reproducible.
    pub fn with_seed_and_hasher(seed: u64, hash_builder: S) -> Result<Self> {
        Self::build(INITIAL_CAPACITY, Keystream::from_u64(seed), hash_builder)
    }

    fn build(capacity: u64, mut salts: Keystream, hash_builder: S) -> Result<Self> {
        let table = Table::new(capacity.max(INITIAL_CAPACITY), salts.next_u63())?;
        Ok(Self {
            inner: RwLock::new(Inner { table, salts }),
            hash_builder,
        })
    }

    /// Returns the number of live pairs.
    pub fn len(&self) -> u64 {
        self.inner.read().table.populated
    }

    /// Returns `true` if the index holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current number of slots.
    pub fn capacity(&self) -> u64 {
        self.inner.read().table.capacity
    }

    #[inline]
    fn probe_seq(&self, key: &K, salt: u64) -> ProbeSeq {
        ProbeSeq::new(self.hash_builder.hash_one(key), key, salt)
    }

    /// Returns the value stored for `key`.
    ///
    /// # Errors
    ///
    /// Only surfaces errors of the underlying stores.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let inner = self.inner.read();
        let table = &inner.table;
        let seq = self.probe_seq(key, table.salt);
        match table.find(key, &seq)? {
            Some((_, slot)) => table.vals.get(slot),
            None => Ok(None),
        }
    }

    /// Returns `true` if `key` is present.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let inner = self.inner.read();
        let seq = self.probe_seq(key, inner.table.salt);
        Ok(inner.table.find(key, &seq)?.is_some())
    }

    /// Stores `val` under `key`, or deletes `key` when `val` is `None`.
    ///
    /// Returns the value previously stored for `key`.
    ///
    /// # Errors
    ///
    /// - [`Error::ProbeOverflow`] if the key cannot be placed after one
    ///   forced resize, or a resize cannot rehome the existing pairs.
    /// - [`Error::OutOfCapacityMemory`] if a resize cannot allocate.
    ///
    /// A failed call leaves the index exactly as it was.
    pub fn put(&self, key: K, val: Option<V>) -> Result<Option<V>> {
        let mut inner = self.inner.write();
        match val {
            Some(val) => self.put_locked(&mut inner, key, val),
            None => self.delete_locked(&mut inner, &key),
        }
    }

    /// Stores `val` under `key` and returns the value it replaced.
    pub fn insert(&self, key: K, val: V) -> Result<Option<V>> {
        self.put(key, Some(val))
    }

    /// Removes `key` and returns its value. Deleting an absent key is a
    /// no-op.
    ///
    /// The repair after removal runs on a copy of the table, so a failed
    /// delete leaves the key and every other pair in place.
    pub fn delete(&self, key: &K) -> Result<Option<V>> {
        let mut inner = self.inner.write();
        self.delete_locked(&mut inner, key)
    }

    /// Returns a snapshot of the live keys in slot order.
    pub fn keys(&self) -> Result<Vec<K>> {
        let inner = self.inner.read();
        Ok(inner
            .table
            .keys
            .snapshot()?
            .into_iter()
            .map(|(_, key)| key)
            .collect())
    }

    /// Verifies that the load is under the growth threshold and that every
    /// live key is reachable through its probe sequence.
    pub fn check(&self) -> Result<bool> {
        let inner = self.inner.read();
        self.check_table(&inner.table)
    }

    /// Removes every pair and returns to a fresh [`INITIAL_CAPACITY`] table.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let mut salts = inner.salts.clone();
        let table = Table::new(INITIAL_CAPACITY, salts.next_u63())?;
        *inner = Inner { table, salts };
        Ok(())
    }

    fn put_locked(&self, inner: &mut Inner<K, V>, key: K, val: V) -> Result<Option<V>> {
        // Resized tables are staged and replace `inner` only once the pair
        // has been placed.
        let mut salts = inner.salts.clone();
        let mut staged = None;
        if should_grow(inner.table.populated, inner.table.capacity) {
            staged = Some(self.rebuilt(&inner.table, &mut salts, grown(inner.table.capacity))?);
        }

        let (mut key, mut val) = (key, val);
        let mut attempts = 0;
        loop {
            let table = staged.as_mut().unwrap_or(&mut inner.table);
            let seq = self.probe_seq(&key, table.salt);
            match table.place(key, val, &seq)? {
                Placement::Placed(previous) => {
                    if let Some(table) = staged {
                        inner.table = table;
                        inner.salts = salts;
                    }
                    return Ok(previous);
                }
                Placement::Overflow(k, v) => {
                    let capacity = table.capacity;
                    if attempts == MAX_OVERFLOW_RESIZES {
                        return Err(Error::ProbeOverflow { capacity, attempts });
                    }
                    attempts += 1;
                    debug!(capacity, attempts, "probe sequence overflowed, forcing resize");
                    let larger = self.rebuilt(table, &mut salts, grown(capacity))?;
                    staged = Some(larger);
                    (key, val) = (k, v);
                }
            }
        }
    }

    fn delete_locked(&self, inner: &mut Inner<K, V>, key: &K) -> Result<Option<V>> {
        let seq = self.probe_seq(key, inner.table.salt);
        let Some((found_at, slot)) = inner.table.find(key, &seq)? else {
            return Ok(None);
        };

        let mut work = Inner {
            table: inner.table.try_clone()?,
            salts: inner.salts.clone(),
        };
        let removed = work.table.evict(slot)?.map(|(_, val)| val);

        // Re-home the occupants further along the deleted key's own probe
        // sequence. A rebuild during re-insertion ends the walk.
        let (capacity, salt) = (work.table.capacity, work.table.salt);
        let mut relocated = 0u64;
        for i in found_at + 1..capacity.saturating_mul(2) {
            if work.table.capacity != capacity || work.table.salt != salt {
                break;
            }
            let Some((occupant, val)) = work.table.evict(seq.slot(i, capacity))? else {
                break;
            };
            self.put_locked(&mut work, occupant, val)?;
            relocated += 1;
        }
        trace!(relocated, "deleted hash index key");

        let (populated, capacity) = (work.table.populated, work.table.capacity);
        if should_shrink(populated, capacity) && shrunk(capacity) < capacity {
            work.table = self.rebuilt(&work.table, &mut work.salts, shrunk(capacity))?;
        }

        if !self.check_table(&work.table)? {
            warn!(
                capacity = work.table.capacity,
                populated = work.table.populated,
                "hash index inconsistent after delete, rebuilding"
            );
            work.table = self.rebuilt(&work.table, &mut work.salts, grown(work.table.capacity))?;
        }

        *inner = work;
        Ok(removed)
    }

    fn check_table(&self, table: &Table<K, V>) -> Result<bool> {
        if should_grow(table.populated, table.capacity) {
            return Ok(false);
        }

        let keys = table.keys.snapshot()?;
        if keys.len() as u64 != table.populated {
            return Ok(false);
        }
        for (slot, key) in &keys {
            let seq = self.probe_seq(key, table.salt);
            match table.find(key, &seq)? {
                Some((_, found)) if found == *slot => {}
                _ => return Ok(false),
            }
            if table.vals.with(*slot, |val| val.is_none())? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Re-inserts every live pair of `table` into a fresh table of
    /// `capacity` slots, drawing its salt from `salts`. If the fresh table
    /// overflows, one larger table is tried before giving up. `table` is
    /// never modified.
    fn rebuilt(
        &self,
        table: &Table<K, V>,
        salts: &mut Keystream,
        capacity: u64,
    ) -> Result<Table<K, V>> {
        let entries = table.entries()?;
        let mut capacity = capacity.max(INITIAL_CAPACITY);

        for attempt in 0..=MAX_OVERFLOW_RESIZES {
            if attempt > 0 {
                capacity = grown(capacity);
            }
            let salt = salts.next_u63();
            let mut fresh = Table::new(capacity, salt)?;
            let mut overflowed = false;
            for (key, val) in &entries {
                let seq = self.probe_seq(key, salt);
                if let Placement::Overflow(..) = fresh.place(key.clone(), val.clone(), &seq)? {
                    overflowed = true;
                    break;
                }
            }

            if !overflowed {
                debug!(
                    from = table.capacity,
                    to = capacity,
                    populated = fresh.populated,
                    attempt,
                    "rebuilt hash index"
                );
                return Ok(fresh);
            }
            debug!(capacity, attempt, "rebuild overflowed");
        }

        Err(Error::ProbeOverflow {
            capacity,
            attempts: MAX_OVERFLOW_RESIZES,
        })
    }
}

impl<K, V, S> HashIndex<K, V, S>
where
    K: Hash + Eq + Display + Clone,
    V: Clone,
    S: BuildHasher + Default,
{
    /// Creates an empty index using the default hasher builder.
    pub fn new() -> Result<Self> {
        Self::with_hasher(S::default())
    }

    /// Creates an empty index with `capacity` slots using the default
    /// hasher builder.
    pub fn with_capacity(capacity: u64) -> Result<Self> {
        Self::with_capacity_and_hasher(capacity, S::default())
    }
}

/// Debug statistics for hash index analysis.
#[cfg(feature = "stats")]
#[derive(Debug, Clone)]
pub struct DebugStats {
    /// Number of live pairs.
    pub populated: u64,
    /// Number of slots.
    pub capacity: u64,
    /// `populated / capacity`.
    pub load_factor: f64,
    /// Salt of the current table.
    pub salt: u64,
    /// Longest probe distance of any live key.
    pub max_probe: u64,
    /// Mean probe distance over live keys.
    pub mean_probe: f64,
}

#[cfg(feature = "stats")]
impl DebugStats {
    /// Pretty-print the debug statistics.
    pub fn print(&self) {
        println!("=== Hash Index Debug Statistics ===");
        println!(
            "Population: {}/{} ({:.2}% load factor)",
            self.populated,
            self.capacity,
            self.load_factor * 100.0
        );
        println!("Salt: {:#018x}", self.salt);
        println!(
            "Probes: max {} / mean {:.3}",
            self.max_probe, self.mean_probe
        );
    }
}

#[cfg(feature = "stats")]
impl<K, V, S> HashIndex<K, V, S>
where
    K: Hash + Eq + Display + Clone,
    V: Clone,
    S: BuildHasher,
{
    fn probe_distances(&self) -> Result<Vec<u64>> {
        let inner = self.inner.read();
        let table = &inner.table;
        let mut distances = Vec::with_capacity(table.populated as usize);
        for (_, key) in table.keys.snapshot()? {
            let seq = self.probe_seq(&key, table.salt);
            if let Some((i, _)) = table.find(&key, &seq)? {
                distances.push(i);
            }
        }
        Ok(distances)
    }

    /// Computes a histogram of probe distances for the live keys.
    ///
    /// Bin `i` counts keys found on probe `i`; the last bin collects every
    /// distance of `HISTOGRAM_BINS - 1` or more.
    pub fn probe_histogram(&self) -> Result<Vec<usize>> {
        let mut hist = alloc::vec![0usize; HISTOGRAM_BINS];
        for distance in self.probe_distances()? {
            hist[(distance as usize).min(HISTOGRAM_BINS - 1)] += 1;
        }
        Ok(hist)
    }

    /// Returns load and probe statistics for the current table.
    pub fn debug_stats(&self) -> Result<DebugStats> {
        let distances = self.probe_distances()?;
        let inner = self.inner.read();
        let table = &inner.table;
        Ok(DebugStats {
            populated: table.populated,
            capacity: table.capacity,
            load_factor: table.populated as f64 / table.capacity as f64,
            salt: table.salt,
            max_probe: distances.iter().copied().max().unwrap_or(0),
            mean_probe: if distances.is_empty() {
                0.0
            } else {
                distances.iter().sum::<u64>() as f64 / distances.len() as f64
            },
        })
    }

    /// Pretty-prints the probe-distance histogram horizontally using stdout.
    pub fn print_probe_histogram(&self) -> Result<()> {
        let hist = self.probe_histogram()?;
        let max = hist.iter().copied().max().unwrap_or(0);
        if max == 0 {
            println!("probe histogram: empty");
            return Ok(());
        }

        let max_bar = 60usize;
        println!("probe histogram ({} keys):", self.len());
        for (i, &count) in hist.iter().enumerate() {
            let bar = "█".repeat((count * max_bar).div_ceil(max));
            let label = if i == HISTOGRAM_BINS - 1 {
                alloc::format!("{:>2}+", i)
            } else {
                alloc::format!("{:>3}", i)
            };
            println!("{} | {} ({})", label, bar, count);
        }
        Ok(())
    }
}
