use crate::raw::{self, Expected, Task};
use seize::{Collector, Guard, LocalGuard, OwnedGuard};

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::error::Error;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::Arc;

/// The default initial capacity of a map.
pub const DEFAULT_INITIAL_CAPACITY: usize = 16;

/// The default load factor of a map.
pub const DEFAULT_LOAD_FACTOR: f32 = 0.75;

/// The default concurrency level of a map.
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 16;

/// A concurrent hash map whose entries can be reclaimed under memory pressure.
///
/// Values are stored as [`Arc<V>`]. An entry is considered unreferenced when the
/// map holds the only strong reference to its value, and such entries may be
/// evicted by [`ReferenceMap::reclaim`] at any time, from any thread. Whether an
/// entry is eligible at a given [`MemoryPressure`] depends on the map's
/// [`ReferenceType`].
///
/// Inserting into a segment that is due to grow first evicts the entries that
/// are eligible under [`MemoryPressure::Low`]. A weak map whose values are not
/// held elsewhere therefore stays bounded without any call to `reclaim`.
///
/// The map is split into segments, each guarded by its own lock. Lookups never
/// take a lock unless reclaimed entries are waiting to be purged.
///
/// See the [crate-level documentation](crate) for details.
pub struct ReferenceMap<K, V, S = RandomState> {
    raw: raw::ReferenceMap<K, V, S>,
}

// Safety: Keys are shared between threads through `&K` and dropped by
// whichever thread reclaims them, and values are shared through `Arc<V>`.
unsafe impl<K: Send + Sync, V: Send + Sync, S: Send> Send for ReferenceMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for ReferenceMap<K, V, S> {}

/// The strength of the references a map holds to its entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReferenceType {
    /// Unreferenced entries are reclaimed only under [`MemoryPressure::High`].
    #[default]
    Soft,

    /// Unreferenced entries are reclaimed under any [`MemoryPressure`].
    Weak,
}

/// How urgently memory is needed when reclaiming entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryPressure {
    /// Reclaim unreferenced [`Weak`](ReferenceType::Weak) entries.
    Low,

    /// Reclaim all unreferenced entries.
    High,
}

/// An error returned by [`ReferenceMapBuilder::try_build`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BuildError {
    /// The load factor was zero, negative, or not finite.
    InvalidLoadFactor(f32),

    /// The concurrency level was zero.
    InvalidConcurrencyLevel,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::InvalidLoadFactor(load_factor) => {
                write!(f, "load factor must be positive, found {load_factor}")
            }
            BuildError::InvalidConcurrencyLevel => {
                write!(f, "concurrency level must be positive")
            }
        }
    }
}

impl Error for BuildError {}

/// A builder for a [`ReferenceMap`].
///
/// # Examples
///
/// ```rust
/// use refmap::{Collector, ReferenceMap, ReferenceType};
/// use std::collections::hash_map::RandomState;
///
/// let map: ReferenceMap<i32, i32> = ReferenceMap::builder()
///     // Set the initial capacity.
///     .capacity(2048)
///     // Set the load factor.
///     .load_factor(0.5)
///     // Set the expected number of concurrently writing threads.
///     .concurrency_level(8)
///     // Reclaim unreferenced entries eagerly.
///     .reference_type(ReferenceType::Weak)
///     // Set the hasher.
///     .hasher(RandomState::new())
///     // Set a custom garbage collector.
///     .collector(Collector::new().batch_size(128))
///     // Construct the hash map.
///     .build();
/// ```
pub struct ReferenceMapBuilder<K, V, S = RandomState> {
    hasher: S,
    capacity: usize,
    load_factor: f32,
    concurrency_level: usize,
    reference_type: ReferenceType,
    collector: Collector,
    _kv: PhantomData<(K, V)>,
}

impl<K, V> ReferenceMapBuilder<K, V> {
    /// Set the hash builder used to hash keys.
    ///
    /// Warning: `hash_builder` is normally randomly generated, and is designed
    /// to allow maps to be resistant to attacks that cause many collisions
    /// and very poor performance. Setting it manually using this function can
    /// expose a DoS attack vector.
    pub fn hasher<S>(self, hasher: S) -> ReferenceMapBuilder<K, V, S> {
        ReferenceMapBuilder {
            hasher,
            capacity: self.capacity,
            load_factor: self.load_factor,
            concurrency_level: self.concurrency_level,
            reference_type: self.reference_type,
            collector: self.collector,
            _kv: PhantomData,
        }
    }
}

impl<K, V, S> ReferenceMapBuilder<K, V, S> {
    /// Set the initial capacity of the map.
    ///
    /// The capacity is split evenly between segments, and each segment rounds its
    /// share up to a power of two.
    pub fn capacity(self, capacity: usize) -> ReferenceMapBuilder<K, V, S> {
        ReferenceMapBuilder { capacity, ..self }
    }

    /// Set the load factor. A segment grows once it holds more entries than
    /// its bucket count multiplied by the load factor.
    ///
    /// Must be positive.
    pub fn load_factor(self, load_factor: f32) -> ReferenceMapBuilder<K, V, S> {
        ReferenceMapBuilder {
            load_factor,
            ..self
        }
    }

    /// Set the expected number of threads writing to the map concurrently.
    ///
    /// This is rounded up to a power of two to give the number of segments, and
    /// cannot be changed after construction. Must be positive.
    pub fn concurrency_level(self, concurrency_level: usize) -> ReferenceMapBuilder<K, V, S> {
        ReferenceMapBuilder {
            concurrency_level,
            ..self
        }
    }

    /// Set the strength of the references to entries. See [`ReferenceType`] for details.
    pub fn reference_type(self, reference_type: ReferenceType) -> ReferenceMapBuilder<K, V, S> {
        ReferenceMapBuilder {
            reference_type,
            ..self
        }
    }

    /// Set the [`seize::Collector`] used for garbage collection.
    ///
    /// Note that all `Guard` references used to access the map must be produced by
    /// the provided `collector`.
    pub fn collector(self, collector: Collector) -> ReferenceMapBuilder<K, V, S> {
        ReferenceMapBuilder { collector, ..self }
    }

    /// Construct a [`ReferenceMap`] from the builder, using the configured options.
    ///
    /// # Panics
    ///
    /// Panics if the load factor or concurrency level is invalid. Use
    /// [`ReferenceMapBuilder::try_build`] to handle the error instead.
    pub fn build(self) -> ReferenceMap<K, V, S> {
        match self.try_build() {
            Ok(map) => map,
            Err(err) => panic!("invalid map configuration: {err}"),
        }
    }

    /// Construct a [`ReferenceMap`] from the builder, validating the configured options.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::{BuildError, ReferenceMap};
    ///
    /// let result = ReferenceMap::<i32, i32>::builder().load_factor(0.0).try_build();
    /// assert_eq!(result.err(), Some(BuildError::InvalidLoadFactor(0.0)));
    /// ```
    pub fn try_build(self) -> Result<ReferenceMap<K, V, S>, BuildError> {
        if !(self.load_factor.is_finite() && self.load_factor > 0.0) {
            return Err(BuildError::InvalidLoadFactor(self.load_factor));
        }

        if self.concurrency_level == 0 {
            return Err(BuildError::InvalidConcurrencyLevel);
        }

        Ok(ReferenceMap {
            raw: raw::ReferenceMap::new(
                self.capacity,
                self.load_factor,
                self.concurrency_level,
                self.reference_type,
                self.hasher,
                self.collector,
            ),
        })
    }
}

impl<K, V, S> fmt::Debug for ReferenceMapBuilder<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceMapBuilder")
            .field("capacity", &self.capacity)
            .field("load_factor", &self.load_factor)
            .field("concurrency_level", &self.concurrency_level)
            .field("reference_type", &self.reference_type)
            .field("collector", &self.collector)
            .finish()
    }
}

impl<K, V> ReferenceMap<K, V> {
    /// Creates an empty `ReferenceMap` with the default configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    /// let map: ReferenceMap<&str, i32> = ReferenceMap::new();
    /// ```
    pub fn new() -> ReferenceMap<K, V> {
        ReferenceMap::with_capacity_and_hasher(DEFAULT_INITIAL_CAPACITY, RandomState::new())
    }

    /// Creates an empty `ReferenceMap` with the specified initial capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    /// let map: ReferenceMap<&str, i32> = ReferenceMap::with_capacity(10);
    /// ```
    pub fn with_capacity(capacity: usize) -> ReferenceMap<K, V> {
        ReferenceMap::with_capacity_and_hasher(capacity, RandomState::new())
    }

    /// Returns a builder for a `ReferenceMap`.
    ///
    /// The builder can be used for more complex configuration, such as the
    /// [`ReferenceType`], load factor, or concurrency level.
    pub fn builder() -> ReferenceMapBuilder<K, V> {
        ReferenceMapBuilder {
            capacity: DEFAULT_INITIAL_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            reference_type: ReferenceType::default(),
            hasher: RandomState::default(),
            collector: Collector::new(),
            _kv: PhantomData,
        }
    }
}

impl<K, V, S> Default for ReferenceMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        ReferenceMap::with_hasher(S::default())
    }
}

impl<K, V, S> ReferenceMap<K, V, S> {
    /// Creates an empty `ReferenceMap` which will use the given hash builder to hash
    /// keys.
    ///
    /// Warning: `hash_builder` is normally randomly generated, and is designed
    /// to allow maps to be resistant to attacks that cause many collisions
    /// and very poor performance. Setting it manually using this function can
    /// expose a DoS attack vector.
    pub fn with_hasher(hash_builder: S) -> ReferenceMap<K, V, S> {
        ReferenceMap::with_capacity_and_hasher(DEFAULT_INITIAL_CAPACITY, hash_builder)
    }

    /// Creates an empty `ReferenceMap` with the specified initial capacity, using
    /// `hash_builder` to hash the keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let s = RandomState::new();
    /// let map = ReferenceMap::with_capacity_and_hasher(10, s);
    /// map.insert(1, 2);
    /// ```
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> ReferenceMap<K, V, S> {
        ReferenceMap {
            raw: raw::ReferenceMap::new(
                capacity,
                DEFAULT_LOAD_FACTOR,
                DEFAULT_CONCURRENCY_LEVEL,
                ReferenceType::default(),
                hash_builder,
                Collector::new(),
            ),
        }
    }

    /// Returns a guard for use with this map.
    ///
    /// Note that holding on to a guard prevents garbage collection.
    /// See the [crate-level documentation](crate#guards) for details.
    #[inline]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.raw.guard()
    }

    /// Returns an owned guard for use with this map.
    ///
    /// Owned guards implement `Send` and `Sync`, allowing them to be held across
    /// `.await` points in work-stealing schedulers. This is especially useful
    /// for iterators.
    ///
    /// Note that holding on to a guard prevents garbage collection.
    /// See the [crate-level documentation](crate#guards) for details.
    #[inline]
    pub fn owned_guard(&self) -> OwnedGuard<'_> {
        self.raw.collector().enter_owned()
    }

    /// Returns the approximate number of entries in the map.
    ///
    /// Entries that were reclaimed but not yet purged are still counted. Call
    /// [`ReferenceMap::purge_unreferenced_entries`] first for an exact count.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map = ReferenceMap::new();
    ///
    /// map.insert(1, "a");
    /// map.insert(2, "b");
    /// assert!(map.len() == 2);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns `true` if the map is empty. Otherwise returns `false`.
    ///
    /// Like [`ReferenceMap::len`], this counts entries that are awaiting a purge.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the total number of buckets across all segments.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// Returns the number of segments.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.raw.segment_count()
    }

    /// Returns the load factor the map was built with.
    #[inline]
    pub fn load_factor(&self) -> f32 {
        self.raw.load_factor
    }

    /// Returns the strength of the references the map holds to its entries.
    #[inline]
    pub fn reference_type(&self) -> ReferenceType {
        self.raw.reference_type
    }

    /// Removes all entries from the map.
    ///
    /// Segments are cleared one at a time, so concurrent insertions into other
    /// segments may survive.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map = ReferenceMap::new();
    ///
    /// map.insert(1, "a");
    /// map.clear();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    pub fn clear(&self) {
        self.raw.clear()
    }

    /// Unlinks every entry that has been reclaimed, so that [`ReferenceMap::len`]
    /// reflects only live entries.
    ///
    /// Reclaimed entries are otherwise purged lazily by later operations on
    /// their segment.
    #[inline]
    pub fn purge_unreferenced_entries(&self) {
        self.raw.purge_unreferenced_entries()
    }

    /// Reclaims every entry that is unreferenced outside of the map and eligible
    /// under `pressure`, returning the number of entries reclaimed.
    ///
    /// Reclaimed entries disappear from lookups immediately, and are purged by the
    /// next operation on their segment or by [`ReferenceMap::purge_unreferenced_entries`].
    ///
    /// This may be called from any thread, concurrently with other operations.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::{MemoryPressure, ReferenceMap};
    /// use std::sync::Arc;
    ///
    /// let map = ReferenceMap::new();
    /// let held = Arc::new("held");
    ///
    /// map.insert_arc(1, held.clone());
    /// map.insert(2, "dropped");
    ///
    /// assert_eq!(map.reclaim(MemoryPressure::High), 1);
    /// assert_eq!(map.get(&1), Some(held));
    /// assert_eq!(map.get(&2), None);
    /// ```
    #[inline]
    pub fn reclaim(&self, pressure: MemoryPressure) -> usize {
        self.raw.reclaim(pressure)
    }

    /// An iterator visiting all live key-value pairs in arbitrary order.
    ///
    /// The iterator is lazy: entries inserted or reclaimed during iteration may or
    /// may not be observed, but entries reclaimed or removed before the iterator
    /// reaches them are never yielded.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map = ReferenceMap::new();
    /// map.insert("a", 1);
    /// map.insert("b", 2);
    ///
    /// let guard = map.guard();
    /// for (key, val) in map.iter(&guard) {
    ///     println!("key: {key} val: {val}");
    /// }
    /// ```
    #[inline]
    pub fn iter<'g, G>(&'g self, guard: &'g G) -> Iter<'g, K, V, S, G>
    where
        G: Guard,
    {
        Iter {
            raw: self.raw.iter(guard),
        }
    }

    /// An iterator visiting all live keys in arbitrary order.
    #[inline]
    pub fn keys<'g, G>(&'g self, guard: &'g G) -> Keys<'g, K, V, S, G>
    where
        G: Guard,
    {
        Keys {
            iter: self.iter(guard),
        }
    }

    /// An iterator visiting all live values in arbitrary order.
    #[inline]
    pub fn values<'g, G>(&'g self, guard: &'g G) -> Values<'g, K, V, S, G>
    where
        G: Guard,
    {
        Values {
            iter: self.iter(guard),
        }
    }
}

impl<K, V, S> ReferenceMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Returns `true` if the map contains a live value for the specified key.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map = ReferenceMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.contains_key(&1), true);
    /// assert_eq!(map.contains_key(&2), false);
    /// ```
    #[inline]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.contains_key(key)
    }

    /// Returns the value corresponding to the key.
    ///
    /// The returned [`Arc`] keeps the entry referenced, and so protects it from
    /// being reclaimed, for as long as it is held.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map = ReferenceMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.get(&1).as_deref(), Some(&"a"));
    /// assert_eq!(map.get(&2), None);
    /// ```
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.get(key)
    }

    /// Inserts a key-value pair into the map.
    ///
    /// If the map did not have this key present, [`None`] is returned.
    ///
    /// If the map did have this key present, the value is updated, and the old
    /// value is returned. The key is not updated, though; this matters for
    /// types that can be `==` without being identical.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map = ReferenceMap::new();
    /// assert_eq!(map.insert(37, "a"), None);
    /// assert_eq!(map.is_empty(), false);
    ///
    /// map.insert(37, "b");
    /// assert_eq!(map.insert(37, "c").as_deref(), Some(&"b"));
    /// assert_eq!(map.get(&37).as_deref(), Some(&"c"));
    /// ```
    #[inline]
    pub fn insert(&self, key: K, value: V) -> Option<Arc<V>> {
        self.raw.put(key, Arc::new(value), true)
    }

    /// Inserts a shared value into the map, returning the previous value.
    ///
    /// The entry stays referenced, and so cannot be reclaimed, for as long as a
    /// clone of `value` is held outside of the map.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::{MemoryPressure, ReferenceMap};
    /// use std::sync::Arc;
    ///
    /// let map = ReferenceMap::new();
    /// let value = Arc::new("a");
    ///
    /// map.insert_arc(1, value.clone());
    /// assert_eq!(map.reclaim(MemoryPressure::High), 0);
    /// assert!(Arc::ptr_eq(&map.get(&1).unwrap(), &value));
    /// ```
    #[inline]
    pub fn insert_arc(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        self.raw.put(key, value, true)
    }

    /// Inserts a key-value pair into the map if the key is not already present.
    ///
    /// Returns the existing value if there was one, in which case the map is
    /// left unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map = ReferenceMap::new();
    /// assert_eq!(map.insert_if_absent(37, "a"), None);
    /// assert_eq!(map.insert_if_absent(37, "b").as_deref(), Some(&"a"));
    /// assert_eq!(map.get(&37).as_deref(), Some(&"a"));
    /// ```
    #[inline]
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        self.raw.put(key, Arc::new(value), false)
    }

    /// Returns the value for the key, computing and inserting it if absent.
    ///
    /// The value is computed without holding any lock. If another thread
    /// inserts a value for the key in the meantime, that value is returned and
    /// the computed one is discarded.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map = ReferenceMap::new();
    /// assert_eq!(*map.get_or_insert_with("a", || 1), 1);
    /// assert_eq!(*map.get_or_insert_with("a", || 2), 1);
    /// ```
    pub fn get_or_insert_with<F>(&self, key: K, f: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        // The insert below purges the segment anyway.
        if let Some(value) = self.raw.peek(&key) {
            return value;
        }

        let value = Arc::new(f());
        match self.raw.put(key, value.clone(), false) {
            Some(existing) => existing,
            None => value,
        }
    }

    /// Removes a key from the map, returning the value at the key if the key
    /// was previously in the map.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map = ReferenceMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.remove(&1).as_deref(), Some(&"a"));
    /// assert_eq!(map.remove(&1), None);
    /// ```
    #[inline]
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.execute(Task::Remove {
            key,
            expected: None,
        })
    }

    /// Removes a key from the map if its current value equals `expected`.
    ///
    /// Returns `true` if the entry was removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map = ReferenceMap::new();
    /// map.insert(1, "a");
    /// assert!(!map.remove_if_eq(&1, &"b"));
    /// assert!(map.remove_if_eq(&1, &"a"));
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    pub fn remove_if_eq<Q>(&self, key: &Q, expected: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        self.raw
            .execute(Task::Remove {
                key,
                expected: Some(Expected::new(expected)),
            })
            .is_some()
    }

    /// Replaces the value for a key only if the key is present, returning the
    /// previous value.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map = ReferenceMap::new();
    /// assert_eq!(map.replace(&1, "a"), None);
    /// assert!(map.is_empty());
    ///
    /// map.insert(1, "a");
    /// assert_eq!(map.replace(&1, "b").as_deref(), Some(&"a"));
    /// assert_eq!(map.get(&1).as_deref(), Some(&"b"));
    /// ```
    #[inline]
    pub fn replace<Q>(&self, key: &Q, value: V) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.execute(Task::Replace {
            key,
            value: Arc::new(value),
            expected: None,
        })
    }

    /// Replaces the value for a key only if its current value equals `expected`.
    ///
    /// Returns `true` if the value was replaced.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map = ReferenceMap::new();
    /// map.insert(1, "a");
    /// assert!(!map.replace_if_eq(&1, &"b", "c"));
    /// assert!(map.replace_if_eq(&1, &"a", "c"));
    /// assert_eq!(map.get(&1).as_deref(), Some(&"c"));
    /// ```
    #[inline]
    pub fn replace_if_eq<Q>(&self, key: &Q, expected: &V, value: V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        self.raw
            .execute(Task::Replace {
                key,
                value: Arc::new(value),
                expected: Some(Expected::new(expected)),
            })
            .is_some()
    }
}

impl<K, V, S> fmt::Debug for ReferenceMap<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V, S> Extend<(K, V)> for &ReferenceMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for ReferenceMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut iter = iter.into_iter();

        if let Some((key, value)) = iter.next() {
            let (lower, _) = iter.size_hint();
            let map = ReferenceMap::with_capacity_and_hasher(
                lower.saturating_add(1).max(DEFAULT_INITIAL_CAPACITY),
                S::default(),
            );

            map.insert(key, value);
            (&map).extend(iter);
            map
        } else {
            Self::default()
        }
    }
}

/// An iterator over a map's entries.
///
/// This struct is created by the [`iter`](ReferenceMap::iter) method on [`ReferenceMap`].
/// See its documentation for details.
pub struct Iter<'g, K, V, S, G> {
    raw: raw::Iter<'g, K, V, S, G>,
}

impl<'g, K, V, S, G> Iter<'g, K, V, S, G>
where
    K: Hash + Eq,
    S: BuildHasher,
    G: Guard,
{
    /// Removes the entry most recently returned by this iterator from the map.
    ///
    /// Returns the removed value, or `None` if the iterator has not returned an
    /// entry since the last removal, the entry was already gone, or its value
    /// was replaced since it was returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use refmap::ReferenceMap;
    ///
    /// let map: ReferenceMap<i32, i32> = (0..10).map(|i| (i, i)).collect();
    ///
    /// let guard = map.guard();
    /// let mut iter = map.iter(&guard);
    /// while let Some((_, value)) = iter.next() {
    ///     if *value % 2 == 0 {
    ///         iter.remove_last();
    ///     }
    /// }
    ///
    /// assert!(map.get(&1).is_some());
    /// assert!(map.get(&2).is_none());
    /// ```
    #[inline]
    pub fn remove_last(&mut self) -> Option<Arc<V>> {
        self.raw.remove_last()
    }
}

impl<'g, K: 'g, V: 'g, S, G> Iterator for Iter<'g, K, V, S, G>
where
    G: Guard,
{
    type Item = (&'g K, Arc<V>);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.raw.next()
    }
}

impl<K, V, S, G> fmt::Debug for Iter<'_, K, V, S, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").finish_non_exhaustive()
    }
}

/// An iterator over a map's keys.
///
/// This struct is created by the [`keys`](ReferenceMap::keys) method on [`ReferenceMap`].
/// See its documentation for details.
pub struct Keys<'g, K, V, S, G> {
    iter: Iter<'g, K, V, S, G>,
}

impl<'g, K: 'g, V: 'g, S, G> Iterator for Keys<'g, K, V, S, G>
where
    G: Guard,
{
    type Item = &'g K;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let (key, _) = self.iter.next()?;
        Some(key)
    }
}

/// An iterator over a map's values.
///
/// This struct is created by the [`values`](ReferenceMap::values) method on [`ReferenceMap`].
/// See its documentation for details.
pub struct Values<'g, K, V, S, G> {
    iter: Iter<'g, K, V, S, G>,
}

impl<'g, K: 'g, V: 'g, S, G> Iterator for Values<'g, K, V, S, G>
where
    G: Guard,
{
    type Item = Arc<V>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let (_, value) = self.iter.next()?;
        Some(value)
    }
}
