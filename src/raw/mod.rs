mod hash;
mod iter;
mod reference;
mod segment;
mod utils;

pub use iter::Iter;
pub use segment::{Expected, Task};

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::Arc;

use seize::{Collector, Guard, LocalGuard};

use self::reference::Reference;
use self::segment::{Restructure, Segment, MAXIMUM_SEGMENT_SIZE};
use self::utils::CachePadded;
use crate::map::{MemoryPressure, ReferenceType};

/// The maximum number of segments.
pub const MAXIMUM_CONCURRENCY_LEVEL: usize = 1 << 16;

// A segmented hash map of reclaimable references.
pub struct ReferenceMap<K, V, S> {
    /// The segments, fixed for the lifetime of the map.
    segments: Box<[CachePadded<Segment<K, V>>]>,

    /// The number of high hash bits used to select a segment.
    shift: u32,

    /// Collector for memory reclamation.
    collector: Collector,

    pub hasher: S,
    pub load_factor: f32,
    pub reference_type: ReferenceType,

    _kv: PhantomData<(K, V)>,
}

impl<K, V, S> ReferenceMap<K, V, S> {
    /// Creates a map with the given options. The options must have been validated.
    pub fn new(
        capacity: usize,
        load_factor: f32,
        concurrency_level: usize,
        reference_type: ReferenceType,
        hasher: S,
        collector: Collector,
    ) -> ReferenceMap<K, V, S> {
        debug_assert!(load_factor.is_finite() && load_factor > 0.0);
        debug_assert!(concurrency_level > 0);

        let shift = utils::shift_for(concurrency_level, MAXIMUM_CONCURRENCY_LEVEL);
        let segment_count = 1usize << shift;

        // Split the requested capacity evenly, rounding up.
        let per_segment = capacity.div_ceil(segment_count);
        let initial_size = 1usize << utils::shift_for(per_segment, MAXIMUM_SEGMENT_SIZE);

        let segments = (0..segment_count)
            .map(|_| CachePadded::new(Segment::new(initial_size, load_factor, reference_type)))
            .collect();

        ReferenceMap {
            segments,
            shift,
            collector,
            hasher,
            load_factor,
            reference_type,
            _kv: PhantomData,
        }
    }

    /// Returns a guard for this map's collector.
    #[inline]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// Returns a reference to the collector.
    #[inline]
    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Verify a guard is valid to use with this map.
    #[inline]
    pub fn verify<G: Guard>(&self, guard: &G) {
        assert_eq!(
            *guard.collector(),
            self.collector,
            "Attempted to access map with incorrect guard"
        );
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    // Selects a segment by the high bits of the hash.
    #[inline]
    fn segment(&self, hash: u32) -> &Segment<K, V> {
        let index = match self.shift {
            0 => 0,
            shift => (hash >> (u32::BITS - shift)) as usize & (self.segments.len() - 1),
        };

        &self.segments[index]
    }

    #[inline]
    pub(crate) fn segments(&self) -> impl Iterator<Item = &Segment<K, V>> {
        self.segments.iter().map(|segment| &**segment)
    }

    /// Returns the approximate number of entries.
    ///
    /// Reclaimed entries are counted until they are purged.
    pub fn len(&self) -> usize {
        self.segments().map(Segment::count).sum()
    }

    /// Returns the total length of all bucket arrays.
    pub fn capacity(&self) -> usize {
        let guard = self.guard();
        self.segments().map(|segment| segment.capacity(&guard)).sum()
    }

    /// Clears every segment, one at a time.
    pub fn clear(&self) {
        let guard = self.guard();
        for segment in self.segments() {
            segment.clear(&guard);
        }
    }

    /// Purges reclaimed references from every segment, without resizing.
    pub fn purge_unreferenced_entries(&self) {
        let guard = self.guard();
        for segment in self.segments() {
            segment.restructure_if_necessary(false, &guard);
        }
    }

    /// Invalidates every entry the reclaimer may evict under `pressure`.
    pub fn reclaim(&self, pressure: MemoryPressure) -> usize {
        let guard = self.guard();
        let reclaimed = self
            .segments()
            .map(|segment| segment.reclaim(pressure, &guard))
            .sum();

        if reclaimed > 0 {
            log::debug!("reclaimed {reclaimed} entries under {pressure:?} memory pressure");
        }

        reclaimed
    }

    /// Returns an iterator over the live entries.
    pub fn iter<'g, G: Guard>(&'g self, guard: &'g G) -> Iter<'g, K, V, S, G> {
        self.verify(guard);
        Iter::new(self, guard)
    }
}

impl<K, V, S> ReferenceMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    // Returns the mixed hash of a key.
    #[inline]
    fn hash<Q>(&self, key: &Q) -> u32
    where
        Q: Hash + ?Sized,
    {
        hash::spread(self.hasher.hash_one(key))
    }

    // Looks up the live reference for a key.
    #[inline]
    fn get_reference<'g, Q>(
        &self,
        key: &Q,
        restructure: Restructure,
        guard: &'g impl Guard,
    ) -> Option<&'g Reference<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.segment(hash).get_reference(hash, key, restructure, guard)
    }

    /// Returns the value for a key.
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = self.guard();
        let reference = self.get_reference(key, Restructure::WhenNecessary, &guard)?;
        reference.get(&guard).map(|entry| entry.value(&guard))
    }

    /// Returns the value for a key without purging reclaimed references first.
    #[inline]
    pub fn peek<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = self.guard();
        let reference = self.get_reference(key, Restructure::Never, &guard)?;
        reference.get(&guard).map(|entry| entry.value(&guard))
    }

    /// Returns `true` if the map holds a live entry for the key.
    #[inline]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = self.guard();
        self.get_reference(key, Restructure::WhenNecessary, &guard)
            .and_then(|reference| reference.get(&guard))
            .is_some()
    }

    /// Runs a mutation against the segment owning `key`.
    #[inline]
    pub fn execute<Q>(&self, task: Task<'_, K, V, Q>) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(task.key());
        let guard = self.guard();
        self.segment(hash).do_task(hash, task, &guard)
    }

    /// Inserts a value, overwriting any existing value if `overwrite` is set.
    #[inline]
    pub fn put(&self, key: K, value: Arc<V>, overwrite: bool) -> Option<Arc<V>> {
        let hash = self.hash(&key);
        let guard = self.guard();
        let task: Task<'_, K, V, K> = Task::Put {
            key,
            value,
            overwrite,
        };

        self.segment(hash).do_task(hash, task, &guard)
    }
}

impl<K, V, S> Drop for ReferenceMap<K, V, S> {
    fn drop(&mut self) {
        // Make sure all retired objects are reclaimed before the segments free
        // their current chains.
        //
        // Safety: We have a unique reference to the collector.
        unsafe { self.collector.reclaim_all() };
    }
}
