use std::borrow::Borrow;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use seize::{reclaim, Guard};

use super::reference::{self, Entry, Reference, ReferenceManager};
use super::utils;
use crate::map::{MemoryPressure, ReferenceType};

/// The maximum length of a segment's bucket array.
pub const MAXIMUM_SEGMENT_SIZE: usize = 1 << 30;

// A bucket array. Replaced wholesale when a segment grows.
pub struct Table<K, V> {
    buckets: Box<[AtomicPtr<Reference<K, V>>]>,
}

impl<K, V> Table<K, V> {
    fn alloc(len: usize) -> *mut Table<K, V> {
        assert!(len.is_power_of_two() && len <= MAXIMUM_SEGMENT_SIZE);

        let buckets = std::iter::repeat_with(AtomicPtr::default)
            .take(len)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Box::into_raw(Box::new(Table { buckets }))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn index(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    #[inline]
    pub fn bucket(&self, i: usize) -> &AtomicPtr<Reference<K, V>> {
        &self.buckets[i]
    }
}

/// Whether a lookup may purge reclaimed references first.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Restructure {
    WhenNecessary,
    Never,
}

// A value to compare the current value against.
pub struct Expected<'a, V> {
    value: &'a V,
    eq: fn(&V, &V) -> bool,
}

impl<'a, V: PartialEq> Expected<'a, V> {
    pub fn new(value: &'a V) -> Expected<'a, V> {
        Expected {
            value,
            eq: <V as PartialEq>::eq,
        }
    }
}

impl<'a, V> Expected<'a, V> {
    // Matches only the same allocation, not an equal value.
    pub fn identity(value: &'a V) -> Expected<'a, V> {
        Expected {
            value,
            eq: |current: &V, expected: &V| ptr::eq(current, expected),
        }
    }

    fn matches(&self, current: &V) -> bool {
        (self.eq)(current, self.value)
    }
}

/// A mutation executed by a segment under its lock.
///
/// Every task yields the value the entry held when the task acted on it, or
/// the existing value for a non-overwriting insert.
pub enum Task<'a, K, V, Q: ?Sized> {
    Put {
        key: K,
        value: Arc<V>,
        overwrite: bool,
    },
    Remove {
        key: &'a Q,
        expected: Option<Expected<'a, V>>,
    },
    Replace {
        key: &'a Q,
        value: Arc<V>,
        expected: Option<Expected<'a, V>>,
    },
}

impl<K, V, Q: ?Sized> Task<'_, K, V, Q>
where
    K: Borrow<Q>,
{
    #[inline]
    pub fn key(&self) -> &Q {
        match self {
            Task::Put { key, .. } => <K as Borrow<Q>>::borrow(key),
            Task::Remove { key, .. } | Task::Replace { key, .. } => *key,
        }
    }

    #[inline]
    fn restructure_before(&self) -> bool {
        matches!(self, Task::Put { .. } | Task::Replace { .. })
    }

    #[inline]
    fn restructure_after(&self) -> bool {
        matches!(self, Task::Remove { .. })
    }

    #[inline]
    fn skip_if_empty(&self) -> bool {
        matches!(self, Task::Remove { .. } | Task::Replace { .. })
    }

    #[inline]
    fn resize(&self) -> bool {
        matches!(self, Task::Put { .. })
    }
}

/// An independently locked shard of the map.
pub struct Segment<K, V> {
    /// Serializes mutation and restructuring. Lookups do not take it.
    lock: Mutex<()>,

    /// The current bucket array.
    table: AtomicPtr<Table<K, V>>,

    /// The number of references in the table, including reclaimed references
    /// that have not been purged yet.
    count: AtomicUsize,

    /// The count at which the next restructuring doubles the table.
    resize_threshold: AtomicUsize,

    /// The bucket array length the segment starts with, and returns to on `clear`.
    initial_size: usize,

    load_factor: f32,

    references: ReferenceManager<K, V>,
}

impl<K, V> Segment<K, V> {
    pub fn new(initial_size: usize, load_factor: f32, kind: ReferenceType) -> Segment<K, V> {
        Segment {
            lock: Mutex::new(()),
            table: AtomicPtr::new(Table::alloc(initial_size)),
            count: AtomicUsize::new(0),
            resize_threshold: AtomicUsize::new(threshold(initial_size, load_factor)),
            initial_size,
            load_factor,
            references: ReferenceManager::new(kind),
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Returns the current bucket array.
    #[inline]
    pub fn table<'g>(&self, guard: &'g impl Guard) -> &'g Table<K, V> {
        // Safety: The table is never null, and replaced tables are retired.
        unsafe { &*guard.protect(&self.table, Ordering::Acquire) }
    }

    /// Returns the length of the current bucket array.
    pub fn capacity(&self, guard: &impl Guard) -> usize {
        self.table(guard).len()
    }
}

impl<K, V> Segment<K, V> {
    /// Finds the live reference for `key`, without taking the lock unless
    /// reclaimed references need purging first.
    pub fn get_reference<'g, Q>(
        &self,
        hash: u32,
        key: &Q,
        restructure: Restructure,
        guard: &'g impl Guard,
    ) -> Option<&'g Reference<K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        // Lookups never wait for the lock. Whoever holds it will purge soon enough.
        if restructure == Restructure::WhenNecessary && self.references.has_pending() {
            if let Some(_lock) = utils::try_lock(&self.lock) {
                self.restructure_locked(false, guard);
            }
        }

        if self.count() == 0 {
            return None;
        }

        let table = self.table(guard);
        let head = guard.protect(table.bucket(table.index(hash)), Ordering::Acquire);
        find_in_chain(head, hash, key, guard)
    }

    /// Runs a mutation under the segment lock, restructuring before or after
    /// as the task requires.
    pub fn do_task<Q>(
        &self,
        hash: u32,
        task: Task<'_, K, V, Q>,
        guard: &impl Guard,
    ) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let resize = task.resize();
        if task.restructure_before() {
            self.restructure_if_necessary(resize, guard);
        }

        // Nothing to remove or replace.
        if task.skip_if_empty() && self.count() == 0 {
            return None;
        }

        let restructure_after = task.restructure_after();

        let result = {
            let _lock = utils::lock(&self.lock);

            // We hold the lock, so this is the current table.
            let table = self.table(guard);
            let bucket = table.bucket(table.index(hash));
            let head = bucket.load(Ordering::Acquire);

            let found = find_in_chain(head, hash, task.key(), guard);
            let entry = found.and_then(|reference| reference.get(guard));

            match task {
                Task::Put {
                    key,
                    value,
                    overwrite,
                } => match entry {
                    Some(entry) => {
                        let old = entry.value(guard);
                        if overwrite {
                            entry.set_value(value, guard);
                        }
                        Some(old)
                    }
                    None => {
                        self.add(bucket, head, hash, key, value);
                        None
                    }
                },

                Task::Remove { expected, .. } => match (found, entry) {
                    (Some(reference), Some(entry))
                        if expected
                            .as_ref()
                            .map_or(true, |e| e.matches(entry.value_ref(guard))) =>
                    {
                        let old = entry.value(guard);
                        self.references.release(reference, guard);
                        Some(old)
                    }
                    _ => None,
                },

                Task::Replace {
                    value, expected, ..
                } => match entry {
                    Some(entry)
                        if expected
                            .as_ref()
                            .map_or(true, |e| e.matches(entry.value_ref(guard))) =>
                    {
                        let old = entry.value(guard);
                        entry.set_value(value, guard);
                        Some(old)
                    }
                    _ => None,
                },
            }
        };

        if restructure_after {
            self.restructure_if_necessary(resize, guard);
        }

        result
    }

    // Links a new entry at the head of a bucket chain.
    //
    // Must be called with the lock held, with `head` the current head of `bucket`.
    fn add(
        &self,
        bucket: &AtomicPtr<Reference<K, V>>,
        head: *mut Reference<K, V>,
        hash: u32,
        key: K,
        value: Arc<V>,
    ) {
        let entry = Box::into_raw(Box::new(Entry::new(key, value)));
        let reference = self.references.create(entry, hash, head);

        bucket.store(reference, Ordering::Release);
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Removes every entry, returning the bucket array to its initial size.
    pub fn clear(&self, guard: &impl Guard) {
        if self.count() == 0 {
            return;
        }

        let _lock = utils::lock(&self.lock);

        // Queued references belong to the chains being retired below.
        self.drain(guard);

        let old = self
            .table
            .swap(Table::alloc(self.initial_size), Ordering::AcqRel);
        self.resize_threshold
            .store(threshold(self.initial_size, self.load_factor), Ordering::Release);
        let cleared = self.count.swap(0, Ordering::AcqRel);

        // Safety: The old table was unlinked by the swap above, and its chains
        // are only reachable through it.
        unsafe { retire_table(old, true, guard) };

        log::debug!("cleared segment ({cleared} references)");
    }

    /// Purges reclaimed references and grows the table if warranted.
    ///
    /// A segment that has reached its threshold first releases the entries that
    /// are reclaimable under low memory pressure, and only grows if that was not
    /// enough.
    pub fn restructure_if_necessary(&self, allow_resize: bool, guard: &impl Guard) {
        let needs_resize = allow_resize && self.at_threshold(self.count());

        if self.references.has_pending() || needs_resize {
            self.restructure(allow_resize, guard);
        }
    }

    fn restructure(&self, allow_resize: bool, guard: &impl Guard) {
        let _lock = utils::lock(&self.lock);
        self.restructure_locked(allow_resize, guard);
    }

    // Must be called with the lock held.
    fn restructure_locked(&self, allow_resize: bool, guard: &impl Guard) {
        // Every reclaimed reference was queued under the lock, so after draining
        // the queue the purged count is exact.
        let mut purged = self.drain(guard);
        let mut count = self.count().saturating_sub(purged);

        // A full segment evicts what it can before growing.
        if allow_resize && self.at_threshold(count) {
            let swept = self.reclaim_locked(MemoryPressure::Low, guard);
            if swept > 0 {
                let drained = self.drain(guard);
                purged += drained;
                count = count.saturating_sub(drained);
                log::trace!("swept {swept} unreferenced entries from a full segment");
            }
        }

        let needs_resize = self.at_threshold(count);

        let table = self.table(guard);
        let resizing = allow_resize && needs_resize && table.len() < MAXIMUM_SEGMENT_SIZE;

        if resizing {
            let len = table.len() << 1;
            let raw = Table::alloc(len);

            // Safety: We just allocated the table and have not published it yet.
            let restructured = unsafe { &*raw };

            for bucket in table.buckets.iter() {
                let mut walk = bucket.load(Ordering::Acquire);
                while let Some(reference) = unsafe { walk.as_ref() } {
                    let entry = reference.entry_ptr();
                    if !entry.is_null() {
                        let slot = restructured.bucket(restructured.index(reference.hash));
                        let head = slot.load(Ordering::Relaxed);
                        slot.store(
                            self.references.create(entry, reference.hash, head),
                            Ordering::Relaxed,
                        );
                    }
                    walk = reference.next;
                }
            }

            let old = self.table.swap(raw, Ordering::AcqRel);
            self.resize_threshold
                .store(threshold(len, self.load_factor), Ordering::Release);

            // Safety: The old table was unlinked by the swap above. Live entries
            // have moved to the new table, so only the references are retired.
            unsafe { retire_table(old, false, guard) };

            log::debug!("resized segment from {} to {len} buckets", len >> 1);
        } else if purged > 0 {
            for bucket in table.buckets.iter() {
                let head = bucket.load(Ordering::Acquire);
                if !has_reclaimed(head) {
                    continue;
                }

                // Rebuild the chain to the side, then publish it with one store so
                // readers never see a partially rebuilt bucket.
                let mut rebuilt = ptr::null_mut();
                let mut walk = head;
                while let Some(reference) = unsafe { walk.as_ref() } {
                    let entry = reference.entry_ptr();
                    if !entry.is_null() {
                        rebuilt = self.references.create(entry, reference.hash, rebuilt);
                    }
                    walk = reference.next;
                }

                bucket.store(rebuilt, Ordering::Release);

                // Safety: The old chain was unlinked by the store above.
                unsafe { retire_chain(head, false, guard) };
            }
        }

        self.count.store(count, Ordering::Release);

        if purged > 0 {
            log::trace!("purged {purged} reclaimed references, {count} remain");
        }
    }

    /// Invalidates every entry that the memory reclaimer may evict under `pressure`.
    ///
    /// Returns the number of references invalidated. They are purged on the next
    /// restructuring.
    pub fn reclaim(&self, pressure: MemoryPressure, guard: &impl Guard) -> usize {
        if self.count() == 0 {
            return 0;
        }

        let _lock = utils::lock(&self.lock);
        self.reclaim_locked(pressure, guard)
    }

    // Must be called with the lock held.
    fn reclaim_locked(&self, pressure: MemoryPressure, guard: &impl Guard) -> usize {
        let table = self.table(guard);
        let mut reclaimed = 0;

        for bucket in table.buckets.iter() {
            let mut walk = bucket.load(Ordering::Acquire);
            while let Some(reference) = unsafe { walk.as_ref() } {
                if let Some(entry) = reference.get(guard) {
                    if self.references.is_reclaimable(entry, pressure, guard)
                        && self.references.release(reference, guard)
                    {
                        reclaimed += 1;
                    }
                }
                walk = reference.next;
            }
        }

        reclaimed
    }

    // Pops every queued reference, returning how many there were.
    //
    // Must be called with the lock held.
    fn drain(&self, guard: &impl Guard) -> usize {
        let mut drained = 0;
        while self.references.poll(guard).is_some() {
            drained += 1;
        }
        drained
    }

    #[inline]
    fn at_threshold(&self, count: usize) -> bool {
        count > 0 && count >= self.resize_threshold.load(Ordering::Acquire)
    }
}

impl<K, V> Drop for Segment<K, V> {
    fn drop(&mut self) {
        let table = *self.table.get_mut();

        // Safety: We have unique access, and the map reclaimed all retired
        // objects before dropping its segments.
        unsafe {
            drop_chains(&*table);
            drop(Box::from_raw(table));
        }
    }
}

// Walks a chain for a live reference to `key`.
#[inline]
fn find_in_chain<'g, K, V, Q>(
    mut walk: *mut Reference<K, V>,
    hash: u32,
    key: &Q,
    guard: &'g impl Guard,
) -> Option<&'g Reference<K, V>>
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    // Safety: Chains are immutable apart from entry pointers, and references are
    // retired only after their chain has been unlinked, which the guard outlives.
    while let Some(reference) = unsafe { walk.as_ref() } {
        if reference.hash == hash {
            if let Some(entry) = reference.get(guard) {
                if entry.key.borrow() == key {
                    return Some(reference);
                }
            }
        }

        walk = reference.next;
    }

    None
}

#[inline]
fn threshold(len: usize, load_factor: f32) -> usize {
    (len as f64 * load_factor as f64) as usize
}

// Returns `true` if the chain holds a reclaimed reference.
fn has_reclaimed<K, V>(mut walk: *mut Reference<K, V>) -> bool {
    while let Some(reference) = unsafe { walk.as_ref() } {
        if reference.entry_ptr().is_null() {
            return true;
        }
        walk = reference.next;
    }

    false
}

// Retires every reference in a chain, along with their entries if `entries` is set.
//
// # Safety
//
// The chain must be unreachable for new readers.
unsafe fn retire_chain<K, V>(mut walk: *mut Reference<K, V>, entries: bool, guard: &impl Guard) {
    while !walk.is_null() {
        // Safety: The chain is intact until the retired references are reclaimed,
        // which cannot happen while we hold the guard.
        let reference = unsafe { &*walk };
        let next = reference.next;

        let entry = reference.entry_ptr();
        if entries && !entry.is_null() {
            unsafe {
                (*entry).mark_released();
                guard.defer_retire(entry, reference::reclaim_entry::<K, V>);
            }
        }

        unsafe { guard.defer_retire(walk, reference::reclaim_reference::<K, V>) };
        walk = next;
    }
}

// Retires a table and all of its chains.
//
// # Safety
//
// The table must be unreachable for new readers.
unsafe fn retire_table<K, V>(table: *mut Table<K, V>, entries: bool, guard: &impl Guard) {
    for bucket in unsafe { (*table).buckets.iter() } {
        unsafe { retire_chain(bucket.load(Ordering::Acquire), entries, guard) };
    }

    unsafe { guard.defer_retire(table, reclaim::boxed::<Table<K, V>>) };
}

// Frees every reference in the table and the entries they own.
//
// # Safety
//
// No other thread may access the table, now or later.
unsafe fn drop_chains<K, V>(table: &Table<K, V>) {
    for bucket in table.buckets.iter() {
        let mut walk = bucket.load(Ordering::Relaxed);
        while !walk.is_null() {
            let reference = unsafe { Box::from_raw(walk) };

            let entry = reference.entry_ptr();
            if !entry.is_null() {
                unsafe { drop(Box::from_raw(entry)) };
            }

            walk = reference.next;
        }
    }
}
