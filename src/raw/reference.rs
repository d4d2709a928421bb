use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use seize::{Collector, Guard};

use crate::map::{MemoryPressure, ReferenceType};

// A key and its value slot.
//
// The value is an `Arc<V>` stored as a raw pointer so that it can be replaced
// atomically while lock-free readers clone it.
//
// Restructuring leaves old references pointing at the same entry, so removal
// is recorded on the entry itself and every reference to it sees it.
pub struct Entry<K, V> {
    pub key: K,
    value: AtomicPtr<V>,
    released: AtomicBool,
}

impl<K, V> Entry<K, V> {
    pub fn new(key: K, value: Arc<V>) -> Entry<K, V> {
        Entry {
            key,
            value: AtomicPtr::new(Arc::into_raw(value).cast_mut()),
            released: AtomicBool::new(false),
        }
    }

    /// Returns `true` once the entry has been removed from the map.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    // Marks the entry as removed. It must be retired right after.
    #[inline]
    pub fn mark_released(&self) {
        self.released.store(true, Ordering::Release);
    }

    /// Returns a new strong reference to the current value.
    #[inline]
    pub fn value(&self, guard: &impl Guard) -> Arc<V> {
        self.load(guard).1
    }

    /// Borrows the current value and returns a strong reference to that same value.
    #[inline]
    pub fn load<'g>(&self, guard: &'g impl Guard) -> (&'g V, Arc<V>) {
        let value = guard.protect(&self.value, Ordering::Acquire);

        // Safety: The slot always holds a pointer from `Arc::into_raw`, and replaced
        // values are retired, so the pointer is live for as long as we hold the guard.
        unsafe {
            Arc::increment_strong_count(value);
            (&*value, Arc::from_raw(value))
        }
    }

    /// Borrows the current value for the lifetime of the guard.
    #[inline]
    pub fn value_ref<'g>(&self, guard: &'g impl Guard) -> &'g V {
        // Safety: See `Entry::value`.
        unsafe { &*guard.protect(&self.value, Ordering::Acquire) }
    }

    /// Replaces the value, retiring the previous one.
    ///
    /// Must be called with the owning segment locked.
    pub fn set_value(&self, value: Arc<V>, guard: &impl Guard) {
        let old = self
            .value
            .swap(Arc::into_raw(value).cast_mut(), Ordering::AcqRel);

        // Safety: `old` was unlinked by the swap above. Readers that loaded it
        // hold guards that outlive its retirement.
        unsafe { guard.defer_retire(old, reclaim_value::<V>) };
    }

    /// Returns `true` if nothing outside of the map holds the value.
    pub fn is_unreferenced(&self, guard: &impl Guard) -> bool {
        let value = guard.protect(&self.value, Ordering::Acquire);

        // Safety: See `Entry::value`. The `Arc` is never dropped here.
        let value = ManuallyDrop::new(unsafe { Arc::from_raw(value) });
        Arc::strong_count(&value) == 1
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        // Safety: The slot owns one strong reference.
        unsafe { drop(Arc::from_raw(*self.value.get_mut())) }
    }
}

// A reclaimable reference to an entry, linked into a bucket chain.
//
// Everything but the entry pointer is immutable. Restructuring a chain creates
// fresh references rather than relinking these.
pub struct Reference<K, V> {
    /// The mixed hash of the entry's key.
    pub hash: u32,

    /// The next reference in the bucket at the time this one was created.
    pub next: *mut Reference<K, V>,

    /// The entry, or null once the reference has been reclaimed or released.
    entry: AtomicPtr<Entry<K, V>>,

    /// Link in the eviction-notification queue.
    queued: AtomicPtr<Reference<K, V>>,
}

impl<K, V> Reference<K, V> {
    /// Returns the entry, or `None` if it was reclaimed or removed.
    ///
    /// Callers must treat `None` as absence, even directly after a successful lookup.
    #[inline]
    pub fn get<'g>(&self, guard: &'g impl Guard) -> Option<&'g Entry<K, V>> {
        let entry = guard.protect(&self.entry, Ordering::Acquire);

        // Safety: Entries are retired after being released, and we loaded the
        // pointer under the guard.
        let entry = unsafe { entry.as_ref() }?;

        // A stale reference from before a restructure still points at the entry
        // after the current one has released it.
        if entry.is_released() {
            return None;
        }

        Some(entry)
    }

    // Loads the entry pointer and leaves it in place.
    //
    // Used under the lock to copy live entries into rebuilt chains, and when
    // dropping. The pointer is null once this reference has been released.
    #[inline]
    pub fn entry_ptr(&self) -> *mut Entry<K, V> {
        self.entry.load(Ordering::Acquire)
    }
}

/// Produces references of one strength for a segment, and collects the
/// references whose entries have since been reclaimed.
pub struct ReferenceManager<K, V> {
    kind: ReferenceType,

    // A lock-free intrusive stack of reclaimed references.
    //
    // A reference is pushed at most once, when its entry pointer is cleared,
    // and is not retired until it has been popped, so pops are free of ABA.
    queue: AtomicPtr<Reference<K, V>>,
}

impl<K, V> ReferenceManager<K, V> {
    pub fn new(kind: ReferenceType) -> ReferenceManager<K, V> {
        ReferenceManager {
            kind,
            queue: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Allocates a new reference to `entry` in front of `next`.
    #[inline]
    pub fn create(
        &self,
        entry: *mut Entry<K, V>,
        hash: u32,
        next: *mut Reference<K, V>,
    ) -> *mut Reference<K, V> {
        Box::into_raw(Box::new(Reference {
            hash,
            next,
            entry: AtomicPtr::new(entry),
            queued: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// Returns `true` if any reclaimed references are waiting to be purged.
    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.queue.load(Ordering::Acquire).is_null()
    }

    /// Pops one reclaimed reference from the queue.
    ///
    /// Each reclaimed reference is returned at most once.
    pub fn poll(&self, guard: &impl Guard) -> Option<*mut Reference<K, V>> {
        loop {
            let head = guard.protect(&self.queue, Ordering::Acquire);
            if head.is_null() {
                return None;
            }

            // Safety: Queued references are not retired before they are popped,
            // and the guard protects `head` from a concurrent pop and retire.
            let next = unsafe { (*head).queued.load(Ordering::Acquire) };

            if self
                .queue
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(head);
            }
        }
    }

    /// Invalidates the reference and its entry, and queues the reference for purging.
    ///
    /// Returns `false` if the reference was already invalidated. Must be called with
    /// the owning segment locked.
    pub fn release(&self, reference: &Reference<K, V>, guard: &impl Guard) -> bool {
        let entry = reference.entry.swap(ptr::null_mut(), Ordering::AcqRel);
        if entry.is_null() {
            return false;
        }

        // Safety: Only the current reference to an entry is ever released, and we just
        // took its pointer. Stale references left behind by restructuring see the mark,
        // and they were unlinked before this point, so their readers hold guards.
        unsafe {
            (*entry).mark_released();
            guard.defer_retire(entry, reclaim_entry::<K, V>);
        }

        let node = reference as *const Reference<K, V> as *mut Reference<K, V>;
        loop {
            let head = self.queue.load(Ordering::Acquire);
            reference.queued.store(head, Ordering::Relaxed);

            if self
                .queue
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Returns `true` if the memory reclaimer may evict this entry under `pressure`.
    pub fn is_reclaimable(
        &self,
        entry: &Entry<K, V>,
        pressure: MemoryPressure,
        guard: &impl Guard,
    ) -> bool {
        let eligible = match (self.kind, pressure) {
            (ReferenceType::Weak, _) => true,
            (ReferenceType::Soft, MemoryPressure::High) => true,
            (ReferenceType::Soft, MemoryPressure::Low) => false,
        };

        eligible && entry.is_unreferenced(guard)
    }
}

// Reclaimers passed to `seize`.

pub unsafe fn reclaim_value<V>(value: *mut V, _collector: &Collector) {
    unsafe { drop(Arc::from_raw(value)) }
}

pub unsafe fn reclaim_entry<K, V>(entry: *mut Entry<K, V>, _collector: &Collector) {
    unsafe { drop(Box::from_raw(entry)) }
}

// Frees the reference only. The entry is owned by whichever reference replaced it.
pub unsafe fn reclaim_reference<K, V>(reference: *mut Reference<K, V>, _collector: &Collector) {
    unsafe { drop(Box::from_raw(reference)) }
}
