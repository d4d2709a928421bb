use std::hash::{BuildHasher, Hash};
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use seize::Guard;

use super::reference::{Entry, Reference};
use super::segment::{Expected, Table, Task};
use super::ReferenceMap;

// An iterator over the live entries of a map.
//
// Walks segments in order, then buckets, then chains, loading each bucket
// array and chain head only when it is reached.
pub struct Iter<'g, K, V, S, G> {
    map: &'g ReferenceMap<K, V, S>,
    guard: &'g G,

    // The next segment to visit.
    segment: usize,

    // The bucket array of the current segment.
    table: Option<&'g Table<K, V>>,

    // The next bucket to visit in the current table.
    bucket: usize,

    // The next reference in the current chain.
    reference: *mut Reference<K, V>,

    // The entry and value returned by the last call to `next`.
    last: Option<(&'g Entry<K, V>, &'g V)>,
}

impl<'g, K, V, S, G> Iter<'g, K, V, S, G>
where
    G: Guard,
{
    pub fn new(map: &'g ReferenceMap<K, V, S>, guard: &'g G) -> Iter<'g, K, V, S, G> {
        Iter {
            map,
            guard,
            segment: 0,
            table: None,
            bucket: 0,
            reference: ptr::null_mut(),
            last: None,
        }
    }
}

impl<'g, K, V, S, G> Iter<'g, K, V, S, G>
where
    K: Hash + Eq,
    S: BuildHasher,
    G: Guard,
{
    /// Removes the entry returned by the last call to `next` from the map.
    ///
    /// Returns the removed value, or `None` if nothing was returned yet, the entry
    /// was already removed, or its value has since been replaced.
    pub fn remove_last(&mut self) -> Option<Arc<V>> {
        let (entry, value) = self.last.take()?;
        self.map.execute::<K>(Task::Remove {
            key: &entry.key,
            expected: Some(Expected::identity(value)),
        })
    }
}

impl<'g, K, V, S, G> Iterator for Iter<'g, K, V, S, G>
where
    G: Guard,
{
    type Item = (&'g K, Arc<V>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // Walk the current chain, skipping reclaimed references.
            //
            // Safety: We loaded the chain head under the guard. Chains are immutable
            // apart from entry pointers and are retired only after being unlinked.
            if let Some(reference) = unsafe { self.reference.as_ref() } {
                self.reference = reference.next;

                if let Some(entry) = reference.get(self.guard) {
                    let (value, shared) = entry.load(self.guard);
                    self.last = Some((entry, value));
                    return Some((&entry.key, shared));
                }

                continue;
            }

            // Move to the next bucket of this segment.
            if let Some(table) = self.table {
                if self.bucket < table.len() {
                    self.reference = self
                        .guard
                        .protect(table.bucket(self.bucket), Ordering::Acquire);
                    self.bucket += 1;
                    continue;
                }
            }

            // Move to the next segment, or finish.
            let segment = self.map.segments.get(self.segment)?;
            self.segment += 1;
            self.table = Some(segment.table(self.guard));
            self.bucket = 0;
        }
    }
}
