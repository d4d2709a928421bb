// adapted from: https://github.com/jonhoo/flurry/tree/main/tests/jdk

use refmap::{MemoryPressure, ReferenceMap, ReferenceType};
use rand::prelude::*;

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

mod common;
use common::{threads, with_map};

#[test]
fn contains_key_stress() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 64 };
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 1 << 10 };
    const ROUNDS: usize = if cfg!(miri) { 1 } else { 32 };

    with_map(|map| {
        let map = map();
        let mut content = [0; ENTRIES];

        for k in 0..ENTRIES {
            map.insert(k, k);
            content[k] = k;
        }

        for _ in 0..ITERATIONS {
            let threads = threads();
            let barrier = Barrier::new(threads);
            thread::scope(|s| {
                for _ in 0..threads {
                    s.spawn(|| {
                        barrier.wait();
                        for i in 0..ENTRIES * ROUNDS {
                            let key = content[i % content.len()];
                            assert!(map.contains_key(&key));
                        }
                    });
                }
            });
        }
    });
}

#[test]
fn replace_stress() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 32 };
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 1 << 12 };

    with_map(|map| {
        let map = map();

        for i in 0..ENTRIES {
            map.insert(i, 0);
        }

        for t in 0..ITERATIONS {
            let threads = threads();
            let barrier = Barrier::new(threads);

            thread::scope(|s| {
                for _ in 0..threads {
                    s.spawn(|| {
                        barrier.wait();
                        for i in 0..ENTRIES {
                            // Increment with a compare-and-swap loop.
                            loop {
                                let current = map.get(&i).unwrap();
                                if map.replace_if_eq(&i, &current, *current + 1) {
                                    break;
                                }
                            }
                        }
                    });
                }
            });

            for i in 0..ENTRIES {
                assert_eq!(*map.get(&i).unwrap(), threads * (t + 1));
            }
        }
    });
}

#[test]
fn insert_stress() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 32 };
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 1 << 12 };

    #[derive(Hash, PartialEq, Eq, Clone, Copy)]
    struct KeyVal {
        _data: usize,
    }

    impl KeyVal {
        pub fn new() -> Self {
            let mut rng = rand::thread_rng();
            Self { _data: rng.gen() }
        }
    }

    with_map(|map| {
        for _ in 0..ITERATIONS {
            let map = map();
            let threads = threads();
            let barrier = Barrier::new(threads);
            thread::scope(|s| {
                for _ in 0..threads {
                    s.spawn(|| {
                        barrier.wait();
                        for _ in 0..ENTRIES {
                            let key = KeyVal::new();
                            map.insert(key, key);
                            assert!(map.contains_key(&key));
                        }
                    });
                }
            });
            assert_eq!(map.len(), ENTRIES * threads);
        }
    });
}

#[test]
fn mixed_stress() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 16 };
    const CHUNK: usize = if cfg!(miri) { 48 } else { 1 << 12 };

    let run = |barrier: &Barrier, t: usize, map: &ReferenceMap<usize, usize>, threads: usize| {
        barrier.wait();

        let (start, end) = (CHUNK * t, CHUNK * (t + 1));

        for i in start..end {
            assert_eq!(map.insert(i, i + 1), None);
        }

        for i in start..end {
            assert_eq!(map.get(&i).as_deref(), Some(&(i + 1)));
        }

        for i in start..end {
            assert_eq!(map.replace(&i, i).as_deref(), Some(&(i + 1)));
        }

        for i in start..end {
            assert_eq!(map.remove(&i).as_deref(), Some(&i));
        }

        for i in start..end {
            assert_eq!(map.get(&i), None);
        }

        for i in start..end {
            assert_eq!(map.insert_if_absent(i, i + 1), None);
        }

        for i in start..end {
            assert_eq!(map.get(&i).as_deref(), Some(&(i + 1)));
        }

        let guard = map.guard();
        for (&k, v) in map.iter(&guard) {
            assert!(k < CHUNK * threads);
            assert!(*v == k || *v == k + 1);
        }
    };

    with_map(|map| {
        for _ in 0..ITERATIONS {
            let map = map();
            let threads = threads();
            let barrier = Barrier::new(threads);

            thread::scope(|s| {
                for t in 0..threads {
                    let map = &map;
                    let barrier = &barrier;

                    s.spawn(move || run(barrier, t, map, threads));
                }
            });

            let v: Vec<_> = (0..CHUNK * threads).map(|i| (i, i + 1)).collect();
            let guard = map.guard();
            let mut got: Vec<_> = map.iter(&guard).map(|(&k, v)| (k, *v)).collect();
            got.sort();
            assert_eq!(v, got);
        }
    });
}

#[test]
fn get_or_insert_with_stress() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 16 };
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 1 << 12 };

    with_map::<usize, usize>(|map| {
        for _ in 0..ITERATIONS {
            let map = map();
            let threads = threads();
            let barrier = Barrier::new(threads);

            let winners: Vec<Vec<Arc<usize>>> = thread::scope(|s| {
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        let (map, barrier) = (&map, &barrier);
                        s.spawn(move || {
                            barrier.wait();
                            (0..ENTRIES)
                                .map(|i| map.get_or_insert_with(i, || i * threads + t))
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();

                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            // Every thread observed the same value for each key.
            for i in 0..ENTRIES {
                let value = map.get(&i).unwrap();
                for observed in &winners {
                    assert!(Arc::ptr_eq(&observed[i], &value));
                }
            }
            assert_eq!(map.len(), ENTRIES);
        }
    });
}

#[test]
#[cfg_attr(miri, ignore)]
fn reclaim_stress() {
    const ITERATIONS: usize = 8;
    const CHUNK: usize = 1 << 12;

    for reference_type in [ReferenceType::Soft, ReferenceType::Weak] {
        for _ in 0..ITERATIONS {
            let map: ReferenceMap<usize, usize> = ReferenceMap::builder()
                .reference_type(reference_type)
                .concurrency_level(4)
                .build();

            let threads = threads();
            let barrier = Barrier::new(threads + 1);
            let done = AtomicBool::new(false);

            thread::scope(|s| {
                // Reclaims entries under alternating pressure until the workers finish.
                s.spawn(|| {
                    barrier.wait();
                    let mut pressure = MemoryPressure::Low;
                    while !done.load(Ordering::Relaxed) {
                        map.reclaim(pressure);
                        pressure = match pressure {
                            MemoryPressure::Low => MemoryPressure::High,
                            MemoryPressure::High => MemoryPressure::Low,
                        };
                    }
                });

                let workers: Vec<_> = (0..threads)
                    .map(|t| {
                        let (map, barrier) = (&map, &barrier);
                        s.spawn(move || {
                            barrier.wait();
                            let (start, end) = (CHUNK * t, CHUNK * (t + 1));

                            // Values we hold on to must never be reclaimed.
                            let mut held = Vec::new();
                            for i in start..end {
                                if i % 2 == 0 {
                                    let value = Arc::new(i);
                                    map.insert_arc(i, value.clone());
                                    held.push((i, value));
                                } else {
                                    map.insert(i, i);
                                }
                            }

                            for (i, value) in &held {
                                assert_eq!(map.get(i).as_ref(), Some(value));
                            }

                            // Entries we let go of may disappear at any time, but never
                            // with a different value.
                            for i in (start..end).filter(|i| i % 2 == 1) {
                                if let Some(value) = map.get(&i) {
                                    assert_eq!(*value, i);
                                }
                            }

                            held
                        })
                    })
                    .collect();

                let held: Vec<_> = workers.into_iter().map(|h| h.join().unwrap()).collect();
                done.store(true, Ordering::Relaxed);

                for (i, value) in held.iter().flatten() {
                    assert!(Arc::ptr_eq(&map.get(i).unwrap(), value));
                }
            });

            // Everything left over is unreferenced.
            map.reclaim(MemoryPressure::High);
            map.purge_unreferenced_entries();
            assert_eq!(map.len(), 0);
        }
    }
}

const SIZE: usize = if cfg!(miri) { 12 } else { 50_000 };

// there must be more things absent than present!
const ABSENT_SIZE: usize = if cfg!(miri) { 1 << 5 } else { 1 << 17 };
const ABSENT_MASK: usize = ABSENT_SIZE - 1;

fn t1<K, V>(map: &ReferenceMap<K, V>, keys: &[K], expect: usize)
where
    K: Sync + Send + Clone + Hash + Ord,
    V: Sync + Send,
{
    let mut sum = 0;
    let iters = 4;
    for _ in 0..iters {
        for key in keys {
            if map.get(key).is_some() {
                sum += 1;
            }
        }
    }
    assert_eq!(sum, expect * iters);
}

fn t2<K>(map: &ReferenceMap<K, usize>, keys: &[K], expect: usize)
where
    K: Sync + Send + Copy + Hash + Ord + std::fmt::Display,
{
    let mut sum = 0;
    for key in keys {
        if map.remove(key).is_some() {
            sum += 1;
        }
    }
    assert_eq!(sum, expect);
}

fn t3<K>(map: &ReferenceMap<K, usize>, keys: &[K], expect: usize)
where
    K: Sync + Send + Copy + Hash + Ord,
{
    let mut sum = 0;
    for i in 0..keys.len() {
        if map.insert(keys[i], 0).is_none() {
            sum += 1;
        }
    }
    assert_eq!(sum, expect);
}

fn t4<K>(map: &ReferenceMap<K, usize>, keys: &[K], expect: usize)
where
    K: Sync + Send + Copy + Hash + Ord,
{
    let mut sum = 0;
    for i in 0..keys.len() {
        if map.contains_key(&keys[i]) {
            sum += 1;
        }
    }
    assert_eq!(sum, expect);
}

fn t5<K>(map: &ReferenceMap<K, usize>, keys: &[K], expect: usize)
where
    K: Sync + Send + Copy + Hash + Ord,
{
    let mut sum = 0;
    let mut i = keys.len() as isize - 2;
    while i >= 0 {
        if map.remove(&keys[i as usize]).is_some() {
            sum += 1;
        }
        i -= 2;
    }
    assert_eq!(sum, expect);
}

fn t6<K, V>(map: &ReferenceMap<K, V>, keys1: &[K], keys2: &[K], expect: usize)
where
    K: Sync + Send + Clone + Hash + Ord,
    V: Sync + Send,
{
    let mut sum = 0;
    for i in 0..expect {
        if map.get(&keys1[i]).is_some() {
            sum += 1;
        }
        if map.get(&keys2[i & ABSENT_MASK]).is_some() {
            sum += 1;
        }
    }
    assert_eq!(sum, expect);
}

fn t7<K>(map: &ReferenceMap<K, usize>, k1: &[K], k2: &[K])
where
    K: Sync + Send + Copy + Hash + Ord,
{
    let mut sum = 0;
    for i in 0..k1.len() {
        if map.contains_key(&k1[i]) {
            sum += 1;
        }
        if map.contains_key(&k2[i]) {
            sum += 1;
        }
    }
    assert_eq!(sum, k1.len());
}

fn ittest1<K>(map: &ReferenceMap<K, usize>, expect: usize)
where
    K: Sync + Send + Copy + Hash + Eq,
{
    let mut sum = 0;
    let guard = map.guard();
    for _ in map.keys(&guard) {
        sum += 1;
    }
    assert_eq!(sum, expect);
}

fn ittest2<K>(map: &ReferenceMap<K, usize>, expect: usize)
where
    K: Sync + Send + Copy + Hash + Eq,
{
    let mut sum = 0;
    let guard = map.guard();
    for _ in map.values(&guard) {
        sum += 1;
    }
    assert_eq!(sum, expect);
}

fn ittest3<K>(map: &ReferenceMap<K, usize>, expect: usize)
where
    K: Sync + Send + Copy + Hash + Eq,
{
    let mut sum = 0;
    let guard = map.guard();
    for _ in map.iter(&guard) {
        sum += 1;
    }
    assert_eq!(sum, expect);
}

#[test]
fn everything() {
    let mut rng = rand::thread_rng();

    with_map(|map| {
        let map = map();
        let mut keys: Vec<_> = (0..ABSENT_SIZE + SIZE).collect();
        keys.shuffle(&mut rng);
        let absent_keys = &keys[0..ABSENT_SIZE];
        let keys = &keys[ABSENT_SIZE..];

        // put (absent)
        t3(&map, keys, SIZE);
        // put (present)
        t3(&map, keys, 0);
        // contains_key (present & absent)
        t7(&map, keys, absent_keys);
        // contains_key (present)
        t4(&map, keys, SIZE);
        // contains_key (absent)
        t4(&map, absent_keys, 0);
        // get
        t6(&map, keys, absent_keys, SIZE);
        // get (present)
        t1(&map, keys, SIZE);
        // get (absent)
        t1(&map, absent_keys, 0);
        // remove (absent)
        t2(&map, absent_keys, 0);
        // remove (present)
        t5(&map, keys, SIZE / 2);
        // put (half present)
        t3(&map, keys, SIZE / 2);
        // iter, keys, values (present)
        ittest1(&map, SIZE);
        ittest2(&map, SIZE);
        ittest3(&map, SIZE);
    });
}
