#![no_main]

use libfuzzer_sys::fuzz_target;

use arbitrary::Arbitrary;
use refmap::{MemoryPressure, ReferenceMap, ReferenceType};
use std::collections::HashMap as StdHashMap;
use std::sync::Arc;

#[derive(Debug, Arbitrary)]
enum Operation<K, V> {
    Insert(K, V),
    InsertIfAbsent(K, V),
    Remove(K),
    RemoveIfEq(K, V),
    Replace(K, V),
    ReplaceIfEq(K, V, V),
    GetOrInsertWith(K, V),
    Get(K),
    Contains(K),
    Clear,
    Len,
    IsEmpty,
    Purge,
    Reclaim(bool),
    Hold(K),
    Release,
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    weak: bool,
    concurrency_level: u8,
    operations: Vec<Operation<u8, u32>>,
}

fn fuzz_map(input: FuzzInput) {
    let reference_type = if input.weak {
        ReferenceType::Weak
    } else {
        ReferenceType::Soft
    };

    let concurrency_level = usize::from(input.concurrency_level).max(1);

    // Weak maps evict unreferenced entries when a segment fills up, which the std
    // map cannot mirror, so they get room for every `u8` key in any one segment.
    let capacity = if input.weak {
        1024 * concurrency_level
    } else {
        1
    };

    let mut std_map = StdHashMap::new();
    let map = ReferenceMap::builder()
        .reference_type(reference_type)
        .concurrency_level(concurrency_level)
        .capacity(capacity)
        .build();

    // Values held outside of the map, which protect their entries from reclamation.
    let mut held: Vec<Arc<u32>> = Vec::new();

    for op in input.operations {
        match op {
            Operation::Insert(k, v) => {
                let std_result = std_map.insert(k, v);
                let result = map.insert(k, v);
                assert_eq!(std_result, result.as_deref().copied());
            }
            Operation::InsertIfAbsent(k, v) => {
                let std_result = std_map.get(&k).copied();
                if std_result.is_none() {
                    std_map.insert(k, v);
                }
                let result = map.insert_if_absent(k, v);
                assert_eq!(std_result, result.as_deref().copied());
            }
            Operation::Remove(k) => {
                let std_result = std_map.remove(&k);
                let result = map.remove(&k);
                assert_eq!(std_result, result.as_deref().copied());
            }
            Operation::RemoveIfEq(k, v) => {
                let std_result = std_map.get(&k) == Some(&v);
                if std_result {
                    std_map.remove(&k);
                }
                assert_eq!(std_result, map.remove_if_eq(&k, &v));
            }
            Operation::Replace(k, v) => {
                let std_result = std_map.get_mut(&k).map(|e| std::mem::replace(e, v));
                let result = map.replace(&k, v);
                assert_eq!(std_result, result.as_deref().copied());
            }
            Operation::ReplaceIfEq(k, expected, v) => {
                let std_result = match std_map.get_mut(&k) {
                    Some(e) if *e == expected => {
                        *e = v;
                        true
                    }
                    _ => false,
                };
                assert_eq!(std_result, map.replace_if_eq(&k, &expected, v));
            }
            Operation::GetOrInsertWith(k, v) => {
                let std_result = *std_map.entry(k).or_insert(v);
                assert_eq!(std_result, *map.get_or_insert_with(k, || v));
            }
            Operation::Get(k) => {
                assert_eq!(std_map.get(&k).copied(), map.get(&k).as_deref().copied());
            }
            Operation::Contains(k) => {
                assert_eq!(std_map.contains_key(&k), map.contains_key(&k));
            }
            Operation::Clear => {
                std_map.clear();
                map.clear();
            }
            Operation::Len => {
                map.purge_unreferenced_entries();
                assert_eq!(std_map.len(), map.len());
            }
            Operation::IsEmpty => {
                map.purge_unreferenced_entries();
                assert_eq!(std_map.is_empty(), map.is_empty());
            }
            Operation::Purge => map.purge_unreferenced_entries(),
            Operation::Reclaim(high) => {
                let pressure = if high {
                    MemoryPressure::High
                } else {
                    MemoryPressure::Low
                };

                let expected = match (reference_type, pressure) {
                    (ReferenceType::Soft, MemoryPressure::Low) => 0,
                    _ => {
                        let guard = map.guard();
                        map.iter(&guard)
                            .filter(|(_, value)| Arc::strong_count(value) == 2)
                            .count()
                    }
                };

                assert_eq!(map.reclaim(pressure), expected);

                // Mirror the eviction.
                let guard = map.guard();
                let live: StdHashMap<u8, u32> = map.iter(&guard).map(|(k, v)| (*k, *v)).collect();
                std_map.retain(|k, _| live.contains_key(k));
            }
            Operation::Hold(k) => {
                if let Some(value) = map.get(&k) {
                    held.push(value);
                }
            }
            Operation::Release => {
                held.pop();
            }
        }
    }

    // Final consistency checks
    for (k, v) in std_map.iter() {
        assert_eq!(Some(*v), map.get(k).as_deref().copied());
    }
    map.purge_unreferenced_entries();
    assert_eq!(std_map.len(), map.len());
    assert_eq!(std_map.is_empty(), map.is_empty());
}

fuzz_target!(|data: FuzzInput| {
    fuzz_map(data);
});
