#![allow(dead_code)]

use refmap::{ReferenceMap, ReferenceType};

// Run the test on different configurations of a `ReferenceMap`.
pub fn with_map<K, V>(mut test: impl FnMut(&dyn Fn() -> ReferenceMap<K, V>)) {
    init_logger();

    // A single segment, so every operation contends on one lock and resizes often.
    if !cfg!(refmap_stress) {
        test(
            &(|| {
                ReferenceMap::builder()
                    .concurrency_level(1)
                    .capacity(1)
                    .build()
            }),
        );
    }

    // The default configuration with soft references.
    test(&(|| ReferenceMap::new()));

    // Many small segments with an eager load factor. Weak maps evict on insert,
    // so the shared tests stay on soft references.
    test(
        &(|| {
            ReferenceMap::builder()
                .concurrency_level(64)
                .load_factor(0.5)
                .reference_type(ReferenceType::Soft)
                .build()
        }),
    );
}

// Installs a logger that prints through the test harness, once.
//
// Run with `RUST_LOG=refmap=trace` to see resizes and purges.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Returns the number of threads to use for stress testing.
pub fn threads() -> usize {
    if cfg!(miri) {
        2
    } else {
        num_cpus::get_physical().next_power_of_two()
    }
}
