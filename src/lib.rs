#![doc = include_str!("../README.md")]

mod map;
mod raw;

#[cfg(feature = "serde")]
mod serde_impls;

pub use map::{
    BuildError, Iter, Keys, MemoryPressure, ReferenceMap, ReferenceMapBuilder, ReferenceType,
    Values, DEFAULT_CONCURRENCY_LEVEL, DEFAULT_INITIAL_CAPACITY, DEFAULT_LOAD_FACTOR,
};
pub use raw::MAXIMUM_CONCURRENCY_LEVEL;
pub use seize::{Collector, Guard, LocalGuard, OwnedGuard};
