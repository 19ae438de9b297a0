// Shared fixtures for the integration tests.

#![allow(dead_code)]

use tessera_mem::{Heap, HeapConfig};

/// Largest class used by the scenario tests (16 MiB).
pub const MAX_CLASS: usize = 1 << 24;

/// Creates a heap with classes 1 KiB ..= 16 MiB.
pub fn scenario_heap() -> Heap {
    Heap::with_config(HeapConfig::default().with_max_block_size(MAX_CLASS))
        .expect("scenario heap config is valid")
}

/// Returns true if `[a, a + a_len)` and `[b, b + b_len)` overlap.
pub fn overlaps(a: usize, a_len: usize, b: usize, b_len: usize) -> bool {
    a_len > 0 && b_len > 0 && a < b + b_len && b < a + a_len
}
