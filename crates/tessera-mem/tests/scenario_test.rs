//! End-to-end scenarios across heap, arena and free list.
//!
//! Run with: `cargo test --test scenario_test`

mod common;

use common::{MAX_CLASS, scenario_heap};
use std::ptr;
use std::sync::Arc;
use tessera_mem::{
    Arena, ArenaConfig, ArenaState, Block, FreeList, Heap, Pool, SyncArena,
};

// ============================================================================
// Heap Size Classes
// ============================================================================

#[test]
fn test_heap_class_boundaries() {
    let heap = scenario_heap();

    assert_eq!(heap.alloc(0).capacity(), 1024);
    assert_eq!(heap.alloc(1).capacity(), 1024);
    assert_eq!(heap.alloc(1024).capacity(), 1024);
    assert_eq!(heap.alloc(1025).capacity(), 2048);
    assert_eq!(heap.alloc(MAX_CLASS).capacity(), MAX_CLASS);
}

#[test]
fn test_heap_oversized_block_is_not_pooled() {
    let heap = scenario_heap();

    let block = heap.alloc(MAX_CLASS + 1);
    assert_eq!(block.capacity(), MAX_CLASS + 1);
    heap.free(block);

    let stats = heap.stats();
    assert_eq!(stats.oversized, 1);
    assert_eq!(stats.pooled_blocks, 0);
    assert_eq!(stats.discarded_frees, 1);
}

#[test]
fn test_heap_reuses_pooled_block() {
    let heap = scenario_heap();

    let mut block = heap.alloc(3000);
    let addr = block.as_ptr().addr();
    block.grow(64).unwrap().fill(0xEE);
    heap.free(block);

    let block = heap.alloc(4000);
    assert_eq!(block.as_ptr().addr(), addr);
    assert_eq!(block.used(), 0);
    assert_eq!(heap.stats().hits, 1);
}

#[test]
fn test_heap_retention_is_bounded() {
    let heap = Heap::with_config(
        tessera_mem::HeapConfig::default()
            .with_max_block_size(MAX_CLASS)
            .with_max_pooled_blocks(2),
    )
    .unwrap();

    let blocks: Vec<Block> = (0..5).map(|_| heap.alloc(1024)).collect();
    heap.free_many(blocks);

    let stats = heap.stats();
    assert_eq!(stats.pooled_blocks, 2);
    assert_eq!(stats.pooled_frees, 2);
    assert_eq!(stats.discarded_frees, 3);

    assert_eq!(heap.purge(), 2048);
    assert_eq!(heap.stats().pooled_blocks, 0);
}

// ============================================================================
// Arena Growth
// ============================================================================

#[test]
fn test_arena_first_block_and_doubling() {
    let heap = scenario_heap();
    let arena = Arena::new(&heap);

    arena.alloc(1);
    assert_eq!(arena.cap(), 1024);
    assert_eq!(arena.block_count(), 1);

    arena.alloc(1024);
    assert_eq!(arena.block_count(), 2);
    assert_eq!(arena.cap(), 3072);
    assert_eq!(arena.len(), 1 + 1024);
}

#[test]
fn test_arena_growth_respects_cap_but_fits_request() {
    let heap = scenario_heap();
    let config = ArenaConfig::default().with_max_growth_size(2048);
    let arena = Arena::with_config(&heap, config).unwrap();

    arena.alloc(2000);
    arena.alloc(2000);
    arena.alloc(2000);
    // 2048 each: doubling is capped at 2048.
    assert_eq!(arena.cap(), 3 * 2048);

    arena.alloc(10_000);
    assert_eq!(arena.cap(), 3 * 2048 + 16 * 1024);
}

#[test]
fn test_arena_reset_reuses_initial_block_without_heap_round_trip() {
    let heap = scenario_heap();
    let mut arena = Arena::with_capacity(&heap, 8192);

    for _ in 0..10 {
        arena.alloc(4096);
    }
    assert!(arena.block_count() > 1);

    arena.reset();
    assert_eq!(arena.block_count(), 1);
    assert_eq!(arena.cap(), 8192);

    let allocs = heap.stats().allocs;
    arena.alloc(8192);
    assert_eq!(heap.stats().allocs, allocs);
}

#[test]
fn test_arena_free_twice_releases_once() {
    let heap = scenario_heap();
    let mut arena = Arena::new(&heap);
    arena.alloc(10);
    arena.alloc(5000);

    arena.free();
    let after_first = heap.stats();
    arena.free();
    assert_eq!(heap.stats(), after_first);
    assert_eq!(after_first.pooled_blocks, 2);
    assert_eq!(arena.state(), ArenaState::Freed);
    assert_eq!(arena.cap(), 0);
}

#[test]
fn test_arena_memory_is_zero_after_reuse() {
    let heap = scenario_heap();

    {
        let arena = Arena::new(&heap);
        arena.bytes(900).fill(0xAB);
    }
    assert_eq!(heap.stats().pooled_blocks, 1);

    let arena = Arena::new(&heap);
    assert!(arena.bytes(900).iter().all(|&b| b == 0));
    assert_eq!(heap.stats().hits, 1);
}

#[test]
fn test_arena_pin_keeps_shared_handle_alive() {
    let heap = scenario_heap();
    let mut arena = Arena::new(&heap);
    let shared = Arc::new(String::from("pinned"));

    let pinned = arena.pin(Arc::clone(&shared));
    assert_eq!(pinned.as_str(), "pinned");
    assert_eq!(Arc::strong_count(&shared), 2);

    arena.reset();
    assert_eq!(Arc::strong_count(&shared), 1);
}

// ============================================================================
// Free Lists and Pools
// ============================================================================

#[test]
fn test_free_list_recycles_same_storage() {
    let heap = scenario_heap();
    let arena = Arena::new(&heap);
    let list = FreeList::<[u64; 3], _>::new(&arena);

    let mut x = list.get();
    *x = [1, 2, 3];
    let addr = ptr::from_ref::<[u64; 3]>(&x).addr();
    list.put(x);

    let y = list.get();
    assert_eq!(ptr::from_ref::<[u64; 3]>(&y).addr(), addr);
    assert_eq!(*y, [0; 3]);
}

#[test]
fn test_free_list_never_returns_blocks_to_heap() {
    let heap = scenario_heap();
    let mut arena = Arena::new(&heap);

    {
        let list = FreeList::<[u8; 256], _>::new(&arena);
        let items: Vec<_> = (0..16).map(|_| list.get()).collect();
        for item in items {
            list.put(item);
        }
        assert_eq!(heap.stats().pooled_frees, 0);
    }

    arena.reset();
    assert!(heap.stats().pooled_frees > 0);
}

#[test]
fn test_pool_on_sync_arena() {
    let heap = scenario_heap();
    let arena = SyncArena::with_capacity(&heap, 4096);
    let pool = Pool::<u32, _>::new(&arena);

    for round in 0..3u32 {
        let mut guard = pool.get();
        assert_eq!(*guard, 0);
        *guard = round + 1;
    }

    let stats = pool.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 2);
}

#[cfg(feature = "global-heap")]
#[test]
fn test_global_heap_backs_arenas() {
    let heap = tessera_mem::global_heap();
    let arena = Arena::new(heap);
    let value = arena.alloc_value(7u16);
    assert_eq!(*value, 7);
    assert!(ptr::eq(arena.heap(), tessera_mem::global_heap()));
}
