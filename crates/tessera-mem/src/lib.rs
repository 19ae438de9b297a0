//! `tessera-mem`: arena and pool memory management
//!
//! Low-level allocation primitives for latency-sensitive code that creates
//! large volumes of short-lived or recycled values:
//!
//! - **Blocks**: fixed-capacity, zero-initialized regions with aligned bump
//!   allocation
//! - **Heap**: power-of-two size classes with bounded lock-free pools of idle
//!   blocks
//! - **Arenas**: growing chains of heap blocks, released all at once
//!   (`Arena` for one writer, `SyncArena` for many)
//! - **Free lists**: lock-free recycling of same-shaped values inside an
//!   arena, with an RAII `Pool` on top
//!
//! # Architecture
//!
//! ```text
//! Pool ──► FreeList ──► Arena / SyncArena ──► Heap ──► Block
//! ```
//!
//! The [`Heap`] is the only component meant to be shared process-wide.
//! Arenas and free lists are owned by one caller; their memory goes back to
//! the heap only when the arena is reset, freed or dropped.
//!
//! # Example
//!
//! ```rust
//! use tessera_mem::{Arena, Heap};
//!
//! let heap = Heap::new();
//! let mut arena = Arena::with_capacity(&heap, 4096);
//!
//! let buf = arena.bytes(128);
//! buf[0] = 1;
//! assert_eq!(arena.len(), 128);
//!
//! arena.reset();
//! assert_eq!(arena.cap(), 4096);
//! ```
//!
//! # Features
//!
//! - `global-heap` (default): process-wide [`global_heap`]
//! - `arena_backtrace`: report where a leaked arena was created
//! - `serde`: (de)serialize the configuration types

pub mod arena;
pub mod block;
pub mod config;
pub mod error;
pub mod freelist;
pub mod heap;
pub mod pool;
pub mod sync_arena;

// Re-export commonly used types
pub use arena::{Arena, ArenaState, ArenaStats, BumpAlloc};
pub use block::{ALIGNMENT, BLOCK_ALIGN, Block};
pub use config::{ArenaConfig, FreeListConfig, HeapConfig};
pub use error::{Error, Result};
pub use freelist::{FreeList, FreeListStats, Recycled};
#[cfg(feature = "global-heap")]
pub use heap::global_heap;
pub use heap::{Heap, HeapStats};
pub use pool::{Pool, Pooled};
pub use sync_arena::{SyncArena, SyncArenaGuard};
