//! Size-classed block pools.
//!
//! The [`Heap`] turns block allocation into amortized O(1) reuse. Capacities
//! are bucketed into power-of-two size classes between
//! [`HeapConfig::min_block_size`] and [`HeapConfig::max_block_size`]; each
//! class keeps a bounded, lock-free bag of idle zeroed blocks.
//!
//! # Design
//!
//! - **Class hit**: pop an idle block of the class capacity
//! - **Class miss**: allocate a fresh block of the class capacity
//! - **Oversized**: allocate a one-off block of exactly the requested size;
//!   it is never pooled
//! - **Release**: zero the block and push it back if its capacity is exactly
//!   a class capacity and the class has room; otherwise drop it
//!
//! Pools are unordered. Freeing a block does not guarantee the same block
//! comes back from the next allocation.
//!
//! # Example
//!
//! ```
//! use tessera_mem::Heap;
//!
//! let heap = Heap::new();
//!
//! let block = heap.alloc(1500);
//! assert_eq!(block.capacity(), 2048);
//!
//! heap.free(block);
//! assert_eq!(heap.stats().pooled_blocks, 1);
//! ```

use crate::block::Block;
use crate::config::HeapConfig;
use crate::error::Result;
use crossbeam::queue::ArrayQueue;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(feature = "global-heap")]
use std::sync::OnceLock;
use tracing::{debug, trace};

/// Idle blocks of one capacity.
struct SizeClass {
    capacity: usize,
    idle: ArrayQueue<Block>,
}

/// Registry of per-size-class block pools.
///
/// A heap is safe to share between threads; every operation takes `&self`.
pub struct Heap {
    config: HeapConfig,
    /// log2 of the smallest class capacity.
    min_shift: u32,
    classes: Box<[SizeClass]>,
    counters: HeapCounters,
}

#[derive(Default)]
struct HeapCounters {
    allocs: AtomicUsize,
    hits: AtomicUsize,
    misses: AtomicUsize,
    oversized: AtomicUsize,
    pooled_frees: AtomicUsize,
    discarded_frees: AtomicUsize,
}

impl Heap {
    /// Creates a heap with the default configuration
    /// (1 KiB ..= 128 MiB classes).
    #[must_use]
    pub fn new() -> Self {
        Self::build(HeapConfig::default())
    }

    /// Creates a heap with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the
    /// configuration does not validate.
    pub fn with_config(config: HeapConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: HeapConfig) -> Self {
        let min_shift = config.min_block_size.trailing_zeros();
        let classes = (0..config.class_count())
            .map(|index| {
                let capacity = config.min_block_size << index;
                SizeClass {
                    capacity,
                    idle: ArrayQueue::new(config.retention_for(capacity)),
                }
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(
            min_block_size = config.min_block_size,
            max_block_size = config.max_block_size,
            classes = classes.len(),
            "heap created"
        );

        Heap {
            config,
            min_shift,
            classes,
            counters: HeapCounters::default(),
        }
    }

    /// The configuration this heap was built from.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Number of size classes.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Index of the smallest class that holds `size` bytes, or `None` if
    /// `size` exceeds the largest class.
    #[must_use]
    pub fn class_of(&self, size: usize) -> Option<usize> {
        if size <= self.config.min_block_size {
            return Some(0);
        }
        if size > self.config.max_block_size {
            return None;
        }
        let shift = size.next_power_of_two().trailing_zeros();
        Some((shift - self.min_shift) as usize)
    }

    /// Capacity of the class at `index`.
    #[must_use]
    pub fn class_capacity(&self, index: usize) -> Option<usize> {
        self.classes.get(index).map(|class| class.capacity)
    }

    /// The class whose capacity is exactly `capacity`, if any.
    fn exact_class(&self, capacity: usize) -> Option<&SizeClass> {
        if !capacity.is_power_of_two() {
            return None;
        }
        let index = self.class_of(capacity)?;
        self.classes
            .get(index)
            .filter(|class| class.capacity == capacity)
    }

    /// Returns a zeroed block with capacity of at least `size`.
    ///
    /// In-range requests get exactly their class capacity, even when the
    /// caller asked for less, so the remainder can be used for later
    /// appends. Oversized requests get a one-off block of exactly `size`.
    #[must_use]
    pub fn alloc(&self, size: usize) -> Block {
        self.counters.allocs.fetch_add(1, Ordering::Relaxed);

        let Some(index) = self.class_of(size) else {
            self.counters.oversized.fetch_add(1, Ordering::Relaxed);
            trace!(size, "oversized block");
            return Block::new(size);
        };

        let class = &self.classes[index];
        if let Some(block) = class.idle.pop() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            trace!(capacity = class.capacity, "pool hit");
            return block;
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        trace!(capacity = class.capacity, "pool miss");
        Block::new(class.capacity)
    }

    /// Returns a block to the heap.
    ///
    /// The block is zeroed and pooled if its capacity is exactly a class
    /// capacity and the class has room. Otherwise it is dropped.
    pub fn free(&self, mut block: Block) {
        let Some(class) = self.exact_class(block.capacity()) else {
            self.counters.discarded_frees.fetch_add(1, Ordering::Relaxed);
            trace!(capacity = block.capacity(), "unpooled block dropped");
            return;
        };

        block.reset();
        debug_assert!(block.is_zeroed());

        match class.idle.push(block) {
            Ok(()) => {
                self.counters.pooled_frees.fetch_add(1, Ordering::Relaxed);
            }
            Err(block) => {
                self.counters.discarded_frees.fetch_add(1, Ordering::Relaxed);
                trace!(capacity = block.capacity(), "class full, block dropped");
            }
        }
    }

    /// Returns every block in `blocks` to the heap.
    pub fn free_many<I>(&self, blocks: I)
    where
        I: IntoIterator<Item = Block>,
    {
        for block in blocks {
            self.free(block);
        }
    }

    /// Drops every idle block, releasing its memory to the system.
    ///
    /// Returns the number of bytes released.
    pub fn purge(&self) -> usize {
        let mut released = 0;
        for class in &*self.classes {
            while let Some(block) = class.idle.pop() {
                released += block.capacity();
            }
        }
        debug!(released, "heap purged");
        released
    }

    /// Returns heap statistics.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let (pooled_blocks, pooled_bytes) = self
            .classes
            .iter()
            .fold((0, 0), |(blocks, bytes), class| {
                let idle = class.idle.len();
                (blocks + idle, bytes + idle * class.capacity)
            });

        HeapStats {
            allocs: self.counters.allocs.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            oversized: self.counters.oversized.load(Ordering::Relaxed),
            pooled_frees: self.counters.pooled_frees.load(Ordering::Relaxed),
            discarded_frees: self.counters.discarded_frees.load(Ordering::Relaxed),
            pooled_blocks,
            pooled_bytes,
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Heap statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Calls to [`Heap::alloc`].
    pub allocs: usize,
    /// Allocations served from an idle block.
    pub hits: usize,
    /// In-range allocations that needed a fresh block.
    pub misses: usize,
    /// Allocations larger than the largest class.
    pub oversized: usize,
    /// Frees that pooled the block.
    pub pooled_frees: usize,
    /// Frees that dropped the block (custom capacity or full class).
    pub discarded_frees: usize,
    /// Idle blocks currently pooled.
    pub pooled_blocks: usize,
    /// Bytes held by idle blocks.
    pub pooled_bytes: usize,
}

impl HeapStats {
    /// Fraction of in-range allocations served from a pool, or `None` if
    /// there were none.
    #[must_use]
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits + self.misses;
        if total == 0 {
            None
        } else {
            #[allow(clippy::cast_precision_loss)]
            Some(self.hits as f64 / total as f64)
        }
    }
}

/// Process-wide default heap.
///
/// Initialized on first use with [`HeapConfig::default`] and never dropped.
///
/// # Examples
///
/// ```
/// use tessera_mem::global_heap;
///
/// let a = global_heap();
/// let b = global_heap();
/// assert!(std::ptr::eq(a, b));
/// ```
#[cfg(feature = "global-heap")]
#[must_use]
pub fn global_heap() -> &'static Heap {
    static HEAP: OnceLock<Heap> = OnceLock::new();
    HEAP.get_or_init(Heap::new)
}
