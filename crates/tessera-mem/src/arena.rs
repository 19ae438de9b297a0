//! Bump arenas over a growing chain of heap blocks.
//!
//! An [`Arena`] is the layer most code allocates through. It borrows blocks
//! from a [`Heap`], carves allocations out of the newest one, and gives every
//! block back on [`Arena::reset`] or [`Arena::free`].
//!
//! # Growth
//!
//! When the newest block cannot hold a request, the arena asks the heap for
//! a block of `max(size, min(2 * last_capacity, max_growth_size))` bytes.
//! Doubling keeps heap round-trips at O(log n) for n bytes allocated; the
//! cap keeps one oversized request from inflating every later block.
//!
//! # Lifetimes
//!
//! Allocation takes `&self` and hands out references tied to that borrow.
//! [`Arena::reset`] and [`Arena::free`] take `&mut self`, so the borrow
//! checker rejects any use of an allocation after the memory behind it has
//! gone back to the heap.
//!
//! Values placed in an arena are never dropped. Use [`Arena::pin`] for
//! objects whose destructor must run.
//!
//! # States
//!
//! An arena starts [`ArenaState::Live`] and stays live across resets.
//! [`Arena::free`] moves it to [`ArenaState::Freed`] for good; allocating,
//! pinning or resetting afterwards panics.
//!
//! # Example
//!
//! ```
//! use tessera_mem::{Arena, Heap};
//!
//! let heap = Heap::new();
//! let mut arena = Arena::new(&heap);
//!
//! let answer = arena.alloc_value(42u64);
//! let name = arena.alloc_str("tessera");
//! assert_eq!(*answer, 42);
//! assert_eq!(name, "tessera");
//! assert_eq!(arena.cap(), 1024);
//!
//! arena.reset();
//! assert_eq!(arena.len(), 0);
//! ```

use crate::block::{ALIGNMENT, BLOCK_ALIGN, Block, dangling};
use crate::config::ArenaConfig;
use crate::error::{Error, Result};
use crate::heap::Heap;
use bytemuck::Zeroable;
use std::alloc::Layout;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;
use tracing::debug;
#[cfg(feature = "arena_backtrace")]
use tracing::warn;

/// Raw bump allocation, implemented by both arena postures.
///
/// [`FreeList`](crate::FreeList) draws fresh slots through this trait so it
/// can sit on a plain [`Arena`] or a [`SyncArena`](crate::SyncArena).
pub trait BumpAlloc {
    /// Returns memory for `layout`.
    ///
    /// The memory is zeroed, does not overlap any other live allocation of
    /// the same arena, and stays valid until the arena is reset or freed.
    /// Zero-sized layouts return an aligned dangling pointer.
    fn alloc_layout(&self, layout: Layout) -> NonNull<u8>;
}

/// Lifecycle state of an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaState {
    /// Accepting allocations.
    Live,
    /// Released; every block went back to the heap.
    Freed,
}

/// Blocks and bookkeeping, mutated through a shared `&Arena`.
struct ArenaInner {
    /// Owned blocks, oldest first. Allocation uses the last one.
    blocks: Vec<Block>,
    /// Sum of the capacities in `blocks`.
    cap: usize,
    /// Capacity of the preallocated first block, if there was one.
    initial: Option<usize>,
    state: ArenaState,
}

impl ArenaInner {
    #[inline]
    fn assert_live(&self, op: &str) {
        assert!(
            self.state == ArenaState::Live,
            "cannot {op} a freed arena"
        );
    }
}

/// An object owned by an arena until its next reset or free.
struct PinnedObject(NonNull<dyn Any + Send>);

// SAFETY: the pointee is `Send` and uniquely owned by this handle.
unsafe impl Send for PinnedObject {}

impl Drop for PinnedObject {
    fn drop(&mut self) {
        // SAFETY: the pointer came from `Box::leak` in `Arena::pin` and
        // is released exactly once.
        unsafe {
            drop(Box::from_raw(self.0.as_ptr()));
        }
    }
}

/// Single-writer bump allocator over heap blocks.
///
/// `Arena` is `Send` but not `Sync`: it can move between threads but offers
/// no internal locking. Wrap it in a [`SyncArena`](crate::SyncArena) for
/// multi-writer use.
pub struct Arena<'h> {
    heap: &'h Heap,
    config: ArenaConfig,
    inner: RefCell<ArenaInner>,
    pinned: RefCell<Vec<PinnedObject>>,
    #[cfg(feature = "arena_backtrace")]
    origin: backtrace::Backtrace,
}

impl<'h> Arena<'h> {
    /// Creates an empty arena. The first block is requested on the first
    /// allocation.
    #[must_use]
    pub fn new(heap: &'h Heap) -> Self {
        Self::build(heap, ArenaConfig::default())
    }

    /// Creates an arena whose first block is preallocated to hold at least
    /// `size` bytes. A reset keeps that block in place.
    #[must_use]
    pub fn with_capacity(heap: &'h Heap, size: usize) -> Self {
        Self::build(heap, ArenaConfig::default().with_initial_size(size))
    }

    /// Creates an arena with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the
    /// configuration does not validate.
    pub fn with_config(heap: &'h Heap, config: ArenaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(heap, config))
    }

    fn build(heap: &'h Heap, config: ArenaConfig) -> Self {
        let mut inner = ArenaInner {
            blocks: Vec::new(),
            cap: 0,
            initial: None,
            state: ArenaState::Live,
        };

        if config.initial_size > 0 {
            let block = heap.alloc(config.initial_size);
            inner.cap = block.capacity();
            inner.initial = Some(block.capacity());
            inner.blocks.push(block);
        }

        Arena {
            heap,
            config,
            inner: RefCell::new(inner),
            pinned: RefCell::new(Vec::new()),
            #[cfg(feature = "arena_backtrace")]
            origin: backtrace::Backtrace::new_unresolved(),
        }
    }

    /// The heap this arena draws blocks from.
    #[must_use]
    pub const fn heap(&self) -> &'h Heap {
        self.heap
    }

    /// The configuration this arena was built with.
    #[must_use]
    pub const fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Reserves `size` bytes at [`ALIGNMENT`].
    ///
    /// The returned region is zeroed and never overlaps another allocation
    /// made since the last reset. A zero `size` returns an aligned dangling
    /// pointer without touching any block.
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed.
    #[inline]
    pub fn alloc(&self, size: usize) -> NonNull<u8> {
        self.alloc_raw(size, ALIGNMENT)
    }

    /// Reserves memory for `layout`, rejecting alignments a block cannot
    /// provide instead of panicking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAlignment`] if `layout.align()` exceeds
    /// [`BLOCK_ALIGN`].
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed.
    pub fn try_alloc_layout(&self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.align() > BLOCK_ALIGN {
            return Err(Error::InvalidAlignment {
                alignment: layout.align(),
            });
        }
        Ok(self.alloc_layout(layout))
    }

    fn alloc_raw(&self, size: usize, align: usize) -> NonNull<u8> {
        let mut inner = self.inner.borrow_mut();
        inner.assert_live("allocate from");

        if size == 0 {
            return dangling(align);
        }

        if let Some(block) = inner.blocks.last_mut()
            && let Some(ptr) = block.alloc_aligned(size, align)
        {
            return ptr;
        }

        self.grow(&mut inner, size, align)
    }

    /// Appends a block large enough for `size` and allocates from it.
    #[cold]
    fn grow(&self, inner: &mut ArenaInner, size: usize, align: usize) -> NonNull<u8> {
        let last = inner.blocks.last().map_or(0, Block::capacity);
        let doubled = last.saturating_mul(2).min(self.config.max_growth_size);

        let mut block = self.heap.alloc(size.max(doubled));
        // Block storage is aligned to BLOCK_ALIGN and holds at least `size`
        // bytes, so the first allocation always fits.
        let Some(ptr) = block.alloc_aligned(size, align) else {
            unreachable!(
                "fresh block of {} bytes cannot hold {size} bytes",
                block.capacity()
            );
        };

        inner.cap += block.capacity();
        debug!(
            block = block.capacity(),
            cap = inner.cap,
            blocks = inner.blocks.len() + 1,
            "arena grew"
        );
        inner.blocks.push(block);
        ptr
    }

    /// Returns `size` zeroed bytes.
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed.
    #[allow(clippy::mut_from_ref)]
    pub fn bytes(&self, size: usize) -> &mut [u8] {
        let ptr = self.alloc_raw(size, ALIGNMENT);
        // SAFETY: `ptr` is valid for `size` zeroed bytes (or dangling for
        // zero), exclusive to this call, and outlives `&self` because
        // releasing blocks needs `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), size) }
    }

    /// Moves `value` into the arena and returns a reference to it.
    ///
    /// The value's destructor never runs.
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed or `T` needs more than 64-byte
    /// alignment.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_value<T>(&self, value: T) -> &mut T {
        let ptr = self.alloc_layout(Layout::new::<T>()).cast::<T>();
        // SAFETY: `ptr` is aligned for T and valid for one T.
        unsafe {
            ptr.as_ptr().write(value);
            &mut *ptr.as_ptr()
        }
    }

    /// Returns a zeroed `T`.
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed or `T` needs more than 64-byte
    /// alignment.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_zeroed<T: Zeroable>(&self) -> &mut T {
        let ptr = self.alloc_layout(Layout::new::<T>()).cast::<T>();
        // SAFETY: arena memory is zeroed and all-zero is a valid T.
        unsafe { &mut *ptr.as_ptr() }
    }

    /// Returns a slice of `len` zeroed `T`s.
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed or the slice size overflows.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_slice_zeroed<T: Zeroable>(&self, len: usize) -> &mut [T] {
        let layout = Layout::array::<T>(len)
            .unwrap_or_else(|_| panic!("slice of {len} elements overflows"));
        let ptr = self.alloc_layout(layout).cast::<T>();
        // SAFETY: zeroed, aligned, and valid for `len` elements.
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) }
    }

    /// Copies `src` into the arena.
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> &mut [T] {
        let layout = Layout::for_value(src);
        let ptr = self.alloc_layout(layout).cast::<T>();
        // SAFETY: the destination is fresh, aligned, and sized for `src`.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len());
            std::slice::from_raw_parts_mut(ptr.as_ptr(), src.len())
        }
    }

    /// Copies `s` into the arena.
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_str(&self, s: &str) -> &mut str {
        let bytes = self.alloc_slice_copy(s.as_bytes());
        // SAFETY: copied verbatim from a `str`.
        unsafe { std::str::from_utf8_unchecked_mut(bytes) }
    }

    /// Keeps `value` alive until the next reset or free, then drops it.
    ///
    /// Use this to tie an external object (for example the owner of
    /// memory that arena data points into) to the arena's lifetime.
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed.
    pub fn pin<T: Send + 'static>(&self, value: T) -> &T {
        self.inner.borrow().assert_live("pin into");

        let boxed: Box<dyn Any + Send> = Box::new(value);
        let raw = NonNull::from(Box::leak(boxed));
        self.pinned.borrow_mut().push(PinnedObject(raw));

        // SAFETY: the box is only dropped by reset/free/drop, all of which
        // need `&mut self`.
        unsafe { &*raw.as_ptr().cast::<T>() }
    }

    /// Releases every allocation.
    ///
    /// If the arena was created with a preallocated block and that block is
    /// still first, it is zeroed in place and kept; every other block goes
    /// back to the heap. Pinned objects are dropped.
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed.
    pub fn reset(&mut self) {
        let inner = self.inner.get_mut();
        inner.assert_live("reset");

        let keep_first = inner
            .initial
            .is_some_and(|initial| inner.blocks.first().is_some_and(|b| b.capacity() == initial));

        self.heap.free_many(inner.blocks.drain(usize::from(keep_first)..));
        if let Some(first) = inner.blocks.first_mut() {
            first.reset();
        }
        inner.cap = inner.blocks.iter().map(Block::capacity).sum();

        self.pinned.get_mut().clear();
        debug!(cap = inner.cap, kept = keep_first, "arena reset");
    }

    /// Returns every block to the heap and marks the arena freed.
    ///
    /// Calling `free` again does nothing.
    pub fn free(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state == ArenaState::Freed {
            return;
        }

        let released = inner.cap;
        self.heap.free_many(inner.blocks.drain(..));
        inner.cap = 0;
        inner.state = ArenaState::Freed;

        self.pinned.get_mut().clear();
        debug!(released, "arena freed");
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ArenaState {
        self.inner.borrow().state
    }

    /// Returns true once [`Arena::free`] has run.
    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.state() == ArenaState::Freed
    }

    /// Total capacity of the owned blocks.
    #[must_use]
    pub fn cap(&self) -> usize {
        self.inner.borrow().cap
    }

    /// Bytes handed out across all owned blocks, including padding.
    ///
    /// Computed on demand in O(number of blocks).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().blocks.iter().map(Block::used).sum()
    }

    /// Returns true if nothing has been allocated since the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of owned blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.inner.borrow().blocks.len()
    }

    /// Number of pinned objects.
    #[must_use]
    pub fn pinned_count(&self) -> usize {
        self.pinned.borrow().len()
    }

    /// Returns arena statistics.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let inner = self.inner.borrow();
        let used: usize = inner.blocks.iter().map(Block::used).sum();

        ArenaStats {
            blocks: inner.blocks.len(),
            capacity: inner.cap,
            used,
            pinned: self.pinned.borrow().len(),
            #[allow(clippy::cast_precision_loss)]
            unused_ratio: if inner.cap > 0 {
                1.0 - (used as f64 / inner.cap as f64)
            } else {
                0.0
            },
        }
    }

    #[cfg(feature = "arena_backtrace")]
    fn report_leak(&self) {
        let inner = self.inner.borrow();
        if inner.state == ArenaState::Freed {
            return;
        }
        let used: usize = inner.blocks.iter().map(Block::used).sum();
        if used == 0 {
            return;
        }
        let mut origin = self.origin.clone();
        origin.resolve();
        warn!(
            used,
            blocks = inner.blocks.len(),
            "live arena dropped without free, created at:\n{origin:?}"
        );
    }
}

impl BumpAlloc for Arena<'_> {
    #[inline]
    fn alloc_layout(&self, layout: Layout) -> NonNull<u8> {
        self.alloc_raw(layout.size(), layout.align().max(ALIGNMENT))
    }
}

impl Drop for Arena<'_> {
    fn drop(&mut self) {
        #[cfg(feature = "arena_backtrace")]
        self.report_leak();
        self.free();
    }
}

impl fmt::Debug for Arena<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Arena statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArenaStats {
    /// Number of owned blocks.
    pub blocks: usize,
    /// Total capacity of the owned blocks.
    pub capacity: usize,
    /// Bytes handed out, including padding.
    pub used: usize,
    /// Number of pinned objects.
    pub pinned: usize,
    /// Fraction of capacity not yet handed out (0.0 = full, 1.0 = empty).
    pub unused_ratio: f64,
}
