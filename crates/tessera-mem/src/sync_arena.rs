//! Multi-writer arena.
//!
//! [`SyncArena`] serializes every operation of an [`Arena`] behind one
//! `parking_lot` mutex. The plain [`Arena`] is `!Sync`, so choosing between
//! the two postures is a type-level decision rather than a runtime flag.
//!
//! Allocation takes `&self` and can run from many threads at once through
//! an `Arc` or a scoped borrow. [`SyncArena::reset`] and [`SyncArena::free`]
//! take `&mut self`: exclusive access is already proven by the borrow
//! checker, which also guarantees no reference handed out by the arena is
//! still alive when its memory goes back to the heap.
//!
//! # Example
//!
//! ```
//! use tessera_mem::{Heap, SyncArena};
//!
//! let heap = Heap::new();
//! let arena = SyncArena::new(&heap);
//!
//! std::thread::scope(|s| {
//!     for i in 0..4u64 {
//!         let arena = &arena;
//!         s.spawn(move || {
//!             let value = arena.alloc_value(i);
//!             assert_eq!(*value, i);
//!         });
//!     }
//! });
//!
//! assert!(arena.len() >= 32);
//! ```

use crate::arena::{Arena, ArenaState, ArenaStats, BumpAlloc};
use crate::config::ArenaConfig;
use crate::error::Result;
use crate::heap::Heap;
use bytemuck::Zeroable;
use parking_lot::{Mutex, MutexGuard};
use std::alloc::Layout;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;

/// An [`Arena`] guarded by a mutex for multi-writer use.
pub struct SyncArena<'h> {
    inner: Mutex<Arena<'h>>,
}

impl<'h> SyncArena<'h> {
    /// Creates an empty synchronized arena.
    #[must_use]
    pub fn new(heap: &'h Heap) -> Self {
        Self::from_arena(Arena::new(heap))
    }

    /// Creates a synchronized arena with a preallocated first block.
    #[must_use]
    pub fn with_capacity(heap: &'h Heap, size: usize) -> Self {
        Self::from_arena(Arena::with_capacity(heap, size))
    }

    /// Creates a synchronized arena with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the
    /// configuration does not validate.
    pub fn with_config(heap: &'h Heap, config: ArenaConfig) -> Result<Self> {
        Ok(Self::from_arena(Arena::with_config(heap, config)?))
    }

    /// Wraps an existing arena.
    #[must_use]
    pub fn from_arena(arena: Arena<'h>) -> Self {
        Self {
            inner: Mutex::new(arena),
        }
    }

    /// Unwraps the arena.
    #[must_use]
    pub fn into_inner(self) -> Arena<'h> {
        self.inner.into_inner()
    }

    /// Locks the arena for a sequence of operations.
    ///
    /// The guard only gives shared access: allocation and queries work,
    /// but releasing memory still needs [`SyncArena::reset`] or
    /// [`SyncArena::free`].
    ///
    /// ```compile_fail
    /// use tessera_mem::{Heap, SyncArena};
    ///
    /// let heap = Heap::new();
    /// let arena = SyncArena::new(&heap);
    /// let first = arena.bytes(16);
    /// arena.lock().reset();
    /// first.fill(0xAA);
    /// ```
    pub fn lock(&self) -> SyncArenaGuard<'_, 'h> {
        SyncArenaGuard {
            guard: self.inner.lock(),
        }
    }

    /// Reserves `size` bytes. See [`Arena::alloc`].
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed.
    pub fn alloc(&self, size: usize) -> NonNull<u8> {
        self.inner.lock().alloc(size)
    }

    /// Returns `size` zeroed bytes. See [`Arena::bytes`].
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed.
    #[allow(clippy::mut_from_ref)]
    pub fn bytes(&self, size: usize) -> &mut [u8] {
        let ptr = self.inner.lock().alloc(size);
        // SAFETY: the region is exclusive to this call and lives until
        // reset/free, which need `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), size) }
    }

    /// Moves `value` into the arena. See [`Arena::alloc_value`].
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed or `T` needs more than 64-byte
    /// alignment.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_value<T>(&self, value: T) -> &mut T {
        let ptr = self.alloc_layout(Layout::new::<T>()).cast::<T>();
        // SAFETY: aligned, valid for one T, exclusive to this call.
        unsafe {
            ptr.as_ptr().write(value);
            &mut *ptr.as_ptr()
        }
    }

    /// Returns a zeroed `T`. See [`Arena::alloc_zeroed`].
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

    /// Keeps `value` alive until the next reset or free. See [`Arena::pin`].
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed.
    pub fn pin<T: Send + 'static>(&self, value: T) -> &T {
        let guard = self.inner.lock();
        let pinned: *const T = guard.pin(value);
        drop(guard);
        // SAFETY: the object is boxed and only dropped by reset/free/drop,
        // all of which need `&mut self`.
        unsafe { &*pinned }
    }

    /// Releases every allocation. See [`Arena::reset`].
    ///
    /// # Panics
    ///
    /// Panics if the arena has been freed.
    pub fn reset(&mut self) {
        self.inner.get_mut().reset();
    }

    /// Returns every block to the heap. Idempotent. See [`Arena::free`].
    pub fn free(&mut self) {
        self.inner.get_mut().free();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ArenaState {
        self.inner.lock().state()
    }

    /// Returns true once [`SyncArena::free`] has run.
    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.inner.lock().is_freed()
    }

    /// Total capacity of the owned blocks.
    #[must_use]
    pub fn cap(&self) -> usize {
        self.inner.lock().cap()
    }

    /// Bytes handed out across all owned blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if nothing has been allocated since the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns arena statistics.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        self.inner.lock().stats()
    }
}

/// Shared access to a locked [`SyncArena`].
///
/// Dereferences to [`Arena`] immutably only, so `reset`, `free` and
/// replacing the arena are out of reach while allocations may be live.
pub struct SyncArenaGuard<'a, 'h> {
    guard: MutexGuard<'a, Arena<'h>>,
}

impl<'h> Deref for SyncArenaGuard<'_, 'h> {
    type Target = Arena<'h>;

    #[inline]
    fn deref(&self) -> &Arena<'h> {
        &self.guard
    }
}

impl fmt::Debug for SyncArenaGuard<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.guard, f)
    }
}

impl BumpAlloc for SyncArena<'_> {
    #[inline]
    fn alloc_layout(&self, layout: Layout) -> NonNull<u8> {
        self.inner.lock().alloc_layout(layout)
    }
}

impl fmt::Debug for SyncArena<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncArena")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
