//! RAII object pool over a [`FreeList`].
//!
//! [`Pool::get`] hands out a [`Pooled`] guard that puts its value back on
//! the free list when dropped, so hot paths recycle without remembering to
//! call `put`.
//!
//! # Example
//!
//! ```
//! use tessera_mem::{Arena, Heap, Pool};
//!
//! let heap = Heap::new();
//! let arena = Arena::new(&heap);
//! let pool = Pool::<[u64; 4], _>::new(&arena);
//!
//! {
//!     let mut scratch = pool.get();
//!     scratch[0] = 1;
//! } // returned to the pool here
//!
//! let scratch = pool.get();
//! assert_eq!(*scratch, [0; 4]);
//! assert_eq!(pool.stats().hits, 1);
//! ```

use crate::arena::BumpAlloc;
use crate::config::FreeListConfig;
use crate::error::Result;
use crate::freelist::{FreeList, FreeListStats, Recycled};
use bytemuck::Zeroable;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};

/// Fixed-shape object pool backed by an arena.
pub struct Pool<'a, T, A: BumpAlloc + ?Sized> {
    list: FreeList<'a, T, A>,
}

impl<'a, T: Zeroable, A: BumpAlloc + ?Sized> Pool<'a, T, A> {
    /// Creates an empty pool drawing fresh objects from `arena`.
    #[must_use]
    pub fn new(arena: &'a A) -> Self {
        Self {
            list: FreeList::new(arena),
        }
    }

    /// Creates an empty pool with a custom free-list configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the
    /// configuration does not validate.
    pub fn with_config(arena: &'a A, config: FreeListConfig) -> Result<Self> {
        Ok(Self {
            list: FreeList::with_config(arena, config)?,
        })
    }

    /// Acquires a zeroed object, recycled if possible.
    ///
    /// # Panics
    ///
    /// Panics if a fresh object is needed and the arena has been freed, or
    /// if `T` needs more than 64-byte alignment.
    pub fn get(&self) -> Pooled<'_, 'a, T, A> {
        Pooled {
            pool: &self.list,
            item: ManuallyDrop::new(self.list.get()),
        }
    }

    /// Returns a detached object to the pool.
    pub fn put(&self, item: Recycled<'a, T>) {
        self.list.put(item);
    }

    /// Returns true if no object is waiting for reuse.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Returns pool statistics.
    #[must_use]
    pub fn stats(&self) -> FreeListStats {
        self.list.stats()
    }

    /// The underlying free list.
    #[must_use]
    pub const fn free_list(&self) -> &FreeList<'a, T, A> {
        &self.list
    }
}

impl<T, A: BumpAlloc + ?Sized> fmt::Debug for Pool<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("list", &self.list).finish()
    }
}

/// RAII guard for a pooled object.
///
/// Returns the object to its pool when dropped.
pub struct Pooled<'p, 'a, T: Zeroable, A: BumpAlloc + ?Sized> {
    pool: &'p FreeList<'a, T, A>,
    item: ManuallyDrop<Recycled<'a, T>>,
}

impl<'a, T: Zeroable, A: BumpAlloc + ?Sized> Pooled<'_, 'a, T, A> {
    /// Takes the object out of the pool's care.
    ///
    /// The returned handle is not recycled on drop; give it back with
    /// [`Pool::put`] or keep it with [`Recycled::into_mut`].
    #[must_use]
    pub fn detach(self) -> Recycled<'a, T> {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the item is taken exactly once.
        unsafe { ManuallyDrop::take(&mut this.item) }
    }
}

impl<T: Zeroable, A: BumpAlloc + ?Sized> Deref for Pooled<'_, '_, T, A> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T: Zeroable, A: BumpAlloc + ?Sized> DerefMut for Pooled<'_, '_, T, A> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T: Zeroable, A: BumpAlloc + ?Sized> Drop for Pooled<'_, '_, T, A> {
    fn drop(&mut self) {
        // SAFETY: the item is taken here and nowhere else on this path.
        let item = unsafe { ManuallyDrop::take(&mut self.item) };
        self.pool.put(item);
    }
}

impl<T: Zeroable + fmt::Debug, A: BumpAlloc + ?Sized> fmt::Debug for Pooled<'_, '_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
