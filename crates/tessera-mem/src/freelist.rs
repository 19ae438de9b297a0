//! Lock-free recycling of same-shaped values.
//!
//! A [`FreeList`] is an intrusive Treiber stack living inside an arena. Each
//! slot is a union: while handed out it holds a `T`, while parked on the
//! list the same bytes hold the link to the next free slot. The API never
//! exposes that punning; callers only see [`Recycled`] handles.
//!
//! # Reuse policy
//!
//! - `get` pops the head with a bounded compare-and-swap loop. On success
//!   the slot is zeroed and returned; on an empty list or after
//!   [`FreeListConfig::max_retries`] failed attempts it carves a fresh slot
//!   from the arena instead of spinning.
//! - `put` drops the value, zeroes the slot and pushes it with the same
//!   bounded loop. If every attempt loses, the slot stays unlinked; its
//!   memory still belongs to the arena and comes back on the next reset.
//!
//! Slots are never returned to the [`Heap`](crate::Heap) individually.
//!
//! # Concurrency
//!
//! `get` and `put` may run from many threads when the backing arena is a
//! [`SyncArena`](crate::SyncArena). The head carries no generation tag:
//! a `get` that observes a slot which another thread pops, reuses and puts
//! back before the first thread's compare-and-swap lands can install a
//! stale link. Callers that mix `get` and `put` across threads must not
//! let the same slot cycle through the list while another `get` is in
//! flight.
//!
//! # Example
//!
//! ```
//! use bytemuck::Zeroable;
//! use tessera_mem::{Arena, FreeList, Heap};
//!
//! #[derive(Clone, Copy, Zeroable)]
//! struct Node {
//!     key: u64,
//!     value: u64,
//! }
//!
//! let heap = Heap::new();
//! let arena = Arena::new(&heap);
//! let list = FreeList::<Node, _>::new(&arena);
//!
//! let mut node = list.get();
//! node.key = 7;
//! list.put(node);
//!
//! let node = list.get();
//! assert_eq!(node.key, 0);
//! assert_eq!(list.stats().hits, 1);
//! ```

use crate::arena::BumpAlloc;
use crate::config::FreeListConfig;
use crate::error::Result;
use bytemuck::Zeroable;
use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use tracing::trace;

/// Storage shared by a live value and a free-list link.
///
/// `repr(C)` puts both fields at offset zero, so a slot pointer is also a
/// pointer to its value.
#[repr(C)]
union Slot<T> {
    // Read through casts of the slot pointer.
    #[allow(dead_code)]
    value: ManuallyDrop<T>,
    next: ManuallyDrop<AtomicPtr<Slot<T>>>,
}

/// Why a pop did not produce a slot.
enum PopFailure {
    Empty,
    Contended,
}

#[derive(Default)]
struct FreeListCounters {
    hits: AtomicUsize,
    misses: AtomicUsize,
    contended: AtomicUsize,
    dropped_puts: AtomicUsize,
}

/// Intrusive lock-free stack of recycled `T` slots inside an arena.
///
/// `A` is any [`BumpAlloc`]: a plain [`Arena`](crate::Arena) for
/// single-threaded use or a [`SyncArena`](crate::SyncArena) to share the
/// list between threads.
pub struct FreeList<'a, T, A: BumpAlloc + ?Sized> {
    arena: &'a A,
    head: AtomicPtr<Slot<T>>,
    config: FreeListConfig,
    counters: FreeListCounters,
    /// Head compare-and-swaps still to fail on purpose.
    #[cfg(test)]
    forced_failures: AtomicUsize,
    _marker: PhantomData<*mut T>,
}

// SAFETY: slots hold `T` values that may be handed to any thread, and fresh
// slots come from the arena through `&A`.
unsafe impl<T: Send, A: BumpAlloc + Sync + ?Sized> Send for FreeList<'_, T, A> {}
unsafe impl<T: Send, A: BumpAlloc + Sync + ?Sized> Sync for FreeList<'_, T, A> {}

impl<'a, T: Zeroable, A: BumpAlloc + ?Sized> FreeList<'a, T, A> {
    /// Creates an empty free list drawing fresh slots from `arena`.
    #[must_use]
    pub fn new(arena: &'a A) -> Self {
        Self::build(arena, FreeListConfig::default())
    }

    /// Creates an empty free list with a custom retry bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the
    /// configuration does not validate.
    pub fn with_config(arena: &'a A, config: FreeListConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(arena, config))
    }

    fn build(arena: &'a A, config: FreeListConfig) -> Self {
        Self {
            arena,
            head: AtomicPtr::new(ptr::null_mut()),
            config,
            counters: FreeListCounters::default(),
            #[cfg(test)]
            forced_failures: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// The arena fresh slots come from.
    #[must_use]
    pub const fn arena(&self) -> &'a A {
        self.arena
    }

    /// Returns a zeroed `T`, recycled if possible.
    ///
    /// # Panics
    ///
    /// Panics if a fresh slot is needed and the arena has been freed, or if
    /// `T` needs more than 64-byte alignment.
    pub fn get(&self) -> Recycled<'a, T> {
        let slot = match self.pop() {
            Ok(slot) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                // SAFETY: the slot was unlinked by `pop` and is exclusively
                // ours; the all-zero pattern is a valid `T`.
                unsafe { ptr::write_bytes(slot.as_ptr(), 0, 1) };
                slot
            }
            Err(PopFailure::Empty) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.fresh_slot()
            }
            Err(PopFailure::Contended) => {
                self.counters.contended.fetch_add(1, Ordering::Relaxed);
                trace!(
                    retries = self.config.max_retries,
                    "free list get contended, allocating fresh slot"
                );
                self.fresh_slot()
            }
        };

        Recycled {
            slot,
            _marker: PhantomData,
        }
    }

    /// Drops the value and parks its slot for reuse.
    ///
    /// If the push loses every compare-and-swap attempt, the slot is left
    /// unlinked and only reclaimed when the arena is reset or freed.
    pub fn put(&self, item: Recycled<'a, T>) {
        let slot = item.into_slot();
        // SAFETY: the handle owned a live `T` at offset zero of the slot and
        // gave it up in `into_slot`.
        unsafe {
            ptr::drop_in_place(slot.cast::<T>().as_ptr());
            ptr::write_bytes(slot.as_ptr(), 0, 1);
        }

        let mut head = self.head.load(Ordering::Relaxed);
        for _ in 0..self.config.max_retries {
            // SAFETY: the slot is not yet reachable from the list, so no one
            // else touches its link.
            unsafe { (*slot.as_ptr()).next.store(head, Ordering::Relaxed) };
            match self.swap_head(head, slot.as_ptr(), Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }

        self.counters.dropped_puts.fetch_add(1, Ordering::Relaxed);
        trace!(
            retries = self.config.max_retries,
            "free list put contended, slot left unlinked"
        );
    }

    fn pop(&self) -> std::result::Result<NonNull<Slot<T>>, PopFailure> {
        let mut head = self.head.load(Ordering::Acquire);
        for _ in 0..self.config.max_retries {
            let Some(node) = NonNull::new(head) else {
                return Err(PopFailure::Empty);
            };
            // SAFETY: `node` is arena memory that outlives the list. It may
            // have been popped concurrently, in which case the
            // compare-and-swap below fails and the link is discarded.
            let next = unsafe { (*node.as_ptr()).next.load(Ordering::Relaxed) };
            match self.swap_head(head, next, Ordering::Acquire, Ordering::Acquire) {
                Ok(_) => return Ok(node),
                Err(actual) => head = actual,
            }
        }
        Err(PopFailure::Contended)
    }

    fn swap_head(
        &self,
        current: *mut Slot<T>,
        new: *mut Slot<T>,
        success: Ordering,
        failure: Ordering,
    ) -> std::result::Result<*mut Slot<T>, *mut Slot<T>> {
        if self.take_forced_failure() {
            return Err(self.head.load(failure));
        }
        self.head.compare_exchange(current, new, success, failure)
    }

    #[cfg(test)]
    fn take_forced_failure(&self) -> bool {
        self.forced_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    #[cfg(not(test))]
    #[inline(always)]
    fn take_forced_failure(&self) -> bool {
        false
    }

    fn fresh_slot(&self) -> NonNull<Slot<T>> {
        self.arena
            .alloc_layout(Layout::new::<Slot<T>>())
            .cast::<Slot<T>>()
    }

    /// Returns true if no slot is parked on the list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Returns free-list statistics.
    #[must_use]
    pub fn stats(&self) -> FreeListStats {
        FreeListStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            contended: self.counters.contended.load(Ordering::Relaxed),
            dropped_puts: self.counters.dropped_puts.load(Ordering::Relaxed),
        }
    }
}

impl<T, A: BumpAlloc + ?Sized> fmt::Debug for FreeList<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeList")
            .field("config", &self.config)
            .field("empty", &self.head.load(Ordering::Relaxed).is_null())
            .finish_non_exhaustive()
    }
}

/// Free-list statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeListStats {
    /// Gets served from the list.
    pub hits: usize,
    /// Gets that found the list empty.
    pub misses: usize,
    /// Gets that gave up after the retry bound.
    pub contended: usize,
    /// Puts that gave up after the retry bound.
    pub dropped_puts: usize,
}

impl FreeListStats {
    /// Total number of `get` calls.
    #[must_use]
    pub const fn gets(&self) -> usize {
        self.hits + self.misses + self.contended
    }

    /// Fraction of gets served from the list, or `None` before the first.
    #[must_use]
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.gets();
        if total == 0 {
            None
        } else {
            #[allow(clippy::cast_precision_loss)]
            Some(self.hits as f64 / total as f64)
        }
    }
}

/// A value handed out by a [`FreeList`].
///
/// Dereferences to `T`. Give it back with [`FreeList::put`]; dropping the
/// handle instead runs `T`'s destructor and leaves the slot to the arena.
pub struct Recycled<'a, T> {
    slot: NonNull<Slot<T>>,
    _marker: PhantomData<&'a mut T>,
}

// SAFETY: a handle is the unique owner of its value.
unsafe impl<T: Send> Send for Recycled<'_, T> {}
unsafe impl<T: Sync> Sync for Recycled<'_, T> {}

impl<'a, T> Recycled<'a, T> {
    /// Gives up recycling and returns a reference living as long as the
    /// arena. The value is never dropped.
    #[must_use]
    pub fn into_mut(self) -> &'a mut T {
        let slot = self.into_slot();
        // SAFETY: the slot holds a live `T` and is exclusively owned for 'a.
        unsafe { slot.cast::<T>().as_mut() }
    }

    fn into_slot(self) -> NonNull<Slot<T>> {
        let this = ManuallyDrop::new(self);
        this.slot
    }
}

impl<T> Deref for Recycled<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the value sits at offset zero of a slot we own.
        unsafe { self.slot.cast::<T>().as_ref() }
    }
}

impl<T> DerefMut for Recycled<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as in `deref`, and `&mut self` makes the access unique.
        unsafe { self.slot.cast::<T>().as_mut() }
    }
}

impl<T> Drop for Recycled<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the slot holds a live `T` that nothing else will drop.
        unsafe { ptr::drop_in_place(self.slot.cast::<T>().as_ptr()) };
    }
}

impl<T: fmt::Debug> fmt::Debug for Recycled<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Arena, Heap, SyncArena};
    use std::sync::Barrier;

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Zeroable)]
    struct Point {
        x: u64,
        y: u64,
    }

    #[test]
    fn test_put_then_get_reuses_storage() {
        let heap = Heap::new();
        let arena = Arena::new(&heap);
        let list = FreeList::<Point, _>::new(&arena);

        let mut p = list.get();
        *p = Point { x: 3, y: 4 };
        let addr = ptr::from_ref::<Point>(&p).addr();
        list.put(p);
        assert!(!list.is_empty());

        let q = list.get();
        assert_eq!(ptr::from_ref::<Point>(&q).addr(), addr);
        assert_eq!(*q, Point::default());
        assert!(list.is_empty());

        let stats = list.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), Some(0.5));
    }

    #[test]
    fn test_empty_list_falls_back_to_arena() {
        let heap = Heap::new();
        let arena = Arena::new(&heap);
        let list = FreeList::<Point, _>::new(&arena);

        let a = list.get();
        let b = list.get();
        assert_ne!(
            ptr::from_ref::<Point>(&a).addr(),
            ptr::from_ref::<Point>(&b).addr()
        );
        assert_eq!(arena.len(), 2 * size_of::<Slot<Point>>());
        assert_eq!(list.stats().misses, 2);
        assert_eq!(list.stats().hit_rate(), Some(0.0));
    }

    #[test]
    fn test_lifo_reuse() {
        let heap = Heap::new();
        let arena = Arena::new(&heap);
        let list = FreeList::<u64, _>::new(&arena);

        let a = list.get();
        let b = list.get();
        let a_addr = ptr::from_ref::<u64>(&a).addr();
        let b_addr = ptr::from_ref::<u64>(&b).addr();
        list.put(a);
        list.put(b);

        assert_eq!(ptr::from_ref::<u64>(&list.get()).addr(), b_addr);
        assert_eq!(ptr::from_ref::<u64>(&list.get()).addr(), a_addr);
    }

    struct Tracked(Option<&'static AtomicUsize>);

    // SAFETY: `None` is all zeroes.
    unsafe impl Zeroable for Tracked {}

    impl Drop for Tracked {
        fn drop(&mut self) {
            if let Some(counter) = self.0 {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[test]
    fn test_put_and_drop_run_destructor() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        let heap = Heap::new();
        let arena = Arena::new(&heap);
        let list = FreeList::<Tracked, _>::new(&arena);

        let mut a = list.get();
        a.0 = Some(&DROPS);
        list.put(a);
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);

        let mut b = list.get();
        assert!(b.0.is_none());
        b.0 = Some(&DROPS);
        drop(b);
        assert_eq!(DROPS.load(Ordering::Relaxed), 2);
        assert!(list.is_empty());

        let c = list.get().into_mut();
        c.0 = Some(&DROPS);
        assert_eq!(DROPS.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_exhausted_retries_fall_back() {
        let heap = Heap::new();
        let arena = Arena::new(&heap);
        let config = FreeListConfig::default().with_max_retries(1);
        let list = FreeList::<Point, _>::with_config(&arena, config).unwrap();

        let mut a = list.get();
        *a = Point { x: 1, y: 1 };
        let mut b = list.get();
        *b = Point { x: 2, y: 2 };
        let a_addr = ptr::from_ref::<Point>(&a).addr();
        let b_addr = ptr::from_ref::<Point>(&b).addr();
        list.put(a);

        // A lost pop falls back to a fresh, zeroed slot.
        list.forced_failures.store(1, Ordering::Relaxed);
        let len = arena.len();
        let c = list.get();
        let c_addr = ptr::from_ref::<Point>(&c).addr();
        assert_eq!(*c, Point::default());
        assert_ne!(c_addr, a_addr);
        assert_ne!(c_addr, b_addr);
        assert_eq!(arena.len(), len + size_of::<Slot<Point>>());
        assert_eq!(list.stats().contended, 1);
        assert!(!list.is_empty());

        // A lost push leaves the slot unlinked.
        list.forced_failures.store(1, Ordering::Relaxed);
        list.put(b);
        assert_eq!(list.stats().dropped_puts, 1);

        let d = list.get();
        assert_eq!(ptr::from_ref::<Point>(&d).addr(), a_addr);
        assert!(list.is_empty());

        let stats = list.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.gets(), 4);
    }

    #[test]
    #[should_panic(expected = "alignment")]
    fn test_over_aligned_slot_panics() {
        #[derive(Clone, Copy, Zeroable)]
        #[repr(C, align(128))]
        struct Wide([u8; 128]);

        let heap = Heap::new();
        let arena = Arena::new(&heap);
        let list = FreeList::<Wide, _>::new(&arena);
        let _ = list.get();
    }

    #[test]
    fn test_zero_retries_rejected() {
        let heap = Heap::new();
        let arena = Arena::new(&heap);
        let config = FreeListConfig::default().with_max_retries(0);
        assert!(FreeList::<u64, _>::with_config(&arena, config).is_err());
    }

    #[test]
    fn test_dyn_backing_arena() {
        let heap = Heap::new();
        let arena = Arena::new(&heap);
        let backing: &dyn BumpAlloc = &arena;
        let list: FreeList<'_, u32, dyn BumpAlloc + '_> = FreeList::new(backing);

        let mut v = list.get();
        *v = 9;
        list.put(v);
        assert_eq!(*list.get(), 0);
    }

    #[test]
    fn test_concurrent_puts_then_gets() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 100;

        let heap = Heap::new();
        let arena = SyncArena::new(&heap);
        let list = FreeList::<Point, _>::new(&arena);
        let barrier = Barrier::new(THREADS);

        let handed_out: Vec<Recycled<'_, Point>> = (0..THREADS * PER_THREAD)
            .map(|_| list.get())
            .collect();
        let mut chunks: Vec<Vec<_>> = Vec::new();
        let mut iter = handed_out.into_iter();
        for _ in 0..THREADS {
            chunks.push(iter.by_ref().take(PER_THREAD).collect());
        }

        // Concurrent pushes only.
        std::thread::scope(|s| {
            for chunk in chunks {
                let list = &list;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for item in chunk {
                        list.put(item);
                    }
                });
            }
        });
        let parked = THREADS * PER_THREAD - list.stats().dropped_puts;

        // Concurrent pops only; every popped slot must be distinct.
        let mut addrs: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let list = &list;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        (0..PER_THREAD)
                            .map(|_| {
                                let mut p = list.get();
                                assert_eq!(*p, Point::default());
                                p.x = t as u64;
                                ptr::from_mut(p.into_mut()).addr()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), THREADS * PER_THREAD);

        let stats = list.stats();
        assert_eq!(stats.gets(), 2 * THREADS * PER_THREAD);
        assert!(stats.hits <= parked);
    }
}
