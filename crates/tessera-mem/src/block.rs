//! Fixed-capacity memory regions with bump allocation.
//!
//! A [`Block`] owns one contiguous allocation from the system allocator and
//! hands out sub-regions by advancing a `used` cursor. Sub-regions are never
//! freed individually; [`Block::reset`] zeroes everything handed out so far
//! and rewinds the cursor.
//!
//! # Safety
//!
//! - The backing storage is aligned to [`BLOCK_ALIGN`] and is zeroed when
//!   the block is created
//! - `used <= capacity` at all times
//! - Pointers returned by [`Block::alloc`] stay valid until the block is
//!   reset or dropped; moving the `Block` value does not move its storage
//!
//! A block has no internal synchronization. It is mutated only by its
//! current owner: a heap pool slot or a single arena.

use crate::error::{Error, Result};
use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

/// Default alignment for allocations (one machine word on 64-bit targets).
pub const ALIGNMENT: usize = 8;

/// Alignment of every block's backing storage.
///
/// Typed allocations may request up to this alignment.
pub const BLOCK_ALIGN: usize = 64;

/// A single fixed-capacity region supporting aligned bump allocation.
///
/// # Examples
///
/// ```
/// use tessera_mem::Block;
///
/// let mut block = Block::new(1024);
/// let first = block.alloc(3).unwrap();
/// let second = block.alloc(8).unwrap();
///
/// assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 8);
/// assert_eq!(block.used(), 16);
/// assert_eq!(block.free(), 1008);
/// ```
pub struct Block {
    /// Start of the backing storage.
    start: NonNull<u8>,
    /// Total capacity in bytes.
    capacity: usize,
    /// Bytes handed out so far, including alignment padding.
    used: usize,
}

// SAFETY: a Block exclusively owns its storage and all mutation goes through
// `&mut self`.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    /// Creates a zeroed block of exactly `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` cannot be described by a [`Layout`]. Aborts
    /// through [`alloc::handle_alloc_error`] if the system allocator fails.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let layout = Self::layout(capacity)
            .unwrap_or_else(|err| panic!("cannot create block: {err}"));
        Self::allocate(layout).unwrap_or_else(|| alloc::handle_alloc_error(layout))
    }

    /// Creates a zeroed block of exactly `capacity` bytes.
    ///
    /// # Errors
    ///
    /// - [`Error::CapacityOverflow`] if `capacity` cannot be described by a
    ///   [`Layout`]
    /// - [`Error::BlockAllocationFailed`] if the system allocator returns
    ///   null
    pub fn try_new(capacity: usize) -> Result<Self> {
        let layout = Self::layout(capacity)?;
        Self::allocate(layout).ok_or(Error::BlockAllocationFailed { size: capacity })
    }

    fn allocate(layout: Layout) -> Option<Self> {
        if layout.size() == 0 {
            return Some(Block {
                start: dangling(BLOCK_ALIGN),
                capacity: 0,
                used: 0,
            });
        }

        // SAFETY: layout has a non-zero size (checked above).
        let start = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;

        Some(Block {
            start,
            capacity: layout.size(),
            used: 0,
        })
    }

    fn layout(capacity: usize) -> Result<Layout> {
        Layout::from_size_align(capacity, BLOCK_ALIGN)
            .map_err(|_| Error::CapacityOverflow { size: capacity })
    }

    /// Reserves `size` bytes at the next [`ALIGNMENT`] boundary.
    ///
    /// Returns `None` when the aligned request does not fit. Previously
    /// returned pointers are never moved or invalidated.
    #[must_use]
    #[inline]
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.alloc_aligned(size, ALIGNMENT)
    }

    /// Reserves `size` bytes at the next `align` boundary.
    ///
    /// After a successful call, `used()` equals the previous `used()`
    /// rounded up to `align`, plus `size`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two or exceeds [`BLOCK_ALIGN`].
    #[must_use]
    #[inline]
    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let offset = self.reserve(size, align)?;
        // SAFETY: offset <= capacity, so the pointer stays inside the
        // allocation (or one past its end for a zero-sized tail request).
        Some(unsafe { self.start.add(offset) })
    }

    /// Reserves `size` bytes and returns them as a writable span.
    ///
    /// Used by buffer-like consumers that append into a block directly.
    /// The span is zeroed.
    #[must_use]
    pub fn grow(&mut self, size: usize) -> Option<&mut [u8]> {
        let offset = self.reserve(size, ALIGNMENT)?;
        // SAFETY: [offset, offset + size) lies within the used region, is
        // zeroed, and is borrowed mutably through `self`.
        unsafe {
            Some(std::slice::from_raw_parts_mut(
                self.start.as_ptr().add(offset),
                size,
            ))
        }
    }

    /// Advances the cursor and returns the start offset of the reservation.
    fn reserve(&mut self, size: usize, align: usize) -> Option<usize> {
        assert!(
            align.is_power_of_two() && align <= BLOCK_ALIGN,
            "alignment {align} must be a power of two no larger than {BLOCK_ALIGN}"
        );

        let aligned = round_up_to_align(self.used, align)?;
        let end = aligned.checked_add(size)?;
        if end > self.capacity {
            return None;
        }

        self.used = end;
        Some(aligned)
    }

    /// Zeroes every used byte and rewinds the cursor. Capacity is unchanged.
    pub fn reset(&mut self) {
        if self.used > 0 {
            // SAFETY: [0, used) lies within the allocation.
            unsafe {
                std::ptr::write_bytes(self.start.as_ptr(), 0, self.used);
            }
        }
        self.used = 0;
    }

    /// Total capacity in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out so far, including alignment padding.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Bytes still available after the cursor.
    #[inline]
    #[must_use]
    pub const fn free(&self) -> usize {
        self.capacity - self.used
    }

    /// The used portion of the block.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: [0, used) is initialized (zeroed at creation, written only
        // through handed-out regions).
        unsafe { std::slice::from_raw_parts(self.start.as_ptr(), self.used) }
    }

    /// Start address of the backing storage.
    #[inline]
    #[must_use]
    pub const fn as_ptr(&self) -> *const u8 {
        self.start.as_ptr()
    }

    /// Returns true if the used region is entirely zero.
    #[must_use]
    pub fn is_zeroed(&self) -> bool {
        self.as_slice().iter().all(|&b| b == 0)
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if self.capacity == 0 {
            return;
        }
        // SAFETY: the layout matches the one used in `try_new`.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.capacity, BLOCK_ALIGN);
            alloc::dealloc(self.start.as_ptr(), layout);
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .finish()
    }
}

/// A non-null pointer aligned to `align` that owns no memory.
#[inline]
pub(crate) fn dangling(align: usize) -> NonNull<u8> {
    NonNull::new(std::ptr::without_provenance_mut(align)).unwrap_or(NonNull::dangling())
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[inline]
pub(crate) fn round_up_to_align(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two(), "Alignment must be a power of two");
    Some(value.checked_add(align - 1)? & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_creation() {
        let block = Block::new(1024);
        assert_eq!(block.capacity(), 1024);
        assert_eq!(block.used(), 0);
        assert_eq!(block.free(), 1024);
        assert_eq!(block.as_ptr().addr() % BLOCK_ALIGN, 0);
    }

    #[test]
    fn test_block_alloc_alignment() {
        let mut block = Block::new(1024);

        let a = block.alloc(1).unwrap();
        assert_eq!(block.used(), 1);

        let b = block.alloc(5).unwrap();
        assert_eq!(block.used(), 13);
        assert_eq!(b.as_ptr().addr() - a.as_ptr().addr(), 8);
        assert_eq!(b.as_ptr().addr() % ALIGNMENT, 0);

        let c = block.alloc_aligned(4, 32).unwrap();
        assert_eq!(c.as_ptr().addr() % 32, 0);
        assert_eq!(block.used(), 36);
    }

    #[test]
    fn test_block_exhaustion_is_not_an_error() {
        let mut block = Block::new(1024);

        assert!(block.alloc(1).is_some());
        assert!(block.alloc(1024).is_none());
        // A failed request leaves the cursor where it was.
        assert_eq!(block.used(), 1);
        assert!(block.alloc(1016).is_some());
        assert_eq!(block.free(), 0);
        assert!(block.alloc(1).is_none());
    }

    #[test]
    fn test_block_grow_and_reset() {
        let mut block = Block::new(1024);

        let span = block.grow(16).unwrap();
        assert_eq!(span.len(), 16);
        span.copy_from_slice(&[0xAB; 16]);
        assert!(!block.is_zeroed());

        block.reset();
        assert_eq!(block.used(), 0);
        assert_eq!(block.capacity(), 1024);

        // Previously written bytes are wiped.
        let span = block.grow(16).unwrap();
        assert!(span.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_capacity_block() {
        let mut block = Block::new(0);
        assert_eq!(block.capacity(), 0);
        assert!(block.alloc(0).is_some());
        assert!(block.alloc(1).is_none());
    }

    #[test]
    fn test_try_new_overflow() {
        assert!(matches!(
            Block::try_new(usize::MAX),
            Err(Error::CapacityOverflow { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "alignment")]
    fn test_excessive_alignment_panics() {
        let mut block = Block::new(1024);
        let _ = block.alloc_aligned(8, 128);
    }

    #[test]
    fn test_alignment_rounding() {
        assert_eq!(round_up_to_align(0, 8), Some(0));
        assert_eq!(round_up_to_align(1, 8), Some(8));
        assert_eq!(round_up_to_align(8, 8), Some(8));
        assert_eq!(round_up_to_align(9, 16), Some(16));
        assert_eq!(round_up_to_align(usize::MAX, 8), None);
    }
}
