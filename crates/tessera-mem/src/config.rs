//! Tunable parameters for heaps, arenas and free lists.
//!
//! None of the numbers here are part of the contract; they only have to
//! satisfy the invariants checked by the `validate` methods.

use crate::block::ALIGNMENT;
use crate::error::{Error, Result};

/// Smallest size class (1 KiB).
pub const DEFAULT_MIN_BLOCK_SIZE: usize = 1024;

/// Largest size class (128 MiB).
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 128 * 1024 * 1024;

/// Upper bound on blocks retained per size class.
pub const DEFAULT_MAX_POOLED_BLOCKS: usize = 64;

/// Upper bound on bytes retained per size class.
pub const DEFAULT_MAX_POOLED_BYTES: usize = 64 * 1024 * 1024;

/// Cap applied to the doubling growth rule of an arena (4 MiB).
pub const DEFAULT_MAX_GROWTH_SIZE: usize = 4 * 1024 * 1024;

/// Compare-and-swap attempts before a free list gives up.
pub const DEFAULT_MAX_RETRIES: usize = 8;

/// Size-class layout and retention policy of a [`Heap`](crate::Heap).
///
/// # Examples
///
/// ```
/// use tessera_mem::HeapConfig;
///
/// let config = HeapConfig::default().with_max_block_size(1 << 24);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.class_count(), 15);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HeapConfig {
    /// Capacity of the smallest size class. Power of two, at least 8.
    pub min_block_size: usize,
    /// Capacity of the largest size class. Power of two.
    pub max_block_size: usize,
    /// Maximum number of idle blocks kept per class.
    pub max_pooled_blocks: usize,
    /// Maximum number of idle bytes kept per class. Every class keeps at
    /// least one block regardless of this limit.
    pub max_pooled_bytes: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            min_block_size: DEFAULT_MIN_BLOCK_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            max_pooled_blocks: DEFAULT_MAX_POOLED_BLOCKS,
            max_pooled_bytes: DEFAULT_MAX_POOLED_BYTES,
        }
    }
}

impl HeapConfig {
    /// Sets the smallest size class.
    #[must_use]
    pub const fn with_min_block_size(mut self, size: usize) -> Self {
        self.min_block_size = size;
        self
    }

    /// Sets the largest size class.
    #[must_use]
    pub const fn with_max_block_size(mut self, size: usize) -> Self {
        self.max_block_size = size;
        self
    }

    /// Sets how many idle blocks each class may retain.
    #[must_use]
    pub const fn with_max_pooled_blocks(mut self, count: usize) -> Self {
        self.max_pooled_blocks = count;
        self
    }

    /// Sets how many idle bytes each class may retain.
    #[must_use]
    pub const fn with_max_pooled_bytes(mut self, bytes: usize) -> Self {
        self.max_pooled_bytes = bytes;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if either bound is not a power of
    /// two, the minimum is below the allocation alignment, the minimum
    /// exceeds the maximum, or no block may be pooled at all.
    pub fn validate(&self) -> Result<()> {
        if !self.min_block_size.is_power_of_two() {
            return Err(Error::invalid_config(format!(
                "min_block_size {} is not a power of two",
                self.min_block_size
            )));
        }
        if !self.max_block_size.is_power_of_two() {
            return Err(Error::invalid_config(format!(
                "max_block_size {} is not a power of two",
                self.max_block_size
            )));
        }
        if self.min_block_size < ALIGNMENT {
            return Err(Error::invalid_config(format!(
                "min_block_size {} is below the {ALIGNMENT}-byte alignment",
                self.min_block_size
            )));
        }
        if self.min_block_size > self.max_block_size {
            return Err(Error::invalid_config(format!(
                "min_block_size {} exceeds max_block_size {}",
                self.min_block_size, self.max_block_size
            )));
        }
        if self.max_pooled_blocks == 0 {
            return Err(Error::invalid_config("max_pooled_blocks must be non-zero"));
        }
        Ok(())
    }

    /// Number of size classes described by this configuration.
    #[must_use]
    pub const fn class_count(&self) -> usize {
        (self.max_block_size.trailing_zeros() - self.min_block_size.trailing_zeros()) as usize
            + 1
    }

    /// Number of idle blocks a class of `capacity` bytes may retain.
    #[must_use]
    pub fn retention_for(&self, capacity: usize) -> usize {
        (self.max_pooled_bytes / capacity.max(1)).clamp(1, self.max_pooled_blocks)
    }
}

/// Construction and growth parameters of an [`Arena`](crate::Arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ArenaConfig {
    /// Bytes to preallocate as the first block. Zero means the arena starts
    /// empty and requests its first block on the first allocation.
    pub initial_size: usize,
    /// Cap on the doubled size of a new block. Requests larger than this
    /// still get a block big enough to hold them.
    pub max_growth_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_size: 0,
            max_growth_size: DEFAULT_MAX_GROWTH_SIZE,
        }
    }
}

impl ArenaConfig {
    /// Sets the preallocated size.
    #[must_use]
    pub const fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = size;
        self
    }

    /// Sets the growth cap.
    #[must_use]
    pub const fn with_max_growth_size(mut self, size: usize) -> Self {
        self.max_growth_size = size;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `max_growth_size` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_growth_size == 0 {
            return Err(Error::invalid_config("max_growth_size must be non-zero"));
        }
        Ok(())
    }
}

/// Contention policy of a [`FreeList`](crate::FreeList).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FreeListConfig {
    /// Compare-and-swap attempts per `get`/`put` before falling back.
    pub max_retries: usize,
}

impl Default for FreeListConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl FreeListConfig {
    /// Sets the retry bound.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `max_retries` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::invalid_config("max_retries must be non-zero"));
        }
        Ok(())
    }
}
