//! Error types for `tessera-mem`.
//!
//! Only recoverable conditions live here: bad configuration and failed
//! construction of a standalone [`Block`](crate::Block). Running out of room
//! inside a block, pool misses and free-list contention are handled locally
//! and never surface as errors. Using a freed arena is a contract violation
//! and panics instead.

use thiserror::Error;

/// Errors reported by the memory layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A configuration value violates its constraints.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong with the configuration.
        reason: String,
    },

    /// The requested alignment is not a power of two or exceeds what a
    /// block's backing storage guarantees.
    #[error("invalid alignment: {alignment}")]
    InvalidAlignment {
        /// The requested alignment.
        alignment: usize,
    },

    /// The requested size cannot be described by a memory layout.
    #[error("capacity overflow for {size} bytes")]
    CapacityOverflow {
        /// The requested size in bytes.
        size: usize,
    },

    /// The system allocator returned no memory for a block.
    #[error("block allocation of {size} bytes failed")]
    BlockAllocationFailed {
        /// The requested block capacity.
        size: usize,
    },
}

impl Error {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
