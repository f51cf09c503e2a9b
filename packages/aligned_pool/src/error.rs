use thiserror::Error;

/// The ways in which [`MemPool`][crate::MemPool] construction or allocation can fail.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum PoolError {
    /// The requested block size was zero. Nothing was allocated.
    #[error("block_size must be non-zero")]
    ZeroBlockSize,

    /// The requested block count was zero. Nothing was allocated.
    #[error("block_count must be non-zero")]
    ZeroBlockCount,

    /// The backing region size did not fit in `usize`. Nothing was allocated.
    #[error("pool capacity computation overflowed usize")]
    CapacityOverflow,

    /// The system allocator could not provide the backing region.
    #[error("failed to allocate the pool region ({bytes} bytes)")]
    OutOfMemory {
        /// The requested region size in bytes.
        bytes: usize,
    },

    /// Every block is currently handed out. Retry after a buffer is dropped.
    #[error("no free blocks available in the pool")]
    Exhausted,
}
