//! A thread-safe fixed-block memory pool vending aligned buffers.
//!
//! [`MemPool<T, ALIGN>`] allocates one contiguous region up front, carves it into
//! equally sized blocks whose starts all land on `ALIGN`-byte boundaries, and hands the
//! blocks out as [`smart_buffers::UniqueBuffer<T>`] values. Each buffer's deleter
//! returns the block to the pool, so the ordinary Rust drop is the return path and the
//! pool composes with everything else in the buffer family (sharing, releasing,
//! re-ingesting).
//!
//! The pool has a fixed capacity. When every block is out, [`MemPool::allocate()`]
//! reports [`PoolError::Exhausted`] rather than growing; callers that can wait simply
//! retry after a buffer somewhere gets dropped.
//!
//! # Examples
//!
//! ```rust
//! use aligned_pool::{MemPool, PoolError};
//!
//! // Two blocks of 64 elements, block starts on 128-byte boundaries.
//! let pool = MemPool::<u64, 128>::new(64, 2)?;
//!
//! let first = pool.allocate()?;
//! let second = pool.allocate()?;
//! assert_eq!(pool.allocate().unwrap_err(), PoolError::Exhausted);
//!
//! drop(first);
//!
//! // A returned block is immediately available again.
//! let third = pool.allocate()?;
//! assert_eq!(third.ptr() as usize % 128, 0);
//! # Ok::<(), aligned_pool::PoolError>(())
//! ```

mod error;
mod pool;

pub use error::PoolError;
pub use pool::MemPool;
