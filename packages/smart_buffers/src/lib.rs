//! Owning and non-owning buffer primitives for performance-sensitive data pipelines.
//!
//! This crate provides a small family of interlocking buffer types that together define
//! an ownership algebra for contiguous runs of elements: who frees the memory, when, and
//! through which callback. The types are deliberately pointer-centric - they never hold
//! Rust references to the payload, so callers remain in control of aliasing, and payloads
//! in foreign memory (device, pinned host) can be described without being dereferenced.
//!
//! # The ownership family
//!
//! - [`BufferView<T>`]: a non-owning `(pointer, length, location)` triple. No lifecycle.
//! - [`UniqueBuffer<T>`]: a move-only sole owner carrying a [`Deleter<T>`] that runs when
//!   the buffer is dropped or reset.
//! - [`SharedBuffer<T>`]: an atomically reference-counted co-owner. Supports a
//!   *conditional release* that reclaims exclusive ownership only when the caller is the
//!   sole owner.
//! - [`ReleasedBuffer<T>`]: the passive hand-off record produced by `release()` on either
//!   owning buffer. The receiver either ingests it into a new owner or invokes the deleter
//!   directly, exactly once.
//!
//! Every buffer carries a [`MemoryLocation`] tag describing where the payload lives. The
//! tag is carried, never interpreted: nothing in this crate dereferences a pointer based
//! on it. Callers using [`MemoryLocation::Device`] or [`MemoryLocation::Unified`] memory
//! are expected to supply deleters appropriate for those locations and to refrain from
//! the slice accessors.
//!
//! # Examples
//!
//! Hand a heap array between ownership modes:
//!
//! ```rust
//! use smart_buffers::{MemoryLocation, SharedBuffer, UniqueBuffer};
//!
//! // A unique buffer that owns a default-initialized heap array.
//! let unique = UniqueBuffer::<u32>::allocate(16, MemoryLocation::Host)?;
//! assert_eq!(unique.len(), 16);
//!
//! // Promote to shared ownership. The deleter migrates along.
//! let shared = SharedBuffer::from(unique);
//! assert_eq!(shared.use_count(), 1);
//!
//! // Sole owner, so we may take exclusive ownership back.
//! let mut shared = shared;
//! let released = shared.release().expect("we are the only owner");
//!
//! // Re-ingest into a unique buffer; end of scope frees the array.
//! let unique = UniqueBuffer::from(released);
//! assert_eq!(unique.len(), 16);
//! # Ok::<(), smart_buffers::AllocError>(())
//! ```

mod deleter;
mod error;
mod location;
mod released;
mod shared;
mod unique;
mod view;

pub use deleter::Deleter;
pub use error::AllocError;
pub use location::MemoryLocation;
pub use released::ReleasedBuffer;
pub use shared::SharedBuffer;
pub use unique::UniqueBuffer;
pub use view::BufferView;
