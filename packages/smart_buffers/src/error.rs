use thiserror::Error;

/// The self-allocating [`UniqueBuffer`][crate::UniqueBuffer] constructor could not obtain
/// memory from the system allocator.
///
/// Nothing was allocated; the caller observes no side effects.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("failed to allocate a buffer of {len} elements ({bytes} bytes)")]
pub struct AllocError {
    /// The requested element count.
    pub len: usize,

    /// The requested size in bytes.
    pub bytes: usize,
}
