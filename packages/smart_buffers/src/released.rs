use std::fmt;
use std::ptr::NonNull;

use crate::{Deleter, MemoryLocation};

/// The passive hand-off record produced by `release()` on an owning buffer.
///
/// A `ReleasedBuffer` is the currency of ownership transfer: it carries the payload
/// pointer, the element count, the [`Deleter<T>`] and the [`MemoryLocation`], and nothing
/// else. It performs no cleanup of its own - dropping a non-empty record leaks the
/// payload unless someone else still manages it.
///
/// The holder consumes the record in one of two ways:
///
/// - ingest it into a new owner ([`UniqueBuffer::from`][crate::UniqueBuffer] or
///   [`SharedBuffer::from`][crate::SharedBuffer]), or
/// - take it apart with [`into_parts()`][Self::into_parts] and invoke the deleter on the
///   pointer exactly once.
///
/// An empty deleter inside a non-empty record means the previous owner had no automatic
/// cleanup either; the receiver must still manage the memory.
pub struct ReleasedBuffer<T> {
    ptr: Option<NonNull<T>>,
    len: usize,
    deleter: Deleter<T>,
    location: MemoryLocation,
}

impl<T> ReleasedBuffer<T> {
    /// Creates an empty record: no payload, no deleter.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            ptr: None,
            len: 0,
            deleter: Deleter::none(),
            location: MemoryLocation::Host,
        }
    }

    /// Creates a record describing a payload of `len` elements at `ptr`.
    ///
    /// A null `ptr` or a zero `len` yields the empty record and the deleter is dropped
    /// without being invoked.
    ///
    /// # Safety
    ///
    /// If `ptr` is non-null and `len` is non-zero, the caller must ensure that `ptr`
    /// refers to `len` contiguous, initialized elements of `T` forming a live allocation,
    /// and that invoking `deleter` on `ptr` exactly once is the correct way to release
    /// that allocation.
    #[must_use]
    pub unsafe fn new(
        ptr: *mut T,
        len: usize,
        deleter: Deleter<T>,
        location: MemoryLocation,
    ) -> Self {
        let Some(ptr) = NonNull::new(ptr) else {
            return Self::empty();
        };

        if len == 0 {
            return Self::empty();
        }

        Self {
            ptr: Some(ptr),
            len,
            deleter,
            location,
        }
    }

    pub(crate) fn from_parts(
        ptr: Option<NonNull<T>>,
        len: usize,
        deleter: Deleter<T>,
        location: MemoryLocation,
    ) -> Self {
        debug_assert!(ptr.is_some() || len == 0);

        Self {
            ptr,
            len,
            deleter,
            location,
        }
    }

    pub(crate) fn into_raw_parts(self) -> (Option<NonNull<T>>, usize, Deleter<T>, MemoryLocation) {
        (self.ptr, self.len, self.deleter, self.location)
    }

    /// The payload pointer, or null if the record is empty.
    #[must_use]
    pub fn ptr(&self) -> *mut T {
        self.ptr.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// The number of elements in the payload.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the record carries no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }

    /// The release callback that travels with the payload. May be empty.
    #[must_use]
    pub fn deleter(&self) -> &Deleter<T> {
        &self.deleter
    }

    /// Where the payload lives.
    #[must_use]
    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    /// Takes the record apart, transferring full responsibility to the caller.
    ///
    /// If the returned deleter is non-empty, the caller must invoke it on the returned
    /// pointer exactly once to release the payload.
    #[must_use]
    pub fn into_parts(self) -> (*mut T, usize, Deleter<T>, MemoryLocation) {
        let ptr = self.ptr.map_or(std::ptr::null_mut(), NonNull::as_ptr);
        (ptr, self.len, self.deleter, self.location)
    }
}

impl<T> Default for ReleasedBuffer<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> fmt::Debug for ReleasedBuffer<T> {
    #[cfg_attr(test, mutants::skip)] // Diagnostic output only, not worth mutation testing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleasedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("deleter", &self.deleter)
            .field("location", &self.location)
            .finish()
    }
}

// SAFETY: The record owns its payload the way a `UniqueBuffer` does; moving it to
// another thread moves the `T` payload, which requires `T: Send`.
unsafe impl<T: Send> Send for ReleasedBuffer<T> {}
