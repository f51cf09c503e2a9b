use std::fmt;
use std::ptr::NonNull;

use crate::MemoryLocation;

/// A non-owning view over a contiguous run of elements: `(pointer, length, location)`.
///
/// A view has no lifecycle of its own - it is a described pointer, nothing more. The
/// referent's lifetime is entirely the caller's responsibility, which is also why the
/// accessors that materialize references ([`as_slice()`][Self::as_slice] and friends)
/// are `unsafe`.
///
/// # Invariant
///
/// Either the view is empty (null pointer, zero length), or the pointer refers to
/// `len()` contiguous, initialized, properly aligned elements. [`from_raw()`][Self::from_raw]
/// normalizes a null pointer or a zero length to the empty view, so the two degenerate
/// states cannot diverge.
///
/// # Thread safety
///
/// The view is [`Send`] when `T` is [`Send`] and [`Sync`] when `T` is [`Sync`], mirroring
/// the payload's own thread affinity. Views are [`Copy`]; two copies alias the same
/// memory, and the caller is responsible for not creating conflicting accesses through
/// them.
pub struct BufferView<T> {
    ptr: Option<NonNull<T>>,
    len: usize,
    location: MemoryLocation,
}

impl<T> BufferView<T> {
    /// Creates an empty view: null pointer, zero length, [`MemoryLocation::Host`].
    #[must_use]
    pub fn empty() -> Self {
        Self {
            ptr: None,
            len: 0,
            location: MemoryLocation::Host,
        }
    }

    /// Creates a view over `len` elements starting at `ptr`.
    ///
    /// A null `ptr` or a zero `len` yields the empty view.
    ///
    /// # Safety
    ///
    /// If `ptr` is non-null and `len` is non-zero, the caller must ensure that `ptr`
    /// refers to `len` contiguous, initialized elements of `T`, properly aligned, for as
    /// long as the view (or any copy of it) is used to access them.
    #[must_use]
    pub unsafe fn from_raw(ptr: *mut T, len: usize, location: MemoryLocation) -> Self {
        let Some(ptr) = NonNull::new(ptr) else {
            return Self::empty();
        };

        if len == 0 {
            return Self::empty();
        }

        Self {
            ptr: Some(ptr),
            len,
            location,
        }
    }

    pub(crate) fn from_parts(
        ptr: Option<NonNull<T>>,
        len: usize,
        location: MemoryLocation,
    ) -> Self {
        debug_assert!(ptr.is_some() || len == 0);

        Self { ptr, len, location }
    }

    /// The start of the viewed memory, or null if the view is empty.
    #[must_use]
    pub fn ptr(&self) -> *mut T {
        self.ptr.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// The number of elements in the view.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view covers no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The size of the viewed memory in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        // Cannot overflow: a valid referent of `len` elements fits in virtual memory.
        self.len.wrapping_mul(size_of::<T>())
    }

    /// Where the viewed memory lives.
    #[must_use]
    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    /// Borrows the viewed elements as a slice. Empty views yield an empty slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// 1. The referent is still live and host-accessible (not
    ///    [`MemoryLocation::Device`]).
    /// 2. No conflicting writes to the viewed memory occur while the returned slice is
    ///    alive.
    #[must_use]
    pub unsafe fn as_slice<'a>(&self) -> &'a [T] {
        let Some(ptr) = self.ptr else {
            return &[];
        };

        // SAFETY: The view invariant guarantees `len` initialized contiguous elements;
        // the caller guarantees liveness and absence of conflicting writes.
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) }
    }

    /// Borrows the viewed elements as a mutable slice. Empty views yield an empty slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// 1. The referent is still live and host-accessible (not
    ///    [`MemoryLocation::Device`]).
    /// 2. No other access to the viewed memory occurs while the returned slice is alive -
    ///    including access through copies of this view or through the owning buffer.
    #[must_use]
    #[allow(
        clippy::mut_from_ref,
        reason = "the safety contract makes the caller responsible for exclusivity"
    )]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [T] {
        let Some(ptr) = self.ptr else {
            return &mut [];
        };

        // SAFETY: The view invariant guarantees `len` initialized contiguous elements;
        // the caller guarantees exclusive access for the lifetime of the slice.
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) }
    }

    /// Borrows the viewed elements as raw bytes.
    ///
    /// Only available when `T` has no padding or uninitialized bytes
    /// ([`bytemuck::NoUninit`]); this is the compile-time gate that replaces the
    /// "trivially copyable" requirement of byte-level access.
    ///
    /// # Safety
    ///
    /// Same requirements as [`as_slice()`][Self::as_slice].
    #[must_use]
    pub unsafe fn as_bytes<'a>(&self) -> &'a [u8]
    where
        T: bytemuck::NoUninit,
    {
        // SAFETY: Forwarding the liveness and aliasing requirements to the caller.
        bytemuck::cast_slice(unsafe { self.as_slice() })
    }
}

impl<T> Clone for BufferView<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BufferView<T> {}

impl<T> Default for BufferView<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> fmt::Debug for BufferView<T> {
    #[cfg_attr(test, mutants::skip)] // Diagnostic output only, not worth mutation testing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferView")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("location", &self.location)
            .finish()
    }
}

// SAFETY: A view is a described pointer to `T` payload; sending it between threads is
// sound exactly when sending the payload itself would be.
unsafe impl<T: Send> Send for BufferView<T> {}

// SAFETY: Shared access to the view only permits payload access gated by further unsafe
// code; `T: Sync` is the payload-level requirement for shared cross-thread reads.
unsafe impl<T: Sync> Sync for BufferView<T> {}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(BufferView<u8>: Copy, Send, Sync);

    #[test]
    fn empty_view_has_null_pointer_and_zero_length() {
        let view = BufferView::<u32>::empty();

        assert!(view.ptr().is_null());
        assert_eq!(view.len(), 0);
        assert!(view.is_empty());
        assert_eq!(view.len_bytes(), 0);
        assert_eq!(view.location(), MemoryLocation::Host);
    }

    #[test]
    fn null_pointer_normalizes_to_empty() {
        // SAFETY: A null pointer is explicitly allowed and yields the empty view.
        let view =
            unsafe { BufferView::<u32>::from_raw(std::ptr::null_mut(), 5, MemoryLocation::Host) };

        assert!(view.is_empty());
        assert!(view.ptr().is_null());
    }

    #[test]
    fn zero_length_normalizes_to_empty() {
        let mut value = 42_u32;

        // SAFETY: Zero length is explicitly allowed and yields the empty view.
        let view = unsafe { BufferView::from_raw(&raw mut value, 0, MemoryLocation::Host) };

        assert!(view.is_empty());
        assert!(view.ptr().is_null());
    }

    #[test]
    fn view_exposes_elements() {
        let mut values = [1_u32, 2, 3, 4, 5];

        // SAFETY: `values` outlives the view and is valid for 5 elements.
        let view = unsafe { BufferView::from_raw(values.as_mut_ptr(), 5, MemoryLocation::Host) };

        assert_eq!(view.len(), 5);
        assert_eq!(view.len_bytes(), 5 * size_of::<u32>());

        // SAFETY: `values` is live and nothing writes to it concurrently.
        let slice = unsafe { view.as_slice() };
        assert_eq!(slice, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn mutable_slice_writes_through() {
        let mut values = [0_u8; 4];

        // SAFETY: `values` outlives the view and is valid for 4 elements.
        let view = unsafe { BufferView::from_raw(values.as_mut_ptr(), 4, MemoryLocation::Host) };

        {
            // SAFETY: No other access to `values` while the slice is alive.
            let slice = unsafe { view.as_mut_slice() };
            slice.copy_from_slice(&[9, 8, 7, 6]);
        }

        assert_eq!(values, [9, 8, 7, 6]);
    }

    #[test]
    fn byte_span_round_trip_preserves_every_bit() {
        let mut values = [0x0102_0304_u32, 0xDEAD_BEEF, 0, u32::MAX];

        // SAFETY: `values` outlives the view and is valid for 4 elements.
        let view = unsafe { BufferView::from_raw(values.as_mut_ptr(), 4, MemoryLocation::Host) };

        // SAFETY: `values` is live and nothing writes to it concurrently.
        let bytes = unsafe { view.as_bytes() };
        assert_eq!(bytes.len(), 4 * size_of::<u32>());

        let round_tripped: &[u32] = bytemuck::cast_slice(bytes);
        assert_eq!(round_tripped, &values[..]);
    }

    #[test]
    fn copies_alias_the_same_memory() {
        let mut values = [11_u16, 22];

        // SAFETY: `values` outlives both copies of the view.
        let view = unsafe { BufferView::from_raw(values.as_mut_ptr(), 2, MemoryLocation::Host) };
        let copy = view;

        assert_eq!(view.ptr(), copy.ptr());
        assert_eq!(view.len(), copy.len());
    }
}
