use std::fmt;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;

use crate::{AllocError, BufferView, Deleter, MemoryLocation, ReleasedBuffer};

/// A move-only sole owner of a contiguous run of elements.
///
/// `UniqueBuffer` extends the non-owning view with a [`Deleter<T>`]: when the buffer is
/// dropped or [`reset()`][Self::reset], the deleter is invoked once on the payload
/// pointer. [`release()`][Self::release] transfers all four fields out as a
/// [`ReleasedBuffer<T>`] instead, after which this buffer will never run the deleter.
///
/// There is no reference counting here; for co-ownership, ingest the buffer into a
/// [`SharedBuffer<T>`][crate::SharedBuffer].
///
/// # Invariant
///
/// A non-empty `UniqueBuffer` is the unique owner of its payload.
///
/// # Examples
///
/// ```rust
/// use smart_buffers::{MemoryLocation, UniqueBuffer};
///
/// let buffer = UniqueBuffer::<u64>::allocate(8, MemoryLocation::Host)?;
///
/// assert_eq!(buffer.len(), 8);
/// assert!(!buffer.is_empty());
///
/// // The payload is default-initialized.
/// // SAFETY: The buffer owns live host memory and we hold the only handle.
/// assert!(unsafe { buffer.as_slice() }.iter().all(|&x| x == 0));
///
/// // End of scope frees the allocation via the stored deleter.
/// # Ok::<(), smart_buffers::AllocError>(())
/// ```
///
/// # Thread safety
///
/// The buffer is [`Send`] when `T` is [`Send`]: moving it moves the payload. It is not
/// safe to mutate one `UniqueBuffer` from two threads, which Rust's `&mut` rules already
/// enforce.
pub struct UniqueBuffer<T> {
    ptr: Option<NonNull<T>>,
    len: usize,
    location: MemoryLocation,
    deleter: Deleter<T>,
}

impl<T> UniqueBuffer<T> {
    /// Creates an empty buffer: no payload, no deleter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ptr: None,
            len: 0,
            location: MemoryLocation::Host,
            deleter: Deleter::none(),
        }
    }

    /// Allocates a buffer of `len` default-initialized elements on the heap.
    ///
    /// The stored deleter frees the heap array. A zero `len` yields an empty buffer
    /// without allocating.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the system allocator cannot provide the memory. Nothing
    /// is allocated in that case.
    pub fn allocate(len: usize, location: MemoryLocation) -> Result<Self, AllocError>
    where
        T: Default + 'static,
    {
        if len == 0 {
            return Ok(Self::new());
        }

        let bytes = len.checked_mul(size_of::<T>()).ok_or(AllocError {
            len,
            bytes: usize::MAX,
        })?;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(len)
            .map_err(|_err| AllocError { len, bytes })?;
        storage.extend((0..len).map(|_| T::default()));

        // `try_reserve_exact` gave us exactly `len` capacity, so this does not reallocate.
        let ptr = Box::into_raw(storage.into_boxed_slice()).cast::<T>();

        let deleter = Deleter::new(move |p: *mut T| {
            // SAFETY: The callback is only ever invoked with the pointer produced by
            // Box::into_raw above, exactly once, per the Deleter contract. Reassembling
            // the box drops the elements and frees the array.
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(p, len)));
            }
        });

        Ok(Self {
            // Box::into_raw never returns null.
            ptr: NonNull::new(ptr),
            len,
            location,
            deleter,
        })
    }

    /// Adopts external memory: `len` elements at `ptr`, to be released by `deleter`.
    ///
    /// A null `ptr` or a zero `len` yields an empty buffer and the deleter is dropped
    /// without being invoked.
    ///
    /// # Safety
    ///
    /// If `ptr` is non-null and `len` is non-zero, the caller must ensure that:
    ///
    /// 1. `ptr` refers to `len` contiguous, initialized elements of `T` forming a live
    ///    allocation, and no other owner will free it.
    /// 2. Invoking `deleter` on `ptr` exactly once is the correct way to release the
    ///    allocation (an empty deleter means the caller keeps that responsibility).
    #[must_use]
    pub unsafe fn from_raw(
        ptr: *mut T,
        len: usize,
        deleter: Deleter<T>,
        location: MemoryLocation,
    ) -> Self {
        let Some(ptr) = NonNull::new(ptr) else {
            return Self::new();
        };

        if len == 0 {
            return Self::new();
        }

        Self {
            ptr: Some(ptr),
            len,
            location,
            deleter,
        }
    }

    /// The payload pointer, or null if the buffer is empty.
    #[must_use]
    pub fn ptr(&self) -> *mut T {
        self.ptr.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// The number of elements owned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer owns no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }

    /// The size of the payload in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.view().len_bytes()
    }

    /// Where the payload lives.
    #[must_use]
    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    /// A clone of the stored deleter. Empty if the buffer has none.
    #[must_use]
    pub fn deleter(&self) -> Deleter<T> {
        self.deleter.clone()
    }

    /// A non-owning view over the current payload.
    #[must_use]
    pub fn view(&self) -> BufferView<T> {
        BufferView::from_parts(self.ptr, self.len, self.location)
    }

    /// Borrows the payload as a slice.
    ///
    /// # Safety
    ///
    /// The payload must be host-accessible (not [`MemoryLocation::Device`]) and no
    /// conflicting writes may occur through other pointers to it while the slice is
    /// alive.
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[T] {
        // SAFETY: A non-empty buffer uniquely owns `len` initialized elements; the
        // caller vouches for host accessibility and the absence of foreign writers.
        unsafe { self.view().as_slice() }
    }

    /// Borrows the payload as a mutable slice.
    ///
    /// # Safety
    ///
    /// The payload must be host-accessible (not [`MemoryLocation::Device`]) and no other
    /// access may occur through other pointers to it while the slice is alive.
    #[must_use]
    pub unsafe fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: As in as_slice(); `&mut self` rules out access through this handle.
        unsafe { self.view().as_mut_slice() }
    }

    /// Borrows the payload as raw bytes. See [`BufferView::as_bytes()`].
    ///
    /// # Safety
    ///
    /// Same requirements as [`as_slice()`][Self::as_slice].
    #[must_use]
    pub unsafe fn as_bytes(&self) -> &[u8]
    where
        T: bytemuck::NoUninit,
    {
        // SAFETY: Forwarding the requirements to the caller.
        unsafe { self.view().as_bytes() }
    }

    /// Transfers ownership out as a [`ReleasedBuffer<T>`].
    ///
    /// All four fields move into the record; this buffer becomes empty and will never
    /// invoke the deleter.
    #[must_use = "dropping the released buffer leaks the payload"]
    pub fn release(&mut self) -> ReleasedBuffer<T> {
        let ptr = self.ptr.take();
        let len = mem::replace(&mut self.len, 0);
        let location = mem::replace(&mut self.location, MemoryLocation::Host);
        let deleter = mem::take(&mut self.deleter);

        ReleasedBuffer::from_parts(ptr, len, deleter, location)
    }

    /// Releases the payload now: invokes the deleter (if any) and becomes empty.
    ///
    /// Infallible by contract: a panicking deleter is swallowed and the buffer still
    /// ends up empty. The deleter is cleared even when the buffer was already empty.
    pub fn reset(&mut self) {
        let (ptr, _len, deleter, _location) = self.release().into_raw_parts();

        let Some(ptr) = ptr else {
            return;
        };

        if deleter.is_none() {
            return;
        }

        // Swallow a panicking deleter; destruction paths must be infallible.
        drop(catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: We were the unique owner until the release() above and this is
            // the single invocation of the deleter for this payload.
            unsafe { deleter.invoke(ptr.as_ptr()) };
        })));
    }

    /// Takes the contents, leaving this buffer empty.
    ///
    /// This is the explicit spelling of "move out of a `&mut`".
    #[must_use]
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// Exchanges the contents of two buffers.
    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(self, other);
    }
}

impl<T> From<ReleasedBuffer<T>> for UniqueBuffer<T> {
    /// Ingests a released buffer verbatim, including an empty deleter if it carried one.
    fn from(released: ReleasedBuffer<T>) -> Self {
        let (ptr, len, deleter, location) = released.into_raw_parts();

        Self {
            ptr,
            len,
            location,
            deleter,
        }
    }
}

impl<T> Default for UniqueBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for UniqueBuffer<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T> fmt::Debug for UniqueBuffer<T> {
    #[cfg_attr(test, mutants::skip)] // Diagnostic output only, not worth mutation testing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("location", &self.location)
            .field("deleter", &self.deleter)
            .finish()
    }
}

// SAFETY: Moving the buffer moves sole ownership of the `T` payload to another thread,
// which is sound exactly when `T: Send`. The deleter is always Send + Sync.
unsafe impl<T: Send> Send for UniqueBuffer<T> {}

// SAFETY: Shared references to the buffer only expose the payload through further
// unsafe code; `T: Sync` is the payload-level requirement for shared reads.
unsafe impl<T: Sync> Sync for UniqueBuffer<T> {}
