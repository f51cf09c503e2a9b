use std::fmt;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{BufferView, Deleter, MemoryLocation, ReleasedBuffer, UniqueBuffer};

/// The heap-allocated bookkeeping shared by every co-owner of one payload.
///
/// The payload fields are written once at creation and never mutated; only `refs`
/// changes afterwards, so concurrent clones and drops never race on anything else.
struct ControlBlock<T> {
    refs: AtomicUsize,
    ptr: NonNull<T>,
    len: usize,
    deleter: Deleter<T>,
    location: MemoryLocation,
}

/// A reference-counted co-owner of a contiguous run of elements.
///
/// Cloning a `SharedBuffer` adds a sharer; dropping one removes it. The last sharer to
/// go invokes the stored [`Deleter<T>`] on the payload pointer. A sole sharer may
/// instead reclaim exclusive ownership with [`release()`][Self::release], which hands
/// the payload out as a [`ReleasedBuffer<T>`].
///
/// # Examples
///
/// ```rust
/// use smart_buffers::{MemoryLocation, SharedBuffer, UniqueBuffer};
///
/// let unique = UniqueBuffer::<u32>::allocate(16, MemoryLocation::Host)?;
/// let shared = SharedBuffer::from(unique);
///
/// let second = shared.clone();
/// assert_eq!(shared.use_count(), 2);
/// assert_eq!(second.ptr(), shared.ptr());
///
/// drop(second);
/// assert_eq!(shared.use_count(), 1);
/// # Ok::<(), smart_buffers::AllocError>(())
/// ```
///
/// # Thread safety
///
/// Clones may be created, dropped and released from any number of threads concurrently.
/// Exactly one of those operations observes the count reaching zero (or wins the
/// one-to-zero race in `release()`), so the deleter runs exactly once per payload.
pub struct SharedBuffer<T> {
    /// `None` for the empty buffer; otherwise one share of the control block.
    ctrl: Option<NonNull<ControlBlock<T>>>,
}

impl<T> SharedBuffer<T> {
    /// Creates an empty buffer that participates in no sharing.
    #[must_use]
    pub fn new() -> Self {
        Self { ctrl: None }
    }

    /// Adopts external memory under shared ownership, starting at one sharer.
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
    ///    allocation (an empty deleter means the last sharer frees nothing).
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

        let block = Box::new(ControlBlock {
            refs: AtomicUsize::new(1),
            ptr,
            len,
            deleter,
            location,
        });

        Self {
            // Box::into_raw never returns null.
            ctrl: NonNull::new(Box::into_raw(block)),
        }
    }

    fn block(&self) -> Option<&ControlBlock<T>> {
        // SAFETY: Holding `self` keeps one share of the count, so the control block
        // outlives this borrow. Only `refs` is ever mutated, atomically.
        self.ctrl.map(|ctrl| unsafe { ctrl.as_ref() })
    }

    /// The payload pointer, or null if the buffer is empty.
    #[must_use]
    pub fn ptr(&self) -> *mut T {
        self.block()
            .map_or(std::ptr::null_mut(), |block| block.ptr.as_ptr())
    }

    /// The number of elements in the shared payload.
    #[must_use]
    pub fn len(&self) -> usize {
        self.block().map_or(0, |block| block.len)
    }

    /// Whether the buffer shares no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ctrl.is_none()
    }

    /// The size of the payload in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.view().len_bytes()
    }

    /// Where the payload lives.
    #[must_use]
    pub fn location(&self) -> MemoryLocation {
        self.block()
            .map_or(MemoryLocation::Host, |block| block.location)
    }

    /// The number of sharers of the payload, or zero for an empty buffer.
    ///
    /// Instantaneously correct, but other threads may clone or drop concurrently, so by
    /// the time the caller inspects the value it may be stale. A return of 1 observed by
    /// the holder of the last clone is exact.
    #[must_use]
    pub fn use_count(&self) -> usize {
        self.block()
            .map_or(0, |block| block.refs.load(Ordering::Relaxed))
    }

    /// A non-owning view over the shared payload.
    #[must_use]
    pub fn view(&self) -> BufferView<T> {
        match self.block() {
            Some(block) => BufferView::from_parts(Some(block.ptr), block.len, block.location),
            None => BufferView::empty(),
        }
    }

    /// Borrows the payload as a slice.
    ///
    /// # Safety
    ///
    /// The payload must be host-accessible (not [`MemoryLocation::Device`]) and no
    /// sharer may write to it while the slice is alive.
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[T] {
        // SAFETY: Holding `self` keeps the payload alive; the caller vouches for host
        // accessibility and the absence of concurrent writers.
        unsafe { self.view().as_slice() }
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

    /// Attempts to reclaim exclusive ownership of the payload.
    ///
    /// Succeeds only if this clone is the sole sharer at the moment of the call, in
    /// which case the payload moves out as a [`ReleasedBuffer<T>`] with its deleter
    /// uninvoked, the control block is freed and this buffer becomes empty.
    ///
    /// Returns `None` if other sharers exist or the buffer is empty; the buffer is left
    /// untouched in that case. Under concurrent drops of the other clones, at most one
    /// caller wins the one-to-zero transition.
    #[must_use]
    pub fn release(&mut self) -> Option<ReleasedBuffer<T>> {
        let ctrl = self.ctrl?;

        // SAFETY: Holding `self` keeps one share of the count alive.
        let refs = unsafe { &ctrl.as_ref().refs };

        // Claim the one-to-zero transition. Acquire pairs with the AcqRel decrements of
        // the other sharers so their accesses to the payload happen-before ours.
        if refs
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        self.ctrl = None;

        // SAFETY: The count reached zero through our CAS, so no other share exists and
        // the Box we created in from_raw() can be reassembled exactly once.
        let block = unsafe { Box::from_raw(ctrl.as_ptr()) };

        let ControlBlock {
            refs: _,
            ptr,
            len,
            deleter,
            location,
        } = *block;

        Some(ReleasedBuffer::from_parts(Some(ptr), len, deleter, location))
    }

    /// Detaches from the payload now, exactly as dropping this clone would.
    ///
    /// If this was the last sharer, the deleter runs (a panicking deleter is swallowed).
    /// The buffer is empty afterwards.
    pub fn reset(&mut self) {
        let Some(ctrl) = self.ctrl.take() else {
            return;
        };

        // SAFETY: We held one share of the count until this decrement.
        let prev = unsafe { ctrl.as_ref().refs.fetch_sub(1, Ordering::AcqRel) };

        if prev != 1 {
            return;
        }

        // We were the last sharer: the count is now zero and nobody else can observe
        // the control block.
        // SAFETY: Reassembling the Box created in from_raw(), exactly once.
        let block = unsafe { Box::from_raw(ctrl.as_ptr()) };

        if block.deleter.is_some() {
            // Swallow a panicking deleter; destruction paths must be infallible.
            drop(catch_unwind(AssertUnwindSafe(|| {
                // SAFETY: Single invocation on the pointer the deleter was paired with;
                // all sharers are gone, so no references into the payload remain.
                unsafe { block.deleter.invoke(block.ptr.as_ptr()) };
            })));
        }
    }

    /// Exchanges the contents of two buffers. Sharer counts are unaffected.
    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(&mut self.ctrl, &mut other.ctrl);
    }
}

impl<T> Clone for SharedBuffer<T> {
    fn clone(&self) -> Self {
        if let Some(block) = self.block() {
            // Relaxed suffices for an increment from an existing share: the new clone's
            // later decrement is what needs ordering, not its creation.
            block.refs.fetch_add(1, Ordering::Relaxed);
        }

        Self { ctrl: self.ctrl }
    }
}

impl<T> From<ReleasedBuffer<T>> for SharedBuffer<T> {
    /// Ingests a released buffer as the sole sharer of its payload.
    fn from(released: ReleasedBuffer<T>) -> Self {
        let (ptr, len, deleter, location) = released.into_raw_parts();

        let Some(ptr) = ptr else {
            return Self::new();
        };

        let block = Box::new(ControlBlock {
            refs: AtomicUsize::new(1),
            ptr,
            len,
            deleter,
            location,
        });

        Self {
            ctrl: NonNull::new(Box::into_raw(block)),
        }
    }
}

impl<T> From<UniqueBuffer<T>> for SharedBuffer<T> {
    /// Converts exclusive ownership into shared ownership with one sharer.
    fn from(mut unique: UniqueBuffer<T>) -> Self {
        Self::from(unique.release())
    }
}

impl<T> Default for SharedBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SharedBuffer<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T> fmt::Debug for SharedBuffer<T> {
    #[cfg_attr(test, mutants::skip)] // Diagnostic output only, not worth mutation testing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .field("location", &self.location())
            .field("use_count", &self.use_count())
            .finish()
    }
}

// SAFETY: Clones on different threads can all reach the payload and can all end up
// running the deleter, so both sending a clone and sharing one require the payload to
// be fully thread-mobile. The control block itself is only mutated atomically.
unsafe impl<T: Send + Sync> Send for SharedBuffer<T> {}

// SAFETY: As above; `&SharedBuffer` allows cloning, which is ownership-equivalent.
unsafe impl<T: Send + Sync> Sync for SharedBuffer<T> {}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(SharedBuffer<u8>: Clone, Send, Sync);
    assert_not_impl_any!(SharedBuffer<std::cell::Cell<u8>>: Send, Sync);

    /// A deleter over a leaked heap array that counts its invocations.
    fn counting_array_deleter(len: usize, hits: &Arc<AtomicUsize>) -> Deleter<u32> {
        let hits = Arc::clone(hits);

        Deleter::new(move |p: *mut u32| {
            hits.fetch_add(1, Ordering::Relaxed);

            // SAFETY: Paired with a pointer produced by Box::into_raw over `len`
            // elements; the Deleter contract guarantees single invocation.
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(p, len)));
            }
        })
    }

    fn leak_array(len: usize) -> *mut u32 {
        let storage: Vec<u32> = (0..len).map(|i| u32::try_from(i).unwrap()).collect();
        Box::into_raw(storage.into_boxed_slice()).cast::<u32>()
    }

    #[test]
    fn default_construction_is_empty() {
        let buffer = SharedBuffer::<u32>::new();

        assert!(buffer.is_empty());
        assert!(buffer.ptr().is_null());
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.use_count(), 0);
    }

    #[test]
    fn adoption_starts_at_one_sharer() {
        let hits = Arc::new(AtomicUsize::new(0));
        let ptr = leak_array(8);

        // SAFETY: `ptr` is a live heap array of 8 elements and the deleter frees it.
        let buffer = unsafe {
            SharedBuffer::from_raw(ptr, 8, counting_array_deleter(8, &hits), MemoryLocation::Host)
        };

        assert!(!buffer.is_empty());
        assert_eq!(buffer.ptr(), ptr);
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.use_count(), 1);

        drop(buffer);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn clones_share_the_payload_and_the_count() {
        let hits = Arc::new(AtomicUsize::new(0));
        let ptr = leak_array(4);

        // SAFETY: `ptr` is a live heap array of 4 elements and the deleter frees it.
        let first = unsafe {
            SharedBuffer::from_raw(ptr, 4, counting_array_deleter(4, &hits), MemoryLocation::Host)
        };

        let second = first.clone();
        let third = second.clone();

        assert_eq!(first.use_count(), 3);
        assert_eq!(third.ptr(), first.ptr());
        assert_eq!(third.len(), first.len());

        drop(second);
        assert_eq!(first.use_count(), 2);
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        drop(first);
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        // Only the last sharer triggers the deleter.
        drop(third);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cloning_an_empty_buffer_stays_empty() {
        let buffer = SharedBuffer::<u32>::new();
        let clone = buffer.clone();

        assert!(clone.is_empty());
        assert_eq!(clone.use_count(), 0);
    }

    #[test]
    fn reset_detaches_one_sharer() {
        let hits = Arc::new(AtomicUsize::new(0));
        let ptr = leak_array(2);

        // SAFETY: `ptr` is a live heap array of 2 elements and the deleter frees it.
        let mut first = unsafe {
            SharedBuffer::from_raw(ptr, 2, counting_array_deleter(2, &hits), MemoryLocation::Host)
        };
        let second = first.clone();

        first.reset();

        assert!(first.is_empty());
        assert_eq!(second.use_count(), 1);
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        drop(second);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn release_fails_while_sharers_remain() {
        let hits = Arc::new(AtomicUsize::new(0));
        let ptr = leak_array(3);

        // SAFETY: `ptr` is a live heap array of 3 elements and the deleter frees it.
        let mut first = unsafe {
            SharedBuffer::from_raw(ptr, 3, counting_array_deleter(3, &hits), MemoryLocation::Host)
        };
        let second = first.clone();

        assert!(first.release().is_none());

        // The failed attempt changed nothing.
        assert!(!first.is_empty());
        assert_eq!(first.use_count(), 2);

        drop(second);

        // Now the sole sharer succeeds and the deleter travels out uninvoked.
        let released = first.release().unwrap();
        assert!(first.is_empty());
        assert_eq!(released.ptr(), ptr);
        assert_eq!(released.len(), 3);
        assert!(released.deleter().is_some());
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        let (raw, _len, deleter, _location) = released.into_parts();

        // SAFETY: Single invocation on the pointer the deleter was paired with.
        unsafe { deleter.invoke(raw) };
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn release_on_empty_buffer_returns_none() {
        let mut buffer = SharedBuffer::<u32>::new();
        assert!(buffer.release().is_none());
    }

    #[test]
    fn swap_exchanges_payloads_without_touching_counts() {
        let hits = Arc::new(AtomicUsize::new(0));
        let (ptr_a, ptr_b) = (leak_array(1), leak_array(2));

        // SAFETY: Both pointers are live heap arrays and the deleters free them.
        let mut a = unsafe {
            SharedBuffer::from_raw(ptr_a, 1, counting_array_deleter(1, &hits), MemoryLocation::Host)
        };
        // SAFETY: As above.
        let mut b = unsafe {
            SharedBuffer::from_raw(
                ptr_b,
                2,
                counting_array_deleter(2, &hits),
                MemoryLocation::HostPinned,
            )
        };
        let a_clone = a.clone();

        a.swap(&mut b);

        assert_eq!(a.ptr(), ptr_b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.location(), MemoryLocation::HostPinned);
        assert_eq!(a.use_count(), 1);

        assert_eq!(b.ptr(), ptr_a);
        assert_eq!(b.use_count(), 2);
        assert_eq!(a_clone.ptr(), ptr_a);

        drop(a);
        drop(b);
        drop(a_clone);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn ingesting_a_unique_buffer_preserves_the_deleter() {
        let hits = Arc::new(AtomicUsize::new(0));
        let ptr = leak_array(5);

        // SAFETY: `ptr` is a live heap array of 5 elements and the deleter frees it.
        let unique = unsafe {
            UniqueBuffer::from_raw(ptr, 5, counting_array_deleter(5, &hits), MemoryLocation::Host)
        };

        let shared = SharedBuffer::from(unique);

        assert_eq!(shared.ptr(), ptr);
        assert_eq!(shared.len(), 5);
        assert_eq!(shared.use_count(), 1);

        drop(shared);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn ingesting_an_empty_released_buffer_stays_empty() {
        let shared = SharedBuffer::<u32>::from(ReleasedBuffer::empty());

        assert!(shared.is_empty());
        assert_eq!(shared.use_count(), 0);
    }

    #[test]
    fn payload_round_trips_between_unique_and_shared() {
        let mut unique = UniqueBuffer::<u32>::allocate(4, MemoryLocation::Host).unwrap();

        {
            // SAFETY: We hold the only handle to live host memory.
            let slice = unsafe { unique.as_mut_slice() };
            slice.copy_from_slice(&[10, 20, 30, 40]);
        }

        let ptr = unique.ptr();

        let mut shared = SharedBuffer::from(unique);
        assert_eq!(shared.ptr(), ptr);

        let released = shared.release().unwrap();
        let recovered = UniqueBuffer::from(released);

        assert_eq!(recovered.ptr(), ptr);
        assert_eq!(recovered.len(), 4);

        // SAFETY: Exclusive ownership of live host memory.
        assert_eq!(unsafe { recovered.as_slice() }, &[10, 20, 30, 40]);
    }

    #[test]
    fn deleter_survives_the_full_ownership_journey() {
        let hits = Arc::new(AtomicUsize::new(0));
        let ptr = leak_array(5);

        // SAFETY: `ptr` is a live heap array of 5 elements and the deleter frees it.
        let unique = unsafe {
            UniqueBuffer::from_raw(ptr, 5, counting_array_deleter(5, &hits), MemoryLocation::Host)
        };

        // Unique -> shared: nothing fires.
        let mut shared = SharedBuffer::from(unique);
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        // Shared -> released: still nothing fires.
        let released = shared.release().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        // The final holder invokes the deleter by hand, exactly once.
        let (raw, _len, deleter, _location) = released.into_parts();

        // SAFETY: Single invocation on the pointer the deleter was paired with.
        unsafe { deleter.invoke(raw) };
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn panicking_deleter_is_swallowed_on_last_drop() {
        let ptr = leak_array(3);

        let deleter = Deleter::new(move |p: *mut u32| {
            // SAFETY: Single invocation on the paired pointer; free before panicking.
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(p, 3)));
            }
            panic!("deleter failure");
        });

        // SAFETY: `ptr` is a live heap array of 3 elements and the deleter frees it.
        let buffer = unsafe { SharedBuffer::from_raw(ptr, 3, deleter, MemoryLocation::Host) };

        // Must not propagate the panic out of drop.
        drop(buffer);
    }

    #[test]
    fn concurrent_clones_and_drops_fire_the_deleter_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let ptr = leak_array(16);

        // SAFETY: `ptr` is a live heap array of 16 elements and the deleter frees it.
        let buffer = unsafe {
            SharedBuffer::from_raw(
                ptr,
                16,
                counting_array_deleter(16, &hits),
                MemoryLocation::Host,
            )
        };

        thread::scope(|s| {
            for _ in 0..8 {
                let clone = buffer.clone();

                s.spawn(move || {
                    for _ in 0..1000 {
                        let inner = clone.clone();
                        assert_eq!(inner.len(), 16);
                    }
                });
            }
        });

        assert_eq!(buffer.use_count(), 1);
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        drop(buffer);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn concurrent_release_has_at_most_one_winner() {
        for _ in 0..50 {
            let hits = Arc::new(AtomicUsize::new(0));
            let ptr = leak_array(4);

            // SAFETY: `ptr` is a live heap array of 4 elements and the deleter frees it.
            let buffer = unsafe {
                SharedBuffer::from_raw(
                    ptr,
                    4,
                    counting_array_deleter(4, &hits),
                    MemoryLocation::Host,
                )
            };

            let winners = AtomicUsize::new(0);

            thread::scope(|s| {
                for _ in 0..4 {
                    let mut clone = buffer.clone();
                    let winners = &winners;

                    s.spawn(move || {
                        if let Some(released) = clone.release() {
                            winners.fetch_add(1, Ordering::Relaxed);

                            let (raw, _len, deleter, _location) = released.into_parts();

                            // SAFETY: The winner is the sole owner; single invocation.
                            unsafe { deleter.invoke(raw) };
                        }
                    });
                }

                drop(buffer);
            });

            // Either one thread won the release, or the drops freed the payload.
            let wins = winners.load(Ordering::Relaxed);
            assert!(wins <= 1);
            assert_eq!(hits.load(Ordering::Relaxed), 1);
        }
    }
}
