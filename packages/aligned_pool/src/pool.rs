use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use num_integer::lcm;
use scopeguard::ScopeGuard;
use smart_buffers::{Deleter, MemoryLocation, UniqueBuffer};

use crate::PoolError;

/// The shared heart of a pool: one aligned region, carved into blocks, and the free list.
///
/// Lives behind an [`Arc`] held by the [`MemPool`] handle and by the deleter of every
/// outstanding buffer, so the region cannot be freed while any block is still out.
struct PoolCore<T, const ALIGN: usize> {
    /// Start of the backing region, alignment `ALIGN`.
    region: NonNull<u8>,

    /// Total region size in bytes. Equals `stride_bytes * block_count` exactly.
    region_bytes: usize,

    /// Usable elements per block.
    block_size: usize,

    /// Total number of blocks carved out of the region.
    block_count: usize,

    /// Distance between consecutive block starts, in bytes. A multiple of both
    /// `size_of::<T>()` and `ALIGN`, so every block start lands on an `ALIGN` boundary.
    stride_bytes: usize,

    location: MemoryLocation,

    /// Block starts currently available for allocation. Popped and pushed at the back,
    /// so the most recently returned block is handed out next.
    free_blocks: Mutex<Vec<NonNull<T>>>,
}

impl<T, const ALIGN: usize> PoolCore<T, ALIGN> {
    /// The start of block `index`.
    fn block_start(&self, index: usize) -> NonNull<T> {
        debug_assert!(index < self.block_count);

        // Cannot overflow because `index < block_count` and
        // `stride_bytes * block_count` was checked at construction.
        let offset = index.wrapping_mul(self.stride_bytes);
        let ptr = self.region.as_ptr().wrapping_add(offset).cast::<T>();

        // SAFETY: Offsetting a non-null base within its own allocation stays non-null.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Whether `ptr` is the start of one of this pool's blocks.
    #[cfg_attr(test, mutants::skip)] // Only consulted by debug assertions - mutations are untestable.
    fn owns_block_start(&self, ptr: *mut T) -> bool {
        let base = self.region.as_ptr() as usize;
        let addr = ptr as usize;
        let offset = addr.wrapping_sub(base);

        addr >= base
            && offset < self.region_bytes
            && offset.checked_rem(self.stride_bytes) == Some(0)
    }

    /// Locks the free list, shrugging off poisoning.
    ///
    /// The critical sections only push or pop a `Vec` element, so a poisoned lock
    /// carries no broken invariant worth propagating.
    fn free_list(&self) -> MutexGuard<'_, Vec<NonNull<T>>> {
        self.free_blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a previously vended block to the free list.
    fn recycle(&self, ptr: *mut T) {
        debug_assert!(self.owns_block_start(ptr));

        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        self.free_list().push(ptr);
    }
}

impl<T, const ALIGN: usize> Drop for PoolCore<T, ALIGN> {
    fn drop(&mut self) {
        // By the time the last Arc share goes away, every block is back in the free
        // list, so the usable region of every block holds initialized elements.
        if std::mem::needs_drop::<T>() {
            for index in 0..self.block_count {
                let elements = std::ptr::slice_from_raw_parts_mut(
                    self.block_start(index).as_ptr(),
                    self.block_size,
                );

                // SAFETY: Each block's usable region was initialized at construction
                // and only ever overwritten with valid values of T since.
                unsafe { std::ptr::drop_in_place(elements) };
            }
        }

        // SAFETY: The size and alignment were validated by Layout::from_size_align at
        // construction, and `region` came from alloc() with this exact layout.
        let layout = unsafe { Layout::from_size_align_unchecked(self.region_bytes, ALIGN) };

        // SAFETY: Allocated in MemPool::with_location with this layout, freed once here.
        unsafe { std::alloc::dealloc(self.region.as_ptr(), layout) };
    }
}

// SAFETY: The core owns its elements the way a Vec<T> does and guards the free list
// with a mutex; moving or sharing it across threads requires only that the elements
// themselves may be dropped and accessed from another thread.
unsafe impl<T: Send, const ALIGN: usize> Send for PoolCore<T, ALIGN> {}

// SAFETY: As above. All shared-state mutation goes through the mutex.
unsafe impl<T: Send, const ALIGN: usize> Sync for PoolCore<T, ALIGN> {}

/// A thread-safe fixed-block memory pool vending [`UniqueBuffer<T>`].
///
/// The pool allocates one contiguous region up front and carves it into `block_count`
/// blocks of `block_size` usable elements each. Block starts are spaced so that every
/// one of them lands on an `ALIGN`-byte boundary; the gap between the usable elements
/// and the next block start is padding. There is no growth after construction: when all
/// blocks are out, [`allocate()`][Self::allocate] reports
/// [`PoolError::Exhausted`] until a buffer is dropped.
///
/// Each vended buffer carries a deleter that returns its block to the free list, so a
/// buffer drop anywhere in the program is a pool return. The free list is LIFO; the
/// most recently returned block is the next one handed out, which keeps hot blocks hot.
///
/// The backing region lives as long as the pool handle *or* any outstanding buffer:
/// dropping the `MemPool` first is safe, buffers keep the region alive until the last
/// one returns.
///
/// Blocks are default-initialized once, at construction. A recycled block is handed out
/// as-is, retaining whatever the previous holder wrote.
///
/// # Compile-time requirements
///
/// `ALIGN` must be a power of two and at least `align_of::<T>()`, and `T` must not be
/// zero-sized. Violations fail compilation.
///
/// # Examples
///
/// ```rust
/// use aligned_pool::MemPool;
///
/// // 4 blocks of 256 u32s each, block starts on 64-byte boundaries.
/// let pool = MemPool::<u32>::new(256, 4)?;
///
/// let buffer = pool.allocate()?;
/// assert_eq!(buffer.len(), 256);
/// assert_eq!(buffer.ptr() as usize % 64, 0);
/// assert_eq!(pool.available(), 3);
///
/// // Dropping the buffer returns its block.
/// drop(buffer);
/// assert_eq!(pool.available(), 4);
/// # Ok::<(), aligned_pool::PoolError>(())
/// ```
pub struct MemPool<T, const ALIGN: usize = 64> {
    core: Arc<PoolCore<T, ALIGN>>,
}

impl<T, const ALIGN: usize> MemPool<T, ALIGN>
where
    T: Send + 'static,
{
    /// Creates a pool of `block_count` blocks of `block_size` elements in
    /// [`MemoryLocation::Host`] memory.
    ///
    /// # Errors
    ///
    /// See [`with_location()`][Self::with_location].
    pub fn new(block_size: usize, block_count: usize) -> Result<Self, PoolError>
    where
        T: Default,
    {
        Self::with_location(block_size, block_count, MemoryLocation::Host)
    }

    /// Creates a pool whose vended buffers carry the given location tag.
    ///
    /// The region itself is always obtained from the system allocator; the tag travels
    /// with the buffers for the benefit of downstream consumers.
    ///
    /// Every block's usable elements are default-initialized. If a `T::default()` call
    /// panics, the elements constructed so far are dropped, the region is freed and the
    /// panic propagates.
    ///
    /// # Errors
    ///
    /// - [`PoolError::ZeroBlockSize`] / [`PoolError::ZeroBlockCount`] for zero
    ///   arguments.
    /// - [`PoolError::CapacityOverflow`] if the region size does not fit in `usize`.
    /// - [`PoolError::OutOfMemory`] if the system allocator refuses the region.
    ///
    /// Nothing is allocated in any error case.
    pub fn with_location(
        block_size: usize,
        block_count: usize,
        location: MemoryLocation,
    ) -> Result<Self, PoolError>
    where
        T: Default,
    {
        const {
            assert!(ALIGN.is_power_of_two(), "ALIGN must be a power of two");
            assert!(
                ALIGN >= align_of::<T>(),
                "ALIGN must be at least the element type's own alignment"
            );
            assert!(size_of::<T>() > 0, "zero-sized element types are not poolable");
        }

        if block_size == 0 {
            return Err(PoolError::ZeroBlockSize);
        }

        if block_count == 0 {
            return Err(PoolError::ZeroBlockCount);
        }

        // Round the usable bytes of a block up to the least multiple of
        // lcm(size_of::<T>(), ALIGN). That keeps the stride a whole number of elements
        // AND a multiple of ALIGN, so consecutive block starts all stay aligned.
        let byte_size = block_size
            .checked_mul(size_of::<T>())
            .ok_or(PoolError::CapacityOverflow)?;

        let stride_unit = lcm(size_of::<T>(), ALIGN);

        let stride_bytes = byte_size
            .checked_next_multiple_of(stride_unit)
            .ok_or(PoolError::CapacityOverflow)?;

        let region_bytes = stride_bytes
            .checked_mul(block_count)
            .ok_or(PoolError::CapacityOverflow)?;

        let layout = Layout::from_size_align(region_bytes, ALIGN)
            .map_err(|_err| PoolError::CapacityOverflow)?;

        // SAFETY: `region_bytes` is non-zero (all three factors are non-zero).
        let region = unsafe { std::alloc::alloc(layout) };

        let Some(region) = NonNull::new(region) else {
            return Err(PoolError::OutOfMemory {
                bytes: region_bytes,
            });
        };

        let core = PoolCore {
            region,
            region_bytes,
            block_size,
            block_count,
            stride_bytes,
            location,
            free_blocks: Mutex::new(Vec::new()),
        };

        // Until defused, a panicking T::default() below unwinds through this: drop the
        // fully constructed blocks, free the region, let the panic continue.
        let mut core = scopeguard::guard((core, 0_usize), |(core, initialized_blocks)| {
            for index in 0..initialized_blocks {
                let elements: *mut [T] = std::ptr::slice_from_raw_parts_mut(
                    core.block_start(index).as_ptr(),
                    core.block_size,
                );

                // SAFETY: Blocks below `initialized_blocks` are fully constructed.
                unsafe { std::ptr::drop_in_place(elements) };
            }

            // SAFETY: Allocated above with this exact layout; PoolCore::drop must not
            // also free it, so we forget the core after releasing the region.
            unsafe { std::alloc::dealloc(core.region.as_ptr(), layout) };

            std::mem::forget(core);
        });

        let (core_ref, initialized_blocks) = &mut *core;

        for index in 0..core_ref.block_count {
            let start = core_ref.block_start(index);

            for element in 0..core_ref.block_size {
                let slot = start.as_ptr().wrapping_add(element);

                // SAFETY: `slot` is within block `index` of the freshly allocated
                // region and holds uninitialized memory of the right type.
                unsafe { slot.write(T::default()) };
            }

            // Cannot overflow: bounded by block_count.
            *initialized_blocks = index.wrapping_add(1);
        }

        let (core, _initialized_blocks) = ScopeGuard::into_inner(core);

        // Seed the free list in ascending address order; the first pop hands out the
        // highest block.
        {
            let mut free = core.free_list();
            free.reserve_exact(core.block_count);

            for index in 0..core.block_count {
                free.push(core.block_start(index));
            }
        }

        Ok(Self {
            core: Arc::new(core),
        })
    }

    /// Hands out a free block as a [`UniqueBuffer<T>`] of `block_size()` elements.
    ///
    /// The buffer's deleter returns the block to this pool, so dropping the buffer is
    /// the return path. The block retains whatever its previous holder wrote; only the
    /// initial hand-out of each block is freshly default-initialized.
    ///
    /// # Errors
    ///
    /// [`PoolError::Exhausted`] if every block is currently out. The pool does not
    /// grow; retry after a buffer is dropped.
    pub fn allocate(&self) -> Result<UniqueBuffer<T>, PoolError> {
        let ptr = self.core.free_list().pop().ok_or(PoolError::Exhausted)?;

        let core = Arc::clone(&self.core);
        let deleter = Deleter::new(move |p: *mut T| core.recycle(p));

        // SAFETY: `ptr` is a block start of the live region holding `block_size`
        // initialized elements; we just removed it from the free list, so this buffer
        // is its sole owner, and the deleter pushes it back exactly once.
        Ok(unsafe {
            UniqueBuffer::from_raw(ptr.as_ptr(), self.core.block_size, deleter, self.core.location)
        })
    }
}

impl<T, const ALIGN: usize> MemPool<T, ALIGN> {
    /// Usable elements per block; the length of every vended buffer.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.core.block_size
    }

    /// Total number of blocks, outstanding or free.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.core.block_count
    }

    /// The location tag carried by vended buffers.
    #[must_use]
    pub fn location(&self) -> MemoryLocation {
        self.core.location
    }

    /// The number of blocks currently free.
    ///
    /// Takes the free-list lock. Under concurrent allocation the value is a snapshot.
    #[must_use]
    pub fn available(&self) -> usize {
        self.core.free_list().len()
    }
}

impl<T, const ALIGN: usize> fmt::Debug for MemPool<T, ALIGN> {
    #[cfg_attr(test, mutants::skip)] // Diagnostic output only, not worth mutation testing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemPool")
            .field("block_size", &self.core.block_size)
            .field("capacity", &self.core.block_count)
            .field("stride_bytes", &self.core.stride_bytes)
            .field("location", &self.core.location)
            .finish()
    }
}
