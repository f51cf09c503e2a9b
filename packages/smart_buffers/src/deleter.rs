use std::fmt;
use std::sync::Arc;

/// A cloneable, type-erased release callback for a buffer payload.
///
/// The callback receives the payload pointer and is expected to return the memory to its
/// originating allocator - freeing a heap array, pushing a block back into a pool, or
/// issuing a device-side deallocation. It may capture arbitrary state (a pool handle, a
/// foreign allocator, ...).
///
/// A deleter may also be *empty* ([`Deleter::none()`]), which signals "no automatic
/// cleanup": whoever holds the payload must still manage the memory by other means. The
/// owning buffer types preserve emptiness verbatim through every ownership hand-off.
///
/// Cloning is cheap (the callback is shared behind an [`Arc`]), which is what allows
/// [`UniqueBuffer::deleter()`][crate::UniqueBuffer::deleter] to hand out a copy of the
/// stored deleter without disturbing the buffer.
pub struct Deleter<T> {
    callback: Option<Arc<dyn Fn(*mut T) + Send + Sync>>,
}

impl<T> Deleter<T> {
    /// Creates a deleter from the given release callback.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use smart_buffers::Deleter;
    ///
    /// // A real deleter would return `ptr` to its allocator; this one only observes it.
    /// let deleter = Deleter::<u8>::new(|ptr| {
    ///     let _ = ptr;
    /// });
    ///
    /// assert!(deleter.is_some());
    /// ```
    #[must_use]
    pub fn new(callback: impl Fn(*mut T) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    /// Creates an empty deleter: no automatic cleanup will happen.
    ///
    /// The holder of the payload must still release the memory by other means.
    #[must_use]
    pub fn none() -> Self {
        Self { callback: None }
    }

    /// Whether this deleter is empty.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.callback.is_none()
    }

    /// Whether this deleter holds a callback.
    #[must_use]
    pub fn is_some(&self) -> bool {
        self.callback.is_some()
    }

    /// Invokes the callback on `ptr`, if a callback is present.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// 1. `ptr` is the payload pointer this deleter was paired with at construction.
    /// 2. The deleter is invoked at most once per payload - the callback typically frees
    ///    the memory, so a second invocation is a double-free.
    /// 3. No live references into the payload exist at the moment of invocation.
    pub unsafe fn invoke(&self, ptr: *mut T) {
        if let Some(callback) = &self.callback {
            callback(ptr);
        }
    }
}

impl<T> Clone for Deleter<T> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
        }
    }
}

impl<T> Default for Deleter<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T> fmt::Debug for Deleter<T> {
    #[cfg_attr(test, mutants::skip)] // Diagnostic output only, not worth mutation testing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deleter")
            .field("is_some", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Deleter<u8>: Clone, Send, Sync);

    #[test]
    fn none_is_empty() {
        let deleter = Deleter::<u8>::none();
        assert!(deleter.is_none());
        assert!(!deleter.is_some());
    }

    #[test]
    fn default_is_none() {
        assert!(Deleter::<u8>::default().is_none());
    }

    #[test]
    fn invoke_runs_callback_with_pointer() {
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_in_callback = Arc::clone(&hits);
        let deleter = Deleter::<u8>::new(move |_ptr| {
            hits_in_callback.fetch_add(1, Ordering::Relaxed);
        });

        let mut payload = 7_u8;

        // SAFETY: The callback only counts invocations; it does not free anything.
        unsafe { deleter.invoke(&raw mut payload) };

        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn invoke_on_empty_deleter_is_a_no_op() {
        let deleter = Deleter::<u8>::none();
        let mut payload = 7_u8;

        // SAFETY: An empty deleter never touches the pointer.
        unsafe { deleter.invoke(&raw mut payload) };
    }

    #[test]
    fn clones_share_the_callback() {
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_in_callback = Arc::clone(&hits);
        let deleter = Deleter::<u8>::new(move |_ptr| {
            hits_in_callback.fetch_add(1, Ordering::Relaxed);
        });

        let clone = deleter.clone();
        let mut payload = 0_u8;

        // SAFETY: The callback only counts invocations; it does not free anything.
        unsafe { deleter.invoke(&raw mut payload) };
        // SAFETY: As above.
        unsafe { clone.invoke(&raw mut payload) };

        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }
}
