/// Describes where the memory behind a buffer lives.
///
/// The tag is informational: the buffer types carry it from construction through every
/// ownership hand-off but never interpret it. In particular, nothing in this crate will
/// dereference a [`Device`][MemoryLocation::Device] pointer on the host - the caller who
/// constructed such a buffer is responsible for only accessing it through appropriate
/// means and for supplying a deleter that frees it on the right side.
///
/// # Examples
///
/// ```rust
/// use smart_buffers::MemoryLocation;
///
/// // Plain host memory is the default.
/// assert_eq!(MemoryLocation::default(), MemoryLocation::Host);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum MemoryLocation {
    /// Ordinary pageable host memory. This is the default.
    #[default]
    Host,

    /// Page-locked host memory, e.g. for fast DMA transfers.
    HostPinned,

    /// Memory resident on an accelerator device. Must never be dereferenced on the host.
    Device,

    /// Unified/managed memory accessible from both host and device.
    Unified,
}
