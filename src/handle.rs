use core::fmt;

/// A handle to an allocated block: the block's byte offset from the start of
/// the pool.
///
/// Handles are purely logical. Use [`PoolAllocator::resolve`] to turn one into
/// the address it designates inside the backing reservation.
///
/// [`PoolAllocator::resolve`]: crate::PoolAllocator::resolve
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(usize);

impl Handle {
    /// The handle of the first byte of the pool.
    pub const POOL_START: Handle = Handle(0);

    /// Create a handle from a byte offset into the pool.
    #[inline]
    pub const fn from_offset(offset: usize) -> Self {
        Handle(offset)
    }

    /// The byte offset this handle designates.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:#x}", self.0)
    }
}
