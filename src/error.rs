use alloc::string::String;

use crate::Handle;

/// Errors reported by a [`PoolAllocator`](crate::PoolAllocator).
///
/// Every error is local to the call that returned it: the allocator is left
/// exactly as it was before the call and stays usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No free block can satisfy the request, or the allocator has no
    /// placement strategy.
    #[error("no free block can hold {requested} bytes")]
    NoFit {
        /// The number of bytes that were requested.
        requested: usize,
    },

    /// Zero-byte allocations are not supported.
    #[error("cannot allocate a zero-sized block")]
    ZeroSizedRequest,

    /// The handle does not designate a block this allocator handed out, or
    /// the address lies outside of the pool.
    #[error("invalid handle {0}")]
    InvalidHandle(Handle),

    /// `initialize` was called while blocks from the previous configuration
    /// are still allocated.
    #[error("cannot re-initialize with {allocated} bytes still allocated")]
    OutstandingAllocations {
        /// The number of bytes still allocated.
        allocated: usize,
    },

    /// A pool must hold at least one byte.
    #[error("cannot initialize a zero-sized pool")]
    ZeroSizedPool,

    /// The host allocator refused to reserve the backing pool.
    #[error("failed to reserve a pool of {size} bytes")]
    PoolReservation {
        /// The requested pool size.
        size: usize,
    },

    /// The name does not designate a placement strategy.
    #[error("unknown placement strategy `{0}`")]
    UnknownStrategy(String),
}

/// A `Result` whose error type is [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;
