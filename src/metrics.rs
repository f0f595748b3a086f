//! Read-only fragmentation metrics.

use core::fmt;

use crate::{ledger::Ledger, Error, Handle, Result};

/// Queries derived by scanning the block ledger.
///
/// Each query walks the whole pool with its own traversal, so queries can be
/// freely interleaved. Obtained from [`PoolAllocator::metrics`].
///
/// [`PoolAllocator::metrics`]: crate::PoolAllocator::metrics
#[derive(Clone, Copy)]
pub struct Metrics<'a> {
    ledger: &'a Ledger,
}

impl<'a> Metrics<'a> {
    pub(crate) fn new(ledger: &'a Ledger) -> Self {
        Metrics { ledger }
    }

    /// Total number of bytes in free blocks.
    pub fn free_bytes(&self) -> usize {
        self.ledger
            .iter()
            .filter(|(_, block)| block.is_free())
            .map(|(_, block)| block.size)
            .sum()
    }

    /// Size of the largest free block, or zero if nothing is free.
    pub fn largest_free_block(&self) -> usize {
        self.ledger
            .iter()
            .filter(|(_, block)| block.is_free())
            .map(|(_, block)| block.size)
            .max()
            .unwrap_or(0)
    }

    /// Number of free blocks of at most `threshold` bytes.
    pub fn small_free_block_count(&self, threshold: usize) -> usize {
        self.ledger
            .iter()
            .filter(|(_, block)| block.is_free() && block.size <= threshold)
            .count()
    }

    /// Number of free blocks.
    pub fn free_block_count(&self) -> usize {
        self.ledger
            .iter()
            .filter(|(_, block)| block.is_free())
            .count()
    }

    /// Whether the byte at `address` lies in an allocated block.
    ///
    /// Fails with [`Error::InvalidHandle`] if `address` is outside the pool.
    pub fn is_allocated(&self, address: Handle) -> Result<bool> {
        self.ledger
            .find_containing(address.offset())
            .map(|id| self.ledger[id].allocated)
            .ok_or(Error::InvalidHandle(address))
    }
}

/// A snapshot of an allocator's usage, as returned by
/// [`PoolAllocator::stats`](crate::PoolAllocator::stats).
///
/// The `Display` implementation renders a short human-readable status
/// report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Bytes currently handed out.
    pub allocated: usize,
    /// Size of the whole pool.
    pub total: usize,
    /// Bytes in free blocks.
    pub free: usize,
    /// Number of holes (maximal free blocks).
    pub holes: usize,
    /// Size of the largest hole.
    pub largest_free: usize,
}

impl Stats {
    /// Mean hole size, or zero if there are no holes.
    pub fn average_hole_size(&self) -> f64 {
        if self.holes == 0 {
            0.0
        } else {
            self.free as f64 / self.holes as f64
        }
    }

    /// External fragmentation: the fraction of free memory that cannot be
    /// handed out in a single allocation.
    ///
    /// ```text
    /// fragmentation = 1 - largest_free / free
    /// ```
    ///
    /// Zero when all free memory is one hole, or when nothing is free.
    pub fn external_fragmentation(&self) -> f64 {
        if self.free == 0 {
            0.0
        } else {
            1.0 - self.largest_free as f64 / self.free as f64
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} out of {} bytes allocated.",
            self.allocated, self.total
        )?;
        writeln!(
            f,
            "{} bytes are free in {} holes; maximum allocatable block is {} bytes.",
            self.free, self.holes, self.largest_free
        )?;
        write!(f, "Average hole size is {:.6}.", self.average_hole_size())
    }
}
