//! The pool allocator engine.

use core::{fmt, ptr::NonNull};

use crate::{
    ledger::{BlockInfo, Ledger},
    Allocator, Error, Global, Handle, Metrics, Pool, Result, Stats, Strategy,
};

/// A simulated allocator handing out blocks of a fixed-size pool.
///
/// The allocator tracks which byte ranges of the pool are handed out and
/// places each new allocation according to its [`Strategy`]. Released blocks
/// are merged with free neighbors immediately, so the pool never contains two
/// adjacent free blocks.
///
/// The pool itself is reserved from the inner allocator `A` (the global
/// allocator by default) but its contents are never touched: a [`Handle`] is
/// only an offset into it.
///
/// ```
/// use fitpool::{PoolAllocator, Strategy};
///
/// let mut pool = PoolAllocator::new(Strategy::Best, 500)?;
/// let a = pool.allocate(100)?;
/// let b = pool.allocate(100)?;
/// pool.release(a)?;
///
/// assert_eq!(b.offset(), 100);
/// assert_eq!(pool.free_bytes(), 400);
/// assert_eq!(pool.hole_count(), 2);
/// # Ok::<(), fitpool::Error>(())
/// ```
pub struct PoolAllocator<A = Global>
where
    A: Allocator,
{
    pool: Pool<A>,
    strategy: Strategy,
    ledger: Ledger,

    /// Bytes currently handed out.
    allocated: usize,

    /// Number of free blocks. Maintained incrementally on every allocation
    /// and release rather than recounted.
    holes: usize,
}

impl PoolAllocator<Global> {
    /// Create an allocator managing a fresh pool of `pool_size` bytes reserved
    /// from the global allocator.
    pub fn new(strategy: Strategy, pool_size: usize) -> Result<Self> {
        Self::new_in(strategy, pool_size, Global)
    }
}

impl<A> PoolAllocator<A>
where
    A: Allocator,
{
    /// Create an allocator managing a fresh pool of `pool_size` bytes reserved
    /// from `inner`.
    pub fn new_in(strategy: Strategy, pool_size: usize, inner: A) -> Result<Self> {
        let pool = Pool::reserve(inner, pool_size)?;
        log::debug!("initialized a {pool_size}-byte pool with {strategy}-fit placement");
        Ok(PoolAllocator {
            pool,
            strategy,
            ledger: Ledger::new(pool_size),
            allocated: 0,
            holes: 1,
        })
    }

    /// Start over with a fresh, entirely free pool of `pool_size` bytes.
    ///
    /// Every block handed out by the previous configuration must have been
    /// released first; otherwise this fails with
    /// [`Error::OutstandingAllocations`] and nothing changes.
    pub fn initialize(&mut self, strategy: Strategy, pool_size: usize) -> Result<()> {
        if self.allocated != 0 {
            return Err(Error::OutstandingAllocations {
                allocated: self.allocated,
            });
        }
        self.reset(strategy, pool_size)
    }

    /// Like [`initialize`](Self::initialize), but silently invalidates any
    /// handles that are still live.
    pub fn force_initialize(&mut self, strategy: Strategy, pool_size: usize) -> Result<()> {
        if self.allocated != 0 {
            log::warn!(
                "re-initializing with {} bytes still allocated; discarding them",
                self.allocated
            );
        }
        self.reset(strategy, pool_size)
    }

    fn reset(&mut self, strategy: Strategy, pool_size: usize) -> Result<()> {
        self.pool.renew(pool_size)?;
        self.strategy = strategy;
        self.ledger = Ledger::new(pool_size);
        self.allocated = 0;
        self.holes = 1;
        log::debug!("initialized a {pool_size}-byte pool with {strategy}-fit placement");
        Ok(())
    }

    /// Allocate a block of exactly `requested` bytes.
    ///
    /// Fails with [`Error::NoFit`], leaving the allocator untouched, when the
    /// strategy finds no free block large enough.
    pub fn allocate(&mut self, requested: usize) -> Result<Handle> {
        if requested == 0 {
            return Err(Error::ZeroSizedRequest);
        }

        let Some(chosen) = self.strategy.select(&self.ledger, requested) else {
            log::debug!("{}-fit found no room for {requested} bytes", self.strategy);
            return Err(Error::NoFit { requested });
        };

        // A split leaves a smaller hole behind; only an exact fit removes one.
        let exact = self.ledger[chosen].size == requested;
        let block = self.ledger.split(chosen, requested);
        if exact {
            self.holes -= 1;
        }
        self.allocated += requested;
        self.ledger.set_cursor(block);

        let handle = Handle::from_offset(self.ledger[block].offset);
        log::debug!("allocated {requested} bytes at {handle}");
        Ok(handle)
    }

    /// Release the block at `handle`, merging it with free neighbors.
    ///
    /// Fails with [`Error::InvalidHandle`] unless `handle` is the start of a
    /// currently allocated block.
    pub fn release(&mut self, handle: Handle) -> Result<()> {
        let id = self
            .ledger
            .locate(handle.offset())
            .filter(|id| self.ledger[*id].allocated)
            .ok_or(Error::InvalidHandle(handle))?;

        let size = self.ledger[id].size;
        self.ledger.mark_free(id);
        self.allocated -= size;

        match self.ledger.coalesce_around_release(id) {
            // A new hole between two allocated blocks.
            0 => self.holes += 1,
            // An existing hole grew.
            1 => {}
            // Two holes joined into one.
            _ => self.holes -= 1,
        }
        log::debug!("released {size} bytes at {handle}");
        Ok(())
    }

    /// The active placement strategy.
    #[inline]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Bytes currently handed out.
    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    /// Number of holes (maximal free blocks).
    #[inline]
    pub fn hole_count(&self) -> usize {
        self.holes
    }

    /// Bytes not handed out.
    pub fn free_bytes(&self) -> usize {
        self.metrics().free_bytes()
    }

    /// Size of the largest free block: the largest allocation that can
    /// currently succeed.
    pub fn largest_free_block(&self) -> usize {
        self.metrics().largest_free_block()
    }

    /// Number of free blocks of at most `threshold` bytes.
    pub fn small_free_block_count(&self, threshold: usize) -> usize {
        self.metrics().small_free_block_count(threshold)
    }

    /// Whether the byte at `address` is part of an allocated block.
    pub fn is_allocated(&self, address: Handle) -> Result<bool> {
        self.metrics().is_allocated(address)
    }

    /// The handle of the pool's first byte.
    #[inline]
    pub fn pool_handle(&self) -> Handle {
        Handle::POOL_START
    }

    /// Size of the pool in bytes.
    #[inline]
    pub fn pool_total_size(&self) -> usize {
        self.pool.len()
    }

    /// The pool's backing reservation.
    #[inline]
    pub fn pool(&self) -> &Pool<A> {
        &self.pool
    }

    /// The address `handle` designates inside the backing reservation, or
    /// `None` if it is outside the pool.
    pub fn resolve(&self, handle: Handle) -> Option<NonNull<u8>> {
        self.pool.address_of(handle.offset())
    }

    /// Scanning queries over the current block layout.
    #[inline]
    pub fn metrics(&self) -> Metrics<'_> {
        Metrics::new(&self.ledger)
    }

    /// A snapshot of the allocator's usage.
    pub fn stats(&self) -> Stats {
        let metrics = self.metrics();
        Stats {
            allocated: self.allocated,
            total: self.pool_total_size(),
            free: metrics.free_bytes(),
            holes: self.holes,
            largest_free: metrics.largest_free_block(),
        }
    }

    /// Every block of the pool, in address order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.ledger.iter().map(|(_, block)| block.info())
    }

    /// Number of blocks, free or allocated, the pool is divided into.
    #[inline]
    pub fn block_count(&self) -> usize {
        self.ledger.len()
    }

    /// A printable listing of every block of the pool.
    pub fn dump(&self) -> LedgerDump<'_> {
        LedgerDump {
            ledger: &self.ledger,
        }
    }
}

impl<A> fmt::Debug for PoolAllocator<A>
where
    A: Allocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("pool", &self.pool)
            .field("strategy", &self.strategy)
            .field("allocated", &self.allocated)
            .field("holes", &self.holes)
            .field("blocks", &self.ledger.len())
            .finish()
    }
}

/// The block listing returned by [`PoolAllocator::dump`], one block per line.
pub struct LedgerDump<'a> {
    ledger: &'a Ledger,
}

impl fmt::Display for LedgerDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (_, block)) in self.ledger.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(
                f,
                "offset: {:>6}, size: {:>6}, {}",
                block.offset,
                block.size,
                if block.allocated { "allocated" } else { "free" }
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ledger::tests::assert_consistent, pool::tests::Counting};
    use alloc::{string::ToString, vec::Vec};

    fn check<A: Allocator>(pool: &PoolAllocator<A>) {
        let _ = env_logger::try_init();
        assert_consistent(&pool.ledger, pool.pool_total_size());
        assert_eq!(pool.hole_count(), pool.metrics().free_block_count());
        assert_eq!(
            pool.allocated_bytes() + pool.free_bytes(),
            pool.pool_total_size()
        );
    }

    fn layout<A: Allocator>(pool: &PoolAllocator<A>) -> Vec<(usize, usize, bool)> {
        pool.blocks()
            .map(|b| (b.offset, b.size, b.allocated))
            .collect()
    }

    #[test]
    fn first_fit_walkthrough() {
        let mut pool = PoolAllocator::new(Strategy::First, 500).unwrap();
        check(&pool);
        assert_eq!((pool.hole_count(), pool.free_bytes()), (1, 500));

        let a = pool.allocate(100).unwrap();
        check(&pool);
        assert_eq!(a.offset(), 0);
        assert_eq!((pool.hole_count(), pool.free_bytes()), (1, 400));

        let b = pool.allocate(100).unwrap();
        check(&pool);
        assert_eq!(b.offset(), 100);
        assert_eq!((pool.hole_count(), pool.free_bytes()), (1, 300));

        let c = pool.allocate(100).unwrap();
        check(&pool);
        assert_eq!(c.offset(), 200);
        assert_eq!((pool.hole_count(), pool.free_bytes()), (1, 200));

        // Both neighbors are allocated: a new hole.
        pool.release(b).unwrap();
        check(&pool);
        assert_eq!((pool.hole_count(), pool.free_bytes()), (2, 300));

        // Reuses the hole b left, splitting it.
        let d = pool.allocate(50).unwrap();
        check(&pool);
        assert_eq!(d.offset(), 100);
        assert_eq!((pool.hole_count(), pool.free_bytes()), (2, 250));
        assert_eq!(
            layout(&pool),
            [
                (0, 100, true),
                (100, 50, true),
                (150, 50, false),
                (200, 100, true),
                (300, 200, false),
            ]
        );

        // `d` sits between `a` and the 50-byte remainder, so no merge.
        pool.release(a).unwrap();
        check(&pool);
        assert_eq!((pool.hole_count(), pool.free_bytes()), (3, 350));
        assert_eq!(pool.allocated_bytes(), 150);
        assert_eq!(pool.largest_free_block(), 200);

        let e = pool.allocate(25).unwrap();
        check(&pool);
        assert_eq!(e.offset(), 0);
        assert_eq!((pool.hole_count(), pool.free_bytes()), (3, 325));

        assert_eq!(
            pool.stats().to_string(),
            "175 out of 500 bytes allocated.\n\
             325 bytes are free in 3 holes; maximum allocatable block is 200 bytes.\n\
             Average hole size is 108.333333."
        );
    }

    /// The canonical walkthrough: allocate a, b, c; release b; allocate d;
    /// release a; allocate e. Returns the offsets of d and e.
    fn walkthrough(strategy: Strategy) -> (usize, usize, usize) {
        let mut pool = PoolAllocator::new(strategy, 500).unwrap();
        let a = pool.allocate(100).unwrap();
        let b = pool.allocate(100).unwrap();
        let c = pool.allocate(100).unwrap();
        assert_eq!((a.offset(), b.offset(), c.offset()), (0, 100, 200));
        pool.release(b).unwrap();
        let d = pool.allocate(50).unwrap();
        check(&pool);
        pool.release(a).unwrap();
        check(&pool);
        let holes = pool.hole_count();
        let e = pool.allocate(25).unwrap();
        check(&pool);
        assert_eq!(pool.free_bytes(), 325);
        (d.offset(), e.offset(), holes)
    }

    #[test]
    fn strategies_place_differently() {
        assert_eq!(walkthrough(Strategy::First), (100, 0, 3));
        assert_eq!(walkthrough(Strategy::Best), (100, 150, 3));
        // Worst- and next-fit put `d` at the end, so releasing `a` merges it
        // with `b`'s hole.
        assert_eq!(walkthrough(Strategy::Worst), (300, 0, 2));
        assert_eq!(walkthrough(Strategy::Next), (300, 350, 2));
    }

    #[test]
    fn exact_fit_consumes_a_hole() {
        let mut pool = PoolAllocator::new(Strategy::Best, 300).unwrap();
        let a = pool.allocate(100).unwrap();
        let _b = pool.allocate(100).unwrap();
        pool.release(a).unwrap();
        assert_eq!(pool.hole_count(), 2);

        // Exactly fills the hole at 0.
        let c = pool.allocate(100).unwrap();
        check(&pool);
        assert_eq!(c.offset(), 0);
        assert_eq!(pool.hole_count(), 1);

        // Exactly fills the tail; nothing is free any more.
        let d = pool.allocate(100).unwrap();
        check(&pool);
        assert_eq!(d.offset(), 200);
        assert_eq!(pool.hole_count(), 0);
        assert_eq!(pool.largest_free_block(), 0);

        for strategy in Strategy::ALL {
            pool.strategy = strategy;
            assert_eq!(pool.allocate(1), Err(Error::NoFit { requested: 1 }));
        }
    }

    #[test]
    fn no_fit_changes_nothing() {
        for strategy in Strategy::ALL {
            let mut pool = PoolAllocator::new(strategy, 100).unwrap();
            let a = pool.allocate(30).unwrap();
            pool.allocate(30).unwrap();
            pool.release(a).unwrap();

            let before = (layout(&pool), pool.stats(), pool.ledger.cursor());
            assert_eq!(pool.allocate(41), Err(Error::NoFit { requested: 41 }));
            assert_eq!(before, (layout(&pool), pool.stats(), pool.ledger.cursor()));
            check(&pool);
        }
    }

    #[test]
    fn unset_strategy_never_allocates() {
        let mut pool = PoolAllocator::new(Strategy::Unset, 100).unwrap();
        assert_eq!(pool.allocate(1), Err(Error::NoFit { requested: 1 }));
        assert_eq!(pool.free_bytes(), 100);

        pool.initialize(Strategy::First, 100).unwrap();
        assert!(pool.allocate(1).is_ok());
    }

    #[test]
    fn zero_sized_requests() {
        let mut pool = PoolAllocator::new(Strategy::First, 100).unwrap();
        assert_eq!(pool.allocate(0), Err(Error::ZeroSizedRequest));
        assert_eq!(
            PoolAllocator::new(Strategy::First, 0).unwrap_err(),
            Error::ZeroSizedPool
        );
        assert_eq!(
            pool.initialize(Strategy::First, 0),
            Err(Error::ZeroSizedPool)
        );
        assert_eq!(pool.pool_total_size(), 100);
    }

    #[test]
    fn invalid_releases() {
        let mut pool = PoolAllocator::new(Strategy::First, 100).unwrap();
        let a = pool.allocate(40).unwrap();
        let before = layout(&pool);

        // Inside a block, but not its start.
        let inside = Handle::from_offset(10);
        assert_eq!(pool.release(inside), Err(Error::InvalidHandle(inside)));
        // The free remainder.
        let free = Handle::from_offset(40);
        assert_eq!(pool.release(free), Err(Error::InvalidHandle(free)));
        // Past the end of the pool.
        let outside = Handle::from_offset(100);
        assert_eq!(pool.release(outside), Err(Error::InvalidHandle(outside)));
        assert_eq!(layout(&pool), before);

        pool.release(a).unwrap();
        assert_eq!(pool.release(a), Err(Error::InvalidHandle(a)));
        check(&pool);
    }

    #[test]
    fn allocation_status() {
        let mut pool = PoolAllocator::new(Strategy::First, 100).unwrap();
        let a = pool.allocate(40).unwrap();
        assert_eq!(pool.is_allocated(a), Ok(true));
        assert_eq!(pool.is_allocated(Handle::from_offset(39)), Ok(true));
        assert_eq!(pool.is_allocated(Handle::from_offset(40)), Ok(false));
        assert_eq!(
            pool.is_allocated(Handle::from_offset(100)),
            Err(Error::InvalidHandle(Handle::from_offset(100)))
        );
        pool.release(a).unwrap();
        assert_eq!(pool.is_allocated(a), Ok(false));
    }

    #[test]
    fn round_trip_restores_shape() {
        for strategy in Strategy::ALL {
            let mut pool = PoolAllocator::new(strategy, 1000).unwrap();
            let handles: Vec<_> = [50, 120, 80, 200, 60, 90]
                .into_iter()
                .map(|size| pool.allocate(size).unwrap())
                .collect();
            pool.release(handles[1]).unwrap();
            pool.release(handles[3]).unwrap();
            check(&pool);

            let before = (pool.hole_count(), pool.free_bytes(), layout(&pool));
            for size in [1, 80, 120, 200, 400] {
                let h = pool.allocate(size).unwrap();
                check(&pool);
                pool.release(h).unwrap();
                check(&pool);
                assert_eq!(before, (pool.hole_count(), pool.free_bytes(), layout(&pool)));
            }
        }
    }

    #[test]
    fn reinitialization() {
        let mut pool = PoolAllocator::new(Strategy::Next, 100).unwrap();
        let a = pool.allocate(10).unwrap();

        assert_eq!(
            pool.initialize(Strategy::Best, 200),
            Err(Error::OutstandingAllocations { allocated: 10 })
        );
        assert_eq!(pool.strategy(), Strategy::Next);
        assert_eq!(pool.pool_total_size(), 100);
        assert_eq!(pool.is_allocated(a), Ok(true));

        pool.release(a).unwrap();
        pool.initialize(Strategy::Best, 200).unwrap();
        check(&pool);
        assert_eq!(pool.strategy(), Strategy::Best);
        assert_eq!(layout(&pool), [(0, 200, false)]);

        pool.allocate(50).unwrap();
        pool.force_initialize(Strategy::Worst, 80).unwrap();
        check(&pool);
        assert_eq!(pool.allocated_bytes(), 0);
        assert_eq!(pool.hole_count(), 1);
        assert_eq!(layout(&pool), [(0, 80, false)]);
    }

    #[test]
    fn reinitialization_is_idempotent() {
        let mut once = PoolAllocator::new(Strategy::First, 300).unwrap();
        once.initialize(Strategy::Next, 300).unwrap();

        let mut twice = PoolAllocator::new(Strategy::First, 300).unwrap();
        twice.initialize(Strategy::Next, 300).unwrap();
        twice.initialize(Strategy::Next, 300).unwrap();

        assert_eq!(once.stats(), twice.stats());
        assert_eq!(layout(&once), layout(&twice));
        assert_eq!(once.strategy(), twice.strategy());
        for size in [10, 20, 30] {
            assert_eq!(once.allocate(size), twice.allocate(size));
        }
    }

    #[test]
    fn reservations_are_not_leaked() {
        let counting = Counting::default();
        {
            let mut pool = PoolAllocator::new_in(Strategy::First, 64, &counting).unwrap();
            pool.initialize(Strategy::Best, 128).unwrap();
            pool.allocate(8).unwrap();
            pool.force_initialize(Strategy::Next, 32).unwrap();
            assert_eq!((counting.live.get(), counting.bytes.get()), (1, 32));
        }
        assert_eq!((counting.live.get(), counting.bytes.get()), (0, 0));
    }

    #[test]
    fn handles_resolve_into_the_pool() {
        let mut pool = PoolAllocator::new(Strategy::First, 64).unwrap();
        pool.allocate(16).unwrap();
        let h = pool.allocate(16).unwrap();
        let base = pool.pool().base().as_ptr() as usize;
        assert_eq!(pool.resolve(pool.pool_handle()), Some(pool.pool().base()));
        assert_eq!(pool.resolve(h).map(|p| p.as_ptr() as usize), Some(base + 16));
        assert_eq!(pool.resolve(Handle::from_offset(64)), None);
    }

    #[test]
    fn next_fit_wraps_around() {
        let mut pool = PoolAllocator::new(Strategy::Next, 100).unwrap();
        let a = pool.allocate(20).unwrap();
        let b = pool.allocate(20).unwrap();
        let _c = pool.allocate(50).unwrap();
        pool.release(a).unwrap();

        // Only 10 bytes are left after `c`, so the scan wraps to `a`'s hole.
        let d = pool.allocate(15).unwrap();
        assert_eq!(d.offset(), 0);

        // Resumes after `d`: its 5-byte remainder is too small, so `e` goes in
        // the tail.
        let e = pool.allocate(8).unwrap();
        assert_eq!(e.offset(), 90);
        check(&pool);

        // `b` merges into `d`'s remainder; the 2-byte tail after `e` is too
        // small, so the scan wraps again.
        pool.release(b).unwrap();
        let f = pool.allocate(4).unwrap();
        assert_eq!(f.offset(), 15);
        check(&pool);

        // The 10-byte hole `e` leaves at the end is further along than `f`'s
        // remainder, so the remainder is used.
        pool.release(e).unwrap();
        check(&pool);
        let g = pool.allocate(10).unwrap();
        assert_eq!(g.offset(), 19);
        check(&pool);

        // Releasing the block under the cursor moves the cursor to the hole
        // after it, which then absorbs it; next-fit scans that hole last.
        pool.release(g).unwrap();
        check(&pool);
        let h = pool.allocate(10).unwrap();
        assert_eq!(h.offset(), 90);
        check(&pool);
    }

    #[test]
    fn dump_lists_blocks() {
        let mut pool = PoolAllocator::new(Strategy::First, 100).unwrap();
        pool.allocate(30).unwrap();
        assert_eq!(
            pool.dump().to_string(),
            "offset:      0, size:     30, allocated\n\
             offset:     30, size:     70, free"
        );
    }
}
