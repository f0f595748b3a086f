//! Shared fuzzing and testing infrastructure for `fitpool`.

use fitpool::{BlockInfo, Error, Handle, PoolAllocator, Stats, Strategy};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::collections::BTreeMap;

/// The size of a test allocation or pool, in bytes.
//
// Note: a newtype rather than a bare `usize` so that we can give it a default
// mutator that keeps sizes small and non-zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Size(usize);

impl Default for Size {
    fn default() -> Self {
        Size(1)
    }
}

impl Size {
    /// Create a new `Size`. Zero is bumped up to one.
    pub fn new(size: usize) -> Self {
        Size(size.max(1))
    }

    /// The size in bytes.
    pub fn get(&self) -> usize {
        self.0
    }
}

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s with a configurable maximum.
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self { max_size: 1024 }
    }
}

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() {
                size.0.max(1)
            } else {
                self.max_size
            };
            size.0 = 1 + ctx.rng().gen_index(max_size).unwrap();
            Ok(())
        })?;

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Size> {
        let size = m::range(1..=self.max_size).generate(context)?;
        Ok(Size(size))
    }
}

/// Map an arbitrary byte onto a strategy, `Strategy::Unset` included.
pub fn strategy_from_byte(byte: u8) -> Strategy {
    match byte % 5 {
        0 => Strategy::Unset,
        1 => Strategy::First,
        2 => Strategy::Best,
        3 => Strategy::Worst,
        _ => Strategy::Next,
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: Size },
    Release { id: u32 },
    Init { strategy: u8, size: Size },
    ForceInit { strategy: u8, size: Size },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32() % 16,
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Release {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Release {
                    id: ctx.rng().gen_u32() % 16,
                })
            },
            |ctx| {
                Ok(Op::Init {
                    strategy: (ctx.rng().gen_u32() % 5) as u8,
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::ForceInit {
                    strategy: (ctx.rng().gen_u32() % 5) as u8,
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. } | Op::Release { id } => {
                        *id = new_id;
                    }
                    Op::Init { .. } | Op::ForceInit { .. } => {}
                }
            }
            Ok(())
        })?;

        // Release an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let release_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(release_index, Op::Release { id });
                }
                Ok(())
            })?;
        }

        // Release an allocation right after making it, to exercise the
        // allocate/release round trip.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    ops.ops.insert(op_index + 1, Op::Release { id });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against a fresh allocator with the given
    /// initial strategy and pool size.
    pub fn run(&self, strategy: Strategy, pool_size: usize) -> Result<(), String> {
        let pool = PoolAllocator::new(strategy, pool_size).map_err(|e| e.to_string())?;
        self.run_with_allocator(pool)
    }

    /// Run these test operations with the given allocator, which must have no
    /// live allocations.
    pub fn run_with_allocator(&self, mut pool: PoolAllocator) -> Result<(), String> {
        log::debug!("========== Running test operations ==========");
        ensure!(
            pool.allocated_bytes() == 0,
            "test operations must start from an allocator without live allocations",
        );

        let mut live = LiveMap::default();
        // A fresh pool's next-fit scan starts at the head.
        let mut anchor = if pool.block_count() == 1 {
            Anchor::Start(0)
        } else {
            Anchor::Unknown
        };

        // An allocation immediately followed by releasing it must restore the
        // free-block count and free bytes from before the allocation.
        let mut round_trip: Option<(u32, Snapshot)> = None;

        check_invariants(&pool, &live)?;

        for op in &self.ops {
            log::debug!("Running {op:?}");
            let pending_round_trip = round_trip.take();

            match op {
                Op::Alloc { id, size } => {
                    let requested = size.get();
                    let before = Snapshot::take(&pool);
                    let expected = expected_choice(pool.strategy(), &before.blocks, requested, anchor);

                    match pool.allocate(requested) {
                        Ok(handle) => {
                            log::debug!("allocated id{id} -> {handle} ({requested} bytes)");
                            check_placement(&before.blocks, handle, requested)?;
                            if let Some(expected) = expected {
                                ensure!(
                                    expected == Some(handle.offset()),
                                    "{} placed {requested} bytes at {handle}, expected {expected:?}",
                                    pool.strategy(),
                                );
                            }
                            ensure!(
                                pool.is_allocated(handle) == Ok(true),
                                "a fresh allocation should be reported as allocated",
                            );
                            anchor = Anchor::Start(handle.offset() + requested);

                            let replaced = live.insert(*id, LiveAlloc { handle, size: requested });
                            if let Some(old) = replaced {
                                log::debug!("releasing replaced id{id} -> {}", old.handle);
                                pool.release(old.handle).map_err(|e| e.to_string())?;
                                anchor = Anchor::Unknown;
                            } else {
                                round_trip = Some((*id, before));
                            }
                        }
                        Err(Error::NoFit { requested: r }) => {
                            ensure!(r == requested, "NoFit should report the requested size");
                            ensure!(
                                pool.strategy() == Strategy::Unset
                                    || before.largest_free() < requested,
                                "{} failed to place {requested} bytes with a {}-byte hole free",
                                pool.strategy(),
                                before.largest_free(),
                            );
                            if let Some(expected) = expected {
                                ensure!(expected.is_none(), "expected a fit at {expected:?}");
                            }
                            ensure!(
                                before == Snapshot::take(&pool),
                                "a failed allocation should not change the allocator",
                            );
                        }
                        Err(e) => return Err(format!("unexpected allocation error: {e}")),
                    }
                }

                Op::Release { id } => {
                    if let Some(alloc) = live.remove(*id) {
                        log::debug!("releasing id{id} -> {}", alloc.handle);
                        pool.release(alloc.handle).map_err(|e| e.to_string())?;
                        ensure!(
                            pool.is_allocated(alloc.handle) == Ok(false),
                            "a released block should be reported as free",
                        );
                        anchor = Anchor::Unknown;

                        if let Some((alloc_id, before)) = pending_round_trip {
                            if alloc_id == *id {
                                let after = Snapshot::take(&pool);
                                ensure!(
                                    before.free_blocks() == after.free_blocks()
                                        && before.stats.free == after.stats.free
                                        && before.stats.holes == after.stats.holes,
                                    "allocate/release round trip changed the ledger:\n\
                                     before: {before:?}\n\
                                     after: {after:?}",
                                );
                            }
                        }
                    } else {
                        // Releasing anything that is not the start of a live
                        // allocation must be rejected without side effects.
                        let offset = *id as usize % (pool.pool_total_size() + 1);
                        if !live.starts_at(offset) {
                            let handle = Handle::from_offset(offset);
                            let before = Snapshot::take(&pool);
                            ensure!(
                                pool.release(handle) == Err(Error::InvalidHandle(handle)),
                                "releasing {handle} should fail",
                            );
                            ensure!(
                                before == Snapshot::take(&pool),
                                "a failed release should not change the allocator",
                            );
                        }
                    }
                }

                Op::Init { strategy, size } => {
                    let strategy = strategy_from_byte(*strategy);
                    let before = Snapshot::take(&pool);
                    match pool.initialize(strategy, size.get()) {
                        Ok(()) => {
                            ensure!(live.is_empty(), "initialized with live allocations");
                            check_fresh(&pool, strategy, size.get())?;
                            anchor = Anchor::Start(0);
                        }
                        Err(Error::OutstandingAllocations { allocated }) => {
                            ensure!(
                                allocated == live.total_allocated_bytes,
                                "reported {allocated} outstanding bytes, expected {}",
                                live.total_allocated_bytes,
                            );
                            ensure!(
                                before == Snapshot::take(&pool),
                                "a refused initialization should not change the allocator",
                            );
                        }
                        Err(e) => return Err(format!("unexpected initialization error: {e}")),
                    }
                }

                Op::ForceInit { strategy, size } => {
                    let strategy = strategy_from_byte(*strategy);
                    pool.force_initialize(strategy, size.get())
                        .map_err(|e| e.to_string())?;
                    live = LiveMap::default();
                    check_fresh(&pool, strategy, size.get())?;
                    anchor = Anchor::Start(0);
                }
            }

            check_invariants(&pool, &live)?;
        }

        // Finally, release any remaining live allocations; the pool must end
        // up as a single hole.
        for (id, alloc) in live.map {
            log::debug!("releasing id{id} -> {}", alloc.handle);
            pool.release(alloc.handle).map_err(|e| e.to_string())?;
        }
        ensure!(
            pool.block_count() == 1 && pool.hole_count() == 1,
            "releasing everything should leave one hole, found {} blocks:\n{}",
            pool.block_count(),
            pool.dump(),
        );
        ensure!(
            pool.largest_free_block() == pool.pool_total_size(),
            "releasing everything should free the whole pool",
        );

        Ok(())
    }
}

/// Where the next next-fit scan is known to start.
#[derive(Clone, Copy, Debug)]
enum Anchor {
    /// At the block starting at this offset (or the head, if the offset is
    /// the end of the pool).
    Start(usize),
    /// Unknown: releases move the cursor in ways we do not model.
    Unknown,
}

/// The offset a strategy must choose for `requested` bytes, `Some(None)` if it
/// must fail, or `None` if we cannot predict it.
fn expected_choice(
    strategy: Strategy,
    blocks: &[BlockInfo],
    requested: usize,
    anchor: Anchor,
) -> Option<Option<usize>> {
    let fits = |b: &&BlockInfo| !b.allocated && b.size >= requested;
    let choice = match strategy {
        Strategy::Unset => None,
        Strategy::First => blocks.iter().find(fits).map(|b| b.offset),
        Strategy::Best => {
            let best = blocks.iter().filter(fits).map(|b| b.size).min();
            best.and_then(|best| {
                blocks
                    .iter()
                    .find(|b| !b.allocated && b.size == best)
                    .map(|b| b.offset)
            })
        }
        Strategy::Worst => {
            let largest = blocks
                .iter()
                .filter(|b| !b.allocated)
                .map(|b| b.size)
                .max()
                .unwrap_or(0);
            if largest == 0 || largest < requested {
                None
            } else {
                blocks
                    .iter()
                    .find(|b| !b.allocated && b.size == largest)
                    .map(|b| b.offset)
            }
        }
        Strategy::Next => {
            let Anchor::Start(start) = anchor else {
                return None;
            };
            blocks
                .iter()
                .filter(|b| b.offset >= start)
                .chain(blocks.iter().filter(|b| b.offset < start))
                .find(fits)
                .map(|b| b.offset)
        }
    };
    Some(choice)
}

/// Whatever the strategy, the allocation must come from the start of a free
/// block that was large enough.
fn check_placement(before: &[BlockInfo], handle: Handle, requested: usize) -> Result<(), String> {
    let chosen = before.iter().find(|b| b.offset == handle.offset());
    ensure!(
        chosen.is_some_and(|b| !b.allocated && b.size >= requested),
        "{requested} bytes placed at {handle}, which was not the start of a large-enough hole \
         ({chosen:?})",
    );
    Ok(())
}

/// Check the state right after a successful initialization.
fn check_fresh(pool: &PoolAllocator, strategy: Strategy, size: usize) -> Result<(), String> {
    ensure!(pool.strategy() == strategy, "strategy not updated");
    ensure!(pool.pool_total_size() == size, "pool size not updated");
    ensure!(
        pool.stats()
            == Stats {
                allocated: 0,
                total: size,
                free: size,
                holes: 1,
                largest_free: size,
            },
        "a fresh pool should be one free block: {:?}",
        pool.stats(),
    );
    Ok(())
}

/// Check the ledger's structural invariants and that the allocator agrees
/// with our model of the live allocations.
fn check_invariants(pool: &PoolAllocator, live: &LiveMap) -> Result<(), String> {
    let blocks: Vec<_> = pool.blocks().collect();
    ensure!(blocks.len() == pool.block_count(), "block count mismatch");

    let mut offset = 0;
    for block in &blocks {
        ensure!(
            block.offset == offset,
            "blocks should be contiguous, found a block at {} after one ending at {offset}",
            block.offset,
        );
        ensure!(block.size > 0, "empty block at {}", block.offset);
        offset = block.end();
    }
    ensure!(
        offset == pool.pool_total_size(),
        "blocks cover {offset} bytes of a {}-byte pool",
        pool.pool_total_size(),
    );

    for pair in blocks.windows(2) {
        ensure!(
            pair[0].allocated || pair[1].allocated,
            "adjacent free blocks at {} and {}",
            pair[0].offset,
            pair[1].offset,
        );
    }

    let free_blocks = blocks.iter().filter(|b| !b.allocated).count();
    let free_bytes: usize = blocks.iter().filter(|b| !b.allocated).map(|b| b.size).sum();
    let largest_free = blocks
        .iter()
        .filter(|b| !b.allocated)
        .map(|b| b.size)
        .max()
        .unwrap_or(0);
    ensure!(
        pool.hole_count() == free_blocks,
        "hole count {} does not match {free_blocks} free blocks",
        pool.hole_count(),
    );
    ensure!(pool.free_bytes() == free_bytes, "free byte count mismatch");
    ensure!(
        pool.largest_free_block() == largest_free,
        "largest free block mismatch",
    );
    ensure!(
        pool.small_free_block_count(usize::MAX) == free_blocks,
        "every free block is at most usize::MAX bytes",
    );
    ensure!(
        pool.allocated_bytes() + free_bytes == pool.pool_total_size(),
        "allocated and free bytes should add up to the pool size",
    );

    ensure!(
        pool.allocated_bytes() == live.total_allocated_bytes,
        "allocator reports {} allocated bytes, expected {}",
        pool.allocated_bytes(),
        live.total_allocated_bytes,
    );
    let allocated_blocks = blocks.iter().filter(|b| b.allocated).count();
    ensure!(
        allocated_blocks == live.map.len(),
        "{allocated_blocks} allocated blocks for {} live allocations",
        live.map.len(),
    );
    for (id, alloc) in &live.map {
        ensure!(
            blocks.iter().any(|b| b.allocated
                && b.offset == alloc.handle.offset()
                && b.size == alloc.size),
            "live allocation id{id} -> {alloc:?} is missing from the ledger",
        );
    }

    Ok(())
}

/// The observable state of an allocator.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Snapshot {
    blocks: Vec<BlockInfo>,
    stats: Stats,
}

impl Snapshot {
    fn take(pool: &PoolAllocator) -> Self {
        Snapshot {
            blocks: pool.blocks().collect(),
            stats: pool.stats(),
        }
    }

    fn free_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| !b.allocated).count()
    }

    fn largest_free(&self) -> usize {
        self.stats.largest_free
    }
}

/// A currently-live allocation.
#[derive(Clone, Copy, Debug)]
struct LiveAlloc {
    handle: Handle,
    size: usize,
}

/// The set of currently-live allocations, keyed by ID.
#[derive(Default)]
struct LiveMap {
    /// The live allocations themselves.
    map: BTreeMap<u32, LiveAlloc>,

    /// The total number of bytes that are currently allocated.
    total_allocated_bytes: usize,
}

impl LiveMap {
    /// Insert a new live allocation, returning the one it replaces, if any.
    fn insert(&mut self, id: u32, alloc: LiveAlloc) -> Option<LiveAlloc> {
        self.total_allocated_bytes += alloc.size;
        let old = self.map.insert(id, alloc);
        if let Some(old) = &old {
            self.total_allocated_bytes -= old.size;
        }
        old
    }

    /// Remove a live allocation for release.
    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        let alloc = self.map.remove(&id)?;
        self.total_allocated_bytes -= alloc.size;
        Some(alloc)
    }

    fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Does some live allocation start at `offset`?
    fn starts_at(&self, offset: usize) -> bool {
        self.map.values().any(|a| a.handle.offset() == offset)
    }
}
