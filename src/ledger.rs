//! The block ledger.
//!
//! The ledger partitions the pool into contiguous blocks, each either free or
//! allocated. Blocks live in an arena and are linked into a circular,
//! address-ordered list through `prev`/`next` indices:
//!
//! ```text
//!        head                                      (wraps to head)
//!          v                                             |
//!   +------------+-----------+---------------+-----------+
//!   | alloc  100 | free   50 | alloc      150| free   200|
//!   +------------+-----------+---------------+-----------+
//!   0           100         150             300         500
//! ```
//!
//! List order is physical address order, so the only pair of list neighbors
//! that are *not* physically adjacent is the last block and the head. The head
//! is always the block at offset zero.
//!
//! Every traversal is driven by its own [`Iter`], so interleaved queries never
//! disturb each other.

use alloc::{vec, vec::Vec};
use core::ops::{Index, IndexMut};

/// An index into the ledger's block arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BlockId(usize);

#[derive(Clone, Debug)]
pub(crate) struct Block {
    pub(crate) offset: usize,
    pub(crate) size: usize,
    pub(crate) allocated: bool,
    prev: BlockId,
    next: BlockId,
}

impl Block {
    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        !self.allocated
    }

    #[inline]
    pub(crate) fn end(&self) -> usize {
        self.offset + self.size
    }

    #[inline]
    pub(crate) fn contains(&self, offset: usize) -> bool {
        self.offset <= offset && offset < self.end()
    }

    #[inline]
    pub(crate) fn next(&self) -> BlockId {
        self.next
    }

    pub(crate) fn info(&self) -> BlockInfo {
        BlockInfo {
            offset: self.offset,
            size: self.size,
            allocated: self.allocated,
        }
    }
}

/// A read-only snapshot of one block of the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    /// Offset of the block's first byte from the start of the pool.
    pub offset: usize,
    /// Number of bytes in the block.
    pub size: usize,
    /// Whether the block is currently handed out.
    pub allocated: bool,
}

impl BlockInfo {
    /// Offset one past the block's last byte.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

pub(crate) struct Ledger {
    /// The block arena. `None` marks a slot whose block was absorbed by a
    /// merge and that is waiting in `vacant` for reuse.
    slots: Vec<Option<Block>>,
    vacant: Vec<BlockId>,
    len: usize,
    head: BlockId,
    /// The most recently allocated block. Next-fit resumes just past it.
    cursor: BlockId,
}

impl Ledger {
    /// Create a ledger holding a single free block of `total_size` bytes.
    pub(crate) fn new(total_size: usize) -> Self {
        debug_assert_ne!(total_size, 0);
        let head = BlockId(0);
        let block = Block {
            offset: 0,
            size: total_size,
            allocated: false,
            prev: head,
            next: head,
        };
        Ledger {
            slots: vec![Some(block)],
            vacant: Vec::new(),
            len: 1,
            head,
            cursor: head,
        }
    }

    #[inline]
    pub(crate) fn head(&self) -> BlockId {
        self.head
    }

    #[inline]
    pub(crate) fn cursor(&self) -> BlockId {
        self.cursor
    }

    #[inline]
    pub(crate) fn set_cursor(&mut self, id: BlockId) {
        debug_assert!(self.slots[id.0].is_some());
        self.cursor = id;
    }

    /// The number of blocks in the cycle.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Traverse the whole cycle once, in address order.
    #[inline]
    pub(crate) fn iter(&self) -> Iter<'_> {
        self.iter_from(self.head())
    }

    /// Traverse the whole cycle once, starting at `start` and wrapping around
    /// past the last block back to the head.
    #[inline]
    pub(crate) fn iter_from(&self, start: BlockId) -> Iter<'_> {
        Iter {
            ledger: self,
            start,
            next: Some(start),
        }
    }

    fn insert(&mut self, block: Block) -> BlockId {
        self.len += 1;
        match self.vacant.pop() {
            Some(id) => {
                debug_assert!(self.slots[id.0].is_none());
                self.slots[id.0] = Some(block);
                id
            }
            None => {
                self.slots.push(Some(block));
                BlockId(self.slots.len() - 1)
            }
        }
    }

    fn remove(&mut self, id: BlockId) -> Block {
        let block = self.slots[id.0]
            .take()
            .expect("removed block should be live");
        self.vacant.push(id);
        self.len -= 1;
        block
    }

    /// Hand out `requested` bytes from the start of the free block `id`.
    ///
    /// An exact fit is flipped to allocated in place. Otherwise a new
    /// allocated block is carved off the front and linked in just before the
    /// shrunken free remainder. Returns the allocated block.
    pub(crate) fn split(&mut self, id: BlockId, requested: usize) -> BlockId {
        let block = &self[id];
        debug_assert!(block.is_free(), "only free blocks can be split");
        debug_assert!(
            block.size >= requested,
            "cannot carve {requested} bytes out of a {}-byte block",
            block.size
        );

        if block.size == requested {
            log::trace!("allocating block at {} in place", block.offset);
            self[id].allocated = true;
            return id;
        }

        let offset = block.offset;
        let prev = block.prev;
        let carved = self.insert(Block {
            offset,
            size: requested,
            allocated: true,
            prev,
            next: id,
        });

        self[prev].next = carved;
        let remainder = &mut self[id];
        remainder.prev = carved;
        remainder.offset += requested;
        remainder.size -= requested;
        log::trace!(
            "split {requested} bytes at {offset}, leaving {} free bytes at {}",
            remainder.size,
            remainder.offset
        );

        if self.head == id {
            self.head = carved;
        }
        carved
    }

    /// Find the block starting exactly at `offset`.
    pub(crate) fn locate(&self, offset: usize) -> Option<BlockId> {
        self.iter()
            .find(|(_, block)| block.offset == offset)
            .map(|(id, _)| id)
    }

    /// Find the block whose byte range contains `offset`.
    pub(crate) fn find_containing(&self, offset: usize) -> Option<BlockId> {
        self.iter()
            .find(|(_, block)| block.contains(offset))
            .map(|(id, _)| id)
    }

    /// Flip `id` to free. If next-fit was parked on it, move on to its
    /// successor.
    pub(crate) fn mark_free(&mut self, id: BlockId) {
        let block = &mut self[id];
        debug_assert!(block.allocated, "double free of block at {}", block.offset);
        block.allocated = false;
        let next = block.next;
        if self.cursor == id {
            self.cursor = next;
        }
    }

    /// Absorb `id` into its free predecessor and discard it. Returns the
    /// predecessor.
    pub(crate) fn merge(&mut self, id: BlockId) -> BlockId {
        let prev = self[id].prev;
        debug_assert_ne!(prev, id, "a lone block has nothing to merge with");
        debug_assert!(self[prev].is_free(), "can only merge into a free block");
        debug_assert_eq!(self[prev].end(), self[id].offset);

        let victim = self.remove(id);
        let absorber = &mut self[prev];
        absorber.size += victim.size;
        absorber.next = victim.next;
        log::trace!(
            "merged {} bytes at {} into block at {}",
            victim.size,
            victim.offset,
            absorber.offset
        );
        self[victim.next].prev = prev;

        if self.head == id {
            self.head = prev;
        }
        if self.cursor == id {
            self.cursor = prev;
        }
        prev
    }

    /// Merge the just-released block `id` with whichever physical neighbors
    /// are free. Returns how many merges happened.
    pub(crate) fn coalesce_around_release(&mut self, id: BlockId) -> usize {
        debug_assert!(self[id].is_free());
        let mut merges = 0;
        let mut current = id;

        if current != self.head && self[self[current].prev].is_free() {
            current = self.merge(current);
            merges += 1;
        }

        let next = self[current].next;
        if next != self.head && self[next].is_free() {
            self.merge(next);
            merges += 1;
        }

        merges
    }
}

impl Index<BlockId> for Ledger {
    type Output = Block;

    #[inline]
    fn index(&self, id: BlockId) -> &Block {
        self.slots[id.0]
            .as_ref()
            .expect("BlockId should refer to a live block")
    }
}

impl IndexMut<BlockId> for Ledger {
    #[inline]
    fn index_mut(&mut self, id: BlockId) -> &mut Block {
        self.slots[id.0]
            .as_mut()
            .expect("BlockId should refer to a live block")
    }
}

/// One pass around the block cycle.
pub(crate) struct Iter<'a> {
    ledger: &'a Ledger,
    start: BlockId,
    next: Option<BlockId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (BlockId, &'a Block);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let block = &self.ledger[id];
        self.next = Some(block.next).filter(|next| *next != self.start);
        Some((id, block))
    }
}
