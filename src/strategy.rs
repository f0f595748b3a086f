//! Placement strategies: which free block an allocation is carved from.
//!
//! Every strategy is a read-only scan of the ledger. Ties between equally
//! good blocks always go to the block that comes first in the scan order,
//! which is address order for everything except next-fit, whose scan order is
//! address order rotated to start just past its cursor.

use core::{fmt, str::FromStr};

use crate::{
    ledger::{BlockId, Ledger},
    Error,
};

/// A policy for choosing the free block that satisfies an allocation.
pub(crate) trait Placement {
    /// Choose a free block of at least `requested` bytes, or `None` if there
    /// is no such block. Must not modify the ledger.
    fn select(&self, ledger: &Ledger, requested: usize) -> Option<BlockId>;
}

/// Take the first free block, in address order, that is large enough.
pub(crate) struct FirstFit;

impl Placement for FirstFit {
    fn select(&self, ledger: &Ledger, requested: usize) -> Option<BlockId> {
        ledger
            .iter()
            .find(|(_, block)| block.is_free() && block.size >= requested)
            .map(|(id, _)| id)
    }
}

/// Take the smallest free block that is large enough.
pub(crate) struct BestFit;

impl Placement for BestFit {
    fn select(&self, ledger: &Ledger, requested: usize) -> Option<BlockId> {
        let best = ledger
            .iter()
            .filter(|(_, block)| block.is_free() && block.size >= requested)
            .map(|(_, block)| block.size)
            .min()?;

        ledger
            .iter()
            .find(|(_, block)| block.is_free() && block.size == best)
            .map(|(id, _)| id)
    }
}

/// Take the largest free block, if it is large enough.
pub(crate) struct WorstFit;

impl Placement for WorstFit {
    fn select(&self, ledger: &Ledger, requested: usize) -> Option<BlockId> {
        let largest = ledger
            .iter()
            .filter(|(_, block)| block.is_free())
            .map(|(_, block)| block.size)
            .max()
            .unwrap_or(0);
        if largest == 0 || largest < requested {
            return None;
        }

        ledger
            .iter()
            .find(|(_, block)| block.is_free() && block.size == largest)
            .map(|(id, _)| id)
    }
}

/// Like first-fit, but resume scanning just past the most recently allocated
/// block, wrapping around the pool at most once.
pub(crate) struct NextFit;

impl Placement for NextFit {
    fn select(&self, ledger: &Ledger, requested: usize) -> Option<BlockId> {
        let start = ledger[ledger.cursor()].next();
        ledger
            .iter_from(start)
            .find(|(_, block)| block.is_free() && block.size >= requested)
            .map(|(id, _)| id)
    }
}

/// The placement strategy a [`PoolAllocator`](crate::PoolAllocator) uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// No strategy. Every allocation fails with [`Error::NoFit`].
    #[default]
    Unset,
    /// First-fit: the first large-enough free block in address order.
    First,
    /// Best-fit: the smallest large-enough free block.
    Best,
    /// Worst-fit: the largest free block.
    Worst,
    /// Next-fit: first-fit, resuming after the last allocation.
    Next,
}

impl Strategy {
    /// Every strategy that can actually place an allocation.
    pub const ALL: [Strategy; 4] = [
        Strategy::First,
        Strategy::Best,
        Strategy::Worst,
        Strategy::Next,
    ];

    /// The strategy's short name, as accepted by [`Strategy::from_str`].
    pub fn name(self) -> &'static str {
        match self {
            Strategy::Unset => "unknown",
            Strategy::First => "first",
            Strategy::Best => "best",
            Strategy::Worst => "worst",
            Strategy::Next => "next",
        }
    }

    pub(crate) fn select(self, ledger: &Ledger, requested: usize) -> Option<BlockId> {
        match self {
            Strategy::Unset => None,
            Strategy::First => FirstFit.select(ledger, requested),
            Strategy::Best => BestFit.select(ledger, requested),
            Strategy::Worst => WorstFit.select(ledger, requested),
            Strategy::Next => NextFit.select(ledger, requested),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(Strategy::First),
            "best" => Ok(Strategy::Best),
            "worst" => Ok(Strategy::Worst),
            "next" => Ok(Strategy::Next),
            _ => Err(Error::UnknownStrategy(s.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{string::ToString, vec::Vec};

    /// Build a ledger from `(size, allocated)` pairs in address order.
    fn ledger_with(blocks: &[(usize, bool)]) -> Ledger {
        let total = blocks.iter().map(|(size, _)| size).sum();
        let mut ledger = Ledger::new(total);
        let mut offset = 0;
        let mut ids = Vec::new();
        for (size, _) in blocks {
            let id = ledger.locate(offset).unwrap();
            ids.push(ledger.split(id, *size));
            offset += size;
        }
        for (id, (_, allocated)) in ids.into_iter().zip(blocks) {
            if !allocated {
                ledger.mark_free(id);
            }
        }
        ledger
    }

    fn offset_of(ledger: &Ledger, id: Option<BlockId>) -> Option<usize> {
        id.map(|id| ledger[id].offset)
    }

    const LAYOUT: &[(usize, bool)] = &[
        (10, true),
        (30, false),
        (10, true),
        (20, false),
        (10, true),
        (50, false),
        (10, true),
        (20, false),
    ];

    #[test]
    fn first_fit_takes_earliest() {
        let ledger = ledger_with(LAYOUT);
        assert_eq!(offset_of(&ledger, FirstFit.select(&ledger, 15)), Some(10));
        assert_eq!(offset_of(&ledger, FirstFit.select(&ledger, 31)), Some(80));
        assert_eq!(offset_of(&ledger, FirstFit.select(&ledger, 50)), Some(80));
        assert_eq!(FirstFit.select(&ledger, 51), None);
    }

    #[test]
    fn best_fit_takes_tightest_earliest() {
        let ledger = ledger_with(LAYOUT);
        assert_eq!(offset_of(&ledger, BestFit.select(&ledger, 15)), Some(50));
        assert_eq!(offset_of(&ledger, BestFit.select(&ledger, 20)), Some(50));
        assert_eq!(offset_of(&ledger, BestFit.select(&ledger, 21)), Some(10));
        assert_eq!(offset_of(&ledger, BestFit.select(&ledger, 31)), Some(80));
        assert_eq!(BestFit.select(&ledger, 51), None);
    }

    #[test]
    fn worst_fit_takes_largest() {
        let ledger = ledger_with(LAYOUT);
        assert_eq!(offset_of(&ledger, WorstFit.select(&ledger, 1)), Some(80));
        assert_eq!(offset_of(&ledger, WorstFit.select(&ledger, 50)), Some(80));
        assert_eq!(WorstFit.select(&ledger, 51), None);

        let ledger = ledger_with(&[(20, false), (10, true), (20, false)]);
        assert_eq!(offset_of(&ledger, WorstFit.select(&ledger, 5)), Some(0));
    }

    #[test]
    fn worst_fit_with_nothing_free() {
        let ledger = ledger_with(&[(20, true), (10, true)]);
        assert_eq!(WorstFit.select(&ledger, 1), None);
    }

    #[test]
    fn next_fit_resumes_after_cursor() {
        let mut ledger = ledger_with(LAYOUT);
        let cursor = ledger.locate(40).unwrap();
        ledger.set_cursor(cursor);
        assert_eq!(offset_of(&ledger, NextFit.select(&ledger, 15)), Some(50));
        assert_eq!(offset_of(&ledger, NextFit.select(&ledger, 25)), Some(80));

        // Wraps around the end of the pool.
        let cursor = ledger.locate(140).unwrap();
        ledger.set_cursor(cursor);
        assert_eq!(offset_of(&ledger, NextFit.select(&ledger, 25)), Some(10));

        // Scan order here is 140, 0, 10, ..., 130.
        let cursor = ledger.locate(130).unwrap();
        ledger.set_cursor(cursor);
        assert_eq!(offset_of(&ledger, NextFit.select(&ledger, 15)), Some(140));
        assert_eq!(offset_of(&ledger, NextFit.select(&ledger, 25)), Some(10));
        assert_eq!(NextFit.select(&ledger, 51), None);
    }

    #[test]
    fn unset_never_fits() {
        let ledger = ledger_with(&[(100, false)]);
        assert_eq!(Strategy::Unset.select(&ledger, 1), None);
        assert!(Strategy::First.select(&ledger, 1).is_some());
    }

    #[test]
    fn names() {
        for strategy in Strategy::ALL {
            assert_eq!(strategy.to_string().parse::<Strategy>(), Ok(strategy));
        }
        assert_eq!(Strategy::Unset.to_string(), "unknown");
        assert_eq!(
            "random".parse::<Strategy>(),
            Err(Error::UnknownStrategy("random".into()))
        );
    }
}
