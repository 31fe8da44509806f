//! ArrayLayout: how the elements of an array are distributed over ranks.
//!
//! A layout is either *sequential* (the calling process holds the whole
//! array and indexes it locally) or *distributed* over the ranks of a
//! communicator, described by ownership offsets `ranges[0..=nranks]`: rank
//! `r` owns global indices `ranges[r]..ranges[r+1]`.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::algs::communicator::Communicator;
use crate::debug_invariants::DebugInvariants;
use crate::scatter_error::ScatterError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayLayout {
    ranges: Vec<usize>,
    rank: usize,
    distributed: bool,
}

impl ArrayLayout {
    /// Array held entirely by the calling process.
    pub fn sequential(len: usize) -> Self {
        Self {
            ranges: vec![0, len],
            rank: 0,
            distributed: false,
        }
    }

    /// Distributed layout from explicit ownership offsets.
    pub fn from_ranges(ranges: Vec<usize>, rank: usize) -> Result<Self, ScatterError> {
        let layout = Self {
            ranges,
            rank,
            distributed: true,
        };
        layout.validate_invariants()?;
        Ok(layout)
    }

    /// Distributed layout from the local length of every rank.
    pub fn from_local_sizes(sizes: &[usize], rank: usize) -> Result<Self, ScatterError> {
        let mut ranges = Vec::with_capacity(sizes.len() + 1);
        ranges.push(0);
        let mut acc = 0usize;
        for &s in sizes {
            acc += s;
            ranges.push(acc);
        }
        Self::from_ranges(ranges, rank)
    }

    /// Split `global` elements as evenly as possible over the ranks of `comm`.
    /// Not collective.
    pub fn split<C: Communicator>(comm: &C, global: usize) -> Self {
        let n = comm.size().max(1);
        let sizes: Vec<usize> = (0..n).map(|r| even_share(global, n, r)).collect();
        let mut ranges = Vec::with_capacity(n + 1);
        ranges.push(0);
        for s in sizes {
            let last = ranges[ranges.len() - 1];
            ranges.push(last + s);
        }
        let layout = Self {
            ranges,
            rank: comm.rank(),
            distributed: true,
        };
        layout.debug_assert_invariants();
        layout
    }

    /// Collective constructor: either length may be unknown (see
    /// [`split_ownership`]); all local lengths are then shared.
    pub fn new<C: Communicator>(
        comm: &C,
        local: Option<usize>,
        global: Option<usize>,
    ) -> Result<Self, ScatterError> {
        let (local, global) = split_ownership(comm, local, global)?;
        let mut all = Vec::new();
        if let Some(chunks) = comm.gather(0, &(local as u64).to_le_bytes()) {
            all = chunks.concat();
        }
        comm.broadcast(0, &mut all);
        let sizes: Vec<usize> = all
            .chunks_exact(8)
            .map(|w| {
                let mut b = [0u8; 8];
                b.copy_from_slice(w);
                u64::from_le_bytes(b) as usize
            })
            .collect();
        if sizes.len() != comm.size() {
            return Err(ScatterError::size("gathered local sizes", comm.size(), sizes.len()));
        }
        let layout = Self::from_local_sizes(&sizes, comm.rank())?;
        if layout.len() != global {
            return Err(ScatterError::size("global length", global, layout.len()));
        }
        Ok(layout)
    }

    /// Global number of elements.
    pub fn len(&self) -> usize {
        self.ranges.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements held by the calling process.
    pub fn local_len(&self) -> usize {
        let r = self.ownership_range();
        r.end - r.start
    }

    /// Global indices owned by the calling process.
    pub fn ownership_range(&self) -> Range<usize> {
        self.ranges[self.rank]..self.ranges[self.rank + 1]
    }

    /// Rank owning global index `g`, `None` if out of range.
    pub fn owner_of(&self, g: usize) -> Option<usize> {
        if g >= self.len() {
            return None;
        }
        // first rank whose end is past `g`; skips ranks with empty ranges
        Some(self.ranges[1..].partition_point(|&end| end <= g))
    }

    pub fn nranks(&self) -> usize {
        self.ranges.len() - 1
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Distributed over more than one rank.
    pub fn is_distributed(&self) -> bool {
        self.distributed && self.nranks() > 1
    }

    pub fn is_sequential(&self) -> bool {
        !self.is_distributed()
    }

    pub fn ranges(&self) -> &[usize] {
        &self.ranges
    }

    /// Every ownership offset is a multiple of `bs`.
    pub fn is_block_aligned(&self, bs: usize) -> bool {
        bs > 0 && self.ranges.iter().all(|r| r % bs == 0)
    }
}

impl DebugInvariants for ArrayLayout {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "ArrayLayout");
    }

    fn validate_invariants(&self) -> Result<(), ScatterError> {
        if self.ranges.len() < 2 {
            return Err(ScatterError::InvalidLayout(
                "ownership offsets need at least two entries".into(),
            ));
        }
        if self.ranges[0] != 0 {
            return Err(ScatterError::InvalidLayout(format!(
                "ownership offsets must start at 0, found {}",
                self.ranges[0]
            )));
        }
        if let Some(k) = self.ranges.windows(2).position(|w| w[0] > w[1]) {
            return Err(ScatterError::InvalidLayout(format!(
                "ownership offsets decrease at rank {k}"
            )));
        }
        if self.rank >= self.nranks() {
            return Err(ScatterError::InvalidLayout(format!(
                "rank {} outside a layout of {} ranks",
                self.rank,
                self.nranks()
            )));
        }
        Ok(())
    }
}

fn even_share(global: usize, nranks: usize, rank: usize) -> usize {
    global / nranks + usize::from(global % nranks > rank)
}

/// Resolve a `(local, global)` length pair where one side may be unknown.
///
/// - global unknown: sum of the local lengths over `comm` (collective),
/// - local unknown: `global / size`, plus one on the first `global % size` ranks,
/// - both known: the local lengths must add up to `global` (collective).
///
/// Both unknown is a `SizeMismatch`.
pub fn split_ownership<C: Communicator>(
    comm: &C,
    local: Option<usize>,
    global: Option<usize>,
) -> Result<(usize, usize), ScatterError> {
    match (local, global) {
        (None, None) => Err(ScatterError::size(
            "ownership split with neither local nor global length",
            1,
            0,
        )),
        (Some(n), None) => {
            let mut sum = [n as u64];
            comm.allreduce_sum(&mut sum);
            Ok((n, sum[0] as usize))
        }
        (None, Some(g)) => Ok((even_share(g, comm.size().max(1), comm.rank()), g)),
        (Some(n), Some(g)) => {
            let mut sum = [n as u64];
            comm.allreduce_sum(&mut sum);
            if sum[0] as usize != g {
                return Err(ScatterError::size("sum of local lengths", g, sum[0] as usize));
            }
            Ok((n, g))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    #[test]
    fn owner_lookup_skips_empty_ranks() {
        let l = ArrayLayout::from_ranges(vec![0, 3, 3, 7], 0).unwrap();
        assert_eq!(l.owner_of(0), Some(0));
        assert_eq!(l.owner_of(2), Some(0));
        assert_eq!(l.owner_of(3), Some(2));
        assert_eq!(l.owner_of(6), Some(2));
        assert_eq!(l.owner_of(7), None);
    }

    #[test]
    fn malformed_ranges_are_rejected() {
        assert!(ArrayLayout::from_ranges(vec![1, 3], 0).is_err());
        assert!(ArrayLayout::from_ranges(vec![0, 4, 2], 0).is_err());
        assert!(ArrayLayout::from_ranges(vec![0, 4], 1).is_err());
    }

    #[test]
    fn even_split_front_loads_remainder() {
        let shares: Vec<usize> = (0..4).map(|r| even_share(10, 4, r)).collect();
        assert_eq!(shares, vec![3, 3, 2, 2]);
    }

    #[test]
    fn single_rank_layout_is_not_distributed() {
        let l = ArrayLayout::split(&NoComm, 5);
        assert!(!l.is_distributed());
        assert_eq!(l.ownership_range(), 0..5);
        let s = ArrayLayout::sequential(5);
        assert!(s.is_sequential());
    }

    #[test]
    fn split_ownership_single_rank() {
        assert_eq!(split_ownership(&NoComm, None, Some(9)).unwrap(), (9, 9));
        assert_eq!(split_ownership(&NoComm, Some(4), None).unwrap(), (4, 4));
        assert!(split_ownership(&NoComm, None, None).is_err());
        assert!(split_ownership(&NoComm, Some(4), Some(5)).is_err());
    }

    #[test]
    fn block_alignment() {
        let l = ArrayLayout::from_local_sizes(&[4, 2, 6], 1).unwrap();
        assert!(l.is_block_aligned(2));
        assert!(!l.is_block_aligned(4));
        assert_eq!(l.local_len(), 2);
    }
}
