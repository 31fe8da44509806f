//! Local plans: both arrays are held by the calling process.
//!
//! A [`SeqPair`] stores one [`SeqSide`] per array. Execution is
//! `y[to[k]] = fuse(y[to[k]], x[from[k]])` for `k < n`; in reverse the two
//! sides trade places. Two unit strides run as one slice operation.

use serde::Serialize;

use crate::data::index_set::IndexSet;
use crate::data::scalar::Scalar;
use crate::scatter::combine::{CombineMode, Direction};
use crate::scatter_error::ScatterError;

/// Slots of one array: an explicit table or an affine sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum SeqSide {
    General(Vec<usize>),
    Stride { first: usize, step: isize },
}

impl SeqSide {
    /// Stride sets stay affine; general and block sets become tables.
    pub fn from_index_set(is: &IndexSet) -> Self {
        match is.as_stride() {
            Some((first, step, _)) => SeqSide::Stride { first, step },
            None => SeqSide::General(is.to_vec()),
        }
    }

    /// Stride shifted so that global index `offset` becomes slot 0.
    pub fn shifted_stride(first: usize, step: isize, offset: usize) -> Self {
        SeqSide::Stride {
            first: first.saturating_sub(offset),
            step,
        }
    }

    #[inline]
    pub fn at(&self, k: usize) -> usize {
        match self {
            SeqSide::General(v) => v[k],
            SeqSide::Stride { first, step } => (*first as isize + step * k as isize) as usize,
        }
    }

    /// `1 + ` the largest slot touched by the first `n` entries (0 if `n == 0`).
    pub fn extent(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        match self {
            SeqSide::General(v) => v[..n].iter().max().map_or(0, |m| m + 1),
            SeqSide::Stride { first, step } => {
                let last = (*first as isize + step * (n as isize - 1)) as usize;
                (*first).max(last) + 1
            }
        }
    }

    fn unit_start(&self) -> Option<usize> {
        match self {
            SeqSide::Stride { first, step: 1 } => Some(*first),
            _ => None,
        }
    }
}

/// A complete local plan of `n` entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SeqPair {
    pub n: usize,
    pub from: SeqSide,
    pub to: SeqSide,
}

impl SeqPair {
    pub fn new(n: usize, from: SeqSide, to: SeqSide) -> Self {
        Self { n, from, to }
    }

    /// Unit strides from slot 0 on both sides.
    pub fn identity(n: usize) -> Self {
        Self::new(
            n,
            SeqSide::Stride { first: 0, step: 1 },
            SeqSide::Stride { first: 0, step: 1 },
        )
    }

    /// Minimum lengths of the (source, destination) arrays of a call.
    pub fn min_lens(&self, dir: Direction) -> (usize, usize) {
        let (f, t) = (self.from.extent(self.n), self.to.extent(self.n));
        if dir.is_reverse() { (t, f) } else { (f, t) }
    }

    /// Destination table contains a slot more than once.
    pub fn has_repeated_destination(&self) -> bool {
        match &self.to {
            SeqSide::General(v) => {
                let mut seen = hashbrown::HashSet::with_capacity(v.len());
                v[..self.n].iter().any(|s| !seen.insert(*s))
            }
            SeqSide::Stride { step, .. } => *step == 0 && self.n > 1,
        }
    }

    pub fn run<T: Scalar>(&self, x: &[T], y: &mut [T], mode: CombineMode, dir: Direction) {
        let (src, dst) = if dir.is_reverse() {
            (&self.to, &self.from)
        } else {
            (&self.from, &self.to)
        };
        if self.n == 0 {
            return;
        }
        if let (Some(s), Some(d)) = (src.unit_start(), dst.unit_start()) {
            mode.fuse_slice(&mut y[d..d + self.n], &x[s..s + self.n]);
            return;
        }
        for k in 0..self.n {
            mode.fuse(&mut y[dst.at(k)], x[src.at(k)]);
        }
    }

    /// Renumber the source slots through `map` (old slot -> new slot).
    ///
    /// A stride side only accepts the identity map over an identity stride.
    pub fn remap_source(&mut self, map: &[usize]) -> Result<(), ScatterError> {
        match &mut self.from {
            SeqSide::General(slots) => {
                if let Some((position, &slot)) =
                    slots.iter().enumerate().find(|(_, s)| **s >= map.len())
                {
                    return Err(ScatterError::IndexOutOfRange {
                        index: slot as i64,
                        position,
                        bound: map.len(),
                    });
                }
                for slot in slots.iter_mut() {
                    *slot = map[*slot];
                }
                Ok(())
            }
            SeqSide::Stride { first: 0, step: 1 } => {
                if (0..self.n).all(|i| map.get(i) == Some(&i)) {
                    Ok(())
                } else {
                    Err(ScatterError::UnsupportedOperation(
                        "remapping a strided source requires the identity map",
                    ))
                }
            }
            SeqSide::Stride { .. } => Err(ScatterError::UnsupportedOperation(
                "remapping a strided source requires an identity stride",
            )),
        }
    }
}
