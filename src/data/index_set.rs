//! IndexSet: the index descriptors a scatter plan is built from.
//!
//! Three shapes are supported:
//! - `General`: an explicit list of element indices,
//! - `Stride`: `first, first+step, ...` (`len` entries; `step` may be negative),
//! - `Block`: block numbers of size `bs`; block `b` covers `[b*bs, (b+1)*bs)`.
//!
//! Lengths are always counted in elements.

use serde::{Deserialize, Serialize};

use crate::debug_invariants::DebugInvariants;
use crate::scatter_error::ScatterError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexSet {
    General(Vec<usize>),
    Stride { first: usize, step: isize, len: usize },
    Block { bs: usize, blocks: Vec<usize> },
}

impl IndexSet {
    pub fn general(indices: impl Into<Vec<usize>>) -> Self {
        IndexSet::General(indices.into())
    }

    /// Strided set. Fails with `IndexOutOfRange` if a negative step would
    /// walk below zero.
    pub fn stride(first: usize, step: isize, len: usize) -> Result<Self, ScatterError> {
        if step < 0 && len > 0 {
            let span = step.unsigned_abs().saturating_mul(len - 1);
            if span > first {
                return Err(ScatterError::IndexOutOfRange {
                    index: first as i64 - span as i64,
                    position: len - 1,
                    bound: usize::MAX,
                });
            }
        }
        Ok(IndexSet::Stride { first, step, len })
    }

    /// Unit stride `[first, first+len)`.
    pub fn range(first: usize, len: usize) -> Self {
        IndexSet::Stride { first, step: 1, len }
    }

    pub fn block(bs: usize, blocks: impl Into<Vec<usize>>) -> Result<Self, ScatterError> {
        if bs == 0 {
            return Err(ScatterError::InvalidLayout("block size must be positive".into()));
        }
        Ok(IndexSet::Block {
            bs,
            blocks: blocks.into(),
        })
    }

    /// Number of element indices described.
    pub fn len(&self) -> usize {
        match self {
            IndexSet::General(v) => v.len(),
            IndexSet::Stride { len, .. } => *len,
            IndexSet::Block { bs, blocks } => bs * blocks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `i`-th element index, or `None` past the end.
    pub fn get(&self, i: usize) -> Option<usize> {
        if i >= self.len() {
            return None;
        }
        Some(match self {
            IndexSet::General(v) => v[i],
            IndexSet::Stride { first, step, .. } => {
                (*first as isize + step * i as isize) as usize
            }
            IndexSet::Block { bs, blocks } => blocks[i / bs] * bs + i % bs,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    pub fn to_vec(&self) -> Vec<usize> {
        match self {
            IndexSet::General(v) => v.clone(),
            _ => self.iter().collect(),
        }
    }

    /// Smallest and largest element index, or `None` when empty.
    pub fn min_max(&self) -> Option<(usize, usize)> {
        match self {
            IndexSet::Stride { first, step, len } if *len > 0 => {
                let last = (*first as isize + step * (*len as isize - 1)) as usize;
                Some(((*first).min(last), (*first).max(last)))
            }
            IndexSet::Block { bs, blocks } => {
                let lo = blocks.iter().min()?;
                let hi = blocks.iter().max()?;
                Some((lo * bs, hi * bs + bs - 1))
            }
            _ => {
                let mut it = self.iter();
                let first = it.next()?;
                Some(it.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
            }
        }
    }

    /// Block size; 1 for non-block sets.
    pub fn block_size(&self) -> usize {
        match self {
            IndexSet::Block { bs, .. } => *bs,
            _ => 1,
        }
    }

    pub fn as_stride(&self) -> Option<(usize, isize, usize)> {
        match self {
            IndexSet::Stride { first, step, len } => Some((*first, *step, *len)),
            _ => None,
        }
    }

    /// Index `i` maps to `i` for every `i < len`.
    pub fn is_identity(&self) -> bool {
        match self {
            IndexSet::Stride { first, step, len } => {
                *len == 0 || (*first == 0 && (*step == 1 || *len == 1))
            }
            IndexSet::General(v) => v.iter().enumerate().all(|(i, &x)| i == x),
            IndexSet::Block { bs, blocks } => *bs > 0 && blocks.iter().enumerate().all(|(i, &b)| b == i),
        }
    }

    /// Every index lies in `[0, bound)`.
    pub fn check_bounds(&self, bound: usize) -> Result<(), ScatterError> {
        match self {
            IndexSet::General(v) => {
                if let Some((position, &index)) = v.iter().enumerate().find(|(_, x)| **x >= bound) {
                    return Err(ScatterError::IndexOutOfRange {
                        index: index as i64,
                        position,
                        bound,
                    });
                }
            }
            IndexSet::Stride { first, step, len } if *len > 0 => {
                let last = *first as i64 + *step as i64 * (*len as i64 - 1);
                let (position, index) = if *first >= bound {
                    (0, *first as i64)
                } else {
                    (len - 1, last)
                };
                if index < 0 || index as u64 >= bound as u64 {
                    return Err(ScatterError::IndexOutOfRange { index, position, bound });
                }
            }
            IndexSet::Block { bs, blocks } => {
                if let Some((b, &blk)) = blocks.iter().enumerate().find(|(_, x)| (**x + 1) * bs > bound) {
                    return Err(ScatterError::IndexOutOfRange {
                        index: (blk * bs) as i64,
                        position: b * bs,
                        bound,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl DebugInvariants for IndexSet {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "IndexSet");
    }

    fn validate_invariants(&self) -> Result<(), ScatterError> {
        match self {
            IndexSet::Block { bs: 0, .. } => {
                Err(ScatterError::InvalidLayout("block size must be positive".into()))
            }
            IndexSet::Stride { first, step, len } if *step < 0 && *len > 0 => {
                let span = step.unsigned_abs() * (len - 1);
                if span > *first {
                    Err(ScatterError::IndexOutOfRange {
                        index: *first as i64 - span as i64,
                        position: len - 1,
                        bound: usize::MAX,
                    })
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_expands_to_elements() {
        let is = IndexSet::block(3, vec![2, 0]).unwrap();
        assert_eq!(is.len(), 6);
        assert_eq!(is.to_vec(), vec![6, 7, 8, 0, 1, 2]);
        assert_eq!(is.min_max(), Some((0, 8)));
    }

    #[test]
    fn negative_stride() {
        let is = IndexSet::stride(8, -2, 4).unwrap();
        assert_eq!(is.to_vec(), vec![8, 6, 4, 2]);
        assert_eq!(is.min_max(), Some((2, 8)));
        assert!(IndexSet::stride(3, -2, 3).is_err());
    }

    #[test]
    fn identity_detection() {
        assert!(IndexSet::range(0, 5).is_identity());
        assert!(!IndexSet::range(1, 5).is_identity());
        assert!(IndexSet::general(vec![0, 1, 2]).is_identity());
        assert!(!IndexSet::general(vec![0, 2, 1]).is_identity());
    }

    #[test]
    fn bounds_are_reported_with_position() {
        let err = IndexSet::general(vec![0, 5, 9]).check_bounds(6).unwrap_err();
        match err {
            ScatterError::IndexOutOfRange { index, position, bound } => {
                assert_eq!((index, position, bound), (9, 2, 6));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(IndexSet::range(2, 4).check_bounds(6).is_ok());
        assert!(IndexSet::range(2, 5).check_bounds(6).is_err());
        assert!(IndexSet::block(2, vec![2]).unwrap().check_bounds(6).is_ok());
        assert!(IndexSet::block(2, vec![3]).unwrap().check_bounds(6).is_err());
    }

    #[test]
    fn zero_block_size_is_rejected() {
        assert!(IndexSet::block(0, vec![1]).is_err());
    }
}
