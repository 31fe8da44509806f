//! Combine modes: how an incoming value merges into an occupied destination slot.

use serde::{Deserialize, Serialize};

use crate::data::scalar::Scalar;
use crate::scatter_error::ScatterError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CombineMode {
    /// Overwrite the destination.
    Insert,
    /// Accumulate into the destination; integers wrap on overflow.
    Add,
    /// Keep the larger value; only for ordered element types.
    Max,
}

/// Which way a plan runs. In `Reverse` the caller passes the arrays swapped:
/// the source of the call has the plan's destination layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn is_reverse(self) -> bool {
        matches!(self, Direction::Reverse)
    }
}

impl CombineMode {
    /// Reject modes the element type cannot support.
    pub fn check<T: Scalar>(self) -> Result<(), ScatterError> {
        if self == CombineMode::Max && !T::ORDERED {
            return Err(ScatterError::UnsupportedOperation(
                "max combine on an element type without an order",
            ));
        }
        Ok(())
    }

    /// Merge one incoming value into `local`.
    #[inline]
    pub fn fuse<T: Scalar>(self, local: &mut T, incoming: T) {
        match self {
            CombineMode::Insert => *local = incoming,
            CombineMode::Add => *local = T::combine_add(*local, incoming),
            CombineMode::Max => {
                if let Some(m) = T::try_max(*local, incoming) {
                    *local = m;
                }
            }
        }
    }

    /// Element-wise [`fuse`](Self::fuse) over equally long slices.
    #[inline]
    pub fn fuse_slice<T: Scalar>(self, local: &mut [T], incoming: &[T]) {
        debug_assert_eq!(local.len(), incoming.len());
        match self {
            CombineMode::Insert => local.copy_from_slice(incoming),
            _ => {
                for (l, &v) in local.iter_mut().zip(incoming) {
                    self.fuse(l, v);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::scalar::Complex64;

    #[test]
    fn fuse_slice_modes() {
        let mut y = [1.0f64, 5.0, 3.0];
        CombineMode::Add.fuse_slice(&mut y, &[1.0, 1.0, 1.0]);
        assert_eq!(y, [2.0, 6.0, 4.0]);
        CombineMode::Max.fuse_slice(&mut y, &[3.0, 0.0, 4.5]);
        assert_eq!(y, [3.0, 6.0, 4.5]);
        CombineMode::Insert.fuse_slice(&mut y, &[0.0, 0.0, 0.0]);
        assert_eq!(y, [0.0; 3]);
    }

    #[test]
    fn max_needs_order() {
        assert!(CombineMode::Max.check::<f64>().is_ok());
        assert!(matches!(
            CombineMode::Max.check::<Complex64>(),
            Err(ScatterError::UnsupportedOperation(_))
        ));
        assert!(CombineMode::Add.check::<Complex64>().is_ok());
    }
}
