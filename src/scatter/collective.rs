//! Collective plans: every rank receives the whole distributed array
//! (to-all), or rank 0 alone does (to-one).
//!
//! Both complete inside `begin`. Forward runs gather the distributed pieces;
//! reverse runs give each rank its owned piece back, reducing over all
//! ranks first when the mode is `Add` or `Max`.

use std::ops::Range;

use serde::Serialize;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{cast_slice, decode_records};
use crate::data::layout::ArrayLayout;
use crate::data::scalar::Scalar;
use crate::scatter::combine::{CombineMode, Direction};
use crate::scatter_error::ScatterError;

/// Per-rank counts and displacements of the distributed side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CollectivePlan {
    pub counts: Vec<usize>,
    pub displs: Vec<usize>,
    pub rank: usize,
    pub root: usize,
}

impl CollectivePlan {
    pub fn new(layout: &ArrayLayout) -> Self {
        let ranges = layout.ranges();
        CollectivePlan {
            counts: ranges.windows(2).map(|w| w[1] - w[0]).collect(),
            displs: ranges[..ranges.len() - 1].to_vec(),
            rank: layout.rank(),
            root: 0,
        }
    }

    pub fn global_len(&self) -> usize {
        self.counts.iter().sum()
    }

    fn owned(&self) -> Range<usize> {
        let d = self.displs[self.rank];
        d..d + self.counts[self.rank]
    }

    fn full_len(&self, everyone: bool) -> usize {
        if everyone || self.rank == self.root {
            self.global_len()
        } else {
            0
        }
    }

    /// Minimum lengths of the (source, destination) arrays of a call.
    /// `everyone` is true for to-all plans.
    pub fn min_lens(&self, everyone: bool, dir: Direction) -> (usize, usize) {
        let (dist, full) = (self.counts[self.rank], self.full_len(everyone));
        if dir.is_reverse() { (full, dist) } else { (dist, full) }
    }

    /// Concatenate the gathered pieces, checking each against its count.
    fn concat_gathered(&self, chunks: Vec<Vec<u8>>, elem: usize) -> Result<Vec<u8>, ScatterError> {
        let mut full = Vec::new();
        full.try_reserve(self.global_len() * elem)?;
        for (r, chunk) in chunks.into_iter().enumerate() {
            let expected = self.counts.get(r).copied().unwrap_or(0) * elem;
            if chunk.len() != expected {
                return Err(ScatterError::comm(
                    r,
                    format!("gathered {} bytes, expected {expected}", chunk.len()),
                ));
            }
            full.extend_from_slice(&chunk);
        }
        Ok(full)
    }

    /// Forward to-all: gather on the root, broadcast the whole array.
    pub fn to_all_forward<T: Scalar, C: Communicator>(
        &self,
        comm: &C,
        x: &[T],
        y: &mut [T],
        mode: CombineMode,
    ) -> Result<(), ScatterError> {
        let elem = std::mem::size_of::<T>();
        let n = self.global_len();
        let mine = &x[..self.counts[self.rank]];
        let mut full = match comm.gather(self.root, cast_slice(mine)) {
            // an empty broadcast tells every rank the gather failed
            Some(chunks) => self.concat_gathered(chunks, elem).unwrap_or_default(),
            None => Vec::new(),
        };
        comm.broadcast(self.root, &mut full);
        if full.len() != n * elem {
            return Err(ScatterError::comm(
                self.root,
                format!("broadcast carried {} bytes, expected {}", full.len(), n * elem),
            ));
        }
        let vals = decode_records::<T>(&full).map_err(|m| ScatterError::comm(self.root, m))?;
        mode.fuse_slice(&mut y[..n], &vals);
        Ok(())
    }

    /// Reverse to-all: each rank takes back its owned piece. `Insert` needs no
    /// messages; `Add`/`Max` first reduce the full arrays of all ranks.
    pub fn to_all_reverse<T: Scalar, C: Communicator>(
        &self,
        comm: &C,
        x: &[T],
        y: &mut [T],
        mode: CombineMode,
        work: &mut Vec<T>,
    ) -> Result<(), ScatterError> {
        let owned = self.owned();
        let count = owned.len();
        if mode == CombineMode::Insert {
            mode.fuse_slice(&mut y[..count], &x[owned]);
            return Ok(());
        }

        let elem = std::mem::size_of::<T>();
        let n = self.global_len();
        let mut reduced = Vec::new();
        if let Some(chunks) = comm.gather(self.root, cast_slice(&x[..n])) {
            match reduce_chunks(&chunks, n, mode, work) {
                Ok(()) => reduced = cast_slice(work.as_slice()).to_vec(),
                Err(e) => log::warn!("reverse to-all reduction failed on the root: {e}"),
            }
        }
        comm.broadcast(self.root, &mut reduced);
        if reduced.len() != n * elem {
            return Err(ScatterError::comm(
                self.root,
                format!("reduction carried {} bytes, expected {}", reduced.len(), n * elem),
            ));
        }
        let vals = decode_records::<T>(&reduced).map_err(|m| ScatterError::comm(self.root, m))?;
        mode.fuse_slice(&mut y[..count], &vals[owned]);
        Ok(())
    }

    /// Forward to-one: gather the whole array on the root only.
    pub fn to_one_forward<T: Scalar, C: Communicator>(
        &self,
        comm: &C,
        x: &[T],
        y: &mut [T],
        mode: CombineMode,
    ) -> Result<(), ScatterError> {
        let mine = &x[..self.counts[self.rank]];
        if let Some(chunks) = comm.gather(self.root, cast_slice(mine)) {
            let full = self.concat_gathered(chunks, std::mem::size_of::<T>())?;
            let vals = decode_records::<T>(&full).map_err(|m| ScatterError::comm(self.root, m))?;
            mode.fuse_slice(&mut y[..vals.len()], &vals);
        }
        Ok(())
    }

    /// Reverse to-one: the root hands every rank its owned piece.
    pub fn to_one_reverse<T: Scalar, C: Communicator>(
        &self,
        comm: &C,
        tag: CommTag,
        x: &[T],
        y: &mut [T],
        mode: CombineMode,
    ) -> Result<(), ScatterError> {
        let elem = std::mem::size_of::<T>();
        if self.rank == self.root {
            let mut sends = Vec::with_capacity(self.counts.len());
            for peer in (0..self.counts.len()).filter(|&p| p != self.root) {
                let d = self.displs[peer];
                let piece = &x[d..d + self.counts[peer]];
                sends.push(comm.isend(peer, tag.as_u16(), cast_slice(piece)));
            }
            let owned = self.owned();
            mode.fuse_slice(&mut y[..owned.len()], &x[owned]);
            for send in sends {
                let _ = send.wait();
            }
            return Ok(());
        }
        let count = self.counts[self.rank];
        let mut buf = vec![0u8; count * elem];
        let data = comm
            .irecv(self.root, tag.as_u16(), &mut buf)
            .wait()
            .ok_or_else(|| ScatterError::comm(self.root, "no payload from the root"))?;
        if data.len() != count * elem {
            return Err(ScatterError::comm(
                self.root,
                format!("expected {} bytes, got {}", count * elem, data.len()),
            ));
        }
        let vals = decode_records::<T>(&data).map_err(|m| ScatterError::comm(self.root, m))?;
        mode.fuse_slice(&mut y[..count], &vals);
        Ok(())
    }
}

/// Fold every rank's full array into `work` with `mode`.
fn reduce_chunks<T: Scalar>(
    chunks: &[Vec<u8>],
    n: usize,
    mode: CombineMode,
    work: &mut Vec<T>,
) -> Result<(), ScatterError> {
    work.clear();
    work.try_reserve(n).map_err(|_| ScatterError::ResourceExhaustion {
        what: "reduction buffer",
        requested: n,
    })?;
    for (r, chunk) in chunks.iter().enumerate() {
        let vals = decode_records::<T>(chunk).map_err(|m| ScatterError::comm(r, m))?;
        if vals.len() != n {
            return Err(ScatterError::size("reduced array", n, vals.len()));
        }
        if r == 0 {
            work.extend_from_slice(&vals);
        } else {
            mode.fuse_slice(work, &vals);
        }
    }
    Ok(())
}
