//! Distributed peer plans: per-peer slot lists plus a self-copy region.
//!
//! A [`PeerPlan`] is built collectively by [`build_peer_plan`]. Forward
//! execution packs `x[from.slots]` per peer, sends it, and lands incoming
//! values at `y[to.slots]`; entries owned on both ends by the caller go
//! through the [`LocalCopy`] region without messaging. Reverse execution
//! swaps the roles of the two peer sets explicitly.
//!
//! All slots are *block starts* in local element offsets; every entry moves
//! `bs` consecutive elements.

use itertools::Itertools;
use serde::Serialize;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::exchange::{EXCHANGE_TAGS, exchange_records};
use crate::algs::wire::{WireEntry, WireIndex, cast_slice, decode_records};
use crate::data::layout::ArrayLayout;
use crate::data::scalar::Scalar;
use crate::debug_invariants::DebugInvariants;
use crate::scatter::combine::{CombineMode, Direction};
use crate::scatter_error::ScatterError;

/// Tags consumed while building a plan.
pub const BUILD_TAGS: u16 = 2 * EXCHANGE_TAGS;

#[cfg(feature = "rayon")]
const PAR_PACK_MIN: usize = 1 << 14;

/// Ordered slot lists, one per peer, in CSR form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PeerSet {
    /// Peer ranks, strictly increasing.
    pub peers: Vec<usize>,
    /// `slots[starts[i]..starts[i+1]]` belong to `peers[i]`.
    pub starts: Vec<usize>,
    pub slots: Vec<usize>,
    pub bs: usize,
}

impl Default for PeerSet {
    fn default() -> Self {
        PeerSet {
            peers: Vec::new(),
            starts: vec![0],
            slots: Vec::new(),
            bs: 1,
        }
    }
}

impl PeerSet {
    /// Collect the non-empty lists of a per-rank table.
    pub fn from_lists(lists: Vec<Vec<usize>>, bs: usize) -> Self {
        let mut set = PeerSet {
            peers: Vec::new(),
            starts: vec![0],
            slots: Vec::with_capacity(lists.iter().map(Vec::len).sum()),
            bs,
        };
        for (peer, list) in lists.into_iter().enumerate() {
            if list.is_empty() {
                continue;
            }
            set.peers.push(peer);
            set.slots.extend(list);
            set.starts.push(set.slots.len());
        }
        set
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn slots_of(&self, i: usize) -> &[usize] {
        &self.slots[self.starts[i]..self.starts[i + 1]]
    }

    /// Elements exchanged with `peers[i]`.
    pub fn elements_of(&self, i: usize) -> usize {
        (self.starts[i + 1] - self.starts[i]) * self.bs
    }

    fn extent(&self) -> usize {
        self.slots.iter().max().map_or(0, |m| m + self.bs)
    }
}

/// A contiguous stretch of the self-copy region.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Run {
    pub from: usize,
    pub to: usize,
    pub len: usize,
}

/// Entries owned by the caller on both ends.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LocalCopy {
    pub from: Vec<usize>,
    pub to: Vec<usize>,
    pub bs: usize,
    /// Maximal contiguous stretches of `(from, to)`, in entry order.
    pub runs: Vec<Run>,
}

impl LocalCopy {
    pub fn new(from: Vec<usize>, to: Vec<usize>, bs: usize) -> Self {
        let mut lc = LocalCopy {
            from,
            to,
            bs,
            runs: Vec::new(),
        };
        lc.detect_runs();
        lc
    }

    pub fn len(&self) -> usize {
        self.from.len()
    }

    pub fn is_empty(&self) -> bool {
        self.from.is_empty()
    }

    /// Merge consecutive entries that advance by `bs` on both sides.
    pub fn detect_runs(&mut self) {
        let bs = self.bs;
        self.runs = self
            .from
            .iter()
            .zip(&self.to)
            .map(|(&from, &to)| Run { from, to, len: bs })
            .coalesce(|a, b| {
                if a.from + a.len == b.from && a.to + a.len == b.to {
                    Ok(Run {
                        len: a.len + b.len,
                        ..a
                    })
                } else {
                    Err((a, b))
                }
            })
            .collect();
    }

    fn run<T: Scalar>(&self, x: &[T], y: &mut [T], mode: CombineMode, dir: Direction) {
        for r in &self.runs {
            let (s, d) = if dir.is_reverse() { (r.to, r.from) } else { (r.from, r.to) };
            mode.fuse_slice(&mut y[d..d + r.len], &x[s..s + r.len]);
        }
    }
}

/// Send side, receive side and self-copy region of a distributed plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PeerPlan {
    /// Slots in the source array, grouped by the peer they are sent to.
    pub from: PeerSet,
    /// Slots in the destination array, grouped by the peer they come from.
    pub to: PeerSet,
    pub local: LocalCopy,
    from_extent: usize,
    to_extent: usize,
}

/// Messages posted by [`PeerPlan::begin`], consumed by [`PeerPlan::end`].
pub struct PeerPending<C: Communicator> {
    recvs: Vec<(usize, C::RecvHandle)>,
    sends: Vec<C::SendHandle>,
}

impl<C: Communicator> PeerPending<C> {
    /// Complete every posted message and discard what arrived.
    pub fn drain(self) {
        for (_, h) in self.recvs {
            let _ = h.wait();
        }
        for send in self.sends {
            let _ = send.wait();
        }
    }
}

impl PeerPlan {
    pub fn new(from: PeerSet, to: PeerSet, local: LocalCopy) -> Self {
        let mut plan = PeerPlan {
            from,
            to,
            local,
            from_extent: 0,
            to_extent: 0,
        };
        plan.refresh_extents();
        plan
    }

    pub fn block_size(&self) -> usize {
        self.local.bs
    }

    fn refresh_extents(&mut self) {
        let bs = self.local.bs;
        let local_from = self.local.from.iter().max().map_or(0, |m| m + bs);
        let local_to = self.local.to.iter().max().map_or(0, |m| m + bs);
        self.from_extent = self.from.extent().max(local_from);
        self.to_extent = self.to.extent().max(local_to);
    }

    /// Minimum local lengths of the (source, destination) arrays of a call.
    pub fn min_lens(&self, dir: Direction) -> (usize, usize) {
        if dir.is_reverse() {
            (self.to_extent, self.from_extent)
        } else {
            (self.from_extent, self.to_extent)
        }
    }

    /// Post receives, pack and post sends, then run the self-copy region.
    #[allow(clippy::too_many_arguments)]
    pub fn begin<T: Scalar, C: Communicator>(
        &self,
        comm: &C,
        tag: CommTag,
        x: &[T],
        y: &mut [T],
        mode: CombineMode,
        dir: Direction,
        pack: &mut Vec<T>,
    ) -> Result<PeerPending<C>, ScatterError> {
        let (send, recv) = if dir.is_reverse() {
            (&self.to, &self.from)
        } else {
            (&self.from, &self.to)
        };
        let widest = (0..send.num_peers())
            .map(|i| send.elements_of(i))
            .max()
            .unwrap_or(0);
        pack.clear();
        pack.try_reserve(widest)
            .map_err(|_| ScatterError::ResourceExhaustion {
                what: "send buffer",
                requested: widest,
            })?;

        let elem = std::mem::size_of::<T>();
        let mut recvs = Vec::with_capacity(recv.num_peers());
        for (i, &peer) in recv.peers.iter().enumerate() {
            let mut buf = vec![0u8; recv.elements_of(i) * elem];
            recvs.push((i, comm.irecv(peer, tag.as_u16(), &mut buf)));
        }

        let bs = send.bs;
        let mut sends = Vec::with_capacity(send.num_peers());
        for (i, &peer) in send.peers.iter().enumerate() {
            pack.clear();
            pack_slots(pack, x, send.slots_of(i), bs);
            sends.push(comm.isend(peer, tag.as_u16(), cast_slice(pack.as_slice())));
        }

        self.local.run(x, y, mode, dir);
        Ok(PeerPending { recvs, sends })
    }

    /// Wait for every receive in peer order, fuse it into `y`, drain the sends.
    pub fn end<T: Scalar, C: Communicator>(
        &self,
        pending: PeerPending<C>,
        y: &mut [T],
        mode: CombineMode,
        dir: Direction,
    ) -> Result<(), ScatterError> {
        let recv = if dir.is_reverse() { &self.from } else { &self.to };
        let bs = recv.bs;
        let elem = std::mem::size_of::<T>();
        let mut maybe_err: Option<ScatterError> = None;
        for (i, h) in pending.recvs {
            let peer = recv.peers[i];
            let expected = recv.elements_of(i) * elem;
            let vals = match h.wait() {
                Some(data) if data.len() == expected => {
                    decode_records::<T>(&data).map_err(|msg| ScatterError::comm(peer, msg))
                }
                Some(data) => Err(ScatterError::comm(
                    peer,
                    format!("expected {expected} bytes, got {}", data.len()),
                )),
                None => Err(ScatterError::comm(peer, format!("no payload from rank {peer}"))),
            };
            // keep draining after the first failure, but stop writing
            match vals {
                Ok(vals) if maybe_err.is_none() => {
                    for (k, &slot) in recv.slots_of(i).iter().enumerate() {
                        mode.fuse_slice(&mut y[slot..slot + bs], &vals[k * bs..(k + 1) * bs]);
                    }
                }
                Err(e) if maybe_err.is_none() => maybe_err = Some(e),
                _ => {}
            }
        }
        for send in pending.sends {
            let _ = send.wait();
        }
        match maybe_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Renumber the slots data is read from (send slots and self-copy
    /// sources) through `map`, then re-detect contiguous runs.
    pub fn remap_source(&mut self, map: &[usize]) -> Result<(), ScatterError> {
        let all = self.from.slots.iter().chain(&self.local.from);
        if let Some((position, &slot)) = all.enumerate().find(|(_, s)| **s >= map.len()) {
            return Err(ScatterError::IndexOutOfRange {
                index: slot as i64,
                position,
                bound: map.len(),
            });
        }
        for slot in self.from.slots.iter_mut().chain(self.local.from.iter_mut()) {
            *slot = map[*slot];
        }
        self.local.detect_runs();
        self.refresh_extents();
        Ok(())
    }

    /// Total entries sent, received and copied locally.
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.from.slots.len(), self.to.slots.len(), self.local.len())
    }
}

fn pack_slots<T: Scalar>(pack: &mut Vec<T>, x: &[T], slots: &[usize], bs: usize) {
    #[cfg(feature = "rayon")]
    if slots.len() * bs >= PAR_PACK_MIN {
        use rayon::prelude::*;
        pack.par_extend(
            slots
                .par_iter()
                .flat_map_iter(|&s| x[s..s + bs].iter().copied()),
        );
        return;
    }
    for &s in slots {
        pack.extend_from_slice(&x[s..s + bs]);
    }
}

impl DebugInvariants for PeerPlan {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "PeerPlan");
    }

    fn validate_invariants(&self) -> Result<(), ScatterError> {
        for (name, set) in [("send", &self.from), ("receive", &self.to)] {
            if set.starts.len() != set.peers.len() + 1
                || set.starts.last() != Some(&set.slots.len())
                || set.starts.windows(2).any(|w| w[0] >= w[1])
            {
                return Err(ScatterError::InvalidLayout(format!(
                    "{name} peer set offsets are malformed"
                )));
            }
            if set.peers.windows(2).any(|w| w[0] >= w[1]) {
                return Err(ScatterError::InvalidLayout(format!(
                    "{name} peers are not strictly increasing"
                )));
            }
        }
        if self.local.from.len() != self.local.to.len() {
            return Err(ScatterError::size(
                "self-copy region",
                self.local.from.len(),
                self.local.to.len(),
            ));
        }
        let covered: usize = self.local.runs.iter().map(|r| r.len).sum();
        if covered != self.local.len() * self.local.bs {
            return Err(ScatterError::size(
                "self-copy runs",
                self.local.len() * self.local.bs,
                covered,
            ));
        }
        Ok(())
    }
}

/// Build the peer plan moving element blocks `entries[k].0 -> entries[k].1`.
///
/// Collective over `comm`; consumes `BUILD_TAGS` tags from `tag`. Entries are
/// expressed in the caller's index space of each array: global for a
/// distributed array, local for a sequential one. Both are block starts.
///
/// Each entry is routed to the owner of its source element, which resolves
/// the destination owner (ownership lookup for a distributed destination,
/// the requesting rank for a sequential one) and announces the destination
/// slot to it.
pub fn build_peer_plan<C: Communicator>(
    comm: &C,
    tag: CommTag,
    from: &ArrayLayout,
    to: &ArrayLayout,
    entries: &[(usize, usize)],
    bs: usize,
) -> Result<PeerPlan, ScatterError> {
    let (me, n) = (comm.rank(), comm.size());

    // 1) route every entry to the owner of its source element
    let mut outgoing: Vec<Vec<WireEntry>> = vec![Vec::new(); n];
    for (position, &(x, y)) in entries.iter().enumerate() {
        let owner = if from.is_distributed() {
            from.owner_of(x).ok_or(ScatterError::IndexOutOfRange {
                index: x as i64,
                position,
                bound: from.len(),
            })?
        } else {
            me
        };
        outgoing[owner].push(WireEntry::new(x, y));
    }
    let incoming = if from.is_distributed() {
        exchange_records(comm, tag, &outgoing)?
    } else {
        outgoing
    };

    // 2) resolve destination owners; announce remote destination slots
    let x_start = if from.is_distributed() { from.ownership_range().start } else { 0 };
    let mut send_lists: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut notify: Vec<Vec<WireIndex>> = vec![Vec::new(); n];
    let (mut local_from, mut local_to) = (Vec::new(), Vec::new());
    for (origin, list) in incoming.iter().enumerate() {
        for (position, e) in list.iter().enumerate() {
            let x_local = e.x() - x_start;
            let (q, y_local) = if to.is_distributed() {
                let q = to.owner_of(e.y()).ok_or(ScatterError::IndexOutOfRange {
                    index: e.y() as i64,
                    position,
                    bound: to.len(),
                })?;
                (q, e.y() - to.ranges()[q])
            } else {
                (origin, e.y())
            };
            if q == me {
                local_from.push(x_local);
                local_to.push(y_local);
            } else {
                send_lists[q].push(x_local);
                notify[q].push(WireIndex::of(y_local));
            }
        }
    }
    let announced = exchange_records(comm, tag.offset(EXCHANGE_TAGS), &notify)?;
    let recv_lists: Vec<Vec<usize>> = announced
        .into_iter()
        .enumerate()
        .map(|(peer, v)| {
            if peer == me {
                Vec::new()
            } else {
                v.iter().map(WireIndex::get).collect()
            }
        })
        .collect();

    let plan = PeerPlan::new(
        PeerSet::from_lists(send_lists, bs),
        PeerSet::from_lists(recv_lists, bs),
        LocalCopy::new(local_from, local_to, bs),
    );
    let (sent, received, copied) = plan.counts();
    log::debug!(
        "[rank {me}] peer plan: {} send peers ({sent} blocks), {} receive peers ({received} blocks), {copied} local blocks, {} local runs, bs={bs}",
        plan.from.num_peers(),
        plan.to.num_peers(),
        plan.local.runs.len(),
    );
    Ok(plan)
}
