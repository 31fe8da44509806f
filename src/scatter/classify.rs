//! Pattern classifier: picks the cheapest plan shape a pair of index sets
//! allows.
//!
//! Local checks (lengths, bounds) run first and never communicate. Every
//! fast-path test on distributed arrays is then confirmed with a group-wide
//! logical AND; all ranks make the same reductions in the same order, so a
//! single dissenting rank sends the whole group to the general builder.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::algs::communicator::Communicator;
use crate::data::index_set::IndexSet;
use crate::data::layout::ArrayLayout;
use crate::scatter::seq::{SeqPair, SeqSide};
use crate::scatter_error::ScatterError;

/// The catalogue of plan shapes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Specialization {
    Identity,
    SeqGeneralToGeneral,
    SeqStrideToStride,
    SeqGeneralToStride,
    SeqStrideToGeneral,
    /// Distributed side collapsed to a strided copy within the owned range.
    LocalExtraction,
    /// Every rank receives the whole distributed array.
    ToAll,
    /// Rank 0 receives the whole distributed array.
    ToOne,
    Blocked { bs: usize },
    General,
}

impl Specialization {
    /// Runs without any messages.
    pub fn is_local(self) -> bool {
        matches!(
            self,
            Specialization::Identity
                | Specialization::SeqGeneralToGeneral
                | Specialization::SeqStrideToStride
                | Specialization::SeqGeneralToStride
                | Specialization::SeqStrideToGeneral
                | Specialization::LocalExtraction
        )
    }
}

impl fmt::Display for Specialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Specialization::Identity => f.write_str("identity"),
            Specialization::SeqGeneralToGeneral => f.write_str("sequential general to general"),
            Specialization::SeqStrideToStride => f.write_str("sequential stride to stride"),
            Specialization::SeqGeneralToStride => f.write_str("sequential general to stride"),
            Specialization::SeqStrideToGeneral => f.write_str("sequential stride to general"),
            Specialization::LocalExtraction => f.write_str("local extraction"),
            Specialization::ToAll => f.write_str("to all"),
            Specialization::ToOne => f.write_str("to one"),
            Specialization::Blocked { bs } => write!(f, "blocked (bs={bs})"),
            Specialization::General => f.write_str("general"),
        }
    }
}

/// What the plan builder has to construct.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Choice {
    Local(SeqPair),
    ToAll,
    ToOne,
    /// Block-start pairs in each array's own index space.
    Peer { entries: Vec<(usize, usize)>, bs: usize },
}

/// The index set meaning "the entire array" for `layout` paired with `other`.
pub fn whole_array(layout: &ArrayLayout, other: &ArrayLayout) -> IndexSet {
    if layout.is_distributed() && other.is_distributed() {
        let r = layout.ownership_range();
        IndexSet::range(r.start, r.len())
    } else {
        IndexSet::range(0, layout.len())
    }
}

/// Checks that need no communication: layouts match the group, lengths
/// agree and every index lies inside its array.
pub fn check_local<C: Communicator>(
    comm: &C,
    from: &ArrayLayout,
    ix: &IndexSet,
    to: &ArrayLayout,
    iy: &IndexSet,
) -> Result<(), ScatterError> {
    for layout in [from, to] {
        if layout.is_distributed() && layout.nranks() != comm.size() {
            return Err(ScatterError::InvalidLayout(format!(
                "layout spans {} ranks but the communicator has {}",
                layout.nranks(),
                comm.size()
            )));
        }
    }
    if ix.len() != iy.len() {
        return Err(ScatterError::size("index set lengths", ix.len(), iy.len()));
    }
    ix.check_bounds(from.len())?;
    iy.check_bounds(to.len())?;
    Ok(())
}

/// Group-wide agreement on a fast-path predicate.
pub fn agree<C: Communicator>(comm: &C, what: &str, local: bool) -> bool {
    let global = comm.allreduce_and(local);
    if local && !global {
        log::debug!("[rank {}] {what} rejected by another rank", comm.rank());
    }
    global
}

/// Group-wide agreement on a block size; `None` if any rank has no
/// candidate or the candidates differ.
fn agree_block<C: Communicator>(comm: &C, candidate: Option<usize>) -> Option<usize> {
    let mut root = (candidate.unwrap_or(0) as u64).to_le_bytes().to_vec();
    comm.broadcast(0, &mut root);
    let mut b = [0u8; 8];
    if root.len() == 8 {
        b.copy_from_slice(&root);
    }
    let root_bs = u64::from_le_bytes(b) as usize;
    let ok = candidate.is_some_and(|bs| bs == root_bs);
    agree(comm, "block-aligned plan", ok).then_some(root_bs)
}

/// Classify the pair. Collective whenever either array is distributed.
pub fn classify<C: Communicator>(
    comm: &C,
    from: &ArrayLayout,
    ix: &IndexSet,
    to: &ArrayLayout,
    iy: &IndexSet,
) -> Result<(Specialization, Choice), ScatterError> {
    check_local(comm, from, ix, to, iy)?;
    Ok(match (from.is_distributed(), to.is_distributed()) {
        (false, false) => classify_seq(ix, iy),
        (true, false) => classify_dist_to_seq(comm, from, ix, iy),
        (false, true) => classify_seq_to_dist(comm, ix, to, iy),
        (true, true) => (Specialization::General, general_entries(ix, iy)),
    })
}

fn classify_seq(ix: &IndexSet, iy: &IndexSet) -> (Specialization, Choice) {
    let n = ix.len();
    if ix.is_identity() && iy.is_identity() {
        return (Specialization::Identity, Choice::Local(SeqPair::identity(n)));
    }
    let label = match (ix.as_stride().is_some(), iy.as_stride().is_some()) {
        (true, true) => Specialization::SeqStrideToStride,
        (false, true) => Specialization::SeqGeneralToStride,
        (true, false) => Specialization::SeqStrideToGeneral,
        (false, false) => Specialization::SeqGeneralToGeneral,
    };
    let pair = SeqPair::new(n, SeqSide::from_index_set(ix), SeqSide::from_index_set(iy));
    (label, Choice::Local(pair))
}

/// `is` is a stride lying entirely inside `range` (empty sets qualify).
fn stride_within(is: &IndexSet, range: &std::ops::Range<usize>) -> bool {
    match (is.as_stride(), is.min_max()) {
        (Some(_), None) => true,
        (Some(_), Some((lo, hi))) => lo >= range.start && hi < range.end,
        _ => false,
    }
}

fn is_full_range(is: &IndexSet, n: usize) -> bool {
    matches!(is.as_stride(), Some((0, 1, len)) if len == n)
}

fn classify_dist_to_seq<C: Communicator>(
    comm: &C,
    from: &ArrayLayout,
    ix: &IndexSet,
    iy: &IndexSet,
) -> (Specialization, Choice) {
    let owned = from.ownership_range();
    let n = from.len();

    let local = stride_within(ix, &owned) && iy.as_stride().is_some();
    if agree(comm, "local extraction", local) {
        let (first, step, len) = ix.as_stride().unwrap_or((owned.start, 1, 0));
        let pair = SeqPair::new(
            len,
            SeqSide::shifted_stride(first, step, owned.start),
            SeqSide::from_index_set(iy),
        );
        return (Specialization::LocalExtraction, Choice::Local(pair));
    }

    let full = is_full_range(ix, n) && is_full_range(iy, n);
    if agree(comm, "to-all plan", full) {
        return (Specialization::ToAll, Choice::ToAll);
    }

    let to_one = if comm.rank() == 0 { full } else { ix.is_empty() };
    if agree(comm, "to-one plan", to_one) {
        return (Specialization::ToOne, Choice::ToOne);
    }

    let candidate = block_candidate(ix, iy).filter(|&bs| from.is_block_aligned(bs));
    if let Some(bs) = agree_block(comm, candidate) {
        return (Specialization::Blocked { bs }, block_entries(ix, iy, bs));
    }
    (Specialization::General, general_entries(ix, iy))
}

fn classify_seq_to_dist<C: Communicator>(
    comm: &C,
    ix: &IndexSet,
    to: &ArrayLayout,
    iy: &IndexSet,
) -> (Specialization, Choice) {
    let owned = to.ownership_range();

    let local = stride_within(iy, &owned) && ix.as_stride().is_some();
    if agree(comm, "local extraction", local) {
        let (first, step, len) = iy.as_stride().unwrap_or((owned.start, 1, 0));
        let pair = SeqPair::new(
            len,
            SeqSide::from_index_set(ix),
            SeqSide::shifted_stride(first, step, owned.start),
        );
        return (Specialization::LocalExtraction, Choice::Local(pair));
    }

    let candidate = block_candidate(iy, ix).filter(|&bs| to.is_block_aligned(bs));
    if let Some(bs) = agree_block(comm, candidate) {
        return (Specialization::Blocked { bs }, block_entries(ix, iy, bs));
    }
    (Specialization::General, general_entries(ix, iy))
}

/// Block size usable for a block plan: `dist` is a block set of size at
/// least 2 and `other` is a block set of the same size or a unit stride
/// starting and ending on block boundaries.
fn block_candidate(dist: &IndexSet, other: &IndexSet) -> Option<usize> {
    let IndexSet::Block { bs, .. } = dist else {
        return None;
    };
    let bs = *bs;
    if bs < 2 {
        return None;
    }
    let aligned = match other {
        IndexSet::Block { bs: other_bs, .. } => *other_bs == bs,
        IndexSet::Stride { first, step: 1, len } => first % bs == 0 && len % bs == 0,
        _ => false,
    };
    aligned.then_some(bs)
}

fn block_starts(is: &IndexSet, bs: usize) -> Vec<usize> {
    match is {
        IndexSet::Block { bs: b, blocks } if *b == bs => blocks.iter().map(|k| k * bs).collect(),
        _ => (0..is.len() / bs).filter_map(|k| is.get(k * bs)).collect(),
    }
}

fn block_entries(ix: &IndexSet, iy: &IndexSet, bs: usize) -> Choice {
    let entries = block_starts(ix, bs)
        .into_iter()
        .zip(block_starts(iy, bs))
        .collect();
    Choice::Peer { entries, bs }
}

fn general_entries(ix: &IndexSet, iy: &IndexSet) -> Choice {
    Choice::Peer {
        entries: ix.iter().zip(iy.iter()).collect(),
        bs: 1,
    }
}
