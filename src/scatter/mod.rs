//! Scatter plans: reusable, structurally specialized data movement between
//! two array layouts.
//!
//! A [`VecScatter`] is built once from a source layout + index set and a
//! destination layout + index set, then driven any number of times with
//! [`begin`](VecScatter::begin) / [`end`](VecScatter::end) on arrays that
//! share those layouts. Arrays are always passed as the calling rank's
//! local part (the whole array for a sequential layout).
//!
//! Plans on distributed layouts are *collective*: every rank of the group
//! must create, copy, begin and end them in the same order.

pub mod classify;
pub mod collective;
pub mod combine;
pub mod options;
pub mod peer_set;
pub mod seq;
pub mod view;

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::algs::communicator::{CommTag, Communicator};
use crate::data::index_set::IndexSet;
use crate::data::layout::ArrayLayout;
use crate::data::scalar::Scalar;
use crate::debug_invariants::DebugInvariants;
use crate::scatter_error::ScatterError;

use self::classify::{Choice, Specialization, classify, whole_array};
use self::collective::CollectivePlan;
use self::combine::{CombineMode, Direction};
use self::options::ScatterOptions;
use self::peer_set::{BUILD_TAGS, PeerPending, PeerPlan, build_peer_plan};
use self::seq::SeqPair;
use self::view::{KindSummary, ScatterSummary};

/// Tags reserved per communicating plan: the build exchanges plus one for
/// execution.
pub const PLAN_TAGS: u16 = BUILD_TAGS + 1;

/// One variant per plan shape; see [`Specialization`] for the labels.
#[derive(Clone, Debug)]
pub(crate) enum ScatterKind {
    Seq(SeqPair),
    Peer(PeerPlan),
    ToAll(CollectivePlan),
    ToOne(CollectivePlan),
    Destroyed,
}

enum ScatterState<C: Communicator> {
    Idle,
    Active {
        mode: CombineMode,
        dir: Direction,
        pending: Option<PeerPending<C>>,
    },
}

/// A reusable scatter plan over elements of type `T`.
pub struct VecScatter<T: Scalar, C: Communicator> {
    kind: ScatterKind,
    label: Specialization,
    state: ScatterState<C>,
    /// Local `(from, to)` lengths fixed at creation; `None` after a remap.
    lens: Option<(usize, usize)>,
    comm: C,
    tag: CommTag,
    options: ScatterOptions,
    pack: Vec<T>,
    work: Vec<T>,
}

impl<T: Scalar, C: Communicator + Clone> VecScatter<T, C> {
    /// Build a plan with the process-default options.
    ///
    /// A missing index set stands for the whole array: `0..len` for a
    /// sequential array or a distributed one paired with a sequential one,
    /// the owned range when both arrays are distributed.
    pub fn new(
        comm: &C,
        from: &ArrayLayout,
        ix: Option<&IndexSet>,
        to: &ArrayLayout,
        iy: Option<&IndexSet>,
    ) -> Result<Self, ScatterError> {
        Self::with_options(comm, from, ix, to, iy, ScatterOptions::process_default().clone())
    }

    pub fn with_options(
        comm: &C,
        from: &ArrayLayout,
        ix: Option<&IndexSet>,
        to: &ArrayLayout,
        iy: Option<&IndexSet>,
        options: ScatterOptions,
    ) -> Result<Self, ScatterError> {
        let ix = ix.cloned().unwrap_or_else(|| whole_array(from, to));
        let iy = iy.cloned().unwrap_or_else(|| whole_array(to, from));
        let (label, choice) = classify(comm, from, &ix, to, &iy)?;

        let mut tag = CommTag::default();
        let kind = match choice {
            Choice::Local(pair) => ScatterKind::Seq(pair),
            Choice::ToAll => {
                tag = comm.reserve_tag_range(PLAN_TAGS);
                ScatterKind::ToAll(CollectivePlan::new(from))
            }
            Choice::ToOne => {
                tag = comm.reserve_tag_range(PLAN_TAGS);
                ScatterKind::ToOne(CollectivePlan::new(from))
            }
            Choice::Peer { entries, bs } => {
                tag = comm.reserve_tag_range(PLAN_TAGS);
                ScatterKind::Peer(build_peer_plan(comm, tag, from, to, &entries, bs)?)
            }
        };
        log::info!("[rank {}] scatter plan: {label}", comm.rank());

        let plan = VecScatter {
            kind,
            label,
            state: ScatterState::Idle,
            lens: Some((from.local_len(), to.local_len())),
            comm: comm.clone(),
            tag,
            options,
            pack: Vec::new(),
            work: Vec::new(),
        };
        if let ScatterKind::Seq(pair) = &plan.kind {
            if log::log_enabled!(log::Level::Warn) && pair.has_repeated_destination() {
                log::warn!(
                    "[rank {}] scatter destination repeats a slot; Insert keeps the last value",
                    comm.rank()
                );
            }
        }
        if plan.options.check_indices {
            plan.validate_invariants()?;
        }
        if plan.options.view_on_create && log::log_enabled!(log::Level::Debug) {
            let mut text = Vec::new();
            plan.view(&mut text)?;
            log::debug!("{}", String::from_utf8_lossy(&text));
        }
        Ok(plan)
    }

    /// Deep copy with fresh scratch buffers, in the Idle state. Collective
    /// for plans that communicate (a new tag range is reserved).
    pub fn copy(&self) -> Result<Self, ScatterError> {
        self.ensure_live()?;
        let tag = if self.label.is_local() {
            CommTag::default()
        } else {
            self.comm.reserve_tag_range(PLAN_TAGS)
        };
        Ok(VecScatter {
            kind: self.kind.clone(),
            label: self.label,
            state: ScatterState::Idle,
            lens: self.lens,
            comm: self.comm.clone(),
            tag,
            options: self.options.clone(),
            pack: Vec::new(),
            work: Vec::new(),
        })
    }
}

impl<T: Scalar, C: Communicator> VecScatter<T, C> {
    pub fn specialization(&self) -> Specialization {
        self.label
    }

    pub fn options(&self) -> &ScatterOptions {
        &self.options
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Local `(from, to)` lengths checked by `begin`; `None` after a remap.
    pub fn recorded_lens(&self) -> Option<(usize, usize)> {
        self.lens
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self.state, ScatterState::Active { .. })
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self.kind, ScatterKind::Destroyed)
    }

    fn exec_tag(&self) -> CommTag {
        self.tag.offset(BUILD_TAGS)
    }

    fn ensure_live(&self) -> Result<(), ScatterError> {
        if self.is_destroyed() {
            return Err(ScatterError::WrongState("plan has been destroyed"));
        }
        Ok(())
    }

    fn check_lens(&self, x_len: usize, y_len: usize, dir: Direction) -> Result<(), ScatterError> {
        if let Some((from_n, to_n)) = self.lens {
            let (want_x, want_y) = if dir.is_reverse() { (to_n, from_n) } else { (from_n, to_n) };
            if x_len != want_x {
                return Err(ScatterError::size("scatter source length", want_x, x_len));
            }
            if y_len != want_y {
                return Err(ScatterError::size("scatter destination length", want_y, y_len));
            }
        }
        let (min_x, min_y) = match &self.kind {
            ScatterKind::Seq(pair) => pair.min_lens(dir),
            ScatterKind::Peer(plan) => plan.min_lens(dir),
            ScatterKind::ToAll(c) => c.min_lens(true, dir),
            ScatterKind::ToOne(c) => c.min_lens(false, dir),
            ScatterKind::Destroyed => (0, 0),
        };
        if x_len < min_x {
            return Err(ScatterError::size("scatter source length", min_x, x_len));
        }
        if y_len < min_y {
            return Err(ScatterError::size("scatter destination length", min_y, y_len));
        }
        Ok(())
    }

    /// Start moving `x` into `y`.
    ///
    /// Local and collective plans finish here; peer plans post their
    /// messages, run the self-copy region and return. Every check that can
    /// fail locally runs before any write to `y`.
    pub fn begin(
        &mut self,
        x: &[T],
        y: &mut [T],
        mode: CombineMode,
        dir: Direction,
    ) -> Result<(), ScatterError> {
        self.ensure_live()?;
        if self.is_in_use() {
            return Err(ScatterError::WrongState(
                "begin called on a plan that is already in use",
            ));
        }
        mode.check::<T>()?;
        self.check_lens(x.len(), y.len(), dir)?;

        let pending = match &self.kind {
            ScatterKind::Seq(pair) => {
                pair.run(x, y, mode, dir);
                None
            }
            ScatterKind::Peer(plan) => Some(plan.begin(
                &self.comm,
                self.tag.offset(BUILD_TAGS),
                x,
                y,
                mode,
                dir,
                &mut self.pack,
            )?),
            ScatterKind::ToAll(c) => {
                if dir.is_reverse() {
                    c.to_all_reverse(&self.comm, x, y, mode, &mut self.work)?;
                } else {
                    c.to_all_forward(&self.comm, x, y, mode)?;
                }
                None
            }
            ScatterKind::ToOne(c) => {
                if dir.is_reverse() {
                    c.to_one_reverse(&self.comm, self.exec_tag(), x, y, mode)?;
                } else {
                    c.to_one_forward(&self.comm, x, y, mode)?;
                }
                None
            }
            ScatterKind::Destroyed => None,
        };
        self.state = ScatterState::Active { mode, dir, pending };
        if self.options.merged {
            self.finish(x.len(), y, mode, dir)?;
        }
        Ok(())
    }

    /// Complete the matching `begin`: wait for incoming contributions and
    /// fuse them into `y`.
    ///
    /// `mode` and `dir` must match `begin`; otherwise the messages are
    /// drained and `WrongState` is returned. On a merged plan `end` is a
    /// no-op.
    pub fn end(
        &mut self,
        x: &[T],
        y: &mut [T],
        mode: CombineMode,
        dir: Direction,
    ) -> Result<(), ScatterError> {
        self.ensure_live()?;
        if !self.is_in_use() {
            if self.options.merged {
                return Ok(());
            }
            return Err(ScatterError::WrongState("end called without a matching begin"));
        }
        self.finish(x.len(), y, mode, dir)
    }

    fn finish(
        &mut self,
        x_len: usize,
        y: &mut [T],
        mode: CombineMode,
        dir: Direction,
    ) -> Result<(), ScatterError> {
        let ScatterState::Active {
            mode: begun_mode,
            dir: begun_dir,
            pending,
        } = std::mem::replace(&mut self.state, ScatterState::Idle)
        else {
            return Ok(());
        };
        self.debug_assert_invariants();
        let mismatch = begun_mode != mode || begun_dir != dir;
        let size_err = self.check_lens(x_len, y.len(), dir).err();
        let result = match (pending, &self.kind) {
            (Some(p), ScatterKind::Peer(plan)) if !mismatch && size_err.is_none() => {
                plan.end(p, y, mode, dir)
            }
            (Some(p), _) => {
                p.drain();
                Ok(())
            }
            (None, _) => Ok(()),
        };
        if mismatch {
            return Err(ScatterError::WrongState(
                "end must use the combine mode and direction of begin",
            ));
        }
        if let Some(err) = size_err {
            return Err(err);
        }
        result
    }

    /// Renumber the indices the plan reads from through `to_map`
    /// (`to_map[old] = new`).
    ///
    /// Remapping the other side (`from_map`) is not supported, nor is
    /// remapping a collective plan. Afterwards the recorded lengths are
    /// unknown and `begin` only checks that every slot is in range.
    pub fn remap(
        &mut self,
        to_map: Option<&[usize]>,
        from_map: Option<&[usize]>,
    ) -> Result<(), ScatterError> {
        self.ensure_live()?;
        if self.is_in_use() {
            return Err(ScatterError::WrongState("cannot remap a plan that is in use"));
        }
        if from_map.is_some() {
            return Err(ScatterError::UnsupportedOperation(
                "remapping the from side of a scatter is not supported",
            ));
        }
        let Some(map) = to_map else {
            return Ok(());
        };
        match &mut self.kind {
            ScatterKind::Seq(pair) => pair.remap_source(map)?,
            ScatterKind::Peer(plan) => plan.remap_source(map)?,
            ScatterKind::ToAll(_) | ScatterKind::ToOne(_) => {
                return Err(ScatterError::UnsupportedOperation(
                    "collective scatter plans cannot be remapped",
                ));
            }
            ScatterKind::Destroyed => {}
        }
        self.lens = None;
        if self.options.check_indices {
            self.validate_invariants()?;
        }
        log::debug!(
            "[rank {}] remapped {} plan over {} slots",
            self.comm.rank(),
            self.label,
            map.len()
        );
        Ok(())
    }

    /// Release the index tables and scratch buffers. Fails while in use;
    /// any later operation on the plan is `WrongState`.
    pub fn destroy(&mut self) -> Result<(), ScatterError> {
        self.ensure_live()?;
        if self.is_in_use() {
            return Err(ScatterError::WrongState("cannot destroy a plan that is in use"));
        }
        self.kind = ScatterKind::Destroyed;
        self.pack = Vec::new();
        self.work = Vec::new();
        Ok(())
    }

    pub fn summary(&self) -> ScatterSummary {
        ScatterSummary {
            specialization: self.label,
            rank: self.comm.rank(),
            nranks: self.comm.size(),
            lens: self.lens,
            in_use: self.is_in_use(),
            merged: self.options.merged,
            detail: KindSummary::of(&self.kind),
        }
    }

    /// Write a text rendering of the plan's index mapping to `sink`.
    pub fn view<W: std::io::Write>(&self, sink: &mut W) -> Result<(), ScatterError> {
        self.summary().write_text(sink)?;
        Ok(())
    }

    pub fn view_json(&self) -> Result<String, ScatterError> {
        Ok(serde_json::to_string_pretty(&self.summary())?)
    }
}

impl<T: Scalar, C: Communicator> fmt::Debug for VecScatter<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VecScatter")
            .field("specialization", &self.label)
            .field("in_use", &self.is_in_use())
            .field("lens", &self.lens)
            .field("tag", &self.tag)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<T: Scalar, C: Communicator> DebugInvariants for VecScatter<T, C> {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "VecScatter");
    }

    fn validate_invariants(&self) -> Result<(), ScatterError> {
        match &self.kind {
            ScatterKind::Seq(pair) => {
                for side in [&pair.from, &pair.to] {
                    if let seq::SeqSide::General(v) = side {
                        if v.len() < pair.n {
                            return Err(ScatterError::size("local plan table", pair.n, v.len()));
                        }
                    }
                }
                Ok(())
            }
            ScatterKind::Peer(plan) => plan.validate_invariants(),
            ScatterKind::ToAll(c) | ScatterKind::ToOne(c) => {
                if c.counts.len() != c.displs.len() || c.rank >= c.counts.len() {
                    return Err(ScatterError::InvalidLayout(
                        "collective counts and displacements disagree".into(),
                    ));
                }
                Ok(())
            }
            ScatterKind::Destroyed => Ok(()),
        }
    }
}

/// Shared, reference-counted handle to a plan.
pub struct ScatterRef<T: Scalar, C: Communicator> {
    inner: Arc<Mutex<VecScatter<T, C>>>,
}

impl<T: Scalar, C: Communicator> ScatterRef<T, C> {
    pub fn new(plan: VecScatter<T, C>) -> Self {
        ScatterRef {
            inner: Arc::new(Mutex::new(plan)),
        }
    }

    /// Another handle to the same plan.
    pub fn clone_ref(&self) -> Self {
        ScatterRef {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, VecScatter<T, C>> {
        self.inner.lock()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Drop this handle. The last handle destroys the plan, which fails with
    /// `WrongState` if it is in use.
    pub fn destroy(self) -> Result<(), ScatterError> {
        if Arc::strong_count(&self.inner) > 1 {
            return Ok(());
        }
        self.inner.lock().destroy()
    }
}

impl<T: Scalar, C: Communicator> fmt::Debug for ScatterRef<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScatterRef")
            .field("refs", &self.ref_count())
            .finish()
    }
}
