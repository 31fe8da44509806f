//! Diagnostics: a serializable summary of a plan and a plain-text writer.

use std::io::Write;

use serde::Serialize;

use crate::scatter::ScatterKind;
use crate::scatter::classify::Specialization;
use crate::scatter::peer_set::PeerSet;
use crate::scatter::seq::SeqPair;

/// Logical index mapping of one plan on one rank.
#[derive(Clone, Debug, Serialize)]
pub struct ScatterSummary {
    pub specialization: Specialization,
    pub rank: usize,
    pub nranks: usize,
    /// Recorded `(from, to)` local lengths; `None` after a remap.
    pub lens: Option<(usize, usize)>,
    pub in_use: bool,
    pub merged: bool,
    pub detail: KindSummary,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KindSummary {
    Local {
        pair: SeqPair,
    },
    Peer {
        bs: usize,
        sends: Vec<PeerSummary>,
        receives: Vec<PeerSummary>,
        local_from: Vec<usize>,
        local_to: Vec<usize>,
        local_runs: usize,
    },
    Collective {
        counts: Vec<usize>,
        displs: Vec<usize>,
        root: usize,
    },
    Destroyed,
}

/// Slots exchanged with one peer.
#[derive(Clone, Debug, Serialize)]
pub struct PeerSummary {
    pub rank: usize,
    pub slots: Vec<usize>,
}

fn peers(set: &PeerSet) -> Vec<PeerSummary> {
    set.peers
        .iter()
        .enumerate()
        .map(|(i, &rank)| PeerSummary {
            rank,
            slots: set.slots_of(i).to_vec(),
        })
        .collect()
}

impl KindSummary {
    pub(crate) fn of(kind: &ScatterKind) -> Self {
        match kind {
            ScatterKind::Seq(pair) => KindSummary::Local { pair: pair.clone() },
            ScatterKind::Peer(plan) => KindSummary::Peer {
                bs: plan.block_size(),
                sends: peers(&plan.from),
                receives: peers(&plan.to),
                local_from: plan.local.from.clone(),
                local_to: plan.local.to.clone(),
                local_runs: plan.local.runs.len(),
            },
            ScatterKind::ToAll(c) | ScatterKind::ToOne(c) => KindSummary::Collective {
                counts: c.counts.clone(),
                displs: c.displs.clone(),
                root: c.root,
            },
            ScatterKind::Destroyed => KindSummary::Destroyed,
        }
    }
}

impl ScatterSummary {
    /// Human-readable dump, one `[rank r]`-prefixed line per fact.
    pub fn write_text<W: Write>(&self, sink: &mut W) -> std::io::Result<()> {
        let r = self.rank;
        let lens = match self.lens {
            Some((f, t)) => format!("{f} -> {t}"),
            None => "unknown".to_string(),
        };
        writeln!(
            sink,
            "[rank {r}] scatter plan: {}, local lengths {lens}, {}{}",
            self.specialization,
            if self.in_use { "in use" } else { "idle" },
            if self.merged { ", merged" } else { "" },
        )?;
        match &self.detail {
            KindSummary::Local { pair } => {
                writeln!(sink, "[rank {r}] {} local entries", pair.n)?;
                for k in 0..pair.n {
                    writeln!(sink, "[rank {r}]   {} -> {}", pair.from.at(k), pair.to.at(k))?;
                }
            }
            KindSummary::Peer {
                bs,
                sends,
                receives,
                local_from,
                local_to,
                local_runs,
            } => {
                writeln!(sink, "[rank {r}] block size {bs}")?;
                writeln!(sink, "[rank {r}] sends to {} peers", sends.len())?;
                for p in sends {
                    writeln!(sink, "[rank {r}]   rank {}: {:?}", p.rank, p.slots)?;
                }
                writeln!(sink, "[rank {r}] receives from {} peers", receives.len())?;
                for p in receives {
                    writeln!(sink, "[rank {r}]   rank {}: {:?}", p.rank, p.slots)?;
                }
                writeln!(
                    sink,
                    "[rank {r}] {} local blocks in {local_runs} runs",
                    local_from.len()
                )?;
                for (f, t) in local_from.iter().zip(local_to) {
                    writeln!(sink, "[rank {r}]   {f} -> {t}")?;
                }
            }
            KindSummary::Collective { counts, displs, root } => {
                writeln!(sink, "[rank {r}] root {root}, counts {counts:?}, displacements {displs:?}")?;
            }
            KindSummary::Destroyed => writeln!(sink, "[rank {r}] destroyed")?,
        }
        Ok(())
    }
}
