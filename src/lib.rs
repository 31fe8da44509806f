#![cfg_attr(docsrs, feature(doc_cfg))]
//! # vec-scatter
//!
//! vec-scatter builds reusable scatter/gather plans that move and combine
//! array elements between two layouts, sequential or distributed over a
//! group of cooperating ranks. A plan is built once from a pair of index
//! sets and executed many times on arrays sharing those layouts.
//!
//! ## Features
//! - Structural fast paths: identity and strided copies, local extraction,
//!   to-all and to-one collectives, block-aligned peer plans
//! - Group-wide agreement on every fast path, so all ranks always pick the
//!   same plan shape
//! - Split-phase execution (`begin` / `end`) with Insert, Add and Max
//! - Pluggable communication backends (serial, threads, MPI)
//!
//! ## Usage
//! Add `vec-scatter` as a dependency in your `Cargo.toml` and enable features as needed:
//!
//! ```toml
//! [dependencies]
//! vec-scatter = "0.3"
//! # Optional features:
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! ```
//! use vec_scatter::prelude::*;
//!
//! let x = [10.0, 20.0, 30.0, 40.0, 50.0, 60.0];
//! let mut y = [0.0; 5];
//! let from = ArrayLayout::sequential(6);
//! let to = ArrayLayout::sequential(5);
//! let ix = IndexSet::general(vec![3, 1, 4, 1, 5]);
//! let mut plan = VecScatter::<f64, _>::new(&NoComm, &from, Some(&ix), &to, None)?;
//! plan.begin(&x, &mut y, CombineMode::Insert, Direction::Forward)?;
//! plan.end(&x, &mut y, CombineMode::Insert, Direction::Forward)?;
//! assert_eq!(y, [40.0, 20.0, 50.0, 20.0, 60.0]);
//! # Ok::<(), vec_scatter::scatter_error::ScatterError>(())
//! ```
//!
//! ## Determinism
//!
//! Incoming contributions are fused in ascending peer order, so `Add` and
//! `Max` results never depend on message arrival order.

pub mod algs;
pub mod data;
pub mod debug_invariants;
pub mod scatter;
pub mod scatter_error;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, NoComm, ThreadComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::data::index_set::IndexSet;
    pub use crate::data::layout::{ArrayLayout, split_ownership};
    pub use crate::data::scalar::{Complex64, Scalar};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::scatter::classify::Specialization;
    pub use crate::scatter::combine::{CombineMode, Direction};
    pub use crate::scatter::options::ScatterOptions;
    pub use crate::scatter::{ScatterRef, VecScatter};
    pub use crate::scatter_error::ScatterError;
}
