//! Data module: array layouts, index sets and element types

pub mod index_set;
pub mod layout;
pub mod scalar;

pub use index_set::IndexSet;
pub use layout::{ArrayLayout, split_ownership};
pub use scalar::{Complex64, Scalar};
