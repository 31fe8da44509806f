//! ScatterError: Unified error type for vec-scatter public APIs
//!
//! Every public operation of the crate returns `Result<_, ScatterError>`.
//! Construction errors that can be decided locally (lengths, bounds) are
//! reported before any message is posted.

use thiserror::Error;

/// Boxed error used as the `source` of communication failures.
pub type CommSource = Box<dyn std::error::Error + Send + Sync>;

/// Simple string error carried inside [`ScatterError::Comm`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CommError(pub String);

/// Unified error type for scatter operations.
#[derive(Debug, Error)]
pub enum ScatterError {
    /// Two lengths that must agree do not.
    #[error("size mismatch in {context}: expected {expected}, found {found}")]
    SizeMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },
    /// An index lies outside `[0, bound)`.
    #[error("index {index} at position {position} is out of range [0, {bound})")]
    IndexOutOfRange {
        index: i64,
        position: usize,
        bound: usize,
    },
    /// The plan is not in a state that permits the operation.
    #[error("wrong state: {0}")]
    WrongState(&'static str),
    /// The operation is not supported for this plan or element type.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
    /// A scratch buffer could not be allocated.
    #[error("could not allocate {requested} elements for {what}")]
    ResourceExhaustion {
        what: &'static str,
        requested: usize,
    },
    /// A message to or from `neighbor` failed or had an unexpected shape.
    #[error("communication with rank {neighbor} failed: {source}")]
    Comm {
        neighbor: usize,
        #[source]
        source: CommSource,
    },
    /// An array layout is malformed (non-monotone ranges, bad rank, ...).
    #[error("invalid layout: {0}")]
    InvalidLayout(String),
    /// Writing a diagnostic view failed.
    #[error("view failed: {0}")]
    View(String),
}

impl ScatterError {
    pub(crate) fn comm(neighbor: usize, msg: impl Into<String>) -> Self {
        ScatterError::Comm {
            neighbor,
            source: Box::new(CommError(msg.into())),
        }
    }

    pub(crate) fn size(context: &'static str, expected: usize, found: usize) -> Self {
        ScatterError::SizeMismatch {
            context,
            expected,
            found,
        }
    }
}

impl From<std::io::Error> for ScatterError {
    fn from(e: std::io::Error) -> Self {
        ScatterError::View(e.to_string())
    }
}

impl From<serde_json::Error> for ScatterError {
    fn from(e: serde_json::Error) -> Self {
        ScatterError::View(e.to_string())
    }
}

impl From<std::collections::TryReserveError> for ScatterError {
    fn from(_: std::collections::TryReserveError) -> Self {
        ScatterError::ResourceExhaustion {
            what: "buffer",
            requested: 0,
        }
    }
}
