//! Error types for PH-tree operations.

use thiserror::Error;

use crate::persist::NodeRef;

/// Top-level error type for PH-tree operations.
#[derive(Debug, Error)]
pub enum PhError {
    /// A key, rectangle corner or query center has the wrong number of coordinates.
    #[error("dimension mismatch: tree has {expected} dimensions, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Dimensionality outside the supported range.
    #[error("unsupported dimensionality {0}, expected 1..=64")]
    InvalidDimensions(usize),

    /// Rejected tuning parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Negative or NaN search radius.
    #[error("invalid radius {0}")]
    InvalidRadius(f64),

    /// A query cursor was advanced past its last entry.
    #[error("no such element")]
    NoSuchElement,

    /// The persistence provider has no node for this reference.
    #[error("dangling node reference {0:?}")]
    DanglingNode(NodeRef),

    /// A node does not hold what the tree's structure says it must.
    #[error("corrupt node {node:?}: {reason}")]
    CorruptNode { node: NodeRef, reason: &'static str },

    /// Failure inside the persistence provider.
    #[error("persistence error: {0}")]
    Persistence(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Result type for PH-tree operations.
pub type Result<T> = std::result::Result<T, PhError>;
