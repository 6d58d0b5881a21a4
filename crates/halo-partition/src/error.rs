//! Errors from building, validating or rebalancing a partitioning.

use std::error::Error;
use std::fmt;

use halo_core::{PreconditionError, ProcessId};

/// Errors from partition construction and maintenance.
#[derive(Clone, Debug, PartialEq)]
pub enum PartitionError {
    /// The global domain has no cells, or a zero/negative extent.
    EmptyDomain,
    /// A partitioning over zero processes was requested.
    ZeroProcesses,
    /// The AOI exceeds half of a partition's smallest extent, so the
    /// partition's halo would reach its own far side.
    AoiTooLarge {
        /// The partition that is too thin.
        pid: ProcessId,
        /// Configured halo radius.
        aoi: i32,
        /// Smallest extent of that partition.
        min_extent: i32,
    },
    /// The domain cannot be cut into the requested number of partitions
    /// while keeping every partition at least `2 * aoi` wide.
    NotSplittable {
        /// Human-readable description.
        detail: String,
    },
    /// The partitions do not tile the domain exactly.
    CoverageViolation {
        /// Human-readable description of the gap or overlap.
        detail: String,
    },
    /// A quad-tree node id does not name a live node.
    UnknownNode {
        /// The offending node id.
        node: usize,
    },
    /// The operation requires a leaf but the node has children
    /// (or requires an inner node and got a leaf).
    NotALeaf {
        /// The offending node id.
        node: usize,
    },
    /// Per-process cost vector length differs from the partition count.
    CostLengthMismatch {
        /// Number of partitions.
        expected: usize,
        /// Number of costs supplied.
        got: usize,
    },
    /// A geometric precondition was violated.
    Precondition(PreconditionError),
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyDomain => write!(f, "domain has no cells"),
            Self::ZeroProcesses => write!(f, "at least one process is required"),
            Self::AoiTooLarge {
                pid,
                aoi,
                min_extent,
            } => write!(
                f,
                "aoi {aoi} exceeds half of partition {pid}'s smallest extent {min_extent}"
            ),
            Self::NotSplittable { detail } => write!(f, "cannot split domain: {detail}"),
            Self::CoverageViolation { detail } => {
                write!(f, "partitions do not tile the domain: {detail}")
            }
            Self::UnknownNode { node } => write!(f, "no quad-tree node {node}"),
            Self::NotALeaf { node } => write!(f, "quad-tree node {node} has the wrong shape"),
            Self::CostLengthMismatch { expected, got } => {
                write!(f, "expected {expected} partition costs, got {got}")
            }
            Self::Precondition(e) => write!(f, "{e}"),
        }
    }
}

impl Error for PartitionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Precondition(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PreconditionError> for PartitionError {
    fn from(e: PreconditionError) -> Self {
        Self::Precondition(e)
    }
}
