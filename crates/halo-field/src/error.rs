//! Errors from halo field access.

use std::error::Error;
use std::fmt;

use halo_core::{Coord, FieldIndex, PreconditionError, ProcessId, WireError};

/// Errors from reading or writing a halo field.
#[derive(Debug)]
pub enum FieldError {
    /// The caller broke a spatial precondition (ghost write, out of domain).
    Precondition(PreconditionError),
    /// Field data could not be encoded or decoded.
    Wire(WireError),
    /// The process asked for a point did not own it under its current
    /// partition table.
    BoundaryMismatch {
        /// The process that was asked.
        owner: ProcessId,
        /// The requested coordinate.
        coord: Coord,
    },
    /// A remote fetch could not be completed.
    RemoteUnavailable {
        /// The process that was asked.
        owner: ProcessId,
        /// Human-readable description.
        detail: String,
    },
    /// A lock guarding field storage was poisoned by a panicking thread.
    Poisoned {
        /// The affected field.
        field: FieldIndex,
    },
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Precondition(e) => write!(f, "{e}"),
            Self::Wire(e) => write!(f, "field data: {e}"),
            Self::BoundaryMismatch { owner, coord } => {
                write!(f, "process {owner} does not own {coord:?}")
            }
            Self::RemoteUnavailable { owner, detail } => {
                write!(f, "remote fetch from process {owner} failed: {detail}")
            }
            Self::Poisoned { field } => write!(f, "storage lock of field {field} poisoned"),
        }
    }
}

impl Error for FieldError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Precondition(e) => Some(e),
            Self::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PreconditionError> for FieldError {
    fn from(e: PreconditionError) -> Self {
        Self::Precondition(e)
    }
}

impl From<WireError> for FieldError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}
