//! Error types shared across the Halo workspace.
//!
//! Two families live here: [`PreconditionError`] for model-code bugs
//! (mutating a ghost cell, querying outside the domain) and
//! [`WireError`] for data that could not be encoded or decoded. Both are
//! fatal for a distributed run; callers propagate them up to the step
//! driver, which aborts.

use std::error::Error;
use std::fmt;
use std::io;

use crate::id::{Coord, FieldIndex, Position};
use crate::rect::Rect;

/// A precondition on a spatial operation was violated.
#[derive(Clone, Debug, PartialEq)]
pub enum PreconditionError {
    /// A coordinate lies outside the global domain.
    OutsideDomain {
        /// The offending coordinate.
        coord: Coord,
        /// The global domain bounds.
        domain: Rect,
    },
    /// A real-valued position lies outside the global domain or is not finite.
    PositionOutsideDomain {
        /// The offending position.
        position: Position,
        /// The global domain bounds.
        domain: Rect,
    },
    /// A write targeted the ghost zone, which only its owner may mutate.
    GhostWrite {
        /// The ghost coordinate that was written.
        coord: Coord,
        /// The owned rectangle of the writing process.
        owned: Rect,
    },
    /// A write targeted a point that is neither owned nor in the halo.
    NotOwned {
        /// The coordinate that was written.
        coord: Coord,
        /// The owned rectangle of the writing process.
        owned: Rect,
    },
    /// A coordinate or position had the wrong number of components.
    DimensionMismatch {
        /// Dimensionality of the domain.
        expected: usize,
        /// Dimensionality of the argument.
        got: usize,
    },
    /// No field is registered under this index.
    UnknownField {
        /// The index that was looked up.
        index: FieldIndex,
    },
    /// A field was accessed through a handle of the wrong storage type.
    FieldTypeMismatch {
        /// The field that was accessed.
        index: FieldIndex,
        /// The storage type the caller expected.
        expected: &'static str,
    },
    /// The object is not present in local storage.
    UnknownObject {
        /// Description of the missing object.
        detail: String,
    },
    /// An event was scheduled before the current time or with invalid
    /// parameters.
    InvalidSchedule {
        /// The requested fire time.
        time: f64,
        /// The schedule's current time.
        now: f64,
    },
}

impl fmt::Display for PreconditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutsideDomain { coord, domain } => {
                write!(f, "coordinate {coord:?} is outside the domain {domain}")
            }
            Self::PositionOutsideDomain { position, domain } => {
                write!(f, "position {position:?} is outside the domain {domain}")
            }
            Self::GhostWrite { coord, owned } => write!(
                f,
                "write to ghost cell {coord:?}; only the owner of {owned} may be mutated locally"
            ),
            Self::NotOwned { coord, owned } => {
                write!(f, "write to {coord:?} outside the owned partition {owned}")
            }
            Self::DimensionMismatch { expected, got } => {
                write!(f, "expected a {expected}-D argument, got {got}-D")
            }
            Self::UnknownField { index } => write!(f, "no field registered at index {index}"),
            Self::FieldTypeMismatch { index, expected } => {
                write!(f, "field {index} is not backed by {expected}")
            }
            Self::UnknownObject { detail } => write!(f, "unknown object: {detail}"),
            Self::InvalidSchedule { time, now } => {
                write!(f, "cannot schedule an event at {time} (current time {now})")
            }
        }
    }
}

impl Error for PreconditionError {}

/// Errors while encoding or decoding wire data.
#[derive(Debug)]
pub enum WireError {
    /// An I/O error from the underlying reader or writer.
    Io(io::Error),
    /// The data could not be decoded (truncated, corrupt or inconsistent).
    Malformed {
        /// Human-readable description of what went wrong.
        detail: String,
    },
    /// A frame declares a format version this build does not speak.
    UnsupportedVersion {
        /// The version found in the frame.
        found: u8,
    },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Malformed { detail } => write!(f, "malformed data: {detail}"),
            Self::UnsupportedVersion { found } => {
                write!(f, "unsupported wire format version {found}")
            }
        }
    }
}

impl Error for WireError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WireError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::Malformed {
                detail: "unexpected end of data".into(),
            }
        } else {
            Self::Io(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn ghost_write_message_names_the_cell() {
        let err = PreconditionError::GhostWrite {
            coord: smallvec![5, 9],
            owned: Rect::new(smallvec![0, 0], smallvec![5, 5]),
        };
        let msg = err.to_string();
        assert!(msg.contains("[5, 9]"), "{msg}");
        assert!(msg.contains("[0, 5) x [0, 5)"), "{msg}");
    }

    #[test]
    fn eof_maps_to_malformed() {
        let e: WireError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(e, WireError::Malformed { .. }));
    }
}
