//! Errors from inter-process communication.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use halo_core::{Coord, ProcessId, WireError};

use crate::transport::Tag;

/// A collective-protocol failure.
///
/// Every variant is fatal for the distributed run: the step driver logs
/// it and aborts. Nothing in this crate retries.
#[derive(Debug)]
pub enum CommError {
    /// A peer did not answer within the collective timeout.
    Timeout {
        /// The peer waited for.
        peer: ProcessId,
        /// The message kind waited for.
        tag: Tag,
        /// How long the caller waited.
        waited: Duration,
    },
    /// A peer's channel is gone (the peer exited or panicked).
    Disconnected {
        /// The unreachable peer.
        peer: ProcessId,
    },
    /// A payload could not be encoded or decoded.
    Wire(WireError),
    /// A message claimed a different origin than the channel it came on,
    /// or was addressed to another process.
    UnexpectedSender {
        /// The process the message should have come from.
        expected: ProcessId,
        /// The process the message says it came from.
        got: ProcessId,
    },
    /// A remote fetch asked a process for a point it does not own.
    BoundaryMismatch {
        /// The process that was asked.
        owner: ProcessId,
        /// The requested coordinate.
        coord: Coord,
    },
    /// No fetch endpoint is published for a process.
    UnknownEndpoint {
        /// The process looked up.
        pid: ProcessId,
    },
    /// A remote fetch reached its owner but failed there.
    Remote {
        /// The process that failed.
        owner: ProcessId,
        /// The owner's description of the failure.
        detail: String,
    },
    /// A process tried to fetch a point from itself.
    SelfFetch {
        /// The requested coordinate.
        coord: Coord,
    },
    /// A background thread could not be started.
    Spawn(std::io::Error),
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { peer, tag, waited } => {
                write!(f, "no {tag} message from process {peer} after {waited:?}")
            }
            Self::Disconnected { peer } => write!(f, "process {peer} disconnected"),
            Self::Wire(e) => write!(f, "wire: {e}"),
            Self::UnexpectedSender { expected, got } => {
                write!(f, "expected a message from process {expected}, got one from {got}")
            }
            Self::BoundaryMismatch { owner, coord } => {
                write!(f, "process {owner} does not own {coord:?}")
            }
            Self::UnknownEndpoint { pid } => {
                write!(f, "no fetch endpoint published for process {pid}")
            }
            Self::Remote { owner, detail } => {
                write!(f, "fetch failed on process {owner}: {detail}")
            }
            Self::SelfFetch { coord } => {
                write!(f, "{coord:?} is owned locally and must not be fetched remotely")
            }
            Self::Spawn(e) => write!(f, "failed to spawn thread: {e}"),
        }
    }
}

impl Error for CommError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Wire(e) => Some(e),
            Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for CommError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}
