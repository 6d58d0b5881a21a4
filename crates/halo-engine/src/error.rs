//! The fatal error of a distributed run.

use std::error::Error;
use std::fmt;

use halo_comm::CommError;
use halo_core::{PreconditionError, ProcessId, WireError};
use halo_field::FieldError;
use halo_partition::PartitionError;

use crate::config::ConfigError;

/// Errors returned by the step driver.
///
/// Every variant aborts the run. The driver stops at the first error it
/// sees; the caller is expected to tear the whole cluster down.
#[derive(Debug)]
pub enum SimError {
    /// Model code broke a local contract (ghost write, out-of-domain
    /// query, bad schedule time).
    Precondition(PreconditionError),
    /// A field operation failed for a reason other than a precondition.
    Field(FieldError),
    /// The partition scheme could not be built.
    Partition(PartitionError),
    /// A collective or remote call failed.
    Comm(CommError),
    /// The configuration is invalid.
    Config(ConfigError),
    /// Local data could not be encoded or decoded.
    Wire(WireError),
    /// An incoming migration disagrees with this process's table.
    MigrationMismatch {
        /// The process that sent the offending packet.
        sender: ProcessId,
        /// What disagreed.
        detail: String,
    },
    /// An incoming halo batch does not match the expected ghost set.
    HaloMismatch {
        /// The process that sent the batch.
        sender: ProcessId,
        /// What disagreed.
        detail: String,
    },
    /// The barrier produced a time earlier than the previous one.
    ClockRegression {
        /// The previously agreed global time.
        previous: f64,
        /// The newly computed global time.
        computed: f64,
    },
    /// An arriving agent's kind has no registered decoder.
    UnknownAgentKind {
        /// The kind name carried by the envelope.
        kind: String,
    },
    /// An agent's step reported a failure.
    Agent {
        /// The agent's description of the failure.
        detail: String,
    },
    /// A driver method was called in the wrong lifecycle phase.
    Lifecycle {
        /// What was attempted.
        detail: String,
    },
}

impl SimError {
    /// An agent-reported failure.
    pub fn agent(detail: impl Into<String>) -> Self {
        Self::Agent {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Precondition(e) => write!(f, "precondition violated: {e}"),
            Self::Field(e) => write!(f, "field: {e}"),
            Self::Partition(e) => write!(f, "partition: {e}"),
            Self::Comm(e) => write!(f, "communication: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Wire(e) => write!(f, "wire: {e}"),
            Self::MigrationMismatch { sender, detail } => {
                write!(f, "migration from process {sender} rejected: {detail}")
            }
            Self::HaloMismatch { sender, detail } => {
                write!(f, "halo batch from process {sender} rejected: {detail}")
            }
            Self::ClockRegression { previous, computed } => {
                write!(f, "global time went back from {previous} to {computed}")
            }
            Self::UnknownAgentKind { kind } => {
                write!(f, "no decoder registered for agent kind '{kind}'")
            }
            Self::Agent { detail } => write!(f, "agent failed: {detail}"),
            Self::Lifecycle { detail } => write!(f, "lifecycle: {detail}"),
        }
    }
}

impl Error for SimError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Precondition(e) => Some(e),
            Self::Field(e) => Some(e),
            Self::Partition(e) => Some(e),
            Self::Comm(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PreconditionError> for SimError {
    fn from(e: PreconditionError) -> Self {
        Self::Precondition(e)
    }
}

impl From<FieldError> for SimError {
    fn from(e: FieldError) -> Self {
        match e {
            FieldError::Precondition(p) => Self::Precondition(p),
            FieldError::Wire(w) => Self::Wire(w),
            other => Self::Field(other),
        }
    }
}

impl From<PartitionError> for SimError {
    fn from(e: PartitionError) -> Self {
        Self::Partition(e)
    }
}

impl From<CommError> for SimError {
    fn from(e: CommError) -> Self {
        Self::Comm(e)
    }
}

impl From<ConfigError> for SimError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<WireError> for SimError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}
