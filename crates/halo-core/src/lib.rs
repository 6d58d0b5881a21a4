//! Core types for the Halo distributed simulation framework.
//!
//! This is the leaf crate with zero internal dependencies. It defines
//! the vocabulary shared by the rest of the workspace: process, agent and
//! field identifiers, N-dimensional coordinates and rectangles, schedule
//! parameters, the binary wire primitives and the error types for
//! precondition violations and malformed data.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod codec;
pub mod error;
pub mod id;
pub mod rect;
pub mod time;
pub mod value;

pub use error::{PreconditionError, WireError};
pub use id::{AgentId, Coord, FieldIndex, Position, ProcessId, StepId};
pub use rect::Rect;
pub use time::{ScheduleParams, AFTER_SIMULATION, EPOCH};
pub use value::FieldValue;
