//! Strongly-typed identifiers and the [`Coord`] / [`Position`] aliases.

use smallvec::SmallVec;
use std::fmt;

/// Identifies one worker process (one partition) of a distributed run.
///
/// Process ids are dense: a run with `P` processes uses `ProcessId(0)`
/// through `ProcessId(P - 1)`. `ProcessId(0)` is the root for the
/// gather/scatter collectives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// The root process used by gather, scatter and broadcast.
    pub const ROOT: ProcessId = ProcessId(0);

    /// The id as a `usize` index into per-process tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this is the root process.
    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Identifies an agent or a field object for its whole lifetime.
///
/// Ids are minted by the process that creates the object and stay
/// unchanged across migrations and rebalances. The upper bits carry the
/// creating process so ids never collide across processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(pub u64);

impl AgentId {
    const PROCESS_SHIFT: u32 = 40;
    const SERIAL_MASK: u64 = (1 << Self::PROCESS_SHIFT) - 1;

    /// Compose an id from the creating process and a per-process counter.
    pub fn compose(creator: ProcessId, serial: u64) -> Self {
        Self(((creator.0 as u64) << Self::PROCESS_SHIFT) | (serial & Self::SERIAL_MASK))
    }

    /// The process that minted this id.
    pub fn creator(self) -> ProcessId {
        ProcessId((self.0 >> Self::PROCESS_SHIFT) as u32)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.creator(), self.0 & Self::SERIAL_MASK)
    }
}

impl From<u64> for AgentId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Identifies a registered halo field within a simulation.
///
/// Fields are registered in the same order on every process, so
/// `FieldIndex(n)` names the same logical field cluster-wide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldIndex(pub u32);

impl fmt::Display for FieldIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for FieldIndex {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Monotonically increasing step counter of the distributed driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StepId(pub u64);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StepId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Integer cell coordinate in the global domain.
///
/// Uses `SmallVec<[i32; 4]>` so domains of up to four dimensions stay
/// on the stack.
pub type Coord = SmallVec<[i32; 4]>;

/// Real-valued point in the global domain, used by continuous fields.
pub type Position = SmallVec<[f64; 4]>;

/// The cell containing a real-valued position (componentwise floor).
pub fn cell_of(position: &[f64]) -> Coord {
    position.iter().map(|x| x.floor() as i32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_round_trips_creator() {
        let id = AgentId::compose(ProcessId(7), 12345);
        assert_eq!(id.creator(), ProcessId(7));
        assert_eq!(id.to_string(), "7:12345");
    }

    #[test]
    fn agent_ids_from_different_processes_differ() {
        assert_ne!(
            AgentId::compose(ProcessId(0), 1),
            AgentId::compose(ProcessId(1), 1)
        );
    }

    #[test]
    fn cell_of_floors_negative_positions() {
        let c = cell_of(&[-0.5, 2.999]);
        assert_eq!(c.as_slice(), &[-1, 2]);
    }
}
