//! Agents, their decoders, and the context an agent steps in.

use std::fmt;
use std::io::{Read, Write};
use std::sync::PoisonError;

use halo_core::{
    AgentId, FieldIndex, FieldValue, Position, PreconditionError, ProcessId, Rect,
    ScheduleParams, StepId, WireError,
};
use halo_field::{ContinuousStorage, FieldHandle, FieldSet, HaloField, Storage};
use halo_partition::SharedTable;
use indexmap::IndexMap;
use rand_chacha::ChaCha8Rng;

use crate::error::SimError;

// ── Agent ─────────────────────────────────────────────────────────

/// A schedulable unit of model behaviour.
///
/// Agents are owned by exactly one process at a time. When an agent's
/// step moves it into another partition it is encoded with
/// [`encode`](Agent::encode), shipped, and rebuilt at the destination by
/// the decoder registered for its [`kind`](Agent::kind).
pub trait Agent: Send + 'static {
    /// Registered kind name, used to find the decoder at a destination.
    fn kind(&self) -> &'static str;

    /// Run one event.
    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SimError>;

    /// Serialize the agent's state.
    fn encode(&self, w: &mut dyn Write) -> Result<(), WireError>;
}

/// An agent type that can be rebuilt from its encoded state.
pub trait AgentKind: Agent + Sized {
    /// The name returned by [`Agent::kind`].
    const KIND: &'static str;

    /// Inverse of [`Agent::encode`].
    fn decode(r: &mut dyn Read) -> Result<Self, WireError>;
}

pub(crate) fn encode_agent(agent: &dyn Agent) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    agent.encode(&mut buf)?;
    Ok(buf)
}

type Decoder = fn(&mut dyn Read) -> Result<Box<dyn Agent>, WireError>;

fn decode_boxed<A: AgentKind>(r: &mut dyn Read) -> Result<Box<dyn Agent>, WireError> {
    Ok(Box::new(A::decode(r)?))
}

/// Decoders for every agent kind that may migrate.
///
/// All processes must register the same kinds.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    decoders: IndexMap<&'static str, Decoder>,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `A` under [`AgentKind::KIND`].
    pub fn register<A: AgentKind>(&mut self) -> &mut Self {
        self.decoders.insert(A::KIND, decode_boxed::<A> as Decoder);
        self
    }

    /// Whether `kind` has a decoder.
    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Registered kind names, in registration order.
    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    /// Rebuild an agent of `kind` from `state`. Trailing bytes are an error.
    pub fn decode(&self, kind: &str, state: &[u8]) -> Result<Box<dyn Agent>, SimError> {
        let decode = self.decoders.get(kind).ok_or_else(|| SimError::UnknownAgentKind {
            kind: kind.to_owned(),
        })?;
        let mut r = state;
        let agent = decode(&mut r)?;
        if !r.is_empty() {
            return Err(WireError::Malformed {
                detail: format!("{} trailing bytes after '{kind}' agent state", r.len()),
            }
            .into());
        }
        Ok(agent)
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.decoders.keys()).finish()
    }
}

// ── StepContext ───────────────────────────────────────────────────

pub(crate) enum NextEvent {
    Keep,
    Stop,
    Replace(ScheduleParams),
}

pub(crate) struct Spawn {
    pub(crate) agent: Box<dyn Agent>,
    pub(crate) position: Position,
    pub(crate) home: Option<(FieldIndex, Vec<u8>)>,
    pub(crate) schedule: Option<ScheduleParams>,
}

/// What an agent sees while it steps.
///
/// Field reads and owned-cell writes take effect immediately. Moves,
/// schedule changes and spawns are recorded and applied by the driver
/// once the step returns, which is where a move out of the partition
/// becomes a migration.
pub struct StepContext<'a> {
    pub(crate) id: AgentId,
    pub(crate) pid: ProcessId,
    pub(crate) step: StepId,
    pub(crate) time: f64,
    pub(crate) position: Position,
    pub(crate) table: &'a SharedTable,
    pub(crate) fields: &'a mut FieldSet,
    pub(crate) rng: &'a mut ChaCha8Rng,
    pub(crate) moved: bool,
    pub(crate) next: NextEvent,
    pub(crate) spawned: Vec<Spawn>,
    pub(crate) stats: Vec<Vec<u8>>,
}

impl<'a> StepContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: AgentId,
        pid: ProcessId,
        step: StepId,
        time: f64,
        position: Position,
        table: &'a SharedTable,
        fields: &'a mut FieldSet,
        rng: &'a mut ChaCha8Rng,
    ) -> Self {
        Self {
            id,
            pid,
            step,
            time,
            position,
            table,
            fields,
            rng,
            moved: false,
            next: NextEvent::Keep,
            spawned: Vec::new(),
            stats: Vec::new(),
        }
    }

    /// The stepping agent.
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// The process running the step.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// The driver step count.
    pub fn step(&self) -> StepId {
        self.step
    }

    /// The current global time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// The agent's position, including any move made during this step.
    pub fn position(&self) -> &[f64] {
        &self.position
    }

    /// The simulated domain.
    pub fn world(&self) -> Rect {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .world()
            .clone()
    }

    /// This process's random stream.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut *self.rng
    }

    /// Every registered field.
    pub fn fields(&self) -> &FieldSet {
        &*self.fields
    }

    /// Every registered field, mutably.
    pub fn fields_mut(&mut self) -> &mut FieldSet {
        &mut *self.fields
    }

    /// The field behind `handle`.
    pub fn field<S: Storage>(&self, handle: FieldHandle<S>) -> Result<&HaloField<S>, SimError> {
        Ok(self.fields.get(handle)?)
    }

    /// The field behind `handle`, mutably.
    pub fn field_mut<S: Storage>(
        &mut self,
        handle: FieldHandle<S>,
    ) -> Result<&mut HaloField<S>, SimError> {
        Ok(self.fields.get_mut(handle)?)
    }

    /// Move the agent to `position`.
    ///
    /// On a torus the position wraps; on a bounded domain leaving the
    /// domain is a precondition error. If the new position belongs to
    /// another partition the agent migrates at the end of the step.
    pub fn move_to(&mut self, position: &[f64]) -> Result<(), SimError> {
        self.position = self.canonical(position)?;
        self.moved = true;
        Ok(())
    }

    /// Fire once more at `time`, replacing any pending event.
    pub fn schedule_once(&mut self, time: f64, ordering: i32) -> Result<(), SimError> {
        self.replace_next(ScheduleParams::once(time, ordering))
    }

    /// Fire at `time` and then every `interval`, replacing any pending
    /// event.
    pub fn schedule_repeating(&mut self, time: f64, interval: f64, ordering: i32) -> Result<(), SimError> {
        self.replace_next(ScheduleParams::repeating(time, interval, ordering))
    }

    /// Drop the agent's pending event, including its next repeat.
    ///
    /// The agent stays resident but never fires again unless rescheduled.
    pub fn stop(&mut self) {
        self.next = NextEvent::Stop;
    }

    /// Create a new agent at `position` once this step returns.
    pub fn spawn(
        &mut self,
        agent: impl Agent,
        position: &[f64],
        schedule: Option<ScheduleParams>,
    ) -> Result<(), SimError> {
        let position = self.canonical(position)?;
        self.spawned.push(Spawn {
            agent: Box::new(agent),
            position,
            home: None,
            schedule,
        });
        Ok(())
    }

    /// Create a new agent with an entry in a continuous field.
    pub fn spawn_in<T: FieldValue>(
        &mut self,
        agent: impl Agent,
        field: FieldHandle<ContinuousStorage<T>>,
        position: &[f64],
        value: T,
        schedule: Option<ScheduleParams>,
    ) -> Result<(), SimError> {
        let position = self.canonical(position)?;
        self.spawned.push(Spawn {
            agent: Box::new(agent),
            position,
            home: Some((field.index(), value.to_bytes()?)),
            schedule,
        });
        Ok(())
    }

    /// Record a model statistic for this step.
    pub fn add_stat(&mut self, bytes: Vec<u8>) {
        self.stats.push(bytes);
    }

    fn replace_next(&mut self, params: ScheduleParams) -> Result<(), SimError> {
        if !params.is_valid() || params.time < self.time {
            return Err(PreconditionError::InvalidSchedule {
                time: params.time,
                now: self.time,
            }
            .into());
        }
        self.next = NextEvent::Replace(params);
        Ok(())
    }

    fn canonical(&self, position: &[f64]) -> Result<Position, SimError> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        Ok(table.canonical_position(position)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_core::codec::{read_u32_le, write_u32_le};

    struct Counter(u32);

    impl Agent for Counter {
        fn kind(&self) -> &'static str {
            Self::KIND
        }

        fn step(&mut self, _: &mut StepContext<'_>) -> Result<(), SimError> {
            self.0 += 1;
            Ok(())
        }

        fn encode(&self, w: &mut dyn Write) -> Result<(), WireError> {
            write_u32_le(w, self.0)
        }
    }

    impl AgentKind for Counter {
        const KIND: &'static str = "counter";

        fn decode(r: &mut dyn Read) -> Result<Self, WireError> {
            Ok(Self(read_u32_le(r)?))
        }
    }

    #[test]
    fn registered_kinds_decode() {
        let mut registry = AgentRegistry::new();
        registry.register::<Counter>();
        assert!(registry.contains("counter"));

        let bytes = encode_agent(&Counter(41)).unwrap();
        let agent = registry.decode("counter", &bytes).unwrap();
        assert_eq!(agent.kind(), "counter");
        assert_eq!(encode_agent(agent.as_ref()).unwrap(), bytes);
    }

    #[test]
    fn unknown_kinds_and_trailing_bytes_fail() {
        let mut registry = AgentRegistry::new();
        registry.register::<Counter>();
        assert!(matches!(
            registry.decode("walker", &[]),
            Err(SimError::UnknownAgentKind { .. })
        ));
        assert!(matches!(
            registry.decode("counter", &[1, 0, 0, 0, 9]),
            Err(SimError::Wire(_))
        ));
    }
}
