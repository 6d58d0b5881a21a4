//! [`DistributedSimState`]: the lock-step driver of one process.
//!
//! A step runs the same phases on every process, in this order:
//!
//! 1. **Local step**: every agent due at the agreed global time fires.
//!    Moves out of the partition are queued for migration.
//! 2. **Halo sync**: ghost zones are refreshed from their owners.
//! 3. **Migration flush**: queued agents and objects reach their new
//!    owners and are re-inserted with their schedule parameters.
//! 4. **Barrier**: the next event time is min-reduced across processes.
//! 5. **Rebalance** (every `interval` steps when configured): costs are
//!    gathered and, if skewed, the partition table is replaced and owned
//!    cells and agents are handed to their new owners.
//!
//! Every phase after the local step is collective. A failure in any of
//! them leaves the driver in a failed state; the run cannot continue.

use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use halo_comm::{EndpointDirectory, FieldParcel, HaloPacket, Tag, Transport, Transportee};
use halo_core::codec::{
    read_len, read_length_prefixed_bytes, read_length_prefixed_str, write_len,
    write_length_prefixed_bytes, write_length_prefixed_str,
};
use halo_core::{
    AgentId, FieldIndex, FieldValue, Position, PreconditionError, ProcessId, Rect, ScheduleParams,
    StepId, WireError, AFTER_SIMULATION,
};
use halo_field::{ContinuousStorage, DenseGrid, FieldHandle, FieldSet, HaloField, Storage};
use halo_partition::PartitionTable;
use indexmap::IndexMap;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info};

use crate::agent::{encode_agent, Agent, AgentRegistry, NextEvent, StepContext};
use crate::balancer::LoadBalancer;
use crate::config::{ClusterConfig, CostMetric};
use crate::context::ClusterContext;
use crate::error::SimError;
use crate::metrics::StepMetrics;
use crate::migrator::{Inbound, ObjectMigrator};
use crate::schedule::Schedule;
use crate::sync::Synchronizer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Setup,
    Running,
    Finished,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Setup => "setting up",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        })
    }
}

struct Resident {
    /// `None` only while the agent is stepping.
    agent: Option<Box<dyn Agent>>,
    position: Position,
    home: Option<FieldIndex>,
}

/// One process's share of a distributed simulation.
///
/// Build one per process with the same [`ClusterConfig`], register the
/// same fields in the same order everywhere, seed agents (usually on the
/// root only), then call [`start`](Self::start) and [`step`](Self::step)
/// in lock-step on every process until `step` returns `false`.
///
/// # Ownership model
///
/// The driver owns its agents outright. While an agent steps it is
/// taken out of its slot and handed a [`StepContext`] borrowing the
/// fields and the random stream; the slot is refilled afterwards. An
/// agent leaving the partition is encoded, dropped here and rebuilt by
/// the receiving driver from its [`AgentRegistry`].
pub struct DistributedSimState {
    ctx: ClusterContext,
    config: ClusterConfig,
    fields: FieldSet,
    agents: IndexMap<AgentId, Resident>,
    registry: AgentRegistry,
    schedule: Schedule,
    synchronizer: Synchronizer,
    migrator: ObjectMigrator,
    balancer: Option<LoadBalancer>,
    rng: ChaCha8Rng,
    phase: Phase,
    time: f64,
    step: StepId,
    next_serial: u64,
    root_outbox: Vec<IndexMap<String, Vec<u8>>>,
    root_info: IndexMap<String, Vec<u8>>,
    global: Option<Vec<u8>>,
    stats: Vec<(StepId, Vec<u8>)>,
    metrics: StepMetrics,
}

impl DistributedSimState {
    /// Create the driver for the process behind `transport`.
    ///
    /// # Errors
    ///
    /// Anything [`ClusterContext::init`] reports.
    pub fn new(
        config: ClusterConfig,
        transport: Box<dyn Transport>,
        directory: Arc<dyn EndpointDirectory>,
        registry: AgentRegistry,
    ) -> Result<Self, SimError> {
        let ctx = ClusterContext::init(&config, transport, directory)?;
        let pid = ctx.pid();
        let n = ctx.num_processes();
        Ok(Self {
            fields: FieldSet::new(),
            agents: IndexMap::new(),
            registry,
            schedule: Schedule::new(),
            synchronizer: Synchronizer::new(pid),
            migrator: ObjectMigrator::new(pid),
            balancer: config.balance.clone().map(LoadBalancer::new),
            rng: process_rng(config.seed, pid),
            phase: Phase::Setup,
            time: halo_core::EPOCH,
            step: StepId(0),
            next_serial: 0,
            root_outbox: if pid.is_root() { vec![IndexMap::new(); n] } else { Vec::new() },
            root_info: IndexMap::new(),
            global: None,
            stats: Vec::new(),
            metrics: StepMetrics::default(),
            ctx,
            config,
        })
    }

    // ── Accessors ─────────────────────────────────────────────────

    /// This process.
    pub fn pid(&self) -> ProcessId {
        self.ctx.pid()
    }

    /// Number of processes in the run.
    pub fn num_processes(&self) -> usize {
        self.ctx.num_processes()
    }

    /// The configuration the driver was built with.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// This process's owned rectangle under the current table.
    pub fn get_local_partition(&self) -> &Rect {
        self.ctx.local_partition()
    }

    /// The current partition table.
    pub fn table(&self) -> &PartitionTable {
        self.ctx.table()
    }

    /// The cluster handles.
    pub fn context(&self) -> &ClusterContext {
        &self.ctx
    }

    /// Global time of the next step; [`AFTER_SIMULATION`] once finished.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Number of completed steps.
    pub fn step_count(&self) -> StepId {
        self.step
    }

    /// Whether [`start`](Self::start) has run.
    pub fn is_started(&self) -> bool {
        self.phase != Phase::Setup
    }

    /// Whether the run has ended on every process.
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Counters of the last completed step.
    pub fn metrics(&self) -> &StepMetrics {
        &self.metrics
    }

    /// Number of agents resident on this process.
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Ids of the resident agents, in insertion order.
    pub fn agent_ids(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.agents.keys().copied()
    }

    /// Whether `id` is resident here.
    pub fn contains_agent(&self, id: AgentId) -> bool {
        self.agents.contains_key(&id)
    }

    /// Position of a resident agent.
    pub fn agent_position(&self, id: AgentId) -> Option<&[f64]> {
        self.agents.get(&id).map(|r| r.position.as_slice())
    }

    /// The pending event of a resident agent.
    pub fn pending_event(&self, id: AgentId) -> Option<ScheduleParams> {
        self.schedule.pending(id)
    }

    /// Every registered field.
    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    /// Every registered field, mutably.
    pub fn fields_mut(&mut self) -> &mut FieldSet {
        &mut self.fields
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

    // ── Setup ─────────────────────────────────────────────────────

    /// Register a field whose storage `make` builds for a halo rectangle.
    ///
    /// Every process must register the same fields in the same order.
    pub fn register_field<S: Storage>(
        &mut self,
        name: impl Into<String>,
        make: impl FnOnce(Rect) -> S,
    ) -> Result<FieldHandle<S>, SimError> {
        self.require(Phase::Setup, "register_field")?;
        let field = HaloField::new(
            self.fields.next_index(),
            name,
            self.ctx.pid(),
            Arc::clone(self.ctx.shared_table()),
            make,
        )?;
        Ok(self.fields.register(field)?)
    }

    /// Register a dense grid of `T`, every cell starting at `T::default()`.
    pub fn register_grid<T: FieldValue + Default>(
        &mut self,
        name: impl Into<String>,
    ) -> Result<FieldHandle<DenseGrid<T>>, SimError> {
        self.register_field(name, DenseGrid::new)
    }

    /// Register an empty continuous field of `T`.
    pub fn register_continuous<T: FieldValue>(
        &mut self,
        name: impl Into<String>,
    ) -> Result<FieldHandle<ContinuousStorage<T>>, SimError> {
        self.register_field(name, ContinuousStorage::new)
    }

    /// Queue `value` under `key` for every process, delivered by
    /// [`start`](Self::start). Root only, before `start`.
    pub fn send_root_info_to_all(
        &mut self,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> Result<(), SimError> {
        self.require_root_setup("send_root_info_to_all")?;
        let key = key.into();
        for outbox in &mut self.root_outbox {
            outbox.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    /// Queue `value` under `key` for process `to` only.
    pub fn send_root_info_to(
        &mut self,
        to: ProcessId,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> Result<(), SimError> {
        self.require_root_setup("send_root_info_to")?;
        let n = self.root_outbox.len();
        let outbox = self.root_outbox.get_mut(to.index()).ok_or_else(|| SimError::Lifecycle {
            detail: format!("process {to} is not part of a {n}-process run"),
        })?;
        outbox.insert(key.into(), value);
        Ok(())
    }

    /// Information the root sent this process, available after `start`.
    pub fn root_info(&self, key: &str) -> Option<&[u8]> {
        self.root_info.get(key).map(Vec::as_slice)
    }

    // ── Agents and objects ────────────────────────────────────────

    /// Add `agent` at `position`, scheduled per `schedule`.
    ///
    /// The agent lands on whichever process owns `position`: immediately
    /// if that is this process, otherwise at the next migration flush.
    /// Every call mints a new id, so an agent added by several processes
    /// exists several times.
    pub fn add_agent(
        &mut self,
        agent: impl Agent,
        position: &[f64],
        schedule: Option<ScheduleParams>,
    ) -> Result<AgentId, SimError> {
        self.require_live("add_agent")?;
        let position = self.ctx.table().canonical_position(position)?;
        let id = self.mint();
        self.place(id, Box::new(agent), position, None, schedule)?;
        Ok(id)
    }

    /// Add `agent` with an entry holding `value` in a continuous field.
    ///
    /// The entry shares the agent's id and moves with it.
    pub fn add_agent_in<T: FieldValue>(
        &mut self,
        agent: impl Agent,
        field: FieldHandle<ContinuousStorage<T>>,
        position: &[f64],
        value: T,
        schedule: Option<ScheduleParams>,
    ) -> Result<AgentId, SimError> {
        self.require_live("add_agent_in")?;
        self.fields.get(field)?;
        let position = self.ctx.table().canonical_position(position)?;
        let id = self.mint();
        let home = Some((field.index(), value.to_bytes()?));
        self.place(id, Box::new(agent), position, home, schedule)?;
        Ok(id)
    }

    /// Add a passive object to a continuous field, routing it to the
    /// owner of `position`.
    pub fn add_to_field<T: FieldValue>(
        &mut self,
        field: FieldHandle<ContinuousStorage<T>>,
        position: &[f64],
        value: T,
    ) -> Result<AgentId, SimError> {
        self.require_live("add_to_field")?;
        let position = self.ctx.table().canonical_position(position)?;
        let owner = self.ctx.table().owner_of_position(&position)?;
        let id = self.mint();
        if owner == self.ctx.pid() {
            self.fields.get_mut(field)?.add(id, &position, value)?;
        } else {
            self.fields.get(field)?;
            self.migrator.enqueue_parcel(FieldParcel {
                field: field.index(),
                object: id,
                destination: owner,
                position,
                value: value.to_bytes()?,
            });
        }
        Ok(id)
    }

    /// Remove a resident agent together with its field entry and pending
    /// event.
    pub fn remove_agent(&mut self, id: AgentId) -> Result<Option<Box<dyn Agent>>, SimError> {
        let Some(resident) = self.agents.swap_remove(&id) else {
            return Ok(None);
        };
        self.schedule.extract(id);
        if let Some(home) = resident.home {
            self.fields.dyn_field_mut(home)?.take_object(id)?;
        }
        Ok(resident.agent)
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Begin the run.
    ///
    /// Collective. Starts the fetch server, delivers root information,
    /// routes the seeded agents to their owners, fills every halo and
    /// agrees on the first global time.
    pub fn start(&mut self) -> Result<(), SimError> {
        self.require(Phase::Setup, "start")?;
        let result = self.start_inner();
        self.settle_phase("start", result)
    }

    /// Run one lock-step step.
    ///
    /// Collective. Returns `true` while any process has events left; a
    /// driver that has already finished returns `false` without
    /// communicating.
    pub fn step(&mut self) -> Result<bool, SimError> {
        match self.phase {
            Phase::Running => {}
            Phase::Finished => return Ok(false),
            phase => {
                return Err(SimError::Lifecycle {
                    detail: format!("step called while {phase}"),
                })
            }
        }
        let result = self.step_inner();
        self.settle_phase("step", result)
    }

    /// Start if needed, then step until the run ends. Returns the number
    /// of steps taken.
    pub fn run(&mut self) -> Result<u64, SimError> {
        if self.phase == Phase::Setup {
            self.start()?;
        }
        let first = self.step.0;
        while self.step()? {}
        Ok(self.step.0 - first)
    }

    /// Stop the fetch server. Collective and idempotent.
    pub fn shutdown(&mut self) -> Result<(), SimError> {
        self.ctx.shutdown()
    }

    // ── Shared state ──────────────────────────────────────────────

    /// Replace the global value with one chosen by `arbiter`.
    ///
    /// Collective. Every process proposes `candidate`; the root passes
    /// all proposals, indexed by pid, to `arbiter` and broadcasts the
    /// result. `arbiter` only runs on the root.
    pub fn update_global(
        &mut self,
        candidate: Vec<u8>,
        arbiter: impl FnOnce(Vec<Vec<u8>>) -> Vec<u8>,
    ) -> Result<&[u8], SimError> {
        self.require_live("update_global")?;
        let transport = self.ctx.transport();
        let gathered = transport.gather(Tag::Gather, candidate)?;
        let value = transport.broadcast(Tag::Broadcast, gathered.map(arbiter))?;
        Ok(self.global.insert(value).as_slice())
    }

    /// The value last agreed by [`update_global`](Self::update_global).
    pub fn global(&self) -> Option<&[u8]> {
        self.global.as_deref()
    }

    /// Record a statistic outside any agent step. Ignored unless
    /// `record_stats` is set.
    pub fn add_stat(&mut self, bytes: Vec<u8>) {
        if self.config.record_stats {
            self.stats.push((self.step, bytes));
        }
    }

    /// Drain the recorded statistics, tagged with the step that
    /// produced them.
    pub fn take_stats(&mut self) -> Vec<(StepId, Vec<u8>)> {
        std::mem::take(&mut self.stats)
    }

    // ── Phases ────────────────────────────────────────────────────

    fn start_inner(&mut self) -> Result<(), SimError> {
        let proxy = self.ctx.proxy();
        for field in self.fields.iter_mut() {
            field.attach_remote(proxy.clone());
        }
        self.ctx.serve(self.fields.cell_sources())?;
        self.scatter_root_info()?;

        let inbound = self.flush()?;
        self.accept(inbound)?;
        self.sync_halos()?;

        let first = self.local_next_time();
        self.time = self.ctx.transport().all_reduce_min_f64(first)?;
        self.phase = if self.time == AFTER_SIMULATION {
            Phase::Finished
        } else {
            Phase::Running
        };
        info!(
            pid = %self.ctx.pid(),
            agents = self.agents.len(),
            fields = self.fields.len(),
            time = self.time,
            "simulation started"
        );
        Ok(())
    }

    fn step_inner(&mut self) -> Result<bool, SimError> {
        let started = Instant::now();
        let mut m = StepMetrics {
            time: self.time,
            ..StepMetrics::default()
        };
        let pid = self.ctx.pid();

        let t = Instant::now();
        self.schedule.advance_to(self.time);
        self.run_local(self.time, &mut m)?;
        m.local_step_us = micros(t);

        let t = Instant::now();
        let report = self.sync_halos()?;
        m.bytes_sent += report.bytes_sent;
        m.bytes_received += report.bytes_received;
        m.halo_sync_us = micros(t);

        let t = Instant::now();
        let inbound = self.flush()?;
        m.agents_in = inbound.agents.len() as u64;
        m.bytes_sent += inbound.bytes_sent;
        m.bytes_received += inbound.bytes_received;
        self.accept(inbound)?;
        m.migration_us = micros(t);

        if self.config.refresh_halo_after_migration {
            let t = Instant::now();
            let report = self.sync_halos()?;
            m.bytes_sent += report.bytes_sent;
            m.bytes_received += report.bytes_received;
            m.halo_sync_us += micros(t);
        }

        let t = Instant::now();
        let local_next = self.local_next_time();
        let next = self.ctx.transport().all_reduce_min_f64(local_next)?;
        if next < self.time {
            return Err(SimError::ClockRegression {
                previous: self.time,
                computed: next,
            });
        }
        m.barrier_us = micros(t);
        self.step = StepId(self.step.0 + 1);

        if next != AFTER_SIMULATION {
            let t = Instant::now();
            m.rebalanced = self.maybe_rebalance(&m)?;
            m.rebalance_us = micros(t);
        }

        self.time = next;
        m.total_us = micros(started);
        debug!(
            pid = %pid,
            step = self.step.0,
            time = m.time,
            stepped = m.agents_stepped,
            out = m.agents_out,
            arrived = m.agents_in,
            "step complete"
        );
        self.metrics = m;
        if next == AFTER_SIMULATION {
            self.phase = Phase::Finished;
            info!(pid = %pid, steps = self.step.0, "simulation finished");
            return Ok(false);
        }
        Ok(true)
    }

    fn run_local(&mut self, time: f64, m: &mut StepMetrics) -> Result<(), SimError> {
        let pid = self.ctx.pid();
        while let Some((id, params)) = self.schedule.pop_due(time) {
            if let Some(interval) = params.interval {
                self.schedule.schedule(
                    id,
                    ScheduleParams {
                        time: params.time + interval,
                        ..params
                    },
                )?;
            }
            let resident = self.agents.get_mut(&id).ok_or_else(|| PreconditionError::UnknownObject {
                detail: format!("scheduled agent {id} is not resident on {pid}"),
            })?;
            let mut agent = resident.agent.take().ok_or_else(|| PreconditionError::UnknownObject {
                detail: format!("agent {id} is already stepping"),
            })?;
            let position = resident.position.clone();

            let mut ctx = StepContext::new(
                id,
                pid,
                self.step,
                time,
                position,
                self.ctx.shared_table(),
                &mut self.fields,
                &mut self.rng,
            );
            let result = agent.step(&mut ctx);
            let StepContext {
                position,
                moved,
                next,
                spawned,
                stats,
                ..
            } = ctx;
            if let Some(resident) = self.agents.get_mut(&id) {
                resident.agent = Some(agent);
            }
            m.agents_stepped += 1;
            result?;

            match next {
                NextEvent::Keep => {}
                NextEvent::Stop => {
                    self.schedule.extract(id);
                }
                NextEvent::Replace(params) => self.schedule.schedule(id, params)?,
            }
            if self.config.record_stats {
                self.stats.extend(stats.into_iter().map(|s| (self.step, s)));
            }
            if moved {
                self.relocate(id, position, m)?;
            }
            for spawn in spawned {
                let child = self.mint();
                self.place(child, spawn.agent, spawn.position, spawn.home, spawn.schedule)?;
            }
        }
        Ok(())
    }

    fn sync_halos(&mut self) -> Result<crate::sync::SyncReport, SimError> {
        let (transport, table) = self.ctx.transport_and_table();
        self.synchronizer.sync(transport, table, &mut self.fields)
    }

    fn flush(&mut self) -> Result<Inbound, SimError> {
        let (transport, table) = self.ctx.transport_and_table();
        self.migrator.flush(transport, table)
    }

    fn maybe_rebalance(&mut self, m: &StepMetrics) -> Result<bool, SimError> {
        let Some(balancer) = self.balancer.as_mut() else {
            return Ok(false);
        };
        let cost = match balancer.metric() {
            CostMetric::WallClock => m.local_step_us as f64 / 1e6,
            CostMetric::AgentCount => self.agents.len() as f64,
        };
        balancer.record(cost);
        if !balancer.due(self.step) {
            return Ok(false);
        }
        let costs = balancer.gather_costs(self.ctx.transport())?;
        if !balancer.should_rebalance(&costs) {
            debug!(pid = %self.ctx.pid(), step = self.step.0, ?costs, "load within threshold");
            return Ok(false);
        }
        let Some(old) = self.ctx.repartition(&costs)? else {
            return Ok(false);
        };
        self.redistribute(&old)?;
        info!(
            pid = %self.ctx.pid(),
            step = self.step.0,
            version = self.ctx.table().version(),
            partition = %self.ctx.local_partition(),
            agents = self.agents.len(),
            "partitions rebalanced"
        );
        Ok(true)
    }

    /// Hand everything owned under `old` but not under the current table
    /// to its new owner, then reshape the fields.
    fn redistribute(&mut self, old: &PartitionTable) -> Result<(), SimError> {
        let me = self.ctx.pid();
        let new = self.ctx.table().clone();
        if let Some(previous) = old.rect(me) {
            for q in (0..new.num_processes()).map(|p| ProcessId(p as u32)) {
                if q == me {
                    continue;
                }
                let Some(region) = new.rect(q).and_then(|r| previous.intersect(r)) else {
                    continue;
                };
                for field in self.fields.iter() {
                    self.migrator.hand_over(
                        q,
                        HaloPacket {
                            field: field.index(),
                            rect: region.clone(),
                            payload: field.pack_region(&region)?,
                        },
                    );
                }
            }
        }

        let mut leaving = Vec::new();
        for (&id, resident) in &self.agents {
            let owner = new.owner_of_position(&resident.position)?;
            if owner != me {
                leaving.push((id, owner));
            }
        }
        for (id, owner) in leaving {
            self.depart(id, owner, false)?;
        }

        for field in self.fields.iter_mut() {
            field.rebalance()?;
        }
        let inbound = self.flush()?;
        self.accept(inbound)?;
        self.sync_halos()?;
        self.ctx.rediscover()
    }

    // ── Placement ─────────────────────────────────────────────────

    fn mint(&mut self) -> AgentId {
        let id = AgentId::compose(self.ctx.pid(), self.next_serial);
        self.next_serial += 1;
        id
    }

    fn place(
        &mut self,
        id: AgentId,
        agent: Box<dyn Agent>,
        position: Position,
        home: Option<(FieldIndex, Vec<u8>)>,
        schedule: Option<ScheduleParams>,
    ) -> Result<(), SimError> {
        if let Some(params) = schedule {
            let now = self.schedule.now();
            if !params.is_valid() || params.time < now {
                return Err(PreconditionError::InvalidSchedule {
                    time: params.time,
                    now,
                }
                .into());
            }
        }
        let owner = self.ctx.table().owner_of_position(&position)?;
        let (home, home_value) = match home {
            Some((field, value)) => (Some(field), Some(value)),
            None => (None, None),
        };
        if owner == self.ctx.pid() {
            return self.settle(id, agent, position, home, home_value, schedule);
        }
        self.migrator.enqueue(Transportee {
            agent: id,
            kind: agent.kind().to_owned(),
            state: encode_agent(agent.as_ref())?,
            destination: owner,
            position,
            home,
            home_value,
            schedule,
        });
        Ok(())
    }

    /// Make an agent resident here.
    ///
    /// A `home` without a value means the field entry arrived separately,
    /// inside a rebalance hand-over.
    fn settle(
        &mut self,
        id: AgentId,
        agent: Box<dyn Agent>,
        position: Position,
        home: Option<FieldIndex>,
        home_value: Option<Vec<u8>>,
        schedule: Option<ScheduleParams>,
    ) -> Result<(), SimError> {
        if self.agents.contains_key(&id) {
            return Err(SimError::MigrationMismatch {
                sender: id.creator(),
                detail: format!("agent {id} is already resident on {}", self.ctx.pid()),
            });
        }
        if let (Some(field), Some(value)) = (home, home_value) {
            self.fields
                .dyn_field_mut(field)?
                .put_object(id, &position, &value)?;
        }
        if let Some(params) = schedule {
            self.schedule.schedule(id, params)?;
        }
        self.agents.insert(
            id,
            Resident {
                agent: Some(agent),
                position,
                home,
            },
        );
        Ok(())
    }

    /// Apply a move made during a step.
    fn relocate(&mut self, id: AgentId, position: Position, m: &mut StepMetrics) -> Result<(), SimError> {
        let owner = self.ctx.table().owner_of_position(&position)?;
        if owner != self.ctx.pid() {
            if let Some(resident) = self.agents.get_mut(&id) {
                resident.position = position;
            }
            self.depart(id, owner, true)?;
            m.agents_out += 1;
            return Ok(());
        }
        let Some(resident) = self.agents.get_mut(&id) else {
            return Ok(());
        };
        if let Some(home) = resident.home {
            if !self.fields.dyn_field_mut(home)?.move_object(id, &position)? {
                return Err(PreconditionError::UnknownObject {
                    detail: format!("agent {id} has no entry in field {home}"),
                }
                .into());
            }
        }
        resident.position = position;
        Ok(())
    }

    /// Remove a resident agent and queue it for `destination`.
    ///
    /// With `carry_home` the agent's field entry travels in its envelope;
    /// otherwise it travels inside a region hand-over.
    fn depart(&mut self, id: AgentId, destination: ProcessId, carry_home: bool) -> Result<(), SimError> {
        let Some(resident) = self.agents.swap_remove(&id) else {
            return Ok(());
        };
        let agent = resident.agent.ok_or_else(|| PreconditionError::UnknownObject {
            detail: format!("agent {id} left while stepping"),
        })?;
        let home_value = match resident.home {
            Some(home) if carry_home => {
                let (_, value) = self.fields.dyn_field_mut(home)?.take_object(id)?.ok_or_else(|| {
                    PreconditionError::UnknownObject {
                        detail: format!("agent {id} has no entry in field {home}"),
                    }
                })?;
                Some(value)
            }
            _ => None,
        };
        let schedule = self.schedule.extract(id);
        self.migrator.enqueue(Transportee {
            agent: id,
            kind: agent.kind().to_owned(),
            state: encode_agent(agent.as_ref())?,
            destination,
            position: resident.position,
            home: resident.home,
            home_value,
            schedule,
        });
        Ok(())
    }

    fn accept(&mut self, inbound: Inbound) -> Result<(), SimError> {
        for region in inbound.regions {
            let shift = vec![0; region.rect.ndim()];
            self.fields
                .dyn_field_mut(region.field)?
                .unpack_region(&region.rect, &shift, &region.payload)?;
        }
        for parcel in inbound.parcels {
            self.fields
                .dyn_field_mut(parcel.field)?
                .put_object(parcel.object, &parcel.position, &parcel.value)?;
        }
        for t in inbound.agents {
            let agent = self.registry.decode(&t.kind, &t.state)?;
            self.settle(t.agent, agent, t.position, t.home, t.home_value, t.schedule)?;
        }
        Ok(())
    }

    fn local_next_time(&mut self) -> f64 {
        let next = self.schedule.next_time();
        match self.config.end_time {
            Some(end) if next >= end => AFTER_SIMULATION,
            _ => next,
        }
    }

    fn scatter_root_info(&mut self) -> Result<(), SimError> {
        let payloads = if self.ctx.pid().is_root() {
            Some(
                self.root_outbox
                    .iter()
                    .map(encode_info)
                    .collect::<Result<Vec<_>, _>>()?,
            )
        } else {
            None
        };
        let mine = self.ctx.transport().scatter(Tag::Scatter, payloads)?;
        self.root_info = decode_info(&mine)?;
        self.root_outbox.clear();
        Ok(())
    }

    // ── Guards ────────────────────────────────────────────────────

    fn require(&self, phase: Phase, what: &str) -> Result<(), SimError> {
        if self.phase == phase {
            return Ok(());
        }
        Err(SimError::Lifecycle {
            detail: format!("{what} called while {}", self.phase),
        })
    }

    fn require_live(&self, what: &str) -> Result<(), SimError> {
        match self.phase {
            Phase::Setup | Phase::Running => Ok(()),
            phase => Err(SimError::Lifecycle {
                detail: format!("{what} called while {phase}"),
            }),
        }
    }

    fn require_root_setup(&self, what: &str) -> Result<(), SimError> {
        self.require(Phase::Setup, what)?;
        if !self.ctx.pid().is_root() {
            return Err(SimError::Lifecycle {
                detail: format!("{what} called on {}, only the root sends", self.ctx.pid()),
            });
        }
        Ok(())
    }

    fn settle_phase<T>(&mut self, what: &str, result: Result<T, SimError>) -> Result<T, SimError> {
        if let Err(e) = &result {
            error!(
                pid = %self.ctx.pid(),
                step = self.step.0,
                time = self.time,
                error = %e,
                "{what} failed"
            );
            self.phase = Phase::Failed;
        }
        result
    }
}

impl fmt::Debug for DistributedSimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedSimState")
            .field("pid", &self.ctx.pid())
            .field("phase", &self.phase)
            .field("time", &self.time)
            .field("step", &self.step)
            .field("agents", &self.agents.len())
            .field("fields", &self.fields.len())
            .finish_non_exhaustive()
    }
}

/// Per-process random stream: equal seeds give equal runs, and no two
/// processes share a stream.
fn process_rng(seed: u64, pid: ProcessId) -> ChaCha8Rng {
    let salt = (pid.0 as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    ChaCha8Rng::seed_from_u64(seed ^ salt)
}

fn micros(since: Instant) -> u64 {
    since.elapsed().as_micros() as u64
}

fn encode_info(info: &IndexMap<String, Vec<u8>>) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    write_len(&mut buf, info.len())?;
    for (key, value) in info {
        write_length_prefixed_str(&mut buf, key)?;
        write_length_prefixed_bytes(&mut buf, value)?;
    }
    Ok(buf)
}

fn decode_info(bytes: &[u8]) -> Result<IndexMap<String, Vec<u8>>, WireError> {
    let mut r: &[u8] = bytes;
    let r: &mut dyn Read = &mut r;
    let count = read_len(r)?;
    let mut info = IndexMap::with_capacity(count);
    for _ in 0..count {
        let key = read_length_prefixed_str(r)?;
        info.insert(key, read_length_prefixed_bytes(r)?);
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_comm::{LocalCluster, LocalDirectory};
    use halo_core::codec::{read_u32_le, write_u32_le};
    use halo_partition::PartitionPolicy;
    use std::io::Write;
    use std::time::Duration;

    use crate::agent::AgentKind;

    /// Fires `remaining` more times, one time unit apart.
    struct Countdown {
        remaining: u32,
    }

    impl Agent for Countdown {
        fn kind(&self) -> &'static str {
            Self::KIND
        }

        fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SimError> {
            self.remaining = self.remaining.saturating_sub(1);
            ctx.add_stat(self.remaining.to_le_bytes().to_vec());
            if self.remaining == 0 {
                ctx.stop();
            }
            Ok(())
        }

        fn encode(&self, w: &mut dyn Write) -> Result<(), WireError> {
            write_u32_le(w, self.remaining)
        }
    }

    impl AgentKind for Countdown {
        const KIND: &'static str = "countdown";

        fn decode(r: &mut dyn Read) -> Result<Self, WireError> {
            Ok(Self {
                remaining: read_u32_le(r)?,
            })
        }
    }

    fn solo(config: ClusterConfig) -> DistributedSimState {
        let ep = LocalCluster::endpoints(1, Duration::from_secs(5)).remove(0);
        let mut registry = AgentRegistry::new();
        registry.register::<Countdown>();
        DistributedSimState::new(config, Box::new(ep), Arc::new(LocalDirectory::new()), registry)
            .unwrap()
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            domain: vec![10, 10],
            policy: PartitionPolicy::UniformGrid,
            record_stats: true,
            ..ClusterConfig::default()
        }
    }

    #[test]
    fn a_single_process_runs_to_completion() {
        let mut sim = solo(config());
        sim.add_agent(
            Countdown { remaining: 3 },
            &[1.0, 1.0],
            Some(ScheduleParams::repeating(1.0, 1.0, 0)),
        )
        .unwrap();
        sim.start().unwrap();
        assert_eq!(sim.time(), 1.0);

        let mut times = Vec::new();
        loop {
            times.push(sim.time());
            if !sim.step().unwrap() {
                break;
            }
        }
        assert_eq!(times, vec![1.0, 2.0, 3.0]);
        assert!(sim.is_finished());
        assert_eq!(sim.time(), AFTER_SIMULATION);
        assert_eq!(sim.take_stats().len(), 3);
        assert!(!sim.step().unwrap());
        sim.shutdown().unwrap();
    }

    #[test]
    fn end_time_cuts_the_run_short() {
        let mut sim = solo(ClusterConfig {
            end_time: Some(2.5),
            ..config()
        });
        sim.add_agent(
            Countdown { remaining: 100 },
            &[1.0, 1.0],
            Some(ScheduleParams::repeating(0.0, 1.0, 0)),
        )
        .unwrap();
        assert_eq!(sim.run().unwrap(), 3);
        sim.shutdown().unwrap();
    }

    #[test]
    fn setup_operations_are_rejected_once_running() {
        let mut sim = solo(config());
        sim.register_grid::<f64>("heat").unwrap();
        sim.start().unwrap();
        assert!(sim.is_finished());
        assert!(matches!(
            sim.register_grid::<f64>("late"),
            Err(SimError::Lifecycle { .. })
        ));
        assert!(matches!(sim.start(), Err(SimError::Lifecycle { .. })));
        sim.shutdown().unwrap();
    }

    #[test]
    fn schedules_in_the_past_are_rejected() {
        let mut sim = solo(config());
        assert!(matches!(
            sim.add_agent(
                Countdown { remaining: 1 },
                &[1.0, 1.0],
                Some(ScheduleParams::once(-1.0, 0))
            ),
            Err(SimError::Precondition(PreconditionError::InvalidSchedule { .. }))
        ));
        assert_eq!(sim.agent_count(), 0);
    }

    #[test]
    fn root_info_reaches_the_root_itself() {
        let mut sim = solo(config());
        sim.send_root_info_to_all("seed", vec![7]).unwrap();
        sim.send_root_info_to(ProcessId(0), "own", vec![1, 2]).unwrap();
        assert!(sim.send_root_info_to(ProcessId(3), "x", Vec::new()).is_err());
        sim.start().unwrap();
        assert_eq!(sim.root_info("seed"), Some(&[7u8][..]));
        assert_eq!(sim.root_info("own"), Some(&[1u8, 2][..]));
        assert_eq!(sim.root_info("missing"), None);
        sim.shutdown().unwrap();
    }

    #[test]
    fn objects_and_agents_share_a_continuous_field() {
        let mut sim = solo(config());
        let herd = sim.register_continuous::<u32>("herd").unwrap();
        let a = sim
            .add_agent_in(Countdown { remaining: 1 }, herd, &[2.5, 2.5], 10, None)
            .unwrap();
        let b = sim.add_to_field(herd, &[3.5, 3.5], 20).unwrap();
        assert_ne!(a, b);
        let field = sim.field(herd).unwrap();
        assert_eq!(field.owned_len().unwrap(), 2);

        let removed = sim.remove_agent(a).unwrap();
        assert!(removed.is_some());
        assert_eq!(sim.field(herd).unwrap().owned_len().unwrap(), 1);
    }

    #[test]
    fn info_maps_survive_encoding() {
        let mut info = IndexMap::new();
        info.insert("a".to_owned(), vec![1, 2, 3]);
        info.insert("b".to_owned(), Vec::new());
        let bytes = encode_info(&info).unwrap();
        assert_eq!(decode_info(&bytes).unwrap(), info);
    }
}
