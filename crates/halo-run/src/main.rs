//! Halo cluster runner.
//!
//! Starts one thread per simulated process, seeds drifting agents on the
//! root and runs the lock-step loop to the end time.
//!
//! ```text
//! halo-run --domain 200,200 --processes 4 --agents 500 --end-time 50 --torus \
//!     --balance-interval 5 -v
//! ```
//!
//! Logging follows `RUST_LOG` (for example `RUST_LOG=halo_engine=debug`);
//! `-v` raises the default level to debug.

mod drifter;

use std::fmt;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use halo::comm::{EndpointDirectory, LocalCluster, LocalDirectory};
use halo::engine::{
    AgentRegistry, BalanceConfig, ClusterConfig, ConfigError, CostMetric, DistributedSimState,
    SimError,
};
use halo::partition::PartitionPolicy;
use halo::types::{ProcessId, Rect, ScheduleParams};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::drifter::Drifter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Policy {
    UniformGrid,
    QuadTree,
}

impl From<Policy> for PartitionPolicy {
    fn from(p: Policy) -> Self {
        match p {
            Policy::UniformGrid => PartitionPolicy::UniformGrid,
            Policy::QuadTree => PartitionPolicy::QuadTree,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Metric {
    WallClock,
    AgentCount,
}

impl From<Metric> for CostMetric {
    fn from(m: Metric) -> Self {
        match m {
            Metric::WallClock => CostMetric::WallClock,
            Metric::AgentCount => CostMetric::AgentCount,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "halo-run")]
#[command(about = "Run a drifting-agent model on an in-process Halo cluster", long_about = None)]
struct Args {
    /// Domain extents, one per axis
    #[arg(long, value_delimiter = ',', default_value = "100,100")]
    domain: Vec<i32>,

    /// Number of simulated processes
    #[arg(short = 'n', long, default_value_t = 4)]
    processes: usize,

    /// Halo radius in cells
    #[arg(long, default_value_t = 2)]
    aoi: i32,

    /// Wrap the domain into a torus
    #[arg(long)]
    torus: bool,

    /// Partitioning policy
    #[arg(long, value_enum, default_value_t = Policy::QuadTree)]
    policy: Policy,

    /// Agents seeded by the root
    #[arg(short, long, default_value_t = 200)]
    agents: usize,

    /// Largest jump per step along each axis
    #[arg(long, default_value_t = 1.0)]
    reach: f64,

    /// Stop once the next event would fire at or after this time
    #[arg(short, long, default_value_t = 20.0)]
    end_time: f64,

    /// Master seed
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Check load balance every N steps (off when omitted)
    #[arg(long)]
    balance_interval: Option<u64>,

    /// Max/mean cost ratio that triggers a rebalance
    #[arg(long, default_value_t = 1.25)]
    skew: f64,

    /// Cost each process reports to the balancer
    #[arg(long, value_enum, default_value_t = Metric::AgentCount)]
    metric: Metric,

    /// Seconds to wait in a collective before giving up
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Debug-level logging unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> Result<ClusterConfig, ConfigError> {
        let config = ClusterConfig {
            domain: self.domain.clone(),
            aoi: self.aoi,
            num_processes: self.processes,
            toroidal: self.torus,
            policy: self.policy.into(),
            balance: self.balance_interval.map(|interval| BalanceConfig {
                interval,
                skew_threshold: self.skew,
                metric: self.metric.into(),
                ..BalanceConfig::default()
            }),
            collective_timeout: Duration::from_secs(self.timeout),
            seed: self.seed,
            end_time: Some(self.end_time),
            ..ClusterConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

/// What one process reports when the run ends.
#[derive(Debug)]
struct Summary {
    pid: ProcessId,
    partition: Rect,
    agents: usize,
    steps: u64,
    table_version: u64,
}

#[derive(Debug)]
enum RunError {
    Sim { pid: ProcessId, error: SimError },
    Panicked { pid: ProcessId },
    Spawn(std::io::Error),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sim { pid, error } => write!(f, "process {pid}: {error}"),
            Self::Panicked { pid } => write!(f, "process {pid} panicked"),
            Self::Spawn(e) => write!(f, "failed to start a process thread: {e}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sim { error, .. } => Some(error),
            Self::Spawn(e) => Some(e),
            Self::Panicked { .. } => None,
        }
    }
}

fn registry() -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry.register::<Drifter>();
    registry
}

/// Body of one process thread.
fn process(mut sim: DistributedSimState, args: &Args) -> Result<Summary, SimError> {
    let bodies = sim.register_continuous::<f64>("bodies")?;
    if sim.pid().is_root() {
        let world = sim.table().world().clone();
        let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
        for _ in 0..args.agents {
            let position: Vec<f64> = (0..world.ndim())
                .map(|a| rng.gen_range(world.min[a] as f64..world.max[a] as f64))
                .collect();
            sim.add_agent_in(
                Drifter::new(args.reach, args.torus),
                bodies,
                &position,
                1.0,
                Some(ScheduleParams::repeating(0.0, 1.0, 0)),
            )?;
        }
        info!(agents = args.agents, "seeded");
    }
    let steps = sim.run()?;
    let summary = Summary {
        pid: sim.pid(),
        partition: sim.get_local_partition().clone(),
        agents: sim.agent_count(),
        steps,
        table_version: sim.table().version(),
    };
    sim.shutdown()?;
    Ok(summary)
}

fn run(args: Args, config: ClusterConfig) -> Result<Vec<Summary>, RunError> {
    let args = Arc::new(args);
    let endpoints = LocalCluster::endpoints(config.num_processes, config.collective_timeout);
    let directory: Arc<dyn EndpointDirectory> = Arc::new(LocalDirectory::new());
    let mut handles = Vec::with_capacity(endpoints.len());
    for (p, endpoint) in endpoints.into_iter().enumerate() {
        let pid = ProcessId(p as u32);
        let config = config.clone();
        let directory = Arc::clone(&directory);
        let args = Arc::clone(&args);
        let handle = thread::Builder::new()
            .name(format!("p{p}"))
            .spawn(move || {
                let sim = DistributedSimState::new(config, Box::new(endpoint), directory, registry())?;
                process(sim, &args)
            })
            .map_err(RunError::Spawn)?;
        handles.push((pid, handle));
    }

    let mut summaries = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for (pid, handle) in handles {
        let outcome = match handle.join() {
            Ok(Ok(summary)) => {
                summaries.push(summary);
                continue;
            }
            Ok(Err(error)) => RunError::Sim { pid, error },
            Err(_) => RunError::Panicked { pid },
        };
        error!(error = %outcome, "process failed");
        first_error.get_or_insert(outcome);
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(summaries),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match args.config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(
        domain = ?config.domain,
        processes = config.num_processes,
        policy = %config.policy,
        toroidal = config.toroidal,
        "starting cluster"
    );

    let started = Instant::now();
    let summaries = match run(args, config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "run failed");
            return ExitCode::FAILURE;
        }
    };

    println!("{:>7}  {:<28}  {:>7}  {:>6}  {:>7}", "process", "partition", "agents", "steps", "table");
    for s in &summaries {
        println!(
            "{:>7}  {:<28}  {:>7}  {:>6}  {:>7}",
            s.pid.to_string(),
            s.partition.to_string(),
            s.agents,
            s.steps,
            s.table_version
        );
    }
    let total: usize = summaries.iter().map(|s| s.agents).sum();
    println!("{total} agents in {:.2?}", started.elapsed());
    ExitCode::SUCCESS
}
