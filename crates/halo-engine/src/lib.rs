//! Lock-step distributed step driver for Halo simulations.
//!
//! One [`DistributedSimState`] runs per process (in the shipped
//! transport, per thread). Each call to
//! [`step()`](DistributedSimState::step) executes every local event at the
//! agreed global time, exchanges halos with neighbours, migrates agents
//! that crossed a partition boundary, agrees on the next global time and,
//! when due, rebalances the partition table:
//!
//! ```text
//! LOCAL_STEP -> HALO_SYNC -> MIGRATION_FLUSH -> [HALO_SYNC] -> GLOBAL_TIME_BARRIER -> [REBALANCE]
//! ```
//!
//! [`Synchronizer`], [`ObjectMigrator`] and [`LoadBalancer`] implement the
//! collective phases. [`ClusterContext`] holds the per-process handles
//! with an explicit init/shutdown lifecycle.
//!
//! Model code plugs in through the [`Agent`] trait and the field handles
//! returned at registration time.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod agent;
pub mod balancer;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod migrator;
pub mod schedule;
pub mod state;
pub mod sync;

pub use agent::{Agent, AgentKind, AgentRegistry, StepContext};
pub use balancer::LoadBalancer;
pub use config::{BalanceConfig, ClusterConfig, ConfigError, CostMetric};
pub use context::ClusterContext;
pub use error::SimError;
pub use metrics::StepMetrics;
pub use migrator::{Inbound, ObjectMigrator};
pub use schedule::Schedule;
pub use state::DistributedSimState;
pub use sync::{SyncReport, Synchronizer};
