//! Halo: distributed agent-based simulation over halo-partitioned spaces.
//!
//! This is the top-level facade crate that re-exports the public API of
//! the Halo sub-crates.
//!
//! # Quick start
//!
//! ```rust
//! use std::io::{Read, Write};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use halo::prelude::*;
//! use halo::types::codec::{read_u32_le, write_u32_le};
//!
//! // An agent that counts its own steps.
//! struct Counter(u32);
//!
//! impl Agent for Counter {
//!     fn kind(&self) -> &'static str { Self::KIND }
//!     fn step(&mut self, _ctx: &mut StepContext<'_>) -> Result<(), SimError> {
//!         self.0 += 1;
//!         Ok(())
//!     }
//!     fn encode(&self, w: &mut dyn Write) -> Result<(), WireError> {
//!         write_u32_le(w, self.0)
//!     }
//! }
//!
//! impl AgentKind for Counter {
//!     const KIND: &'static str = "counter";
//!     fn decode(r: &mut dyn Read) -> Result<Self, WireError> {
//!         Ok(Counter(read_u32_le(r)?))
//!     }
//! }
//!
//! let config = ClusterConfig {
//!     domain: vec![32, 32],
//!     end_time: Some(5.0),
//!     ..ClusterConfig::default()
//! };
//! let endpoint = LocalCluster::endpoints(1, Duration::from_secs(5)).remove(0);
//! let mut registry = AgentRegistry::new();
//! registry.register::<Counter>();
//! let mut sim = DistributedSimState::new(
//!     config,
//!     Box::new(endpoint),
//!     Arc::new(LocalDirectory::new()),
//!     registry,
//! )
//! .unwrap();
//! sim.add_agent(Counter(0), &[3.5, 7.0], Some(ScheduleParams::repeating(0.0, 1.0, 0)))
//!     .unwrap();
//! assert_eq!(sim.run().unwrap(), 5);
//! sim.shutdown().unwrap();
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `halo-core` | Ids, rectangles, schedule parameters, wire codec |
//! | [`partition`] | `halo-partition` | Partition tables and schemes |
//! | [`field`] | `halo-field` | Halo-backed dense grids and continuous spaces |
//! | [`comm`] | `halo-comm` | Transports, messages and remote fetches |
//! | [`engine`] | `halo-engine` | The lock-step driver |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core ids, geometry, time and the wire codec (`halo-core`).
pub use halo_core as types;

/// Partition tables and the [`partition::UniformGrid`] and
/// [`partition::QuadTree`] schemes (`halo-partition`).
pub use halo_partition as partition;

/// Halo-backed fields (`halo-field`).
///
/// [`field::DenseGrid`] stores one value per cell,
/// [`field::ContinuousStorage`] stores objects at real-valued positions.
pub use halo_field as field;

/// Transports and the remote field proxy (`halo-comm`).
pub use halo_comm as comm;

/// The distributed step driver (`halo-engine`).
pub use halo_engine as engine;

/// Common imports for typical Halo usage.
pub mod prelude {
    // Core types
    pub use halo_core::{
        AgentId, FieldIndex, FieldValue, Position, ProcessId, Rect, ScheduleParams, StepId,
        WireError, AFTER_SIMULATION, EPOCH,
    };

    // Partitioning
    pub use halo_partition::{PartitionPolicy, PartitionTable};

    // Fields
    pub use halo_field::{ContinuousStorage, DenseGrid, FieldHandle, HaloField};

    // Communication
    pub use halo_comm::{LocalCluster, LocalDirectory, Transport};

    // Engine
    pub use halo_engine::{
        Agent, AgentKind, AgentRegistry, BalanceConfig, ClusterConfig, CostMetric,
        DistributedSimState, SimError, StepContext, StepMetrics,
    };
}
