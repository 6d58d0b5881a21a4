//! The [`PartitionScheme`] trait and the policy selector.

use std::fmt;

use halo_core::Rect;

use crate::error::PartitionError;
use crate::quadtree::QuadTree;
use crate::table::PartitionTable;
use crate::uniform::UniformGrid;

/// Which decomposition a run starts from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PartitionPolicy {
    /// Static slabs, roughly `P^(1/n)` per axis. Rebalancing shifts cuts.
    UniformGrid,
    /// Quad tree with movable split points.
    #[default]
    QuadTree,
}

impl fmt::Display for PartitionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UniformGrid => write!(f, "uniform-grid"),
            Self::QuadTree => write!(f, "quad-tree"),
        }
    }
}

/// A decomposition strategy that owns the current partition table.
///
/// Implementations must be deterministic: every process feeds the same
/// all-gathered costs to its own scheme instance and must arrive at the
/// same table.
pub trait PartitionScheme: Send + Sync + 'static {
    /// The policy this scheme implements.
    fn policy(&self) -> PartitionPolicy;

    /// The current table.
    fn table(&self) -> &PartitionTable;

    /// Propose and adopt a table that better balances `costs` (indexed
    /// by process id).
    ///
    /// Returns `Ok(None)` if nothing changes. On error the scheme keeps
    /// its previous table.
    fn rebalance(&mut self, costs: &[f64]) -> Result<Option<PartitionTable>, PartitionError>;
}

impl PartitionScheme for UniformGrid {
    fn policy(&self) -> PartitionPolicy {
        PartitionPolicy::UniformGrid
    }

    fn table(&self) -> &PartitionTable {
        UniformGrid::table(self)
    }

    fn rebalance(&mut self, costs: &[f64]) -> Result<Option<PartitionTable>, PartitionError> {
        UniformGrid::rebalance(self, costs)
    }
}

impl PartitionScheme for QuadTree {
    fn policy(&self) -> PartitionPolicy {
        PartitionPolicy::QuadTree
    }

    fn table(&self) -> &PartitionTable {
        QuadTree::table(self)
    }

    fn rebalance(&mut self, costs: &[f64]) -> Result<Option<PartitionTable>, PartitionError> {
        self.balance(costs)
    }
}

/// Build the initial decomposition for a run.
pub fn build_scheme(
    policy: PartitionPolicy,
    world: Rect,
    aoi: i32,
    toroidal: bool,
    num_processes: usize,
) -> Result<Box<dyn PartitionScheme>, PartitionError> {
    Ok(match policy {
        PartitionPolicy::UniformGrid => {
            Box::new(UniformGrid::new(world, aoi, toroidal, num_processes)?)
        }
        PartitionPolicy::QuadTree => Box::new(QuadTree::uniform(world, aoi, toroidal, num_processes)?),
    })
}
