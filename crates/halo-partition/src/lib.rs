//! Spatial domain decomposition for the Halo framework.
//!
//! A [`PartitionTable`] assigns every cell of the global domain to
//! exactly one process and derives the halo rectangle and neighbour
//! overlaps each process needs. Tables are produced by a
//! [`PartitionScheme`]: either a static [`UniformGrid`] or a
//! [`QuadTree`] whose split points move to follow the load.
//!
//! Every process holds an identical table, and ownership is a pure
//! function of position and table, so any two processes agree on the
//! owner of any point.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod quadtree;
pub mod scheme;
pub mod table;
pub mod uniform;

pub use error::PartitionError;
pub use quadtree::{NodeId, QuadTree};
pub use scheme::{build_scheme, PartitionPolicy, PartitionScheme};
pub use table::{Overlap, PartitionTable, SharedTable};
pub use uniform::UniformGrid;
