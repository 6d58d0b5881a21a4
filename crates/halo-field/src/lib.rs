//! Halo-extended field storage for the Halo framework.
//!
//! A [`HaloField`] wraps process-local storage sized to the partition's
//! halo rectangle. The owned zone may be mutated freely; the ghost zone
//! is a read-only copy of neighbour data refreshed by the synchronizer.
//! Reads outside the halo fall back to a [`RemoteSource`].
//!
//! Storage is pluggable through the [`Storage`] trait. The halo logic is
//! written once against that trait and specialised accessors are provided
//! for [`DenseGrid`] and [`ContinuousStorage`].

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod continuous;
pub mod dense;
pub mod erased;
pub mod error;
pub mod halo;
pub mod registry;
pub mod storage;

pub use continuous::ContinuousStorage;
pub use dense::DenseGrid;
pub use erased::{CellSource, DynField};
pub use error::FieldError;
pub use halo::{HaloField, RemoteSource};
pub use registry::{FieldHandle, FieldSet};
pub use storage::Storage;
