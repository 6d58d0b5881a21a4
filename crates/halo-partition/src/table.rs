//! The partition table: who owns what, and who needs whose data.

use std::sync::{Arc, RwLock};

use halo_core::{Coord, Position, PreconditionError, ProcessId, Rect};
use smallvec::SmallVec;

use crate::error::PartitionError;

/// A partition table shared between the step thread and the fetch server.
///
/// Replaced wholesale under the write lock during a rebalance; read
/// everywhere else.
pub type SharedTable = Arc<RwLock<PartitionTable>>;

/// One region of owned data a sender must ship into a receiver's ghost zone.
///
/// `source` is expressed in the sender's (global) frame and `target` in
/// the receiver's halo frame. They differ only by a toroidal wrap shift.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Overlap {
    /// Owned cells of the sender, in global coordinates.
    pub source: Rect,
    /// The same cells as addressed by the receiver's halo storage.
    pub target: Rect,
}

impl Overlap {
    /// Offset that maps `source` onto `target`.
    pub fn shift(&self) -> Coord {
        self.target
            .min
            .iter()
            .zip(self.source.min.iter())
            .map(|(t, s)| t - s)
            .collect()
    }
}

/// The decomposition of the global domain into one rectangle per process.
///
/// Immutable once built. Rebalancing produces a new table with a higher
/// [`version`](PartitionTable::version).
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionTable {
    world: Rect,
    aoi: i32,
    toroidal: bool,
    rects: Vec<Rect>,
    version: u64,
}

impl PartitionTable {
    /// Build and validate a table. `rects[i]` is owned by `ProcessId(i)`.
    pub fn new(
        world: Rect,
        aoi: i32,
        toroidal: bool,
        rects: Vec<Rect>,
    ) -> Result<Self, PartitionError> {
        let table = Self {
            world,
            aoi,
            toroidal,
            rects,
            version: 0,
        };
        table.validate()?;
        Ok(table)
    }

    /// The same table stamped with a different version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// The global domain.
    pub fn world(&self) -> &Rect {
        &self.world
    }

    /// Halo radius in cells.
    pub fn aoi(&self) -> i32 {
        self.aoi
    }

    /// Whether the domain wraps around on every axis.
    pub fn is_toroidal(&self) -> bool {
        self.toroidal
    }

    /// Number of dimensions of the domain.
    pub fn ndim(&self) -> usize {
        self.world.ndim()
    }

    /// Generation counter, bumped on every rebalance.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of partitions (and processes).
    pub fn num_processes(&self) -> usize {
        self.rects.len()
    }

    /// Every owned rectangle, indexed by process id.
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// The owned rectangle of `pid`.
    pub fn rect(&self, pid: ProcessId) -> Option<&Rect> {
        self.rects.get(pid.index())
    }

    /// The halo rectangle of `pid`: its owned rectangle grown by `aoi`.
    ///
    /// On a bounded domain the halo is clipped to the domain. On a
    /// toroidal domain it is left unclipped and cells beyond the domain
    /// edge address the wrapped-around neighbour's data.
    pub fn halo_rect(&self, pid: ProcessId) -> Option<Rect> {
        let grown = self.rect(pid)?.expand(self.aoi);
        if self.toroidal {
            Some(grown)
        } else {
            grown.intersect(&self.world)
        }
    }

    /// Canonical in-domain form of a cell: wrapped on a torus, checked
    /// against the bounds otherwise.
    pub fn canonical_coord(&self, coord: &[i32]) -> Result<Coord, PreconditionError> {
        self.check_dims(coord.len())?;
        if self.toroidal {
            return Ok(self.world.wrap(coord));
        }
        if self.world.contains(coord) {
            Ok(coord.iter().copied().collect())
        } else {
            Err(PreconditionError::OutsideDomain {
                coord: coord.iter().copied().collect(),
                domain: self.world.clone(),
            })
        }
    }

    /// Canonical in-domain form of a real-valued position.
    pub fn canonical_position(&self, position: &[f64]) -> Result<Position, PreconditionError> {
        self.check_dims(position.len())?;
        let outside = || PreconditionError::PositionOutsideDomain {
            position: position.iter().copied().collect(),
            domain: self.world.clone(),
        };
        if position.iter().any(|x| !x.is_finite()) {
            return Err(outside());
        }
        if self.toroidal {
            return Ok(self.world.wrap_position(position));
        }
        if self.world.contains_position(position) {
            Ok(position.iter().copied().collect())
        } else {
            Err(outside())
        }
    }

    /// The process owning cell `coord`.
    ///
    /// A pure function of the coordinate and the table, so two processes
    /// holding equal tables always agree.
    pub fn owner_of(&self, coord: &[i32]) -> Result<ProcessId, PreconditionError> {
        let coord = self.canonical_coord(coord)?;
        self.rects
            .iter()
            .position(|r| r.contains(&coord))
            .map(|i| ProcessId(i as u32))
            .ok_or_else(|| PreconditionError::OutsideDomain {
                coord,
                domain: self.world.clone(),
            })
    }

    /// The process owning the cell that contains `position`.
    pub fn owner_of_position(&self, position: &[f64]) -> Result<ProcessId, PreconditionError> {
        let position = self.canonical_position(position)?;
        self.owner_of(&halo_core::id::cell_of(&position))
    }

    /// Translation offsets under which copies of the domain are visible.
    ///
    /// Just the zero offset on a bounded domain; every combination of
    /// `{-extent, 0, +extent}` per axis on a torus.
    pub fn image_shifts(&self) -> Vec<Coord> {
        let nd = self.ndim();
        if !self.toroidal {
            return vec![SmallVec::from_elem(0, nd)];
        }
        let extents = self.world.extents();
        let mut shifts = vec![Coord::new()];
        for a in 0..nd {
            let mut next = Vec::with_capacity(shifts.len() * 3);
            for s in &shifts {
                for k in [-1, 0, 1] {
                    let mut t = s.clone();
                    t.push(k * extents[a]);
                    next.push(t);
                }
            }
            shifts = next;
        }
        shifts
    }

    /// The regions of `sender`'s owned data that land in `receiver`'s
    /// ghost zone.
    ///
    /// With `sender == receiver` this lists the wrap-around copies a
    /// partition spanning a whole toroidal axis must make of itself.
    pub fn overlaps(&self, sender: ProcessId, receiver: ProcessId) -> Vec<Overlap> {
        let (Some(owned), Some(halo)) = (self.rect(sender), self.halo_rect(receiver)) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for shift in self.image_shifts() {
            let is_identity = shift.iter().all(|&s| s == 0);
            if sender == receiver && is_identity {
                continue;
            }
            if let Some(target) = owned.shifted(&shift).intersect(&halo) {
                let back: Coord = shift.iter().map(|s| -s).collect();
                out.push(Overlap {
                    source: target.shifted(&back),
                    target,
                });
            }
        }
        out
    }

    /// Other processes whose data appears in `pid`'s halo.
    ///
    /// The relation is symmetric: `q` is a neighbour of `p` exactly when
    /// `p` is a neighbour of `q`.
    pub fn neighbors(&self, pid: ProcessId) -> Vec<ProcessId> {
        (0..self.num_processes() as u32)
            .map(ProcessId)
            .filter(|&q| q != pid && !self.overlaps(q, pid).is_empty())
            .collect()
    }

    /// Check the tiling and AOI invariants.
    ///
    /// Every rectangle must be non-empty and inside the domain, no two
    /// may overlap, together they must cover the domain, and each must be
    /// at least `2 * aoi` wide on every axis.
    pub fn validate(&self) -> Result<(), PartitionError> {
        if self.world.ndim() == 0 || self.world.is_empty() {
            return Err(PartitionError::EmptyDomain);
        }
        if self.rects.is_empty() {
            return Err(PartitionError::ZeroProcesses);
        }
        if self.aoi < 0 {
            return Err(PartitionError::NotSplittable {
                detail: format!("negative aoi {}", self.aoi),
            });
        }
        let mut total = 0usize;
        for (i, r) in self.rects.iter().enumerate() {
            if r.ndim() != self.world.ndim() || r.is_empty() || !self.world.contains_rect(r) {
                return Err(PartitionError::CoverageViolation {
                    detail: format!("partition {i} {r} is empty or leaves the domain {}", self.world),
                });
            }
            if 2 * self.aoi > r.min_extent() {
                return Err(PartitionError::AoiTooLarge {
                    pid: ProcessId(i as u32),
                    aoi: self.aoi,
                    min_extent: r.min_extent(),
                });
            }
            total += r.volume();
        }
        for (i, a) in self.rects.iter().enumerate() {
            for (j, b) in self.rects.iter().enumerate().skip(i + 1) {
                if let Some(overlap) = a.intersect(b) {
                    return Err(PartitionError::CoverageViolation {
                        detail: format!("partitions {i} and {j} overlap on {overlap}"),
                    });
                }
            }
        }
        if total != self.world.volume() {
            return Err(PartitionError::CoverageViolation {
                detail: format!(
                    "partitions cover {total} cells, domain has {}",
                    self.world.volume()
                ),
            });
        }
        Ok(())
    }

    fn check_dims(&self, got: usize) -> Result<(), PreconditionError> {
        if got == self.ndim() {
            Ok(())
        } else {
            Err(PreconditionError::DimensionMismatch {
                expected: self.ndim(),
                got,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn r(min: [i32; 2], max: [i32; 2]) -> Rect {
        Rect::new(smallvec![min[0], min[1]], smallvec![max[0], max[1]])
    }

    fn quads(toroidal: bool) -> PartitionTable {
        PartitionTable::new(
            r([0, 0], [100, 100]),
            5,
            toroidal,
            vec![
                r([0, 0], [50, 50]),
                r([0, 50], [50, 100]),
                r([50, 0], [100, 50]),
                r([50, 50], [100, 100]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn gaps_are_rejected() {
        let err = PartitionTable::new(
            r([0, 0], [10, 10]),
            0,
            false,
            vec![r([0, 0], [5, 10]), r([6, 0], [10, 10])],
        )
        .unwrap_err();
        assert!(matches!(err, PartitionError::CoverageViolation { .. }));
    }

    #[test]
    fn overlapping_partitions_are_rejected() {
        let err = PartitionTable::new(
            r([0, 0], [10, 10]),
            0,
            false,
            vec![r([0, 0], [6, 10]), r([5, 0], [10, 10])],
        )
        .unwrap_err();
        assert!(matches!(err, PartitionError::CoverageViolation { .. }));
    }

    #[test]
    fn oversized_aoi_is_flagged() {
        let err = PartitionTable::new(
            r([0, 0], [10, 10]),
            3,
            false,
            vec![r([0, 0], [5, 10]), r([5, 0], [10, 10])],
        )
        .unwrap_err();
        assert!(matches!(err, PartitionError::AoiTooLarge { min_extent: 5, .. }));
    }

    #[test]
    fn owner_lookup_and_domain_errors() {
        let t = quads(false);
        assert_eq!(t.owner_of(&[49, 50]).unwrap(), ProcessId(1));
        assert_eq!(t.owner_of_position(&[50.1, 50.0]).unwrap(), ProcessId(3));
        assert!(matches!(
            t.owner_of(&[100, 0]),
            Err(PreconditionError::OutsideDomain { .. })
        ));
        assert!(matches!(
            t.owner_of_position(&[1.0]),
            Err(PreconditionError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn toroidal_owner_wraps() {
        let t = quads(true);
        assert_eq!(t.owner_of(&[-1, -1]).unwrap(), ProcessId(3));
        assert_eq!(t.owner_of_position(&[100.5, 10.0]).unwrap(), ProcessId(0));
    }

    #[test]
    fn bounded_halo_is_clipped() {
        let t = quads(false);
        assert_eq!(t.halo_rect(ProcessId(0)).unwrap(), r([0, 0], [55, 55]));
        let t = quads(true);
        assert_eq!(t.halo_rect(ProcessId(0)).unwrap(), r([-5, -5], [55, 55]));
    }

    #[test]
    fn overlaps_fill_the_ghost_zone_exactly() {
        for toroidal in [false, true] {
            let t = quads(toroidal);
            for p in 0..4u32 {
                let pid = ProcessId(p);
                let owned = t.rect(pid).unwrap().clone();
                let halo = t.halo_rect(pid).unwrap();
                let mut covered = 0;
                for q in 0..4u32 {
                    for o in t.overlaps(ProcessId(q), pid) {
                        assert!(halo.contains_rect(&o.target));
                        assert!(owned.intersect(&o.target).is_none());
                        assert!(t.rect(ProcessId(q)).unwrap().contains_rect(&o.source));
                        covered += o.target.volume();
                    }
                }
                assert_eq!(covered, halo.volume() - owned.volume(), "pid {p} toroidal {toroidal}");
            }
        }
    }

    #[test]
    fn single_partition_on_torus_is_its_own_neighbour() {
        let t = PartitionTable::new(r([0, 0], [10, 10]), 2, true, vec![r([0, 0], [10, 10])]).unwrap();
        let own = t.overlaps(ProcessId(0), ProcessId(0));
        assert_eq!(own.len(), 8);
        assert!(t.neighbors(ProcessId(0)).is_empty());
        let wrapped = own
            .iter()
            .find(|o| o.target == r([-2, 0], [0, 10]))
            .unwrap();
        assert_eq!(wrapped.source, r([8, 0], [10, 10]));
        assert_eq!(wrapped.shift().as_slice(), &[-10, 0]);
    }

    #[test]
    fn neighbours_are_symmetric() {
        let t = quads(false);
        for p in 0..4u32 {
            for q in t.neighbors(ProcessId(p)) {
                assert!(t.neighbors(q).contains(&ProcessId(p)));
            }
        }
        assert_eq!(t.neighbors(ProcessId(0)).len(), 3);
    }
}
