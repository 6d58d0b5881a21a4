//! Static uniform grid decomposition with cost-driven cut shifting.

use halo_core::{Coord, ProcessId, Rect};
use smallvec::smallvec;

use crate::error::PartitionError;
use crate::table::PartitionTable;

/// Splits each axis into a fixed number of slices.
///
/// The slice counts multiply to the process count and are chosen so
/// slices stay as square as possible (roughly `P^(1/n)` per axis).
/// Process ids are assigned in row-major order over the slice grid, last
/// axis fastest.
///
/// Rebalancing keeps the slice counts and moves the cut positions so
/// that each slab along an axis carries the same share of the measured
/// cost.
#[derive(Clone, Debug)]
pub struct UniformGrid {
    splits: Vec<usize>,
    cuts: Vec<Vec<i32>>,
    table: PartitionTable,
}

impl UniformGrid {
    /// Decompose `world` into `num_processes` slabs.
    pub fn new(
        world: Rect,
        aoi: i32,
        toroidal: bool,
        num_processes: usize,
    ) -> Result<Self, PartitionError> {
        if world.ndim() == 0 || world.is_empty() {
            return Err(PartitionError::EmptyDomain);
        }
        if num_processes == 0 {
            return Err(PartitionError::ZeroProcesses);
        }
        let mut splits = vec![1usize; world.ndim()];
        for p in prime_factors(num_processes) {
            // Give the factor to the axis with the widest current slabs.
            let axis = (0..world.ndim())
                .max_by(|&a, &b| {
                    let wa = world.extent(a) as f64 / splits[a] as f64;
                    let wb = world.extent(b) as f64 / splits[b] as f64;
                    wa.total_cmp(&wb).then(b.cmp(&a))
                })
                .unwrap_or(0);
            splits[axis] *= p;
        }
        for (a, &s) in splits.iter().enumerate() {
            if (world.extent(a) as usize) < s {
                return Err(PartitionError::NotSplittable {
                    detail: format!("axis {a} of extent {} cannot hold {s} slabs", world.extent(a)),
                });
            }
        }
        let cuts: Vec<Vec<i32>> = splits
            .iter()
            .enumerate()
            .map(|(a, &s)| {
                (0..=s)
                    .map(|i| world.min[a] + (world.extent(a) as i64 * i as i64 / s as i64) as i32)
                    .collect()
            })
            .collect();
        // Slabs thinner than the halo fail validation as `AoiTooLarge`.
        let table = build_table(&world, aoi, toroidal, &splits, &cuts)?;
        Ok(Self {
            splits,
            cuts,
            table,
        })
    }

    /// Number of slabs along each axis.
    pub fn splits(&self) -> &[usize] {
        &self.splits
    }

    /// Cut positions along `axis`, including both domain edges.
    pub fn cuts(&self, axis: usize) -> &[i32] {
        &self.cuts[axis]
    }

    /// The current table.
    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    /// Slab index of `pid` along every axis.
    pub fn slab_of(&self, pid: ProcessId) -> Coord {
        slab_index(&self.splits, pid.index())
    }

    /// Move cuts so the per-slab cost sums are equalised.
    ///
    /// Cost is assumed uniform inside each current slab. Returns the new
    /// table if any cut moved. The grid is left untouched on error.
    pub fn rebalance(&mut self, costs: &[f64]) -> Result<Option<PartitionTable>, PartitionError> {
        let n = self.table.num_processes();
        if costs.len() != n {
            return Err(PartitionError::CostLengthMismatch {
                expected: n,
                got: costs.len(),
            });
        }
        let world = self.table.world().clone();
        let min_width = min_width(self.table.aoi());
        let mut new_cuts = self.cuts.clone();
        for (a, cuts) in new_cuts.iter_mut().enumerate() {
            let s = self.splits[a];
            if s < 2 {
                continue;
            }
            let mut slab_cost = vec![0.0f64; s];
            for (pid, &c) in costs.iter().enumerate() {
                slab_cost[slab_index(&self.splits, pid)[a] as usize] += c.max(0.0);
            }
            let total: f64 = slab_cost.iter().sum();
            if total <= 0.0 || !total.is_finite() {
                continue;
            }
            let old = &self.cuts[a];
            for (k, cut) in cuts.iter_mut().enumerate().take(s).skip(1) {
                let target = total * k as f64 / s as f64;
                *cut = invert_cumulative(old, &slab_cost, target);
            }
            // Forward then backward pass to restore minimum slab widths.
            for k in 1..s {
                cuts[k] = cuts[k].max(cuts[k - 1] + min_width);
            }
            for k in (1..s).rev() {
                cuts[k] = cuts[k].min(cuts[k + 1] - min_width);
            }
            debug_assert_eq!(cuts[0], world.min[a]);
            debug_assert_eq!(cuts[s], world.max[a]);
        }
        if new_cuts == self.cuts {
            return Ok(None);
        }
        let table = build_table(
            &world,
            self.table.aoi(),
            self.table.is_toroidal(),
            &self.splits,
            &new_cuts,
        )?
        .with_version(self.table.version() + 1);
        self.cuts = new_cuts;
        self.table = table.clone();
        Ok(Some(table))
    }
}

/// Smallest legal partition extent for a halo radius.
pub(crate) fn min_width(aoi: i32) -> i32 {
    (2 * aoi).max(1)
}

fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut d = 2;
    while d * d <= n {
        while n % d == 0 {
            out.push(d);
            n /= d;
        }
        d += 1;
    }
    if n > 1 {
        out.push(n);
    }
    out.sort_unstable_by(|a, b| b.cmp(a));
    out
}

fn slab_index(splits: &[usize], pid: usize) -> Coord {
    let mut idx: Coord = smallvec![0; splits.len()];
    let mut rest = pid;
    for a in (0..splits.len()).rev() {
        idx[a] = (rest % splits[a]) as i32;
        rest /= splits[a];
    }
    idx
}

fn build_table(
    world: &Rect,
    aoi: i32,
    toroidal: bool,
    splits: &[usize],
    cuts: &[Vec<i32>],
) -> Result<PartitionTable, PartitionError> {
    let n: usize = splits.iter().product();
    let rects = (0..n)
        .map(|pid| {
            let idx = slab_index(splits, pid);
            let min = (0..splits.len()).map(|a| cuts[a][idx[a] as usize]).collect();
            let max = (0..splits.len()).map(|a| cuts[a][idx[a] as usize + 1]).collect();
            Rect::new(min, max)
        })
        .collect();
    PartitionTable::new(world.clone(), aoi, toroidal, rects)
}

/// Position along an axis where the piecewise-linear cumulative cost
/// reaches `target`.
fn invert_cumulative(cuts: &[i32], slab_cost: &[f64], target: f64) -> i32 {
    let mut acc = 0.0;
    for (i, &c) in slab_cost.iter().enumerate() {
        if acc + c >= target && c > 0.0 {
            let frac = (target - acc) / c;
            let lo = cuts[i] as f64;
            let hi = cuts[i + 1] as f64;
            return (lo + frac * (hi - lo)).round() as i32;
        }
        acc += c;
    }
    cuts[cuts.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world(w: i32, h: i32) -> Rect {
        Rect::from_extents(&[w, h])
    }

    #[test]
    fn four_processes_make_a_two_by_two_grid() {
        let g = UniformGrid::new(world(100, 100), 5, true, 4).unwrap();
        assert_eq!(g.splits(), &[2, 2]);
        let t = g.table();
        assert_eq!(t.rect(ProcessId(0)).unwrap(), &Rect::new(smallvec![0, 0], smallvec![50, 50]));
        assert_eq!(t.rect(ProcessId(1)).unwrap(), &Rect::new(smallvec![0, 50], smallvec![50, 100]));
        assert_eq!(t.rect(ProcessId(2)).unwrap(), &Rect::new(smallvec![50, 0], smallvec![100, 50]));
        assert_eq!(g.slab_of(ProcessId(3)).as_slice(), &[1, 1]);
    }

    #[test]
    fn prime_counts_split_the_long_axis() {
        let g = UniformGrid::new(world(90, 30), 1, false, 3).unwrap();
        assert_eq!(g.splits(), &[3, 1]);
        assert_eq!(g.cuts(0), &[0, 30, 60, 90]);
    }

    #[test]
    fn uneven_extents_still_tile() {
        let g = UniformGrid::new(world(101, 37), 2, false, 6).unwrap();
        g.table().validate().unwrap();
        assert_eq!(g.table().num_processes(), 6);
    }

    #[test]
    fn too_many_processes_for_the_aoi() {
        let err = UniformGrid::new(world(20, 20), 5, false, 9).unwrap_err();
        assert!(matches!(
            err,
            PartitionError::AoiTooLarge {
                aoi: 5,
                min_extent: 6,
                ..
            }
        ));
    }

    #[test]
    fn more_slabs_than_cells_cannot_split() {
        let err = UniformGrid::new(world(3, 1), 0, false, 5).unwrap_err();
        assert!(matches!(err, PartitionError::NotSplittable { .. }));
    }

    #[test]
    fn rebalance_moves_cut_towards_the_hot_slab() {
        let mut g = UniformGrid::new(world(100, 10), 2, false, 2).unwrap();
        assert_eq!(g.cuts(0), &[0, 50, 100]);
        let table = g.rebalance(&[3.0, 1.0]).unwrap().unwrap();
        // Cumulative cost hits 2.0 two thirds into the first slab.
        assert_eq!(g.cuts(0), &[0, 33, 100]);
        assert_eq!(table.version(), 1);
        table.validate().unwrap();
    }

    #[test]
    fn balanced_costs_leave_the_grid_alone() {
        let mut g = UniformGrid::new(world(100, 100), 2, false, 4).unwrap();
        assert_eq!(g.rebalance(&[1.0; 4]).unwrap(), None);
        assert_eq!(g.rebalance(&[0.0; 4]).unwrap(), None);
    }

    #[test]
    fn rebalance_respects_minimum_width() {
        let mut g = UniformGrid::new(world(40, 10), 5, false, 2).unwrap();
        g.rebalance(&[1000.0, 0.0]).unwrap();
        assert!(g.cuts(0)[1] >= 10);
        assert!(g.cuts(0)[1] <= 30);
    }

    #[test]
    fn wrong_cost_length_is_an_error() {
        let mut g = UniformGrid::new(world(100, 100), 2, false, 4).unwrap();
        assert!(matches!(
            g.rebalance(&[1.0]),
            Err(PartitionError::CostLengthMismatch { expected: 4, got: 1 })
        ));
    }
}
