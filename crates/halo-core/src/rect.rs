//! Axis-aligned, half-open N-dimensional integer rectangles.

use std::fmt;

use smallvec::SmallVec;

use crate::id::{Coord, Position};

/// An axis-aligned rectangle `[min, max)` in global integer coordinates.
///
/// Every partition, halo region and exchange region is a `Rect`. The
/// bounds are half-open on every axis, so two rectangles that share a
/// face do not overlap. A rectangle with `min[a] == max[a]` on any axis is
/// empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Rect {
    /// Inclusive lower corner.
    pub min: Coord,
    /// Exclusive upper corner.
    pub max: Coord,
}

impl Rect {
    /// Create a rectangle from its corners.
    ///
    /// # Panics
    ///
    /// Panics if the corners have different dimensionality or if
    /// `min[a] > max[a]` on any axis.
    pub fn new(min: Coord, max: Coord) -> Self {
        assert_eq!(min.len(), max.len(), "rect corners differ in dimensionality");
        assert!(
            min.iter().zip(max.iter()).all(|(lo, hi)| lo <= hi),
            "rect min {min:?} exceeds max {max:?}"
        );
        Self { min, max }
    }

    /// The rectangle `[0, extents)`.
    pub fn from_extents(extents: &[i32]) -> Self {
        Self::new(
            SmallVec::from_elem(0, extents.len()),
            extents.iter().copied().collect(),
        )
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.min.len()
    }

    /// Length along one axis.
    pub fn extent(&self, axis: usize) -> i32 {
        self.max[axis] - self.min[axis]
    }

    /// Lengths along every axis.
    pub fn extents(&self) -> Coord {
        (0..self.ndim()).map(|a| self.extent(a)).collect()
    }

    /// The smallest extent over all axes.
    pub fn min_extent(&self) -> i32 {
        (0..self.ndim()).map(|a| self.extent(a)).min().unwrap_or(0)
    }

    /// Number of integer cells covered.
    pub fn volume(&self) -> usize {
        (0..self.ndim())
            .map(|a| self.extent(a).max(0) as usize)
            .product()
    }

    /// Whether the rectangle covers no cells.
    pub fn is_empty(&self) -> bool {
        (0..self.ndim()).any(|a| self.extent(a) <= 0)
    }

    /// Whether the cell `coord` lies inside.
    pub fn contains(&self, coord: &[i32]) -> bool {
        coord.len() == self.ndim()
            && coord
                .iter()
                .enumerate()
                .all(|(a, &c)| c >= self.min[a] && c < self.max[a])
    }

    /// Whether the real-valued point lies inside `[min, max)`.
    pub fn contains_position(&self, position: &[f64]) -> bool {
        position.len() == self.ndim()
            && position
                .iter()
                .enumerate()
                .all(|(a, &x)| x >= self.min[a] as f64 && x < self.max[a] as f64)
    }

    /// Whether `other` lies entirely inside `self`.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.is_empty()
            || (0..self.ndim()).all(|a| other.min[a] >= self.min[a] && other.max[a] <= self.max[a])
    }

    /// The overlap of two rectangles, or `None` if it is empty.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        debug_assert_eq!(self.ndim(), other.ndim());
        let min: Coord = (0..self.ndim())
            .map(|a| self.min[a].max(other.min[a]))
            .collect();
        let max: Coord = (0..self.ndim())
            .map(|a| self.max[a].min(other.max[a]))
            .collect();
        if min.iter().zip(max.iter()).all(|(lo, hi)| lo < hi) {
            Some(Rect { min, max })
        } else {
            None
        }
    }

    /// Grow by `margin` cells on every side of every axis.
    pub fn expand(&self, margin: i32) -> Rect {
        Rect {
            min: self.min.iter().map(|v| v - margin).collect(),
            max: self.max.iter().map(|v| v + margin).collect(),
        }
    }

    /// Translate by `offset`.
    pub fn shifted(&self, offset: &[i32]) -> Rect {
        Rect {
            min: self.min.iter().zip(offset).map(|(v, o)| v + o).collect(),
            max: self.max.iter().zip(offset).map(|(v, o)| v + o).collect(),
        }
    }

    /// Geometric center as a real-valued point.
    pub fn center(&self) -> Position {
        (0..self.ndim())
            .map(|a| (self.min[a] as f64 + self.max[a] as f64) / 2.0)
            .collect()
    }

    /// Row-major offset of `coord` (last axis fastest), or `None` when the
    /// cell lies outside.
    pub fn linear_index(&self, coord: &[i32]) -> Option<usize> {
        if !self.contains(coord) {
            return None;
        }
        let mut idx = 0usize;
        for (a, &c) in coord.iter().enumerate() {
            idx = idx * self.extent(a) as usize + (c - self.min[a]) as usize;
        }
        Some(idx)
    }

    /// Iterate every cell in row-major order (last axis fastest).
    pub fn cells(&self) -> Cells<'_> {
        Cells {
            rect: self,
            next: if self.is_empty() {
                None
            } else {
                Some(self.min.clone())
            },
        }
    }

    /// Map a cell onto the torus `self` (componentwise Euclidean modulo).
    pub fn wrap(&self, coord: &[i32]) -> Coord {
        coord
            .iter()
            .enumerate()
            .map(|(a, &c)| self.min[a] + (c - self.min[a]).rem_euclid(self.extent(a)))
            .collect()
    }

    /// Map a real-valued point onto the torus `self`.
    pub fn wrap_position(&self, position: &[f64]) -> Position {
        position
            .iter()
            .enumerate()
            .map(|(a, &x)| {
                let lo = self.min[a] as f64;
                let w = self.extent(a) as f64;
                let wrapped = lo + (x - lo).rem_euclid(w);
                // rem_euclid can round up to exactly `w` for tiny negatives.
                if wrapped >= lo + w {
                    lo
                } else {
                    wrapped
                }
            })
            .collect()
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for a in 0..self.ndim() {
            if a > 0 {
                write!(f, " x ")?;
            }
            write!(f, "[{}, {})", self.min[a], self.max[a])?;
        }
        Ok(())
    }
}

/// Row-major cell iterator returned by [`Rect::cells`].
pub struct Cells<'a> {
    rect: &'a Rect,
    next: Option<Coord>,
}

impl Iterator for Cells<'_> {
    type Item = Coord;

    fn next(&mut self) -> Option<Coord> {
        let current = self.next.take()?;
        let mut succ = current.clone();
        let mut axis = self.rect.ndim();
        while axis > 0 {
            axis -= 1;
            succ[axis] += 1;
            if succ[axis] < self.rect.max[axis] {
                self.next = Some(succ);
                return Some(current);
            }
            succ[axis] = self.rect.min[axis];
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use smallvec::smallvec;

    fn r(min: [i32; 2], max: [i32; 2]) -> Rect {
        Rect::new(smallvec![min[0], min[1]], smallvec![max[0], max[1]])
    }

    #[test]
    fn touching_rects_do_not_intersect() {
        assert_eq!(r([0, 0], [5, 5]).intersect(&r([5, 0], [10, 5])), None);
    }

    #[test]
    fn intersect_is_the_overlap() {
        let i = r([0, 0], [6, 6]).intersect(&r([4, 2], [10, 3])).unwrap();
        assert_eq!(i, r([4, 2], [6, 3]));
        assert_eq!(i.volume(), 2);
    }

    #[test]
    fn expand_then_contains() {
        let halo = r([10, 10], [20, 20]).expand(2);
        assert_eq!(halo, r([8, 8], [22, 22]));
        assert!(halo.contains_rect(&r([10, 10], [20, 20])));
    }

    #[test]
    fn cells_are_row_major() {
        let cells: Vec<Coord> = r([0, 0], [2, 3]).cells().collect();
        assert_eq!(cells.len(), 6);
        assert_eq!(cells[1].as_slice(), &[0, 1]);
        assert_eq!(cells[3].as_slice(), &[1, 0]);
        for (i, c) in cells.iter().enumerate() {
            assert_eq!(r([0, 0], [2, 3]).linear_index(c), Some(i));
        }
    }

    #[test]
    fn empty_rect_yields_no_cells() {
        assert_eq!(r([3, 3], [3, 7]).cells().count(), 0);
    }

    #[test]
    fn wrap_handles_both_sides() {
        let world = r([0, 0], [100, 100]);
        assert_eq!(world.wrap(&[-1, 100]).as_slice(), &[99, 0]);
        let p = world.wrap_position(&[-0.5, 100.25]);
        assert!((p[0] - 99.5).abs() < 1e-12);
        assert!((p[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn display_lists_every_axis() {
        assert_eq!(r([0, 1], [2, 3]).to_string(), "[0, 2) x [1, 3)");
    }

    proptest! {
        #[test]
        fn wrapped_positions_land_inside(x in -1e4f64..1e4, y in -1e4f64..1e4) {
            let world = r([0, 0], [37, 91]);
            let p = world.wrap_position(&[x, y]);
            prop_assert!(world.contains_position(&p), "{p:?}");
        }

        #[test]
        fn intersection_is_contained_in_both(
            a0 in -20i32..20, a1 in -20i32..20, aw in 1i32..20, ah in 1i32..20,
            b0 in -20i32..20, b1 in -20i32..20, bw in 1i32..20, bh in 1i32..20,
        ) {
            let a = r([a0, a1], [a0 + aw, a1 + ah]);
            let b = r([b0, b1], [b0 + bw, b1 + bh]);
            if let Some(i) = a.intersect(&b) {
                prop_assert!(a.contains_rect(&i));
                prop_assert!(b.contains_rect(&i));
            }
        }
    }
}
