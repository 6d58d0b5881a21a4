//! Dense cell-array storage.

use std::io::{Read, Write};

use halo_core::codec::{read_len, write_len};
use halo_core::{FieldValue, Rect, WireError};

use crate::storage::Storage;

/// One value per cell of the halo rectangle, row-major, last axis fastest.
#[derive(Clone, Debug)]
pub struct DenseGrid<T> {
    bounds: Rect,
    cells: Vec<T>,
}

impl<T: FieldValue + Default> DenseGrid<T> {
    /// A grid over `bounds` filled with `T::default()`.
    pub fn new(bounds: Rect) -> Self {
        let cells = vec![T::default(); bounds.volume()];
        Self { bounds, cells }
    }

    /// The value at `coord`, or `None` outside the bounds.
    pub fn get(&self, coord: &[i32]) -> Option<&T> {
        self.bounds.linear_index(coord).map(|i| &self.cells[i])
    }

    /// Overwrite the value at `coord`. Returns `false` outside the bounds.
    pub fn set(&mut self, coord: &[i32], value: T) -> bool {
        match self.bounds.linear_index(coord) {
            Some(i) => {
                self.cells[i] = value;
                true
            }
            None => false,
        }
    }
}

impl<T: FieldValue + Default> Storage for DenseGrid<T> {
    fn bounds(&self) -> &Rect {
        &self.bounds
    }

    fn reshape(&mut self, bounds: Rect) {
        *self = Self::new(bounds);
    }

    fn pack(&self, region: &Rect, w: &mut dyn Write) -> Result<(), WireError> {
        if !self.bounds.contains_rect(region) {
            return Err(WireError::Malformed {
                detail: format!("pack region {region} leaves grid bounds {}", self.bounds),
            });
        }
        write_len(w, region.volume())?;
        for cell in region.cells() {
            if let Some(v) = self.get(&cell) {
                v.encode(w)?;
            }
        }
        Ok(())
    }

    fn unpack(&mut self, region: &Rect, _shift: &[i32], r: &mut dyn Read) -> Result<(), WireError> {
        let len = read_len(r)?;
        if len != region.volume() || !self.bounds.contains_rect(region) {
            return Err(WireError::Malformed {
                detail: format!(
                    "{len} cells do not fit region {region} within {}",
                    self.bounds
                ),
            });
        }
        for cell in region.cells() {
            let v = T::decode(r)?;
            self.set(&cell, v);
        }
        Ok(())
    }

    fn clear(&mut self, region: &Rect) {
        for cell in region.cells() {
            self.set(&cell, T::default());
        }
    }

    fn encode_cell(&self, coord: &[i32], w: &mut dyn Write) -> Result<(), WireError> {
        match self.get(coord) {
            Some(v) => v.encode(w),
            None => Err(WireError::Malformed {
                detail: format!("cell {coord:?} outside grid bounds {}", self.bounds),
            }),
        }
    }

    fn count_in(&self, region: &Rect) -> usize {
        self.bounds
            .intersect(region)
            .map(|r| r.volume())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use smallvec::smallvec;

    fn grid() -> DenseGrid<f64> {
        DenseGrid::new(Rect::new(smallvec![-2, -2], smallvec![8, 8]))
    }

    #[test]
    fn indexes_relative_to_halo_origin() {
        let mut g = grid();
        assert!(g.set(&[-2, -2], 1.5));
        assert_eq!(g.cells[0], 1.5);
        assert!(g.set(&[7, 7], 2.5));
        assert_eq!(g.cells[99], 2.5);
        assert!(!g.set(&[8, 0], 1.0));
        assert_eq!(g.get(&[-3, 0]), None);
    }

    #[test]
    fn unpack_applies_packed_region_at_shifted_target() {
        let mut src = grid();
        for (i, cell) in Rect::new(smallvec![4, 0], smallvec![6, 3]).cells().enumerate() {
            src.set(&cell, i as f64);
        }
        let mut buf = Vec::new();
        src.pack(&Rect::new(smallvec![4, 0], smallvec![6, 3]), &mut buf).unwrap();

        let mut dst = grid();
        let target = Rect::new(smallvec![-2, 0], smallvec![0, 3]);
        dst.unpack(&target, &[-6, 0], &mut buf.as_slice()).unwrap();
        assert_eq!(dst.get(&[-2, 0]), Some(&0.0));
        assert_eq!(dst.get(&[-1, 2]), Some(&5.0));
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let src = grid();
        let mut buf = Vec::new();
        src.pack(&Rect::new(smallvec![0, 0], smallvec![2, 2]), &mut buf).unwrap();
        let mut dst = grid();
        let err = dst
            .unpack(&Rect::new(smallvec![0, 0], smallvec![3, 2]), &[0, 0], &mut buf.as_slice())
            .unwrap_err();
        assert!(matches!(err, WireError::Malformed { .. }));
    }

    #[test]
    fn reshape_discards_contents() {
        let mut g = grid();
        g.set(&[0, 0], 9.0);
        g.reshape(Rect::new(smallvec![0, 0], smallvec![4, 4]));
        assert_eq!(g.get(&[0, 0]), Some(&0.0));
        assert_eq!(g.count_in(&Rect::new(smallvec![-5, -5], smallvec![5, 5])), 16);
    }

    proptest! {
        #[test]
        fn packed_regions_land_at_their_shifted_target(
            x in -2i32..6, y in -2i32..6, w in 1i32..3, h in 1i32..3, dx in -2i32..3, dy in -2i32..3,
        ) {
            let mut src = grid();
            for cell in src.bounds().clone().cells() {
                let v = (cell[0] * 100 + cell[1]) as f64;
                src.set(&cell, v);
            }
            let region = Rect::new(smallvec![x, y], smallvec![x + w, y + h]);
            let target = region.shifted(&[dx, dy]);
            prop_assume!(src.bounds().contains_rect(&target));

            let mut buf = Vec::new();
            src.pack(&region, &mut buf).unwrap();
            let mut dst = grid();
            dst.unpack(&target, &[dx, dy], &mut buf.as_slice()).unwrap();
            for cell in region.cells() {
                let moved: Vec<i32> = vec![cell[0] + dx, cell[1] + dy];
                prop_assert_eq!(dst.get(&moved), src.get(&cell));
            }
            prop_assert_eq!(dst.count_in(&target), target.volume());
        }
    }
}
