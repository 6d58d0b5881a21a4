//! Type-erased views of halo fields.
//!
//! The synchronizer, migrator and fetch server handle every registered
//! field uniformly through [`DynField`] and [`CellSource`]; user code gets
//! the concrete [`HaloField`] back through [`downcast_ref`](dyn DynField::downcast_ref).

use std::any::Any;
use std::sync::{Arc, RwLock};

use halo_core::{AgentId, FieldIndex, Position, PreconditionError, Rect};

use crate::error::FieldError;
use crate::halo::{HaloField, RemoteSource};
use crate::storage::Storage;

/// Read access to the owned cells of one field, shareable with the
/// fetch server thread.
pub trait CellSource: Send + Sync {
    /// The field served.
    fn index(&self) -> FieldIndex;

    /// Encode the contents of cell `coord` (a canonical coordinate).
    fn read_cell(&self, coord: &[i32]) -> Result<Vec<u8>, FieldError>;
}

struct SharedCells<S> {
    index: FieldIndex,
    storage: Arc<RwLock<S>>,
}

impl<S: Storage> CellSource for SharedCells<S> {
    fn index(&self) -> FieldIndex {
        self.index
    }

    fn read_cell(&self, coord: &[i32]) -> Result<Vec<u8>, FieldError> {
        let storage = self
            .storage
            .read()
            .map_err(|_| FieldError::Poisoned { field: self.index })?;
        let mut out = Vec::new();
        storage.encode_cell(coord, &mut out)?;
        Ok(out)
    }
}

/// Object-safe operations shared by every halo field.
pub trait DynField: Any + Send + Sync {
    /// Cluster-wide index of the field.
    fn index(&self) -> FieldIndex;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// The owned rectangle.
    fn owned(&self) -> &Rect;

    /// The halo rectangle.
    fn halo(&self) -> &Rect;

    /// Serialize `region` of local storage.
    fn pack_region(&self, region: &Rect) -> Result<Vec<u8>, FieldError>;

    /// Overwrite `region` with a payload packed from `region` shifted by
    /// `-shift` on another process.
    fn unpack_region(&mut self, region: &Rect, shift: &[i32], payload: &[u8])
        -> Result<(), FieldError>;

    /// Adopt the current partition table after a rebalance.
    fn rebalance(&mut self) -> Result<(), FieldError>;

    /// Number of values or objects in the owned zone.
    fn owned_count(&self) -> Result<usize, FieldError>;

    /// Remove an object from the owned zone, returning its position and
    /// encoded value.
    fn take_object(&mut self, id: AgentId) -> Result<Option<(Position, Vec<u8>)>, FieldError>;

    /// Insert an object that arrived by migration. The position must be
    /// owned here.
    fn put_object(&mut self, id: AgentId, position: &Position, value: &[u8])
        -> Result<(), FieldError>;

    /// Move an owned object to another owned position.
    fn move_object(&mut self, id: AgentId, position: &Position) -> Result<bool, FieldError>;

    /// A shareable reader over the owned cells.
    fn cell_source(&self) -> Arc<dyn CellSource>;

    /// Attach the accessor used for reads outside the halo.
    fn attach_remote(&mut self, remote: Arc<dyn RemoteSource>);
}

impl dyn DynField {
    /// Downcast to the concrete field type.
    pub fn downcast_ref<T: DynField>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }

    /// Mutable counterpart of [`downcast_ref`](Self::downcast_ref).
    pub fn downcast_mut<T: DynField>(&mut self) -> Option<&mut T> {
        (self as &mut dyn Any).downcast_mut::<T>()
    }
}

impl<S: Storage> DynField for HaloField<S> {
    fn index(&self) -> FieldIndex {
        HaloField::index(self)
    }

    fn name(&self) -> &str {
        HaloField::name(self)
    }

    fn owned(&self) -> &Rect {
        HaloField::owned(self)
    }

    fn halo(&self) -> &Rect {
        HaloField::halo(self)
    }

    fn pack_region(&self, region: &Rect) -> Result<Vec<u8>, FieldError> {
        let mut out = Vec::new();
        self.read()?.pack(region, &mut out)?;
        Ok(out)
    }

    fn unpack_region(
        &mut self,
        region: &Rect,
        shift: &[i32],
        payload: &[u8],
    ) -> Result<(), FieldError> {
        let mut r = payload;
        self.write()?.unpack(region, shift, &mut r)?;
        if !r.is_empty() {
            return Err(halo_core::WireError::Malformed {
                detail: format!("{} trailing bytes after region {region}", r.len()),
            }
            .into());
        }
        Ok(())
    }

    fn rebalance(&mut self) -> Result<(), FieldError> {
        HaloField::rebalance(self)
    }

    fn owned_count(&self) -> Result<usize, FieldError> {
        Ok(self.read()?.count_in(HaloField::owned(self)))
    }

    fn take_object(&mut self, id: AgentId) -> Result<Option<(Position, Vec<u8>)>, FieldError> {
        Ok(self.write()?.take_object(id)?)
    }

    fn put_object(
        &mut self,
        id: AgentId,
        position: &Position,
        value: &[u8],
    ) -> Result<(), FieldError> {
        if !HaloField::owned(self).contains_position(position) {
            return Err(PreconditionError::NotOwned {
                coord: halo_core::id::cell_of(position),
                owned: HaloField::owned(self).clone(),
            }
            .into());
        }
        Ok(self.write()?.put_object(id, position, value)?)
    }

    fn move_object(&mut self, id: AgentId, position: &Position) -> Result<bool, FieldError> {
        if !HaloField::owned(self).contains_position(position) {
            return Err(PreconditionError::NotOwned {
                coord: halo_core::id::cell_of(position),
                owned: HaloField::owned(self).clone(),
            }
            .into());
        }
        Ok(self.write()?.relocate_object(id, position))
    }

    fn cell_source(&self) -> Arc<dyn CellSource> {
        Arc::new(SharedCells {
            index: HaloField::index(self),
            storage: self.shared_storage(),
        })
    }

    fn attach_remote(&mut self, remote: Arc<dyn RemoteSource>) {
        self.set_remote(remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContinuousStorage, DenseGrid};
    use halo_core::{FieldValue, ProcessId};
    use halo_partition::{PartitionTable, SharedTable};
    use smallvec::smallvec;

    fn table() -> SharedTable {
        let rects = vec![
            Rect::new(smallvec![0, 0], smallvec![10, 20]),
            Rect::new(smallvec![10, 0], smallvec![20, 20]),
        ];
        let t = PartitionTable::new(Rect::from_extents(&[20, 20]), 1, false, rects).unwrap();
        Arc::new(RwLock::new(t))
    }

    #[test]
    fn downcast_recovers_concrete_field() {
        let f = HaloField::new(FieldIndex(3), "heat", ProcessId(0), table(), DenseGrid::<f32>::new)
            .unwrap();
        let mut boxed: Box<dyn DynField> = Box::new(f);
        assert_eq!(boxed.index(), FieldIndex(3));
        assert!(boxed.downcast_ref::<HaloField<DenseGrid<f64>>>().is_none());
        let concrete = boxed.downcast_mut::<HaloField<DenseGrid<f32>>>().unwrap();
        concrete.set(&[1, 1], 2.0).unwrap();
        assert_eq!(boxed.owned_count().unwrap(), 200);
    }

    #[test]
    fn ghost_columns_move_through_packed_regions() {
        let t = table();
        let mut left = HaloField::new(FieldIndex(0), "h", ProcessId(0), t.clone(), DenseGrid::<i32>::new)
            .unwrap();
        let mut right = HaloField::new(FieldIndex(0), "h", ProcessId(1), t.clone(), DenseGrid::<i32>::new)
            .unwrap();
        right.set(&[10, 4], 11).unwrap();
        let overlaps = t.read().unwrap().overlaps(ProcessId(1), ProcessId(0));
        assert_eq!(overlaps.len(), 1);
        let o = &overlaps[0];
        let payload = DynField::pack_region(&right, &o.source).unwrap();
        DynField::unpack_region(&mut left, &o.target, &o.shift(), &payload).unwrap();
        assert_eq!(left.get_local(&[10, 4]).unwrap(), Some(11));
        assert!(DynField::unpack_region(&mut left, &o.target, &o.shift(), &payload[..4]).is_err());
    }

    #[test]
    fn objects_transfer_between_owners() {
        let t = table();
        let mut a = HaloField::new(FieldIndex(1), "a", ProcessId(0), t.clone(), ContinuousStorage::<u32>::new)
            .unwrap();
        let mut b = HaloField::new(FieldIndex(1), "a", ProcessId(1), t, ContinuousStorage::<u32>::new)
            .unwrap();
        a.add(AgentId(7), &[9.5, 3.0], 42).unwrap();
        let (_, bytes) = DynField::take_object(&mut a, AgentId(7)).unwrap().unwrap();
        let target: Position = smallvec![10.5, 3.0];
        assert!(DynField::put_object(&mut a, AgentId(7), &target, &bytes).is_err());
        DynField::put_object(&mut b, AgentId(7), &target, &bytes).unwrap();
        assert_eq!(b.get(AgentId(7)).unwrap().unwrap().1, 42);
        assert_eq!(a.owned_len().unwrap(), 0);
    }

    #[test]
    fn cell_source_reads_shared_storage() {
        let mut f = HaloField::new(FieldIndex(0), "h", ProcessId(0), table(), DenseGrid::<u32>::new)
            .unwrap();
        let cells = DynField::cell_source(&f);
        f.set(&[3, 3], 9).unwrap();
        assert_eq!(cells.read_cell(&[3, 3]).unwrap(), 9u32.to_bytes().unwrap());
    }
}
