//! [`HaloField`]: process-local storage extended by the AOI margin.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use halo_core::{AgentId, Coord, FieldIndex, FieldValue, Position, PreconditionError, ProcessId, Rect};
use halo_partition::{PartitionTable, SharedTable};

use crate::continuous::{decode_cell, ContinuousStorage};
use crate::dense::DenseGrid;
use crate::error::FieldError;
use crate::storage::Storage;

/// Fetches data owned by another process.
///
/// Implemented by the remote field proxy. The call blocks until the
/// owner replies.
pub trait RemoteSource: Send + Sync {
    /// Fetch the encoded contents of cell `coord` of `field` from `owner`.
    fn fetch(&self, owner: ProcessId, field: FieldIndex, coord: &Coord)
        -> Result<Vec<u8>, FieldError>;
}

/// A field slice covering one partition's halo rectangle.
///
/// Storage is shared behind a lock with the fetch server thread, which
/// reads owned cells on behalf of remote processes. All mutation happens
/// on the owning step thread.
pub struct HaloField<S: Storage> {
    index: FieldIndex,
    name: String,
    pid: ProcessId,
    table: SharedTable,
    world: Rect,
    owned: Rect,
    halo: Rect,
    shifts: Vec<Coord>,
    storage: Arc<RwLock<S>>,
    remote: Option<Arc<dyn RemoteSource>>,
}

impl<S: Storage> HaloField<S> {
    /// Create the slice of a field for `pid`, with storage built by
    /// `make` over the halo rectangle.
    pub fn new(
        index: FieldIndex,
        name: impl Into<String>,
        pid: ProcessId,
        table: SharedTable,
        make: impl FnOnce(Rect) -> S,
    ) -> Result<Self, FieldError> {
        let (world, owned, halo, shifts) = {
            let t = read_table(&table, index)?;
            let (owned, halo) = frame_of(&t, pid)?;
            (t.world().clone(), owned, halo, t.image_shifts())
        };
        let storage = make(halo.clone());
        Ok(Self {
            index,
            name: name.into(),
            pid,
            table,
            world,
            owned,
            halo,
            shifts,
            storage: Arc::new(RwLock::new(storage)),
            remote: None,
        })
    }

    /// Cluster-wide index of the field.
    pub fn index(&self) -> FieldIndex {
        self.index
    }

    /// Human-readable field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The process holding this slice.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// The global domain.
    pub fn world(&self) -> &Rect {
        &self.world
    }

    /// The owned rectangle.
    pub fn owned(&self) -> &Rect {
        &self.owned
    }

    /// The halo rectangle the storage covers.
    pub fn halo(&self) -> &Rect {
        &self.halo
    }

    /// Attach the accessor used for reads outside the halo.
    pub fn set_remote(&mut self, remote: Arc<dyn RemoteSource>) {
        self.remote = Some(remote);
    }

    /// Shared handle to the storage, for the fetch server.
    pub fn shared_storage(&self) -> Arc<RwLock<S>> {
        Arc::clone(&self.storage)
    }

    /// Translate a global coordinate into storage-local offsets:
    /// `global_to_local(p) = p - halo.min`.
    pub fn global_to_local(&self, coord: &[i32]) -> Coord {
        coord.iter().zip(self.halo.min.iter()).map(|(p, o)| p - o).collect()
    }

    /// Inverse of [`global_to_local`](Self::global_to_local).
    pub fn local_to_global(&self, local: &[i32]) -> Coord {
        local.iter().zip(self.halo.min.iter()).map(|(l, o)| l + o).collect()
    }

    /// Where `coord` lives in this slice's halo frame, or `None` if it is
    /// neither owned nor a ghost.
    ///
    /// On a torus the returned coordinate may lie beyond the domain edge.
    pub fn locate(&self, coord: &[i32]) -> Result<Option<Coord>, FieldError> {
        let canonical = self.canonical_coord(coord)?;
        if self.owned.contains(&canonical) {
            return Ok(Some(canonical));
        }
        for shift in &self.shifts {
            let image: Coord = canonical.iter().zip(shift).map(|(c, s)| c + s).collect();
            if self.halo.contains(&image) {
                return Ok(Some(image));
            }
        }
        Ok(None)
    }

    /// Real-valued counterpart of [`locate`](Self::locate).
    pub fn locate_position(&self, position: &[f64]) -> Result<Option<Position>, FieldError> {
        let canonical = self.canonical_position(position)?;
        if self.owned.contains_position(&canonical) {
            return Ok(Some(canonical));
        }
        for shift in &self.shifts {
            let image: Position = canonical
                .iter()
                .zip(shift)
                .map(|(c, &s)| c + s as f64)
                .collect();
            if self.halo.contains_position(&image) {
                return Ok(Some(image));
            }
        }
        Ok(None)
    }

    /// Whether `coord` is in the owned zone.
    pub fn is_owned(&self, coord: &[i32]) -> Result<bool, FieldError> {
        Ok(self.owned.contains(&self.canonical_coord(coord)?))
    }

    /// Whether `coord` is in the ghost zone.
    pub fn is_ghost(&self, coord: &[i32]) -> Result<bool, FieldError> {
        Ok(!self.is_owned(coord)? && self.locate(coord)?.is_some())
    }

    /// Resolve a write target: the canonical owned coordinate, or the
    /// precondition error naming why the write is illegal.
    fn owned_target(&self, coord: &[i32]) -> Result<Coord, FieldError> {
        let canonical = self.canonical_coord(coord)?;
        if self.owned.contains(&canonical) {
            return Ok(canonical);
        }
        let err = if self.locate(coord)?.is_some() {
            PreconditionError::GhostWrite {
                coord: canonical,
                owned: self.owned.clone(),
            }
        } else {
            PreconditionError::NotOwned {
                coord: canonical,
                owned: self.owned.clone(),
            }
        };
        Err(err.into())
    }

    fn owned_position(&self, position: &[f64]) -> Result<Position, FieldError> {
        let canonical = self.canonical_position(position)?;
        if self.owned.contains_position(&canonical) {
            return Ok(canonical);
        }
        let coord = halo_core::id::cell_of(&canonical);
        let err = if self.locate_position(position)?.is_some() {
            PreconditionError::GhostWrite {
                coord,
                owned: self.owned.clone(),
            }
        } else {
            PreconditionError::NotOwned {
                coord,
                owned: self.owned.clone(),
            }
        };
        Err(err.into())
    }

    fn canonical_coord(&self, coord: &[i32]) -> Result<Coord, FieldError> {
        Ok(read_table(&self.table, self.index)?.canonical_coord(coord)?)
    }

    fn canonical_position(&self, position: &[f64]) -> Result<Position, FieldError> {
        Ok(read_table(&self.table, self.index)?.canonical_position(position)?)
    }

    fn fetch_remote(&self, coord: &[i32]) -> Result<Vec<u8>, FieldError> {
        let (canonical, owner) = {
            let t = read_table(&self.table, self.index)?;
            let canonical = t.canonical_coord(coord)?;
            let owner = t.owner_of(&canonical)?;
            (canonical, owner)
        };
        let remote = self.remote.as_ref().ok_or_else(|| FieldError::RemoteUnavailable {
            owner,
            detail: format!("field '{}' has no remote accessor", self.name),
        })?;
        remote.fetch(owner, self.index, &canonical)
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, S>, FieldError> {
        self.storage
            .read()
            .map_err(|_| FieldError::Poisoned { field: self.index })
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, S>, FieldError> {
        self.storage
            .write()
            .map_err(|_| FieldError::Poisoned { field: self.index })
    }

    /// Adopt a new owned/halo rectangle after a rebalance.
    ///
    /// Data in the part of the old owned zone that stays owned is kept;
    /// everything else, including every ghost value, is discarded and
    /// must be refreshed by transfers and the next halo sync.
    pub fn rebalance(&mut self) -> Result<(), FieldError> {
        let (owned, halo, world) = {
            let t = read_table(&self.table, self.index)?;
            let (owned, halo) = frame_of(&t, self.pid)?;
            (owned, halo, t.world().clone())
        };
        let retained = self.owned.intersect(&owned);
        let mut storage = self.write()?;
        let mut kept = Vec::new();
        if let Some(region) = &retained {
            storage.pack(region, &mut kept)?;
        }
        storage.reshape(halo.clone());
        if let Some(region) = &retained {
            let zero: Coord = region.min.iter().map(|_| 0).collect();
            storage.unpack(region, &zero, &mut kept.as_slice())?;
        }
        drop(storage);
        self.world = world;
        self.owned = owned;
        self.halo = halo;
        Ok(())
    }
}

// ── Dense grids ─────────────────────────────────────────────────

impl<T: FieldValue + Default> HaloField<DenseGrid<T>> {
    /// Read a cell.
    ///
    /// Owned cells are authoritative; ghost cells are as fresh as the
    /// last halo sync. Cells outside the halo are fetched from their
    /// owner, blocking until it replies.
    pub fn get(&self, coord: &[i32]) -> Result<T, FieldError> {
        if let Some(value) = self.get_local(coord)? {
            return Ok(value);
        }
        let bytes = self.fetch_remote(coord)?;
        Ok(T::from_bytes(&bytes)?)
    }

    /// Read a cell from local storage only (`None` outside the halo).
    pub fn get_local(&self, coord: &[i32]) -> Result<Option<T>, FieldError> {
        let Some(local) = self.locate(coord)? else {
            return Ok(None);
        };
        Ok(self.read()?.get(&local).cloned())
    }

    /// Write an owned cell. Writing a ghost cell is a precondition error.
    pub fn set(&mut self, coord: &[i32], value: T) -> Result<(), FieldError> {
        let target = self.owned_target(coord)?;
        self.write()?.set(&target, value);
        Ok(())
    }

    /// Apply `f` to every owned cell, in row-major order.
    pub fn update_owned(&mut self, mut f: impl FnMut(&Coord, &mut T)) -> Result<(), FieldError> {
        let owned = self.owned.clone();
        let mut storage = self.write()?;
        for cell in owned.cells() {
            if let Some(v) = storage.get(&cell).cloned() {
                let mut v = v;
                f(&cell, &mut v);
                storage.set(&cell, v);
            }
        }
        Ok(())
    }
}

// ── Continuous spaces ───────────────────────────────────────────

impl<T: FieldValue> HaloField<ContinuousStorage<T>> {
    /// Place a new object in the owned zone.
    pub fn add(&mut self, id: AgentId, position: &[f64], value: T) -> Result<(), FieldError> {
        let target = self.owned_position(position)?;
        self.write()?.insert(id, target, value);
        Ok(())
    }

    /// Remove an owned object. Removing a ghost copy is a precondition error.
    pub fn remove(&mut self, id: AgentId) -> Result<Option<(Position, T)>, FieldError> {
        let mut storage = self.write()?;
        let Some(position) = storage.get(id).map(|(p, _)| p.clone()) else {
            return Ok(None);
        };
        if !self.owned.contains_position(&position) {
            return Err(PreconditionError::GhostWrite {
                coord: halo_core::id::cell_of(&position),
                owned: self.owned.clone(),
            }
            .into());
        }
        Ok(storage.remove(id))
    }

    /// Move an owned object within the owned zone.
    ///
    /// Moving to a point owned by another process is a precondition
    /// error here; the agent must migrate instead.
    pub fn move_to(&mut self, id: AgentId, position: &[f64]) -> Result<(), FieldError> {
        let target = self.owned_position(position)?;
        let mut storage = self.write()?;
        let current = storage.get(id).map(|(p, _)| p.clone());
        match current {
            Some(current) if self.owned.contains_position(&current) => {
                storage.set_position(id, target);
                Ok(())
            }
            Some(current) => Err(PreconditionError::GhostWrite {
                coord: halo_core::id::cell_of(&current),
                owned: self.owned.clone(),
            }
            .into()),
            None => Err(PreconditionError::UnknownObject {
                detail: format!("object {id} not in field '{}'", self.name),
            }
            .into()),
        }
    }

    /// Position and value of a locally stored object (owned or ghost).
    pub fn get(&self, id: AgentId) -> Result<Option<(Position, T)>, FieldError> {
        Ok(self
            .read()?
            .get(id)
            .map(|(p, v)| (p.clone(), v.clone())))
    }

    /// Objects within `radius` of `center`, from owned and ghost data.
    ///
    /// `radius` should not exceed the AOI; beyond it the result may miss
    /// objects held by non-neighbouring processes.
    pub fn within(&self, center: &[f64], radius: f64) -> Result<Vec<(AgentId, Position, T)>, FieldError> {
        let Some(center) = self.locate_position(center)? else {
            return Ok(Vec::new());
        };
        Ok(self
            .read()?
            .within(&center, radius)
            .into_iter()
            .map(|(id, p, v)| (id, p.clone(), v.clone()))
            .collect())
    }

    /// Objects in cell `coord`, fetched from the owner when the cell is
    /// outside the halo.
    pub fn objects_at(&self, coord: &[i32]) -> Result<Vec<(AgentId, Position, T)>, FieldError> {
        if let Some(local) = self.locate(coord)? {
            return Ok(self
                .read()?
                .at_cell(&local)
                .into_iter()
                .map(|(id, p, v)| (id, p.clone(), v.clone()))
                .collect());
        }
        let bytes = self.fetch_remote(coord)?;
        Ok(decode_cell(&bytes)?)
    }

    /// Number of objects in the owned zone.
    pub fn owned_len(&self) -> Result<usize, FieldError> {
        Ok(self.read()?.count_in(&self.owned))
    }

    /// Ids of every object in the owned zone, in insertion order.
    pub fn owned_ids(&self) -> Result<Vec<AgentId>, FieldError> {
        Ok(self
            .read()?
            .iter()
            .filter(|(_, p, _)| self.owned.contains_position(p))
            .map(|(id, _, _)| id)
            .collect())
    }
}

fn read_table(
    table: &SharedTable,
    field: FieldIndex,
) -> Result<RwLockReadGuard<'_, PartitionTable>, FieldError> {
    table.read().map_err(|_| FieldError::Poisoned { field })
}

fn frame_of(table: &PartitionTable, pid: ProcessId) -> Result<(Rect, Rect), FieldError> {
    match (table.rect(pid), table.halo_rect(pid)) {
        (Some(owned), Some(halo)) => Ok((owned.clone(), halo)),
        _ => Err(FieldError::BoundaryMismatch {
            owner: pid,
            coord: Coord::new(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_partition::UniformGrid;
    use smallvec::smallvec;

    fn shared(toroidal: bool) -> SharedTable {
        let grid = UniformGrid::new(Rect::from_extents(&[20, 20]), 2, toroidal, 4).unwrap();
        Arc::new(RwLock::new(grid.table().clone()))
    }

    fn grid_field(toroidal: bool, pid: u32) -> HaloField<DenseGrid<i32>> {
        HaloField::new(FieldIndex(0), "heat", ProcessId(pid), shared(toroidal), DenseGrid::new).unwrap()
    }

    #[test]
    fn storage_is_sized_to_the_halo() {
        let f = grid_field(true, 0);
        assert_eq!(f.owned(), &Rect::new(smallvec![0, 0], smallvec![10, 10]));
        assert_eq!(f.halo(), &Rect::new(smallvec![-2, -2], smallvec![12, 12]));
        assert_eq!(f.read().unwrap().bounds(), f.halo());
        assert_eq!(f.global_to_local(&[-2, 0]).as_slice(), &[0, 2]);
        assert_eq!(f.local_to_global(&[0, 2]).as_slice(), &[-2, 0]);
    }

    #[test]
    fn ghost_writes_are_rejected() {
        let mut f = grid_field(false, 0);
        f.set(&[9, 9], 4).unwrap();
        assert_eq!(f.get(&[9, 9]).unwrap(), 4);
        let err = f.set(&[10, 3], 1).unwrap_err();
        assert!(matches!(err, FieldError::Precondition(PreconditionError::GhostWrite { .. })));
        let err = f.set(&[15, 15], 1).unwrap_err();
        assert!(matches!(err, FieldError::Precondition(PreconditionError::NotOwned { .. })));
        let err = f.set(&[25, 0], 1).unwrap_err();
        assert!(matches!(err, FieldError::Precondition(PreconditionError::OutsideDomain { .. })));
    }

    #[test]
    fn toroidal_locate_finds_wrapped_ghosts() {
        let f = grid_field(true, 0);
        assert_eq!(f.locate(&[19, 0]).unwrap().unwrap().as_slice(), &[-1, 0]);
        assert_eq!(f.locate(&[-1, 0]).unwrap().unwrap().as_slice(), &[-1, 0]);
        assert!(f.is_ghost(&[19, 19]).unwrap());
        assert_eq!(f.locate(&[15, 15]).unwrap(), None);
    }

    #[test]
    fn reads_outside_the_halo_need_a_remote() {
        let f = grid_field(false, 0);
        let err = f.get(&[15, 15]).unwrap_err();
        assert!(matches!(err, FieldError::RemoteUnavailable { owner: ProcessId(3), .. }));
    }

    struct Constant;

    impl RemoteSource for Constant {
        fn fetch(&self, owner: ProcessId, _: FieldIndex, coord: &Coord) -> Result<Vec<u8>, FieldError> {
            Ok(((owner.0 as i32) * 1000 + coord[0]).to_bytes()?)
        }
    }

    #[test]
    fn remote_fallback_decodes_the_reply() {
        let mut f = grid_field(false, 0);
        f.set_remote(Arc::new(Constant));
        assert_eq!(f.get(&[15, 15]).unwrap(), 3015);
        assert_eq!(f.get(&[11, 11]).unwrap(), 0);
    }

    #[test]
    fn continuous_add_move_remove() {
        let table = shared(true);
        let mut f: HaloField<ContinuousStorage<u8>> =
            HaloField::new(FieldIndex(1), "agents", ProcessId(0), table, ContinuousStorage::new)
                .unwrap();
        f.add(AgentId(1), &[9.5, 9.5], 1).unwrap();
        assert!(f.add(AgentId(2), &[10.5, 0.0], 1).is_err());
        f.move_to(AgentId(1), &[0.25, 0.25]).unwrap();
        assert!(f.move_to(AgentId(1), &[19.5, 0.5]).is_err());
        assert_eq!(f.owned_len().unwrap(), 1);
        assert_eq!(f.within(&[19.9, 19.9], 1.0).unwrap().len(), 1);
        assert!(f.remove(AgentId(1)).unwrap().is_some());
        assert_eq!(f.owned_len().unwrap(), 0);
    }

    #[test]
    fn rebalance_keeps_retained_owned_cells() {
        let table = shared(false);
        let mut f = HaloField::new(FieldIndex(0), "heat", ProcessId(0), Arc::clone(&table), DenseGrid::<i32>::new)
            .unwrap();
        f.set(&[2, 2], 7).unwrap();
        f.set(&[9, 9], 8).unwrap();
        {
            let mut t = table.write().unwrap();
            let world = t.world().clone();
            let rects = vec![
                Rect::new(smallvec![0, 0], smallvec![6, 10]),
                Rect::new(smallvec![0, 10], smallvec![10, 20]),
                Rect::new(smallvec![6, 0], smallvec![20, 10]),
                Rect::new(smallvec![10, 10], smallvec![20, 20]),
            ];
            *t = PartitionTable::new(world, 2, false, rects).unwrap().with_version(1);
        }
        f.rebalance().unwrap();
        assert_eq!(f.owned(), &Rect::new(smallvec![0, 0], smallvec![6, 10]));
        assert_eq!(f.get_local(&[2, 2]).unwrap(), Some(7));
        assert_eq!(f.get_local(&[7, 7]).unwrap(), Some(0));
    }
}
