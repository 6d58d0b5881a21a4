//! Storage for identified objects at real-valued positions.

use std::collections::HashMap;
use std::io::{Read, Write};

use halo_core::codec::{
    read_len, read_position, read_u64_le, write_len, write_position, write_u64_le,
};
use halo_core::id::cell_of;
use halo_core::{AgentId, Coord, FieldValue, Position, Rect, WireError};
use indexmap::IndexMap;

use crate::storage::Storage;

#[derive(Clone, Debug)]
struct Entry<T> {
    position: Position,
    value: T,
}

/// Objects keyed by [`AgentId`], each with a position and a value.
///
/// Objects are bucketed by the integer cell containing them so that
/// region packing and neighbourhood queries only touch nearby buckets.
/// Iteration order is insertion order, which keeps every query result
/// deterministic for a given history.
///
/// On a torus a partition spanning a whole axis sees its own objects a
/// second time through the wrap. Those images share the id of a stored
/// object, so they are kept apart as mirrors, keyed by id and cell. Queries
/// by region or radius see mirrors; lookups by id do not.
#[derive(Clone, Debug)]
pub struct ContinuousStorage<T> {
    bounds: Rect,
    entries: IndexMap<AgentId, Entry<T>>,
    buckets: HashMap<Coord, Vec<AgentId>>,
    mirrors: IndexMap<(AgentId, Coord), Entry<T>>,
}

impl<T: FieldValue> ContinuousStorage<T> {
    /// Empty storage over `bounds`.
    pub fn new(bounds: Rect) -> Self {
        Self {
            bounds,
            entries: IndexMap::new(),
            buckets: HashMap::new(),
            mirrors: IndexMap::new(),
        }
    }

    /// Number of stored objects (owned and ghost), not counting mirrors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `id` is stored.
    pub fn contains(&self, id: AgentId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Position and value of `id`.
    pub fn get(&self, id: AgentId) -> Option<(&Position, &T)> {
        self.entries.get(&id).map(|e| (&e.position, &e.value))
    }

    /// Insert or replace an object. Returns `false` if the position lies
    /// outside the storage bounds (nothing is stored then).
    pub fn insert(&mut self, id: AgentId, position: Position, value: T) -> bool {
        if !self.bounds.contains_position(&position) {
            return false;
        }
        self.remove(id);
        self.buckets.entry(cell_of(&position)).or_default().push(id);
        self.entries.insert(id, Entry { position, value });
        true
    }

    /// Remove an object, returning its position and value.
    pub fn remove(&mut self, id: AgentId) -> Option<(Position, T)> {
        let entry = self.entries.shift_remove(&id)?;
        let cell = cell_of(&entry.position);
        if let Some(bucket) = self.buckets.get_mut(&cell) {
            bucket.retain(|&o| o != id);
            if bucket.is_empty() {
                self.buckets.remove(&cell);
            }
        }
        Some((entry.position, entry.value))
    }

    /// Move an object, keeping its value. Returns `false` if it is absent
    /// or the new position is outside the bounds.
    pub fn set_position(&mut self, id: AgentId, position: Position) -> bool {
        if !self.bounds.contains_position(&position) {
            return false;
        }
        match self.remove(id) {
            Some((_, value)) => self.insert(id, position, value),
            None => false,
        }
    }

    /// Objects stored in cell `coord`, in insertion order.
    pub fn at_cell(&self, coord: &[i32]) -> Vec<(AgentId, &Position, &T)> {
        let mut ids: Vec<AgentId> = self
            .buckets
            .get(coord)
            .cloned()
            .unwrap_or_default();
        ids.sort_by_key(|id| self.entries.get_index_of(id));
        let mut out: Vec<_> = ids
            .into_iter()
            .filter_map(|id| self.entries.get(&id).map(|e| (id, &e.position, &e.value)))
            .collect();
        out.extend(
            self.mirrors
                .iter()
                .filter(|((_, cell), _)| cell.as_slice() == coord)
                .map(|(&(id, _), e)| (id, &e.position, &e.value)),
        );
        out
    }

    /// Objects within Euclidean distance `radius` of `center`, in insertion order.
    pub fn within(&self, center: &[f64], radius: f64) -> Vec<(AgentId, &Position, &T)> {
        if !(radius >= 0.0 && radius.is_finite()) || center.len() != self.bounds.ndim() {
            return Vec::new();
        }
        let lo: Coord = center.iter().map(|c| (c - radius).floor() as i32).collect();
        let hi: Coord = center.iter().map(|c| (c + radius).floor() as i32 + 1).collect();
        let Some(window) = Rect::new(lo, hi).intersect(&self.bounds) else {
            return Vec::new();
        };
        let r2 = radius * radius;
        let mut hits: Vec<(usize, AgentId)> = Vec::new();
        for cell in window.cells() {
            let Some(bucket) = self.buckets.get(&cell) else {
                continue;
            };
            for &id in bucket {
                if let Some((idx, _, e)) = self.entries.get_full(&id) {
                    if distance2(&e.position, center) <= r2 {
                        hits.push((idx, id));
                    }
                }
            }
        }
        hits.sort_unstable();
        let mut out: Vec<_> = hits
            .into_iter()
            .filter_map(|(_, id)| self.entries.get(&id).map(|e| (id, &e.position, &e.value)))
            .collect();
        for ((id, cell), e) in &self.mirrors {
            if window.contains(cell) && distance2(&e.position, center) <= r2 {
                out.push((*id, &e.position, &e.value));
            }
        }
        out
    }

    /// Number of wrap-around images currently held.
    pub fn mirror_count(&self) -> usize {
        self.mirrors.len()
    }

    /// Every stored object, in insertion order. Mirrors are not included.
    pub fn iter(&self) -> impl Iterator<Item = (AgentId, &Position, &T)> {
        self.entries.iter().map(|(&id, e)| (id, &e.position, &e.value))
    }

    fn ids_in(&self, region: &Rect) -> Vec<AgentId> {
        let mut ids: Vec<(usize, AgentId)> = Vec::new();
        if region.volume() < self.buckets.len() {
            for cell in region.cells() {
                if let Some(bucket) = self.buckets.get(&cell) {
                    ids.extend(
                        bucket
                            .iter()
                            .filter_map(|id| self.entries.get_index_of(id).map(|i| (i, *id))),
                    );
                }
            }
        } else {
            for (cell, bucket) in &self.buckets {
                if region.contains(cell) {
                    ids.extend(
                        bucket
                            .iter()
                            .filter_map(|id| self.entries.get_index_of(id).map(|i| (i, *id))),
                    );
                }
            }
        }
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }
}

impl<T: FieldValue> Storage for ContinuousStorage<T> {
    fn bounds(&self) -> &Rect {
        &self.bounds
    }

    fn reshape(&mut self, bounds: Rect) {
        *self = Self::new(bounds);
    }

    fn pack(&self, region: &Rect, w: &mut dyn Write) -> Result<(), WireError> {
        let ids = self.ids_in(region);
        write_len(w, ids.len())?;
        for id in ids {
            if let Some(e) = self.entries.get(&id) {
                write_u64_le(w, id.0)?;
                write_position(w, &e.position)?;
                e.value.encode(w)?;
            }
        }
        Ok(())
    }

    fn unpack(&mut self, region: &Rect, shift: &[i32], r: &mut dyn Read) -> Result<(), WireError> {
        self.clear(region);
        let count = read_len(r)?;
        for _ in 0..count {
            let id = AgentId(read_u64_le(r)?);
            let packed = read_position(r)?;
            let value = T::decode(r)?;
            if packed.len() != shift.len() {
                return Err(WireError::Malformed {
                    detail: format!("object {id} has a {}-D position", packed.len()),
                });
            }
            let position: Position = packed
                .iter()
                .zip(shift)
                .map(|(x, &s)| x + s as f64)
                .collect();
            let cell = cell_of(&position);
            if !region.contains(&cell) {
                return Err(WireError::Malformed {
                    detail: format!("object {id} at {position:?} falls outside region {region}"),
                });
            }
            let stored_elsewhere = self
                .entries
                .get(&id)
                .is_some_and(|e| !region.contains(&cell_of(&e.position)));
            if stored_elsewhere {
                self.mirrors.insert((id, cell), Entry { position, value });
            } else {
                self.insert(id, position, value);
            }
        }
        Ok(())
    }

    fn clear(&mut self, region: &Rect) {
        for id in self.ids_in(region) {
            self.remove(id);
        }
        self.mirrors.retain(|(_, cell), _| !region.contains(cell));
    }

    fn encode_cell(&self, coord: &[i32], w: &mut dyn Write) -> Result<(), WireError> {
        let objects = self.at_cell(coord);
        write_len(w, objects.len())?;
        for (id, position, value) in objects {
            write_u64_le(w, id.0)?;
            write_position(w, position)?;
            value.encode(w)?;
        }
        Ok(())
    }

    fn count_in(&self, region: &Rect) -> usize {
        self.ids_in(region).len()
    }

    fn take_object(&mut self, id: AgentId) -> Result<Option<(Position, Vec<u8>)>, WireError> {
        match self.remove(id) {
            Some((position, value)) => Ok(Some((position, value.to_bytes()?))),
            None => Ok(None),
        }
    }

    fn put_object(&mut self, id: AgentId, position: &Position, value: &[u8]) -> Result<(), WireError> {
        let value = T::from_bytes(value)?;
        if self.insert(id, position.clone(), value) {
            Ok(())
        } else {
            Err(WireError::Malformed {
                detail: format!("object {id} at {position:?} is outside {}", self.bounds),
            })
        }
    }

    fn relocate_object(&mut self, id: AgentId, position: &Position) -> bool {
        self.set_position(id, position.clone())
    }
}

fn distance2(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Decode the reply to a remote cell fetch against continuous storage.
pub fn decode_cell<T: FieldValue>(bytes: &[u8]) -> Result<Vec<(AgentId, Position, T)>, WireError> {
    let mut r = bytes;
    let count = read_len(&mut r)?;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let id = AgentId(read_u64_le(&mut r)?);
        let position = read_position(&mut r)?;
        out.push((id, position, T::decode(&mut r)?));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn storage() -> ContinuousStorage<u32> {
        ContinuousStorage::new(Rect::new(smallvec![-5, -5], smallvec![55, 55]))
    }

    #[test]
    fn insert_move_remove() {
        let mut s = storage();
        let id = AgentId(1);
        assert!(s.insert(id, smallvec![1.5, 2.5], 7));
        assert_eq!(s.at_cell(&[1, 2]).len(), 1);
        assert!(s.set_position(id, smallvec![10.0, 10.0]));
        assert!(s.at_cell(&[1, 2]).is_empty());
        assert_eq!(s.get(id).map(|(_, v)| *v), Some(7));
        assert_eq!(s.remove(id).map(|(p, _)| p[0]), Some(10.0));
        assert!(s.is_empty());
        assert!(!s.insert(id, smallvec![60.0, 0.0], 1));
    }

    #[test]
    fn within_uses_euclidean_distance() {
        let mut s = storage();
        s.insert(AgentId(1), smallvec![10.0, 10.0], 1);
        s.insert(AgentId(2), smallvec![12.9, 10.0], 2);
        s.insert(AgentId(3), smallvec![12.0, 12.0], 3);
        let ids: Vec<AgentId> = s.within(&[10.0, 10.0], 3.0).into_iter().map(|h| h.0).collect();
        assert_eq!(ids, vec![AgentId(1), AgentId(2), AgentId(3)]);
        let ids: Vec<AgentId> = s.within(&[10.0, 10.0], 2.5).into_iter().map(|h| h.0).collect();
        assert_eq!(ids, vec![AgentId(1)]);
    }

    #[test]
    fn unpack_replaces_the_region_wholesale() {
        let mut src = storage();
        src.insert(AgentId(1), smallvec![48.5, 3.0], 10);
        src.insert(AgentId(2), smallvec![49.5, 4.0], 20);
        src.insert(AgentId(3), smallvec![40.0, 4.0], 30);
        let region = Rect::new(smallvec![45, 0], smallvec![50, 50]);
        let mut buf = Vec::new();
        src.pack(&region, &mut buf).unwrap();

        let mut dst = storage();
        dst.insert(AgentId(9), smallvec![-4.5, 1.0], 99);
        let target = Rect::new(smallvec![-5, 0], smallvec![0, 50]);
        dst.unpack(&target, &[-50, 0], &mut buf.as_slice()).unwrap();
        assert!(!dst.contains(AgentId(9)));
        assert_eq!(dst.len(), 2);
        let (p, v) = dst.get(AgentId(1)).unwrap();
        assert_eq!((p[0], *v), (-1.5, 10));
    }

    #[test]
    fn wrap_images_of_stored_objects_become_mirrors() {
        // One partition over a 50-wide torus axis: [0,50) owned, halo [-5,55).
        let mut s = storage();
        s.insert(AgentId(1), smallvec![1.5, 3.0], 10);
        let mut buf = Vec::new();
        s.pack(&Rect::new(smallvec![0, 0], smallvec![5, 50]), &mut buf).unwrap();
        let target = Rect::new(smallvec![50, 0], smallvec![55, 50]);
        s.unpack(&target, &[50, 0], &mut buf.as_slice()).unwrap();

        assert_eq!(s.len(), 1);
        assert_eq!(s.mirror_count(), 1);
        assert_eq!(s.get(AgentId(1)).map(|(p, _)| p[0]), Some(1.5));
        let near_seam: Vec<f64> = s.within(&[50.0, 3.0], 2.0).iter().map(|h| h.1[0]).collect();
        assert_eq!(near_seam, vec![51.5]);
        assert_eq!(s.at_cell(&[51, 3]).len(), 1);

        s.clear(&target);
        assert_eq!(s.mirror_count(), 0);
        assert!(s.contains(AgentId(1)));
    }

    #[test]
    fn take_and_put_round_trip_an_object() {
        let mut a = storage();
        a.insert(AgentId(4), smallvec![3.0, 3.0], 44);
        let (pos, bytes) = a.take_object(AgentId(4)).unwrap().unwrap();
        assert!(a.is_empty());
        let mut b = storage();
        b.put_object(AgentId(4), &pos, &bytes).unwrap();
        assert_eq!(b.get(AgentId(4)).map(|(_, v)| *v), Some(44));
    }

    #[test]
    fn cell_reply_decodes() {
        let mut s = storage();
        s.insert(AgentId(5), smallvec![7.25, 8.75], 3);
        let mut buf = Vec::new();
        s.encode_cell(&[7, 8], &mut buf).unwrap();
        let objects = decode_cell::<u32>(&buf).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].0, AgentId(5));
    }
}
