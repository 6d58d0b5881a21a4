//! The per-process set of registered fields.

use std::marker::PhantomData;
use std::sync::Arc;

use halo_core::{FieldIndex, PreconditionError};

use crate::erased::{CellSource, DynField};
use crate::halo::HaloField;
use crate::storage::Storage;

/// Typed handle to a registered field.
///
/// Every process registers the same fields in the same order, so a
/// handle's index names the same field cluster-wide.
pub struct FieldHandle<S> {
    index: FieldIndex,
    _storage: PhantomData<fn() -> S>,
}

impl<S> FieldHandle<S> {
    /// The field's cluster-wide index.
    pub fn index(&self) -> FieldIndex {
        self.index
    }
}

impl<S> Clone for FieldHandle<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for FieldHandle<S> {}

impl<S> std::fmt::Debug for FieldHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FieldHandle({})", self.index)
    }
}

/// Fields held by one process, indexed by [`FieldIndex`].
#[derive(Default)]
pub struct FieldSet {
    fields: Vec<Box<dyn DynField>>,
}

impl FieldSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The index the next registered field will get.
    pub fn next_index(&self) -> FieldIndex {
        FieldIndex(self.fields.len() as u32)
    }

    /// Register a field built with [`next_index`](Self::next_index).
    pub fn register<S: Storage>(
        &mut self,
        field: HaloField<S>,
    ) -> Result<FieldHandle<S>, PreconditionError> {
        let index = self.next_index();
        if field.index() != index {
            return Err(PreconditionError::UnknownField { index: field.index() });
        }
        self.fields.push(Box::new(field));
        Ok(FieldHandle {
            index,
            _storage: PhantomData,
        })
    }

    /// The concrete field behind `handle`.
    pub fn get<S: Storage>(&self, handle: FieldHandle<S>) -> Result<&HaloField<S>, PreconditionError> {
        self.dyn_field(handle.index)?
            .downcast_ref::<HaloField<S>>()
            .ok_or(PreconditionError::FieldTypeMismatch {
                index: handle.index,
                expected: std::any::type_name::<S>(),
            })
    }

    /// Mutable counterpart of [`get`](Self::get).
    pub fn get_mut<S: Storage>(
        &mut self,
        handle: FieldHandle<S>,
    ) -> Result<&mut HaloField<S>, PreconditionError> {
        self.dyn_field_mut(handle.index)?
            .downcast_mut::<HaloField<S>>()
            .ok_or(PreconditionError::FieldTypeMismatch {
                index: handle.index,
                expected: std::any::type_name::<S>(),
            })
    }

    /// The type-erased field at `index`.
    pub fn dyn_field(&self, index: FieldIndex) -> Result<&(dyn DynField + 'static), PreconditionError> {
        self.fields
            .get(index.0 as usize)
            .map(|f| f.as_ref())
            .ok_or(PreconditionError::UnknownField { index })
    }

    /// Mutable counterpart of [`dyn_field`](Self::dyn_field).
    pub fn dyn_field_mut(
        &mut self,
        index: FieldIndex,
    ) -> Result<&mut (dyn DynField + 'static), PreconditionError> {
        match self.fields.get_mut(index.0 as usize) {
            Some(f) => Ok(f.as_mut()),
            None => Err(PreconditionError::UnknownField { index }),
        }
    }

    /// Every field, in index order.
    pub fn iter(&self) -> impl Iterator<Item = &(dyn DynField + 'static)> {
        self.fields.iter().map(|f| f.as_ref())
    }

    /// Every field mutably, in index order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut (dyn DynField + 'static)> {
        self.fields.iter_mut().map(|f| f.as_mut())
    }

    /// Number of registered fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no field is registered.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Shareable readers over every field, in index order.
    pub fn cell_sources(&self) -> Vec<Arc<dyn CellSource>> {
        self.fields.iter().map(|f| f.cell_source()).collect()
    }
}
