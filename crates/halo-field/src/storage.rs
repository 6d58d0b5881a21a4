//! The pluggable [`Storage`] capability behind every halo field.

use std::io::{Read, Write};

use halo_core::{AgentId, Position, Rect, WireError};

/// Local storage for one field, addressed in the halo frame.
///
/// The halo frame is the global frame, except that on a toroidal domain
/// ghost cells beyond the domain edge keep their unwrapped coordinates
/// (e.g. `-1` for the column left of `0`). Storage is always sized to
/// the halo rectangle, not the owned rectangle.
///
/// `pack` and `unpack` must be inverse over a region: unpacking what was
/// packed from `region` into `region.shifted(shift)` reproduces the
/// region's contents there, replacing whatever was there before.
pub trait Storage: Send + Sync + 'static {
    /// The halo rectangle this storage covers.
    fn bounds(&self) -> &Rect;

    /// Resize to `bounds`, discarding every stored value.
    fn reshape(&mut self, bounds: Rect);

    /// Serialize the contents of `region`.
    fn pack(&self, region: &Rect, w: &mut dyn Write) -> Result<(), WireError>;

    /// Replace the contents of `region` with data packed from
    /// `region.shifted(-shift)` elsewhere.
    fn unpack(&mut self, region: &Rect, shift: &[i32], r: &mut dyn Read) -> Result<(), WireError>;

    /// Reset the contents of `region`.
    fn clear(&mut self, region: &Rect);

    /// Serialize whatever is stored at one cell, for remote fetches.
    fn encode_cell(&self, coord: &[i32], w: &mut dyn Write) -> Result<(), WireError>;

    /// Number of values or objects stored inside `region`.
    fn count_in(&self, region: &Rect) -> usize;

    /// Remove an identified object, returning its position and encoded value.
    ///
    /// Storages without object identity return `Ok(None)`.
    fn take_object(&mut self, _id: AgentId) -> Result<Option<(Position, Vec<u8>)>, WireError> {
        Ok(None)
    }

    /// Insert an identified object from its encoded value.
    fn put_object(
        &mut self,
        id: AgentId,
        _position: &Position,
        _value: &[u8],
    ) -> Result<(), WireError> {
        Err(WireError::Malformed {
            detail: format!("storage cannot hold object {id}"),
        })
    }

    /// Move an identified object. Returns `false` if it is not stored here.
    fn relocate_object(&mut self, _id: AgentId, _position: &Position) -> bool {
        false
    }
}
