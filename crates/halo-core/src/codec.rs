//! Byte-level building blocks shared by every Halo message.
//!
//! Scalars go out little-endian at their natural width. Blobs and strings
//! sit behind a `u32` length, coordinates and positions behind a `u8`
//! axis count. Message layouts are fixed in code on both ends.

use std::io::{Read, Write};

use crate::error::WireError;
use crate::id::{Coord, Position};
use crate::rect::Rect;

/// Largest length prefix accepted when decoding (256 MiB).
pub const MAX_LENGTH_PREFIX: usize = 1 << 28;

// ── Fixed-width scalars ─────────────────────────────────────────

macro_rules! fixed_width {
    ($($ty:ty => $write:ident, $read:ident;)*) => {$(
        #[doc = concat!("Append `v` as ", stringify!($ty), " in little-endian byte order.")]
        pub fn $write(w: &mut dyn Write, v: $ty) -> Result<(), WireError> {
            w.write_all(&v.to_le_bytes())?;
            Ok(())
        }

        #[doc = concat!("Take the next ", stringify!($ty), " (little-endian) off `r`.")]
        pub fn $read(r: &mut dyn Read) -> Result<$ty, WireError> {
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            r.read_exact(&mut raw)?;
            Ok(<$ty>::from_le_bytes(raw))
        }
    )*};
}

fixed_width! {
    u8 => write_u8, read_u8;
    u32 => write_u32_le, read_u32_le;
    u64 => write_u64_le, read_u64_le;
    i32 => write_i32_le, read_i32_le;
    i64 => write_i64_le, read_i64_le;
    f32 => write_f32_le, read_f32_le;
    f64 => write_f64_le, read_f64_le;
}

// ── Framed values ───────────────────────────────────────────────

/// Emit `len` as the u32 prefix of a variable-length value.
pub fn write_len(w: &mut dyn Write, len: usize) -> Result<(), WireError> {
    let prefix = u32::try_from(len).map_err(|_| WireError::Malformed {
        detail: format!("length {len} does not fit in u32"),
    })?;
    write_u32_le(w, prefix)
}

/// Emit a blob behind its length prefix.
pub fn write_length_prefixed_bytes(w: &mut dyn Write, bytes: &[u8]) -> Result<(), WireError> {
    write_len(w, bytes.len())?;
    w.write_all(bytes)?;
    Ok(())
}

/// Emit a string's UTF-8 bytes behind their length prefix.
pub fn write_length_prefixed_str(w: &mut dyn Write, s: &str) -> Result<(), WireError> {
    write_length_prefixed_bytes(w, s.as_bytes())
}

/// Grid coordinate: dimension count (u8), then one i32 per axis.
pub fn write_coord(w: &mut dyn Write, c: &[i32]) -> Result<(), WireError> {
    write_dims(w, c.len())?;
    c.iter().try_for_each(|&v| write_i32_le(w, v))
}

/// Continuous position: dimension count (u8), then one f64 per axis.
pub fn write_position(w: &mut dyn Write, p: &[f64]) -> Result<(), WireError> {
    write_dims(w, p.len())?;
    p.iter().try_for_each(|&v| write_f64_le(w, v))
}

/// A rectangle travels as its lower then upper corner.
pub fn write_rect(w: &mut dyn Write, r: &Rect) -> Result<(), WireError> {
    write_coord(w, &r.min)?;
    write_coord(w, &r.max)
}

fn write_dims(w: &mut dyn Write, dims: usize) -> Result<(), WireError> {
    let dims = u8::try_from(dims).map_err(|_| WireError::Malformed {
        detail: format!("{dims} dimensions do not fit in u8"),
    })?;
    write_u8(w, dims)
}

/// Counterpart of [`write_len`]; prefixes above [`MAX_LENGTH_PREFIX`]
/// are treated as corruption.
pub fn read_len(r: &mut dyn Read) -> Result<usize, WireError> {
    let len = read_u32_le(r)? as usize;
    if len > MAX_LENGTH_PREFIX {
        return Err(WireError::Malformed {
            detail: format!("length prefix {len} exceeds limit {MAX_LENGTH_PREFIX}"),
        });
    }
    Ok(len)
}

/// Counterpart of [`write_length_prefixed_bytes`].
pub fn read_length_prefixed_bytes(r: &mut dyn Read) -> Result<Vec<u8>, WireError> {
    let mut blob = vec![0u8; read_len(r)?];
    r.read_exact(&mut blob)?;
    Ok(blob)
}

/// Counterpart of [`write_length_prefixed_str`]; invalid UTF-8 is malformed.
pub fn read_length_prefixed_str(r: &mut dyn Read) -> Result<String, WireError> {
    String::from_utf8(read_length_prefixed_bytes(r)?).map_err(|e| WireError::Malformed {
        detail: format!("string is not UTF-8: {e}"),
    })
}

/// Counterpart of [`write_coord`].
pub fn read_coord(r: &mut dyn Read) -> Result<Coord, WireError> {
    let dims = read_u8(r)? as usize;
    let mut c = Coord::with_capacity(dims);
    for _ in 0..dims {
        c.push(read_i32_le(r)?);
    }
    Ok(c)
}

/// Counterpart of [`write_position`].
pub fn read_position(r: &mut dyn Read) -> Result<Position, WireError> {
    let dims = read_u8(r)? as usize;
    let mut p = Position::with_capacity(dims);
    for _ in 0..dims {
        p.push(read_f64_le(r)?);
    }
    Ok(p)
}

/// Counterpart of [`write_rect`]; corners that disagree on dimension
/// or order are malformed.
pub fn read_rect(r: &mut dyn Read) -> Result<Rect, WireError> {
    let min = read_coord(r)?;
    let max = read_coord(r)?;
    if min.len() != max.len() || min.iter().zip(max.iter()).any(|(lo, hi)| lo > hi) {
        return Err(WireError::Malformed {
            detail: format!("inconsistent rectangle corners {min:?} / {max:?}"),
        });
    }
    Ok(Rect { min, max })
}
