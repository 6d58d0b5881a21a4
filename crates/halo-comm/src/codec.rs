//! Message framing and shared encoders.
//!
//! Every framed message starts with `MAGIC`, the format version and a
//! one-byte message kind:
//!
//! ```text
//! [MAGIC "HALO"] [VERSION u8] [KIND u8] [body ...]
//! ```
//!
//! Bodies use the little-endian primitives from `halo_core::codec`.

use std::io::{Read, Write};

use halo_core::codec::{
    read_f64_le, read_i32_le, read_u32_le, read_u8, write_f64_le, write_i32_le, write_u32_le,
    write_u8,
};
use halo_core::{FieldIndex, ProcessId, ScheduleParams, WireError};

use crate::{FORMAT_VERSION, MAGIC};

/// Kind byte of a framed message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// [`HaloBatch`](crate::HaloBatch).
    Halo = 1,
    /// [`MigrationPacket`](crate::MigrationPacket).
    Migration = 2,
    /// [`FetchRequest`](crate::FetchRequest).
    FetchRequest = 3,
    /// [`FetchResponse`](crate::FetchResponse).
    FetchResponse = 4,
}

/// Write the frame header for `kind`.
pub fn write_header(w: &mut dyn Write, kind: MessageKind) -> Result<(), WireError> {
    w.write_all(&MAGIC)?;
    write_u8(w, FORMAT_VERSION)?;
    write_u8(w, kind as u8)
}

/// Read and check a frame header, expecting `kind`.
pub fn read_header(r: &mut dyn Read, kind: MessageKind) -> Result<(), WireError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(WireError::Malformed {
            detail: format!("bad magic {magic:02x?}"),
        });
    }
    let version = read_u8(r)?;
    if version != FORMAT_VERSION {
        return Err(WireError::UnsupportedVersion { found: version });
    }
    let found = read_u8(r)?;
    if found != kind as u8 {
        return Err(WireError::Malformed {
            detail: format!("expected message kind {}, found {found}", kind as u8),
        });
    }
    Ok(())
}

/// Fail if `rest` still holds bytes after a complete message.
pub fn expect_end(rest: &[u8]) -> Result<(), WireError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(WireError::Malformed {
            detail: format!("{} trailing bytes after message", rest.len()),
        })
    }
}

/// Write a process id.
pub fn write_pid(w: &mut dyn Write, pid: ProcessId) -> Result<(), WireError> {
    write_u32_le(w, pid.0)
}

/// Read a process id.
pub fn read_pid(r: &mut dyn Read) -> Result<ProcessId, WireError> {
    Ok(ProcessId(read_u32_le(r)?))
}

/// Write a field index.
pub fn write_field(w: &mut dyn Write, field: FieldIndex) -> Result<(), WireError> {
    write_u32_le(w, field.0)
}

/// Read a field index.
pub fn read_field(r: &mut dyn Read) -> Result<FieldIndex, WireError> {
    Ok(FieldIndex(read_u32_le(r)?))
}

/// Write schedule parameters: time, ordering, then a presence flag and
/// the interval.
pub fn write_schedule(w: &mut dyn Write, s: &ScheduleParams) -> Result<(), WireError> {
    write_f64_le(w, s.time)?;
    write_i32_le(w, s.ordering)?;
    match s.interval {
        Some(i) => {
            write_u8(w, 1)?;
            write_f64_le(w, i)
        }
        None => write_u8(w, 0),
    }
}

/// Read schedule parameters, rejecting values that could not have been
/// scheduled.
pub fn read_schedule(r: &mut dyn Read) -> Result<ScheduleParams, WireError> {
    let time = read_f64_le(r)?;
    let ordering = read_i32_le(r)?;
    let interval = match read_u8(r)? {
        0 => None,
        1 => Some(read_f64_le(r)?),
        flag => {
            return Err(WireError::Malformed {
                detail: format!("bad interval flag {flag}"),
            })
        }
    };
    let params = ScheduleParams {
        time,
        ordering,
        interval,
    };
    if !params.is_valid() {
        return Err(WireError::Malformed {
            detail: format!("invalid schedule parameters {params:?}"),
        });
    }
    Ok(params)
}
