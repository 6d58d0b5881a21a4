//! Wire messages exchanged between processes.

use std::io::Read;

use halo_core::codec::{
    read_coord, read_len, read_length_prefixed_bytes, read_length_prefixed_str, read_position,
    read_rect, read_u64_le, read_u8, write_coord, write_len, write_length_prefixed_bytes,
    write_length_prefixed_str, write_position, write_rect, write_u64_le, write_u8,
};
use halo_core::{AgentId, Coord, FieldIndex, Position, ProcessId, Rect, ScheduleParams, WireError};

use crate::codec::{
    expect_end, read_field, read_header, read_pid, read_schedule, write_field, write_header,
    write_pid, write_schedule, MessageKind,
};

// ── Halo exchange ───────────────────────────────────────────────

/// One field's boundary data for one overlap.
#[derive(Clone, Debug, PartialEq)]
pub struct HaloPacket {
    /// The field the data belongs to.
    pub field: FieldIndex,
    /// The packed sub-rectangle, in the sender's frame.
    pub rect: Rect,
    /// Storage-specific packed contents of `rect`.
    pub payload: Vec<u8>,
}

/// Everything one process sends one neighbour in a halo sync.
#[derive(Clone, Debug, PartialEq)]
pub struct HaloBatch {
    /// The sending process.
    pub sender: ProcessId,
    /// Version of the partition table the sender packed against.
    pub table_version: u64,
    /// One packet per (field, overlap), in field then overlap order.
    pub packets: Vec<HaloPacket>,
}

impl HaloBatch {
    /// Encode into a framed message.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = Vec::new();
        write_header(&mut w, MessageKind::Halo)?;
        write_pid(&mut w, self.sender)?;
        write_u64_le(&mut w, self.table_version)?;
        write_len(&mut w, self.packets.len())?;
        for p in &self.packets {
            write_field(&mut w, p.field)?;
            write_rect(&mut w, &p.rect)?;
            write_length_prefixed_bytes(&mut w, &p.payload)?;
        }
        Ok(w)
    }

    /// Decode a framed message.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = bytes;
        read_header(&mut r, MessageKind::Halo)?;
        let sender = read_pid(&mut r)?;
        let table_version = read_u64_le(&mut r)?;
        let count = read_len(&mut r)?;
        let mut packets = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            packets.push(HaloPacket {
                field: read_field(&mut r)?,
                rect: read_rect(&mut r)?,
                payload: read_length_prefixed_bytes(&mut r)?,
            });
        }
        expect_end(r)?;
        Ok(Self {
            sender,
            table_version,
            packets,
        })
    }
}

// ── Migration ───────────────────────────────────────────────────

/// The migration envelope of one agent.
///
/// Created when an agent's step moves it out of the local partition and
/// consumed exactly once by the destination's migration flush.
#[derive(Clone, Debug, PartialEq)]
pub struct Transportee {
    /// The agent's stable identity.
    pub agent: AgentId,
    /// Registered kind name used to rebuild the agent at the destination.
    pub kind: String,
    /// The agent's encoded state.
    pub state: Vec<u8>,
    /// The process the sender computed as the new owner.
    pub destination: ProcessId,
    /// The agent's new position (canonical).
    pub position: Position,
    /// The continuous field holding the agent's spatial entry.
    pub home: Option<FieldIndex>,
    /// Encoded value of that entry. `None` when the entry travels on its
    /// own inside a rebalance region hand-over.
    pub home_value: Option<Vec<u8>>,
    /// Where the agent re-enters the destination's schedule; `None` if it
    /// had no pending event.
    pub schedule: Option<ScheduleParams>,
}

/// A non-agent object of a continuous field crossing a boundary.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldParcel {
    /// The field holding the object.
    pub field: FieldIndex,
    /// The object's identity.
    pub object: AgentId,
    /// The process the sender computed as the new owner.
    pub destination: ProcessId,
    /// The object's position (canonical).
    pub position: Position,
    /// The object's encoded value.
    pub value: Vec<u8>,
}

/// Everything one process sends one other process in a migration flush.
#[derive(Clone, Debug, PartialEq)]
pub struct MigrationPacket {
    /// The sending process.
    pub sender: ProcessId,
    /// Version of the partition table the destinations were computed with.
    pub table_version: u64,
    /// Migrating agents.
    pub agents: Vec<Transportee>,
    /// Migrating field objects.
    pub parcels: Vec<FieldParcel>,
    /// Owned cells handed over by a rebalance, in canonical coordinates.
    pub regions: Vec<HaloPacket>,
}

impl MigrationPacket {
    /// Whether the packet carries nothing.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.parcels.is_empty() && self.regions.is_empty()
    }

    /// Encode into a framed message.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = Vec::new();
        write_header(&mut w, MessageKind::Migration)?;
        write_pid(&mut w, self.sender)?;
        write_u64_le(&mut w, self.table_version)?;
        write_len(&mut w, self.agents.len())?;
        for t in &self.agents {
            write_u64_le(&mut w, t.agent.0)?;
            write_length_prefixed_str(&mut w, &t.kind)?;
            write_length_prefixed_bytes(&mut w, &t.state)?;
            write_pid(&mut w, t.destination)?;
            write_position(&mut w, &t.position)?;
            match t.home {
                Some(field) => {
                    write_u8(&mut w, 1)?;
                    write_field(&mut w, field)?;
                }
                None => write_u8(&mut w, 0)?,
            }
            match &t.home_value {
                Some(value) => {
                    write_u8(&mut w, 1)?;
                    write_length_prefixed_bytes(&mut w, value)?;
                }
                None => write_u8(&mut w, 0)?,
            }
            match &t.schedule {
                Some(s) => {
                    write_u8(&mut w, 1)?;
                    write_schedule(&mut w, s)?;
                }
                None => write_u8(&mut w, 0)?,
            }
        }
        write_len(&mut w, self.parcels.len())?;
        for p in &self.parcels {
            write_field(&mut w, p.field)?;
            write_u64_le(&mut w, p.object.0)?;
            write_pid(&mut w, p.destination)?;
            write_position(&mut w, &p.position)?;
            write_length_prefixed_bytes(&mut w, &p.value)?;
        }
        write_len(&mut w, self.regions.len())?;
        for p in &self.regions {
            write_field(&mut w, p.field)?;
            write_rect(&mut w, &p.rect)?;
            write_length_prefixed_bytes(&mut w, &p.payload)?;
        }
        Ok(w)
    }

    /// Decode a framed message.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = bytes;
        read_header(&mut r, MessageKind::Migration)?;
        let sender = read_pid(&mut r)?;
        let table_version = read_u64_le(&mut r)?;
        let count = read_len(&mut r)?;
        let mut agents = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let agent = AgentId(read_u64_le(&mut r)?);
            let kind = read_length_prefixed_str(&mut r)?;
            let state = read_length_prefixed_bytes(&mut r)?;
            let destination = read_pid(&mut r)?;
            let position = read_position(&mut r)?;
            let home = if read_flag(&mut r)? {
                Some(read_field(&mut r)?)
            } else {
                None
            };
            let home_value = if read_flag(&mut r)? {
                Some(read_length_prefixed_bytes(&mut r)?)
            } else {
                None
            };
            let schedule = if read_flag(&mut r)? {
                Some(read_schedule(&mut r)?)
            } else {
                None
            };
            agents.push(Transportee {
                agent,
                kind,
                state,
                destination,
                position,
                home,
                home_value,
                schedule,
            });
        }
        let count = read_len(&mut r)?;
        let mut parcels = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            parcels.push(FieldParcel {
                field: read_field(&mut r)?,
                object: AgentId(read_u64_le(&mut r)?),
                destination: read_pid(&mut r)?,
                position: read_position(&mut r)?,
                value: read_length_prefixed_bytes(&mut r)?,
            });
        }
        let count = read_len(&mut r)?;
        let mut regions = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            regions.push(HaloPacket {
                field: read_field(&mut r)?,
                rect: read_rect(&mut r)?,
                payload: read_length_prefixed_bytes(&mut r)?,
            });
        }
        expect_end(r)?;
        Ok(Self {
            sender,
            table_version,
            agents,
            parcels,
            regions,
        })
    }
}

// ── Remote fetch ────────────────────────────────────────────────

/// Ask a process for the contents of one cell it owns.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchRequest {
    /// The asking process.
    pub requester: ProcessId,
    /// The field to read.
    pub field: FieldIndex,
    /// The cell, as a canonical coordinate.
    pub coord: Coord,
}

impl FetchRequest {
    /// Encode into a framed message.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = Vec::new();
        write_header(&mut w, MessageKind::FetchRequest)?;
        write_pid(&mut w, self.requester)?;
        write_field(&mut w, self.field)?;
        write_coord(&mut w, &self.coord)?;
        Ok(w)
    }

    /// Decode a framed message.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = bytes;
        read_header(&mut r, MessageKind::FetchRequest)?;
        let req = Self {
            requester: read_pid(&mut r)?,
            field: read_field(&mut r)?,
            coord: read_coord(&mut r)?,
        };
        expect_end(r)?;
        Ok(req)
    }
}

/// The owner's answer to a [`FetchRequest`].
#[derive(Clone, Debug, PartialEq)]
pub enum FetchOutcome {
    /// The encoded cell contents.
    Value(Vec<u8>),
    /// The asked process does not own the cell under its current table.
    BoundaryMismatch {
        /// The process that answered.
        owner: ProcessId,
    },
    /// The read failed on the owner.
    Failed {
        /// The owner's description.
        detail: String,
    },
}

/// Reply to a [`FetchRequest`].
#[derive(Clone, Debug, PartialEq)]
pub struct FetchResponse {
    /// The answer.
    pub outcome: FetchOutcome,
}

impl FetchResponse {
    /// Encode into a framed message.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = Vec::new();
        write_header(&mut w, MessageKind::FetchResponse)?;
        match &self.outcome {
            FetchOutcome::Value(bytes) => {
                write_u8(&mut w, 0)?;
                write_length_prefixed_bytes(&mut w, bytes)?;
            }
            FetchOutcome::BoundaryMismatch { owner } => {
                write_u8(&mut w, 1)?;
                write_pid(&mut w, *owner)?;
            }
            FetchOutcome::Failed { detail } => {
                write_u8(&mut w, 2)?;
                write_length_prefixed_str(&mut w, detail)?;
            }
        }
        Ok(w)
    }

    /// Decode a framed message.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = bytes;
        read_header(&mut r, MessageKind::FetchResponse)?;
        let outcome = match read_u8(&mut r)? {
            0 => FetchOutcome::Value(read_length_prefixed_bytes(&mut r)?),
            1 => FetchOutcome::BoundaryMismatch {
                owner: read_pid(&mut r)?,
            },
            2 => FetchOutcome::Failed {
                detail: read_length_prefixed_str(&mut r)?,
            },
            tag => {
                return Err(WireError::Malformed {
                    detail: format!("unknown fetch outcome {tag}"),
                })
            }
        };
        expect_end(r)?;
        Ok(Self { outcome })
    }
}

fn read_flag(r: &mut dyn Read) -> Result<bool, WireError> {
    match read_u8(r)? {
        0 => Ok(false),
        1 => Ok(true),
        v => Err(WireError::Malformed {
            detail: format!("bad presence flag {v}"),
        }),
    }
}
