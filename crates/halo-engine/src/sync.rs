//! [`Synchronizer`]: the barrier-synchronous halo exchange.
//!
//! For every neighbour `q` the sender packs, per field, each overlap
//! `table.overlaps(me, q)` from its owned storage (in its own frame) and
//! ships them as one [`HaloBatch`]. The receiver checks the batch against
//! `table.overlaps(q, me)`, which it computes independently, then
//! overwrites the matching ghost regions wholesale. A partition that
//! spans a whole toroidal axis copies its own wrap-around overlaps
//! locally.

use halo_comm::{HaloBatch, HaloPacket, Tag, Transport};
use halo_core::ProcessId;
use halo_field::FieldSet;
use halo_partition::{Overlap, PartitionTable};
use tracing::{error, trace};

use crate::error::SimError;

/// Counters from one exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Neighbours exchanged with.
    pub neighbors: usize,
    /// Packets applied, including local wrap-around copies.
    pub packets: usize,
    /// Encoded bytes sent.
    pub bytes_sent: u64,
    /// Encoded bytes received.
    pub bytes_received: u64,
}

/// Runs halo exchanges for one process.
#[derive(Debug)]
pub struct Synchronizer {
    pid: ProcessId,
    passes: u64,
}

impl Synchronizer {
    /// A synchronizer for `pid`.
    pub fn new(pid: ProcessId) -> Self {
        Self { pid, passes: 0 }
    }

    /// Number of completed exchanges.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Refresh every field's ghost zone from its owners.
    ///
    /// Collective: every process must call this in the same phase with
    /// the same table version. Owned data is never written.
    ///
    /// # Errors
    ///
    /// [`SimError::Comm`] if a neighbour does not answer and
    /// [`SimError::HaloMismatch`] if a batch does not match the ghost set
    /// this process expects from its sender.
    pub fn sync(
        &mut self,
        transport: &mut dyn Transport,
        table: &PartitionTable,
        fields: &mut FieldSet,
    ) -> Result<SyncReport, SimError> {
        let me = self.pid;
        let neighbors = table.neighbors(me);
        let mut report = SyncReport {
            neighbors: neighbors.len(),
            ..SyncReport::default()
        };

        let mut outgoing = Vec::with_capacity(neighbors.len());
        for &q in &neighbors {
            let overlaps = table.overlaps(me, q);
            let mut packets = Vec::with_capacity(overlaps.len() * fields.len());
            for field in fields.iter() {
                for o in &overlaps {
                    packets.push(HaloPacket {
                        field: field.index(),
                        rect: o.source.clone(),
                        payload: field.pack_region(&o.source)?,
                    });
                }
            }
            let bytes = HaloBatch {
                sender: me,
                table_version: table.version(),
                packets,
            }
            .encode()?;
            report.bytes_sent += bytes.len() as u64;
            outgoing.push((q, bytes));
        }

        self.copy_wraparound(table, fields, &mut report)?;

        let incoming = transport.exchange(Tag::Halo, outgoing, &neighbors)?;
        for (q, bytes) in incoming {
            report.bytes_received += bytes.len() as u64;
            let batch = HaloBatch::decode(&bytes)?;
            let expected = table.overlaps(q, me);
            if let Err(e) = check_batch(q, &batch, table.version(), &expected, fields.len()) {
                error!(pid = %me, sender = %q, error = %e, "halo batch rejected");
                return Err(e);
            }
            for (packet, o) in batch.packets.iter().zip(expected.iter().cycle()) {
                let shift = o.shift();
                fields
                    .dyn_field_mut(packet.field)?
                    .unpack_region(&o.target, &shift, &packet.payload)?;
                report.packets += 1;
            }
        }

        self.passes += 1;
        trace!(
            pid = %me,
            neighbors = report.neighbors,
            packets = report.packets,
            sent = report.bytes_sent,
            received = report.bytes_received,
            "halo sync"
        );
        Ok(report)
    }

    fn copy_wraparound(
        &self,
        table: &PartitionTable,
        fields: &mut FieldSet,
        report: &mut SyncReport,
    ) -> Result<(), SimError> {
        let own = table.overlaps(self.pid, self.pid);
        if own.is_empty() {
            return Ok(());
        }
        for field in fields.iter_mut() {
            for o in &own {
                let payload = field.pack_region(&o.source)?;
                field.unpack_region(&o.target, &o.shift(), &payload)?;
                report.packets += 1;
            }
        }
        Ok(())
    }
}

/// Validate a batch from `sender` against the overlaps this process
/// expects: same table version, one packet per (field, overlap) in field
/// then overlap order, rectangles equal to the sender-frame sources.
fn check_batch(
    sender: ProcessId,
    batch: &HaloBatch,
    version: u64,
    expected: &[Overlap],
    num_fields: usize,
) -> Result<(), SimError> {
    let mismatch = |detail: String| SimError::HaloMismatch { sender, detail };
    if batch.sender != sender {
        return Err(mismatch(format!("batch claims sender {}", batch.sender)));
    }
    if batch.table_version != version {
        return Err(mismatch(format!(
            "batch packed against table version {}, local version is {version}",
            batch.table_version
        )));
    }
    if batch.packets.len() != expected.len() * num_fields {
        return Err(mismatch(format!(
            "{} packets, expected {} fields x {} overlaps",
            batch.packets.len(),
            num_fields,
            expected.len()
        )));
    }
    for (i, packet) in batch.packets.iter().enumerate() {
        let field = i / expected.len().max(1);
        let o = &expected[i % expected.len().max(1)];
        if packet.field.0 as usize != field || packet.rect != o.source {
            return Err(mismatch(format!(
                "packet {i} is field {} rect {}, expected field {field} rect {}",
                packet.field, packet.rect, o.source
            )));
        }
    }
    Ok(())
}
