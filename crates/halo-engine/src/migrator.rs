//! [`ObjectMigrator`]: per-process outbound queue and the migration flush.

use halo_comm::{FieldParcel, HaloPacket, MigrationPacket, Tag, Transport, Transportee};
use halo_core::ProcessId;
use halo_partition::PartitionTable;
use tracing::{debug, error};

use crate::error::SimError;

/// Everything a flush delivered to this process, in sender order.
#[derive(Debug, Default)]
pub struct Inbound {
    /// Arriving agents.
    pub agents: Vec<Transportee>,
    /// Arriving field objects.
    pub parcels: Vec<FieldParcel>,
    /// Owned cells handed over by a rebalance, in canonical coordinates.
    pub regions: Vec<HaloPacket>,
    /// Encoded bytes sent.
    pub bytes_sent: u64,
    /// Encoded bytes received.
    pub bytes_received: u64,
}

impl Inbound {
    /// Whether nothing arrived.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.parcels.is_empty() && self.regions.is_empty()
    }
}

/// Collects departures during a step and delivers them at the flush.
#[derive(Debug)]
pub struct ObjectMigrator {
    pid: ProcessId,
    agents: Vec<Transportee>,
    parcels: Vec<FieldParcel>,
    regions: Vec<(ProcessId, HaloPacket)>,
}

impl ObjectMigrator {
    /// An empty migrator for `pid`.
    pub fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            agents: Vec::new(),
            parcels: Vec::new(),
            regions: Vec::new(),
        }
    }

    /// Queue an agent for its envelope's destination.
    pub fn enqueue(&mut self, transportee: Transportee) {
        self.agents.push(transportee);
    }

    /// Queue a field object for its parcel's destination.
    pub fn enqueue_parcel(&mut self, parcel: FieldParcel) {
        self.parcels.push(parcel);
    }

    /// Queue a block of owned cells for its new owner `to`.
    pub fn hand_over(&mut self, to: ProcessId, region: HaloPacket) {
        self.regions.push((to, region));
    }

    /// Number of queued items.
    pub fn pending(&self) -> usize {
        self.agents.len() + self.parcels.len() + self.regions.len()
    }

    /// Deliver every queued item and collect what others sent here.
    ///
    /// Collective: every process sends one (possibly empty) packet to
    /// every other process, so the flush completes even for
    /// destinations that are not halo neighbours.
    ///
    /// # Errors
    ///
    /// [`SimError::MigrationMismatch`] if an arriving item was routed with
    /// a different table than this process's, or to the wrong process.
    pub fn flush(
        &mut self,
        transport: &mut dyn Transport,
        table: &PartitionTable,
    ) -> Result<Inbound, SimError> {
        let me = self.pid;
        let n = table.num_processes();
        let mut packets: Vec<MigrationPacket> = (0..n)
            .map(|_| MigrationPacket {
                sender: me,
                table_version: table.version(),
                agents: Vec::new(),
                parcels: Vec::new(),
                regions: Vec::new(),
            })
            .collect();
        let out_agents = self.agents.len();
        for t in self.agents.drain(..) {
            slot(&mut packets, t.destination)?.agents.push(t);
        }
        for p in self.parcels.drain(..) {
            slot(&mut packets, p.destination)?.parcels.push(p);
        }
        for (to, region) in self.regions.drain(..) {
            slot(&mut packets, to)?.regions.push(region);
        }

        let mut inbound = Inbound::default();
        let mut local = None;
        let mut outgoing = Vec::with_capacity(n);
        for (p, packet) in packets.into_iter().enumerate() {
            if p == me.index() {
                local = Some(packet);
                outgoing.push(Vec::new());
            } else {
                let bytes = packet.encode()?;
                inbound.bytes_sent += bytes.len() as u64;
                outgoing.push(bytes);
            }
        }

        let incoming = transport.all_to_all(Tag::Migration, outgoing)?;
        for (p, bytes) in incoming.into_iter().enumerate() {
            let sender = ProcessId(p as u32);
            let packet = if sender == me {
                match local.take() {
                    Some(packet) => packet,
                    None => continue,
                }
            } else {
                inbound.bytes_received += bytes.len() as u64;
                MigrationPacket::decode(&bytes)?
            };
            if let Err(e) = check_packet(me, sender, &packet, table) {
                error!(pid = %me, sender = %sender, error = %e, "migration packet rejected");
                return Err(e);
            }
            inbound.agents.extend(packet.agents);
            inbound.parcels.extend(packet.parcels);
            inbound.regions.extend(packet.regions);
        }
        debug!(
            pid = %me,
            out = out_agents,
            arrived = inbound.agents.len(),
            parcels = inbound.parcels.len(),
            regions = inbound.regions.len(),
            "migration flush"
        );
        Ok(inbound)
    }
}

fn slot(packets: &mut [MigrationPacket], to: ProcessId) -> Result<&mut MigrationPacket, SimError> {
    let sender = packets.first().map_or(ProcessId::ROOT, |p| p.sender);
    packets
        .get_mut(to.index())
        .ok_or_else(|| SimError::MigrationMismatch {
            sender,
            detail: format!("destination {to} is not a process of this run"),
        })
}

/// Recompute every destination with the local table.
fn check_packet(
    me: ProcessId,
    sender: ProcessId,
    packet: &MigrationPacket,
    table: &PartitionTable,
) -> Result<(), SimError> {
    let mismatch = |detail: String| SimError::MigrationMismatch { sender, detail };
    if packet.sender != sender {
        return Err(mismatch(format!("packet claims sender {}", packet.sender)));
    }
    if packet.table_version != table.version() {
        return Err(mismatch(format!(
            "routed with table version {}, local version is {}",
            packet.table_version,
            table.version()
        )));
    }
    for t in &packet.agents {
        let owner = table.owner_of_position(&t.position)?;
        if t.destination != me || owner != me {
            return Err(mismatch(format!(
                "agent {} at {:?} addressed to {}, owner here is {owner}",
                t.agent, t.position, t.destination
            )));
        }
    }
    for p in &packet.parcels {
        let owner = table.owner_of_position(&p.position)?;
        if p.destination != me || owner != me {
            return Err(mismatch(format!(
                "object {} at {:?} addressed to {}, owner here is {owner}",
                p.object, p.position, p.destination
            )));
        }
    }
    if let Some(owned) = table.rect(me) {
        if let Some(r) = packet.regions.iter().find(|r| !owned.contains_rect(&r.rect)) {
            return Err(mismatch(format!("handed-over region {} is not inside {owned}", r.rect)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_core::{AgentId, Rect, ScheduleParams};
    use halo_partition::UniformGrid;
    use smallvec::smallvec;

    fn table() -> PartitionTable {
        UniformGrid::new(Rect::from_extents(&[10, 10]), 1, false, 2)
            .unwrap()
            .table()
            .clone()
    }

    fn walker(destination: u32, x: f64) -> Transportee {
        Transportee {
            agent: AgentId::compose(ProcessId(0), 1),
            kind: "walker".into(),
            state: Vec::new(),
            destination: ProcessId(destination),
            position: smallvec![x, 1.0],
            home: None,
            home_value: None,
            schedule: Some(ScheduleParams::repeating(2.0, 1.0, 0)),
        }
    }

    fn packet(agents: Vec<Transportee>, version: u64) -> MigrationPacket {
        MigrationPacket {
            sender: ProcessId(0),
            table_version: version,
            agents,
            parcels: Vec::new(),
            regions: Vec::new(),
        }
    }

    #[test]
    fn correctly_routed_agents_are_accepted() {
        let t = table();
        let p = packet(vec![walker(1, 5.5)], t.version());
        assert!(check_packet(ProcessId(1), ProcessId(0), &p, &t).is_ok());
    }

    #[test]
    fn stale_destinations_are_fatal() {
        let t = table();
        // (4.5, 1) is owned by process 0, not the receiver.
        let p = packet(vec![walker(1, 4.5)], t.version());
        assert!(matches!(
            check_packet(ProcessId(1), ProcessId(0), &p, &t),
            Err(SimError::MigrationMismatch { .. })
        ));
        let p = packet(vec![walker(1, 5.5)], t.version() + 1);
        assert!(check_packet(ProcessId(1), ProcessId(0), &p, &t).is_err());
        let p = packet(vec![walker(0, 5.5)], t.version());
        assert!(check_packet(ProcessId(1), ProcessId(0), &p, &t).is_err());
    }

    #[test]
    fn regions_must_land_in_the_receivers_partition() {
        let t = table();
        let mut p = packet(Vec::new(), t.version());
        p.regions.push(HaloPacket {
            field: halo_core::FieldIndex(0),
            rect: Rect::new(smallvec![4, 0], smallvec![6, 10]),
            payload: Vec::new(),
        });
        assert!(check_packet(ProcessId(1), ProcessId(0), &p, &t).is_err());
    }

    #[test]
    fn queue_accounting() {
        let mut m = ObjectMigrator::new(ProcessId(0));
        m.enqueue(walker(1, 5.5));
        m.hand_over(
            ProcessId(1),
            HaloPacket {
                field: halo_core::FieldIndex(0),
                rect: Rect::new(smallvec![5, 0], smallvec![6, 10]),
                payload: Vec::new(),
            },
        );
        assert_eq!(m.pending(), 2);
    }
}
