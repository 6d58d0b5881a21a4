//! In-process transport: one endpoint per thread over crossbeam channels.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use halo_core::ProcessId;

use crate::error::CommError;
use crate::transport::{Tag, Transport};

struct Envelope {
    source: ProcessId,
    tag: Tag,
    payload: Vec<u8>,
}

/// Builder for a fully connected mesh of [`LocalEndpoint`]s.
pub struct LocalCluster;

impl LocalCluster {
    /// Create `n` connected endpoints; endpoint `i` is process `i`.
    ///
    /// A `recv` that sees nothing from its peer for `timeout` fails with
    /// [`CommError::Timeout`].
    pub fn endpoints(n: usize, timeout: Duration) -> Vec<LocalEndpoint> {
        let (senders, receivers): (Vec<Sender<Envelope>>, Vec<Receiver<Envelope>>) =
            (0..n).map(|_| crossbeam_channel::unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(i, inbox)| LocalEndpoint {
                pid: ProcessId(i as u32),
                peers: senders.clone(),
                inbox,
                pending: HashMap::new(),
                timeout,
                bytes_sent: 0,
                bytes_received: 0,
            })
            .collect()
    }
}

/// One process's end of a [`LocalCluster`].
pub struct LocalEndpoint {
    pid: ProcessId,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    pending: HashMap<(ProcessId, Tag), VecDeque<Vec<u8>>>,
    timeout: Duration,
    bytes_sent: u64,
    bytes_received: u64,
}

impl LocalEndpoint {
    /// Total payload bytes sent and received so far.
    pub fn traffic(&self) -> (u64, u64) {
        (self.bytes_sent, self.bytes_received)
    }

    fn take_pending(&mut self, from: ProcessId, tag: Tag) -> Option<Vec<u8>> {
        let queue = self.pending.get_mut(&(from, tag))?;
        let payload = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(&(from, tag));
        }
        payload
    }
}

impl Transport for LocalEndpoint {
    fn pid(&self) -> ProcessId {
        self.pid
    }

    fn num_processes(&self) -> usize {
        self.peers.len()
    }

    fn send(&mut self, to: ProcessId, tag: Tag, payload: Vec<u8>) -> Result<(), CommError> {
        let peer = self
            .peers
            .get(to.index())
            .ok_or(CommError::Disconnected { peer: to })?;
        self.bytes_sent += payload.len() as u64;
        peer.send(Envelope {
            source: self.pid,
            tag,
            payload,
        })
        .map_err(|_| CommError::Disconnected { peer: to })
    }

    fn recv(&mut self, from: ProcessId, tag: Tag) -> Result<Vec<u8>, CommError> {
        if let Some(payload) = self.take_pending(from, tag) {
            return Ok(payload);
        }
        let start = Instant::now();
        let deadline = start + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inbox.recv_timeout(remaining) {
                Ok(env) => {
                    self.bytes_received += env.payload.len() as u64;
                    if env.source == from && env.tag == tag {
                        return Ok(env.payload);
                    }
                    self.pending
                        .entry((env.source, env.tag))
                        .or_default()
                        .push_back(env.payload);
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(CommError::Timeout {
                        peer: from,
                        tag,
                        waited: start.elapsed(),
                    })
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CommError::Disconnected { peer: from })
                }
            }
        }
    }
}
