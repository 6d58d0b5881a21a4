//! The [`Transport`] trait and its blocking collectives.
//!
//! A transport delivers tagged byte payloads between processes. Messages
//! from one source with one tag arrive in send order; messages with
//! different tags or sources may interleave, and [`Transport::recv`]
//! must buffer whatever it sees before the message it waits for.
//!
//! The collectives are written once on top of `send`/`recv`. They rely on
//! every process entering the same collectives in the same order, which
//! the lock-step driver guarantees. Sends never block, so "send
//! everything, then receive everything" cannot deadlock.

use std::fmt;

use halo_core::codec::{read_f64_le, write_f64_le};
use halo_core::ProcessId;

use crate::error::CommError;

/// The kind of a transported message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Halo exchange batch.
    Halo,
    /// Migration packet.
    Migration,
    /// Global time barrier value.
    Clock,
    /// Per-process cost report for load balancing.
    Cost,
    /// Plain barrier token.
    Barrier,
    /// Gather to the root.
    Gather,
    /// Broadcast from the root.
    Broadcast,
    /// Scatter from the root.
    Scatter,
    /// Remote fetch reply.
    Fetch,
}

impl Tag {
    /// Wire code of the tag.
    pub fn code(self) -> u8 {
        match self {
            Self::Halo => 1,
            Self::Migration => 2,
            Self::Clock => 3,
            Self::Cost => 4,
            Self::Barrier => 5,
            Self::Gather => 6,
            Self::Broadcast => 7,
            Self::Scatter => 8,
            Self::Fetch => 9,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Halo => "halo",
            Self::Migration => "migration",
            Self::Clock => "clock",
            Self::Cost => "cost",
            Self::Barrier => "barrier",
            Self::Gather => "gather",
            Self::Broadcast => "broadcast",
            Self::Scatter => "scatter",
            Self::Fetch => "fetch",
        };
        f.write_str(name)
    }
}

/// Point-to-point messaging between the processes of one run, plus the
/// collectives built on it.
///
/// Every method blocks until it completes or fails. A peer that stays
/// silent past the implementation's timeout yields [`CommError::Timeout`].
pub trait Transport: Send {
    /// This process.
    fn pid(&self) -> ProcessId;

    /// Number of processes in the run.
    fn num_processes(&self) -> usize;

    /// Send `payload` to `to`. Never blocks on the receiver.
    fn send(&mut self, to: ProcessId, tag: Tag, payload: Vec<u8>) -> Result<(), CommError>;

    /// Receive the next `tag` message from `from`.
    fn recv(&mut self, from: ProcessId, tag: Tag) -> Result<Vec<u8>, CommError>;

    /// Send one payload to each listed peer, then receive one payload from
    /// each peer in `expect_from`, returned in that order.
    fn exchange(
        &mut self,
        tag: Tag,
        outgoing: Vec<(ProcessId, Vec<u8>)>,
        expect_from: &[ProcessId],
    ) -> Result<Vec<(ProcessId, Vec<u8>)>, CommError> {
        for (to, payload) in outgoing {
            self.send(to, tag, payload)?;
        }
        let mut incoming = Vec::with_capacity(expect_from.len());
        for &from in expect_from {
            incoming.push((from, self.recv(from, tag)?));
        }
        Ok(incoming)
    }

    /// Personalised all-to-all: `outgoing[p]` goes to process `p`.
    ///
    /// Returns `incoming[p]`, the payload process `p` addressed to this
    /// one. The entry for this process is passed through locally.
    fn all_to_all(&mut self, tag: Tag, mut outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        let n = self.num_processes();
        let me = self.pid();
        outgoing.resize(n, Vec::new());
        let mut own = Vec::new();
        for (p, payload) in outgoing.into_iter().enumerate() {
            if p == me.index() {
                own = payload;
            } else {
                self.send(ProcessId(p as u32), tag, payload)?;
            }
        }
        let mut incoming = Vec::with_capacity(n);
        for p in 0..n {
            if p == me.index() {
                incoming.push(std::mem::take(&mut own));
            } else {
                incoming.push(self.recv(ProcessId(p as u32), tag)?);
            }
        }
        Ok(incoming)
    }

    /// Every process contributes one payload; every process receives all
    /// of them, indexed by pid.
    fn all_gather(&mut self, tag: Tag, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, CommError> {
        let n = self.num_processes();
        self.all_to_all(tag, vec![payload; n])
    }

    /// Minimum of one `f64` per process, agreed by every process.
    fn all_reduce_min_f64(&mut self, value: f64) -> Result<f64, CommError> {
        let mut buf = Vec::with_capacity(8);
        write_f64_le(&mut buf, value)?;
        let all = self.all_gather(Tag::Clock, buf)?;
        let mut min = f64::INFINITY;
        for bytes in all {
            let v = read_f64_le(&mut bytes.as_slice())?;
            if v < min {
                min = v;
            }
        }
        Ok(min)
    }

    /// Block until every process has reached the barrier.
    fn barrier(&mut self) -> Result<(), CommError> {
        self.all_gather(Tag::Barrier, Vec::new()).map(|_| ())
    }

    /// Collect one payload per process on the root. The root gets
    /// `Some(payloads)` indexed by pid; everyone else gets `None`.
    fn gather(&mut self, tag: Tag, payload: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, CommError> {
        if !self.pid().is_root() {
            self.send(ProcessId::ROOT, tag, payload)?;
            return Ok(None);
        }
        let n = self.num_processes();
        let mut all = Vec::with_capacity(n);
        all.push(payload);
        for p in 1..n {
            all.push(self.recv(ProcessId(p as u32), tag)?);
        }
        Ok(Some(all))
    }

    /// Distribute the root's payload to every process. Non-root callers
    /// pass `None`; a `Some` from them is ignored.
    fn broadcast(&mut self, tag: Tag, payload: Option<Vec<u8>>) -> Result<Vec<u8>, CommError> {
        if !self.pid().is_root() {
            return self.recv(ProcessId::ROOT, tag);
        }
        let payload = payload.unwrap_or_default();
        for p in 1..self.num_processes() {
            self.send(ProcessId(p as u32), tag, payload.clone())?;
        }
        Ok(payload)
    }

    /// Hand `payloads[p]` from the root to process `p`. Non-root callers
    /// pass `None`. Missing entries arrive empty.
    fn scatter(&mut self, tag: Tag, payloads: Option<Vec<Vec<u8>>>) -> Result<Vec<u8>, CommError> {
        if !self.pid().is_root() {
            return self.recv(ProcessId::ROOT, tag);
        }
        let mut payloads = payloads.unwrap_or_default();
        payloads.resize(self.num_processes(), Vec::new());
        let mut own = Vec::new();
        for (p, payload) in payloads.into_iter().enumerate() {
            if p == 0 {
                own = payload;
            } else {
                self.send(ProcessId(p as u32), tag, payload)?;
            }
        }
        Ok(own)
    }
}
