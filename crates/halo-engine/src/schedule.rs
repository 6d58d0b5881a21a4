//! The process-local event queue.
//!
//! Events are keyed by `(time, ordering, insertion)`; each agent has at
//! most one pending event. Rescheduling or extracting an agent leaves its
//! old heap entry in place and marks it stale; stale entries are dropped
//! when they reach the top.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use halo_core::{AgentId, PreconditionError, ScheduleParams, AFTER_SIMULATION, EPOCH};

#[derive(Debug)]
struct Entry {
    time: f64,
    ordering: i32,
    seq: u64,
    agent: AgentId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest event.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.ordering.cmp(&self.ordering))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue of agent events for one process.
#[derive(Debug)]
pub struct Schedule {
    heap: BinaryHeap<Entry>,
    live: HashMap<AgentId, (u64, ScheduleParams)>,
    next_seq: u64,
    now: f64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}

impl Schedule {
    /// An empty schedule at [`EPOCH`].
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_seq: 0,
            now: EPOCH,
        }
    }

    /// The time of the batch being (or last) executed.
    pub fn now(&self) -> f64 {
        self.now
    }

    /// Advance the current time. Never moves backwards.
    pub fn advance_to(&mut self, time: f64) {
        if time > self.now {
            self.now = time;
        }
    }

    /// Number of agents with a pending event.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no event is pending.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Put `agent` in the queue, replacing any event it already had.
    ///
    /// Fails if the parameters are invalid or `params.time` is before the
    /// current time. An event at exactly the current time still runs in
    /// the current batch.
    pub fn schedule(&mut self, agent: AgentId, params: ScheduleParams) -> Result<(), PreconditionError> {
        if !params.is_valid() || params.time < self.now {
            return Err(PreconditionError::InvalidSchedule {
                time: params.time,
                now: self.now,
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(agent, (seq, params));
        self.heap.push(Entry {
            time: params.time,
            ordering: params.ordering,
            seq,
            agent,
        });
        Ok(())
    }

    /// The pending event of `agent`, if any.
    pub fn pending(&self, agent: AgentId) -> Option<ScheduleParams> {
        self.live.get(&agent).map(|&(_, p)| p)
    }

    /// Remove and return the pending event of `agent`.
    pub fn extract(&mut self, agent: AgentId) -> Option<ScheduleParams> {
        self.live.remove(&agent).map(|(_, p)| p)
    }

    /// Time of the earliest pending event, or [`AFTER_SIMULATION`].
    pub fn next_time(&mut self) -> f64 {
        self.prune();
        self.heap.peek().map_or(AFTER_SIMULATION, |e| e.time)
    }

    /// Pop the next event due at or before `time`.
    ///
    /// The agent's entry is removed; repeating agents must be put back by
    /// the caller.
    pub fn pop_due(&mut self, time: f64) -> Option<(AgentId, ScheduleParams)> {
        self.prune();
        if self.heap.peek()?.time > time {
            return None;
        }
        let entry = self.heap.pop()?;
        let (_, params) = self.live.remove(&entry.agent)?;
        Some((entry.agent, params))
    }

    fn prune(&mut self) {
        while let Some(top) = self.heap.peek() {
            match self.live.get(&top.agent) {
                Some(&(seq, _)) if seq == top.seq => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(n: u64) -> AgentId {
        AgentId(n)
    }

    #[test]
    fn pops_in_time_then_ordering_then_insertion_order() {
        let mut s = Schedule::new();
        s.schedule(id(1), ScheduleParams::once(2.0, 0)).unwrap();
        s.schedule(id(2), ScheduleParams::once(1.0, 5)).unwrap();
        s.schedule(id(3), ScheduleParams::once(1.0, -1)).unwrap();
        s.schedule(id(4), ScheduleParams::once(1.0, 5)).unwrap();

        assert_eq!(s.next_time(), 1.0);
        let order: Vec<u64> = std::iter::from_fn(|| s.pop_due(1.0)).map(|(a, _)| a.0).collect();
        assert_eq!(order, vec![3, 2, 4]);
        assert_eq!(s.next_time(), 2.0);
        assert!(s.pop_due(1.5).is_none());
    }

    #[test]
    fn rescheduling_replaces_the_pending_event() {
        let mut s = Schedule::new();
        s.schedule(id(1), ScheduleParams::once(1.0, 0)).unwrap();
        s.schedule(id(1), ScheduleParams::repeating(3.0, 1.0, 0)).unwrap();
        assert_eq!(s.len(), 1);
        assert_eq!(s.next_time(), 3.0);
        let (_, p) = s.pop_due(3.0).unwrap();
        assert_eq!(p.interval, Some(1.0));
        assert!(s.is_empty());
        assert_eq!(s.next_time(), AFTER_SIMULATION);
    }

    #[test]
    fn extracted_agents_never_fire() {
        let mut s = Schedule::new();
        s.schedule(id(1), ScheduleParams::repeating(1.0, 2.0, 3)).unwrap();
        s.schedule(id(2), ScheduleParams::once(4.0, 0)).unwrap();
        assert_eq!(s.extract(id(1)), Some(ScheduleParams::repeating(1.0, 2.0, 3)));
        assert_eq!(s.extract(id(1)), None);
        assert_eq!(s.next_time(), 4.0);
    }

    #[test]
    fn past_and_invalid_times_are_rejected() {
        let mut s = Schedule::new();
        s.advance_to(5.0);
        s.advance_to(2.0);
        assert_eq!(s.now(), 5.0);
        assert!(s.schedule(id(1), ScheduleParams::once(4.0, 0)).is_err());
        assert!(s.schedule(id(1), ScheduleParams::once(f64::NAN, 0)).is_err());
        assert!(s.schedule(id(1), ScheduleParams::once(5.0, 0)).is_ok());
    }

    proptest! {
        #[test]
        fn pops_never_go_back_in_time(
            events in prop::collection::vec((0u32..50, -3i32..3), 1..40),
            replaced in prop::collection::vec(0usize..40, 0..10),
        ) {
            let mut s = Schedule::new();
            for (i, &(t, o)) in events.iter().enumerate() {
                s.schedule(id(i as u64), ScheduleParams::once(t as f64, o)).unwrap();
            }
            for &i in &replaced {
                if i < events.len() {
                    s.schedule(id(i as u64), ScheduleParams::once(60.0, 0)).unwrap();
                }
            }
            let popped: Vec<(f64, i32)> = std::iter::from_fn(|| s.pop_due(f64::MAX))
                .map(|(_, p)| (p.time, p.ordering))
                .collect();
            prop_assert_eq!(popped.len(), events.len());
            prop_assert!(popped.windows(2).all(|w| w[0] <= w[1]));
            prop_assert!(s.is_empty());
        }
    }
}
