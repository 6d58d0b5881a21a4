//! Logical simulation time and schedule re-insertion parameters.

/// The first instant of a simulation.
pub const EPOCH: f64 = 0.0;

/// Sentinel time meaning "nothing left to run".
///
/// A process whose local schedule is empty reports this as its next event
/// time. The distributed run ends only when the min-reduced next time of
/// every process equals this value.
pub const AFTER_SIMULATION: f64 = f64::INFINITY;

/// Where and how an agent sits in a schedule.
///
/// Carried verbatim inside a migration envelope so the destination
/// re-inserts the agent at exactly the same next-fire time, ordering and
/// repeat interval it had at the source.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScheduleParams {
    /// Next time the agent fires.
    pub time: f64,
    /// Tie-breaker among events at the same time (lower fires first).
    pub ordering: i32,
    /// Repeat interval for repeating agents; `None` for one-shot events.
    pub interval: Option<f64>,
}

impl ScheduleParams {
    /// A one-shot event at `time`.
    pub fn once(time: f64, ordering: i32) -> Self {
        Self {
            time,
            ordering,
            interval: None,
        }
    }

    /// A repeating event first firing at `time`, then every `interval`.
    pub fn repeating(time: f64, interval: f64, ordering: i32) -> Self {
        Self {
            time,
            ordering,
            interval: Some(interval),
        }
    }

    /// Whether the parameters describe a schedulable event: a finite,
    /// non-negative time and, if repeating, a finite positive interval.
    pub fn is_valid(&self) -> bool {
        self.time.is_finite()
            && self.time >= EPOCH
            && self.interval.is_none_or(|i| i.is_finite() && i > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity() {
        assert!(ScheduleParams::once(0.0, 0).is_valid());
        assert!(ScheduleParams::repeating(1.0, 0.5, 2).is_valid());
        assert!(!ScheduleParams::once(-1.0, 0).is_valid());
        assert!(!ScheduleParams::once(f64::NAN, 0).is_valid());
        assert!(!ScheduleParams::repeating(1.0, 0.0, 0).is_valid());
        assert!(!ScheduleParams::once(AFTER_SIMULATION, 0).is_valid());
    }
}
