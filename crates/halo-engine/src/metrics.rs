//! Per-step performance metrics for the step driver.
//!
//! [`StepMetrics`] captures phase timings and traffic for a single step.
//! The wall-clock local step time also feeds the load balancer's moving
//! average.

/// Timing and traffic metrics collected during a single step.
///
/// All durations are in microseconds. The driver replaces these after
/// every `step()`; read them from the most recent step.
#[derive(Clone, Debug, Default)]
pub struct StepMetrics {
    /// Global time the step executed.
    pub time: f64,
    /// Wall-clock time for the entire step.
    pub total_us: u64,
    /// Time spent running local agents.
    pub local_step_us: u64,
    /// Time spent in halo exchanges (both passes when enabled).
    pub halo_sync_us: u64,
    /// Time spent in the migration flush.
    pub migration_us: u64,
    /// Time spent waiting in the global time barrier.
    pub barrier_us: u64,
    /// Time spent in the rebalance phase, including the cost exchange.
    pub rebalance_us: u64,
    /// Agents stepped locally.
    pub agents_stepped: u64,
    /// Agents that left this process.
    pub agents_out: u64,
    /// Agents that arrived at this process.
    pub agents_in: u64,
    /// Encoded bytes sent in halo and migration messages.
    pub bytes_sent: u64,
    /// Encoded bytes received in halo and migration messages.
    pub bytes_received: u64,
    /// Whether the partition table changed during this step.
    pub rebalanced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_metrics_are_zero() {
        let m = StepMetrics::default();
        assert_eq!(m.total_us, 0);
        assert_eq!(m.agents_in + m.agents_out, 0);
        assert_eq!(m.bytes_sent, 0);
        assert!(!m.rebalanced);
    }
}
