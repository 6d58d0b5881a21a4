//! [`LoadBalancer`]: windowed cost tracking and the skew decision.

use std::collections::VecDeque;

use halo_comm::{Tag, Transport};
use halo_core::codec::{read_f64_le, write_f64_le};
use halo_core::StepId;

use crate::config::{BalanceConfig, CostMetric};
use crate::error::SimError;

/// Decides when the partition table should be recomputed.
///
/// Every process feeds its per-step cost in; at every `interval`-th step
/// the moving averages are all-gathered and compared. The decision is a
/// pure function of the gathered costs, so all processes agree on it.
#[derive(Debug)]
pub struct LoadBalancer {
    config: BalanceConfig,
    window: VecDeque<f64>,
    checks: u64,
}

impl LoadBalancer {
    /// A balancer with an empty cost window.
    pub fn new(config: BalanceConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window),
            config,
            checks: 0,
        }
    }

    /// The balancing configuration.
    pub fn config(&self) -> &BalanceConfig {
        &self.config
    }

    /// Which cost the driver should record.
    pub fn metric(&self) -> CostMetric {
        self.config.metric
    }

    /// Record one step's cost, evicting the oldest beyond the window.
    pub fn record(&mut self, cost: f64) {
        if self.window.len() == self.config.window {
            self.window.pop_front();
        }
        self.window.push_back(cost.max(0.0));
    }

    /// Mean of the recorded window, or zero if nothing was recorded.
    pub fn average(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Whether `step` (counted from 1 after the first step) is a check step.
    pub fn due(&self, step: StepId) -> bool {
        step.0 > 0 && step.0 % self.config.interval == 0
    }

    /// Number of checks performed.
    pub fn checks(&self) -> u64 {
        self.checks
    }

    /// All-gather every process's moving average, indexed by pid.
    pub fn gather_costs(&mut self, transport: &mut dyn Transport) -> Result<Vec<f64>, SimError> {
        let mut buf = Vec::with_capacity(8);
        write_f64_le(&mut buf, self.average())?;
        let all = transport.all_gather(Tag::Cost, buf)?;
        self.checks += 1;
        let mut costs = Vec::with_capacity(all.len());
        for bytes in all {
            costs.push(read_f64_le(&mut bytes.as_slice())?);
        }
        Ok(costs)
    }

    /// Whether `costs` are skewed past the threshold.
    pub fn should_rebalance(&self, costs: &[f64]) -> bool {
        skew(costs) > self.config.skew_threshold
    }
}

/// Ratio of the largest cost to the mean; 1.0 for empty or all-zero input.
pub fn skew(costs: &[f64]) -> f64 {
    if costs.is_empty() {
        return 1.0;
    }
    let total: f64 = costs.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return 1.0;
    }
    let max = costs.iter().copied().fold(f64::MIN, f64::max);
    max / (total / costs.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_comm::LocalCluster;
    use std::thread;
    use std::time::Duration;

    fn balancer(window: usize) -> LoadBalancer {
        LoadBalancer::new(BalanceConfig {
            interval: 3,
            skew_threshold: 1.5,
            window,
            metric: CostMetric::AgentCount,
        })
    }

    #[test]
    fn moving_average_forgets_old_steps() {
        let mut b = balancer(2);
        assert_eq!(b.average(), 0.0);
        b.record(10.0);
        b.record(20.0);
        b.record(40.0);
        assert_eq!(b.average(), 30.0);
    }

    #[test]
    fn skew_is_max_over_mean() {
        assert_eq!(skew(&[]), 1.0);
        assert_eq!(skew(&[0.0, 0.0]), 1.0);
        assert_eq!(skew(&[1.0, 1.0, 1.0]), 1.0);
        assert_eq!(skew(&[3.0, 1.0]), 1.5);
        let b = balancer(1);
        assert!(!b.should_rebalance(&[3.0, 1.0]));
        assert!(b.should_rebalance(&[7.0, 1.0]));
    }

    #[test]
    fn checks_fall_on_the_interval() {
        let b = balancer(1);
        assert!(!b.due(StepId(0)));
        assert!(!b.due(StepId(2)));
        assert!(b.due(StepId(3)));
        assert!(b.due(StepId(6)));
    }

    #[test]
    fn every_process_sees_the_same_costs() {
        let endpoints = LocalCluster::endpoints(3, Duration::from_secs(5));
        let handles: Vec<_> = endpoints
            .into_iter()
            .enumerate()
            .map(|(p, mut ep)| {
                thread::spawn(move || {
                    let mut b = balancer(4);
                    b.record(p as f64 + 1.0);
                    b.gather_costs(&mut ep).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![1.0, 2.0, 3.0]);
        }
    }
}
