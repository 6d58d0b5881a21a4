//! Cluster configuration, validation, and error types.
//!
//! [`ClusterConfig`] is the input every process constructs its
//! [`ClusterContext`](crate::ClusterContext) from. All processes of one run
//! must use identical configurations; [`validate()`](ClusterConfig::validate)
//! checks the structural invariants that do not depend on the partition
//! scheme. AOI-versus-extent checks happen when the scheme is built.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use halo_core::Rect;
use halo_partition::PartitionPolicy;

// ── BalanceConfig ─────────────────────────────────────────────────

/// What a process reports as its load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CostMetric {
    /// Measured wall-clock time of the local step phase.
    #[default]
    WallClock,
    /// Number of resident agents. Deterministic, used by tests.
    AgentCount,
}

impl fmt::Display for CostMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WallClock => write!(f, "wall-clock"),
            Self::AgentCount => write!(f, "agent-count"),
        }
    }
}

/// Configuration for periodic load rebalancing.
#[derive(Clone, Debug, PartialEq)]
pub struct BalanceConfig {
    /// Steps between rebalance checks. Default: 10.
    pub interval: u64,
    /// Ratio of the most loaded process's cost to the average above which
    /// a repartition is attempted. Must exceed 1.0. Default: 1.25.
    pub skew_threshold: f64,
    /// Number of steps in the cost moving average. Default: 5.
    pub window: usize,
    /// Cost source. Default: [`CostMetric::WallClock`].
    pub metric: CostMetric,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            interval: 10,
            skew_threshold: 1.25,
            window: 5,
            metric: CostMetric::WallClock,
        }
    }
}

impl BalanceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(ConfigError::InvalidBalance {
                reason: "interval must be at least 1 step".into(),
            });
        }
        if !self.skew_threshold.is_finite() || self.skew_threshold <= 1.0 {
            return Err(ConfigError::InvalidBalance {
                reason: format!(
                    "skew_threshold must be finite and above 1.0, got {}",
                    self.skew_threshold
                ),
            });
        }
        if self.window == 0 {
            return Err(ConfigError::InvalidBalance {
                reason: "window must be at least 1 step".into(),
            });
        }
        Ok(())
    }
}

// ── ConfigError ───────────────────────────────────────────────────

/// Errors detected during [`ClusterConfig::validate()`].
#[derive(Debug, PartialEq)]
pub enum ConfigError {
    /// The domain has no axes.
    EmptyDomain,
    /// A domain axis has zero or negative extent.
    NonPositiveExtent {
        /// The offending axis.
        axis: usize,
        /// Its configured extent.
        extent: i32,
    },
    /// The halo radius is negative.
    NegativeAoi {
        /// The configured radius.
        aoi: i32,
    },
    /// `num_processes` is zero.
    ZeroProcesses,
    /// The collective timeout is zero.
    ZeroTimeout,
    /// `end_time` is NaN, infinite or negative.
    InvalidEndTime {
        /// The invalid value.
        value: f64,
    },
    /// A [`BalanceConfig`] invariant is violated.
    InvalidBalance {
        /// Which invariant.
        reason: String,
    },
    /// The transport handed to the context disagrees with the config.
    TransportMismatch {
        /// Description of the disagreement.
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyDomain => write!(f, "domain has no axes"),
            Self::NonPositiveExtent { axis, extent } => {
                write!(f, "domain axis {axis} has extent {extent}, must be positive")
            }
            Self::NegativeAoi { aoi } => write!(f, "aoi must be non-negative, got {aoi}"),
            Self::ZeroProcesses => write!(f, "num_processes must be at least 1"),
            Self::ZeroTimeout => write!(f, "collective_timeout must be non-zero"),
            Self::InvalidEndTime { value } => {
                write!(f, "end_time must be finite and non-negative, got {value}")
            }
            Self::InvalidBalance { reason } => write!(f, "invalid balance config: {reason}"),
            Self::TransportMismatch { reason } => write!(f, "transport mismatch: {reason}"),
        }
    }
}

impl Error for ConfigError {}

// ── ClusterConfig ─────────────────────────────────────────────────

/// Complete configuration of one distributed run.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterConfig {
    /// Extent per axis; the domain is `[0, extent)` on every axis.
    /// Default: `[100, 100]`.
    pub domain: Vec<i32>,
    /// Halo radius in cells. Default: 1.
    pub aoi: i32,
    /// Number of processes (partitions). Default: 1.
    pub num_processes: usize,
    /// Whether the domain wraps on every axis. Default: false.
    pub toroidal: bool,
    /// Initial decomposition. Default: [`PartitionPolicy::QuadTree`].
    pub policy: PartitionPolicy,
    /// Load balancing; `None` disables it. Default: `None`.
    pub balance: Option<BalanceConfig>,
    /// How long a process waits for a silent peer before the run fails.
    /// Default: 30 s.
    pub collective_timeout: Duration,
    /// Base RNG seed; each process derives its stream from `(seed, pid)`.
    /// Default: 0.
    pub seed: u64,
    /// Run a second halo sync after the migration flush so ghosts show
    /// the agents that just arrived. Default: true.
    pub refresh_halo_after_migration: bool,
    /// Events at or after this time are not run. Default: `None`.
    pub end_time: Option<f64>,
    /// Keep statistics passed to `add_stat`. Default: false.
    pub record_stats: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            domain: vec![100, 100],
            aoi: 1,
            num_processes: 1,
            toroidal: false,
            policy: PartitionPolicy::QuadTree,
            balance: None,
            collective_timeout: Duration::from_secs(30),
            seed: 0,
            refresh_halo_after_migration: true,
            end_time: None,
            record_stats: false,
        }
    }
}

impl ClusterConfig {
    /// The domain as a rectangle.
    pub fn world(&self) -> Rect {
        Rect::from_extents(&self.domain)
    }

    /// Check every structural invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.is_empty() {
            return Err(ConfigError::EmptyDomain);
        }
        if let Some((axis, &extent)) = self.domain.iter().enumerate().find(|&(_, &e)| e <= 0) {
            return Err(ConfigError::NonPositiveExtent { axis, extent });
        }
        if self.aoi < 0 {
            return Err(ConfigError::NegativeAoi { aoi: self.aoi });
        }
        if self.num_processes == 0 {
            return Err(ConfigError::ZeroProcesses);
        }
        if self.collective_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if let Some(end) = self.end_time {
            if !end.is_finite() || end < 0.0 {
                return Err(ConfigError::InvalidEndTime { value: end });
            }
        }
        if let Some(balance) = &self.balance {
            balance.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(ClusterConfig::default().validate(), Ok(()));
        assert_eq!(ClusterConfig::default().world().volume(), 10_000);
    }

    #[test]
    fn structural_errors_are_reported() {
        let cfg = ClusterConfig {
            domain: vec![10, 0],
            ..ClusterConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::NonPositiveExtent { axis: 1, extent: 0 })
        );

        let cfg = ClusterConfig {
            num_processes: 0,
            ..ClusterConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroProcesses));

        let cfg = ClusterConfig {
            end_time: Some(f64::NAN),
            ..ClusterConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidEndTime { .. })));
    }

    #[test]
    fn balance_threshold_must_exceed_one() {
        let cfg = ClusterConfig {
            balance: Some(BalanceConfig {
                skew_threshold: 1.0,
                ..BalanceConfig::default()
            }),
            ..ClusterConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidBalance { .. })));
    }
}
