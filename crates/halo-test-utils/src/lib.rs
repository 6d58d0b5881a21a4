//! Test utilities for Halo development.
//!
//! Provides a handful of deterministic agents ([`fixtures`]), standard
//! cluster configurations, and [`run_cluster`], which runs one
//! [`DistributedSimState`] per thread over an in-process transport.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use halo_comm::{EndpointDirectory, LocalCluster, LocalDirectory};
use halo_engine::{AgentRegistry, ClusterConfig, DistributedSimState};
use halo_partition::PartitionPolicy;

pub use fixtures::{registry, RandomWalker, Ticker, Walker};

/// A `domain` torus split `n` ways under `policy`, with a short
/// collective timeout so a wedged test fails quickly.
pub fn torus(domain: &[i32], n: usize, policy: PartitionPolicy) -> ClusterConfig {
    ClusterConfig {
        domain: domain.to_vec(),
        aoi: 2,
        num_processes: n,
        toroidal: true,
        policy,
        collective_timeout: Duration::from_secs(10),
        ..ClusterConfig::default()
    }
}

/// Like [`torus`] but with hard edges.
pub fn bounded(domain: &[i32], n: usize, policy: PartitionPolicy) -> ClusterConfig {
    ClusterConfig {
        toroidal: false,
        ..torus(domain, n, policy)
    }
}

/// Run `body` once per process, each on its own thread with its own
/// driver, and return the results indexed by pid.
///
/// Panics in any process are re-raised on the caller's thread.
pub fn run_cluster<T, F>(config: ClusterConfig, registry: AgentRegistry, body: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(DistributedSimState) -> T + Send + Sync + 'static,
{
    let endpoints = LocalCluster::endpoints(config.num_processes, config.collective_timeout);
    let directory: Arc<dyn EndpointDirectory> = Arc::new(LocalDirectory::new());
    let body = Arc::new(body);
    let handles: Vec<_> = endpoints
        .into_iter()
        .enumerate()
        .map(|(p, endpoint)| {
            let config = config.clone();
            let registry = registry.clone();
            let directory = Arc::clone(&directory);
            let body = Arc::clone(&body);
            thread::Builder::new()
                .name(format!("halo-p{p}"))
                .spawn(move || {
                    let sim = DistributedSimState::new(config, Box::new(endpoint), directory, registry)
                        .expect("driver construction failed");
                    body(sim)
                })
                .expect("failed to spawn process thread")
        })
        .collect();
    handles
        .into_iter()
        .map(|h| match h.join() {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        })
        .collect()
}
