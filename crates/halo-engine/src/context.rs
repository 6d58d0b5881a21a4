//! [`ClusterContext`]: the per-process handles of a distributed run.
//!
//! # Ownership model
//!
//! The context owns the process's transport endpoint, its partition
//! scheme and the fetch server thread. The current partition table lives
//! in two places: a [`SharedTable`] read by the fetch server and the
//! fields, and a plain snapshot the step thread uses for routing. Both
//! are replaced together, and only by [`repartition`](ClusterContext::repartition).

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use halo_comm::{EndpointDirectory, FetchServer, OwnedCellHandler, RemoteFieldProxy, Transport};
use halo_core::{ProcessId, Rect};
use halo_field::CellSource;
use halo_partition::{build_scheme, PartitionScheme, PartitionTable, SharedTable};
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, ConfigError};
use crate::error::SimError;

/// Everything one process needs to take part in a run.
pub struct ClusterContext {
    pid: ProcessId,
    transport: Box<dyn Transport>,
    scheme: Box<dyn PartitionScheme>,
    shared: SharedTable,
    view: PartitionTable,
    local: Rect,
    directory: Arc<dyn EndpointDirectory>,
    proxy: Arc<RemoteFieldProxy>,
    server: Option<FetchServer>,
    timeout: Duration,
}

impl ClusterContext {
    /// Validate `config`, build the initial partitioning and bind the
    /// transport endpoint.
    ///
    /// Every process builds the same table independently; nothing is
    /// exchanged yet.
    ///
    /// # Errors
    ///
    /// [`SimError::Config`] if the configuration is invalid or the
    /// transport disagrees with it, [`SimError::Partition`] if the domain
    /// cannot be split as requested.
    pub fn init(
        config: &ClusterConfig,
        transport: Box<dyn Transport>,
        directory: Arc<dyn EndpointDirectory>,
    ) -> Result<Self, SimError> {
        config.validate()?;
        let n = config.num_processes;
        if transport.num_processes() != n {
            return Err(ConfigError::TransportMismatch {
                reason: format!(
                    "transport connects {} processes, config asks for {n}",
                    transport.num_processes()
                ),
            }
            .into());
        }
        let pid = transport.pid();
        if pid.index() >= n {
            return Err(ConfigError::TransportMismatch {
                reason: format!("transport pid {pid} is out of range for {n} processes"),
            }
            .into());
        }
        let scheme = build_scheme(config.policy, config.world(), config.aoi, config.toroidal, n)?;
        let view = scheme.table().clone();
        let shared = Arc::new(RwLock::new(view.clone()));
        let local = local_rect(&view, pid)?;
        let proxy = Arc::new(RemoteFieldProxy::new(pid, n, Arc::clone(&directory)));
        info!(pid = %pid, policy = %config.policy, partition = %local, "cluster context initialised");
        Ok(Self {
            pid,
            transport,
            scheme,
            shared,
            view,
            local,
            directory,
            proxy,
            server: None,
            timeout: config.collective_timeout,
        })
    }

    /// This process.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Number of processes in the run.
    pub fn num_processes(&self) -> usize {
        self.view.num_processes()
    }

    /// The current partition table.
    pub fn table(&self) -> &PartitionTable {
        &self.view
    }

    /// The lock-guarded table shared with fields and the fetch server.
    pub fn shared_table(&self) -> &SharedTable {
        &self.shared
    }

    /// This process's owned rectangle.
    pub fn local_partition(&self) -> &Rect {
        &self.local
    }

    /// The transport endpoint.
    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// The transport together with the table, for collective phases that
    /// route against it.
    pub fn transport_and_table(&mut self) -> (&mut dyn Transport, &PartitionTable) {
        (self.transport.as_mut(), &self.view)
    }

    /// The remote accessor for data outside the halo.
    pub fn proxy(&self) -> Arc<RemoteFieldProxy> {
        Arc::clone(&self.proxy)
    }

    /// Whether the fetch server is running.
    pub fn is_serving(&self) -> bool {
        self.server.is_some()
    }

    /// Start answering remote fetches for `cells` (indexed by field),
    /// then discover every peer's endpoint.
    ///
    /// Collective: includes a barrier between publication and discovery.
    pub fn serve(&mut self, cells: Vec<Arc<dyn CellSource>>) -> Result<(), SimError> {
        if self.server.is_some() {
            return Err(SimError::Lifecycle {
                detail: "fetch server already running".into(),
            });
        }
        let handler = OwnedCellHandler::new(self.pid, Arc::clone(&self.shared), cells);
        let (server, endpoint) = FetchServer::spawn(self.pid, Arc::new(handler), self.timeout)?;
        self.server = Some(server);
        self.directory.publish(endpoint);
        self.rediscover()
    }

    /// Wait for every process, then rebuild the endpoint table.
    pub fn rediscover(&mut self) -> Result<(), SimError> {
        self.transport.barrier()?;
        self.proxy.discover()?;
        Ok(())
    }

    /// Ask the scheme for a table balancing `costs` and install it.
    ///
    /// Returns the replaced table when the partitioning changed. A
    /// proposal the scheme rejects is logged and skipped; every process
    /// reaches the same verdict from the same costs.
    pub fn repartition(&mut self, costs: &[f64]) -> Result<Option<PartitionTable>, SimError> {
        let (next, local) = match self.scheme.rebalance(costs) {
            Ok(Some(next)) => {
                let local = local_rect(&next, self.pid)?;
                (next, local)
            }
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(pid = %self.pid, error = %e, "rebalance proposal rejected");
                return Ok(None);
            }
        };
        {
            let mut shared = self.shared.write().unwrap_or_else(PoisonError::into_inner);
            *shared = next.clone();
        }
        let old = std::mem::replace(&mut self.view, next);
        self.local = local;
        debug!(
            pid = %self.pid,
            version = self.view.version(),
            partition = %self.local,
            "partition table replaced"
        );
        Ok(Some(old))
    }

    /// Stop serving fetches.
    ///
    /// Collective: waits for every process first so no peer is still
    /// reading from this one. Calling it again is a no-op.
    pub fn shutdown(&mut self) -> Result<(), SimError> {
        let Some(mut server) = self.server.take() else {
            return Ok(());
        };
        let synced = self.transport.barrier();
        self.directory.withdraw(self.pid);
        server.shutdown();
        info!(pid = %self.pid, "cluster context shut down");
        synced.map_err(SimError::from)
    }
}

fn local_rect(table: &PartitionTable, pid: ProcessId) -> Result<Rect, SimError> {
    table.rect(pid).cloned().ok_or_else(|| {
        ConfigError::TransportMismatch {
            reason: format!("the partition table has no entry for process {pid}"),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_comm::{LocalCluster, LocalDirectory};
    use halo_partition::PartitionPolicy;

    #[test]
    fn init_rejects_a_transport_of_the_wrong_size() {
        let config = ClusterConfig {
            num_processes: 3,
            ..ClusterConfig::default()
        };
        let ep = LocalCluster::endpoints(2, Duration::from_secs(1)).remove(0);
        let dir: Arc<dyn EndpointDirectory> = Arc::new(LocalDirectory::new());
        assert!(matches!(
            ClusterContext::init(&config, Box::new(ep), dir),
            Err(SimError::Config(ConfigError::TransportMismatch { .. }))
        ));
    }

    #[test]
    fn single_process_owns_the_domain() {
        let config = ClusterConfig {
            domain: vec![20, 10],
            policy: PartitionPolicy::UniformGrid,
            ..ClusterConfig::default()
        };
        let ep = LocalCluster::endpoints(1, Duration::from_secs(1)).remove(0);
        let dir: Arc<dyn EndpointDirectory> = Arc::new(LocalDirectory::new());
        let mut ctx = ClusterContext::init(&config, Box::new(ep), dir).unwrap();
        assert_eq!(ctx.local_partition(), &Rect::from_extents(&[20, 10]));
        ctx.serve(Vec::new()).unwrap();
        assert!(ctx.is_serving());
        ctx.shutdown().unwrap();
        assert!(!ctx.is_serving());
        ctx.shutdown().unwrap();
    }
}
