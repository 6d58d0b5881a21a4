//! Blocking request/response fetches of remotely owned cells.
//!
//! Each process runs one [`FetchServer`] thread that answers
//! [`FetchRequest`]s against its owned storage while the step thread keeps
//! running. Clients hold a [`FetchEndpoint`] per peer, found through an
//! [`EndpointDirectory`] (the rendezvous step at startup and after every
//! rebalance).
//!
//! Requests and replies travel as framed bytes, the same as any other
//! message, so an endpoint can be backed by a socket without changing
//! the contract.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use halo_core::ProcessId;
use halo_field::CellSource;
use halo_partition::SharedTable;
use tracing::{debug, warn};

use crate::error::CommError;
use crate::message::{FetchOutcome, FetchRequest, FetchResponse};

/// Answers fetch requests on behalf of one process.
pub trait FetchHandler: Send + Sync {
    /// Produce the answer to `request`.
    fn handle(&self, request: &FetchRequest) -> FetchOutcome;
}

/// Serves owned cells of every registered field, checking ownership
/// against the process's current partition table.
pub struct OwnedCellHandler {
    pid: ProcessId,
    table: SharedTable,
    cells: Vec<Arc<dyn CellSource>>,
}

impl OwnedCellHandler {
    /// Serve `cells` (indexed by field) for `pid`.
    pub fn new(pid: ProcessId, table: SharedTable, cells: Vec<Arc<dyn CellSource>>) -> Self {
        Self { pid, table, cells }
    }
}

impl FetchHandler for OwnedCellHandler {
    fn handle(&self, request: &FetchRequest) -> FetchOutcome {
        let owner = {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            table
                .canonical_coord(&request.coord)
                .and_then(|c| table.owner_of(&c).map(|owner| (c, owner)))
        };
        let canonical = match owner {
            Ok((c, owner)) if owner == self.pid => c,
            Ok(_) => return FetchOutcome::BoundaryMismatch { owner: self.pid },
            Err(e) => {
                return FetchOutcome::Failed {
                    detail: e.to_string(),
                }
            }
        };
        let Some(source) = self.cells.get(request.field.0 as usize) else {
            return FetchOutcome::Failed {
                detail: format!("no field registered at index {}", request.field),
            };
        };
        match source.read_cell(&canonical) {
            Ok(bytes) => FetchOutcome::Value(bytes),
            Err(e) => FetchOutcome::Failed {
                detail: e.to_string(),
            },
        }
    }
}

enum Call {
    Fetch {
        request: Vec<u8>,
        reply: Sender<Vec<u8>>,
    },
    Shutdown,
}

/// Client handle to one process's fetch server. Cheap to clone.
#[derive(Clone)]
pub struct FetchEndpoint {
    owner: ProcessId,
    calls: Sender<Call>,
    timeout: Duration,
}

impl FetchEndpoint {
    /// The process this endpoint reaches.
    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    /// Send `request` and block for the reply.
    pub fn call(&self, request: &FetchRequest) -> Result<FetchResponse, CommError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.calls
            .send(Call::Fetch {
                request: request.encode()?,
                reply: reply_tx,
            })
            .map_err(|_| CommError::Disconnected { peer: self.owner })?;
        let bytes = reply_rx.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => CommError::Timeout {
                peer: self.owner,
                tag: crate::Tag::Fetch,
                waited: self.timeout,
            },
            RecvTimeoutError::Disconnected => CommError::Disconnected { peer: self.owner },
        })?;
        Ok(FetchResponse::decode(&bytes)?)
    }
}

/// A running fetch server thread. Stops and joins on drop.
pub struct FetchServer {
    pid: ProcessId,
    calls: Sender<Call>,
    thread: Option<JoinHandle<()>>,
}

impl FetchServer {
    /// Start a server for `pid` answering with `handler`.
    ///
    /// Returns the server and the endpoint clients use to reach it.
    pub fn spawn(
        pid: ProcessId,
        handler: Arc<dyn FetchHandler>,
        timeout: Duration,
    ) -> Result<(Self, FetchEndpoint), CommError> {
        let (calls, rx) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name(format!("halo-fetch-{pid}"))
            .spawn(move || serve(pid, rx, handler))
            .map_err(CommError::Spawn)?;
        let endpoint = FetchEndpoint {
            owner: pid,
            calls: calls.clone(),
            timeout,
        };
        Ok((
            Self {
                pid,
                calls,
                thread: Some(thread),
            },
            endpoint,
        ))
    }

    /// Stop the server and wait for its thread.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.calls.send(Call::Shutdown);
            if thread.join().is_err() {
                warn!(pid = %self.pid, "fetch server thread panicked");
            }
        }
    }
}

impl Drop for FetchServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(pid: ProcessId, rx: Receiver<Call>, handler: Arc<dyn FetchHandler>) {
    debug!(pid = %pid, "fetch server started");
    while let Ok(call) = rx.recv() {
        let (request, reply) = match call {
            Call::Fetch { request, reply } => (request, reply),
            Call::Shutdown => break,
        };
        let outcome = match FetchRequest::decode(&request) {
            Ok(req) => handler.handle(&req),
            Err(e) => FetchOutcome::Failed {
                detail: format!("undecodable request: {e}"),
            },
        };
        match (FetchResponse { outcome }).encode() {
            Ok(bytes) => {
                // The caller may have timed out and gone away.
                let _ = reply.send(bytes);
            }
            Err(e) => warn!(pid = %pid, error = %e, "failed to encode fetch reply"),
        }
    }
    debug!(pid = %pid, "fetch server stopped");
}

/// Rendezvous point where processes publish and discover fetch endpoints.
pub trait EndpointDirectory: Send + Sync {
    /// Publish (or replace) the endpoint of its owner.
    fn publish(&self, endpoint: FetchEndpoint);

    /// Remove the endpoint of `pid`.
    fn withdraw(&self, pid: ProcessId);

    /// The endpoint currently published for `pid`.
    fn lookup(&self, pid: ProcessId) -> Result<FetchEndpoint, CommError>;
}

/// In-process directory shared by the threads of a [`LocalCluster`](crate::LocalCluster).
#[derive(Clone, Default)]
pub struct LocalDirectory {
    endpoints: Arc<RwLock<HashMap<ProcessId, FetchEndpoint>>>,
}

impl LocalDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EndpointDirectory for LocalDirectory {
    fn publish(&self, endpoint: FetchEndpoint) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.owner, endpoint);
    }

    fn withdraw(&self, pid: ProcessId) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
    }

    fn lookup(&self, pid: ProcessId) -> Result<FetchEndpoint, CommError> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
            .ok_or(CommError::UnknownEndpoint { pid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_core::{FieldIndex, Rect};
    use halo_field::{DenseGrid, DynField, HaloField};
    use halo_partition::UniformGrid;
    use smallvec::smallvec;

    #[test]
    fn server_answers_owned_cells_and_rejects_others() {
        let grid = UniformGrid::new(Rect::from_extents(&[10, 10]), 1, false, 2).unwrap();
        let table: SharedTable = Arc::new(RwLock::new(grid.table().clone()));
        let mut field =
            HaloField::new(FieldIndex(0), "h", ProcessId(1), table.clone(), DenseGrid::<u32>::new)
                .unwrap();
        let owned = field.owned().clone();
        let inside: Vec<i32> = owned.min.to_vec();
        field.set(&inside, 77).unwrap();

        let handler = OwnedCellHandler::new(ProcessId(1), table, vec![DynField::cell_source(&field)]);
        let (mut server, endpoint) =
            FetchServer::spawn(ProcessId(1), Arc::new(handler), Duration::from_secs(5)).unwrap();
        let dir = LocalDirectory::new();
        dir.publish(endpoint);

        let ep = dir.lookup(ProcessId(1)).unwrap();
        let resp = ep
            .call(&FetchRequest {
                requester: ProcessId(0),
                field: FieldIndex(0),
                coord: inside.iter().copied().collect(),
            })
            .unwrap();
        assert_eq!(resp.outcome, FetchOutcome::Value(77u32.to_le_bytes().to_vec()));

        let resp = ep
            .call(&FetchRequest {
                requester: ProcessId(0),
                field: FieldIndex(0),
                coord: smallvec![0, 0],
            })
            .unwrap();
        assert_eq!(resp.outcome, FetchOutcome::BoundaryMismatch { owner: ProcessId(1) });

        server.shutdown();
        assert!(matches!(dir.lookup(ProcessId(0)), Err(CommError::UnknownEndpoint { .. })));
        assert!(ep
            .call(&FetchRequest {
                requester: ProcessId(0),
                field: FieldIndex(0),
                coord: smallvec![0, 0],
            })
            .is_err());
    }
}
