//! [`RemoteFieldProxy`]: per-process table of fetch endpoints.

use std::sync::{Arc, PoisonError, RwLock};

use halo_core::{Coord, FieldIndex, ProcessId};
use halo_field::{FieldError, RemoteSource};
use tracing::{debug, trace};

use crate::error::CommError;
use crate::message::{FetchOutcome, FetchRequest};
use crate::rpc::{EndpointDirectory, FetchEndpoint};

/// Lookup from process id to the accessor of that process's owned data.
///
/// Built by [`discover`](Self::discover) once all processes have published
/// their endpoints, and rebuilt after every rebalance. Between discoveries
/// it is read-only.
pub struct RemoteFieldProxy {
    pid: ProcessId,
    num_processes: usize,
    directory: Arc<dyn EndpointDirectory>,
    endpoints: RwLock<Vec<Option<FetchEndpoint>>>,
    generation: RwLock<u64>,
}

impl RemoteFieldProxy {
    /// A proxy for `pid` with no endpoints discovered yet.
    pub fn new(pid: ProcessId, num_processes: usize, directory: Arc<dyn EndpointDirectory>) -> Self {
        Self {
            pid,
            num_processes,
            directory,
            endpoints: RwLock::new(vec![None; num_processes]),
            generation: RwLock::new(0),
        }
    }

    /// Look up every other process's endpoint.
    ///
    /// Fails with [`CommError::UnknownEndpoint`] if a peer has not
    /// published one; callers run this after a barrier that follows
    /// publication.
    pub fn discover(&self) -> Result<(), CommError> {
        let mut found = Vec::with_capacity(self.num_processes);
        for p in 0..self.num_processes {
            let pid = ProcessId(p as u32);
            if pid == self.pid {
                found.push(None);
            } else {
                found.push(Some(self.directory.lookup(pid)?));
            }
        }
        *self.endpoints.write().unwrap_or_else(PoisonError::into_inner) = found;
        let mut generation = self.generation.write().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        debug!(pid = %self.pid, generation = *generation, "remote endpoints discovered");
        Ok(())
    }

    /// How many times endpoints have been discovered.
    pub fn generation(&self) -> u64 {
        *self.generation.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch cell `coord` of `field` from its owner `owner`.
    ///
    /// Must only be used for points known not to be resident locally;
    /// asking this process itself is refused. If `owner` does not own
    /// `coord` under its own table the call fails with
    /// [`CommError::BoundaryMismatch`].
    pub fn fetch(&self, owner: ProcessId, field: FieldIndex, coord: &Coord) -> Result<Vec<u8>, CommError> {
        if owner == self.pid {
            return Err(CommError::SelfFetch { coord: coord.clone() });
        }
        let endpoint = self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner.index())
            .cloned()
            .flatten()
            .ok_or(CommError::UnknownEndpoint { pid: owner })?;
        trace!(pid = %self.pid, owner = %owner, field = %field, ?coord, "remote fetch");
        let response = endpoint.call(&FetchRequest {
            requester: self.pid,
            field,
            coord: coord.clone(),
        })?;
        match response.outcome {
            FetchOutcome::Value(bytes) => Ok(bytes),
            FetchOutcome::BoundaryMismatch { owner } => Err(CommError::BoundaryMismatch {
                owner,
                coord: coord.clone(),
            }),
            FetchOutcome::Failed { detail } => Err(CommError::Remote { owner, detail }),
        }
    }
}

impl RemoteSource for RemoteFieldProxy {
    fn fetch(&self, owner: ProcessId, field: FieldIndex, coord: &Coord) -> Result<Vec<u8>, FieldError> {
        RemoteFieldProxy::fetch(self, owner, field, coord).map_err(|e| match e {
            CommError::BoundaryMismatch { owner, coord } => FieldError::BoundaryMismatch { owner, coord },
            other => FieldError::RemoteUnavailable {
                owner,
                detail: other.to_string(),
            },
        })
    }
}
