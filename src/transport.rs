//! Delivery of stage messages between main and workers.
//!
//! The controller only needs request/response per worker plus an
//! out-of-band interrupt. Messages are opaque bytes here; the controller and
//! the worker own the encoding.
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::WorkerId;
use crate::error::TransportError;
use crate::worker::Worker;

pub trait Transport: Send + Sync {
    /// Workers reachable through this transport.
    fn workers(&self) -> Vec<WorkerId>;

    /// Sends a serialized stage to `worker` and resolves to its serialized
    /// ack.
    fn run_stage(
        &self,
        worker: WorkerId,
        message: Vec<u8>,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Asks `worker` to stop the stage it is running.
    fn interrupt(&self, worker: WorkerId) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Workers living in this process. Stages run on tokio's blocking pool.
#[derive(Clone, Default)]
pub struct LocalTransport {
    workers: BTreeMap<WorkerId, Arc<Worker>>,
}

impl LocalTransport {
    pub fn new(workers: impl IntoIterator<Item = Worker>) -> Self {
        Self {
            workers: workers
                .into_iter()
                .map(|worker| (worker.id(), Arc::new(worker)))
                .collect(),
        }
    }

    fn worker(&self, worker: WorkerId) -> Result<Arc<Worker>, TransportError> {
        self.workers
            .get(&worker)
            .cloned()
            .ok_or(TransportError::UnknownWorker(worker))
    }
}

impl Transport for LocalTransport {
    fn workers(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    async fn run_stage(&self, worker: WorkerId, message: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let target = self.worker(worker)?;
        // admitted before the first await, so an interrupt sent after a
        // timeout always reaches the stage
        let admission = target.admit();
        tokio::task::spawn_blocking(move || target.handle_admitted(admission, &message))
            .await
            .map_err(|e| TransportError::Disconnected {
                worker,
                reason: e.to_string(),
            })?
    }

    async fn interrupt(&self, worker: WorkerId) -> Result<(), TransportError> {
        self.worker(worker)?.interrupt();
        Ok(())
    }
}
