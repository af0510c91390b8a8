//! Worker side of the stage protocol.
//!
//! A worker runs one stage at a time. Every stage gets its own
//! [`StopSignal`], registered when the stage is admitted, so an interrupt
//! reaches exactly the stages admitted so far and never a later one. A stage
//! admitted while another still runs waits for it to finish.
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use fleetbench_macros::message;
use parking_lot::Mutex;

use crate::WorkerId;
use crate::ack::DistStageAck;
use crate::capability::TraitRegistry;
use crate::context::{WorkerContext, WorkerState};
use crate::error::{StageError, TransportError};
use crate::stage::StageDefinition;
use crate::stressor::StopSignal;

/// What main sends to a worker for one stage.
#[message]
pub struct StageMessage {
    pub benchmark: String,
    pub stage_index: usize,
    pub definition: StageDefinition,
    /// Every worker the stage was sent to, ascending.
    pub targets: Vec<WorkerId>,
}

/// A stage accepted by a worker but not finished yet. From the moment it
/// exists, [`Worker::interrupt`] stops it.
pub struct Admission {
    ticket: u64,
    stop: StopSignal,
}

/// Runs the stages main sends to it against the capabilities in its
/// registry.
pub struct Worker {
    id: WorkerId,
    cluster_size: usize,
    registry: Arc<TraitRegistry>,
    state: Arc<WorkerState>,
    admitted: Mutex<BTreeMap<u64, StopSignal>>,
    next_ticket: AtomicU64,
    /// Held for the whole run of a stage.
    running: Mutex<()>,
}

impl Worker {
    pub fn new(id: WorkerId, cluster_size: usize, registry: TraitRegistry) -> Self {
        Self {
            id,
            cluster_size,
            registry: Arc::new(registry),
            state: Arc::default(),
            admitted: Mutex::new(BTreeMap::new()),
            next_ticket: AtomicU64::new(0),
            running: Mutex::new(()),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Registers a stage about to be handed over, typically before it is
    /// moved to another thread.
    pub fn admit(&self) -> Admission {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let stop = StopSignal::new();
        self.admitted.lock().insert(ticket, stop.clone());
        Admission { ticket, stop }
    }

    /// Decodes a serialized [`StageMessage`], runs it, and returns the
    /// serialized ack. A message that does not decode is answered with an
    /// exception ack rather than an error.
    pub fn handle(&self, message: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.handle_admitted(self.admit(), message)
    }

    /// [`Worker::handle`] for a stage admitted earlier.
    pub fn handle_admitted(&self, admission: Admission, message: &[u8]) -> Result<Vec<u8>, TransportError> {
        let ack = match serde_json::from_slice::<StageMessage>(message) {
            Ok(message) => self.run_admitted(admission, &message),
            Err(e) => {
                self.admitted.lock().remove(&admission.ticket);
                tracing::error!("Worker {} cannot decode stage message: {e}", self.id);
                DistStageAck::from_error(self.id, &StageError::unexpected("malformed stage message", e))
            }
        };
        Ok(serde_json::to_vec(&ack)?)
    }

    /// Runs one stage. Never fails: errors and panics become the ack.
    pub fn run_stage(&self, message: &StageMessage) -> DistStageAck {
        self.run_admitted(self.admit(), message)
    }

    fn run_admitted(&self, admission: Admission, message: &StageMessage) -> DistStageAck {
        let ack = self.run_exclusive(&admission.stop, message);
        self.admitted.lock().remove(&admission.ticket);
        ack
    }

    fn run_exclusive(&self, stop: &StopSignal, message: &StageMessage) -> DistStageAck {
        let name = message.definition.name();
        let Some(stage) = message.definition.stage.as_dist() else {
            return DistStageAck::failure(self.id, format!("{name} runs on main only"));
        };
        let _running = self.running.lock();
        if stop.is_raised() {
            tracing::warn!("Worker {} dropping {name}: interrupted before it started", self.id);
            return DistStageAck::failure(self.id, format!("{name} was interrupted before it started"));
        }
        tracing::info!(
            "Worker {} starting stage {} ({name}) of {}",
            self.id,
            message.stage_index,
            message.benchmark
        );
        let ctx = WorkerContext::new(self.id, self.cluster_size, self.registry.clone(), stop.clone())
            .with_state(self.state.clone())
            .targeted(&message.targets);

        let started = Instant::now();
        let ack = match catch_unwind(AssertUnwindSafe(|| stage.run_on_worker(&ctx))) {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                tracing::warn!("Worker {} failed {name}: {e}", self.id);
                DistStageAck::from_error(self.id, &e)
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                tracing::error!("Worker {} panicked in {name}: {reason}", self.id);
                DistStageAck::from_error(
                    self.id,
                    &StageError::Unexpected {
                        message: format!("{name} panicked: {reason}"),
                        source: None,
                    },
                )
            }
        };
        let ack = ack.with_duration(started.elapsed());
        tracing::info!("Worker {} finished {name}: {}", self.id, ack.result());
        ack
    }

    /// Stops every stage admitted and not finished yet.
    pub fn interrupt(&self) {
        let admitted = self.admitted.lock();
        tracing::warn!("Worker {} interrupted, stopping {} stage(s)", self.id, admitted.len());
        admitted.values().for_each(StopSignal::raise);
    }
}
