//! Run state handed to stages, one struct per side of the wire.
use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::WorkerId;
use crate::capability::TraitRegistry;
use crate::monitor::Monitor;
use crate::report::{BenchmarkReport, Reporter};
use crate::stressor::StopSignal;

/// Controller-side state of the current benchmark.
pub struct MainContext {
    cluster_size: usize,
    active: BTreeSet<WorkerId>,
    report: BenchmarkReport,
    reporter: Arc<dyn Reporter>,
}

impl MainContext {
    pub fn new(workers: impl IntoIterator<Item = WorkerId>, reporter: Arc<dyn Reporter>) -> Self {
        let active: BTreeSet<WorkerId> = workers.into_iter().collect();
        Self {
            cluster_size: active.len(),
            active,
            report: BenchmarkReport::new(""),
            reporter,
        }
    }

    pub fn benchmark(&self) -> &str {
        &self.report.name
    }

    /// Number of workers the run started with.
    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    pub fn active_workers(&self) -> &BTreeSet<WorkerId> {
        &self.active
    }

    /// Removes a worker from every later dispatch.
    pub fn deactivate(&mut self, worker: WorkerId) -> bool {
        self.active.remove(&worker)
    }

    pub fn report(&self) -> &BenchmarkReport {
        &self.report
    }

    pub fn report_mut(&mut self) -> &mut BenchmarkReport {
        &mut self.report
    }

    pub fn reporter(&self) -> Arc<dyn Reporter> {
        self.reporter.clone()
    }

    /// Starts a fresh report and hands back the previous one.
    pub(crate) fn start_benchmark(&mut self, name: &str) -> BenchmarkReport {
        std::mem::replace(&mut self.report, BenchmarkReport::new(name))
    }
}

/// What a worker keeps from one stage to the next.
#[derive(Default)]
pub struct WorkerState {
    monitor: Mutex<Option<Monitor>>,
}

impl WorkerState {
    /// Installs `monitor`, handing back the one it replaces.
    pub fn replace_monitor(&self, monitor: Monitor) -> Option<Monitor> {
        self.monitor.lock().replace(monitor)
    }

    pub fn take_monitor(&self) -> Option<Monitor> {
        self.monitor.lock().take()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }
}

/// Worker-side state for one stage.
#[derive(Clone)]
pub struct WorkerContext {
    worker: WorkerId,
    cluster_size: usize,
    slot: u32,
    slots: u32,
    registry: Arc<TraitRegistry>,
    stop: StopSignal,
    state: Arc<WorkerState>,
}

impl WorkerContext {
    pub fn new(
        worker: WorkerId,
        cluster_size: usize,
        registry: Arc<TraitRegistry>,
        stop: StopSignal,
    ) -> Self {
        Self {
            worker,
            cluster_size,
            slot: 0,
            slots: 1,
            registry,
            stop,
            state: Arc::default(),
        }
    }

    /// Shares the worker's long-lived state with the stage.
    pub fn with_state(mut self, state: Arc<WorkerState>) -> Self {
        self.state = state;
        self
    }

    /// Places this worker among the `targets` of a stage.
    pub fn targeted(mut self, targets: &[WorkerId]) -> Self {
        if let Some(slot) = targets.iter().position(|w| *w == self.worker) {
            self.slot = slot as u32;
            self.slots = targets.len() as u32;
        }
        self
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Position of this worker among the workers running the stage.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Number of workers running the stage.
    pub fn slots(&self) -> u32 {
        self.slots
    }

    pub fn registry(&self) -> &TraitRegistry {
        &self.registry
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targeted_worker_finds_its_slot() {
        let ctx = WorkerContext::new(7, 4, Arc::new(TraitRegistry::new()), StopSignal::new())
            .targeted(&[2, 5, 7]);
        assert_eq!((ctx.slot(), ctx.slots()), (2, 3));
    }

    #[test]
    fn untargeted_worker_runs_alone() {
        let ctx = WorkerContext::new(1, 4, Arc::new(TraitRegistry::new()), StopSignal::new())
            .targeted(&[]);
        assert_eq!((ctx.slot(), ctx.slots()), (0, 1));
    }
}
