//! The controller sequencing benchmarks and stages over workers.
//!
//! # High-level flow
//! 1. Every benchmark is validated up front against the workers each stage
//!    targets: an empty benchmark or an invalid stage fails the run before
//!    anything is dispatched.
//! 2. [`Master::next_stage`] pops stages in order. Once a benchmark's queue
//!    is empty, aborted or not, it yields the configured [`Cleanup`] stage,
//!    then moves on to the next benchmark.
//! 3. Main-only stages run in-process. A failure is recorded as a FAIL but
//!    never stops the benchmark.
//! 4. Distributed stages are validated again for the workers actually
//!    targeted, serialized once and sent concurrently. Each worker gets
//!    `ack_timeout` to answer; a worker that does not, or whose transport
//!    fails, is interrupted and counted as a FAIL ack.
//! 5. [`Master::process_acks`] folds the acks into a [`StageResult`] and the
//!    continuation policy decides:
//!    - `Success` continues,
//!    - `Fail` is recorded, and aborts the benchmark with `abort_on_fail`,
//!    - `Exception` aborts the benchmark unless the stage is best-effort.
//!
//!    A cleanup stage is recorded like any other but never aborts.
//! 6. With no active worker left, a distributed stage is an EXCEPTION that
//!    aborts its benchmark; later benchmarks still get their turn.
//!
//! # States
//! ```text
//! AwaitingBenchmark -> AwaitingStage -> Dispatching -> AwaitingAcks -> Deciding
//!        ^                  ^                                           |
//!        |                  +-------------------------------------------+
//!        +----------------------------- (benchmark done) ---------------+
//!                                                           Terminated
//! ```
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleetbench_macros::message;
use futures::future::join_all;
use typed_builder::TypedBuilder;

use crate::WorkerId;
use crate::ack::{DistStageAck, StageResult};
use crate::context::MainContext;
use crate::error::{ConfigError, MasterError};
use crate::report::{Reporter, RunReport, StageFailure};
use crate::stage::{Cleanup, StageDefinition, StageKind};
use crate::transport::Transport;
use crate::worker::StageMessage;

/// Controller knobs.
#[derive(TypedBuilder, Clone, Debug)]
pub struct MasterConfig {
    /// How long a worker may take to acknowledge a stage.
    #[builder(default = Duration::from_secs(600))]
    pub ack_timeout: Duration,
    /// Stop a benchmark at its first FAIL, not just at exceptions.
    #[builder(default)]
    pub abort_on_fail: bool,
    /// Run after the last stage of every benchmark on all active workers;
    /// `None` skips it.
    #[builder(default = Some(Cleanup::default()))]
    pub cleanup: Option<Cleanup>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A named, ordered list of stages.
#[message]
#[serde(deny_unknown_fields)]
pub struct Benchmark {
    pub name: String,
    pub stages: Vec<StageDefinition>,
}

impl Benchmark {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn stage(mut self, stage: impl Into<StageDefinition>) -> Self {
        self.stages.push(stage.into());
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    /// Checks every stage for the workers it would run on out of `workers`.
    pub fn validate(&self, workers: &BTreeSet<WorkerId>) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::EmptyBenchmark(self.name.clone()));
        }
        self.stages.iter().try_for_each(|definition| {
            let slots = definition.targets(workers).len().max(1);
            definition.stage.validate(slots)
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    AwaitingBenchmark,
    AwaitingStage,
    Dispatching,
    AwaitingAcks,
    Deciding,
    Terminated,
}

/// A stage popped from the run queue.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledStage {
    pub benchmark: String,
    pub index: usize,
    pub definition: StageDefinition,
}

pub struct Master<T: Transport> {
    config: MasterConfig,
    transport: T,
    benchmarks: VecDeque<Benchmark>,
    queue: VecDeque<(usize, StageDefinition)>,
    running: bool,
    /// Stages of the current benchmark, the index given to its cleanup.
    stage_count: usize,
    cleanup_pending: bool,
    state: ControllerState,
    ctx: MainContext,
    report: RunReport,
}

impl<T: Transport> Master<T> {
    /// Controller over every worker `transport` reaches.
    pub fn new(config: MasterConfig, transport: T, reporter: Arc<dyn Reporter>) -> Self {
        let ctx = MainContext::new(transport.workers(), reporter);
        Self {
            config,
            transport,
            benchmarks: VecDeque::new(),
            queue: VecDeque::new(),
            running: false,
            stage_count: 0,
            cleanup_pending: false,
            state: ControllerState::AwaitingBenchmark,
            ctx,
            report: RunReport::default(),
        }
    }

    pub fn benchmark(mut self, benchmark: Benchmark) -> Self {
        self.benchmarks.push_back(benchmark);
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn context(&self) -> &MainContext {
        &self.ctx
    }

    /// Pops the next stage, then the cleanup, moving on to the next benchmark
    /// when the current one is done. `None` once every benchmark has run.
    pub fn next_stage(&mut self) -> Result<Option<ScheduledStage>, ConfigError> {
        loop {
            if let Some((index, definition)) = self.queue.pop_front() {
                self.state = ControllerState::AwaitingStage;
                return Ok(Some(ScheduledStage {
                    benchmark: self.ctx.benchmark().to_owned(),
                    index,
                    definition,
                }));
            }
            if let Some(cleanup) = self.take_cleanup() {
                return Ok(Some(cleanup));
            }
            self.finish_benchmark();
            let Some(benchmark) = self.benchmarks.pop_front() else {
                self.state = ControllerState::Terminated;
                return Ok(None);
            };
            if benchmark.stages.is_empty() {
                return Err(ConfigError::EmptyBenchmark(benchmark.name));
            }
            tracing::info!(
                "Starting benchmark {} ({} stages)",
                benchmark.name,
                benchmark.stages.len()
            );
            self.ctx.start_benchmark(&benchmark.name);
            self.stage_count = benchmark.stages.len();
            self.queue = benchmark.stages.into_iter().enumerate().collect();
            self.running = true;
            self.cleanup_pending = self.config.cleanup.is_some();
        }
    }

    fn take_cleanup(&mut self) -> Option<ScheduledStage> {
        if !std::mem::take(&mut self.cleanup_pending) {
            return None;
        }
        let cleanup = self.config.cleanup.clone()?;
        if self.ctx.active_workers().is_empty() {
            tracing::debug!("No active worker to clean up after {}", self.ctx.benchmark());
            return None;
        }
        self.state = ControllerState::AwaitingStage;
        Some(ScheduledStage {
            benchmark: self.ctx.benchmark().to_owned(),
            index: self.stage_count,
            definition: StageDefinition::new(StageKind::Cleanup(cleanup)).best_effort(),
        })
    }

    fn finish_benchmark(&mut self) {
        self.state = ControllerState::AwaitingBenchmark;
        if !std::mem::take(&mut self.running) {
            return;
        }
        let report = self.ctx.start_benchmark("");
        tracing::info!(
            "Benchmark {} finished: {}",
            report.name,
            if report.is_success() { "success" } else { "failed" }
        );
        self.report.benchmarks.push(report);
    }

    /// Runs every benchmark and returns what happened.
    ///
    /// Configuration errors are reported before the first dispatch. Anything
    /// that goes wrong afterwards, including running out of workers, ends up
    /// in the report instead.
    pub async fn run(mut self) -> Result<RunReport, MasterError> {
        for benchmark in &self.benchmarks {
            benchmark.validate(self.ctx.active_workers())?;
        }
        while let Some(stage) = self.next_stage()? {
            self.execute(&stage).await?;
        }
        Ok(self.report)
    }

    /// Runs one stage to completion and applies the continuation policy.
    pub async fn execute(&mut self, stage: &ScheduledStage) -> Result<StageResult, MasterError> {
        let name = stage.definition.name();
        tracing::info!("Stage {} ({name}) of {} starting", stage.index, stage.benchmark);

        if stage.definition.stage.is_main_only() {
            let result = match stage.definition.stage.execute_on_main(&mut self.ctx).await {
                Ok(()) => StageResult::Success,
                Err(e) => {
                    tracing::warn!("Main stage {name} failed: {e}");
                    self.record_failure(stage, StageResult::Fail, &[]);
                    StageResult::Fail
                }
            };
            tracing::info!("Stage {} ({name}) finished: {result}", stage.index);
            self.state = ControllerState::AwaitingStage;
            return Ok(result);
        }

        if self.ctx.active_workers().is_empty() {
            tracing::error!("No active worker left for stage {} ({name})", stage.index);
            self.record_failure(stage, StageResult::Exception, &[]);
            self.abort(stage);
            self.state = ControllerState::AwaitingStage;
            return Ok(StageResult::Exception);
        }

        let acks = self.dispatch(stage).await?;
        self.state = ControllerState::Deciding;
        let result = self.process_acks(&stage.definition.stage, &acks);
        self.decide(stage, result, &acks);
        Ok(result)
    }

    async fn dispatch(&mut self, stage: &ScheduledStage) -> Result<Vec<DistStageAck>, MasterError> {
        self.state = ControllerState::Dispatching;
        let targets = stage.definition.targets(self.ctx.active_workers());
        if let Some(dist) = stage.definition.stage.as_dist() {
            // workers may have left since the up-front validation
            dist.validate(targets.len().max(1))?;
        }
        if targets.is_empty() {
            tracing::warn!(
                "Stage {} ({}) targets no active worker, nothing to do",
                stage.index,
                stage.definition.name()
            );
            return Ok(Vec::new());
        }

        let message = StageMessage {
            benchmark: stage.benchmark.clone(),
            stage_index: stage.index,
            definition: stage.definition.clone(),
            targets: targets.clone(),
        };
        let bytes = serde_json::to_vec(&message)
            .map_err(|e| ConfigError::Malformed(e.to_string()))?;

        tracing::debug!("Dispatching stage {} to workers {targets:?}", stage.index);
        self.state = ControllerState::AwaitingAcks;
        let started = Instant::now();
        let acks = join_all(
            targets
                .iter()
                .map(|&worker| self.await_ack(worker, bytes.clone())),
        )
        .await;
        tracing::debug!("All acks for stage {} in {:?}", stage.index, started.elapsed());
        Ok(acks)
    }

    /// One worker's ack; every failure mode becomes a FAIL ack.
    async fn await_ack(&self, worker: WorkerId, message: Vec<u8>) -> DistStageAck {
        let response = tokio::time::timeout(
            self.config.ack_timeout,
            self.transport.run_stage(worker, message),
        )
        .await;
        let ack = match response {
            Ok(Ok(bytes)) => match serde_json::from_slice::<DistStageAck>(&bytes) {
                Ok(ack) if ack.worker == worker => ack,
                Ok(ack) => DistStageAck::failure(
                    worker,
                    format!("ack claims to come from worker {}", ack.worker),
                ),
                Err(e) => DistStageAck::unresponsive(worker, format!("undecodable ack: {e}")),
            },
            Ok(Err(e)) => DistStageAck::unresponsive(worker, e),
            Err(_) => {
                tracing::warn!(
                    "Worker {worker} did not ack within {:?}, interrupting",
                    self.config.ack_timeout
                );
                if let Err(e) = self.transport.interrupt(worker).await {
                    tracing::warn!("Cannot interrupt worker {worker}: {e}");
                }
                DistStageAck::unresponsive(
                    worker,
                    format!("no ack within {:?}", self.config.ack_timeout),
                )
            }
        };
        tracing::info!(
            "Worker {worker} acked {} after {:?} of work",
            ack.result(),
            ack.duration
        );
        ack
    }

    /// Folds the acks of a stage and merges their statistics into the
    /// benchmark report.
    pub fn process_acks(&mut self, stage: &StageKind, acks: &[DistStageAck]) -> StageResult {
        match stage.as_dist() {
            Some(dist) => dist.process_on_main(&mut self.ctx, acks),
            None => StageResult::Success,
        }
    }

    fn decide(&mut self, stage: &ScheduledStage, result: StageResult, acks: &[DistStageAck]) {
        let name = stage.definition.name();
        tracing::info!("Stage {} ({name}) finished: {result}", stage.index);
        self.state = ControllerState::AwaitingStage;
        if result.is_success() {
            return;
        }

        self.record_failure(stage, result, acks);
        if matches!(stage.definition.stage, StageKind::Cleanup(_)) {
            return;
        }
        let abort = match result {
            StageResult::Success => false,
            StageResult::Fail => self.config.abort_on_fail,
            StageResult::Exception => !stage.definition.best_effort,
        };
        if abort {
            self.abort(stage);
        }
    }

    fn record_failure(&mut self, stage: &ScheduledStage, result: StageResult, acks: &[DistStageAck]) {
        self.ctx.report_mut().failures.push(StageFailure {
            stage_index: stage.index,
            stage: stage.definition.name().to_owned(),
            result,
            workers: acks
                .iter()
                .filter(|ack| !ack.success)
                .map(|ack| ack.worker)
                .collect(),
        });
    }

    /// Drops the remaining stages of the current benchmark. Its cleanup
    /// still runs.
    fn abort(&mut self, stage: &ScheduledStage) {
        tracing::warn!(
            "Aborting benchmark {}: dropping {} remaining stages",
            stage.benchmark,
            self.queue.len()
        );
        self.queue.clear();
        self.ctx.report_mut().aborted = true;
    }
}
