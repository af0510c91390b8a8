//! The units of work a benchmark is made of.
//!
//! A stage definition is plain configuration: a serde-tagged [`StageKind`]
//! plus targeting options. It is resolved (validated) on the controller,
//! serialized to every targeted worker, and executed there through the
//! [`DistStage`] hooks. Main-only stages ([`MainStage`]) never leave the
//! controller.
//!
//! # Two hooks
//! - [`DistStage::run_on_worker`] runs on each worker and produces one
//!   [`DistStageAck`]. It resolves the capabilities it needs through an
//!   [`Injector`]; a missing mandatory capability is an exception, a
//!   missing skip capability turns the stage into a no-op success.
//! - [`DistStage::process_on_main`] folds the acks on the controller into a
//!   [`StageResult`] and merges their statistics into the benchmark report.
//!
//! # JSON form
//! ```json
//! { "stage": { "type": "StressTest", "num_entries": 1000, "duration_ms": 5000 },
//!   "workers": [0, 1],
//!   "best_effort": false }
//! ```
pub mod check;
pub mod cleanup;
pub mod lifecycle;
pub mod main_only;
pub mod monitor;
pub mod stress;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use fleetbench_macros::message;

use crate::WorkerId;
use crate::ack::{DistStageAck, StageResult, merge_results};
use crate::capability::{AlwaysRunning, Dependency, InjectResult, Injector, Lifecycle};
use crate::context::{MainContext, WorkerContext};
use crate::error::{ConfigError, StageError};

pub use check::CheckData;
pub use cleanup::Cleanup;
pub use lifecycle::{ServiceStart, ServiceStop};
pub use main_only::{Report, Sleep};
pub use monitor::{MonitorStart, MonitorStop};
pub use stress::{Load, StressTest};

/// Behavior of a stage that runs on workers.
pub trait DistStage {
    /// Checks the configuration on the controller, before dispatch, for a
    /// stage that will run on `slots` workers.
    fn validate(&self, _slots: usize) -> Result<(), ConfigError> {
        Ok(())
    }

    fn run_on_worker(&self, ctx: &WorkerContext) -> Result<DistStageAck, StageError>;

    fn process_on_main(&self, ctx: &mut MainContext, acks: &[DistStageAck]) -> StageResult {
        collect_acks(ctx, acks)
    }
}

/// Behavior of a stage that runs on the controller only.
pub trait MainStage {
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    fn execute(&self, ctx: &mut MainContext) -> impl Future<Output = Result<(), StageError>> + Send;
}

/// Worst-wins fold of `acks`, merging their statistics into the benchmark
/// report on the way.
pub fn collect_acks(ctx: &mut MainContext, acks: &[DistStageAck]) -> StageResult {
    for ack in acks {
        if let Some((test, statistics)) = ack.statistics() {
            ctx.report_mut()
                .add_statistics(test, ack.worker, statistics);
        }
        if let Some(error) = &ack.error {
            tracing::warn!("Worker {} reported {}: {error}", ack.worker, ack.result());
        }
    }
    merge_results(acks)
}

/// Every stage variant, tagged by `type` in JSON.
#[message]
#[serde(tag = "type")]
pub enum StageKind {
    ServiceStart(ServiceStart),
    ServiceStop(ServiceStop),
    Load(Load),
    StressTest(StressTest),
    CheckData(CheckData),
    MonitorStart(MonitorStart),
    MonitorStop(MonitorStop),
    Cleanup(Cleanup),
    Sleep(Sleep),
    Report(Report),
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServiceStart(_) => "ServiceStart",
            Self::ServiceStop(_) => "ServiceStop",
            Self::Load(_) => "Load",
            Self::StressTest(_) => "StressTest",
            Self::CheckData(_) => "CheckData",
            Self::MonitorStart(_) => "MonitorStart",
            Self::MonitorStop(_) => "MonitorStop",
            Self::Cleanup(_) => "Cleanup",
            Self::Sleep(_) => "Sleep",
            Self::Report(_) => "Report",
        }
    }

    pub fn is_main_only(&self) -> bool {
        matches!(self, Self::Sleep(_) | Self::Report(_))
    }

    /// Checks the configuration for a run on `slots` workers.
    pub fn validate(&self, slots: usize) -> Result<(), ConfigError> {
        match self {
            Self::Sleep(stage) => MainStage::validate(stage),
            Self::Report(stage) => MainStage::validate(stage),
            _ => self.as_dist().map_or(Ok(()), |stage| stage.validate(slots)),
        }
    }

    /// The worker-side behavior, `None` for main-only stages.
    pub fn as_dist(&self) -> Option<&dyn DistStage> {
        match self {
            Self::ServiceStart(stage) => Some(stage),
            Self::ServiceStop(stage) => Some(stage),
            Self::Load(stage) => Some(stage),
            Self::StressTest(stage) => Some(stage),
            Self::CheckData(stage) => Some(stage),
            Self::MonitorStart(stage) => Some(stage),
            Self::MonitorStop(stage) => Some(stage),
            Self::Cleanup(stage) => Some(stage),
            Self::Sleep(_) | Self::Report(_) => None,
        }
    }

    /// Runs a main-only stage. Distributed stages are a no-op here.
    pub async fn execute_on_main(&self, ctx: &mut MainContext) -> Result<(), StageError> {
        match self {
            Self::Sleep(stage) => stage.execute(ctx).await,
            Self::Report(stage) => stage.execute(ctx).await,
            _ => Ok(()),
        }
    }
}

/// A stage as written in a benchmark.
#[message]
#[serde(deny_unknown_fields)]
pub struct StageDefinition {
    pub stage: StageKind,
    /// Restricts the stage to these workers; `None` targets every active one.
    #[serde(default)]
    pub workers: Option<BTreeSet<WorkerId>>,
    /// Keep going with the benchmark even if this stage ends in an exception.
    #[serde(default)]
    pub best_effort: bool,
}

impl StageDefinition {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            workers: None,
            best_effort: false,
        }
    }

    pub fn on_workers(mut self, workers: impl IntoIterator<Item = WorkerId>) -> Self {
        self.workers = Some(workers.into_iter().collect());
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.stage.name()
    }

    /// Workers of `active` this stage is dispatched to.
    pub fn targets(&self, active: &BTreeSet<WorkerId>) -> Vec<WorkerId> {
        match &self.workers {
            Some(selected) => active.intersection(selected).copied().collect(),
            None => active.iter().copied().collect(),
        }
    }
}

impl From<StageKind> for StageDefinition {
    fn from(stage: StageKind) -> Self {
        Self::new(stage)
    }
}

/// What the worker should do after resolving a stage's capabilities.
pub(crate) enum Resolution {
    Run,
    Skip,
}

/// Turns the injector's verdict into [`Resolution`], or an error naming the
/// missing capabilities.
pub(crate) fn resolve(stage: &str, injector: &Injector<'_>) -> Result<Resolution, StageError> {
    match injector.result() {
        InjectResult::Success => Ok(Resolution::Run),
        InjectResult::Skip => {
            tracing::info!(
                "Skipping {stage}: service does not provide {}",
                injector.missing().join(", ")
            );
            Ok(Resolution::Skip)
        }
        InjectResult::Failure => Err(StageError::Unexpected {
            message: format!(
                "{stage} requires {} which the service does not provide",
                injector.missing().join(", ")
            ),
            source: None,
        }),
    }
}

/// Whether the service is up; services without a lifecycle always are.
pub(crate) fn service_running(injector: &mut Injector<'_>) -> bool {
    let fallback: Arc<dyn Lifecycle> = Arc::new(AlwaysRunning);
    injector
        .inject::<dyn Lifecycle>(Dependency::Default(fallback))
        .is_none_or(|lifecycle| lifecycle.is_running())
}
