//! Sampling the service in the background across several stages.
use std::time::Duration;

use fleetbench_macros::stage;

use super::{DistStage, Resolution, collect_acks, resolve};
use crate::ack::{AckPayload, DistStageAck, StageResult};
use crate::capability::{Dependency, Injector, Sampler};
use crate::context::{MainContext, WorkerContext};
use crate::error::{ConfigError, StageError};
use crate::monitor::Monitor;

fn default_interval_ms() -> u64 {
    1000
}

/// Starts sampling the service's gauges on every targeted worker. The
/// monitor keeps running through later stages until a [`MonitorStop`].
/// Skipped when the service has no [`Sampler`].
#[stage]
pub struct MonitorStart {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for MonitorStart {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

impl DistStage for MonitorStart {
    fn validate(&self, _slots: usize) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::invalid("interval_ms", "must be positive"));
        }
        Ok(())
    }

    fn run_on_worker(&self, ctx: &WorkerContext) -> Result<DistStageAck, StageError> {
        let mut injector = Injector::new(ctx.registry());
        let sampler = injector.inject::<dyn Sampler>(Dependency::Skip);
        let (Resolution::Run, Some(sampler)) = (resolve("MonitorStart", &injector)?, sampler) else {
            return Ok(DistStageAck::success(ctx.worker()));
        };

        let monitor = Monitor::start(ctx.worker(), sampler, Duration::from_millis(self.interval_ms))
            .map_err(|e| StageError::unexpected("cannot start monitor thread", e))?;
        if let Some(previous) = ctx.state().replace_monitor(monitor) {
            tracing::warn!("Worker {} was already monitoring, restarting", ctx.worker());
            previous.stop();
        }
        Ok(DistStageAck::success(ctx.worker()))
    }
}

/// Stops the monitor of every targeted worker and collects the samples into
/// the benchmark report.
#[stage]
#[derive(Default)]
pub struct MonitorStop {}

impl DistStage for MonitorStop {
    fn run_on_worker(&self, ctx: &WorkerContext) -> Result<DistStageAck, StageError> {
        let Some(monitor) = ctx.state().take_monitor() else {
            tracing::info!("Worker {} has no monitor running", ctx.worker());
            return Ok(DistStageAck::success(ctx.worker()));
        };
        let samples = monitor.stop().ok_or_else(|| StageError::Unexpected {
            message: "monitor thread panicked".to_owned(),
            source: None,
        })?;
        tracing::info!("Worker {} collected {} samples", ctx.worker(), samples.len());
        Ok(DistStageAck::success(ctx.worker()).with_payload(AckPayload::Timeline { samples }))
    }

    fn process_on_main(&self, ctx: &mut MainContext, acks: &[DistStageAck]) -> StageResult {
        for ack in acks {
            if let Some(AckPayload::Timeline { samples }) = &ack.payload {
                ctx.report_mut()
                    .timelines
                    .entry(ack.worker)
                    .or_default()
                    .extend(samples.iter().cloned());
            }
        }
        collect_acks(ctx, acks)
    }
}
