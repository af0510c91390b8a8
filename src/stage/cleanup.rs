//! End-of-benchmark cleanup on every worker.
use fleetbench_macros::stage;

use super::{DistStage, collect_acks};
use crate::ack::{AckPayload, DistStageAck, StageResult};
use crate::capability::{Dependency, Injector, Lifecycle};
use crate::context::{MainContext, WorkerContext};
use crate::error::StageError;

/// Stops whatever a benchmark left running on a worker. The controller runs
/// it after the last stage of every benchmark, aborted or not; a monitor
/// still running at that point fails the stage.
#[stage]
#[derive(Default)]
pub struct Cleanup {
    /// Also stop the service under test.
    #[serde(default)]
    pub stop_service: bool,
}

impl DistStage for Cleanup {
    fn run_on_worker(&self, ctx: &WorkerContext) -> Result<DistStageAck, StageError> {
        let mut leftovers = 0u32;
        if let Some(monitor) = ctx.state().take_monitor() {
            tracing::warn!("Monitor left running on worker {}, stopping it", ctx.worker());
            monitor.stop();
            leftovers += 1;
        }

        if self.stop_service {
            let mut injector = Injector::new(ctx.registry());
            let lifecycle = injector.inject::<dyn Lifecycle>(Dependency::Optional);
            if let Some(lifecycle) = lifecycle.filter(|l| l.is_running()) {
                tracing::info!("Stopping service on worker {} after the benchmark", ctx.worker());
                lifecycle
                    .stop()
                    .map_err(|e| StageError::unexpected("cannot stop service", e))?;
            }
        }

        let ack = if leftovers > 0 {
            DistStageAck::failure(
                ctx.worker(),
                format!("{leftovers} background task(s) were still running"),
            )
        } else {
            DistStageAck::success(ctx.worker())
        };
        Ok(ack.with_payload(AckPayload::Cleanup { leftovers }))
    }

    fn process_on_main(&self, ctx: &mut MainContext, acks: &[DistStageAck]) -> StageResult {
        for ack in acks {
            if let Some(AckPayload::Cleanup { leftovers }) = ack.payload {
                tracing::info!("Worker {} cleaned up {leftovers} leftover task(s)", ack.worker);
            }
        }
        collect_acks(ctx, acks)
    }
}
