//! Starting and stopping the service under test.
use fleetbench_macros::stage;

use super::{DistStage, Resolution, collect_acks, resolve};
use crate::ack::{DistStageAck, StageResult};
use crate::capability::{Dependency, Injector, Lifecycle};
use crate::context::{MainContext, WorkerContext};
use crate::error::StageError;

/// Starts the service on every targeted worker. Skipped when the service has
/// no lifecycle.
#[stage]
#[derive(Default)]
pub struct ServiceStart {}

impl DistStage for ServiceStart {
    fn run_on_worker(&self, ctx: &WorkerContext) -> Result<DistStageAck, StageError> {
        let mut injector = Injector::new(ctx.registry());
        let lifecycle = injector.inject::<dyn Lifecycle>(Dependency::Skip);
        let (Resolution::Run, Some(lifecycle)) = (resolve("ServiceStart", &injector)?, lifecycle)
        else {
            return Ok(DistStageAck::success(ctx.worker()));
        };

        if lifecycle.is_running() {
            tracing::info!("Service on worker {} is already running", ctx.worker());
        } else {
            tracing::info!("Starting service on worker {}...", ctx.worker());
            lifecycle
                .start()
                .map_err(|e| StageError::unexpected("cannot start service", e))?;
        }
        Ok(DistStageAck::success(ctx.worker()))
    }
}

/// Stops the service on every targeted worker.
#[stage]
#[derive(Default)]
pub struct ServiceStop {
    /// Workers that stopped leave the run: no later stage is sent to them.
    #[serde(default)]
    pub exit_worker: bool,
}

impl DistStage for ServiceStop {
    fn run_on_worker(&self, ctx: &WorkerContext) -> Result<DistStageAck, StageError> {
        let mut injector = Injector::new(ctx.registry());
        let lifecycle = injector.inject::<dyn Lifecycle>(Dependency::Skip);
        let (Resolution::Run, Some(lifecycle)) = (resolve("ServiceStop", &injector)?, lifecycle)
        else {
            return Ok(DistStageAck::success(ctx.worker()));
        };

        if lifecycle.is_running() {
            tracing::info!("Stopping service on worker {}...", ctx.worker());
            lifecycle
                .stop()
                .map_err(|e| StageError::unexpected("cannot stop service", e))?;
        }
        Ok(DistStageAck::success(ctx.worker()))
    }

    fn process_on_main(&self, ctx: &mut MainContext, acks: &[DistStageAck]) -> StageResult {
        let result = collect_acks(ctx, acks);
        if self.exit_worker {
            for ack in acks.iter().filter(|ack| ack.success) {
                if ctx.deactivate(ack.worker) {
                    tracing::info!("Worker {} left the run", ack.worker);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::ack::ErrorClass;
    use crate::capability::TraitRegistry;
    use crate::error::CapabilityError;
    use crate::stressor::StopSignal;

    #[derive(Default)]
    struct Switch {
        running: AtomicBool,
        broken: bool,
    }

    impl Lifecycle for Switch {
        fn start(&self) -> Result<(), CapabilityError> {
            if self.broken {
                return Err(CapabilityError::Unexpected("port in use".into()));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) -> Result<(), CapabilityError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    fn context(switch: Option<Arc<Switch>>) -> WorkerContext {
        let mut registry = TraitRegistry::new();
        if let Some(switch) = switch {
            registry.register::<dyn Lifecycle>(switch);
        }
        WorkerContext::new(0, 1, Arc::new(registry), StopSignal::new())
    }

    #[test]
    fn start_then_stop() {
        let switch = Arc::new(Switch::default());
        let ctx = context(Some(switch.clone()));

        assert!(ServiceStart {}.run_on_worker(&ctx).unwrap().success);
        assert!(switch.is_running());
        assert!(ServiceStop::default().run_on_worker(&ctx).unwrap().success);
        assert!(!switch.is_running());
    }

    #[test]
    fn start_failure_is_an_exception() {
        let switch = Arc::new(Switch {
            broken: true,
            ..Switch::default()
        });
        let error = ServiceStart {}.run_on_worker(&context(Some(switch))).unwrap_err();
        let ack = DistStageAck::from_error(0, &error);
        assert_eq!(ack.error.map(|e| e.class), Some(ErrorClass::Exception));
    }

    #[test]
    fn no_lifecycle_skips() {
        let ack = ServiceStart {}.run_on_worker(&context(None)).unwrap();
        assert!(ack.success);
    }
}
