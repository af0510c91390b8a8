use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use fleetbench_macros::stage;

use super::stress::{crash_ack, default_entry_size, default_threads, thread_layout, thread_share};
use super::{DistStage, Resolution, collect_acks, resolve, service_running};
use crate::ack::{AckPayload, DistStageAck, StageResult};
use crate::capability::{BasicOperations, Dependency, Injector};
use crate::context::{MainContext, WorkerContext};
use crate::error::{ConfigError, StageError};
use crate::stats::Operation;
use crate::stressor::{Completion, Step, StressContext, StressEnv, Stressor, key_for};

/// Reads back every key written by a [`Load`](super::Load) and checks that
/// it is present with the expected size. Missing or invalid entries fail
/// the stage.
#[stage]
pub struct CheckData {
    pub num_entries: u64,
    #[serde(default = "default_entry_size")]
    pub entry_size: usize,
    #[serde(default = "default_threads")]
    pub threads_per_node: usize,
    /// Expect the keys to be gone instead, e.g. after a clear.
    #[serde(default)]
    pub expect_empty: bool,
}

impl CheckData {
    pub fn new(num_entries: u64) -> Self {
        Self {
            num_entries,
            entry_size: default_entry_size(),
            threads_per_node: default_threads(),
            expect_empty: false,
        }
    }
}

#[derive(Default)]
struct CheckCounters {
    checked: AtomicU64,
    missing: AtomicU64,
    invalid: AtomicU64,
}

impl DistStage for CheckData {
    fn validate(&self, _slots: usize) -> Result<(), ConfigError> {
        if self.threads_per_node == 0 {
            return Err(ConfigError::invalid("threads_per_node", "must be positive"));
        }
        Ok(())
    }

    fn run_on_worker(&self, ctx: &WorkerContext) -> Result<DistStageAck, StageError> {
        let mut injector = Injector::new(ctx.registry());
        let operations = injector.inject::<dyn BasicOperations>(Dependency::Mandatory);
        let running = service_running(&mut injector);
        let (Resolution::Run, Some(operations)) = (resolve("CheckData", &injector)?, operations)
        else {
            return Ok(DistStageAck::success(ctx.worker()));
        };
        if !running {
            tracing::info!("Service on worker {} is not running, skipping check", ctx.worker());
            return Ok(DistStageAck::success(ctx.worker()));
        }

        let counters = Arc::new(CheckCounters::default());
        let (thread_offset, total_threads) = thread_layout(ctx, self.threads_per_node);
        let stressor = Stressor::builder()
            .threads(self.threads_per_node)
            .completion(Completion::UntilFinished)
            .thread_offset(thread_offset)
            .total_threads(total_threads)
            .num_entries(self.num_entries.max(1))
            .stop(ctx.stop_signal().clone())
            .build();
        let env = StressEnv {
            operations,
            transactional: None,
        };
        let outcome = stressor
            .run(&env, |thread| {
                let mut keys = thread_share(self.num_entries, total_threads, thread).iter();
                let counters = counters.clone();
                let (entry_size, expect_empty) = (self.entry_size, self.expect_empty);
                move |ctx: &mut StressContext| {
                    let Some(index) = keys.next() else {
                        return Ok(Step::Finished);
                    };
                    let key = key_for(index);
                    let value = ctx.request(Operation::GET, |ops| ops.get(&key))?;
                    counters.checked.fetch_add(1, Ordering::Relaxed);
                    match value {
                        None if !expect_empty => {
                            tracing::debug!("Missing entry {key}");
                            counters.missing.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(value) if expect_empty || value.len() != entry_size => {
                            tracing::debug!("Unexpected entry {key} of {} bytes", value.len());
                            counters.invalid.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {}
                    }
                    Ok(if keys.is_empty() { Step::Finished } else { Step::Continue })
                }
            })
            .map_err(|e| StageError::unexpected("cannot start checker", e))?;

        let checked = counters.checked.load(Ordering::Relaxed);
        let missing = counters.missing.load(Ordering::Relaxed);
        let invalid = counters.invalid.load(Ordering::Relaxed);
        tracing::info!(
            "Worker {} checked {checked} entries: {missing} missing, {invalid} invalid",
            ctx.worker()
        );

        let ack = if let Some(crashed) = crash_ack(ctx.worker(), &outcome.errors) {
            crashed
        } else if missing > 0 || invalid > 0 {
            DistStageAck::failure(
                ctx.worker(),
                format!("{missing} missing and {invalid} invalid entries out of {checked}"),
            )
        } else if outcome.statistics.errors() > 0 {
            DistStageAck::failure(
                ctx.worker(),
                format!("{} reads failed", outcome.statistics.errors()),
            )
        } else {
            DistStageAck::success(ctx.worker())
        };
        Ok(ack.with_payload(AckPayload::Check {
            checked,
            missing,
            invalid,
        }))
    }

    fn process_on_main(&self, ctx: &mut MainContext, acks: &[DistStageAck]) -> StageResult {
        let (mut checked, mut missing, mut invalid) = (0u64, 0u64, 0u64);
        for ack in acks {
            if let Some(AckPayload::Check {
                checked: c,
                missing: m,
                invalid: i,
            }) = &ack.payload
            {
                checked += c;
                missing += m;
                invalid += i;
            }
        }
        tracing::info!("Checked {checked} entries in total: {missing} missing, {invalid} invalid");
        collect_acks(ctx, acks)
    }
}
