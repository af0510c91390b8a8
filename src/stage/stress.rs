//! Load generation stages: filling the key space and mixed stress.
use std::time::Duration;

use fleetbench_macros::stage;
use rand::Rng;

use super::{DistStage, Resolution, collect_acks, resolve, service_running};
use crate::WorkerId;
use crate::ack::{AckPayload, DistStageAck, StageResult};
use crate::capability::{BasicOperations, Dependency, Injector, Transactional};
use crate::context::{MainContext, WorkerContext};
use crate::error::{ConfigError, StageError};
use crate::key_selector::{KeySelectorConfig, ThreadIndex};
use crate::range::Range;
use crate::stats::{Operation, PerformanceCondition, Statistics};
use crate::stressor::{
    Completion, RequestError, Step, StressContext, StressEnv, StressError, StressOutcome, Stressor,
    key_for,
};

pub(crate) fn default_threads() -> usize {
    10
}

pub(crate) fn default_entry_size() -> usize {
    1000
}

/// Global thread numbering of a worker running `threads` threads in the
/// slot the stage gave it.
pub(crate) fn thread_layout(ctx: &WorkerContext, threads: usize) -> (u64, u64) {
    let threads = threads as u64;
    (
        u64::from(ctx.slot()) * threads,
        u64::from(ctx.slots()) * threads,
    )
}

/// Mixed get/put/remove traffic over a key space.
///
/// Exactly one of `duration_ms` and `num_operations` bounds the test;
/// `num_operations` is per worker and split between its threads. Each of
/// `conditions` is checked against the statistics merged over all workers;
/// a condition that does not hold fails the stage.
#[stage]
pub struct StressTest {
    #[serde(default = "default_test_name")]
    pub test_name: String,
    pub num_entries: u64,
    #[serde(default = "default_entry_size")]
    pub entry_size: usize,
    #[serde(default = "default_get_ratio")]
    pub get_ratio: u32,
    #[serde(default = "default_put_ratio")]
    pub put_ratio: u32,
    #[serde(default)]
    pub remove_ratio: u32,
    #[serde(default = "default_threads")]
    pub threads_per_node: usize,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_operations: Option<u64>,
    #[serde(default)]
    pub key_selector: KeySelectorConfig,
    /// Requests per transaction; absent runs without transactions.
    #[serde(default)]
    pub transaction_size: Option<usize>,
    #[serde(default)]
    pub exit_on_failure: bool,
    /// Fixed seed for reproducible key sequences.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub conditions: Vec<PerformanceCondition>,
}

fn default_test_name() -> String {
    "stress-test".to_owned()
}

fn default_get_ratio() -> u32 {
    4
}

fn default_put_ratio() -> u32 {
    1
}

impl StressTest {
    pub fn new(num_entries: u64, completion: Completion) -> Self {
        let (duration_ms, num_operations) = match completion {
            Completion::Duration(d) => (Some(d.as_millis() as u64), None),
            Completion::Operations(n) => (None, Some(n)),
            Completion::UntilFinished => (None, None),
        };
        Self {
            test_name: default_test_name(),
            num_entries,
            entry_size: default_entry_size(),
            get_ratio: default_get_ratio(),
            put_ratio: default_put_ratio(),
            remove_ratio: 0,
            threads_per_node: default_threads(),
            duration_ms,
            num_operations,
            key_selector: KeySelectorConfig::default(),
            transaction_size: None,
            exit_on_failure: false,
            seed: None,
            conditions: Vec::new(),
        }
    }

    fn completion(&self) -> Result<Completion, ConfigError> {
        match (self.duration_ms, self.num_operations) {
            (Some(ms), None) => Ok(Completion::Duration(Duration::from_millis(ms))),
            (None, Some(n)) => Ok(Completion::Operations(n)),
            (Some(_), Some(_)) => Err(ConfigError::invalid(
                "duration_ms",
                "set either duration_ms or num_operations, not both",
            )),
            (None, None) => Err(ConfigError::invalid(
                "duration_ms",
                "one of duration_ms or num_operations is required",
            )),
        }
    }
}

impl DistStage for StressTest {
    fn validate(&self, slots: usize) -> Result<(), ConfigError> {
        self.completion()?;
        if self.threads_per_node == 0 {
            return Err(ConfigError::invalid("threads_per_node", "must be positive"));
        }
        if self.get_ratio + self.put_ratio + self.remove_ratio == 0 {
            return Err(ConfigError::invalid("get_ratio", "all operation ratios are zero"));
        }
        if self.transaction_size == Some(0) {
            return Err(ConfigError::invalid("transaction_size", "must be positive"));
        }
        let total_threads = self.threads_per_node.saturating_mul(slots.max(1));
        self.key_selector
            .validate(self.num_entries, total_threads as u64)?;
        self.conditions.iter().try_for_each(PerformanceCondition::validate)
    }

    fn run_on_worker(&self, ctx: &WorkerContext) -> Result<DistStageAck, StageError> {
        let mut injector = Injector::new(ctx.registry());
        let operations = injector.inject::<dyn BasicOperations>(Dependency::Mandatory);
        let transactional = injector.inject::<dyn Transactional>(match self.transaction_size {
            Some(_) => Dependency::Mandatory,
            None => Dependency::Optional,
        });
        let running = service_running(&mut injector);
        let (Resolution::Run, Some(operations)) = (resolve("StressTest", &injector)?, operations)
        else {
            return Ok(DistStageAck::success(ctx.worker()));
        };
        if !running {
            tracing::info!("Service on worker {} is not running, skipping {}", ctx.worker(), self.test_name);
            return Ok(DistStageAck::success(ctx.worker()));
        }

        let completion = self
            .validate(ctx.slots() as usize)
            .and_then(|()| self.completion())
            .map_err(|e| StageError::unexpected("invalid stress test", e))?;
        let (thread_offset, total_threads) = thread_layout(ctx, self.threads_per_node);
        let stressor = Stressor::builder()
            .threads(self.threads_per_node)
            .completion(completion)
            .thread_offset(thread_offset)
            .total_threads(total_threads)
            .key_selector(self.key_selector.clone())
            .num_entries(self.num_entries)
            .transaction_size(self.transaction_size)
            .exit_on_failure(self.exit_on_failure)
            .seed(self.seed.unwrap_or_else(rand::random))
            .stop(ctx.stop_signal().clone())
            .build();

        let env = StressEnv {
            operations,
            transactional,
        };
        let mix = OperationMix {
            get: self.get_ratio,
            put: self.put_ratio,
            remove: self.remove_ratio,
            entry_size: self.entry_size,
        };
        let outcome = stressor
            .run(&env, |_| mix.logic())
            .map_err(|e| StageError::unexpected("cannot start stressor", e))?;
        Ok(stress_ack(ctx, &self.test_name, outcome))
    }

    fn process_on_main(&self, ctx: &mut MainContext, acks: &[DistStageAck]) -> StageResult {
        let result = collect_acks(ctx, acks);
        if self.conditions.is_empty() {
            return result;
        }
        // only this stage's acks, the report may already hold earlier runs of the test
        let mut merged = Statistics::new();
        for (_, statistics) in acks.iter().filter_map(DistStageAck::statistics) {
            merged.merge(statistics);
        }
        let mut verdict = result;
        for condition in &self.conditions {
            if let Err(breach) = condition.evaluate(&merged) {
                tracing::warn!("{} does not meet its performance condition: {breach}", self.test_name);
                verdict = verdict.merge(StageResult::Fail);
            }
        }
        verdict
    }
}

/// Relative weights of the request kinds.
#[derive(Clone, Copy)]
struct OperationMix {
    get: u32,
    put: u32,
    remove: u32,
    entry_size: usize,
}

impl OperationMix {
    fn logic(self) -> impl FnMut(&mut StressContext) -> Result<Step, RequestError> + Send {
        let total = self.get + self.put + self.remove;
        move |ctx: &mut StressContext| {
            let key = key_for(ctx.next_key_index());
            let pick = ctx.rng().random_range(0..total);
            if pick < self.get {
                ctx.request(Operation::GET, |ops| ops.get(&key))?;
            } else if pick < self.get + self.put {
                let value = random_value(ctx, self.entry_size);
                ctx.request(Operation::PUT, |ops| ops.put(&key, value))?;
            } else {
                ctx.request(Operation::REMOVE, |ops| ops.remove(&key))?;
            }
            Ok(Step::Continue)
        }
    }
}

fn random_value(ctx: &mut StressContext, size: usize) -> Vec<u8> {
    let mut value = vec![0u8; size];
    ctx.rng().fill(&mut value[..]);
    value
}

/// Turns a stressor outcome into the worker's ack, statistics attached in
/// every case.
pub(crate) fn stress_ack(ctx: &WorkerContext, test_name: &str, outcome: StressOutcome) -> DistStageAck {
    let StressOutcome {
        statistics,
        errors,
        interrupted,
    } = outcome;
    tracing::info!(
        "Worker {} finished {test_name}: {} requests, {} errors",
        ctx.worker(),
        statistics.requests(),
        statistics.errors()
    );
    let payload = AckPayload::Statistics {
        test_name: test_name.to_owned(),
        statistics,
    };

    let ack = if let Some(crashed) = crash_ack(ctx.worker(), &errors) {
        crashed
    } else if let Some(first) = errors.first() {
        DistStageAck::failure(ctx.worker(), first.to_string())
    } else if interrupted {
        DistStageAck::failure(ctx.worker(), format!("{test_name} was interrupted"))
    } else {
        DistStageAck::success(ctx.worker())
    };
    ack.with_payload(payload)
}

/// Exception ack for the threads that died on an unexpected error, `None`
/// if every error was an expected request failure.
pub(crate) fn crash_ack(worker: WorkerId, errors: &[StressError]) -> Option<DistStageAck> {
    let crashed: Vec<&StressError> = errors.iter().filter(|e| !e.is_expected()).collect();
    let first = crashed.first()?;
    Some(DistStageAck::from_error(
        worker,
        &StageError::Unexpected {
            message: format!("{} stress thread(s) crashed", crashed.len()),
            source: Some(Box::new(StressFailure(first.to_string()))),
        },
    ))
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct StressFailure(String);

/// Writes every key of `[0, num_entries)` once, the key space split between
/// all threads of all targeted workers.
#[stage]
pub struct Load {
    pub num_entries: u64,
    #[serde(default = "default_entry_size")]
    pub entry_size: usize,
    #[serde(default = "default_threads")]
    pub threads_per_node: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Load {
    pub fn new(num_entries: u64) -> Self {
        Self {
            num_entries,
            entry_size: default_entry_size(),
            threads_per_node: default_threads(),
            seed: None,
        }
    }
}

impl DistStage for Load {
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
        let (Resolution::Run, Some(operations)) = (resolve("Load", &injector)?, operations) else {
            return Ok(DistStageAck::success(ctx.worker()));
        };
        if !running {
            tracing::info!("Service on worker {} is not running, skipping load", ctx.worker());
            return Ok(DistStageAck::success(ctx.worker()));
        }

        let (thread_offset, total_threads) = thread_layout(ctx, self.threads_per_node);
        let stressor = Stressor::builder()
            .threads(self.threads_per_node)
            .completion(Completion::UntilFinished)
            .thread_offset(thread_offset)
            .total_threads(total_threads)
            .num_entries(self.num_entries.max(1))
            .seed(self.seed.unwrap_or_else(rand::random))
            .stop(ctx.stop_signal().clone())
            .build();
        let env = StressEnv {
            operations,
            transactional: None,
        };
        let (num_entries, entry_size) = (self.num_entries, self.entry_size);
        let outcome = stressor
            .run(&env, |thread| load_logic(thread_share(num_entries, total_threads, thread), entry_size))
            .map_err(|e| StageError::unexpected("cannot start loader", e))?;
        Ok(stress_ack(ctx, "load", outcome))
    }
}

pub(crate) fn thread_share(num_entries: u64, total_threads: u64, thread: ThreadIndex) -> Range {
    Range::divide_range(num_entries, total_threads, thread.global)
}

fn load_logic(
    keys: Range,
    entry_size: usize,
) -> impl FnMut(&mut StressContext) -> Result<Step, RequestError> + Send {
    let mut next = keys.iter();
    move |ctx: &mut StressContext| {
        let Some(index) = next.next() else {
            return Ok(Step::Finished);
        };
        let key = key_for(index);
        let value = random_value(ctx, entry_size);
        ctx.request(Operation::PUT, |ops| ops.put(&key, value))?;
        Ok(if next.is_empty() { Step::Finished } else { Step::Continue })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::ack::StageResult;
    use crate::capability::TraitRegistry;
    use crate::error::CapabilityError;
    use crate::stressor::StopSignal;

    #[derive(Default)]
    struct MapOps(Mutex<HashMap<String, Vec<u8>>>);

    impl BasicOperations for MapOps {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CapabilityError> {
            Ok(self.0.lock().unwrap().get(key).cloned())
        }

        fn put(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>, CapabilityError> {
            Ok(self.0.lock().unwrap().insert(key.to_owned(), value))
        }

        fn remove(&self, key: &str) -> Result<bool, CapabilityError> {
            Ok(self.0.lock().unwrap().remove(key).is_some())
        }
    }

    fn context(ops: Option<Arc<MapOps>>, worker: u32, targets: &[u32]) -> WorkerContext {
        let mut registry = TraitRegistry::new();
        if let Some(ops) = ops {
            registry.register::<dyn BasicOperations>(ops);
        }
        WorkerContext::new(worker, targets.len(), Arc::new(registry), StopSignal::new())
            .targeted(targets)
    }

    #[test]
    fn load_splits_keys_between_workers() {
        let ops = Arc::new(MapOps::default());
        let load = Load {
            threads_per_node: 3,
            entry_size: 8,
            ..Load::new(100)
        };
        // 6 threads in total: 17, 17, 17 | 17, 16, 16 keys
        for (worker, expected) in [(0, 51), (1, 49)] {
            let ack = load
                .run_on_worker(&context(Some(ops.clone()), worker, &[0, 1]))
                .unwrap();
            assert!(ack.success);
            let (_, statistics) = ack.statistics().unwrap();
            assert_eq!(statistics.requests(), expected);
        }
        let data = ops.0.lock().unwrap();
        assert_eq!(data.len(), 100);
        assert!(data.values().all(|v| v.len() == 8));
        assert!(data.contains_key(&key_for(0)) && data.contains_key(&key_for(99)));
    }

    #[test]
    fn stress_test_records_the_mix() {
        let ops = Arc::new(MapOps::default());
        let mut test = StressTest::new(50, Completion::Operations(200));
        test.threads_per_node = 4;
        test.remove_ratio = 1;
        test.seed = Some(11);
        test.validate(1).unwrap();

        let ack = test.run_on_worker(&context(Some(ops), 0, &[0])).unwrap();
        assert_eq!(ack.result(), StageResult::Success);
        let (name, statistics) = ack.statistics().unwrap();
        assert_eq!(name, "stress-test");
        assert_eq!(statistics.requests(), 200);
        assert!(statistics.get("Get").is_some_and(|s| s.requests > 0));
        assert!(statistics.get("Put").is_some_and(|s| s.requests > 0));
    }

    #[test]
    fn missing_operations_is_an_exception() {
        let test = StressTest::new(50, Completion::Operations(10));
        let error = test.run_on_worker(&context(None, 0, &[0])).unwrap_err();
        assert!(matches!(error, StageError::Unexpected { .. }));
    }

    #[test]
    fn completion_must_be_unambiguous() {
        let mut test = StressTest::new(50, Completion::Operations(10));
        test.duration_ms = Some(10);
        assert!(test.validate(1).is_err());
        test.num_operations = None;
        assert!(test.validate(1).is_ok());
        test.duration_ms = None;
        assert!(test.validate(1).is_err());
    }

    #[test]
    fn concurrent_selector_needs_enough_keys() {
        let mut test = StressTest::new(5, Completion::Operations(10));
        test.key_selector = KeySelectorConfig::Concurrent;
        assert!(test.validate(1).is_err());
        test.threads_per_node = 5;
        assert!(test.validate(1).is_ok());
    }

    #[test]
    fn concurrent_selector_counts_threads_of_every_worker() {
        let mut test = StressTest::new(15, Completion::Operations(10));
        test.key_selector = KeySelectorConfig::Concurrent;
        assert!(test.validate(1).is_ok());
        // 20 threads over two workers for 15 keys
        assert!(test.validate(2).is_err());
    }

    #[test]
    fn concurrent_selector_is_checked_again_on_the_worker() {
        let mut test = StressTest::new(15, Completion::Operations(10));
        test.key_selector = KeySelectorConfig::Concurrent;
        let ops = Arc::new(MapOps::default());
        let error = test
            .run_on_worker(&context(Some(ops), 1, &[0, 1]))
            .unwrap_err();
        assert!(matches!(error, StageError::Unexpected { .. }));
    }

    #[test]
    fn breached_condition_fails_the_stage() {
        struct Silent;

        #[async_trait::async_trait]
        impl crate::report::Reporter for Silent {
            async fn report(
                &self,
                _: &str,
                _: Option<WorkerId>,
                _: &str,
                _: &crate::stats::OperationStats,
            ) -> Result<(), Box<dyn std::error::Error>> {
                Ok(())
            }
        }

        let ops = Arc::new(MapOps::default());
        let mut test = StressTest::new(20, Completion::Operations(100));
        test.threads_per_node = 2;
        test.seed = Some(3);
        let ack = test.run_on_worker(&context(Some(ops), 0, &[0])).unwrap();

        let gets_over = |count| PerformanceCondition::Requests {
            on: "Get".into(),
            below: None,
            over: Some(count),
        };
        let mut main = crate::context::MainContext::new([0], Arc::new(Silent));
        test.conditions = vec![gets_over(0)];
        assert!(test.validate(1).is_ok());
        assert_eq!(test.process_on_main(&mut main, &[ack.clone()]), StageResult::Success);

        test.conditions = vec![gets_over(1_000)];
        assert_eq!(test.process_on_main(&mut main, &[ack]), StageResult::Fail);
        // statistics are still merged into the report
        assert_eq!(main.report().tests["stress-test"].merged.requests(), 200);
    }

    #[test]
    fn interrupted_test_fails_with_statistics() {
        let ops = Arc::new(MapOps::default());
        let ctx = context(Some(ops), 0, &[0]);
        ctx.stop_signal().raise();
        let ack = StressTest::new(10, Completion::Operations(100))
            .run_on_worker(&ctx)
            .unwrap();
        assert_eq!(ack.result(), StageResult::Fail);
        assert!(ack.statistics().is_some());
    }
}
