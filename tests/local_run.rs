#![cfg(feature = "builtins")]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use fleetbench::capability::BasicOperations;
use fleetbench::key_selector::KeySelectorConfig;
use fleetbench::stage::{
    CheckData, Load, MonitorStart, MonitorStop, Report, ServiceStart, ServiceStop, Sleep,
    StressTest,
};
use fleetbench::stressor::Completion;
use fleetbench::{
    Benchmark, CapabilityError, InMemoryCache, LocalTransport, Master, MasterConfig,
    MemoryReporter, StageDefinition, StageKind, StageResult, TraitRegistry, Worker,
};

/// `workers` workers sharing one cache, like the nodes of a clustered product.
fn cluster(workers: u32) -> (Arc<InMemoryCache>, LocalTransport) {
    let cache = Arc::new(InMemoryCache::new());
    let mut registry = TraitRegistry::new();
    cache.clone().register(&mut registry);
    let transport = LocalTransport::new(
        (0..workers).map(|id| Worker::new(id, workers as usize, registry.clone())),
    );
    (cache, transport)
}

fn load(num_entries: u64) -> Load {
    Load {
        entry_size: 16,
        threads_per_node: 2,
        ..Load::new(num_entries)
    }
}

fn check(num_entries: u64) -> CheckData {
    CheckData {
        entry_size: 16,
        threads_per_node: 2,
        ..CheckData::new(num_entries)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn load_check_and_stress_across_three_workers() {
    let (cache, transport) = cluster(3);
    let reporter = Arc::new(MemoryReporter::new());

    let mut stress = StressTest::new(300, Completion::Operations(120));
    stress.threads_per_node = 2;
    stress.key_selector = KeySelectorConfig::Concurrent;
    stress.transaction_size = Some(4);
    stress.entry_size = 16;

    let benchmark = Benchmark::new("cluster")
        .stage(StageKind::ServiceStart(ServiceStart {}))
        .stage(StageKind::Load(load(300)))
        .stage(StageKind::CheckData(check(300)))
        .stage(StageKind::StressTest(stress))
        .stage(StageKind::CheckData(check(300)))
        .stage(StageKind::Report(Report::default()));

    let report = Master::new(MasterConfig::default(), transport, reporter.clone())
        .benchmark(benchmark)
        .run()
        .await
        .unwrap();

    assert!(report.is_success(), "{report:#?}");
    assert_eq!(cache.len(), 300);

    let bench = report.benchmark("cluster").unwrap();
    let load = &bench.tests["load"];
    assert_eq!(load.per_worker.len(), 3);
    assert_eq!(load.merged.requests(), 300);

    let stress = &bench.tests["stress-test"].merged;
    let requests = |op: &str| stress.get(op).map_or(0, |s| s.requests);
    assert_eq!(requests("Get") + requests("Put"), 360);
    // 6 threads, 60 requests each, 4 per transaction
    assert_eq!(requests("TxCommit"), 90);
    assert_eq!(stress.errors(), 0);

    let entries = reporter.entries();
    assert!(entries.iter().all(|e| e.benchmark == "cluster"));
    assert!(entries.iter().any(|e| e.worker.is_none() && e.operation == "Put"));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_data_fails_but_the_benchmark_goes_on() {
    let (_cache, transport) = cluster(2);
    let benchmark = Benchmark::new("unloaded")
        .stage(StageKind::ServiceStart(ServiceStart {}))
        .stage(StageKind::CheckData(check(10)))
        .stage(StageKind::Load(load(10)))
        .stage(StageKind::CheckData(check(10)));

    let report = Master::new(MasterConfig::default(), transport, Arc::new(MemoryReporter::new()))
        .benchmark(benchmark)
        .run()
        .await
        .unwrap();

    let bench = &report.benchmarks[0];
    assert!(!bench.aborted);
    assert_eq!(bench.failures.len(), 1);
    assert_eq!(bench.failures[0].stage_index, 1);
    assert_eq!(bench.failures[0].result, StageResult::Fail);
    assert_eq!(bench.failures[0].workers, vec![0, 1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_service_skips_tests() {
    let (cache, transport) = cluster(2);
    let stop = StageDefinition::new(StageKind::ServiceStop(ServiceStop { exit_worker: true }))
        .on_workers([1]);
    let benchmark = Benchmark::new("shrinking")
        .stage(StageKind::ServiceStart(ServiceStart {}))
        .stage(stop)
        .stage(StageKind::Load(load(10)));

    let report = Master::new(MasterConfig::default(), transport, Arc::new(MemoryReporter::new()))
        .benchmark(benchmark)
        .run()
        .await
        .unwrap();

    // the shared cache is stopped for everyone, worker 0 skips the load
    assert!(report.is_success());
    assert!(cache.is_empty());
    assert!(!report.benchmarks[0].tests.contains_key("load"));
}

#[tokio::test(flavor = "multi_thread")]
async fn benchmark_from_json_runs() {
    let (cache, transport) = cluster(2);
    let benchmark = Benchmark::from_json(
        r#"{
            "name": "json",
            "stages": [
                { "stage": { "type": "ServiceStart" } },
                { "stage": { "type": "Load", "num_entries": 40, "entry_size": 8, "threads_per_node": 2 } },
                { "stage": { "type": "StressTest", "num_entries": 40, "duration_ms": 50,
                             "threads_per_node": 2, "put_ratio": 0, "remove_ratio": 1,
                             "key_selector": { "type": "gaussian", "std_dev": 5.0 } } },
                { "stage": { "type": "Sleep", "duration_ms": 5 } }
            ]
        }"#,
    )
    .unwrap();

    let report = Master::new(MasterConfig::default(), transport, Arc::new(MemoryReporter::new()))
        .benchmark(benchmark)
        .run()
        .await
        .unwrap();
    assert!(report.is_success(), "{report:#?}");
    assert!(cache.len() <= 40);
    assert!(report.benchmarks[0].tests["stress-test"].merged.requests() > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn monitor_records_the_load() {
    let (_cache, transport) = cluster(2);
    let benchmark = Benchmark::new("monitored")
        .stage(StageKind::ServiceStart(ServiceStart {}))
        .stage(StageKind::MonitorStart(MonitorStart { interval_ms: 5 }))
        .stage(StageKind::Load(load(200)))
        .stage(StageKind::Sleep(Sleep { duration_ms: 30 }))
        .stage(StageKind::MonitorStop(MonitorStop {}));

    let report = Master::new(MasterConfig::default(), transport, Arc::new(MemoryReporter::new()))
        .benchmark(benchmark)
        .run()
        .await
        .unwrap();

    assert!(report.is_success(), "{report:#?}");
    let timelines = &report.benchmarks[0].timelines;
    assert_eq!(timelines.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    for samples in timelines.values() {
        let last = samples.last().unwrap();
        assert_eq!(last.values["entries"], 200.0);
        assert_eq!(last.values["running"], 1.0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn forgotten_monitor_fails_the_cleanup() {
    let (_cache, transport) = cluster(1);
    let benchmark = Benchmark::new("leaky")
        .stage(StageKind::ServiceStart(ServiceStart {}))
        .stage(StageKind::MonitorStart(MonitorStart { interval_ms: 5 }));

    let report = Master::new(MasterConfig::default(), transport, Arc::new(MemoryReporter::new()))
        .benchmark(benchmark)
        .run()
        .await
        .unwrap();

    let failures = &report.benchmarks[0].failures;
    assert_eq!(failures.len(), 1);
    assert_eq!((failures[0].stage_index, failures[0].stage.as_str()), (2, "Cleanup"));
    assert_eq!(failures[0].result, StageResult::Fail);
    assert!(!report.benchmarks[0].aborted);
}

/// Every request takes 10ms; counts the requests and how many overlapped.
#[derive(Default)]
struct Sluggish {
    calls: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Sluggish {
    fn call<T>(&self, value: T) -> Result<T, CapabilityError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(value)
    }
}

impl BasicOperations for Sluggish {
    fn get(&self, _: &str) -> Result<Option<Vec<u8>>, CapabilityError> {
        self.call(None)
    }

    fn put(&self, _: &str, _: Vec<u8>) -> Result<Option<Vec<u8>>, CapabilityError> {
        self.call(None)
    }

    fn remove(&self, _: &str) -> Result<bool, CapabilityError> {
        self.call(false)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_stage_stops_before_the_next_one_starts() {
    let ops = Arc::new(Sluggish::default());
    let mut registry = TraitRegistry::new();
    registry.register::<dyn BasicOperations>(ops.clone());
    let transport = LocalTransport::new([Worker::new(0, 1, registry)]);

    let mut stress = StressTest::new(10, Completion::Duration(Duration::from_secs(5)));
    stress.threads_per_node = 1;
    let load = Load {
        threads_per_node: 1,
        ..load(2)
    };
    let benchmark = Benchmark::new("stuck")
        .stage(StageKind::StressTest(stress))
        .stage(StageKind::Load(load));
    let config = MasterConfig::builder()
        .ack_timeout(Duration::from_millis(200))
        .build();

    let started = Instant::now();
    let report = Master::new(config, transport, Arc::new(MemoryReporter::new()))
        .benchmark(benchmark)
        .run()
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());

    let bench = &report.benchmarks[0];
    assert!(!bench.aborted);
    assert_eq!(bench.failures.len(), 1);
    assert_eq!((bench.failures[0].stage_index, bench.failures[0].result), (0, StageResult::Fail));
    assert_eq!(bench.failures[0].workers, vec![0]);
    assert_eq!(bench.tests["load"].merged.requests(), 2);
    assert_eq!(ops.max_in_flight.load(Ordering::SeqCst), 1);

    // nothing keeps issuing requests once the run is over
    let calls = ops.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ops.calls.load(Ordering::SeqCst), calls);
}
