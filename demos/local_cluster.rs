use std::sync::Arc;
use std::time::Duration;

use fleetbench::key_selector::KeySelectorConfig;
use fleetbench::stage::{
    CheckData, Load, MonitorStart, MonitorStop, Report, ServiceStart, ServiceStop, StressTest,
};
use fleetbench::stressor::Completion;
use fleetbench::{
    Benchmark, InMemoryCache, LocalTransport, Master, MasterConfig, PerformanceCondition,
    StageKind, StdoutReporter, TraitRegistry, Worker,
};

const WORKERS: u32 = 4;
const ENTRIES: u64 = 100_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    // One cache shared by every worker stands in for a clustered product.
    let cache = Arc::new(InMemoryCache::new());
    let mut registry = TraitRegistry::new();
    cache.clone().register(&mut registry);
    let transport = LocalTransport::new(
        (0..WORKERS).map(|id| Worker::new(id, WORKERS as usize, registry.clone())),
    );

    let mut stress = StressTest::new(ENTRIES, Completion::Duration(Duration::from_secs(5)));
    stress.threads_per_node = 4;
    stress.key_selector = KeySelectorConfig::Gaussian {
        center: None,
        std_dev: Some(ENTRIES as f64 / 20.0),
    };
    stress.conditions = vec![PerformanceCondition::Errors {
        on: "Get".into(),
        total_below: Some(1),
        total_over: None,
        percent_below: None,
        percent_over: None,
    }];

    let benchmark = Benchmark::new("in-memory")
        .stage(StageKind::ServiceStart(ServiceStart {}))
        .stage(StageKind::Load(Load::new(ENTRIES)))
        .stage(StageKind::CheckData(CheckData::new(ENTRIES)))
        .stage(StageKind::MonitorStart(MonitorStart { interval_ms: 500 }))
        .stage(StageKind::StressTest(stress))
        .stage(StageKind::MonitorStop(MonitorStop {}))
        .stage(StageKind::Report(Report {
            tests: vec!["stress-test".into()],
            merged_only: true,
        }))
        .stage(StageKind::ServiceStop(ServiceStop::default()));

    let config = MasterConfig::builder()
        .ack_timeout(Duration::from_secs(60))
        .build();
    let report = Master::new(config, transport, Arc::new(StdoutReporter))
        .benchmark(benchmark)
        .run()
        .await?;

    for benchmark in &report.benchmarks {
        for (worker, samples) in &benchmark.timelines {
            if let Some(last) = samples.last() {
                println!("worker {worker}: {} samples, last {:?}", samples.len(), last.values);
            }
        }
        for failure in &benchmark.failures {
            println!(
                "{}: stage {} ({}) {} on workers {:?}",
                benchmark.name, failure.stage_index, failure.stage, failure.result, failure.workers
            );
        }
    }
    println!("run {}", if report.is_success() { "passed" } else { "failed" });
    Ok(())
}
