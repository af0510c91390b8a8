use std::collections::BTreeMap;

use async_trait::async_trait;
use fleetbench_macros::message;

use crate::WorkerId;
use crate::ack::StageResult;
use crate::monitor::MonitorSample;
use crate::stats::{OperationStats, Statistics};

/// A [`Reporter`] is the sink for aggregated statistics.
///
/// Rendering (charts, HTML, files) lives behind this trait; the controller
/// only hands over numbers. `worker` is `None` for the cluster-wide merge.
///
/// # Example
/// ```rust
/// use async_trait::async_trait;
/// use fleetbench::{Reporter, WorkerId, stats::OperationStats};
///
/// struct Silent;
///
/// #[async_trait]
/// impl Reporter for Silent {
///     async fn report(
///         &self,
///         _benchmark: &str,
///         _worker: Option<WorkerId>,
///         _operation: &str,
///         _statistics: &OperationStats,
///     ) -> Result<(), Box<dyn std::error::Error>> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(
        &self,
        benchmark: &str,
        worker: Option<WorkerId>,
        operation: &str,
        statistics: &OperationStats,
    ) -> Result<(), Box<dyn std::error::Error>>;
}

/// Statistics of one test, per worker and merged.
#[message]
#[derive(Default, Eq)]
pub struct TestStatistics {
    pub per_worker: BTreeMap<WorkerId, Statistics>,
    pub merged: Statistics,
}

impl TestStatistics {
    pub fn add(&mut self, worker: WorkerId, statistics: &Statistics) {
        self.per_worker
            .entry(worker)
            .or_default()
            .merge(statistics);
        self.merged.merge(statistics);
    }
}

/// A stage that did not succeed.
#[message]
#[derive(Eq)]
pub struct StageFailure {
    pub stage_index: usize,
    pub stage: String,
    pub result: StageResult,
    /// Workers whose ack was not a success. Empty for main-only stages.
    pub workers: Vec<WorkerId>,
}

/// Outcome of one benchmark.
#[message]
pub struct BenchmarkReport {
    pub name: String,
    pub failures: Vec<StageFailure>,
    /// Remaining stages were dropped after a failure.
    pub aborted: bool,
    /// Keyed by test name.
    pub tests: BTreeMap<String, TestStatistics>,
    /// Monitor samples per worker, in the order they were taken.
    #[serde(default)]
    pub timelines: BTreeMap<WorkerId, Vec<MonitorSample>>,
}

impl BenchmarkReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failures: Vec::new(),
            aborted: false,
            tests: BTreeMap::new(),
            timelines: BTreeMap::new(),
        }
    }

    pub fn add_statistics(&mut self, test: &str, worker: WorkerId, statistics: &Statistics) {
        self.tests
            .entry(test.to_owned())
            .or_default()
            .add(worker, statistics);
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.aborted
    }
}

/// Everything a controller run produced.
#[message]
#[derive(Default)]
pub struct RunReport {
    pub benchmarks: Vec<BenchmarkReport>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.benchmarks.iter().all(BenchmarkReport::is_success)
    }

    pub fn benchmark(&self, name: &str) -> Option<&BenchmarkReport> {
        self.benchmarks.iter().find(|b| b.name == name)
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use parking_lot::Mutex;

    use super::*;

    /// Prints a summary of every report to stdout.
    pub struct StdoutReporter;

    #[async_trait]
    impl Reporter for StdoutReporter {
        async fn report(
            &self,
            benchmark: &str,
            worker: Option<WorkerId>,
            operation: &str,
            statistics: &OperationStats,
        ) -> Result<(), Box<dyn std::error::Error>> {
            let source = match worker {
                Some(worker) => format!("worker {worker}"),
                None => "cluster".to_owned(),
            };
            println!("[{benchmark}] {operation} on {source}");
            println!("{:#?}", statistics.default_outcome());
            println!("{:#?}", statistics.mean_and_dev());
            println!("{:#?}", statistics.box_and_whiskers());
            Ok(())
        }
    }

    /// One call to [`MemoryReporter::report`].
    #[derive(Clone, Debug, PartialEq)]
    pub struct ReportedEntry {
        pub benchmark: String,
        pub worker: Option<WorkerId>,
        pub operation: String,
        pub statistics: OperationStats,
    }

    /// Keeps every report in memory, for tests and embedding.
    #[derive(Default)]
    pub struct MemoryReporter {
        entries: Mutex<Vec<ReportedEntry>>,
    }

    impl MemoryReporter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn entries(&self) -> Vec<ReportedEntry> {
            self.entries.lock().clone()
        }
    }

    #[async_trait]
    impl Reporter for MemoryReporter {
        async fn report(
            &self,
            benchmark: &str,
            worker: Option<WorkerId>,
            operation: &str,
            statistics: &OperationStats,
        ) -> Result<(), Box<dyn std::error::Error>> {
            self.entries.lock().push(ReportedEntry {
                benchmark: benchmark.to_owned(),
                worker,
                operation: operation.to_owned(),
                statistics: statistics.clone(),
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::stats::Operation;

    fn sampled(n: u64) -> Statistics {
        let mut statistics = Statistics::new();
        for i in 0..n {
            statistics.record(Operation::GET, Duration::from_micros(i + 1), true);
        }
        statistics
    }

    #[test]
    fn test_statistics_keep_workers_apart() {
        let mut report = BenchmarkReport::new("bench");
        report.add_statistics("stress", 0, &sampled(3));
        report.add_statistics("stress", 1, &sampled(5));
        report.add_statistics("stress", 1, &sampled(1));

        let test = &report.tests["stress"];
        assert_eq!(test.per_worker[&0].requests(), 3);
        assert_eq!(test.per_worker[&1].requests(), 6);
        assert_eq!(test.merged.requests(), 9);
        assert!(report.is_success());
    }

    #[test]
    fn aborted_benchmark_fails_the_run() {
        let mut aborted = BenchmarkReport::new("second");
        aborted.aborted = true;
        let run = RunReport {
            benchmarks: vec![BenchmarkReport::new("first"), aborted],
        };
        assert!(!run.is_success());
        assert!(run.benchmark("first").is_some_and(BenchmarkReport::is_success));
    }

    #[cfg(feature = "builtins")]
    #[tokio::test]
    async fn memory_reporter_keeps_entries() {
        let reporter = MemoryReporter::new();
        let statistics = sampled(2);
        let get = statistics.get("Get").unwrap();
        reporter.report("bench", Some(3), "Get", get).await.unwrap();
        reporter.report("bench", None, "Get", get).await.unwrap();

        let entries = reporter.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].worker, Some(3));
        assert_eq!(entries[1].statistics.requests, 2);
    }
}
