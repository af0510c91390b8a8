//! Stages that run on the controller only.
use std::time::Duration;

use fleetbench_macros::stage;

use super::MainStage;
use crate::context::MainContext;
use crate::error::{ConfigError, StageError};

/// Pauses the benchmark.
#[stage]
pub struct Sleep {
    pub duration_ms: u64,
}

impl MainStage for Sleep {
    async fn execute(&self, _ctx: &mut MainContext) -> Result<(), StageError> {
        tracing::info!("Sleeping for {}ms", self.duration_ms);
        tokio::time::sleep(Duration::from_millis(self.duration_ms)).await;
        Ok(())
    }
}

/// Pushes the statistics gathered so far in this benchmark to the reporter:
/// per worker, then merged over the cluster.
#[stage]
#[derive(Default)]
pub struct Report {
    /// Only report these tests; empty reports all of them.
    #[serde(default)]
    pub tests: Vec<String>,
    /// Skip the per-worker reports.
    #[serde(default)]
    pub merged_only: bool,
}

impl MainStage for Report {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tests.iter().any(String::is_empty) {
            return Err(ConfigError::invalid("tests", "test names cannot be empty"));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut MainContext) -> Result<(), StageError> {
        let reporter = ctx.reporter();
        let report = ctx.report();
        let benchmark = report.name.as_str();
        let mut reported = 0usize;

        for (test, statistics) in &report.tests {
            if !self.tests.is_empty() && !self.tests.contains(test) {
                continue;
            }
            let per_worker = statistics
                .per_worker
                .iter()
                .filter(|_| !self.merged_only)
                .map(|(worker, s)| (Some(*worker), s));
            for (worker, statistics) in per_worker.chain([(None, &statistics.merged)]) {
                for (operation, stats) in &statistics.operations {
                    reporter
                        .report(benchmark, worker, operation, stats)
                        .await
                        .map_err(|e| StageError::Unexpected {
                            message: format!("reporter failed on {test}/{operation}: {e}"),
                            source: None,
                        })?;
                    reported += 1;
                }
            }
        }
        tracing::info!("Reported {reported} operation summaries for {benchmark}");
        Ok(())
    }
}
