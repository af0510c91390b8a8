//! Summaries derived on demand from merged [`OperationStats`](super::OperationStats).
//!
//! Nothing here is accumulated; every representation is recomputed from the
//! raw counters so any merge order produces the same figures.
use fleetbench_macros::message;

/// Mean and sample standard deviation, in nanoseconds.
#[message]
#[derive(Copy, Default)]
pub struct MeanAndDev {
    pub mean: f64,
    pub dev: f64,
}

/// Box plot data in nanoseconds.
///
/// Quartiles are estimated from the bucket histogram; whiskers follow Tukey's
/// rule (1.5 IQR) and never reach past the observed min/max.
#[message]
#[derive(Copy, Default)]
pub struct BoxAndWhiskers {
    pub min_regular: f64,
    pub q1: f64,
    pub mean: f64,
    pub q3: f64,
    pub max_regular: f64,
}

/// Bar-chart data: bucket boundaries (`ranges.len() == counts.len() + 1`)
/// and the number of samples per bucket.
#[message]
#[derive(Default)]
pub struct Histogram {
    pub ranges: Vec<u64>,
    pub counts: Vec<u64>,
}

impl Histogram {
    /// Bucket counts as a percentage of all samples.
    pub fn percentages(&self) -> Vec<f64> {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return vec![0.0; self.counts.len()];
        }
        self.counts
            .iter()
            .map(|&c| c as f64 * 100.0 / total as f64)
            .collect()
    }
}

/// Headline numbers for one operation.
#[message]
#[derive(Copy, Default)]
pub struct DefaultOutcome {
    pub requests: u64,
    pub errors: u64,
    pub mean: f64,
    pub max: u64,
}

/// Operations per second over the statistics window. `net` only counts
/// successful requests.
#[message]
#[derive(Copy, Default)]
pub struct OperationThroughput {
    pub gross: f64,
    pub net: f64,
}
