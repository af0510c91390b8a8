//! Latency accumulation and merging.
//!
//! Each stress thread owns a [`Statistics`] and records into it without any
//! synchronization. When the threads are joined their statistics are merged
//! into one per worker, the controller merges the workers, and a report may
//! merge several stages. [`Statistics::merge`] is associative and commutative
//! (integer sums, min/max), so the grouping of those merges never changes
//! the result.
//!
//! Derived figures live in [`representation`] and are computed on demand.
pub mod condition;
pub mod histogram;
pub mod representation;

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fleetbench_macros::message;

pub use condition::PerformanceCondition;
pub use histogram::LatencyHistogram;
use representation::{
    BoxAndWhiskers, DefaultOutcome, Histogram, MeanAndDev, OperationThroughput,
};

/// Tag identifying the kind of a timed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Operation {
    pub name: &'static str,
}

impl Operation {
    pub const GET: Operation = Operation::new("Get");
    pub const GET_NULL: Operation = Operation::new("GetNull");
    pub const PUT: Operation = Operation::new("Put");
    pub const REMOVE: Operation = Operation::new("Remove");
    pub const TX_COMMIT: Operation = Operation::new("TxCommit");
    pub const TX_ROLLBACK: Operation = Operation::new("TxRollback");

    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Raw counters for one operation kind.
#[message]
#[derive(Eq)]
pub struct OperationStats {
    pub requests: u64,
    pub errors: u64,
    sum: u128,
    sum_squares: u128,
    min: u64,
    max: u64,
    histogram: LatencyHistogram,
}

impl Default for OperationStats {
    fn default() -> Self {
        Self {
            requests: 0,
            errors: 0,
            sum: 0,
            sum_squares: 0,
            min: u64::MAX,
            max: 0,
            histogram: LatencyHistogram::new(),
        }
    }
}

impl OperationStats {
    pub fn record(&mut self, duration: Duration, successful: bool) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.requests += 1;
        if !successful {
            self.errors += 1;
        }
        self.sum = self.sum.saturating_add(u128::from(nanos));
        self.sum_squares = self
            .sum_squares
            .saturating_add(u128::from(nanos) * u128::from(nanos));
        self.min = self.min.min(nanos);
        self.max = self.max.max(nanos);
        self.histogram.record(nanos);
    }

    pub fn merge(&mut self, other: &Self) {
        self.requests += other.requests;
        self.errors += other.errors;
        self.sum = self.sum.saturating_add(other.sum);
        self.sum_squares = self.sum_squares.saturating_add(other.sum_squares);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.histogram.merge(&other.histogram);
    }

    pub fn is_empty(&self) -> bool {
        self.requests == 0
    }

    pub fn sum_nanos(&self) -> u128 {
        self.sum
    }

    pub fn histogram(&self) -> &LatencyHistogram {
        &self.histogram
    }

    pub fn mean_and_dev(&self) -> MeanAndDev {
        if self.requests == 0 {
            return MeanAndDev::default();
        }
        let n = self.requests as f64;
        let mean = self.sum as f64 / n;
        if self.requests < 2 {
            return MeanAndDev { mean, dev: 0.0 };
        }
        MeanAndDev {
            mean,
            dev: self.variance().max(0.0).sqrt(),
        }
    }

    /// Sample variance, exact in integers while `n * sum_squares` fits a
    /// `u128`.
    fn variance(&self) -> f64 {
        let n = u128::from(self.requests);
        let exact = n
            .checked_mul(self.sum_squares)
            .zip(self.sum.checked_mul(self.sum))
            .and_then(|(scaled, square)| scaled.checked_sub(square));
        match exact {
            Some(spread) => spread as f64 / (n * (n - 1)) as f64,
            None => {
                let mean = self.sum as f64 / n as f64;
                (self.sum_squares as f64 - self.sum as f64 * mean) / (n as f64 - 1.0)
            }
        }
    }

    pub fn box_and_whiskers(&self) -> BoxAndWhiskers {
        let mean = self.mean_and_dev().mean;
        let (Some(q1), Some(q3)) = (self.histogram.quantile(0.25), self.histogram.quantile(0.75))
        else {
            return BoxAndWhiskers::default();
        };
        // bucket interpolation may overshoot the observed extremes
        let (min, max) = (self.min as f64, self.max as f64);
        let q1 = q1.clamp(min, max);
        let q3 = q3.clamp(min, max);
        let iqr = q3 - q1;
        BoxAndWhiskers {
            min_regular: (q1 - 1.5 * iqr).max(min),
            q1,
            mean,
            q3,
            max_regular: (q3 + 1.5 * iqr).min(max),
        }
    }

    /// Latency in nanoseconds below which `percent` of the requests fell,
    /// kept within the observed extremes.
    pub fn percentile(&self, percent: f64) -> Option<f64> {
        self.histogram
            .quantile(percent / 100.0)
            .map(|value| value.clamp(self.min as f64, self.max as f64))
    }

    pub fn ranges(&self) -> Histogram {
        let (ranges, counts) = self.histogram.ranges();
        Histogram { ranges, counts }
    }

    pub fn default_outcome(&self) -> DefaultOutcome {
        DefaultOutcome {
            requests: self.requests,
            errors: self.errors,
            mean: self.mean_and_dev().mean,
            max: self.max,
        }
    }

    /// Throughput over `window`.
    pub fn throughput(&self, window: Duration) -> OperationThroughput {
        let secs = window.as_secs_f64();
        if secs <= 0.0 {
            return OperationThroughput::default();
        }
        OperationThroughput {
            gross: self.requests as f64 / secs,
            net: (self.requests - self.errors) as f64 / secs,
        }
    }
}

/// Per-operation statistics plus the wall-clock window they were gathered in.
#[message]
#[derive(Default, Eq)]
pub struct Statistics {
    /// Unix epoch milliseconds of the first `begin` among merged statistics.
    pub begin_ms: Option<u64>,
    /// Unix epoch milliseconds of the last `end` among merged statistics.
    pub end_ms: Option<u64>,
    pub operations: BTreeMap<String, OperationStats>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) {
        self.begin_ms = Some(now_ms());
    }

    pub fn end(&mut self) {
        self.end_ms = Some(now_ms());
    }

    pub fn record(&mut self, operation: Operation, duration: Duration, successful: bool) {
        match self.operations.get_mut(operation.name) {
            Some(stats) => stats.record(duration, successful),
            None => {
                let mut stats = OperationStats::default();
                stats.record(duration, successful);
                self.operations.insert(operation.name.to_owned(), stats);
            }
        }
    }

    pub fn merge(&mut self, other: &Statistics) {
        self.begin_ms = merge_opt(self.begin_ms, other.begin_ms, u64::min);
        self.end_ms = merge_opt(self.end_ms, other.end_ms, u64::max);
        for (name, stats) in &other.operations {
            self.operations.entry(name.clone()).or_default().merge(stats);
        }
    }

    pub fn get(&self, operation: &str) -> Option<&OperationStats> {
        self.operations.get(operation)
    }

    pub fn requests(&self) -> u64 {
        self.operations.values().map(|s| s.requests).sum()
    }

    pub fn errors(&self) -> u64 {
        self.operations.values().map(|s| s.errors).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.values().all(OperationStats::is_empty)
    }

    pub fn window(&self) -> Duration {
        match (self.begin_ms, self.end_ms) {
            (Some(begin), Some(end)) => Duration::from_millis(end.saturating_sub(begin)),
            _ => Duration::ZERO,
        }
    }

    pub fn throughput(&self, operation: &str) -> Option<OperationThroughput> {
        self.get(operation).map(|s| s.throughput(self.window()))
    }
}

fn merge_opt(a: Option<u64>, b: Option<u64>, pick: fn(u64, u64) -> u64) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, b) => a.or(b),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seed: u64) -> Statistics {
        let mut stats = Statistics::new();
        stats.begin_ms = Some(1_000 + seed);
        stats.end_ms = Some(5_000 + seed * 3);
        for i in 0..(50 + seed) {
            let nanos = (i * 7919 + seed * 104_729) % 3_000_000;
            stats.record(Operation::GET, Duration::from_nanos(nanos), i % 11 != 0);
            if i % 3 == 0 {
                stats.record(Operation::PUT, Duration::from_nanos(nanos * 2), true);
            }
        }
        if seed % 2 == 0 {
            stats.record(Operation::REMOVE, Duration::from_micros(seed + 1), false);
        }
        stats
    }

    fn merged(parts: &[&Statistics]) -> Statistics {
        let mut acc = Statistics::new();
        for p in parts {
            acc.merge(p);
        }
        acc
    }

    #[test]
    fn merge_is_commutative() {
        let (a, b, c) = (sample(1), sample(2), sample(3));
        assert_eq!(merged(&[&a, &b, &c]), merged(&[&c, &a, &b]));
        assert_eq!(merged(&[&b, &a]), merged(&[&a, &b]));
    }

    #[test]
    fn merge_is_associative() {
        let (a, b, c) = (sample(4), sample(5), sample(6));
        let mut left = a.clone();
        left.merge(&b);
        left.merge(&c);

        let mut bc = b.clone();
        bc.merge(&c);
        let mut right = a.clone();
        right.merge(&bc);

        assert_eq!(left, right);
        assert_eq!(left.requests(), a.requests() + b.requests() + c.requests());
        assert_eq!(left.begin_ms, Some(1_004));
        assert_eq!(left.end_ms, Some(5_018));
    }

    #[test]
    fn merging_empty_is_identity() {
        let a = sample(8);
        let mut m = Statistics::new();
        m.merge(&a);
        assert_eq!(m, a);
    }

    #[test]
    fn mean_and_dev() {
        let mut stats = OperationStats::default();
        for n in [2u64, 4, 4, 4, 5, 5, 7, 9] {
            stats.record(Duration::from_nanos(n), true);
        }
        let md = stats.mean_and_dev();
        assert!((md.mean - 5.0).abs() < 1e-9);
        // sample deviation of the classic population-dev-2 data set
        assert!((md.dev - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn deviation_of_large_clustered_latencies() {
        let mut stats = OperationStats::default();
        for i in 0..10u64 {
            stats.record(Duration::from_nanos(1_000_000_000_000 + i), true);
        }
        // sample variance of 0..10 is 55 / 6
        let dev = stats.mean_and_dev().dev;
        assert!((dev - (55.0f64 / 6.0).sqrt()).abs() < 1e-9, "{dev}");
    }

    #[test]
    fn single_sample_has_no_deviation() {
        let mut stats = OperationStats::default();
        stats.record(Duration::from_micros(3), true);
        assert_eq!(stats.mean_and_dev(), MeanAndDev { mean: 3000.0, dev: 0.0 });
    }

    #[test]
    fn box_and_whiskers_within_extremes() {
        let mut stats = OperationStats::default();
        for n in 1..=1000u64 {
            stats.record(Duration::from_micros(n), true);
        }
        let b = stats.box_and_whiskers();
        assert!(b.min_regular >= 1_000.0);
        assert!(b.max_regular <= 1_000_000.0);
        assert!(b.min_regular <= b.q1 && b.q1 <= b.q3 && b.q3 <= b.max_regular);
        // quartiles within one bucket width (25%) of the exact values
        assert!((b.q1 - 250_000.0).abs() < 250_000.0 * 0.25);
        assert!((b.q3 - 750_000.0).abs() < 750_000.0 * 0.25);
        assert!((b.mean - 500_500.0).abs() < 1e-6);
    }

    #[test]
    fn histogram_percentages_sum_to_hundred() {
        let mut stats = OperationStats::default();
        for n in [10u64, 100, 1000, 1000, 10_000] {
            stats.record(Duration::from_nanos(n), true);
        }
        let h = stats.ranges();
        assert_eq!(h.ranges.len(), h.counts.len() + 1);
        let total: f64 = h.percentages().iter().sum();
        assert!((total - 100.0).abs() < 1e-9);
    }

    #[test]
    fn throughput_uses_window() {
        let mut stats = Statistics::new();
        stats.begin_ms = Some(0);
        stats.end_ms = Some(2_000);
        for i in 0..10 {
            stats.record(Operation::GET, Duration::from_micros(1), i < 8);
        }
        let t = stats.throughput("Get").unwrap();
        assert_eq!(t.gross, 5.0);
        assert_eq!(t.net, 4.0);
        assert_eq!(stats.errors(), 2);
    }

    #[test]
    fn survives_json() {
        let a = sample(3);
        let json = serde_json::to_string(&a).unwrap();
        let back: Statistics = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }
}
