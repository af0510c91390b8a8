//! Pass/fail thresholds on the statistics of a test.
//!
//! Latency bounds are in microseconds, throughput bounds in operations per
//! second. Every leaf condition names the operation it applies to and sets
//! exactly one of `below` and `over`.
//!
//! ```json
//! { "type": "all", "conditions": [
//!     { "type": "mean", "on": "Get", "below": 500.0 },
//!     { "type": "errors", "on": "Put", "percent_below": 1.0 } ] }
//! ```
use fleetbench_macros::message;
use thiserror::Error;

use super::{OperationStats, Statistics};
use crate::error::ConfigError;

#[message]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum PerformanceCondition {
    /// At least one inner condition holds.
    Any { conditions: Vec<PerformanceCondition> },
    /// Every inner condition holds.
    All { conditions: Vec<PerformanceCondition> },
    /// Mean response time.
    Mean {
        on: String,
        #[serde(default)]
        below: Option<f64>,
        #[serde(default)]
        over: Option<f64>,
    },
    /// Response time at `value` percent of the requests, 0 being the fastest.
    Percentile {
        on: String,
        value: f64,
        #[serde(default)]
        below: Option<f64>,
        #[serde(default)]
        over: Option<f64>,
    },
    /// All requests per second, failed ones included.
    ThroughputGross {
        on: String,
        #[serde(default)]
        below: Option<f64>,
        #[serde(default)]
        over: Option<f64>,
    },
    /// Successful requests per second.
    ThroughputNet {
        on: String,
        #[serde(default)]
        below: Option<f64>,
        #[serde(default)]
        over: Option<f64>,
    },
    /// Number of requests.
    Requests {
        on: String,
        #[serde(default)]
        below: Option<u64>,
        #[serde(default)]
        over: Option<u64>,
    },
    /// Failed requests, as a count or a percentage of all requests. Exactly
    /// one bound is set.
    Errors {
        on: String,
        #[serde(default)]
        total_below: Option<u64>,
        #[serde(default)]
        total_over: Option<u64>,
        #[serde(default)]
        percent_below: Option<f64>,
        #[serde(default)]
        percent_over: Option<f64>,
    },
}

/// Why a condition does not hold.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Breach {
    #[error("no statistics for operation '{0}'")]
    NoStatistics(String),
    #[error("{what} of {on} is {actual:.2}, expected {bound}")]
    Unmet {
        what: &'static str,
        on: String,
        actual: f64,
        bound: String,
    },
    #[error("none of the alternatives holds: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    NoneHolds(Vec<Breach>),
}

impl PerformanceCondition {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Any { conditions } | Self::All { conditions } => {
                if conditions.is_empty() {
                    return Err(ConfigError::invalid("conditions", "needs at least one condition"));
                }
                conditions.iter().try_for_each(Self::validate)
            }
            Self::Mean { on, below, over }
            | Self::ThroughputGross { on, below, over }
            | Self::ThroughputNet { on, below, over } => {
                operation_named(on)?;
                one_bound(&[below.is_some(), over.is_some()])
            }
            Self::Percentile {
                on,
                value,
                below,
                over,
            } => {
                operation_named(on)?;
                if !(0.0..=100.0).contains(value) {
                    return Err(ConfigError::invalid("value", format!("{value} is not a percentage")));
                }
                one_bound(&[below.is_some(), over.is_some()])
            }
            Self::Requests { on, below, over } => {
                operation_named(on)?;
                one_bound(&[below.is_some(), over.is_some()])
            }
            Self::Errors {
                on,
                total_below,
                total_over,
                percent_below,
                percent_over,
            } => {
                operation_named(on)?;
                one_bound(&[
                    total_below.is_some(),
                    total_over.is_some(),
                    percent_below.is_some(),
                    percent_over.is_some(),
                ])
            }
        }
    }

    /// Checks the condition against the merged statistics of a test.
    pub fn evaluate(&self, statistics: &Statistics) -> Result<(), Breach> {
        match self {
            Self::All { conditions } => conditions.iter().try_for_each(|c| c.evaluate(statistics)),
            Self::Any { conditions } => {
                let mut breaches = Vec::new();
                for condition in conditions {
                    match condition.evaluate(statistics) {
                        Ok(()) => return Ok(()),
                        Err(breach) => breaches.push(breach),
                    }
                }
                Err(Breach::NoneHolds(breaches))
            }
            Self::Mean { on, below, over } => {
                let mean = operation(statistics, on)?.mean_and_dev().mean / 1_000.0;
                compare("mean response time (us)", on, mean, *below, *over)
            }
            Self::Percentile {
                on,
                value,
                below,
                over,
            } => {
                let nanos = operation(statistics, on)?
                    .percentile(*value)
                    .ok_or_else(|| Breach::NoStatistics(on.clone()))?;
                compare("percentile response time (us)", on, nanos / 1_000.0, *below, *over)
            }
            Self::ThroughputGross { on, below, over } => {
                operation(statistics, on)?;
                let gross = statistics.throughput(on).map_or(0.0, |t| t.gross);
                compare("gross throughput (ops/s)", on, gross, *below, *over)
            }
            Self::ThroughputNet { on, below, over } => {
                operation(statistics, on)?;
                let net = statistics.throughput(on).map_or(0.0, |t| t.net);
                compare("net throughput (ops/s)", on, net, *below, *over)
            }
            Self::Requests { on, below, over } => {
                let requests = operation(statistics, on)?.requests;
                compare(
                    "request count",
                    on,
                    requests as f64,
                    below.map(|b| b as f64),
                    over.map(|o| o as f64),
                )
            }
            Self::Errors {
                on,
                total_below,
                total_over,
                percent_below,
                percent_over,
            } => {
                let stats = operation(statistics, on)?;
                if total_below.is_some() || total_over.is_some() {
                    return compare(
                        "error count",
                        on,
                        stats.errors as f64,
                        total_below.map(|b| b as f64),
                        total_over.map(|o| o as f64),
                    );
                }
                let percent = if stats.requests == 0 {
                    0.0
                } else {
                    100.0 * stats.errors as f64 / stats.requests as f64
                };
                compare("error percentage", on, percent, *percent_below, *percent_over)
            }
        }
    }
}

fn operation<'a>(statistics: &'a Statistics, on: &str) -> Result<&'a OperationStats, Breach> {
    statistics
        .get(on)
        .filter(|stats| !stats.is_empty())
        .ok_or_else(|| Breach::NoStatistics(on.to_owned()))
}

fn compare(
    what: &'static str,
    on: &str,
    actual: f64,
    below: Option<f64>,
    over: Option<f64>,
) -> Result<(), Breach> {
    let (holds, bound) = match (below, over) {
        (Some(limit), _) => (actual < limit, format!("below {limit}")),
        (None, Some(limit)) => (actual > limit, format!("over {limit}")),
        (None, None) => (true, String::new()),
    };
    if holds {
        tracing::debug!("{what} of {on} is {actual:.2}, {bound}");
        return Ok(());
    }
    Err(Breach::Unmet {
        what,
        on: on.to_owned(),
        actual,
        bound,
    })
}

fn operation_named(on: &str) -> Result<(), ConfigError> {
    if on.is_empty() {
        return Err(ConfigError::invalid("on", "operation name cannot be empty"));
    }
    Ok(())
}

fn one_bound(set: &[bool]) -> Result<(), ConfigError> {
    match set.iter().filter(|s| **s).count() {
        1 => Ok(()),
        0 => Err(ConfigError::invalid("below", "a condition needs a bound")),
        _ => Err(ConfigError::invalid("below", "a condition takes exactly one bound")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::stats::Operation;

    /// 100 gets of 1..=100 us, every tenth one failed, over two seconds.
    fn statistics() -> Statistics {
        let mut stats = Statistics::new();
        stats.begin_ms = Some(0);
        stats.end_ms = Some(2_000);
        for us in 1..=100u64 {
            stats.record(Operation::GET, Duration::from_micros(us), us % 10 != 0);
        }
        stats
    }

    fn mean(below: Option<f64>, over: Option<f64>) -> PerformanceCondition {
        PerformanceCondition::Mean {
            on: "Get".into(),
            below,
            over,
        }
    }

    #[test]
    fn mean_bounds() {
        let stats = statistics();
        assert_eq!(mean(Some(60.0), None).evaluate(&stats), Ok(()));
        assert_eq!(mean(None, Some(40.0)).evaluate(&stats), Ok(()));
        let breach = mean(Some(50.0), None).evaluate(&stats).unwrap_err();
        assert!(matches!(breach, Breach::Unmet { actual, .. } if (actual - 50.5).abs() < 1e-9));
    }

    #[test]
    fn throughput_errors_and_requests() {
        let stats = statistics();
        let gross = PerformanceCondition::ThroughputGross {
            on: "Get".into(),
            below: None,
            over: Some(49.0),
        };
        assert_eq!(gross.evaluate(&stats), Ok(()));
        let net = PerformanceCondition::ThroughputNet {
            on: "Get".into(),
            below: None,
            over: Some(46.0),
        };
        // 90 successful requests in 2 s
        assert!(net.evaluate(&stats).is_err());

        let errors = PerformanceCondition::Errors {
            on: "Get".into(),
            total_below: None,
            total_over: None,
            percent_below: Some(10.0),
            percent_over: None,
        };
        assert!(errors.evaluate(&stats).is_err());
        let requests = PerformanceCondition::Requests {
            on: "Get".into(),
            below: Some(101),
            over: None,
        };
        assert_eq!(requests.evaluate(&stats), Ok(()));
    }

    #[test]
    fn percentile_stays_within_observed_latencies() {
        let stats = statistics();
        let slowest = PerformanceCondition::Percentile {
            on: "Get".into(),
            value: 100.0,
            below: Some(100.001),
            over: None,
        };
        assert_eq!(slowest.evaluate(&stats), Ok(()));
    }

    #[test]
    fn missing_operation_is_a_breach() {
        let breach = PerformanceCondition::Requests {
            on: "Put".into(),
            below: None,
            over: Some(0),
        }
        .evaluate(&statistics());
        assert_eq!(breach, Err(Breach::NoStatistics("Put".into())));
    }

    #[test]
    fn any_and_all_combine() {
        let stats = statistics();
        let any = PerformanceCondition::Any {
            conditions: vec![mean(Some(1.0), None), mean(Some(60.0), None)],
        };
        assert_eq!(any.evaluate(&stats), Ok(()));
        let all = PerformanceCondition::All {
            conditions: vec![mean(Some(1.0), None), mean(Some(60.0), None)],
        };
        assert!(all.evaluate(&stats).is_err());
        let none = PerformanceCondition::Any {
            conditions: vec![mean(Some(1.0), None), mean(Some(2.0), None)],
        };
        assert!(matches!(none.evaluate(&stats), Err(Breach::NoneHolds(b)) if b.len() == 2));
    }

    #[test]
    fn parses_and_validates() {
        let parsed: PerformanceCondition = serde_json::from_str(
            r#"{ "type": "all", "conditions": [
                { "type": "mean", "on": "Get", "below": 500.0 },
                { "type": "throughput-net", "on": "Put", "over": 10.0 },
                { "type": "errors", "on": "Put", "percent_below": 1.0 } ] }"#,
        )
        .unwrap();
        assert!(parsed.validate().is_ok());

        assert!(mean(None, None).validate().is_err());
        assert!(mean(Some(1.0), Some(2.0)).validate().is_err());
        assert!(PerformanceCondition::All { conditions: vec![] }.validate().is_err());
        let percentile = PerformanceCondition::Percentile {
            on: "Get".into(),
            value: 101.0,
            below: Some(1.0),
            over: None,
        };
        assert!(percentile.validate().is_err());
        let typo = r#"{ "type": "mean", "on": "Get", "bellow": 5.0 }"#;
        assert!(serde_json::from_str::<PerformanceCondition>(typo).is_err());
    }
}
