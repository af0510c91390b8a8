//! Worker acknowledgements and their aggregation into a [`StageResult`].
use std::collections::HashSet;
use std::time::Duration;

use fleetbench_macros::message;

use crate::error::StageError;
use crate::monitor::MonitorSample;
use crate::stats::Statistics;

/// Index of a worker in the cluster.
pub type WorkerId = u32;

/// Longest cause chain kept in an [`ErrorReport`].
pub const MAX_CAUSE_DEPTH: usize = 16;

/// Aggregated outcome of a stage. Ordered by severity.
#[message]
#[derive(Copy, Eq, PartialOrd, Ord, Hash)]
pub enum StageResult {
    Success,
    Fail,
    Exception,
}

impl StageResult {
    /// Worst of the two.
    pub fn merge(self, other: StageResult) -> StageResult {
        self.max(other)
    }

    pub fn is_success(self) -> bool {
        self == StageResult::Success
    }
}

impl std::fmt::Display for StageResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
            Self::Exception => "EXCEPTION",
        })
    }
}

/// Whether an error is an expected negative outcome or a crash.
#[message]
#[derive(Copy, Eq)]
pub enum ErrorClass {
    Failure,
    Exception,
}

/// Serializable summary of an error and its causes.
#[message]
pub struct ErrorReport {
    pub class: ErrorClass,
    pub message: String,
    pub causes: Vec<String>,
    /// Set when the cause chain was cut, either by [`MAX_CAUSE_DEPTH`] or
    /// because it looped back on itself.
    pub truncated: bool,
}

impl ErrorReport {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Failure,
            message: message.into(),
            causes: Vec::new(),
            truncated: false,
        }
    }

    /// Walks the `source()` chain of `error`. Stops at [`MAX_CAUSE_DEPTH`] or
    /// at the first error already seen, so a cyclic chain still terminates.
    pub fn summarize(class: ErrorClass, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut visited: HashSet<*const ()> = HashSet::new();
        visited.insert(error_identity(error));
        let mut causes = Vec::new();
        let mut truncated = false;
        let mut current = error.source();
        while let Some(cause) = current {
            if causes.len() >= MAX_CAUSE_DEPTH || !visited.insert(error_identity(cause)) {
                truncated = true;
                break;
            }
            causes.push(cause.to_string());
            current = cause.source();
        }
        Self {
            class,
            message: error.to_string(),
            causes,
            truncated,
        }
    }
}

fn error_identity(error: &(dyn std::error::Error + 'static)) -> *const () {
    error as *const dyn std::error::Error as *const ()
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.causes {
            write!(f, "; caused by: {cause}")?;
        }
        if self.truncated {
            write!(f, "; ...")?;
        }
        Ok(())
    }
}

impl From<&StageError> for ErrorReport {
    fn from(error: &StageError) -> Self {
        match error {
            StageError::Failed(message) => ErrorReport::failure(message.clone()),
            StageError::Unexpected { .. } => ErrorReport::summarize(ErrorClass::Exception, error),
        }
    }
}

/// Typed data a worker attaches to its acknowledgement.
#[message]
pub enum AckPayload {
    /// Merged statistics of one test stage on one worker.
    Statistics {
        test_name: String,
        statistics: Statistics,
    },
    /// Outcome of a data validation pass.
    Check {
        checked: u64,
        missing: u64,
        invalid: u64,
    },
    /// Samples taken by a monitor between its start and stop stages.
    Timeline { samples: Vec<MonitorSample> },
    /// Background tasks the cleanup found still running.
    Cleanup { leftovers: u32 },
}

/// Outcome of one stage on one worker.
#[message]
pub struct DistStageAck {
    pub worker: WorkerId,
    pub success: bool,
    pub error: Option<ErrorReport>,
    pub payload: Option<AckPayload>,
    /// Time the worker spent in the stage.
    pub duration: Duration,
}

impl DistStageAck {
    pub fn success(worker: WorkerId) -> Self {
        Self {
            worker,
            success: true,
            error: None,
            payload: None,
            duration: Duration::ZERO,
        }
    }

    pub fn failure(worker: WorkerId, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(ErrorReport::failure(message)),
            ..Self::success(worker)
        }
    }

    pub fn from_error(worker: WorkerId, error: &StageError) -> Self {
        Self {
            success: false,
            error: Some(ErrorReport::from(error)),
            ..Self::success(worker)
        }
    }

    /// Stand-in ack for a worker that did not answer.
    pub fn unresponsive(worker: WorkerId, reason: impl std::fmt::Display) -> Self {
        Self::failure(worker, format!("worker {worker} did not respond: {reason}"))
    }

    pub fn with_payload(mut self, payload: AckPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn result(&self) -> StageResult {
        match (&self.error, self.success) {
            (_, true) => StageResult::Success,
            (Some(ErrorReport { class: ErrorClass::Exception, .. }), false) => StageResult::Exception,
            _ => StageResult::Fail,
        }
    }

    pub fn statistics(&self) -> Option<(&str, &Statistics)> {
        match &self.payload {
            Some(AckPayload::Statistics {
                test_name,
                statistics,
            }) => Some((test_name, statistics)),
            _ => None,
        }
    }
}

/// Worst-wins fold of the acks; no acks at all is a success.
pub fn merge_results<'a>(acks: impl IntoIterator<Item = &'a DistStageAck>) -> StageResult {
    acks.into_iter()
        .map(DistStageAck::result)
        .fold(StageResult::Success, StageResult::merge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, OnceLock};

    #[derive(Debug)]
    struct Looping {
        name: &'static str,
        next: OnceLock<Arc<Looping>>,
    }

    impl std::fmt::Display for Looping {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.name)
        }
    }

    impl std::error::Error for Looping {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            self.next
                .get()
                .map(|next| next.as_ref() as &(dyn std::error::Error + 'static))
        }
    }

    fn looping(name: &'static str) -> Arc<Looping> {
        Arc::new(Looping {
            name,
            next: OnceLock::new(),
        })
    }

    #[test]
    fn cyclic_cause_chain_terminates() {
        let a = looping("A");
        let b = looping("B");
        a.next.set(b.clone()).unwrap();
        b.next.set(a.clone()).unwrap();

        let report = ErrorReport::summarize(ErrorClass::Exception, a.as_ref());
        assert_eq!(report.message, "A");
        assert_eq!(report.causes, vec!["B".to_owned()]);
        assert!(report.truncated);
        assert_eq!(report.to_string(), "A; caused by: B; ...");
    }

    #[test]
    fn self_cause_terminates() {
        let a = looping("A");
        a.next.set(a.clone()).unwrap();
        let report = ErrorReport::summarize(ErrorClass::Failure, a.as_ref());
        assert!(report.causes.is_empty());
        assert!(report.truncated);
    }

    #[test]
    fn long_chain_is_capped() {
        let chain: Vec<Arc<Looping>> = (0..40).map(|_| looping("link")).collect();
        for pair in chain.windows(2) {
            pair[0].next.set(pair[1].clone()).unwrap();
        }
        let report = ErrorReport::summarize(ErrorClass::Exception, chain[0].as_ref());
        assert_eq!(report.causes.len(), MAX_CAUSE_DEPTH);
        assert!(report.truncated);
    }

    #[test]
    fn worst_result_wins() {
        let ok = DistStageAck::success(0);
        let failed = DistStageAck::failure(1, "missing entries");
        let crashed = DistStageAck::from_error(
            2,
            &StageError::unexpected("stressor crashed", std::fmt::Error),
        );
        assert_eq!(merge_results([&ok, &ok]), StageResult::Success);
        assert_eq!(merge_results([&ok, &failed]), StageResult::Fail);
        assert_eq!(merge_results([&failed, &crashed, &ok]), StageResult::Exception);
        assert_eq!(merge_results([&crashed, &failed]), StageResult::Exception);
        assert_eq!(merge_results(&Vec::<DistStageAck>::new()), StageResult::Success);
    }

    #[test]
    fn unexpected_error_keeps_its_cause() {
        let ack = DistStageAck::from_error(
            3,
            &StageError::unexpected("stressor crashed", std::fmt::Error),
        );
        let error = ack.error.as_ref().unwrap();
        assert_eq!(error.class, ErrorClass::Exception);
        assert_eq!(error.causes.len(), 1);
        assert!(!error.truncated);
    }

    #[test]
    fn unresponsive_worker_is_a_failure() {
        let ack = DistStageAck::unresponsive(4, "timed out after 5s");
        assert_eq!(ack.result(), StageResult::Fail);
        assert!(ack.error.unwrap().message.contains("worker 4"));
    }
}
