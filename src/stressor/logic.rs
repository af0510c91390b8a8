use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use thiserror::Error;

use crate::capability::{BasicOperations, Transaction, Transactional};
use crate::error::CapabilityError;
use crate::key_selector::{KeySelector, ThreadIndex};
use crate::stats::{Operation, Statistics};

/// What a stress thread does on every iteration.
///
/// One instance per thread, so implementations may keep state without
/// synchronization. Any closure `FnMut(&mut StressContext) -> Result<Step, RequestError>`
/// is an `OperationLogic` too.
pub trait OperationLogic: Send {
    fn run(&mut self, ctx: &mut StressContext) -> Result<Step, RequestError>;
}

impl<F> OperationLogic for F
where
    F: FnMut(&mut StressContext) -> Result<Step, RequestError> + Send,
{
    fn run(&mut self, ctx: &mut StressContext) -> Result<Step, RequestError> {
        self(ctx)
    }
}

/// Whether the logic wants more iterations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// The logic has no more work; the thread stops even if the stage
    /// duration or operation count is not exhausted.
    Finished,
}

/// A request issued through [`StressContext::request`] failed. The sample is
/// already recorded as failed when this is returned.
#[derive(Debug, Error)]
#[error("{operation} failed: {source}")]
pub struct RequestError {
    pub operation: Operation,
    #[source]
    pub source: CapabilityError,
}

impl RequestError {
    /// Expected failures are part of the measurement; anything else aborts
    /// the thread.
    pub fn is_expected(&self) -> bool {
        matches!(self.source, CapabilityError::Request(_))
    }
}

/// Key for a key index, shared by every logic so loaders and checkers agree.
pub fn key_for(index: u64) -> String {
    format!("key_{index:010}")
}

/// Thread-local state handed to [`OperationLogic::run`].
pub struct StressContext {
    thread: ThreadIndex,
    key_selector: Box<dyn KeySelector>,
    rng: StdRng,
    statistics: Statistics,
    operations: Arc<dyn BasicOperations>,
    transactions: Option<TransactionScope>,
}

impl StressContext {
    pub fn new(
        thread: ThreadIndex,
        key_selector: Box<dyn KeySelector>,
        rng: StdRng,
        operations: Arc<dyn BasicOperations>,
    ) -> Self {
        Self {
            thread,
            key_selector,
            rng,
            statistics: Statistics::new(),
            operations,
            transactions: None,
        }
    }

    /// Groups every `size` requests into one transaction.
    pub fn with_transactions(mut self, transactional: Arc<dyn Transactional>, size: usize) -> Self {
        self.transactions = Some(TransactionScope {
            transactional,
            size: size.max(1),
            open: None,
        });
        self
    }

    pub fn thread(&self) -> ThreadIndex {
        self.thread
    }

    pub fn next_key_index(&mut self) -> u64 {
        self.key_selector.next_key_index()
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Times `call` and records it under `operation`.
    ///
    /// Inside a transaction the sample is held back until the transaction
    /// ends: a commit records it as it happened, a rollback records it as
    /// failed.
    pub fn request<T>(
        &mut self,
        operation: Operation,
        call: impl FnOnce(&dyn BasicOperations) -> Result<T, CapabilityError>,
    ) -> Result<T, RequestError> {
        let Some(scope) = self.transactions.as_mut() else {
            let start = Instant::now();
            let outcome = call(self.operations.as_ref());
            self.statistics
                .record(operation, start.elapsed(), outcome.is_ok());
            return outcome.map_err(|source| RequestError { operation, source });
        };

        let start = Instant::now();
        let open = match scope.open_or_begin() {
            Ok(open) => open,
            Err(source) => {
                self.statistics.record(operation, start.elapsed(), false);
                return Err(RequestError { operation, source });
            }
        };
        let ops = open.operations.clone();
        let start = Instant::now();
        let outcome = call(ops.as_ref());
        open.pending.push((operation, start.elapsed(), outcome.is_ok()));
        open.remaining = open.remaining.saturating_sub(1);

        match outcome {
            Ok(value) => {
                if open.remaining == 0 {
                    self.end_transaction()?;
                }
                Ok(value)
            }
            Err(source) => {
                self.rollback_transaction();
                Err(RequestError { operation, source })
            }
        }
    }

    /// Commits an open transaction. On commit failure the transaction is
    /// rolled back and all its requests count as failed.
    pub fn end_transaction(&mut self) -> Result<(), RequestError> {
        let Some(open) = self.transactions.as_mut().and_then(|s| s.open.take()) else {
            return Ok(());
        };
        let start = Instant::now();
        match open.transaction.commit() {
            Ok(()) => {
                for (operation, elapsed, ok) in open.pending {
                    self.statistics.record(operation, elapsed, ok);
                }
                self.statistics
                    .record(Operation::TX_COMMIT, start.elapsed(), true);
                Ok(())
            }
            Err(source) => {
                tracing::debug!("Thread {} commit failed: {source}", self.thread.global);
                self.statistics
                    .record(Operation::TX_COMMIT, start.elapsed(), false);
                record_failed(&mut self.statistics, open.pending);
                Err(RequestError {
                    operation: Operation::TX_COMMIT,
                    source,
                })
            }
        }
    }

    fn rollback_transaction(&mut self) {
        let Some(open) = self.transactions.as_mut().and_then(|s| s.open.take()) else {
            return;
        };
        let start = Instant::now();
        let rolled_back = open.transaction.rollback();
        if let Err(e) = &rolled_back {
            tracing::warn!("Thread {} rollback failed: {e}", self.thread.global);
        }
        self.statistics
            .record(Operation::TX_ROLLBACK, start.elapsed(), rolled_back.is_ok());
        record_failed(&mut self.statistics, open.pending);
    }

    /// Closes any open transaction and stamps the end of the measurement.
    pub(crate) fn finish(mut self) -> Statistics {
        if let Err(e) = self.end_transaction() {
            tracing::debug!("Final commit on thread {} failed: {e}", self.thread.global);
        }
        self.statistics.end();
        self.statistics
    }

    pub(crate) fn begin(&mut self) {
        self.statistics.begin();
    }
}

fn record_failed(statistics: &mut Statistics, pending: Vec<(Operation, Duration, bool)>) {
    for (operation, elapsed, _) in pending {
        statistics.record(operation, elapsed, false);
    }
}

struct TransactionScope {
    transactional: Arc<dyn Transactional>,
    size: usize,
    open: Option<OpenTransaction>,
}

impl TransactionScope {
    fn open_or_begin(&mut self) -> Result<&mut OpenTransaction, CapabilityError> {
        let open = match self.open.take() {
            Some(open) => open,
            None => {
                let transaction = self.transactional.begin()?;
                OpenTransaction {
                    operations: transaction.operations(),
                    transaction,
                    remaining: self.size,
                    pending: Vec::with_capacity(self.size),
                }
            }
        };
        Ok(self.open.insert(open))
    }
}

struct OpenTransaction {
    transaction: Box<dyn Transaction>,
    operations: Arc<dyn BasicOperations>,
    remaining: usize,
    pending: Vec<(Operation, Duration, bool)>,
}
