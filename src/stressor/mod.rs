//! The multi-threaded load generator run inside a worker.
//!
//! A [`Stressor`] runs a fixed number of OS threads. Each thread owns an
//! [`OperationLogic`], a [`KeySelector`](crate::key_selector::KeySelector)
//! and a [`Statistics`] accumulator, and calls the logic in a tight loop
//! until its share of the work is done. Nothing on the hot path is shared
//! except the capability under test, which is called concurrently and
//! without any locking on our side.
//!
//! # High-level flow
//! 1. Validate the configuration and build one key selector per thread,
//!    seeded with the run seed and the thread's global index.
//! 2. Spawn the threads (scoped, so logics may borrow from the caller).
//! 3. Each thread repeatedly:
//!    - checks the [`StopSignal`] and its [`Completion`] limit,
//!    - calls [`OperationLogic::run`], which issues timed requests through
//!      [`StressContext::request`],
//!    - handles request failures (record and go on, or stop every thread
//!      when `exit_on_failure` is set).
//! 4. Threads are joined and their statistics merged into one per worker.
//!
//! # Work partitioning
//! With [`Completion::Operations`] the total is split between the threads
//! with [`Range::divide_range`]: every thread gets `total / threads`
//! iterations and the first `total % threads` threads one more.
//!
//! # Cancellation
//! Raising the [`StopSignal`] stops every thread before its next iteration,
//! so the stressor returns within one in-flight request. The samples
//! recorded so far are kept and returned.
//!
//! # Failures
//! - Expected request failures ([`CapabilityError::Request`](crate::error::CapabilityError::Request))
//!   are recorded as failed samples.
//! - Unexpected failures end the thread that hit them; other threads go on.
//! - A panicking thread loses its own samples; the rest are still merged.
pub mod logic;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;
use typed_builder::TypedBuilder;

pub use logic::{OperationLogic, RequestError, Step, StressContext, key_for};

use crate::capability::{BasicOperations, Transactional};
use crate::error::ConfigError;
use crate::key_selector::{KeySelectorConfig, ThreadIndex};
use crate::range::Range;
use crate::stats::Statistics;
use internals::*;

/// Shared flag asking every stress thread to stop.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// When a stress thread is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Wall-clock duration, measured from the moment the threads start.
    Duration(Duration),
    /// Total number of iterations across all threads of this worker.
    Operations(u64),
    /// Until the logic returns [`Step::Finished`]. The logic must finish on
    /// its own.
    UntilFinished,
}

/// Capabilities the stress threads call into.
#[derive(Clone)]
pub struct StressEnv {
    pub operations: Arc<dyn BasicOperations>,
    pub transactional: Option<Arc<dyn Transactional>>,
}

/// Why a stress thread ended early.
#[derive(Debug, Error)]
pub enum StressError {
    #[error("stress thread {thread} stopped all threads after a failed request: {source}")]
    ExitOnFailure {
        thread: u64,
        #[source]
        source: RequestError,
    },
    #[error("stress thread {thread} aborted: {source}")]
    Unexpected {
        thread: u64,
        #[source]
        source: RequestError,
    },
    #[error("stress thread {0} panicked")]
    Panicked(u64),
    #[error("cannot spawn stress thread {thread}: {source}")]
    Spawn {
        thread: u64,
        #[source]
        source: std::io::Error,
    },
}

impl StressError {
    /// Whether the error is an expected outcome of the test rather than a
    /// crash.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::ExitOnFailure { .. })
    }
}

/// Result of a stressor run.
#[derive(Debug)]
pub struct StressOutcome {
    /// Merged statistics of all threads that did not panic.
    pub statistics: Statistics,
    pub errors: Vec<StressError>,
    /// The stop signal was raised while the threads were running.
    pub interrupted: bool,
}

/// Multi-threaded load generator.
///
/// ```rust,ignore
/// let outcome = Stressor::builder()
///     .threads(8)
///     .completion(Completion::Duration(Duration::from_secs(30)))
///     .key_selector(KeySelectorConfig::Colliding)
///     .num_entries(10_000)
///     .build()
///     .run(&env, |_thread| my_logic())?;
/// ```
#[derive(TypedBuilder)]
pub struct Stressor {
    /// Stress threads on this worker.
    #[builder(default = num_cpus::get())]
    pub threads: usize,
    pub completion: Completion,
    /// Global index of this worker's first thread.
    #[builder(default)]
    pub thread_offset: u64,
    /// Stress threads across all workers; defaults to `threads`.
    #[builder(default, setter(strip_option))]
    pub total_threads: Option<u64>,
    #[builder(default)]
    pub key_selector: KeySelectorConfig,
    /// Size of the key space.
    pub num_entries: u64,
    /// Requests per transaction; `None` runs without transactions.
    #[builder(default)]
    pub transaction_size: Option<usize>,
    /// Stop every thread on the first failed request.
    #[builder(default)]
    pub exit_on_failure: bool,
    #[builder(default = rand::random())]
    pub seed: u64,
    #[builder(default)]
    pub stop: StopSignal,
}

impl Stressor {
    /// Runs the threads to completion. `new_logic` is called once per thread,
    /// on that thread.
    pub fn run<F, L>(&self, env: &StressEnv, new_logic: F) -> Result<StressOutcome, ConfigError>
    where
        F: Fn(ThreadIndex) -> L + Sync,
        L: OperationLogic,
    {
        if self.threads == 0 {
            return Err(ConfigError::invalid("threads", "at least one thread is needed"));
        }
        let total_threads = self.total_threads.unwrap_or(self.threads as u64);
        if self.thread_offset + self.threads as u64 > total_threads {
            return Err(ConfigError::invalid(
                "total_threads",
                format!(
                    "threads {}..{} exceed the {total_threads} threads of the run",
                    self.thread_offset,
                    self.thread_offset + self.threads as u64
                ),
            ));
        }
        let transactional = match (self.transaction_size, &env.transactional) {
            (Some(size), Some(transactional)) => Some((transactional.clone(), size)),
            (Some(_), None) => {
                return Err(ConfigError::invalid(
                    "transaction_size",
                    "the service does not support transactions",
                ));
            }
            (None, _) => None,
        };

        let mut contexts = Vec::with_capacity(self.threads);
        for local in 0..self.threads as u64 {
            let thread = ThreadIndex {
                global: self.thread_offset + local,
                local,
            };
            let selector =
                self.key_selector
                    .build(self.num_entries, total_threads, thread, self.seed)?;
            let rng = StdRng::seed_from_u64(self.seed.rotate_left(17) ^ thread.global);
            let mut ctx = StressContext::new(thread, selector, rng, env.operations.clone());
            if let Some((transactional, size)) = &transactional {
                ctx = ctx.with_transactions(transactional.clone(), *size);
            }
            contexts.push(ctx);
        }

        tracing::info!(
            "Spawning {} stress threads ({} key selection, {:?})...",
            self.threads,
            self.key_selector.name(),
            self.completion
        );
        let new_logic = &new_logic;
        let results: Vec<(Statistics, Option<StressError>)> = thread::scope(|scope| {
            let handles: Vec<_> = contexts
                .into_iter()
                .map(|ctx| {
                    let thread = ctx.thread();
                    let limit = self.limit_for(thread.local);
                    let stop = self.stop.clone();
                    let exit_on_failure = self.exit_on_failure;
                    let handle = thread::Builder::new()
                        .name(format!("stressor-{}", thread.local))
                        .spawn_scoped(scope, move || {
                            stress_thread(ctx, new_logic(thread), limit, &stop, exit_on_failure)
                        });
                    (thread, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(thread, handle)| match handle {
                    Ok(handle) => handle.join().unwrap_or_else(|_| {
                        tracing::error!("Stress thread {} panicked", thread.global);
                        // its samples are gone, keep everybody else's
                        (Statistics::new(), Some(StressError::Panicked(thread.global)))
                    }),
                    Err(source) => (
                        Statistics::new(),
                        Some(StressError::Spawn {
                            thread: thread.global,
                            source,
                        }),
                    ),
                })
                .collect()
        });

        tracing::info!("Stress threads finished, merging statistics...");
        let mut statistics = Statistics::new();
        let mut errors = Vec::new();
        for (thread_stats, error) in results {
            statistics.merge(&thread_stats);
            errors.extend(error);
        }
        Ok(StressOutcome {
            statistics,
            errors,
            interrupted: self.stop.is_raised(),
        })
    }

    fn limit_for(&self, local: u64) -> ThreadLimit {
        match self.completion {
            Completion::Duration(duration) => ThreadLimit::Duration(duration),
            Completion::Operations(total) => ThreadLimit::Iterations(
                Range::divide_range(total, self.threads as u64, local).size(),
            ),
            Completion::UntilFinished => ThreadLimit::Unbounded,
        }
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Per-thread loop, exposed with the `internals` feature for embedding the
/// stress loop in custom drivers.
mod internals {
    use std::time::Instant;

    use super::*;

    /// Termination condition of a single thread.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ThreadLimit {
        Duration(Duration),
        Iterations(u64),
        Unbounded,
    }

    /// Drives `logic` until the limit, the stop signal, the logic itself or
    /// an error ends the thread. Returns everything recorded so far.
    pub fn stress_thread<L: OperationLogic>(
        mut ctx: StressContext,
        mut logic: L,
        limit: ThreadLimit,
        stop: &StopSignal,
        exit_on_failure: bool,
    ) -> (Statistics, Option<StressError>) {
        let thread = ctx.thread();
        tracing::debug!("Stress thread {} started.", thread.global);
        ctx.begin();
        let started = Instant::now();
        let mut iterations = 0u64;
        let mut error = None;

        while !stop.is_raised() {
            let more = match limit {
                ThreadLimit::Duration(duration) => started.elapsed() < duration,
                ThreadLimit::Iterations(max) => iterations < max,
                ThreadLimit::Unbounded => true,
            };
            if !more {
                break;
            }
            match logic.run(&mut ctx) {
                Ok(Step::Continue) => {}
                Ok(Step::Finished) => break,
                Err(e) if e.is_expected() => {
                    if exit_on_failure {
                        tracing::warn!("Stress thread {} stopping all threads: {e}", thread.global);
                        stop.raise();
                        error = Some(StressError::ExitOnFailure {
                            thread: thread.global,
                            source: e,
                        });
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Stress thread {} aborted: {e}", thread.global);
                    error = Some(StressError::Unexpected {
                        thread: thread.global,
                        source: e,
                    });
                    break;
                }
            }
            iterations += 1;
        }

        tracing::debug!(
            "Stress thread {} shutting down after {iterations} iterations.",
            thread.global
        );
        (ctx.finish(), error)
    }
}
