//! Fleetbench: a distributed benchmark harness.
//!
//! A controller ("main") drives a fleet of workers through an ordered list of
//! benchmark stages. Workers run each stage against the service under test,
//! usually by spinning up a multi-threaded [`Stressor`], and answer with an
//! acknowledgement carrying their outcome and latency statistics. The
//! controller folds the acks into a pass/fail verdict, merges the statistics,
//! and decides whether the benchmark goes on.
//!
//! # Architecture
//!
//! - [`Master`]: sequences benchmarks and stages, fans stages out to workers,
//!   waits for their acks with a timeout, and applies the continuation policy.
//! - [`Worker`]: decodes stage messages and runs them against the capabilities
//!   registered for the service under test.
//! - [`Transport`]: moves serialized stages and acks between the two. The
//!   in-process [`LocalTransport`] is included; network transports plug in
//!   behind the same trait.
//! - [`stage`]: the stage variants and the [`DistStage`] / [`MainStage`] hooks.
//! - [`Stressor`]: OS-thread load generator with pluggable [`OperationLogic`]
//!   and [`key_selector`] policies.
//! - [`stats`]: mergeable latency statistics, their summaries, and the
//!   performance conditions a stress test can be held to.
//! - [`monitor`]: gauges of the service sampled in the background between
//!   a `MonitorStart` and a `MonitorStop` stage.
//! - [`capability`]: the traits a service adapter implements, and the
//!   registry stages resolve them from.
//! - [`Reporter`]: sink for the aggregated statistics.
//!
//! # Example
//! ```rust,ignore
//! let mut registry = TraitRegistry::new();
//! Arc::new(InMemoryCache::new()).register(&mut registry);
//! let transport = LocalTransport::new([Worker::new(0, 1, registry)]);
//!
//! let benchmark = Benchmark::new("smoke")
//!     .stage(StageKind::ServiceStart(ServiceStart {}))
//!     .stage(StageKind::Load(Load::new(10_000)))
//!     .stage(StageKind::Report(Report::default()));
//!
//! let report = Master::new(MasterConfig::default(), transport, Arc::new(StdoutReporter))
//!     .benchmark(benchmark)
//!     .run()
//!     .await?;
//! ```
//!
//! # Feature flags
//! - `builtins` (default): the in-memory reference cache and the stdout and
//!   memory reporters.
//! - `internals`: exposes the per-thread stress loop for custom drivers.

/// Worker acknowledgements and stage results
pub mod ack;
/// Capability traits and their registry
pub mod capability;
/// Controller and worker run state
pub mod context;
pub mod error;
/// Key access policies
pub mod key_selector;
/// The controller
pub mod master;
/// Background sampling of the service
pub mod monitor;
pub mod range;
/// Aggregated results and their sinks
pub mod report;
/// Reference service adapters
pub mod service;
pub mod stage;
/// Latency statistics
pub mod stats;
/// Multi-threaded load generation
pub mod stressor;
pub mod transport;
pub mod worker;

pub use ack::{DistStageAck, StageResult, WorkerId};
pub use capability::{Dependency, TraitRegistry};
pub use error::{CapabilityError, ConfigError, MasterError, StageError, TransportError};
pub use master::{Benchmark, Master, MasterConfig};
pub use range::Range;
pub use report::{Reporter, RunReport};
pub use stage::{DistStage, MainStage, StageDefinition, StageKind};
pub use stats::{Operation, PerformanceCondition, Statistics};
pub use stressor::{OperationLogic, StopSignal, Stressor};
pub use transport::{LocalTransport, Transport};
pub use worker::Worker;

#[cfg(feature = "builtins")]
pub use report::{MemoryReporter, StdoutReporter};
#[cfg(feature = "builtins")]
pub use service::InMemoryCache;

/// Attribute macros deriving the wire traits
pub mod macros {
    pub use fleetbench_macros::*;
}
