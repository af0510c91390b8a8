//! Periodic sampling of the service on a background thread.
//!
//! A [`Monitor`] outlives the stage that started it: the worker keeps it in
//! its [`WorkerState`](crate::context::WorkerState) until a later stage stops
//! it and ships the collected timeline to main.
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fleetbench_macros::message;

use crate::WorkerId;
use crate::capability::Sampler;
use crate::stressor::StopSignal;

/// Gauges read at one point of a monitored window.
#[message]
pub struct MonitorSample {
    /// Milliseconds since the monitor started.
    pub elapsed_ms: u64,
    pub values: BTreeMap<String, f64>,
}

/// A running sampling thread.
pub struct Monitor {
    stop: StopSignal,
    thread: JoinHandle<Vec<MonitorSample>>,
}

impl Monitor {
    /// Samples `sampler` right away and then every `interval`.
    pub fn start(worker: WorkerId, sampler: Arc<dyn Sampler>, interval: Duration) -> io::Result<Self> {
        let stop = StopSignal::new();
        let thread = thread::Builder::new()
            .name(format!("monitor-{worker}"))
            .spawn({
                let stop = stop.clone();
                move || sample_loop(sampler.as_ref(), interval, &stop)
            })?;
        tracing::debug!("Worker {worker} monitoring every {interval:?}");
        Ok(Self { stop, thread })
    }

    /// Stops sampling and returns the timeline, `None` if the sampling
    /// thread panicked.
    pub fn stop(self) -> Option<Vec<MonitorSample>> {
        self.stop.raise();
        self.thread.thread().unpark();
        self.thread.join().ok()
    }
}

fn sample_loop(sampler: &dyn Sampler, interval: Duration, stop: &StopSignal) -> Vec<MonitorSample> {
    let started = Instant::now();
    let mut timeline = Vec::new();
    while !stop.is_raised() {
        match sampler.sample() {
            Ok(values) => timeline.push(MonitorSample {
                elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                values,
            }),
            Err(e) => tracing::warn!("Sampling failed: {e}"),
        }
        let deadline = Instant::now() + interval;
        // park_timeout may return early, spuriously or on unpark
        while !stop.is_raised() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }
    timeline
}
