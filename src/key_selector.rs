//! Key access patterns used by stress threads.
//!
//! Every stress thread builds its own [`KeySelector`] from the stage's
//! [`KeySelectorConfig`], so selectors are never shared and need no locking.
//! The random source is seeded from the run seed and the thread's global
//! index: rerunning with the same seed reproduces each thread's key sequence.
use std::str::FromStr;

use fleetbench_macros::message;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::error::ConfigError;
use crate::range::Range;

/// Position of a stress thread, within its worker and across the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadIndex {
    /// Index among all stress threads of all workers running the stage.
    pub global: u64,
    /// Index among the stress threads of this worker.
    pub local: u64,
}

/// Yields key indices in `[0, N)`.
pub trait KeySelector: Send {
    fn next_key_index(&mut self) -> u64;
}

/// Named key selection policy as it appears in stage configuration.
#[message]
#[derive(Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KeySelectorConfig {
    /// Uniform over the whole key space; threads collide on the same keys.
    #[default]
    Colliding,
    /// Each thread owns a disjoint slice of the key space.
    Concurrent,
    /// Normal distribution around `center` (default: middle of the key space)
    /// with `std_dev` (default: a tenth of the key space).
    Gaussian {
        #[serde(default)]
        center: Option<u64>,
        #[serde(default)]
        std_dev: Option<f64>,
    },
}

impl FromStr for KeySelectorConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "colliding" => Ok(Self::Colliding),
            "concurrent" => Ok(Self::Concurrent),
            "gaussian" => Ok(Self::Gaussian {
                center: None,
                std_dev: None,
            }),
            _ => Err(ConfigError::UnknownKeySelector(s.to_owned())),
        }
    }
}

impl KeySelectorConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Colliding => "colliding",
            Self::Concurrent => "concurrent",
            Self::Gaussian { .. } => "gaussian",
        }
    }

    /// Checks the policy against the key space and the number of threads
    /// that will share it. Called on the controller before dispatch.
    pub fn validate(&self, num_entries: u64, total_threads: u64) -> Result<(), ConfigError> {
        if num_entries == 0 {
            return Err(ConfigError::invalid("num_entries", "key space is empty"));
        }
        match self {
            Self::Colliding => Ok(()),
            Self::Concurrent if num_entries < total_threads => Err(ConfigError::invalid(
                "num_entries",
                format!("{num_entries} keys cannot be split among {total_threads} threads"),
            )),
            Self::Concurrent => Ok(()),
            Self::Gaussian { center, std_dev } => {
                let (center, std_dev) = gaussian_params(*center, *std_dev, num_entries);
                if center >= num_entries {
                    return Err(ConfigError::invalid(
                        "center",
                        format!("{center} is outside the key space of {num_entries}"),
                    ));
                }
                Normal::new(center as f64, std_dev)
                    .map(|_| ())
                    .map_err(|e| ConfigError::invalid("std_dev", e.to_string()))
            }
        }
    }

    pub fn build(
        &self,
        num_entries: u64,
        total_threads: u64,
        thread: ThreadIndex,
        seed: u64,
    ) -> Result<Box<dyn KeySelector>, ConfigError> {
        self.validate(num_entries, total_threads)?;
        let rng = thread_rng(seed, thread);
        Ok(match self {
            Self::Colliding => Box::new(CollidingKeySelector::new(rng, num_entries)),
            Self::Concurrent => Box::new(ConcurrentKeySelector::new(
                rng,
                Range::divide_range(num_entries, total_threads, thread.global),
            )),
            Self::Gaussian { center, std_dev } => {
                let (center, std_dev) = gaussian_params(*center, *std_dev, num_entries);
                let normal = Normal::new(center as f64, std_dev)
                    .map_err(|e| ConfigError::invalid("std_dev", e.to_string()))?;
                Box::new(GaussianKeySelector::new(rng, normal, num_entries))
            }
        })
    }
}

fn gaussian_params(center: Option<u64>, std_dev: Option<f64>, num_entries: u64) -> (u64, f64) {
    (
        center.unwrap_or(num_entries / 2),
        std_dev.unwrap_or((num_entries as f64 / 10.0).max(1.0)),
    )
}

fn thread_rng(seed: u64, thread: ThreadIndex) -> StdRng {
    StdRng::seed_from_u64(seed ^ thread.global.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

pub struct CollidingKeySelector {
    rng: StdRng,
    num_entries: u64,
}

impl CollidingKeySelector {
    pub fn new(rng: StdRng, num_entries: u64) -> Self {
        Self { rng, num_entries }
    }
}

impl KeySelector for CollidingKeySelector {
    fn next_key_index(&mut self) -> u64 {
        self.rng.random_range(0..self.num_entries)
    }
}

pub struct ConcurrentKeySelector {
    rng: StdRng,
    range: Range,
}

impl ConcurrentKeySelector {
    pub fn new(rng: StdRng, range: Range) -> Self {
        debug_assert!(!range.is_empty());
        Self { rng, range }
    }

    pub fn range(&self) -> Range {
        self.range
    }
}

impl KeySelector for ConcurrentKeySelector {
    fn next_key_index(&mut self) -> u64 {
        self.rng.random_range(self.range.iter())
    }
}

/// Retries before a far-off sample gets clamped into the key space.
const GAUSSIAN_RETRIES: usize = 16;

pub struct GaussianKeySelector {
    rng: StdRng,
    normal: Normal<f64>,
    num_entries: u64,
}

impl GaussianKeySelector {
    pub fn new(rng: StdRng, normal: Normal<f64>, num_entries: u64) -> Self {
        Self {
            rng,
            normal,
            num_entries,
        }
    }
}

impl KeySelector for GaussianKeySelector {
    fn next_key_index(&mut self) -> u64 {
        let max = (self.num_entries - 1) as f64;
        let mut sample = self.normal.sample(&mut self.rng).round();
        for _ in 0..GAUSSIAN_RETRIES {
            if (0.0..=max).contains(&sample) {
                break;
            }
            sample = self.normal.sample(&mut self.rng).round();
        }
        sample.clamp(0.0, max) as u64
    }
}
