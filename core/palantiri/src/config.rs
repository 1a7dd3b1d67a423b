//! Configuration of the sampling engine.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings of a [`SamplingEngine`](crate::SamplingEngine).
///
/// Durations are written in a human-friendly format in the config files, like `"500ms"` or `"1m"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Time to wait between two sampling ticks.
    #[serde(with = "humantime_serde")]
    pub sample_period: Duration,

    /// Time to wait between two refreshes of the counter resources.
    #[serde(with = "humantime_serde")]
    pub recreation_period: Duration,

    /// Maximum number of counters that are read at the same time by the sampling loop.
    /// The recreation loop has its own limit, with the same value. Defaults to the number of CPUs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel_reads: Option<usize>,

    /// What to do when a counter is added with an alias that is already used.
    pub duplicate_aliases: DuplicateAliasPolicy,

    /// Divisor applied to the values of the counters that are marked as `normalize`.
    /// Defaults to the number of CPUs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization_divisor: Option<f64>,

    /// Number of worker threads of the async runtime created by the engine.
    /// Ignored when the engine is given an existing runtime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_threads: Option<usize>,
}

/// Policy for counters whose alias is already present in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateAliasPolicy {
    /// Refuse to add the counters, with an error.
    #[default]
    Reject,
    /// Replace the existing counter by the new one, at the same position.
    Replace,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_period: Duration::from_secs(1),
            recreation_period: Duration::from_secs(60),
            max_parallel_reads: None,
            duplicate_aliases: DuplicateAliasPolicy::default(),
            normalization_divisor: None,
            worker_threads: None,
        }
    }
}

impl EngineConfig {
    /// Checks that the settings can be used by the engine.
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_period.is_zero() {
            return Err(String::from("sample_period must be greater than zero"));
        }
        if self.recreation_period.is_zero() {
            return Err(String::from("recreation_period must be greater than zero"));
        }
        if self.max_parallel_reads == Some(0) {
            return Err(String::from("max_parallel_reads must be greater than zero"));
        }
        if self.worker_threads == Some(0) {
            return Err(String::from("worker_threads must be greater than zero"));
        }
        match self.normalization_divisor {
            Some(d) if !d.is_finite() || d <= 0.0 => {
                Err(format!("normalization_divisor must be a positive number, not {d}"))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn effective_parallel_reads(&self) -> usize {
        self.max_parallel_reads.unwrap_or_else(cpu_count)
    }

    pub(crate) fn effective_normalization_divisor(&self) -> f64 {
        self.normalization_divisor.unwrap_or_else(|| cpu_count() as f64)
    }
}

/// Returns the number of CPUs that the process can use.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
