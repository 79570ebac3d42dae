//! Resource budget for a run.
//!
//! Bounds execution through configurable limits on:
//! - Number of concurrently running stages
//! - CPUs handed to multi-threaded tools
//! - Wall-clock time per stage attempt and per run

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resource limits for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum number of stages running at once (default: 4)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Threads passed to multi-threaded tools (default: 2)
    #[serde(default = "default_max_cpus")]
    pub max_cpus: u32,

    /// Memory available to a stage, exported to tools (default: 16.GB)
    #[serde(default = "default_max_memory")]
    pub max_memory: String,

    /// Per-stage wall-clock budget for the first attempt (default: 2h)
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_seconds: u64,

    /// Total run budget; no stage starts after it ran out (default: 240h)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,
}

fn default_max_workers() -> usize {
    4
}
fn default_max_cpus() -> u32 {
    2
}
fn default_max_memory() -> String {
    "16.GB".to_string()
}
fn default_stage_timeout() -> u64 {
    2 * 60 * 60
}
fn default_run_timeout() -> u64 {
    240 * 60 * 60
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_cpus: default_max_cpus(),
            max_memory: default_max_memory(),
            stage_timeout_seconds: default_stage_timeout(),
            run_timeout_seconds: default_run_timeout(),
        }
    }
}

impl ResourceLimits {
    /// Wall-clock budget of a stage attempt (1-indexed); grows with each retry
    pub fn stage_timeout(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.stage_timeout_seconds.saturating_mul(attempt.max(1) as u64))
    }

    /// Effective worker count, never zero
    pub fn workers(&self) -> usize {
        self.max_workers.max(1)
    }

    /// Check current tracker state against limits
    pub fn check(&self, tracker: &RunTracker) -> Result<(), LimitViolation> {
        let elapsed = tracker.elapsed_seconds();
        if elapsed >= self.run_timeout_seconds {
            return Err(LimitViolation::RunTimeout {
                elapsed_seconds: elapsed,
                limit_seconds: self.run_timeout_seconds,
            });
        }
        Ok(())
    }
}

/// Tracks resource usage during a run
#[derive(Debug, Clone)]
pub struct RunTracker {
    /// Number of stage attempts launched
    pub attempts_launched: u32,

    /// Total bytes of artifacts produced
    pub output_bytes: u64,

    /// When the run started
    pub started_at: Instant,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            attempts_launched: 0,
            output_bytes: 0,
            started_at: Instant::now(),
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempts_launched += 1;
    }

    pub fn record_outputs(&mut self, bytes: u64) {
        self.output_bytes += bytes;
    }

    /// Get elapsed time in seconds
    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Budget violations
#[derive(Debug, Clone, Error)]
pub enum LimitViolation {
    #[error("Run timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}
