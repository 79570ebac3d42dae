//! Event types for the run log.
//!
//! Every state change of a run is recorded as an immutable event in an
//! append-only log, which `status`, `runs` and `--resume` read back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event in the append-only run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Stage name (if applicable)
    pub stage: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Cache key format: "{stage}:{command_hash}"
    pub cache_key: String,

    /// Human-readable summary
    pub payload_summary: String,

    /// Current status of the stage/run
    pub status: StageStatus,

    /// Time taken in milliseconds (for finished stages)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        stage: Option<String>,
        event_type: EventType,
        cache_key: String,
        payload_summary: String,
        status: StageStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            stage,
            event_type,
            cache_key,
            payload_summary,
            status,
            duration_ms: None,
            error: None,
        }
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// Every planned stage completed
    RunCompleted,

    /// At least one stage failed
    RunFailed,

    /// A stage has started execution
    StageStarted,

    /// A stage completed and published its outputs
    StageCompleted,

    /// A stage failed permanently
    StageFailed,

    /// A stage is being retried after a failed attempt
    StageRetrying,

    /// A stage became unreachable because an upstream stage failed
    StageSkipped,

    /// A stage was satisfied from a previous run
    StageCached,

    /// The run's wall-clock budget ran out; no new stages are started
    RunTimeLimitReached,
}

/// Status of a stage or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting for its inputs
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Outputs reused from a previous run
    Cached,

    /// Failed (with error)
    Failed,

    /// Never executed because an input can no longer be produced
    Skipped,
}

impl StageStatus {
    /// Whether the stage will not change state again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether downstream stages can consume the outputs
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Cached)
    }
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}
