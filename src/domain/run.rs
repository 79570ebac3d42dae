//! Run state and reconstruction from events.
//!
//! A Run represents a single execution of the pipeline graph.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType, StageStatus};

/// A pipeline execution run, as reconstructed from its event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Human-readable run name
    pub name: String,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run completed (if applicable)
    pub completed_at: Option<DateTime<Utc>>,

    /// Status of each stage (stage name -> status)
    pub stage_statuses: BTreeMap<String, StageStatus>,

    /// Cache keys of stages that finished successfully
    pub completed_keys: BTreeMap<String, String>,
}

impl Run {
    /// Create a new run
    pub fn new(id: Uuid, name: String) -> Self {
        Self {
            id,
            name,
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            stage_statuses: BTreeMap::new(),
            completed_keys: BTreeMap::new(),
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut run = Self {
            id: first_event.run_id,
            name: String::new(),
            state: RunState::Running,
            started_at: first_event.timestamp,
            completed_at: None,
            stage_statuses: BTreeMap::new(),
            completed_keys: BTreeMap::new(),
        };

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        let stage = event.stage.clone();

        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                self.name = event.payload_summary.clone();
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                // A run cut short by its budget keeps that as its final state
                if !matches!(self.state, RunState::TimeLimitReached { .. }) {
                    self.state = RunState::Failed {
                        error: event.error.clone().unwrap_or_default(),
                    };
                }
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunTimeLimitReached => {
                self.state = RunState::TimeLimitReached {
                    limit: event.error.clone().unwrap_or_default(),
                };
            }
            EventType::StageStarted | EventType::StageRetrying => {
                if let Some(stage) = stage {
                    self.stage_statuses.insert(stage, StageStatus::Running);
                }
            }
            EventType::StageCompleted | EventType::StageCached => {
                if let Some(stage) = stage {
                    let status = if event.event_type == EventType::StageCached {
                        StageStatus::Cached
                    } else {
                        StageStatus::Completed
                    };
                    self.completed_keys
                        .insert(stage.clone(), event.cache_key.clone());
                    self.stage_statuses.insert(stage, status);
                }
            }
            EventType::StageFailed => {
                if let Some(stage) = stage {
                    self.stage_statuses.insert(stage, StageStatus::Failed);
                }
            }
            EventType::StageSkipped => {
                if let Some(stage) = stage {
                    self.stage_statuses.insert(stage, StageStatus::Skipped);
                }
            }
        }
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    /// Check if a stage finished with this cache key
    pub fn completed_with_key(&self, stage: &str, cache_key: &str) -> bool {
        self.completed_keys
            .get(stage)
            .map(|k| k == cache_key)
            .unwrap_or(false)
    }
}

/// State of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Currently executing
    Running,

    /// Every planned stage completed
    Completed,

    /// At least one stage failed
    Failed { error: String },

    /// The run's wall-clock budget ran out
    TimeLimitReached { limit: String },
}

impl RunState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::TimeLimitReached { .. } => "time-limit",
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}
