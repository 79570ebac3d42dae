//! Stage failure types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A stage that did not produce its outputs
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("stage '{stage}' failed: {cause}")]
pub struct StageFailure {
    pub stage: String,
    pub cause: FailureCause,
}

impl StageFailure {
    pub fn new(stage: impl Into<String>, cause: FailureCause) -> Self {
        Self {
            stage: stage.into(),
            cause,
        }
    }

    /// Whether a new attempt could plausibly succeed
    pub fn is_retryable(&self, retry_on: &[i32]) -> bool {
        match &self.cause {
            FailureCause::ExitStatus { code, .. } => retry_on.contains(code),
            FailureCause::TimedOut { .. } => true,
            _ => false,
        }
    }
}

/// Why a stage failed
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureCause {
    #[error("'{program}' exited with code {code}: {stderr}")]
    ExitStatus {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("exceeded its wall-clock budget of {limit_seconds}s")]
    TimedOut { limit_seconds: u64 },

    #[error("could not launch '{program}': {message}")]
    Launch { program: String, message: String },

    #[error("declared output '{output}' was not produced at {}", .path.display())]
    MissingOutput { output: String, path: PathBuf },

    #[error("could not prepare inputs: {message}")]
    Staging { message: String },
}
