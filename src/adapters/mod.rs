//! Adapter interfaces for external systems.
//!
//! Adapters provide a unified interface to everything outside the engine:
//! the tools a stage runs and the channels a finished run is announced on.

pub mod email;
pub mod process;
pub mod webhook;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::graph::OutputDecl;
use crate::core::materialize::CommandSpec;
use crate::domain::FailureCause;

pub use email::EmailNotifier;
pub use process::ProcessExecutor;
pub use webhook::{WebhookConfig, WebhookNotifier};

/// Everything an executor needs to run one stage attempt
#[derive(Debug, Clone)]
pub struct StageJob {
    pub stage_name: String,

    /// Invocations to run in order
    pub command: CommandSpec,

    /// Private working directory, inputs already staged
    pub workdir: PathBuf,

    /// Outputs the stage is expected to leave in `workdir`
    pub outputs: Vec<OutputDecl>,

    /// Wall-clock budget of this attempt
    pub timeout: Duration,

    /// 1-indexed attempt number
    pub attempt: u32,
}

/// Output from a successful stage attempt
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    /// Last lines written to stderr
    pub stderr_tail: String,
}

/// Trait for stage executors
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Run a stage attempt to completion or failure
    async fn execute(&self, job: &StageJob) -> Result<ExecutionOutput, FailureCause>;
}

/// Message announcing a finished run
#[derive(Debug, Clone)]
pub struct Notification {
    pub subject: String,

    /// Plain-text body
    pub text: String,

    /// HTML body for channels that render it
    pub html: String,

    /// JSON form of the run summary
    pub summary: serde_json::Value,

    /// Report archive, when one was produced
    pub attachment: Option<PathBuf>,

    pub success: bool,
}

/// A notification that could not be delivered
#[derive(Debug, Clone, Error)]
#[error("{channel} notification failed: {message}")]
pub struct NotificationFailure {
    pub channel: String,
    pub message: String,
}

impl NotificationFailure {
    pub fn new(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

/// Trait for completion notifiers
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name used in logs
    fn name(&self) -> &str;

    /// Deliver a notification
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationFailure>;
}
