//! Run context and completion reporting.
//!
//! The [`RunContext`] is fixed before the first stage starts. The
//! [`RunSummary`] is seeded from it and finalized exactly once when the
//! graph terminates; the [`CompletionReporter`] then writes it under
//! `pipeline_info/` and hands it to every configured notifier. Notification
//! is best-effort: a failing channel is logged and never changes the outcome.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{
    EmailNotifier, Notification, Notifier, WebhookConfig, WebhookNotifier,
};
use crate::config::{paths, NotificationSettings, ResolvedConfig};
use crate::domain::StageStatus;

use super::limits::ResourceLimits;
use super::pipeline::{PIPELINE_VERSION, REPORT};
use super::resolver::ResolvedParams;
use super::samples::Sample;
use super::scheduler::RunOutcome;

/// Everything known about a run before it starts. Never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub run_name: String,
    pub started_at: DateTime<Utc>,

    /// Absolute output root
    pub outdir: PathBuf,

    /// Absolute root of the stage working directories
    pub work_dir: PathBuf,

    pub limits: ResourceLimits,
    pub report_mode: bool,

    /// Parameter flag -> supplied value or sentinel
    pub inputs: IndexMap<String, String>,

    /// Metagenomic sample ids
    pub samples: Vec<String>,

    pub config_file: Option<PathBuf>,
}

impl RunContext {
    pub fn new(
        run_name: Option<String>,
        params: &ResolvedParams,
        samples: &[Sample],
        config: &ResolvedConfig,
    ) -> Self {
        let run_id = Uuid::new_v4();
        let run_name = run_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_run_name(&run_id));

        Self {
            run_id,
            run_name,
            started_at: Utc::now(),
            outdir: absolute(&config.outdir),
            work_dir: absolute(&config.work_dir),
            limits: config.limits.clone(),
            report_mode: params.mode().report,
            inputs: params
                .iter()
                .map(|(name, resolution)| (name.flag().to_string(), resolution.display_value()))
                .collect(),
            samples: samples.iter().map(|s| s.id.clone()).collect(),
            config_file: config.config_file.clone(),
        }
    }
}

fn default_run_name(run_id: &Uuid) -> String {
    let short: String = run_id.simple().to_string().chars().take(8).collect();
    format!("rnadeseq-{}", short)
}

/// Stage paths recorded in artifacts must survive a change of directory
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Ordered description of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    fields: IndexMap<String, Value>,

    #[serde(skip)]
    finalized: bool,
}

/// Stage results folded into completion fields
#[derive(Debug, Default)]
struct Tally {
    completed: usize,
    reused: Vec<String>,
    failed: Vec<String>,
    causes: Vec<String>,
    skipped: Vec<String>,
}

impl RunSummary {
    /// Seed a summary with the run's descriptive fields
    pub fn start(ctx: &RunContext) -> Self {
        let mut fields = IndexMap::new();
        fields.insert("Run Name".to_string(), Value::from(ctx.run_name.clone()));
        fields.insert("Run ID".to_string(), Value::from(ctx.run_id.to_string()));
        fields.insert("Pipeline Version".to_string(), Value::from(PIPELINE_VERSION));
        fields.insert(
            "Mode".to_string(),
            Value::from(if ctx.report_mode { "report" } else { "no report" }),
        );

        for (flag, value) in &ctx.inputs {
            fields.insert(flag.clone(), Value::from(value.clone()));
        }
        if !ctx.samples.is_empty() {
            fields.insert("Samples".to_string(), Value::from(ctx.samples.clone()));
        }

        fields.insert("Max Workers".to_string(), Value::from(ctx.limits.max_workers));
        fields.insert("Max CPUs".to_string(), Value::from(ctx.limits.max_cpus));
        fields.insert("Max Memory".to_string(), Value::from(ctx.limits.max_memory.clone()));
        fields.insert(
            "Stage Timeout".to_string(),
            Value::from(format_duration(ctx.limits.stage_timeout_seconds)),
        );
        fields.insert(
            "Run Timeout".to_string(),
            Value::from(format_duration(ctx.limits.run_timeout_seconds)),
        );
        fields.insert("Output Dir".to_string(), Value::from(ctx.outdir.display().to_string()));
        fields.insert("Work Dir".to_string(), Value::from(ctx.work_dir.display().to_string()));
        if let Some(config_file) = &ctx.config_file {
            fields.insert(
                "Config File".to_string(),
                Value::from(config_file.display().to_string()),
            );
        }
        fields.insert("Start Time".to_string(), Value::from(ctx.started_at.to_rfc3339()));

        Self {
            fields,
            finalized: false,
        }
    }

    /// Add the completion fields. A finalized summary is returned unchanged.
    pub fn finalize(mut self, outcome: &RunOutcome, completed_at: DateTime<Utc>) -> Self {
        if self.finalized {
            return self;
        }

        let tally = outcome.stages.values().fold(Tally::default(), |mut tally, stage| {
            match stage.status {
                StageStatus::Completed => tally.completed += 1,
                StageStatus::Cached => tally.reused.push(stage.stage.clone()),
                StageStatus::Failed => {
                    tally.failed.push(stage.stage.clone());
                    if let Some(failure) = &stage.failure {
                        tally.causes.push(failure.to_string());
                    }
                }
                StageStatus::Skipped => tally.skipped.push(stage.stage.clone()),
                StageStatus::Pending | StageStatus::Running => {}
            }
            tally
        });

        let started_at = self
            .fields
            .get("Start Time")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(completed_at);
        let elapsed = (completed_at - started_at).num_seconds().max(0) as u64;
        let success = outcome.success();

        let mut set = |key: &str, value: Value| {
            self.fields.insert(key.to_string(), value);
        };
        set("End Time", Value::from(completed_at.to_rfc3339()));
        set("Duration", Value::from(format_duration(elapsed)));
        set("Success", Value::from(success));
        set("Stages Completed", Value::from(tally.completed));
        set("Attempts", Value::from(outcome.attempts_launched));
        set("Output Bytes", Value::from(outcome.output_bytes));
        if !tally.reused.is_empty() {
            set("Stages Reused", Value::from(tally.reused));
        }
        if !tally.failed.is_empty() {
            set("Failed Stages", Value::from(tally.failed));
            set("Error Report", Value::from(tally.causes));
        }
        if !tally.skipped.is_empty() {
            set("Skipped Stages", Value::from(tally.skipped));
        }
        if outcome.time_limit_reached {
            set("Time Limit Reached", Value::from(true));
        }

        self.finalized = true;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &IndexMap<String, Value> {
        &self.fields
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn success(&self) -> bool {
        self.get("Success").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn run_name(&self) -> &str {
        self.get("Run Name").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone().into_iter().collect())
    }

    /// One `key: value` line per field
    pub fn to_text(&self) -> String {
        let width = self.fields.keys().map(String::len).max().unwrap_or(0);
        self.fields
            .iter()
            .map(|(key, value)| format!("{:<width$} : {}", key, plain(value), width = width))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn to_html(&self, heading: &str) -> String {
        let rows: String = self
            .fields
            .iter()
            .map(|(key, value)| {
                format!(
                    "<tr><th align=\"left\">{}</th><td>{}</td></tr>\n",
                    escape_html(key),
                    escape_html(&plain(value))
                )
            })
            .collect();

        format!(
            "<html>\n<body>\n<h2>{}</h2>\n<table>\n{}</table>\n</body>\n</html>",
            escape_html(heading),
            rows
        )
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(plain).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `1h 2m 3s`, leading zero units dropped
pub fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    match (h, m) {
        (0, 0) => format!("{}s", s),
        (0, _) => format!("{}m {}s", m, s),
        _ => format!("{}h {}m {}s", h, m, s),
    }
}

/// Write `pipeline_report.txt` and `pipeline_report.json`
pub async fn write_summary(summary: &RunSummary, outdir: &Path) -> Result<()> {
    let dir = paths::pipeline_info(outdir);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let text_path = paths::report_txt(outdir);
    tokio::fs::write(&text_path, format!("{}\n", summary.to_text()))
        .await
        .with_context(|| format!("Failed to write {}", text_path.display()))?;

    let json = serde_json::to_string_pretty(&summary.to_json())
        .context("Failed to serialize run summary")?;
    let json_path = paths::report_json(outdir);
    tokio::fs::write(&json_path, json)
        .await
        .with_context(|| format!("Failed to write {}", json_path.display()))?;

    Ok(())
}

/// When a notifier fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOn {
    Always,
    Failure,
}

/// Finalizes the summary and announces the run
#[derive(Default)]
pub struct CompletionReporter {
    notifiers: Vec<(NotifyOn, Box<dyn Notifier>)>,
}

impl CompletionReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifier(mut self, on: NotifyOn, notifier: Box<dyn Notifier>) -> Self {
        self.notifiers.push((on, notifier));
        self
    }

    /// Notifiers for every configured channel
    pub fn from_settings(settings: &NotificationSettings) -> Self {
        let mut reporter = Self::new();

        if let Some(email) = settings.email.as_deref().filter(|e| !e.is_empty()) {
            reporter = reporter.with_notifier(
                NotifyOn::Always,
                Box::new(EmailNotifier::new(email, settings)),
            );
        }
        if let Some(email) = settings.email_on_fail.as_deref().filter(|e| !e.is_empty()) {
            reporter = reporter.with_notifier(
                NotifyOn::Failure,
                Box::new(EmailNotifier::new(email, settings)),
            );
        }
        if let Some(url) = settings.webhook_url.as_deref().filter(|u| !u.is_empty()) {
            reporter = reporter.with_notifier(
                NotifyOn::Always,
                Box::new(WebhookNotifier::new(WebhookConfig::new(url))),
            );
        }

        reporter
    }

    pub fn notifier_count(&self) -> usize {
        self.notifiers.len()
    }

    /// Finalize `summary`, persist it and notify. Never fails the run.
    pub async fn complete(
        &self,
        ctx: &RunContext,
        summary: RunSummary,
        outcome: &RunOutcome,
    ) -> RunSummary {
        let summary = summary.finalize(outcome, Utc::now());

        match write_summary(&summary, &ctx.outdir).await {
            Ok(()) => info!(
                path = %paths::report_txt(&ctx.outdir).display(),
                "Wrote run summary"
            ),
            Err(e) => warn!(error = %e, "Failed to write run summary"),
        }

        let notification = build_notification(&summary, outcome);
        self.notify(&notification).await;

        summary
    }

    async fn notify(&self, notification: &Notification) {
        for (on, notifier) in &self.notifiers {
            if *on == NotifyOn::Failure && notification.success {
                continue;
            }
            match notifier.notify(notification).await {
                Ok(()) => debug!(channel = notifier.name(), "Notification delivered"),
                Err(e) => warn!(
                    channel = %e.channel,
                    error = %e.message,
                    "Notification failed, run outcome unchanged"
                ),
            }
        }
    }
}

fn build_notification(summary: &RunSummary, outcome: &RunOutcome) -> Notification {
    let success = summary.success();
    let subject = format!(
        "[rnadeseq] {}: {}",
        if success { "Successful" } else { "FAILED" },
        summary.run_name()
    );

    let headline = if success {
        format!("Run {} completed successfully.", summary.run_name())
    } else {
        format!("Run {} completed with errors.", summary.run_name())
    };

    Notification {
        text: format!("{}\n\n{}\n", headline, summary.to_text()),
        html: summary.to_html(&headline),
        summary: summary.to_json(),
        attachment: outcome
            .published(REPORT)
            .iter()
            .find(|p| p.is_file())
            .cloned(),
        subject,
        success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::NotificationFailure;
    use crate::core::resolver::{resolve_all, SuppliedParams};
    use crate::core::scheduler::StageOutcome;
    use crate::domain::{FailureCause, StageFailure};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn context(outdir: &Path) -> RunContext {
        let params = resolve_all(&SuppliedParams::new(), false).unwrap();
        let config = ResolvedConfig::rooted_at(outdir);
        RunContext::new(Some("brave_curie".to_string()), &params, &[], &config)
    }

    fn stage(name: &str, status: StageStatus) -> StageOutcome {
        StageOutcome {
            stage: name.to_string(),
            status,
            attempts: if status == StageStatus::Skipped { 0 } else { 1 },
            duration_ms: 10,
            failure: (status == StageStatus::Failed).then(|| {
                StageFailure::new(
                    name,
                    FailureCause::ExitStatus {
                        program: "humann2".to_string(),
                        code: 1,
                        stderr: "bad input".to_string(),
                    },
                )
            }),
            skipped_because: None,
            artifacts: Vec::new(),
            published: Vec::new(),
        }
    }

    fn outcome(stages: Vec<StageOutcome>) -> RunOutcome {
        RunOutcome {
            attempts_launched: stages.iter().map(|s| s.attempts).sum(),
            output_bytes: 0,
            stages: stages.into_iter().map(|s| (s.stage.clone(), s)).collect(),
            time_limit_reached: false,
        }
    }

    struct Recording {
        subjects: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn notify(&self, notification: &Notification) -> Result<(), NotificationFailure> {
            self.subjects
                .lock()
                .unwrap()
                .push(notification.subject.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn notify(&self, _: &Notification) -> Result<(), NotificationFailure> {
            Err(NotificationFailure::new("broken", "relay refused"))
        }
    }

    #[test]
    fn test_context_echoes_inputs_and_absolute_paths() {
        let ctx = context(Path::new("relative"));
        assert!(ctx.outdir.is_absolute());
        assert!(ctx.work_dir.is_absolute());
        assert_eq!(ctx.inputs.get("genelist").map(String::as_str), Some("NO_FILE"));
        assert_eq!(ctx.inputs.get("contrasts").map(String::as_str), Some("DEFAULT"));
        assert!(!ctx.report_mode);
    }

    #[test]
    fn test_default_run_name() {
        let params = resolve_all(&SuppliedParams::new(), false).unwrap();
        let ctx = RunContext::new(None, &params, &[], &ResolvedConfig::default());
        assert!(ctx.run_name.starts_with("rnadeseq-"));
        assert_eq!(ctx.run_name.len(), "rnadeseq-".len() + 8);
    }

    #[test]
    fn test_finalize_reduces_stage_results() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());
        let outcome = outcome(vec![
            stage("software_versions", StageStatus::Completed),
            stage("profile_s2", StageStatus::Failed),
            stage("merge_profiles", StageStatus::Skipped),
            stage("profile_s1", StageStatus::Cached),
        ]);

        let summary = RunSummary::start(&ctx).finalize(&outcome, Utc::now());

        assert!(!summary.success());
        assert_eq!(summary.get("Stages Completed"), Some(&Value::from(1)));
        assert_eq!(
            summary.get("Failed Stages"),
            Some(&Value::from(vec!["profile_s2"]))
        );
        assert_eq!(
            summary.get("Skipped Stages"),
            Some(&Value::from(vec!["merge_profiles"]))
        );
        assert_eq!(
            summary.get("Stages Reused"),
            Some(&Value::from(vec!["profile_s1"]))
        );
        assert!(summary.to_text().contains("bad input"));
        assert_eq!(summary.get("Attempts"), Some(&Value::from(3)));
        assert_eq!(summary.get("Output Bytes"), Some(&Value::from(0)));

        // Descriptive fields come first, completion fields after
        let keys: Vec<&String> = summary.fields().keys().collect();
        assert_eq!(keys[0], "Run Name");
        let start = keys.iter().position(|k| *k == "Start Time").unwrap();
        let end = keys.iter().position(|k| *k == "End Time").unwrap();
        assert!(start < end);
    }

    #[test]
    fn test_finalize_happens_once() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());
        let first = RunSummary::start(&ctx)
            .finalize(&outcome(vec![stage("software_versions", StageStatus::Completed)]), Utc::now());
        let again = first.clone().finalize(
            &outcome(vec![stage("software_versions", StageStatus::Failed)]),
            Utc::now(),
        );

        assert!(again.is_finalized());
        assert_eq!(again, first);
        assert!(again.success());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(7200), "2h 0m 0s");
    }

    #[test]
    fn test_html_is_escaped() {
        let temp = TempDir::new().unwrap();
        let summary = RunSummary::start(&context(temp.path()));
        let html = summary.to_html("<run>");
        assert!(html.contains("&lt;run&gt;"));
        assert!(html.contains("<th align=\"left\">Run Name</th><td>brave_curie</td>"));
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_change_outcome() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());
        let subjects = Arc::new(Mutex::new(Vec::new()));

        let reporter = CompletionReporter::new()
            .with_notifier(NotifyOn::Always, Box::new(Broken))
            .with_notifier(
                NotifyOn::Always,
                Box::new(Recording {
                    subjects: Arc::clone(&subjects),
                }),
            );

        let summary = reporter
            .complete(
                &ctx,
                RunSummary::start(&ctx),
                &outcome(vec![stage("software_versions", StageStatus::Completed)]),
            )
            .await;

        assert!(summary.success());
        assert_eq!(
            subjects.lock().unwrap().as_slice(),
            ["[rnadeseq] Successful: brave_curie".to_string()]
        );
        assert!(paths::report_txt(&ctx.outdir).exists());
        assert!(paths::report_json(&ctx.outdir).exists());
    }

    #[tokio::test]
    async fn test_failure_only_channel() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());
        let subjects = Arc::new(Mutex::new(Vec::new()));
        let reporter = CompletionReporter::new().with_notifier(
            NotifyOn::Failure,
            Box::new(Recording {
                subjects: Arc::clone(&subjects),
            }),
        );

        reporter
            .complete(
                &ctx,
                RunSummary::start(&ctx),
                &outcome(vec![stage("software_versions", StageStatus::Completed)]),
            )
            .await;
        assert!(subjects.lock().unwrap().is_empty());

        reporter
            .complete(
                &ctx,
                RunSummary::start(&ctx),
                &outcome(vec![stage("differential_expression", StageStatus::Failed)]),
            )
            .await;
        assert_eq!(
            subjects.lock().unwrap().as_slice(),
            ["[rnadeseq] FAILED: brave_curie".to_string()]
        );
    }

    #[test]
    fn test_from_settings_builds_each_channel() {
        let settings = NotificationSettings {
            email: Some("lab@example.org".to_string()),
            email_on_fail: Some("oncall@example.org".to_string()),
            webhook_url: Some("https://hooks.example.org/run".to_string()),
            ..Default::default()
        };
        assert_eq!(CompletionReporter::from_settings(&settings).notifier_count(), 3);
        assert_eq!(
            CompletionReporter::from_settings(&NotificationSettings::default()).notifier_count(),
            0
        );
    }
}
