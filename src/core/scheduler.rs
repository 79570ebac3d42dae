//! Concurrent execution of a stage graph.
//!
//! The scheduler launches every stage whose upstream stages all succeeded,
//! at most `max_workers` at a time. Each attempt runs in its own task on a
//! [`JoinSet`] and only touches the stage's private working directory; the
//! coordinating loop owns all run state. A failed stage makes every
//! transitive dependent unreachable while independent branches keep going.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use anyhow::{Context, Result};
use fs2::FileExt;
use indexmap::IndexMap;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{StageExecutor, StageJob};
use crate::config::paths;
use crate::domain::{
    Artifact, ArtifactKind, Event, EventType, FailureCause, Resolution, Run, StageFailure,
    StageStatus,
};

use super::completion::RunContext;
use super::event_store::{cache_key, key_hash, EventStore};
use super::graph::{BindingSource, OutputDecl, Stage, StageGraph};
use super::limits::RunTracker;
use super::materialize::{staged_path, Materializer, ResolvedInputs};
use super::pipeline::RetryPolicy;
use super::resolver::ResolvedParams;

/// Final state of one stage
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: String,
    pub status: StageStatus,

    /// Attempts made (0 for skipped and cached stages)
    pub attempts: u32,

    pub duration_ms: u64,
    pub failure: Option<StageFailure>,

    /// Why the stage never ran
    pub skipped_because: Option<String>,

    pub artifacts: Vec<Arc<Artifact>>,

    /// Copies below the output root
    pub published: Vec<PathBuf>,
}

impl StageOutcome {
    fn skipped(stage: &str, reason: String) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Skipped,
            attempts: 0,
            duration_ms: 0,
            failure: None,
            skipped_because: Some(reason),
            artifacts: Vec::new(),
            published: Vec::new(),
        }
    }
}

/// Result of executing a whole graph
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Outcomes in stage declaration order
    pub stages: IndexMap<String, StageOutcome>,

    /// The run budget ran out before every stage could start
    pub time_limit_reached: bool,

    /// Stage attempts launched, retries included
    pub attempts_launched: u32,

    /// Total size of the artifacts produced
    pub output_bytes: u64,
}

impl RunOutcome {
    /// Every stage completed (or was reused) within budget
    pub fn success(&self) -> bool {
        !self.time_limit_reached && self.stages.values().all(|o| o.status.is_success())
    }

    pub fn status(&self, stage: &str) -> Option<StageStatus> {
        self.stages.get(stage).map(|o| o.status)
    }

    pub fn failures(&self) -> Vec<&StageFailure> {
        self.stages
            .values()
            .filter_map(|o| o.failure.as_ref())
            .collect()
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.with_status(StageStatus::Skipped)
    }

    pub fn with_status(&self, status: StageStatus) -> Vec<&str> {
        self.stages
            .values()
            .filter(|o| o.status == status)
            .map(|o| o.stage.as_str())
            .collect()
    }

    /// Published copies of a stage's outputs
    pub fn published(&self, stage: &str) -> &[PathBuf] {
        self.stages
            .get(stage)
            .map(|o| o.published.as_slice())
            .unwrap_or(&[])
    }
}

/// Exclusive lock on an output root, released on drop
pub struct RunLock {
    file: std::fs::File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock, failing immediately if another run holds it
    pub fn acquire(outdir: &Path) -> Result<Self> {
        let path = paths::lock_file(outdir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        file.try_lock_exclusive().with_context(|| {
            format!(
                "Another run is already writing to {}",
                outdir.display()
            )
        })?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Executes stage graphs
pub struct Scheduler {
    executor: Arc<dyn StageExecutor>,
    materializer: Materializer,
    retry: RetryPolicy,

    /// Previous run whose completed stages may be reused
    resume: Option<Run>,
}

impl Scheduler {
    pub fn new(
        executor: Arc<dyn StageExecutor>,
        materializer: Materializer,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            executor,
            materializer,
            retry,
            resume: None,
        }
    }

    /// Reuse stages that completed in `previous` with identical inputs
    pub fn with_resume(mut self, previous: Run) -> Self {
        self.resume = Some(previous);
        self
    }

    /// Execute every stage of `graph` and report how each one ended
    #[instrument(skip_all, fields(run_id = %ctx.run_id, run_name = %ctx.run_name))]
    pub async fn run(
        &self,
        ctx: &RunContext,
        graph: &StageGraph,
        params: &ResolvedParams,
        store: &EventStore,
    ) -> Result<RunOutcome> {
        info!(stages = graph.len(), executor = self.executor.name(), "Starting pipeline run");

        store
            .append(&Event::new(
                ctx.run_id,
                None,
                EventType::RunStarted,
                format!("{}:start", ctx.run_id),
                ctx.run_name.clone(),
                StageStatus::Running,
            ))
            .await?;

        let mut execution = Execution {
            scheduler: self,
            ctx,
            graph,
            params,
            store,
            order: graph
                .topological_order()
                .into_iter()
                .map(String::from)
                .collect(),
            statuses: graph
                .stage_names()
                .into_iter()
                .map(|n| (n.to_string(), StageStatus::Pending))
                .collect(),
            artifacts: HashMap::new(),
            outcomes: HashMap::new(),
            in_flight: HashMap::new(),
            tasks: JoinSet::new(),
            tracker: RunTracker::new(),
            time_limit_reached: false,
        };

        execution.drive().await
    }
}

/// A stage ready to be attempted
#[derive(Debug, Clone)]
struct Prepared {
    job: StageJob,
    inputs: ResolvedInputs,
    cache_key: String,
}

/// What a finished attempt task reports back
struct AttemptResult {
    stage: String,
    attempt: u32,
    duration_ms: u64,
    result: Result<Vec<Artifact>, FailureCause>,
}

/// Mutable state of one graph execution, owned by the coordinating loop
struct Execution<'a> {
    scheduler: &'a Scheduler,
    ctx: &'a RunContext,
    graph: &'a StageGraph,
    params: &'a ResolvedParams,
    store: &'a EventStore,

    /// Launch priority
    order: Vec<String>,
    statuses: HashMap<String, StageStatus>,

    /// (stage, output) -> artifact
    artifacts: HashMap<(String, String), Arc<Artifact>>,
    outcomes: HashMap<String, StageOutcome>,
    in_flight: HashMap<String, Prepared>,
    tasks: JoinSet<AttemptResult>,
    tracker: RunTracker,
    time_limit_reached: bool,
}

impl<'a> Execution<'a> {
    async fn drive(mut self) -> Result<RunOutcome> {
        loop {
            if !self.time_limit_reached {
                if let Err(violation) = self.ctx.limits.check(&self.tracker) {
                    self.time_limit_reached = true;
                    warn!(%violation, "Run time limit reached, no new stages will start");
                    self.record(
                        Event::new(
                            self.ctx.run_id,
                            None,
                            EventType::RunTimeLimitReached,
                            format!("{}:time_limit", self.ctx.run_id),
                            "Run time limit reached".to_string(),
                            StageStatus::Failed,
                        )
                        .with_error(violation.to_string()),
                    )
                    .await?;
                } else {
                    self.launch_ready().await?;
                }
            }

            let Some(joined) = self.tasks.join_next().await else {
                break;
            };
            let attempt = joined.context("Stage task panicked")?;
            self.handle_attempt(attempt).await?;
        }

        let graph = self.graph;
        for name in graph.stage_names() {
            if self.statuses.get(name) == Some(&StageStatus::Pending) {
                self.skip(name, "run time limit reached".to_string()).await?;
            }
        }

        let stages: IndexMap<String, StageOutcome> = graph
            .stage_names()
            .into_iter()
            .filter_map(|n| self.outcomes.remove(n).map(|o| (n.to_string(), o)))
            .collect();
        let outcome = RunOutcome {
            stages,
            time_limit_reached: self.time_limit_reached,
            attempts_launched: self.tracker.attempts_launched,
            output_bytes: self.tracker.output_bytes,
        };

        if outcome.success() {
            info!(run_id = %self.ctx.run_id, "Run completed successfully");
            self.record(Event::new(
                self.ctx.run_id,
                None,
                EventType::RunCompleted,
                format!("{}:complete", self.ctx.run_id),
                format!("Run '{}' completed", self.ctx.run_name),
                StageStatus::Completed,
            ))
            .await?;
        } else {
            let failed: Vec<&str> = outcome.failures().iter().map(|f| f.stage.as_str()).collect();
            let message = if failed.is_empty() {
                "run time limit reached".to_string()
            } else {
                format!("failed stages: {}", failed.join(", "))
            };
            error!(%message, "Run failed");
            self.record(
                Event::new(
                    self.ctx.run_id,
                    None,
                    EventType::RunFailed,
                    format!("{}:complete", self.ctx.run_id),
                    format!("Run '{}' failed", self.ctx.run_name),
                    StageStatus::Failed,
                )
                .with_error(message),
            )
            .await?;
        }

        Ok(outcome)
    }

    async fn record(&self, event: Event) -> Result<()> {
        self.store.append(&event).await
    }

    fn is_ready(&self, name: &str) -> bool {
        self.graph
            .upstream(name)
            .iter()
            .all(|u| self.statuses.get(*u).map(StageStatus::is_success).unwrap_or(false))
    }

    /// Start every eligible stage, up to the worker cap
    async fn launch_ready(&mut self) -> Result<()> {
        loop {
            // Cached or unpreparable stages settle immediately and may unblock others
            let mut settled = false;

            for i in 0..self.order.len() {
                if self.tasks.len() >= self.ctx.limits.workers() {
                    return Ok(());
                }
                let name = self.order[i].clone();
                if self.statuses.get(&name) != Some(&StageStatus::Pending) || !self.is_ready(&name)
                {
                    continue;
                }

                match self.prepare(&name) {
                    Err(failure) => {
                        self.fail(&name, failure, 0, 0).await?;
                        settled = true;
                    }
                    Ok(prepared) => {
                        if let Some(artifacts) = self.reusable(&name, &prepared) {
                            self.complete(&name, &prepared.cache_key, artifacts, 0, 0, true)
                                .await?;
                            settled = true;
                        } else {
                            self.start(&name, prepared).await?;
                        }
                    }
                }
            }

            if !settled {
                return Ok(());
            }
        }
    }

    fn stage(&self, name: &str) -> Result<&'a Stage, StageFailure> {
        self.graph.stage(name).ok_or_else(|| {
            StageFailure::new(
                name,
                FailureCause::Staging {
                    message: "stage is not part of the graph".to_string(),
                },
            )
        })
    }

    fn prepare(&self, name: &str) -> Result<Prepared, StageFailure> {
        let stage = self.stage(name)?;
        let inputs = self.resolve_inputs(stage)?;

        let command = self
            .scheduler
            .materializer
            .materialize(stage, &inputs)
            .map_err(|e| {
                StageFailure::new(
                    name,
                    FailureCause::Staging {
                        message: e.to_string(),
                    },
                )
            })?;

        let key = cache_key(name, &format!("{}\n{}", command.render(), fingerprint(&inputs)));
        let workdir = paths::stage_work_dir(&self.ctx.work_dir, name, key_hash(&key));

        debug!(stage = %name, command = %command.render(), "Materialized command");

        Ok(Prepared {
            job: StageJob {
                stage_name: name.to_string(),
                command,
                workdir,
                outputs: stage.outputs.clone(),
                timeout: self.ctx.limits.stage_timeout(1),
                attempt: 1,
            },
            inputs,
            cache_key: key,
        })
    }

    fn upstream_artifact(
        &self,
        stage: &str,
        upstream: &str,
        output: &str,
    ) -> Result<Arc<Artifact>, StageFailure> {
        self.artifacts
            .get(&(upstream.to_string(), output.to_string()))
            .cloned()
            .ok_or_else(|| {
                StageFailure::new(
                    stage,
                    FailureCause::Staging {
                        message: format!("output '{}' of '{}' is not available", output, upstream),
                    },
                )
            })
    }

    fn resolve_inputs(&self, stage: &Stage) -> Result<ResolvedInputs, StageFailure> {
        let mut inputs = ResolvedInputs::new();

        for binding in &stage.inputs {
            let resolution = match &binding.source {
                BindingSource::Param(name) => self.params.get(*name).clone(),
                BindingSource::Files(files) => Resolution::Paths(files.clone()),
                BindingSource::Upstream {
                    stage: upstream,
                    output,
                } => {
                    let artifact = self.upstream_artifact(&stage.name, upstream, output)?;
                    match (artifact.kind.is_multi(), artifact.primary_path()) {
                        (false, Some(path)) => Resolution::Path(path.to_path_buf()),
                        _ => Resolution::Paths(artifact.paths.clone()),
                    }
                }
                BindingSource::Collect { stages, output } => {
                    let mut paths = Vec::new();
                    for upstream in stages {
                        let artifact = self.upstream_artifact(&stage.name, upstream, output)?;
                        paths.extend(artifact.paths.iter().cloned());
                    }
                    Resolution::Paths(paths)
                }
            };
            inputs.insert(binding.alias.clone(), resolution);
        }

        Ok(inputs)
    }

    /// Outputs of a previous run's identical execution, if still on disk
    fn reusable(&self, name: &str, prepared: &Prepared) -> Option<Vec<Artifact>> {
        let previous = self.scheduler.resume.as_ref()?;
        if !previous.completed_with_key(name, &prepared.cache_key) {
            return None;
        }
        collect_outputs(name, &prepared.job.workdir, &prepared.job.outputs).ok()
    }

    async fn start(&mut self, name: &str, prepared: Prepared) -> Result<()> {
        info!(stage = %name, workdir = %prepared.job.workdir.display(), "Starting stage");

        self.record(Event::new(
            self.ctx.run_id,
            Some(name.to_string()),
            EventType::StageStarted,
            prepared.cache_key.clone(),
            format!("Stage '{}' attempt 1", name),
            StageStatus::Running,
        ))
        .await?;

        self.statuses.insert(name.to_string(), StageStatus::Running);
        self.spawn(&prepared, 1, None);
        self.in_flight.insert(name.to_string(), prepared);
        Ok(())
    }

    fn spawn(&mut self, prepared: &Prepared, attempt: u32, delay: Option<Duration>) {
        let mut job = prepared.job.clone();
        job.attempt = attempt;
        job.timeout = self.ctx.limits.stage_timeout(attempt);

        let inputs = prepared.inputs.clone();
        let executor = Arc::clone(&self.scheduler.executor);
        self.tracker.record_attempt();

        self.tasks.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let started = Instant::now();
            let result = run_attempt(executor.as_ref(), &job, &inputs).await;
            AttemptResult {
                stage: job.stage_name,
                attempt,
                duration_ms: started.elapsed().as_millis() as u64,
                result,
            }
        });
    }

    async fn handle_attempt(&mut self, finished: AttemptResult) -> Result<()> {
        let AttemptResult {
            stage,
            attempt,
            duration_ms,
            result,
        } = finished;

        match result {
            Ok(artifacts) => {
                let key = self
                    .in_flight
                    .remove(&stage)
                    .map(|p| p.cache_key)
                    .unwrap_or_default();
                self.complete(&stage, &key, artifacts, attempt, duration_ms, false)
                    .await
            }
            Err(cause) => {
                let failure = StageFailure::new(&stage, cause);
                let scheduler = self.scheduler;
                let retry = &scheduler.retry;

                if retry.retries(&failure, attempt) {
                    if let Some(prepared) = self.in_flight.get(&stage).cloned() {
                        let delay = retry.delay_for_attempt(attempt);
                        warn!(
                            stage = %stage,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure.cause,
                            "Stage failed, retrying"
                        );
                        self.record(
                            Event::new(
                                self.ctx.run_id,
                                Some(stage.clone()),
                                EventType::StageRetrying,
                                format!("{}:retry:{}", prepared.cache_key, attempt),
                                format!("Stage '{}' retrying in {:?}", stage, delay),
                                StageStatus::Running,
                            )
                            .with_error(failure.cause.to_string()),
                        )
                        .await?;
                        self.spawn(&prepared, attempt + 1, Some(delay));
                        return Ok(());
                    }
                }

                self.in_flight.remove(&stage);
                self.fail(&stage, failure, attempt, duration_ms).await
            }
        }
    }

    async fn publish(&self, name: &str, artifacts: &[Artifact]) -> Result<Vec<PathBuf>, String> {
        let Some(stage) = self.graph.stage(name) else {
            return Ok(Vec::new());
        };
        let outdir = self.ctx.outdir.clone();
        let outputs = stage.outputs.clone();
        let artifacts = artifacts.to_vec();

        tokio::task::spawn_blocking(move || publish_outputs(&outdir, &outputs, &artifacts))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())
    }

    async fn complete(
        &mut self,
        name: &str,
        key: &str,
        artifacts: Vec<Artifact>,
        attempts: u32,
        duration_ms: u64,
        cached: bool,
    ) -> Result<()> {
        let published = match self.publish(name, &artifacts).await {
            Ok(published) => published,
            Err(message) => {
                let failure = StageFailure::new(
                    name,
                    FailureCause::Staging {
                        message: format!("publishing failed: {}", message),
                    },
                );
                return self.fail(name, failure, attempts, duration_ms).await;
            }
        };

        let artifacts: Vec<Arc<Artifact>> = artifacts.into_iter().map(Arc::new).collect();
        for artifact in &artifacts {
            self.tracker.record_outputs(artifact.size_bytes);
            self.artifacts.insert(
                (name.to_string(), artifact.output_name.clone()),
                Arc::clone(artifact),
            );
        }

        let (status, event_type, summary) = if cached {
            (
                StageStatus::Cached,
                EventType::StageCached,
                format!("Stage '{}' reused from a previous run", name),
            )
        } else {
            (
                StageStatus::Completed,
                EventType::StageCompleted,
                format!("Stage '{}' completed in {}ms", name, duration_ms),
            )
        };

        self.record(
            Event::new(
                self.ctx.run_id,
                Some(name.to_string()),
                event_type,
                key.to_string(),
                summary,
                status,
            )
            .with_duration(duration_ms),
        )
        .await?;

        if cached {
            info!(stage = %name, "Stage reused from previous run");
        } else {
            info!(stage = %name, attempts, duration_ms, "Stage completed");
        }

        self.statuses.insert(name.to_string(), status);
        self.outcomes.insert(
            name.to_string(),
            StageOutcome {
                stage: name.to_string(),
                status,
                attempts,
                duration_ms,
                failure: None,
                skipped_because: None,
                artifacts,
                published,
            },
        );
        Ok(())
    }

    async fn fail(
        &mut self,
        name: &str,
        failure: StageFailure,
        attempts: u32,
        duration_ms: u64,
    ) -> Result<()> {
        error!(stage = %name, attempts, error = %failure.cause, "Stage failed permanently");

        self.record(
            Event::new(
                self.ctx.run_id,
                Some(name.to_string()),
                EventType::StageFailed,
                format!("{}:failed", name),
                format!("Stage '{}' failed after {} attempt(s)", name, attempts),
                StageStatus::Failed,
            )
            .with_duration(duration_ms)
            .with_error(failure.cause.to_string()),
        )
        .await?;

        self.statuses.insert(name.to_string(), StageStatus::Failed);
        self.outcomes.insert(
            name.to_string(),
            StageOutcome {
                stage: name.to_string(),
                status: StageStatus::Failed,
                attempts,
                duration_ms,
                failure: Some(failure),
                skipped_because: None,
                artifacts: Vec::new(),
                published: Vec::new(),
            },
        );

        let graph = self.graph;
        for dependent in graph.transitive_dependents(name) {
            if self.statuses.get(dependent) == Some(&StageStatus::Pending) {
                self.skip(dependent, format!("upstream stage '{}' failed", name))
                    .await?;
            }
        }
        Ok(())
    }

    async fn skip(&mut self, name: &str, reason: String) -> Result<()> {
        info!(stage = %name, %reason, "Skipping stage");

        self.record(Event::new(
            self.ctx.run_id,
            Some(name.to_string()),
            EventType::StageSkipped,
            format!("{}:skipped", name),
            reason.clone(),
            StageStatus::Skipped,
        ))
        .await?;

        self.statuses.insert(name.to_string(), StageStatus::Skipped);
        self.outcomes
            .insert(name.to_string(), StageOutcome::skipped(name, reason));
        Ok(())
    }
}

/// One attempt: fresh working directory, staged inputs, tool run, output check
async fn run_attempt(
    executor: &dyn StageExecutor,
    job: &StageJob,
    inputs: &ResolvedInputs,
) -> Result<Vec<Artifact>, FailureCause> {
    reset_workdir(&job.workdir).await?;
    stage_inputs(&job.workdir, inputs).await?;

    match tokio::time::timeout(job.timeout, executor.execute(job)).await {
        Ok(result) => {
            let output = result?;
            if !output.stderr_tail.is_empty() {
                debug!(stage = %job.stage_name, stderr = %output.stderr_tail, "Stage stderr");
            }
        }
        Err(_) => {
            return Err(FailureCause::TimedOut {
                limit_seconds: job.timeout.as_secs(),
            })
        }
    }

    collect_outputs(&job.stage_name, &job.workdir, &job.outputs)
}

fn staging_error(context: &str, path: &Path, e: std::io::Error) -> FailureCause {
    FailureCause::Staging {
        message: format!("{} {}: {}", context, path.display(), e),
    }
}

async fn reset_workdir(workdir: &Path) -> Result<(), FailureCause> {
    if tokio::fs::metadata(workdir).await.is_ok() {
        tokio::fs::remove_dir_all(workdir)
            .await
            .map_err(|e| staging_error("cannot clear", workdir, e))?;
    }
    tokio::fs::create_dir_all(workdir)
        .await
        .map_err(|e| staging_error("cannot create", workdir, e))
}

/// Link every file of a multi-file input under `<workdir>/<alias>/`
async fn stage_inputs(workdir: &Path, inputs: &ResolvedInputs) -> Result<(), FailureCause> {
    for (alias, resolution) in inputs {
        let Resolution::Paths(files) = resolution else {
            continue;
        };

        let dir = workdir.join(alias);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| staging_error("cannot create", &dir, e))?;

        for file in files {
            let target = workdir.join(staged_path(alias, file));
            if tokio::fs::symlink_metadata(&target).await.is_ok() {
                return Err(FailureCause::Staging {
                    message: format!("two inputs would be staged as {}", target.display()),
                });
            }
            link(file, &target)
                .await
                .map_err(|e| staging_error("cannot stage", file, e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn link(source: &Path, target: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(source, target).await
}

#[cfg(not(unix))]
async fn link(source: &Path, target: &Path) -> std::io::Result<()> {
    tokio::fs::copy(source, target).await.map(|_| ())
}

/// Find the declared outputs of a stage in its working directory
pub fn collect_outputs(
    stage: &str,
    workdir: &Path,
    outputs: &[OutputDecl],
) -> Result<Vec<Artifact>, FailureCause> {
    outputs
        .iter()
        .map(|output| {
            let path = workdir.join(&output.pattern);
            let paths = match output.kind {
                ArtifactKind::FileSet => {
                    let mut matched: Vec<PathBuf> = glob::glob(&path.to_string_lossy())
                        .map(|entries| {
                            entries
                                .filter_map(Result::ok)
                                .filter(|p| p.is_file())
                                .collect()
                        })
                        .unwrap_or_default();
                    matched.sort();
                    matched
                }
                ArtifactKind::Directory if path.is_dir() => vec![path.clone()],
                ArtifactKind::File | ArtifactKind::ZipArchive if path.is_file() => {
                    vec![path.clone()]
                }
                _ => Vec::new(),
            };

            if paths.is_empty() {
                return Err(FailureCause::MissingOutput {
                    output: output.name.clone(),
                    path,
                });
            }
            Ok(Artifact::new(stage, &output.name, output.kind, paths))
        })
        .collect()
}

/// Copy published outputs below the output root
fn publish_outputs(
    outdir: &Path,
    outputs: &[OutputDecl],
    artifacts: &[Artifact],
) -> std::io::Result<Vec<PathBuf>> {
    let mut published = Vec::new();

    for artifact in artifacts {
        let Some(subdir) = outputs
            .iter()
            .find(|o| o.name == artifact.output_name)
            .and_then(|o| o.publish_to.as_ref())
        else {
            continue;
        };

        let dest_dir = outdir.join(subdir);
        std::fs::create_dir_all(&dest_dir)?;

        for path in &artifact.paths {
            let Some(file_name) = path.file_name() else {
                continue;
            };
            let dest = dest_dir.join(file_name);
            copy_tree(path, &dest)?;
            published.push(dest);
        }
    }

    Ok(published)
}

fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    if source.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(source, dest)?;
    }
    Ok(())
}

/// Identity of the inputs beyond the rendered command: file sizes and mtimes
fn fingerprint(inputs: &ResolvedInputs) -> String {
    let mut lines = Vec::new();
    for (alias, resolution) in inputs {
        match resolution {
            Resolution::Path(path) => lines.push(format!("{}={}", alias, file_fingerprint(path))),
            Resolution::Paths(paths) => {
                for path in paths {
                    lines.push(format!("{}={}", alias, file_fingerprint(path)));
                }
            }
            Resolution::Value(value) => lines.push(format!("{}={}", alias, value)),
            Resolution::Absent(sentinel) => lines.push(format!("{}={}", alias, sentinel)),
        }
    }
    lines.join("\n")
}

fn file_fingerprint(path: &Path) -> String {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            format!("{}:{}:{}", path.display(), meta.len(), modified)
        }
        Err(_) => path.display().to_string(),
    }
}
