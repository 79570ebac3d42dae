//! Shared fixtures for the integration tests.
//!
//! `MockExecutor` stands in for the external tools: it records what it was
//! asked to run and writes every declared output into the working directory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rnadeseq::adapters::{ExecutionOutput, StageExecutor, StageJob};
use rnadeseq::config::ResolvedConfig;
use rnadeseq::core::graph::OutputDecl;
use rnadeseq::core::{
    plan, resolve_with_samples, CommandSpec, EventStore, Materializer, RunContext, RunOutcome,
    Scheduler, StageGraph, SuppliedParams,
};
use rnadeseq::domain::{ArtifactKind, FailureCause, ParamName, Run};
use tempfile::TempDir;

/// In-memory executor
#[derive(Default)]
pub struct MockExecutor {
    /// Failures handed out one per attempt, then the stage succeeds
    scripted: Mutex<HashMap<String, VecDeque<FailureCause>>>,
    always_fail: HashMap<String, FailureCause>,
    hanging: HashSet<String>,
    delay: Duration,
    executed: Mutex<Vec<(String, CommandSpec)>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, stage: &str, cause: FailureCause) -> Self {
        self.always_fail.insert(stage.to_string(), cause);
        self
    }

    pub fn failing_once(self, stage: &str, cause: FailureCause) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .entry(stage.to_string())
            .or_default()
            .push_back(cause);
        self
    }

    pub fn hanging(mut self, stage: &str) -> Self {
        self.hanging.insert(stage.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Stage names in the order their attempts started
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|(stage, _)| stage.clone())
            .collect()
    }

    /// Command of the last attempt of a stage
    pub fn command_of(&self, stage: &str) -> Option<CommandSpec> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(s, _)| s == stage)
            .map(|(_, command)| command.clone())
    }

    /// Most attempts observed running at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for MockExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, job: &StageJob) -> Result<ExecutionOutput, FailureCause> {
        self.executed
            .lock()
            .unwrap()
            .push((job.stage_name.clone(), job.command.clone()));

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        if self.hanging.contains(&job.stage_name) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&job.stage_name)
            .and_then(VecDeque::pop_front);
        if let Some(cause) = scripted {
            return Err(cause);
        }
        if let Some(cause) = self.always_fail.get(&job.stage_name) {
            return Err(cause.clone());
        }

        write_outputs(&job.workdir, &job.outputs);
        Ok(ExecutionOutput::default())
    }
}

/// Create every declared output; file sets get a single `result` member
pub fn write_outputs(workdir: &Path, outputs: &[OutputDecl]) {
    for output in outputs {
        let path = workdir.join(output.pattern.replace('*', "result"));
        if output.kind == ArtifactKind::Directory {
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join("ready"), "ok").unwrap();
        } else {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, format!("{}\n", output.name)).unwrap();
        }
    }
}

pub fn exit_status(program: &str, code: i32) -> FailureCause {
    FailureCause::ExitStatus {
        program: program.to_string(),
        code,
        stderr: format!("{} failed", program),
    }
}

/// A temporary project: inputs, output root and work directory
pub struct Fixture {
    pub temp: TempDir,
    pub config: ResolvedConfig,
}

pub struct Executed {
    pub ctx: RunContext,
    pub graph: StageGraph,
    pub outcome: RunOutcome,
    pub store: EventStore,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = ResolvedConfig::rooted_at(temp.path());
        config.retry.initial_delay_ms = 10;
        config.retry.max_delay_ms = 50;
        Self { temp, config }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.temp.path().join("inputs").join(name)
    }

    /// Create an input file and return its path as a parameter value
    pub fn touch(&self, name: &str) -> String {
        let path = self.path(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, name).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// Every input the full report needs
    pub fn report_inputs(&self) -> SuppliedParams {
        SuppliedParams::new()
            .with(ParamName::Rawcounts, self.touch("counts.tsv"))
            .with(ParamName::Metadata, self.touch("metadata.tsv"))
            .with(ParamName::Model, self.touch("design.txt"))
            .with(ParamName::Species, "Hsapiens")
            .with(ParamName::ProjectSummary, self.touch("summary.tsv"))
            .with(ParamName::Versions, self.touch("versions.txt"))
            .with(ParamName::ReportOptions, self.touch("options.yml"))
            .with(ParamName::Multiqc, self.touch("multiqc.zip"))
            .with(ParamName::Quote, self.touch("quote.pdf"))
    }

    /// Paired-end reads for each sample plus the reference databases
    pub fn metagenomic_inputs(&self, samples: &[&str]) -> SuppliedParams {
        self.add_metagenomics(SuppliedParams::new(), samples)
    }

    pub fn add_metagenomics(&self, supplied: SuppliedParams, samples: &[&str]) -> SuppliedParams {
        for id in samples {
            self.touch(&format!("reads/{}_R1.fastq.gz", id));
            self.touch(&format!("reads/{}_R2.fastq.gz", id));
        }
        let pattern = format!("{}/*.fastq.gz", self.path("reads").display());

        supplied
            .with(ParamName::Reads, pattern)
            .with(ParamName::NucleotideDb, self.touch("chocophlan.tar.gz"))
            .with(ParamName::ProteinDb, self.touch("uniref.tar.gz"))
            .with(ParamName::TaxonomicDb, self.touch("mpa_v20"))
    }

    pub async fn run(
        &self,
        supplied: &SuppliedParams,
        report: bool,
        executor: Arc<MockExecutor>,
        resume: Option<Run>,
    ) -> Executed {
        let (params, samples) = resolve_with_samples(supplied, report, false).unwrap();
        let graph = plan(&params, &samples, &self.config).unwrap();
        let ctx = RunContext::new(Some("test_run".to_string()), &params, &samples, &self.config);
        let store = EventStore::open(&ctx.outdir, ctx.run_id).await.unwrap();

        let mut scheduler = Scheduler::new(
            executor,
            Materializer::new(self.config.tools.clone()),
            self.config.retry.clone(),
        );
        if let Some(previous) = resume {
            scheduler = scheduler.with_resume(previous);
        }

        let outcome = scheduler.run(&ctx, &graph, &params, &store).await.unwrap();

        Executed {
            ctx,
            graph,
            outcome,
            store,
        }
    }
}

impl Executed {
    /// The run as rebuilt from its event log
    pub async fn recorded_run(&self) -> Run {
        Run::from_events(&self.store.replay().await.unwrap()).unwrap()
    }
}
