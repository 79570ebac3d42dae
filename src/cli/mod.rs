//! Command-line interface for rnadeseq.
//!
//! Provides commands for running the pipeline, validating inputs, showing
//! the planned stage graph, checking run status and listing past runs.
//! Parameter flags keep the pipeline's historical spelling (`--rawcounts`,
//! `--NoReportNeeded`, `--single_end`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::ProcessExecutor;
use crate::config::{self, ResolvedConfig};
use crate::core::{
    plan, resolve_with_samples, CompletionReporter, EventStore, Materializer, ResolvedParams,
    RunContext, RunLock, RunSummary, Sample, Scheduler, StageGraph, SuppliedParams,
};
use crate::domain::{ParamName, Run, StageStatus};

/// rnadeseq - Differential expression and metagenomics pipeline engine
#[derive(Parser, Debug)]
#[command(name = "rnadeseq")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: .rnadeseq/config.yaml in this or a parent directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline
    Run {
        #[command(flatten)]
        inputs: InputArgs,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Check the inputs without running anything
    Validate {
        #[command(flatten)]
        inputs: InputArgs,
    },

    /// Show the stages a run with these inputs would execute
    Plan {
        #[command(flatten)]
        inputs: InputArgs,

        /// Print the stage graph as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,

        /// Output root the run published into
        #[arg(long)]
        outdir: Option<PathBuf>,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Output root to look in
        #[arg(long)]
        outdir: Option<PathBuf>,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Pipeline input parameters
#[derive(Args, Debug, Clone, Default)]
pub struct InputArgs {
    /// Raw count table
    #[arg(long)]
    pub rawcounts: Option<String>,

    /// Sample metadata table
    #[arg(long)]
    pub metadata: Option<String>,

    /// Linear model (design) file
    #[arg(long)]
    pub model: Option<String>,

    /// Contrast table (DEFAULT: all pairwise contrasts)
    #[arg(long)]
    pub contrasts: Option<String>,

    /// Genes of interest (NO_FILE when absent)
    #[arg(long)]
    pub genelist: Option<String>,

    /// KEGG pathways to exclude (NO_FILE when absent)
    #[arg(long = "kegg_blacklist")]
    pub kegg_blacklist: Option<String>,

    /// Species name, e.g. Hsapiens
    #[arg(long)]
    pub species: Option<String>,

    /// Project summary table
    #[arg(long = "project_summary")]
    pub project_summary: Option<String>,

    /// Tool versions of the upstream processing
    #[arg(long)]
    pub versions: Option<String>,

    /// Report rendering options
    #[arg(long = "report_options")]
    pub report_options: Option<String>,

    /// Zipped MultiQC report of the upstream QC
    #[arg(long)]
    pub multiqc: Option<String>,

    /// Custom report template (NO_FILE when absent)
    #[arg(long = "report_template")]
    pub report_template: Option<String>,

    /// Offer / quote document
    #[arg(long)]
    pub quote: Option<String>,

    /// Metagenomic reads, a glob pattern
    #[arg(long)]
    pub reads: Option<String>,

    /// HUMAnN2 nucleotide database archive
    #[arg(long = "nucleotide_db")]
    pub nucleotide_db: Option<String>,

    /// HUMAnN2 protein database archive
    #[arg(long = "protein_db")]
    pub protein_db: Option<String>,

    /// MetaPhlAn2 taxonomic database archive
    #[arg(long = "taxonomic_db")]
    pub taxonomic_db: Option<String>,

    /// Skip the final report; report inputs become optional
    #[arg(long = "NoReportNeeded")]
    pub no_report_needed: bool,

    /// Reads are single-end
    #[arg(long = "single_end")]
    pub single_end: bool,
}

impl InputArgs {
    fn value(&self, name: ParamName) -> Option<&String> {
        match name {
            ParamName::Rawcounts => self.rawcounts.as_ref(),
            ParamName::Metadata => self.metadata.as_ref(),
            ParamName::Model => self.model.as_ref(),
            ParamName::Contrasts => self.contrasts.as_ref(),
            ParamName::Genelist => self.genelist.as_ref(),
            ParamName::KeggBlacklist => self.kegg_blacklist.as_ref(),
            ParamName::Species => self.species.as_ref(),
            ParamName::ProjectSummary => self.project_summary.as_ref(),
            ParamName::Versions => self.versions.as_ref(),
            ParamName::ReportOptions => self.report_options.as_ref(),
            ParamName::Multiqc => self.multiqc.as_ref(),
            ParamName::ReportTemplate => self.report_template.as_ref(),
            ParamName::Quote => self.quote.as_ref(),
            ParamName::Reads => self.reads.as_ref(),
            ParamName::NucleotideDb => self.nucleotide_db.as_ref(),
            ParamName::ProteinDb => self.protein_db.as_ref(),
            ParamName::TaxonomicDb => self.taxonomic_db.as_ref(),
        }
    }

    /// Values as supplied on the command line
    pub fn supplied(&self) -> SuppliedParams {
        let mut supplied = SuppliedParams::new();
        for name in ParamName::ALL {
            if let Some(value) = self.value(name) {
                supplied.set(name, value.as_str());
            }
        }
        supplied
    }

    pub fn report(&self) -> bool {
        !self.no_report_needed
    }
}

/// Run-level overrides of the configuration
#[derive(Args, Debug, Clone, Default)]
pub struct RunOptions {
    /// Output root
    #[arg(long)]
    pub outdir: Option<PathBuf>,

    /// Root of the stage working directories
    #[arg(long = "work_dir")]
    pub work_dir: Option<PathBuf>,

    /// Send the run summary to this address
    #[arg(long)]
    pub email: Option<String>,

    /// Send the run summary to this address only if the run failed
    #[arg(long = "email_on_fail")]
    pub email_on_fail: Option<String>,

    /// Send plain-text email only
    #[arg(long = "plaintext_email")]
    pub plaintext_email: bool,

    /// Reuse completed stages of an earlier run (run ID)
    #[arg(long)]
    pub resume: Option<String>,

    /// Run name shown in summaries
    #[arg(long)]
    pub name: Option<String>,

    /// Threads handed to multi-threaded tools
    #[arg(long = "max_cpus")]
    pub max_cpus: Option<u32>,

    /// Memory available to a stage, e.g. 16.GB
    #[arg(long = "max_memory")]
    pub max_memory: Option<String>,

    /// Stages running at once
    #[arg(long = "max_workers")]
    pub max_workers: Option<usize>,
}

impl RunOptions {
    /// Command-line flags take precedence over file and environment
    pub fn apply(&self, config: &mut ResolvedConfig) {
        if let Some(outdir) = &self.outdir {
            config.outdir = outdir.clone();
        }
        if let Some(work_dir) = &self.work_dir {
            config.work_dir = work_dir.clone();
        }
        if let Some(email) = &self.email {
            config.notification.email = Some(email.clone());
        }
        if let Some(email) = &self.email_on_fail {
            config.notification.email_on_fail = Some(email.clone());
        }
        if self.plaintext_email {
            config.notification.plaintext_email = true;
        }
        if let Some(cpus) = self.max_cpus {
            config.limits.max_cpus = cpus;
        }
        if let Some(memory) = &self.max_memory {
            config.limits.max_memory = memory.clone();
        }
        if let Some(workers) = self.max_workers {
            config.limits.max_workers = workers;
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config_path = self.config.as_deref();

        match self.command {
            Commands::Run { inputs, options } => run_pipeline(config_path, &inputs, &options).await,
            Commands::Validate { inputs } => validate(config_path, &inputs),
            Commands::Plan { inputs, json } => show_plan(config_path, &inputs, json),
            Commands::Status { run_id, outdir } => {
                show_status(config_path, &run_id, outdir).await
            }
            Commands::Runs { limit, outdir } => list_runs(config_path, limit, outdir).await,
            Commands::Config => show_config(config_path),
        }
    }
}

/// Resolve every parameter and group the reads, reporting all problems at once
pub fn resolve_inputs(inputs: &InputArgs) -> Result<(ResolvedParams, Vec<Sample>)> {
    Ok(resolve_with_samples(
        &inputs.supplied(),
        inputs.report(),
        inputs.single_end,
    )?)
}

fn prepare(
    config_path: Option<&Path>,
    inputs: &InputArgs,
) -> Result<(ResolvedConfig, ResolvedParams, Vec<Sample>, StageGraph)> {
    let config = config::load_config(config_path)?;
    let (params, samples) = resolve_inputs(inputs)?;
    let graph = plan(&params, &samples, &config).context("Failed to plan the stage graph")?;
    Ok((config, params, samples, graph))
}

/// Run the pipeline with the given inputs
async fn run_pipeline(
    config_path: Option<&Path>,
    inputs: &InputArgs,
    options: &RunOptions,
) -> Result<()> {
    let mut config = config::load_config(config_path)?;
    options.apply(&mut config);

    let (params, samples) = resolve_inputs(inputs)?;
    let graph = plan(&params, &samples, &config).context("Failed to plan the stage graph")?;
    if graph.is_empty() {
        anyhow::bail!("Nothing to run: the supplied inputs enable no pipeline stage");
    }

    let ctx = RunContext::new(options.name.clone(), &params, &samples, &config);
    let lock = RunLock::acquire(&ctx.outdir)?;

    let mut scheduler = Scheduler::new(
        Arc::new(ProcessExecutor::new(&config.limits)),
        Materializer::new(config.tools.clone()),
        config.retry.clone(),
    );
    if let Some(previous) = &options.resume {
        let previous = load_run(&ctx.outdir, previous).await?;
        eprintln!("[Resuming from run {} ({})]", previous.id, previous.name);
        scheduler = scheduler.with_resume(previous);
    }

    let store = EventStore::open(&ctx.outdir, ctx.run_id).await?;
    let summary = RunSummary::start(&ctx);
    eprintln!(
        "[Run {} '{}': {} stage(s)]",
        ctx.run_id,
        ctx.run_name,
        graph.len()
    );

    let outcome = scheduler.run(&ctx, &graph, &params, &store).await?;

    let reporter = CompletionReporter::from_settings(&config.notification);
    reporter.complete(&ctx, summary, &outcome).await;
    drop(lock);

    for (name, stage) in &outcome.stages {
        println!("  {:<28} {}", name, status_label(stage.status));
    }

    if outcome.success() {
        eprintln!("\n[Run {} completed successfully]", ctx.run_id);
        eprintln!("Results: {}", ctx.outdir.display());
        return Ok(());
    }

    for failure in outcome.failures() {
        eprintln!("\n{}", failure);
    }
    if outcome.time_limit_reached {
        eprintln!("\n[Run {} stopped: run time limit reached]", ctx.run_id);
    } else {
        eprintln!("\n[Run {} failed]", ctx.run_id);
    }
    std::process::exit(1);
}

fn status_label(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Pending => "pending",
        StageStatus::Running => "running",
        StageStatus::Completed => "completed",
        StageStatus::Cached => "cached",
        StageStatus::Failed => "FAILED",
        StageStatus::Skipped => "skipped",
    }
}

/// Validate inputs and print how each one resolved
fn validate(config_path: Option<&Path>, inputs: &InputArgs) -> Result<()> {
    let (_, params, samples, graph) = prepare(config_path, inputs)?;

    println!("Inputs:");
    for (name, resolution) in params.iter() {
        println!("  --{:<18} {}", name.flag(), resolution.display_value());
    }
    if !samples.is_empty() {
        println!("\nSamples:");
        for sample in &samples {
            println!(
                "  {:<18} {}",
                sample.id,
                if sample.is_paired() { "paired-end" } else { "single-end" }
            );
        }
    }
    println!("\n[Inputs valid: {} stage(s) planned]", graph.len());

    Ok(())
}

/// Print the planned stages in execution order
fn show_plan(config_path: Option<&Path>, inputs: &InputArgs, json: bool) -> Result<()> {
    let (_, _, _, graph) = prepare(config_path, inputs)?;

    if json {
        let stages: Vec<_> = graph.stages().collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&stages).context("Failed to serialize stage graph")?
        );
        return Ok(());
    }

    println!("{:<28} {:<14} {}", "STAGE", "BRANCH", "WAITS ON");
    println!("{}", "-".repeat(75));
    for name in graph.topological_order() {
        let Some(stage) = graph.stage(name) else {
            continue;
        };
        let upstream = graph.upstream(name);
        println!(
            "{:<28} {:<14} {}",
            name,
            format!("{:?}", stage.branch).to_lowercase(),
            if upstream.is_empty() {
                "-".to_string()
            } else {
                upstream.join(", ")
            }
        );
    }

    Ok(())
}

fn outdir_or_config(config_path: Option<&Path>, outdir: Option<PathBuf>) -> Result<PathBuf> {
    match outdir {
        Some(outdir) => Ok(outdir),
        None => Ok(config::load_config(config_path)?.outdir),
    }
}

/// Rebuild a recorded run from its event log
async fn load_run(outdir: &Path, run_id_str: &str) -> Result<Run> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let store = EventStore::open_existing(outdir, run_id).await?;
    let events = store.replay().await?;
    Run::from_events(&events).with_context(|| format!("Run {} has no events", run_id))
}

/// Show the status of a run
async fn show_status(
    config_path: Option<&Path>,
    run_id_str: &str,
    outdir: Option<PathBuf>,
) -> Result<()> {
    let outdir = outdir_or_config(config_path, outdir)?;
    let run = load_run(&outdir, run_id_str).await?;

    println!("Run ID: {}", run.id);
    println!("Name: {}", run.name);
    println!("State: {}", run.state.label());
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    match &run.state {
        crate::domain::RunState::Failed { error } => println!("Error: {}", error),
        crate::domain::RunState::TimeLimitReached { limit } => println!("Limit: {}", limit),
        _ => {}
    }
    println!("\nStage statuses:");
    for (stage, status) in &run.stage_statuses {
        println!("  {}: {}", stage, status_label(*status));
    }

    Ok(())
}

/// List recent runs, newest first
async fn list_runs(config_path: Option<&Path>, limit: usize, outdir: Option<PathBuf>) -> Result<()> {
    let outdir = outdir_or_config(config_path, outdir)?;

    let mut runs = Vec::new();
    for run_id in EventStore::list_runs(&outdir).await? {
        let store = EventStore::open_existing(&outdir, run_id).await?;
        if let Some(run) = Run::from_events(&store.replay().await?) {
            runs.push(run);
        }
    }

    if runs.is_empty() {
        println!("No runs found in {}", outdir.display());
        return Ok(());
    }

    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    println!("{:<38} {:<24} {:<12} {}", "RUN ID", "NAME", "STATE", "STARTED");
    println!("{}", "-".repeat(100));

    for run in runs.into_iter().take(limit) {
        println!(
            "{:<38} {:<24} {:<12} {}",
            run.id,
            run.name,
            run.state.label(),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Show resolved configuration
fn show_config(config_path: Option<&Path>) -> Result<()> {
    let cfg = config::load_config(config_path)?;

    println!("rnadeseq configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Output root:  {}", cfg.outdir.display());
    println!("  Work dir:     {}", cfg.work_dir.display());
    println!("  Scripts:      {}", cfg.scripts_dir.display());
    println!("  Docs:         {}", cfg.docs_dir.display());
    println!("  Runs:         {}", config::paths::runs_dir(&cfg.outdir).display());
    println!();
    println!("Limits:");
    println!("  Max workers:    {}", cfg.limits.max_workers);
    println!("  Max CPUs:       {}", cfg.limits.max_cpus);
    println!("  Max memory:     {}", cfg.limits.max_memory);
    println!("  Stage timeout:  {}s", cfg.limits.stage_timeout_seconds);
    println!("  Run timeout:    {}s", cfg.limits.run_timeout_seconds);
    println!();
    println!("Retry:");
    println!("  Max attempts:   {}", cfg.retry.max_attempts);
    println!("  Retry on exit:  {:?}", cfg.retry.retry_on_exit_codes);
    println!();
    println!("Tools:");
    if cfg.tools.is_empty() {
        println!("  (using PATH)");
    } else {
        for (name, program) in &cfg.tools {
            println!("  {}: {}", name, program);
        }
    }
    println!();
    println!("Notification:");
    println!("  Email:          {}", cfg.notification.email.as_deref().unwrap_or("-"));
    println!(
        "  Email on fail:  {}",
        cfg.notification.email_on_fail.as_deref().unwrap_or("-")
    );
    println!("  Plain text:     {}", cfg.notification.plaintext_email);
    println!(
        "  Webhook:        {}",
        cfg.notification.webhook_url.as_deref().unwrap_or("-")
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::InputValidationError;
    use crate::domain::{Resolution, Sentinel};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("rnadeseq").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_historical_flag_spelling() {
        let cli = parse(&[
            "run",
            "--NoReportNeeded",
            "--single_end",
            "--reads",
            "data/*.fastq.gz",
            "--kegg_blacklist",
            "blacklist.txt",
            "--max_workers",
            "2",
            "--email_on_fail",
            "oncall@example.org",
        ]);

        match cli.command {
            Commands::Run { inputs, options } => {
                assert!(inputs.no_report_needed);
                assert!(inputs.single_end);
                assert_eq!(inputs.kegg_blacklist.as_deref(), Some("blacklist.txt"));
                assert_eq!(options.max_workers, Some(2));
                assert_eq!(options.email_on_fail.as_deref(), Some("oncall@example.org"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_supplied_maps_every_flag() {
        let inputs = InputArgs {
            species: Some("Mmusculus".to_string()),
            contrasts: Some("DEFAULT".to_string()),
            ..Default::default()
        };
        let supplied = inputs.supplied();

        assert_eq!(supplied.get(ParamName::Species), Some("Mmusculus"));
        assert_eq!(supplied.get(ParamName::Contrasts), Some("DEFAULT"));
        assert_eq!(supplied.get(ParamName::Rawcounts), None);
    }

    #[test]
    fn test_resolve_inputs_aggregates_problems() {
        let err = resolve_inputs(&InputArgs::default()).unwrap_err();
        let validation = err.downcast_ref::<InputValidationError>().unwrap();
        assert!(validation.missing().contains(&ParamName::Rawcounts));
        assert!(validation.missing().contains(&ParamName::Quote));

        let (params, samples) = resolve_inputs(&InputArgs {
            no_report_needed: true,
            ..Default::default()
        })
        .unwrap();
        assert!(samples.is_empty());
        assert_eq!(
            params.get(ParamName::Contrasts),
            &Resolution::Absent(Sentinel::Default)
        );
    }

    #[test]
    fn test_run_options_override_config() {
        let mut config = ResolvedConfig::rooted_at(Path::new("/project"));
        let options = RunOptions {
            outdir: Some(PathBuf::from("/scratch/out")),
            plaintext_email: true,
            max_cpus: Some(8),
            ..Default::default()
        };
        options.apply(&mut config);

        assert_eq!(config.outdir, PathBuf::from("/scratch/out"));
        assert_eq!(config.work_dir, PathBuf::from("/project/work"));
        assert!(config.notification.plaintext_email);
        assert_eq!(config.limits.max_cpus, 8);
    }
}
