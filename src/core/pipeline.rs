//! The rnadeseq pipeline definition.
//!
//! [`plan`] turns a resolved parameter set into the concrete stage graph:
//! which stages run, how they are wired, and the command each one executes.
//! Stages whose branch is not active are never added to the graph.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ResolvedConfig;
use crate::domain::{ArtifactKind, ParamName, StageFailure};

use super::graph::{Branch, GraphError, InputBinding, OutputDecl, Stage, StageGraph};
use super::materialize::{Arg, CommandTemplate, InvocationTemplate};
use super::resolver::ResolvedParams;
use super::samples::Sample;

pub const SOFTWARE_VERSIONS: &str = "software_versions";
pub const DIFFERENTIAL_EXPRESSION: &str = "differential_expression";
pub const PATHWAY_ENRICHMENT: &str = "pathway_enrichment";
pub const REPORT: &str = "report";
pub const DOCUMENTATION: &str = "documentation";
pub const PREPARE_REFERENCES: &str = "prepare_references";
pub const MERGE_PROFILES: &str = "merge_profiles";
pub const TAXONOMY_VISUALIZATION: &str = "taxonomy_visualization";

/// Version recorded in `v_pipeline.txt`
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the profiling stage of one sample
pub fn profile_stage(sample_id: &str) -> String {
    format!("profile_{}", sample_id)
}

/// Retry policy for failed stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Tool exit codes worth another attempt (killed for memory or time)
    #[serde(default = "default_retry_on_exit_codes")]
    pub retry_on_exit_codes: Vec<i32>,
}

fn default_max_attempts() -> u32 {
    2
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_retry_on_exit_codes() -> Vec<i32> {
    vec![137, 143]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            retry_on_exit_codes: default_retry_on_exit_codes(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Whether a failed attempt qualifies for another one
    pub fn retries(&self, failure: &StageFailure, attempt: u32) -> bool {
        self.should_retry(attempt) && failure.is_retryable(&self.retry_on_exit_codes)
    }
}

/// Build the stage graph for a resolved parameter set
pub fn plan(
    params: &ResolvedParams,
    samples: &[Sample],
    config: &ResolvedConfig,
) -> Result<StageGraph, GraphError> {
    let report_mode = params.mode().report;
    let mut stages = Vec::new();

    if report_mode {
        stages.push(software_versions(config));
    }

    let expression = [ParamName::Rawcounts, ParamName::Metadata, ParamName::Model]
        .into_iter()
        .all(|p| params.is_present(p));
    let pathway = expression && params.is_present(ParamName::Species);

    if expression {
        stages.push(differential_expression(config));
    }
    if pathway {
        stages.push(pathway_enrichment(config));
    }

    if report_mode {
        if pathway {
            stages.push(report(config));
        }
        stages.push(documentation(config));
    }

    let references = [
        ParamName::NucleotideDb,
        ParamName::ProteinDb,
        ParamName::TaxonomicDb,
    ]
    .into_iter()
    .all(|p| params.is_present(p));

    if !samples.is_empty() && references {
        stages.push(prepare_references());
        for sample in samples {
            stages.push(profile(sample, config));
        }
        let profiles: Vec<String> = samples.iter().map(|s| profile_stage(&s.id)).collect();
        stages.push(merge_profiles(profiles.clone()));
        stages.push(taxonomy_visualization(profiles));
    }

    debug!(
        stages = stages.len(),
        report = report_mode,
        samples = samples.len(),
        "Planned pipeline"
    );

    StageGraph::new(stages)
}

fn script(config: &ResolvedConfig, name: &str) -> String {
    config.script(name).to_string_lossy().into_owned()
}

fn software_versions(config: &ResolvedConfig) -> Stage {
    Stage::new(SOFTWARE_VERSIONS, Branch::Report)
        .output(
            OutputDecl::new(
                "software_versions",
                ArtifactKind::File,
                "software_versions_mqc.yaml",
            )
            .published("pipeline_info"),
        )
        .command(
            CommandTemplate::new()
                .then(
                    InvocationTemplate::new("echo")
                        .lits([PIPELINE_VERSION])
                        .stdout_to("v_pipeline.txt"),
                )
                .then(
                    InvocationTemplate::new("Rscript")
                        .lits(["-e", "write(x=R.version.string, file='v_R.txt')"]),
                )
                .then(InvocationTemplate::new("Rscript").lits([
                    "-e",
                    "write(x=as.character(packageVersion('DESeq2')), file='v_deseq2.txt')",
                ]))
                .then(
                    InvocationTemplate::new(script(config, "scrape_software_versions.py"))
                        .stdout_to("software_versions_mqc.yaml"),
                ),
        )
}

fn differential_expression(config: &ResolvedConfig) -> Stage {
    Stage::new(DIFFERENTIAL_EXPRESSION, Branch::Expression)
        .bind(InputBinding::param("counts", ParamName::Rawcounts))
        .bind(InputBinding::param("metadata", ParamName::Metadata))
        .bind(InputBinding::param("model", ParamName::Model))
        .bind(InputBinding::param("contrasts", ParamName::Contrasts))
        .bind(InputBinding::param("genelist", ParamName::Genelist))
        .output(
            OutputDecl::new(
                "deseq2_archive",
                ArtifactKind::ZipArchive,
                "differential_gene_expression.zip",
            )
            .published("differential_gene_expression"),
        )
        .output(OutputDecl::new(
            "de_tables",
            ArtifactKind::FileSet,
            "differential_gene_expression/DE_genes_tables/*.tsv",
        ))
        .output(OutputDecl::new(
            "rlog_counts",
            ArtifactKind::File,
            "differential_gene_expression/gene_counts_tables/rlog_transformed_gene_counts.tsv",
        ))
        .command(
            CommandTemplate::new()
                .then(
                    InvocationTemplate::new("Rscript")
                        .lits([script(config, "DESeq2.R")])
                        .arg(Arg::flag("--counts", "counts"))
                        .arg(Arg::flag("--metadata", "metadata"))
                        .arg(Arg::flag("--design", "model"))
                        .arg(Arg::optional_flag("--contrasts", "contrasts"))
                        .arg(Arg::optional_flag("--genelist", "genelist"))
                        .lits([
                            "--logFCthreshold".to_string(),
                            config.analysis.logfc_threshold.to_string(),
                        ]),
                )
                .then(InvocationTemplate::new("zip").lits([
                    "-r",
                    "differential_gene_expression.zip",
                    "differential_gene_expression",
                ])),
        )
}

fn pathway_enrichment(config: &ResolvedConfig) -> Stage {
    Stage::new(PATHWAY_ENRICHMENT, Branch::Expression)
        .bind(InputBinding::upstream(
            "de_tables",
            DIFFERENTIAL_EXPRESSION,
            "de_tables",
        ))
        .bind(InputBinding::upstream(
            "rlog_counts",
            DIFFERENTIAL_EXPRESSION,
            "rlog_counts",
        ))
        .bind(InputBinding::param("metadata", ParamName::Metadata))
        .bind(InputBinding::param("model", ParamName::Model))
        .bind(InputBinding::param("species", ParamName::Species))
        .bind(InputBinding::param("genelist", ParamName::Genelist))
        .bind(InputBinding::param("kegg_blacklist", ParamName::KeggBlacklist))
        .output(
            OutputDecl::new(
                "pathway_archive",
                ArtifactKind::ZipArchive,
                "pathway_analysis.zip",
            )
            .published("pathway_analysis"),
        )
        .command(
            CommandTemplate::new()
                .then(
                    InvocationTemplate::new("Rscript")
                        .lits([script(config, "pathway_analysis.R")])
                        .arg(Arg::flag("--dirContrasts", "de_tables"))
                        .arg(Arg::flag("--metadata", "metadata"))
                        .arg(Arg::flag("--model", "model"))
                        .arg(Arg::flag("--normCounts", "rlog_counts"))
                        .arg(Arg::flag("--species", "species"))
                        .arg(Arg::optional_flag("--genelist", "genelist"))
                        .arg(Arg::optional_flag("--kegg_blacklist", "kegg_blacklist"))
                        .lits([
                            "--min_DEG_pathway".to_string(),
                            config.analysis.min_deg_pathway.to_string(),
                        ]),
                )
                .then(InvocationTemplate::new("zip").lits([
                    "-r",
                    "pathway_analysis.zip",
                    "pathway_analysis",
                ])),
        )
}

fn report(config: &ResolvedConfig) -> Stage {
    Stage::new(REPORT, Branch::Report)
        .bind(InputBinding::upstream(
            "deseq2_archive",
            DIFFERENTIAL_EXPRESSION,
            "deseq2_archive",
        ))
        .bind(InputBinding::upstream(
            "pathway_archive",
            PATHWAY_ENRICHMENT,
            "pathway_archive",
        ))
        .bind(InputBinding::upstream(
            "software_versions",
            SOFTWARE_VERSIONS,
            "software_versions",
        ))
        .bind(InputBinding::param("multiqc", ParamName::Multiqc))
        .bind(InputBinding::param("versions", ParamName::Versions))
        .bind(InputBinding::param("project_summary", ParamName::ProjectSummary))
        .bind(InputBinding::param("report_options", ParamName::ReportOptions))
        .bind(InputBinding::param("model", ParamName::Model))
        .bind(InputBinding::param("quote", ParamName::Quote))
        .bind(InputBinding::param("contrasts", ParamName::Contrasts))
        .bind(InputBinding::param("genelist", ParamName::Genelist))
        .bind(InputBinding::param("report_template", ParamName::ReportTemplate))
        .output(
            OutputDecl::new("report_archive", ArtifactKind::ZipArchive, "report.zip")
                .published("report"),
        )
        .command(
            CommandTemplate::new()
                .then(
                    InvocationTemplate::new("unzip")
                        .lits(["-o"])
                        .arg(Arg::input("deseq2_archive")),
                )
                .then(
                    InvocationTemplate::new("unzip")
                        .lits(["-o"])
                        .arg(Arg::input("multiqc")),
                )
                .then(
                    InvocationTemplate::new("unzip")
                        .lits(["-o"])
                        .arg(Arg::input("pathway_archive")),
                )
                .then(InvocationTemplate::new("mkdir").lits(["-p", "QC"]))
                .then(InvocationTemplate::new("mv").lits([
                    "MultiQC/multiqc_plots",
                    "MultiQC/multiqc_data",
                    "MultiQC/multiqc_report.html",
                    "QC/",
                ]))
                .then(
                    InvocationTemplate::new("Rscript")
                        .lits([script(config, "Execute_report.R")])
                        .arg(Arg::optional_flag("--report", "report_template"))
                        .lits(["--output", "RNAseq_report.html"])
                        .arg(Arg::flag("--proj_summary", "project_summary"))
                        .arg(Arg::flag("--versions", "versions"))
                        .arg(Arg::flag("--pipeline_versions", "software_versions"))
                        .arg(Arg::flag("--model", "model"))
                        .arg(Arg::flag("--config", "report_options"))
                        .arg(Arg::flag("--quote", "quote"))
                        .arg(Arg::optional_flag("--contrasts", "contrasts"))
                        .arg(Arg::optional_flag("--genelist", "genelist")),
                )
                .then(InvocationTemplate::new("zip").lits([
                    "-r",
                    "report.zip",
                    "RNAseq_report.html",
                    "differential_gene_expression",
                    "QC",
                    "pathway_analysis",
                ]))
                .then(
                    InvocationTemplate::new("zip")
                        .lits(["-j", "report.zip"])
                        .arg(Arg::input("quote")),
                ),
        )
}

fn documentation(config: &ResolvedConfig) -> Stage {
    let output_docs = config.docs_dir.join("output.md");
    Stage::new(DOCUMENTATION, Branch::Report)
        .output(
            OutputDecl::new(
                "results_description",
                ArtifactKind::File,
                "results_description.html",
            )
            .published("Documentation"),
        )
        .command(
            CommandTemplate::new().then(
                InvocationTemplate::new(script(config, "markdown_to_html.py")).lits([
                    output_docs.to_string_lossy().into_owned(),
                    "-o".to_string(),
                    "results_description.html".to_string(),
                ]),
            ),
        )
}

fn prepare_references() -> Stage {
    Stage::new(PREPARE_REFERENCES, Branch::Metagenomics)
        .bind(InputBinding::param("nucleotide_db", ParamName::NucleotideDb))
        .bind(InputBinding::param("protein_db", ParamName::ProteinDb))
        .output(OutputDecl::new(
            "reference_db",
            ArtifactKind::Directory,
            "humann2_db",
        ))
        .command(
            CommandTemplate::new()
                .then(InvocationTemplate::new("mkdir").lits([
                    "-p",
                    "humann2_db/chocophlan",
                    "humann2_db/uniref",
                ]))
                .then(
                    InvocationTemplate::new("tar")
                        .lits(["-xzf"])
                        .arg(Arg::input("nucleotide_db"))
                        .lits(["-C", "humann2_db/chocophlan"]),
                )
                .then(
                    InvocationTemplate::new("tar")
                        .lits(["-xzf"])
                        .arg(Arg::input("protein_db"))
                        .lits(["-C", "humann2_db/uniref"]),
                ),
        )
}

fn profile(sample: &Sample, config: &ResolvedConfig) -> Stage {
    let id = sample.id.as_str();
    let mut command = CommandTemplate::new();

    // humann2 takes a single input file; mates are concatenated first
    let input = if sample.is_paired() {
        let merged = format!("{}.fastq.gz", id);
        command = command.then(
            InvocationTemplate::new("cat")
                .arg(Arg::each("reads", "{path}"))
                .stdout_to(merged.clone()),
        );
        Arg::lit(merged)
    } else {
        Arg::each("reads", "{path}")
    };

    command = command
        .then(
            InvocationTemplate::new("humann2")
                .lits(["--input"])
                .arg(input)
                .lits(["--output", ".", "--output-basename", id])
                .lits(["--nucleotide-database"])
                .arg(Arg::format("reference_db", "{value}/chocophlan"))
                .lits(["--protein-database"])
                .arg(Arg::format("reference_db", "{value}/uniref"))
                .lits(["--metaphlan-options"])
                .arg(Arg::format("taxonomic_db", "--bowtie2db {value}"))
                .lits(["--threads".to_string(), config.limits.max_cpus.to_string()]),
        )
        .then(InvocationTemplate::new("metaphlan2krona.py").lits([
            "-p".to_string(),
            format!("{id}_humann2_temp/{id}_metaphlan_bugs_list.tsv"),
            "-k".to_string(),
            format!("{id}.krona.txt"),
        ]));

    Stage::new(profile_stage(id), Branch::Metagenomics)
        .bind(InputBinding::files("reads", sample.reads.clone()))
        .bind(InputBinding::upstream(
            "reference_db",
            PREPARE_REFERENCES,
            "reference_db",
        ))
        .bind(InputBinding::param("taxonomic_db", ParamName::TaxonomicDb))
        .output(OutputDecl::new(
            "genefamilies",
            ArtifactKind::File,
            format!("{id}_genefamilies.tsv"),
        ))
        .output(OutputDecl::new(
            "pathabundance",
            ArtifactKind::File,
            format!("{id}_pathabundance.tsv"),
        ))
        .output(OutputDecl::new(
            "pathcoverage",
            ArtifactKind::File,
            format!("{id}_pathcoverage.tsv"),
        ))
        .output(OutputDecl::new(
            "krona",
            ArtifactKind::File,
            format!("{id}.krona.txt"),
        ))
        .command(command)
}

fn merge_profiles(profiles: Vec<String>) -> Stage {
    let tables = ["genefamilies", "pathabundance", "pathcoverage"];
    let mut stage = Stage::new(MERGE_PROFILES, Branch::Metagenomics);
    let mut command = CommandTemplate::new();

    for table in tables {
        stage = stage.bind(InputBinding::collect(table, profiles.clone(), table));
        command = command.then(
            InvocationTemplate::new("humann2_join_tables")
                .lits(["--input"])
                .arg(Arg::input(table))
                .lits([
                    "--output".to_string(),
                    format!("{table}.tsv"),
                    "--file_name".to_string(),
                    table.to_string(),
                ]),
        );
    }

    for table in ["genefamilies", "pathabundance"] {
        command = command.then(InvocationTemplate::new("humann2_renorm_table").lits([
            "--input".to_string(),
            format!("{table}.tsv"),
            "--output".to_string(),
            format!("{table}_relab.tsv"),
            "--units".to_string(),
            "relab".to_string(),
        ]));
    }

    command = command.then(InvocationTemplate::new("zip").lits([
        "metagenomics_tables.zip",
        "genefamilies.tsv",
        "pathabundance.tsv",
        "pathcoverage.tsv",
        "genefamilies_relab.tsv",
        "pathabundance_relab.tsv",
    ]));

    stage
        .output(
            OutputDecl::new(
                "tables_archive",
                ArtifactKind::ZipArchive,
                "metagenomics_tables.zip",
            )
            .published("metagenomics"),
        )
        .command(command)
}

fn taxonomy_visualization(profiles: Vec<String>) -> Stage {
    Stage::new(TAXONOMY_VISUALIZATION, Branch::Metagenomics)
        .bind(InputBinding::collect("krona", profiles, "krona"))
        .output(
            OutputDecl::new("taxonomy_page", ArtifactKind::File, "taxonomy.html")
                .published("metagenomics"),
        )
        .command(
            CommandTemplate::new().then(
                InvocationTemplate::new("ktImportText")
                    .lits(["-o", "taxonomy.html"])
                    .arg(Arg::each("krona", "{path},{stem}")),
            ),
        )
}
