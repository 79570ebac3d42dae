//! rnadeseq - Differential expression and metagenomics pipeline engine
//!
//! Orchestrates a fixed graph of external bioinformatics tools (DESeq2,
//! pathway enrichment, HUMAnN2 profiling, report rendering) over file-based
//! inputs. The engine itself never touches the science: it resolves inputs,
//! wires stage outputs to stage inputs, builds command lines and runs them.
//!
//! # Architecture
//!
//! - Optional inputs resolve to a real path or a sentinel (`NO_FILE`,
//!   `DEFAULT`); commands omit the flag of an absent input
//! - Stages are nodes of an explicit graph; fan-in stages wait on a barrier
//!   over every upstream stage
//! - Every state change is recorded as an immutable event, which is what
//!   `status`, `runs` and `--resume` read back
//! - A finished run is summarized once and announced on a best-effort basis
//!
//! # Modules
//!
//! - `adapters`: Tool execution and notification channels
//! - `core`: Resolution, graph, materialization, scheduling, completion
//! - `domain`: Data structures (Params, Artifact, Event, Run)
//! - `config`: Configuration file, environment overrides, layout
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Full report
//! rnadeseq run --rawcounts counts.tsv --metadata metadata.tsv --model design.txt \
//!     --species Hsapiens --project_summary summary.tsv --versions versions.txt \
//!     --report_options options.yml --multiqc multiqc.zip --quote quote.pdf
//!
//! # Metagenomic profiling only
//! rnadeseq run --NoReportNeeded --reads 'data/*.fastq.gz' \
//!     --nucleotide_db chocophlan --protein_db uniref --taxonomic_db mpa
//!
//! # Check run status
//! rnadeseq status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{CompletionReporter, RunContext, RunOutcome, RunSummary, Scheduler, StageGraph};
pub use crate::domain::{Event, EventType, Resolution, Run, RunState, Sentinel};
