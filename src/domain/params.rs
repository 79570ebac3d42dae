//! Declared pipeline input parameters and their resolutions.
//!
//! Every input the pipeline accepts is one of the [`ParamName`] variants.
//! A parameter is either resolved to something present (a path, a plain
//! value, a set of matched files) or to a [`Sentinel`] marking it absent.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Literal accepted on the command line for an absent optional file
pub const NO_FILE: &str = "NO_FILE";

/// Literal accepted on the command line for the default contrast set
pub const DEFAULT: &str = "DEFAULT";

/// Marker for a genuinely absent optional input.
///
/// The two literals are unrelated: `DEFAULT` only ever stands in for the
/// contrast table, `NO_FILE` for every other optional file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sentinel {
    /// No file was supplied
    NoFile,

    /// Let the tool fall back to its built-in contrasts
    Default,
}

impl Sentinel {
    /// The literal used on the command line and in summaries
    pub fn literal(&self) -> &'static str {
        match self {
            Self::NoFile => NO_FILE,
            Self::Default => DEFAULT,
        }
    }

    /// Recognize a sentinel literal
    pub fn from_literal(value: &str) -> Option<Self> {
        match value {
            NO_FILE => Some(Self::NoFile),
            DEFAULT => Some(Self::Default),
            _ => None,
        }
    }
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.literal())
    }
}

/// How a supplied value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// A single file or directory that must exist
    Path,

    /// A plain string, never checked against the filesystem
    Value,

    /// A glob pattern that must match at least one file
    Glob,
}

/// When a parameter must be supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Required when the final report is generated, optional otherwise
    Report,

    /// Required whenever metagenomic reads are supplied
    WithReads,

    /// Never required; absent values resolve to the given sentinel
    Optional(Sentinel),
}

/// Every input parameter the pipeline declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamName {
    Rawcounts,
    Metadata,
    Model,
    Contrasts,
    Genelist,
    KeggBlacklist,
    Species,
    ProjectSummary,
    Versions,
    ReportOptions,
    Multiqc,
    ReportTemplate,
    Quote,
    Reads,
    NucleotideDb,
    ProteinDb,
    TaxonomicDb,
}

impl ParamName {
    /// All parameters in declaration order
    pub const ALL: [ParamName; 17] = [
        Self::Rawcounts,
        Self::Metadata,
        Self::Model,
        Self::Contrasts,
        Self::Genelist,
        Self::KeggBlacklist,
        Self::Species,
        Self::ProjectSummary,
        Self::Versions,
        Self::ReportOptions,
        Self::Multiqc,
        Self::ReportTemplate,
        Self::Quote,
        Self::Reads,
        Self::NucleotideDb,
        Self::ProteinDb,
        Self::TaxonomicDb,
    ];

    /// Command-line spelling (without the leading dashes)
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Rawcounts => "rawcounts",
            Self::Metadata => "metadata",
            Self::Model => "model",
            Self::Contrasts => "contrasts",
            Self::Genelist => "genelist",
            Self::KeggBlacklist => "kegg_blacklist",
            Self::Species => "species",
            Self::ProjectSummary => "project_summary",
            Self::Versions => "versions",
            Self::ReportOptions => "report_options",
            Self::Multiqc => "multiqc",
            Self::ReportTemplate => "report_template",
            Self::Quote => "quote",
            Self::Reads => "reads",
            Self::NucleotideDb => "nucleotide_db",
            Self::ProteinDb => "protein_db",
            Self::TaxonomicDb => "taxonomic_db",
        }
    }

    pub fn kind(&self) -> ParamKind {
        match self {
            Self::Species => ParamKind::Value,
            Self::Reads => ParamKind::Glob,
            _ => ParamKind::Path,
        }
    }

    pub fn requirement(&self) -> Requirement {
        match self {
            Self::Contrasts => Requirement::Optional(Sentinel::Default),
            Self::Genelist | Self::KeggBlacklist | Self::ReportTemplate | Self::Reads => {
                Requirement::Optional(Sentinel::NoFile)
            }
            Self::NucleotideDb | Self::ProteinDb | Self::TaxonomicDb => Requirement::WithReads,
            _ => Requirement::Report,
        }
    }

    /// Sentinel used when the parameter is absent but allowed to be
    pub fn sentinel(&self) -> Sentinel {
        match self.requirement() {
            Requirement::Optional(sentinel) => sentinel,
            _ => Sentinel::NoFile,
        }
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag())
    }
}

/// Outcome of resolving one parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Resolution {
    /// An existing file or directory
    Path(PathBuf),

    /// A plain value (e.g. the species name)
    Value(String),

    /// Files matched by a glob pattern, sorted
    Paths(Vec<PathBuf>),

    /// Not supplied; stands in for the missing input
    Absent(Sentinel),
}

impl Resolution {
    pub fn is_present(&self) -> bool {
        !matches!(self, Self::Absent(_))
    }

    /// Human-readable form for run summaries
    pub fn display_value(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Value(value) => value.clone(),
            Self::Paths(paths) => format!("{} file(s)", paths.len()),
            Self::Absent(sentinel) => sentinel.literal().to_string(),
        }
    }
}

/// A parameter together with its resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedParameter {
    pub name: ParamName,
    pub resolution: Resolution,
}
