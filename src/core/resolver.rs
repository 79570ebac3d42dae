//! Input resolution.
//!
//! Turns the values supplied on the command line into [`Resolution`]s:
//! present paths are checked for existence, absent optional inputs become
//! sentinels, and every problem found is collected into one aggregated
//! [`InputValidationError`] so the user sees all of them at once.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::samples::{group_samples, Sample};
use crate::domain::{ParamKind, ParamName, Requirement, Resolution, ResolvedParameter, Sentinel};

/// Which requirement classes are active for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolutionMode {
    /// The final report is generated (`--NoReportNeeded` not set)
    pub report: bool,

    /// Metagenomic reads were supplied
    pub metagenomics: bool,
}

impl ResolutionMode {
    pub fn new(report: bool, metagenomics: bool) -> Self {
        Self {
            report,
            metagenomics,
        }
    }

    /// Whether a parameter must be supplied under this mode
    pub fn is_required(&self, name: ParamName) -> bool {
        match name.requirement() {
            Requirement::Report => self.report,
            Requirement::WithReads => self.metagenomics,
            Requirement::Optional(_) => false,
        }
    }
}

/// A single problem with a supplied input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("missing required input --{name}")]
    MissingRequiredInput { name: ParamName },

    #[error("--{name}: path does not exist: {}", .path.display())]
    PathNotFound { name: ParamName, path: PathBuf },

    #[error("--{name}: invalid pattern '{pattern}': {message}")]
    InvalidPattern {
        name: ParamName,
        pattern: String,
        message: String,
    },

    #[error("--reads: sample '{sample}': {reason}")]
    InvalidReadLayout {
        sample: String,
        reason: String,
        files: Vec<PathBuf>,
    },
}

impl InputError {
    pub fn param(&self) -> Option<ParamName> {
        match self {
            Self::MissingRequiredInput { name }
            | Self::PathNotFound { name, .. }
            | Self::InvalidPattern { name, .. } => Some(*name),
            Self::InvalidReadLayout { .. } => Some(ParamName::Reads),
        }
    }
}

/// Every input problem found while resolving a parameter set
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct InputValidationError {
    pub errors: Vec<InputError>,
}

impl fmt::Display for InputValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} input problem(s) found:", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n  - {}", error)?;
        }
        Ok(())
    }
}

impl InputValidationError {
    /// Parameters reported as missing
    pub fn missing(&self) -> Vec<ParamName> {
        self.errors
            .iter()
            .filter_map(|e| match e {
                InputError::MissingRequiredInput { name } => Some(*name),
                _ => None,
            })
            .collect()
    }
}

/// Raw values as supplied by the user, before resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuppliedParams {
    values: BTreeMap<ParamName, String>,
}

impl SuppliedParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a supplied value; empty strings count as not supplied
    pub fn set(&mut self, name: ParamName, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        if value.trim().is_empty() {
            self.values.remove(&name);
        } else {
            self.values.insert(name, value);
        }
        self
    }

    /// Builder form of [`SuppliedParams::set`]
    pub fn with(mut self, name: ParamName, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: ParamName) -> Option<&str> {
        self.values.get(&name).map(String::as_str)
    }

    /// Whether metagenomic reads were actually supplied
    pub fn has_reads(&self) -> bool {
        self.get(ParamName::Reads)
            .map(|v| Sentinel::from_literal(v).is_none())
            .unwrap_or(false)
    }
}

/// Resolve one parameter under the given mode
pub fn resolve(
    name: ParamName,
    supplied: Option<&str>,
    mode: &ResolutionMode,
) -> Result<ResolvedParameter, InputError> {
    let value = supplied.map(str::trim).filter(|v| !v.is_empty());

    let resolution = match value {
        None if mode.is_required(name) => {
            return Err(InputError::MissingRequiredInput { name });
        }
        None => Resolution::Absent(name.sentinel()),
        // Explicitly passing the marker means "absent", never a real path
        Some(literal) if Sentinel::from_literal(literal).is_some() => {
            if mode.is_required(name) {
                return Err(InputError::MissingRequiredInput { name });
            }
            Resolution::Absent(name.sentinel())
        }
        Some(value) => match name.kind() {
            ParamKind::Value => Resolution::Value(value.to_string()),
            ParamKind::Path => {
                let path = PathBuf::from(value);
                if !path.exists() {
                    return Err(InputError::PathNotFound { name, path });
                }
                Resolution::Path(absolute(path))
            }
            ParamKind::Glob => Resolution::Paths(expand_glob(name, value)?),
        },
    };

    debug!(param = %name, value = %resolution.display_value(), "Resolved parameter");

    Ok(ResolvedParameter { name, resolution })
}

/// Stages run in their own working directories, so relative paths must go
fn absolute(path: PathBuf) -> PathBuf {
    path.canonicalize().unwrap_or(path)
}

fn expand_glob(name: ParamName, pattern: &str) -> Result<Vec<PathBuf>, InputError> {
    let entries = glob::glob(pattern).map_err(|e| InputError::InvalidPattern {
        name,
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .map(absolute)
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(InputError::PathNotFound {
            name,
            path: PathBuf::from(pattern),
        });
    }

    Ok(paths)
}

/// The resolved parameter set, shared read-only by every stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedParams {
    mode: ResolutionMode,
    params: BTreeMap<ParamName, Resolution>,
}

impl ResolvedParams {
    pub fn mode(&self) -> ResolutionMode {
        self.mode
    }

    pub fn get(&self, name: ParamName) -> &Resolution {
        // Resolution covers every declared name, see resolve_all
        static ABSENT: Resolution = Resolution::Absent(Sentinel::NoFile);
        self.params.get(&name).unwrap_or(&ABSENT)
    }

    pub fn is_present(&self, name: ParamName) -> bool {
        self.get(name).is_present()
    }

    /// Path of a present path parameter
    pub fn path(&self, name: ParamName) -> Option<&Path> {
        match self.get(name) {
            Resolution::Path(path) => Some(path),
            _ => None,
        }
    }

    /// Files matched by the read pattern
    pub fn read_files(&self) -> &[PathBuf] {
        match self.get(ParamName::Reads) {
            Resolution::Paths(paths) => paths,
            _ => &[],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamName, &Resolution)> {
        self.params.iter().map(|(name, r)| (*name, r))
    }
}

fn resolve_each(supplied: &SuppliedParams, report: bool) -> (ResolvedParams, Vec<InputError>) {
    let mode = ResolutionMode::new(report, supplied.has_reads());
    let mut params = BTreeMap::new();
    let mut errors = Vec::new();

    for name in ParamName::ALL {
        match resolve(name, supplied.get(name), &mode) {
            Ok(resolved) => {
                params.insert(name, resolved.resolution);
            }
            Err(e) => errors.push(e),
        }
    }

    (ResolvedParams { mode, params }, errors)
}

/// Resolve every declared parameter once, aggregating all problems
pub fn resolve_all(
    supplied: &SuppliedParams,
    report: bool,
) -> Result<ResolvedParams, InputValidationError> {
    let (params, errors) = resolve_each(supplied, report);
    if !errors.is_empty() {
        return Err(InputValidationError { errors });
    }
    Ok(params)
}

/// Resolve every parameter and group the matched reads into samples
///
/// Read layout problems are reported alongside missing or unresolvable
/// inputs in the same [`InputValidationError`].
pub fn resolve_with_samples(
    supplied: &SuppliedParams,
    report: bool,
    single_end: bool,
) -> Result<(ResolvedParams, Vec<Sample>), InputValidationError> {
    let (params, mut errors) = resolve_each(supplied, report);

    let samples = match group_samples(params.read_files(), single_end) {
        Ok(samples) => samples,
        Err(layout) => {
            errors.extend(layout);
            Vec::new()
        }
    };

    if !errors.is_empty() {
        return Err(InputValidationError { errors });
    }

    debug!(samples = samples.len(), "Resolved inputs");
    Ok((params, samples))
}
