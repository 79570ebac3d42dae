//! Grouping of metagenomic read files into samples.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::resolver::InputError;

/// Mate tokens recognised in paired-end file names, longest first
const MATE_TOKENS: [(&str, &str); 4] = [("_R1", "_R2"), ("_1", "_2"), (".R1", ".R2"), (".1", ".2")];

/// Extensions stripped when deriving a sample id
const READ_EXTENSIONS: [&str; 6] = [
    ".fastq.gz",
    ".fq.gz",
    ".fastq.bz2",
    ".fastq",
    ".fq",
    ".fasta",
];

/// One metagenomic sample and its read files
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub id: String,

    /// One file for single-end data, R1 then R2 for paired-end data
    pub reads: Vec<PathBuf>,
}

impl Sample {
    pub fn is_paired(&self) -> bool {
        self.reads.len() == 2
    }
}

fn strip_extension(file_name: &str) -> &str {
    READ_EXTENSIONS
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext))
        .unwrap_or(file_name)
}

/// Sample id and mate number (1 or 2) of a paired-end file
fn mate_of(path: &Path) -> Option<(String, u8)> {
    let file_name = path.file_name()?.to_str()?;
    let stem = strip_extension(file_name);

    for (first, second) in MATE_TOKENS {
        if let Some(id) = stem.strip_suffix(first) {
            return Some((id.to_string(), 1));
        }
        if let Some(id) = stem.strip_suffix(second) {
            return Some((id.to_string(), 2));
        }
    }
    None
}

fn single_id(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| strip_extension(n).to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Group read files into samples, sorted by sample id
///
/// Every sample whose files do not form a valid layout is reported, not just
/// the first one.
pub fn group_samples(files: &[PathBuf], single_end: bool) -> Result<Vec<Sample>, Vec<InputError>> {
    let mut groups: BTreeMap<String, Vec<(u8, PathBuf)>> = BTreeMap::new();
    for file in files {
        let (id, mate) = if single_end {
            (single_id(file), 0)
        } else {
            mate_of(file).unwrap_or_else(|| (single_id(file), 0))
        };
        groups.entry(id).or_default().push((mate, file.clone()));
    }

    let mut samples = Vec::with_capacity(groups.len());
    let mut errors = Vec::new();

    for (id, mut mates) in groups {
        mates.sort();
        let valid = if single_end {
            mates.len() == 1
        } else {
            mates.len() == 2 && mates[0].0 == 1 && mates[1].0 == 2
        };
        let reads: Vec<PathBuf> = mates.into_iter().map(|(_, f)| f).collect();

        if valid {
            samples.push(Sample { id, reads });
            continue;
        }

        let reason = if single_end {
            format!("{} files map to the same sample id", reads.len())
        } else {
            format!("{} read file(s), expected an R1/R2 pair", reads.len())
        };
        errors.push(InputError::InvalidReadLayout {
            sample: id,
            reason,
            files: reads,
        });
    }

    if errors.is_empty() {
        Ok(samples)
    } else {
        Err(errors)
    }
}
