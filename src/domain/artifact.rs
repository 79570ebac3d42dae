//! Artifacts produced by pipeline stages.
//!
//! Artifacts are the outputs of stages that downstream stages consume.
//! Once emitted they are never modified; consumers only read them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An output produced by a pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Name of the stage that produced this artifact
    pub stage_name: String,

    /// Declared output name within the stage
    pub output_name: String,

    /// Type of artifact
    pub kind: ArtifactKind,

    /// Absolute paths inside the producing stage's working directory
    pub paths: Vec<PathBuf>,

    /// When the artifact was emitted
    pub created_at: DateTime<Utc>,

    /// Total size in bytes of the regular files (for tracking)
    pub size_bytes: u64,
}

impl Artifact {
    /// Create a new artifact
    pub fn new(
        stage_name: impl Into<String>,
        output_name: impl Into<String>,
        kind: ArtifactKind,
        paths: Vec<PathBuf>,
    ) -> Self {
        let size_bytes = paths
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum();

        Self {
            stage_name: stage_name.into(),
            output_name: output_name.into(),
            kind,
            paths,
            created_at: Utc::now(),
            size_bytes,
        }
    }

    /// The single path of a file, archive or directory artifact
    pub fn primary_path(&self) -> Option<&Path> {
        self.paths.first().map(PathBuf::as_path)
    }

    /// Whether every path of the artifact still exists on disk
    pub fn exists(&self) -> bool {
        !self.paths.is_empty() && self.paths.iter().all(|p| p.exists())
    }
}

/// Types of artifacts a stage can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A single regular file
    File,

    /// Every file matching a glob pattern
    FileSet,

    /// A zip archive
    ZipArchive,

    /// A directory tree (e.g. an unpacked reference database)
    Directory,
}

impl ArtifactKind {
    /// Whether consumers receive a list of paths rather than a single one
    pub fn is_multi(&self) -> bool {
        matches!(self, Self::FileSet)
    }
}

impl Default for ArtifactKind {
    fn default() -> Self {
        Self::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_creation() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("differential_gene_expression.zip");
        std::fs::write(&path, "0123456789").unwrap();

        let artifact = Artifact::new(
            "differential_expression",
            "deseq2_archive",
            ArtifactKind::ZipArchive,
            vec![path.clone()],
        );

        assert_eq!(artifact.stage_name, "differential_expression");
        assert_eq!(artifact.kind, ArtifactKind::ZipArchive);
        assert_eq!(artifact.size_bytes, 10);
        assert_eq!(artifact.primary_path(), Some(path.as_path()));
        assert!(artifact.exists());
    }

    #[test]
    fn test_artifact_serialization() {
        let artifact = Artifact::new(
            "profile_s1",
            "genefamilies",
            ArtifactKind::File,
            vec![PathBuf::from("/does/not/exist.tsv")],
        );

        let json = serde_json::to_string(&artifact).unwrap();
        let parsed: Artifact = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.output_name, "genefamilies");
        assert_eq!(parsed.size_bytes, 0);
        assert!(!parsed.exists());
    }
}
