//! Append-only event store with file-based persistence.
//!
//! Each run keeps its events as newline-delimited JSON (JSONL) under
//! `<outdir>/pipeline_info/runs/<run-id>/events.jsonl`, which keeps the log
//! next to the results it describes and easy to inspect by hand.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::config::paths;
use crate::domain::{Event, EventType};

/// File-based event store using JSONL format
#[derive(Debug, Clone)]
pub struct EventStore {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl EventStore {
    /// Create or open the event store of a run below an output root
    pub async fn open(outdir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = paths::run_dir(outdir, &run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        Ok(Self::at(run_dir))
    }

    /// Open the store of a run that must already exist
    pub async fn open_existing(outdir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = paths::run_dir(outdir, &run_id.to_string());
        if !run_dir.is_dir() {
            anyhow::bail!("Run not found: {} (looked in {})", run_id, run_dir.display());
        }
        Ok(Self::at(run_dir))
    }

    fn at(run_dir: PathBuf) -> Self {
        let events_path = run_dir.join("events.jsonl");
        Self {
            run_dir,
            events_path,
        }
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Check if a stage already completed with this cache key
    pub async fn is_stage_completed(&self, cache_key: &str) -> Result<bool> {
        let events = self.replay().await?;

        let completed = events.iter().any(|e| {
            e.cache_key == cache_key
                && matches!(e.event_type, EventType::StageCompleted | EventType::StageCached)
        });

        Ok(completed)
    }

    /// Find events matching a predicate
    pub async fn find_events<F>(&self, predicate: F) -> Result<Vec<Event>>
    where
        F: Fn(&Event) -> bool,
    {
        let events = self.replay().await?;
        Ok(events.into_iter().filter(predicate).collect())
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// List all run IDs recorded below an output root
    pub async fn list_runs(outdir: &Path) -> Result<Vec<Uuid>> {
        let base_dir = paths::runs_dir(outdir);

        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

/// Cache key of a stage execution: `{stage}:{hash16}`
///
/// `material` is everything that determines the outcome: the rendered
/// command plus fingerprints of the input files.
pub fn cache_key(stage: &str, material: &str) -> String {
    format!("{}:{}", stage, hash_input(&format!("{}\n{}", stage, material)))
}

/// Hash part of a cache key
pub fn key_hash(cache_key: &str) -> &str {
    cache_key
        .rsplit_once(':')
        .map(|(_, hash)| hash)
        .unwrap_or(cache_key)
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8]) // First 16 hex chars (8 bytes)
}
