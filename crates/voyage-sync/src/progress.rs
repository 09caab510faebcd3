//! Resumable run bookkeeping: which paths a run has finished, with counters,
//! persisted as one JSON checkpoint per run key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;
use voyage_core::{LineId, WriteOutcome};

/// Marks between checkpoint writes; batch boundaries flush as well.
pub const FLUSH_EVERY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathOutcome {
    Inserted,
    Updated,
    Unchanged,
    NotFound,
    ParseError,
    /// Deterministic rejection (validation); retrying would fail the same way.
    Invalid,
    Skipped,
}

impl From<WriteOutcome> for PathOutcome {
    fn from(outcome: WriteOutcome) -> Self {
        match outcome {
            WriteOutcome::Inserted => PathOutcome::Inserted,
            WriteOutcome::Updated => PathOutcome::Updated,
            WriteOutcome::Unchanged => PathOutcome::Unchanged,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub not_found: usize,
    pub parse_errors: usize,
    pub skipped: usize,
    /// Written with no category price at all.
    pub unpriced: usize,
}

impl SyncStats {
    fn record(&mut self, outcome: PathOutcome) {
        self.processed += 1;
        match outcome {
            PathOutcome::Inserted => self.inserted += 1,
            PathOutcome::Updated => self.updated += 1,
            PathOutcome::Unchanged => self.unchanged += 1,
            PathOutcome::NotFound => self.not_found += 1,
            PathOutcome::ParseError => self.parse_errors += 1,
            PathOutcome::Invalid => self.failed += 1,
            PathOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_key: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub done: BTreeMap<String, PathOutcome>,
    pub stats: SyncStats,
}

impl Checkpoint {
    fn new(run_key: &str) -> Self {
        let now = Utc::now();
        Self {
            run_key: run_key.to_string(),
            started_at: now,
            updated_at: now,
            done: BTreeMap::new(),
            stats: SyncStats::default(),
        }
    }
}

pub fn line_run_key(line_id: LineId, year: i32, month: u32) -> String {
    format!("line-{line_id}-{year:04}-{month:02}")
}

pub fn paths_run_key(job_id: Uuid) -> String {
    format!("paths-{job_id}")
}

pub struct ProgressTracker {
    file: Option<PathBuf>,
    checkpoint: Checkpoint,
    resumed: usize,
    unflushed: usize,
}

impl ProgressTracker {
    /// A tracker that never touches disk.
    pub fn in_memory(run_key: &str) -> Self {
        Self {
            file: None,
            checkpoint: Checkpoint::new(run_key),
            resumed: 0,
            unflushed: 0,
        }
    }

    /// Load the run's checkpoint when one exists and is younger than
    /// `max_age`; otherwise start fresh.
    pub async fn open(dir: &Path, run_key: &str, max_age: Duration) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating checkpoint directory {}", dir.display()))?;
        let file = dir.join(format!("{run_key}.json"));

        let checkpoint = match fs::read(&file).await {
            Ok(bytes) => match serde_json::from_slice::<Checkpoint>(&bytes) {
                Ok(checkpoint) if is_fresh(&checkpoint, max_age) => Some(checkpoint),
                Ok(checkpoint) => {
                    info!(run_key, updated_at = %checkpoint.updated_at, "discarding stale checkpoint");
                    None
                }
                Err(err) => {
                    warn!(run_key, error = %err, "discarding unreadable checkpoint");
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).with_context(|| format!("reading checkpoint {}", file.display()))
            }
        };

        let (checkpoint, resumed) = match checkpoint {
            Some(checkpoint) => {
                let resumed = checkpoint.done.len();
                info!(run_key, resumed, "resuming from checkpoint");
                (checkpoint, resumed)
            }
            None => (Checkpoint::new(run_key), 0),
        };
        Ok(Self {
            file: Some(file),
            checkpoint,
            resumed,
            unflushed: 0,
        })
    }

    pub fn run_key(&self) -> &str {
        &self.checkpoint.run_key
    }

    /// Paths already finished when the tracker was opened.
    pub fn resumed(&self) -> usize {
        self.resumed
    }

    pub fn is_done(&self, path: &str) -> bool {
        self.checkpoint.done.contains_key(path)
    }

    pub async fn mark_done(&mut self, path: &str, outcome: PathOutcome) -> anyhow::Result<()> {
        if self.checkpoint.done.insert(path.to_string(), outcome).is_none() {
            self.checkpoint.stats.record(outcome);
        }
        self.unflushed += 1;
        if self.unflushed >= FLUSH_EVERY {
            self.flush().await?;
        }
        Ok(())
    }

    /// A transient failure: counted, but the path stays pending so a resumed
    /// run tries it again.
    pub fn record_failure(&mut self, path: &str) {
        debug!(path, "path left pending after failure");
        self.checkpoint.stats.failed += 1;
    }

    pub fn record_unpriced(&mut self) {
        self.checkpoint.stats.unpriced += 1;
    }

    pub fn snapshot(&self) -> SyncStats {
        self.checkpoint.stats.clone()
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        self.unflushed = 0;
        self.checkpoint.updated_at = Utc::now();
        let Some(file) = &self.file else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&self.checkpoint)?;
        write_atomic(file, &bytes).await
    }

    /// The run finished: drop the checkpoint file.
    pub async fn complete(self) -> anyhow::Result<SyncStats> {
        if let Some(file) = &self.file {
            match fs::remove_file(file).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("removing checkpoint {}", file.display()))
                }
            }
        }
        Ok(self.checkpoint.stats)
    }

    /// The run stopped early: persist so the next run resumes.
    pub async fn abort(mut self) -> anyhow::Result<SyncStats> {
        self.flush().await?;
        Ok(self.checkpoint.stats)
    }
}

fn is_fresh(checkpoint: &Checkpoint, max_age: Duration) -> bool {
    let age = Utc::now().signed_duration_since(checkpoint.updated_at);
    age.to_std().map(|age| age <= max_age).unwrap_or(true)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("checkpoint path {} has no parent", path.display()))?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp checkpoint {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp checkpoint {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp checkpoint {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming checkpoint {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
