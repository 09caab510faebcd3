//! Line and path-list sync jobs: discover, download batch by batch, write,
//! checkpoint.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use voyage_core::{line_dir, ship_dir, CruiseRef, LineId};
use voyage_ftp::{BulkDownloader, BulkResult, FailureKind};

use crate::config::SyncConfig;
use crate::progress::{line_run_key, paths_run_key, PathOutcome, ProgressTracker, SyncStats};
use crate::store::SailWindow;
use crate::upsert::{UpsertError, Upserter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRequest {
    /// Crawl the line's month directories, from `start` or the current month.
    Line {
        line_id: LineId,
        start: Option<(i32, u32)>,
    },
    /// Only the named documents.
    Paths { line_id: LineId, paths: Vec<String> },
}

impl JobRequest {
    pub fn line_id(&self) -> LineId {
        match self {
            JobRequest::Line { line_id, .. } | JobRequest::Paths { line_id, .. } => *line_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Line,
    Paths,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    /// Stopped early; the checkpoint was kept for the next run.
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub line_id: LineId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub stats: SyncStats,
    pub discovered: usize,
    pub resumed: usize,
    pub deactivated: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobSummary {
    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job_id: Uuid, request: JobRequest) -> anyhow::Result<JobSummary>;
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub months_ahead: u32,
    pub db_concurrency: usize,
    /// `None` keeps checkpoints in memory only.
    pub checkpoint_dir: Option<PathBuf>,
    pub checkpoint_max_age: Duration,
    /// Wait after the pool refuses work before the single retry.
    pub backpressure_pause: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            months_ahead: config.months_ahead.max(1),
            db_concurrency: config.db_concurrency.max(1),
            checkpoint_dir: Some(config.checkpoint_dir.clone()),
            checkpoint_max_age: config.checkpoint_max_age,
            backpressure_pause: config.pool.breaker.cooldown,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            months_ahead: 24,
            db_concurrency: 8,
            checkpoint_dir: None,
            checkpoint_max_age: Duration::from_secs(24 * 3600),
            backpressure_pause: Duration::from_secs(30),
        }
    }
}

/// `count` consecutive `(year, month)` pairs starting at `start`.
pub fn month_window(start: (i32, u32), count: u32) -> Vec<(i32, u32)> {
    let (mut year, mut month) = start;
    let mut months = Vec::with_capacity(count as usize);
    for _ in 0..count {
        months.push((year, month));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    months
}

fn sail_window(months: &[(i32, u32)]) -> Option<SailWindow> {
    let first = months.first()?;
    let last = months.last()?;
    let (year, month) = month_window(*last, 2).get(1).copied()?;
    Some(SailWindow {
        from: NaiveDate::from_ymd_opt(first.0, first.1, 1)?,
        until: NaiveDate::from_ymd_opt(year, month, 1)?,
    })
}

fn leaf_name(entry: &str) -> &str {
    entry.trim_end_matches('/').rsplit('/').next().unwrap_or(entry)
}

pub struct LineSyncer {
    downloader: BulkDownloader,
    upserter: Upserter,
    settings: SyncSettings,
    shutdown: watch::Receiver<bool>,
}

impl LineSyncer {
    pub fn new(
        downloader: BulkDownloader,
        upserter: Upserter,
        settings: SyncSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            downloader,
            upserter,
            settings,
            shutdown,
        }
    }

    pub fn downloader(&self) -> &BulkDownloader {
        &self.downloader
    }

    pub fn upserter(&self) -> &Upserter {
        &self.upserter
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn tracker(&self, run_key: &str) -> anyhow::Result<ProgressTracker> {
        match &self.settings.checkpoint_dir {
            Some(dir) => ProgressTracker::open(dir, run_key, self.settings.checkpoint_max_age).await,
            None => Ok(ProgressTracker::in_memory(run_key)),
        }
    }

    /// Every document listed under the line in the given months.
    pub async fn discover(&self, line_id: LineId, months: &[(i32, u32)]) -> anyhow::Result<Vec<CruiseRef>> {
        let fetcher = self.downloader.fetcher();
        let mut refs = Vec::new();
        for &(year, month) in months {
            let dir = line_dir(year, month, line_id);
            let ships = fetcher
                .list(&dir)
                .await
                .with_context(|| format!("listing {dir}"))?;
            for ship in ships {
                let Ok(ship_id) = leaf_name(&ship).parse() else {
                    continue;
                };
                let dir = ship_dir(year, month, line_id, ship_id);
                let files = fetcher
                    .list(&dir)
                    .await
                    .with_context(|| format!("listing {dir}"))?;
                refs.extend(
                    files
                        .iter()
                        .map(String::as_str)
                        .map(leaf_name)
                        .filter(|f| f.ends_with(".json"))
                        .filter_map(|f| CruiseRef::parse(&format!("{dir}/{f}")).ok()),
                );
            }
        }
        refs.sort();
        refs.dedup();
        Ok(refs)
    }

    /// Crawl the line starting at the current month.
    pub async fn run_line(&self, job_id: Uuid, line_id: LineId) -> anyhow::Result<JobSummary> {
        let today = Utc::now().date_naive();
        self.run_line_from(job_id, line_id, (today.year(), today.month()))
            .await
    }

    pub async fn run_line_from(
        &self,
        job_id: Uuid,
        line_id: LineId,
        start: (i32, u32),
    ) -> anyhow::Result<JobSummary> {
        let started_at = Utc::now();
        let months = month_window(start, self.settings.months_ahead);
        let mut tracker = self.tracker(&line_run_key(line_id, start.0, start.1)).await?;
        let resumed = tracker.resumed();

        let refs = self
            .discover(line_id, &months)
            .instrument(info_span!("discover", line_id))
            .await?;
        info!(line_id, %job_id, files = refs.len(), resumed, "line sync started");

        let abort = self.process(&mut tracker, &refs).await?;
        let (status, stats, deactivated) = match abort {
            Some(reason) => {
                warn!(line_id, %job_id, %reason, "line sync aborted; checkpoint kept");
                (JobStatus::Aborted { reason }, tracker.abort().await?, 0)
            }
            None => {
                let deactivated = self.deactivate_missing(line_id, &months, &refs).await?;
                (JobStatus::Completed, tracker.complete().await?, deactivated)
            }
        };

        let summary = JobSummary {
            job_id,
            line_id,
            kind: JobKind::Line,
            status,
            stats,
            discovered: refs.len(),
            resumed,
            deactivated,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            line_id,
            %job_id,
            inserted = summary.stats.inserted,
            updated = summary.stats.updated,
            unchanged = summary.stats.unchanged,
            failed = summary.stats.failed,
            deactivated,
            "line sync finished"
        );
        Ok(summary)
    }

    /// Cruises are matched by the feed path they were stored from. Paths
    /// that were listed but failed to parse still count as listed.
    async fn deactivate_missing(
        &self,
        line_id: LineId,
        months: &[(i32, u32)],
        refs: &[CruiseRef],
    ) -> anyhow::Result<u64> {
        if refs.is_empty() {
            warn!(line_id, "crawl listed no documents; leaving existing cruises active");
            return Ok(0);
        }
        let Some(window) = sail_window(months) else {
            return Ok(0);
        };
        let listed: Vec<String> = refs.iter().map(CruiseRef::path).collect();
        let catalog_line = self.upserter.catalog_line(line_id);
        let deactivated = self
            .upserter
            .store()
            .mark_missing_inactive(catalog_line, window, &listed)
            .await?;
        if deactivated > 0 {
            info!(line_id, catalog_line, deactivated, "cruises no longer listed were deactivated");
        }
        Ok(deactivated)
    }

    /// Sync an explicit list of documents.
    pub async fn run_paths(
        &self,
        job_id: Uuid,
        line_id: LineId,
        paths: &[String],
    ) -> anyhow::Result<JobSummary> {
        let started_at = Utc::now();
        let mut tracker = self.tracker(&paths_run_key(job_id)).await?;
        let resumed = tracker.resumed();

        let mut refs = Vec::with_capacity(paths.len());
        for path in paths {
            match CruiseRef::parse(path) {
                Ok(cruise) => {
                    if cruise.line_id != line_id {
                        warn!(line_id, path = %path, "path belongs to another line");
                    }
                    refs.push(cruise);
                }
                Err(err) => {
                    warn!(error = %err, "skipping unparseable feed path");
                    tracker.mark_done(path, PathOutcome::Skipped).await?;
                }
            }
        }
        refs.sort();
        refs.dedup();

        let abort = self.process(&mut tracker, &refs).await?;
        let (status, stats) = match abort {
            Some(reason) => (JobStatus::Aborted { reason }, tracker.abort().await?),
            None => (JobStatus::Completed, tracker.complete().await?),
        };
        Ok(JobSummary {
            job_id,
            line_id,
            kind: JobKind::Paths,
            status,
            stats,
            discovered: refs.len(),
            resumed,
            deactivated: 0,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Returns the abort reason when the run stopped early.
    async fn process(
        &self,
        tracker: &mut ProgressTracker,
        refs: &[CruiseRef],
    ) -> anyhow::Result<Option<String>> {
        let pending: Vec<CruiseRef> = refs
            .iter()
            .copied()
            .filter(|r| !tracker.is_done(&r.path()))
            .collect();
        let batches = pending.len().div_ceil(self.downloader.config().mega_batch_size.max(1));

        for (index, batch) in self.downloader.mega_batches(&pending).enumerate() {
            if self.shutting_down() {
                return Ok(Some("shutdown requested".into()));
            }
            let mut result = self.downloader.download_batch(batch).await;

            if result.backpressure() {
                let refused: Vec<CruiseRef> = result
                    .failures
                    .iter()
                    .filter(|f| f.kind == FailureKind::Backpressure)
                    .map(|f| f.cruise)
                    .collect();
                warn!(
                    refused = refused.len(),
                    pause_ms = self.settings.backpressure_pause.as_millis() as u64,
                    "feed pool refused work; pausing"
                );
                result.failures.retain(|f| f.kind != FailureKind::Backpressure);
                tokio::time::sleep(self.settings.backpressure_pause).await;

                let retry = self.downloader.download_batch(&refused).await;
                let still_refused = retry.backpressure();
                result.merge(retry);
                if still_refused {
                    self.record(tracker, result).await?;
                    return Ok(Some("feed pool still refusing work after pause".into()));
                }
            }

            info!(
                batch = index + 1,
                batches,
                documents = result.documents.len(),
                not_found = result.not_found,
                failed = result.failed,
                parse_errors = result.parse_errors,
                "mega-batch fetched"
            );
            self.record(tracker, result).await?;
            tracker.flush().await?;
        }
        Ok(None)
    }

    async fn record(&self, tracker: &mut ProgressTracker, result: BulkResult) -> anyhow::Result<()> {
        for cruise in &result.missing {
            tracker.mark_done(&cruise.path(), PathOutcome::NotFound).await?;
        }
        for failure in &result.failures {
            match failure.kind {
                FailureKind::Parse => {
                    tracker.mark_done(&failure.path, PathOutcome::ParseError).await?;
                }
                FailureKind::Connection | FailureKind::Backpressure => {
                    tracker.record_failure(&failure.path);
                }
            }
        }

        let upserter = &self.upserter;
        let writes: Vec<_> = stream::iter(result.documents.into_values())
            .map(|doc| async move {
                let outcome = upserter.upsert(&doc).await;
                (doc.path, outcome)
            })
            .buffer_unordered(self.settings.db_concurrency.max(1))
            .collect()
            .await;

        for (path, outcome) in writes {
            match outcome {
                Ok(report) => {
                    if report.no_pricing {
                        tracker.record_unpriced();
                    }
                    tracker.mark_done(&path, report.outcome.into()).await?;
                }
                Err(UpsertError::Validation(err)) => {
                    warn!(path = %path, error = %err, "document rejected");
                    tracker.mark_done(&path, PathOutcome::Invalid).await?;
                }
                Err(UpsertError::Store(err)) => {
                    warn!(path = %path, error = %err, "cruise write failed; will retry next run");
                    tracker.record_failure(&path);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobRunner for LineSyncer {
    async fn run(&self, job_id: Uuid, request: JobRequest) -> anyhow::Result<JobSummary> {
        match request {
            JobRequest::Line {
                line_id,
                start: Some(start),
            } => self.run_line_from(job_id, line_id, start).await,
            JobRequest::Line { line_id, start: None } => self.run_line(job_id, line_id).await,
            JobRequest::Paths { line_id, paths } => self.run_paths(job_id, line_id, &paths).await,
        }
    }
}
