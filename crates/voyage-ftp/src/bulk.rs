//! Mega-batch downloads for a whole line.

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};
use voyage_core::{CruiseRef, LineId};
use voyage_feed::ParsedDocument;

use crate::fetch::{DocumentFetcher, FetchError};

/// Upper bound on documents in flight for one batch.
pub const MEGA_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy)]
pub struct BulkConfig {
    pub mega_batch_size: usize,
    /// Concurrent fetches inside a batch; normally the pool size.
    pub concurrency: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            mega_batch_size: MEGA_BATCH_SIZE,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connection,
    Parse,
    /// The pool refused the fetch (exhausted, breaker open, shut down).
    Backpressure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub path: String,
    pub cruise: CruiseRef,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct BulkResult {
    pub total_files: usize,
    pub succeeded: usize,
    /// Fetches that never produced bytes (connection or backpressure).
    /// Parse errors are counted apart, so `succeeded + failed + not_found +
    /// parse_errors == total_files`.
    pub failed: usize,
    pub connection_failures: usize,
    pub not_found: usize,
    pub parse_errors: usize,
    /// Parsed documents keyed by feed path. The file-name id repeats across
    /// month directories, so it cannot be the key.
    pub documents: BTreeMap<String, ParsedDocument>,
    pub missing: Vec<CruiseRef>,
    pub failures: Vec<FailureRecord>,
}

impl BulkResult {
    fn record(&mut self, cruise: CruiseRef, outcome: Result<ParsedDocument, FetchError>) {
        self.total_files += 1;
        let err = match outcome {
            Ok(doc) => {
                self.succeeded += 1;
                self.documents.insert(cruise.path(), doc);
                return;
            }
            Err(FetchError::NotFound(_)) => {
                self.not_found += 1;
                self.missing.push(cruise);
                return;
            }
            Err(err) => err,
        };

        let kind = match &err {
            FetchError::Parse { .. } => {
                self.parse_errors += 1;
                FailureKind::Parse
            }
            err if err.is_backpressure() => {
                self.failed += 1;
                self.connection_failures += 1;
                FailureKind::Backpressure
            }
            _ => {
                self.failed += 1;
                self.connection_failures += 1;
                FailureKind::Connection
            }
        };
        self.failures.push(FailureRecord {
            path: cruise.path(),
            cruise,
            kind,
            reason: err.to_string(),
        });
    }

    pub fn merge(&mut self, other: BulkResult) {
        self.total_files += other.total_files;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.connection_failures += other.connection_failures;
        self.not_found += other.not_found;
        self.parse_errors += other.parse_errors;
        self.documents.extend(other.documents);
        self.missing.extend(other.missing);
        self.failures.extend(other.failures);
    }

    /// Share of attempted files that neither failed to transfer nor failed
    /// to parse; not-found files count as handled. An empty result is fully
    /// successful.
    pub fn success_rate(&self) -> f64 {
        if self.total_files == 0 {
            return 1.0;
        }
        let bad = self.failed + self.parse_errors;
        (self.total_files - bad) as f64 / self.total_files as f64
    }

    /// True when any fetch was refused by the pool, which means the caller
    /// should pause rather than push on.
    pub fn backpressure(&self) -> bool {
        self.failures
            .iter()
            .any(|f| f.kind == FailureKind::Backpressure)
    }
}

#[derive(Clone)]
pub struct BulkDownloader {
    fetcher: DocumentFetcher,
    config: BulkConfig,
}

impl BulkDownloader {
    pub fn new(fetcher: DocumentFetcher, config: BulkConfig) -> Self {
        Self { fetcher, config }
    }

    pub fn fetcher(&self) -> &DocumentFetcher {
        &self.fetcher
    }

    pub fn config(&self) -> BulkConfig {
        self.config
    }

    /// Split work into mega-batches of at most the configured size.
    pub fn mega_batches<'a>(&self, refs: &'a [CruiseRef]) -> std::slice::Chunks<'a, CruiseRef> {
        refs.chunks(self.config.mega_batch_size.max(1))
    }

    /// Fetch one batch concurrently. One document's failure never affects
    /// the others.
    pub async fn download_batch(&self, refs: &[CruiseRef]) -> BulkResult {
        let concurrency = self.config.concurrency.max(1);
        let outcomes: Vec<(CruiseRef, Result<ParsedDocument, FetchError>)> =
            stream::iter(refs.iter().copied())
                .map(|cruise| async move {
                    let path = cruise.path();
                    (cruise, self.fetcher.fetch(&path).await)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        let mut result = BulkResult::default();
        for (cruise, outcome) in outcomes {
            result.record(cruise, outcome);
        }
        result
    }

    pub async fn download_line(&self, line_id: LineId, refs: &[CruiseRef]) -> BulkResult {
        let mut total = BulkResult::default();
        let batches = refs.len().div_ceil(self.config.mega_batch_size.max(1));
        for (index, batch) in self.mega_batches(refs).enumerate() {
            let result = self.download_batch(batch).await;
            info!(
                line_id,
                batch = index + 1,
                batches,
                succeeded = result.succeeded,
                failed = result.failed,
                parse_errors = result.parse_errors,
                not_found = result.not_found,
                "mega-batch downloaded"
            );
            let stop = result.backpressure();
            total.merge(result);
            if stop {
                warn!(line_id, batch = index + 1, "feed pool refused work; stopping line download");
                break;
            }
        }
        total
    }
}
