//! Job summary notifications. Delivery is best effort; a failed post is
//! logged and never fails the job.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::job::{JobStatus, JobSummary};

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn job_finished(&self, summary: &JobSummary);
}

pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn job_finished(&self, summary: &JobSummary) {
        info!(
            job_id = %summary.job_id,
            line_id = summary.line_id,
            text = %summary_text(summary),
            "job summary"
        );
    }
}

pub fn summary_text(summary: &JobSummary) -> String {
    let stats = &summary.stats;
    let state = match &summary.status {
        JobStatus::Completed => "completed".to_string(),
        JobStatus::Aborted { reason } => format!("aborted ({reason})"),
    };
    let seconds = (summary.finished_at - summary.started_at).num_seconds().max(0);
    format!(
        "Line {} sync {state} in {seconds}s: {} inserted, {} updated, {} unchanged, \
         {} failed, {} not found, {} parse errors, {} unpriced, {} deactivated",
        summary.line_id,
        stats.inserted,
        stats.updated,
        stats.unchanged,
        stats.failed,
        stats.not_found,
        stats.parse_errors,
        stats.unpriced,
        summary.deactivated,
    )
}

/// Posts `{"text": ...}` to a Slack incoming webhook.
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for SlackNotifier {
    async fn job_finished(&self, summary: &JobSummary) {
        let payload = json!({ "text": summary_text(summary) });
        match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "slack rejected job summary"),
            Err(err) => warn!(error = %err, "posting job summary to slack failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::job::JobKind;
    use crate::progress::SyncStats;

    #[test]
    fn summary_mentions_outcome_and_counts() {
        let started_at = Utc::now();
        let summary = JobSummary {
            job_id: Uuid::new_v4(),
            line_id: 22,
            kind: JobKind::Line,
            status: JobStatus::Aborted {
                reason: "shutdown requested".into(),
            },
            stats: SyncStats {
                inserted: 3,
                updated: 1,
                ..SyncStats::default()
            },
            discovered: 10,
            resumed: 0,
            deactivated: 2,
            started_at,
            finished_at: started_at + ChronoDuration::seconds(42),
        };

        let text = summary_text(&summary);
        assert!(text.starts_with("Line 22 sync aborted (shutdown requested) in 42s"));
        assert!(text.contains("3 inserted, 1 updated"));
        assert!(text.contains("2 deactivated"));
    }
}
