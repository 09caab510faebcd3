use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use voyage_core::{month_dir, LineId};
use voyage_ftp::DocumentFetcher;

use crate::config::SyncConfig;
use crate::dispatch::WebhookDispatcher;
use crate::repair::PriceRepairer;

/// Start a line job for every line listed in the current month directory.
/// Lines already syncing are skipped by the dispatcher.
pub async fn crawl_all_lines(fetcher: &DocumentFetcher, dispatcher: &WebhookDispatcher) -> Result<Vec<LineId>> {
    let today = Utc::now().date_naive();
    let dir = month_dir(today.year(), today.month());
    let entries = fetcher
        .list(&dir)
        .await
        .with_context(|| format!("listing {dir}"))?;

    let mut lines: Vec<LineId> = entries
        .iter()
        .filter_map(|entry| entry.trim_end_matches('/').rsplit('/').next()?.parse().ok())
        .collect();
    lines.sort_unstable();
    lines.dedup();

    let started: Vec<LineId> = lines
        .into_iter()
        .filter(|line_id| dispatcher.schedule_line(*line_id).is_some())
        .collect();
    info!(dir, lines = started.len(), "scheduled crawl dispatched");
    Ok(started)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    fetcher: DocumentFetcher,
    dispatcher: WebhookDispatcher,
    repairer: PriceRepairer,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let crawl = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let fetcher = fetcher.clone();
        let dispatcher = dispatcher.clone();
        Box::pin(async move {
            if let Err(err) = crawl_all_lines(&fetcher, &dispatcher).await {
                warn!(error = %format!("{err:#}"), "scheduled crawl failed");
            }
        })
    })
    .with_context(|| format!("creating crawl job for cron {}", config.sync_cron))?;
    sched.add(crawl).await.context("adding crawl job")?;

    let repair = Job::new_async(config.repair_cron.as_str(), move |_uuid, _l| {
        let repairer = repairer.clone();
        Box::pin(async move {
            if let Err(err) = repairer.repair_cheapest_pricing().await {
                warn!(error = %err, "scheduled price repair failed");
            }
        })
    })
    .with_context(|| format!("creating repair job for cron {}", config.repair_cron))?;
    sched.add(repair).await.context("adding repair job")?;

    Ok(Some(sched))
}
