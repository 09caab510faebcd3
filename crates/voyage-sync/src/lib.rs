//! Sync orchestration: catalog store, upserts, resumable line jobs, webhook
//! dispatch, price repair and scheduling.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_cron_scheduler::JobScheduler;
use tracing::info;
use voyage_feed::Normalizer;
use voyage_ftp::{BulkDownloader, ConnectionPool, DocumentFetcher, FeedConnector, FtpConnector};

pub mod config;
pub mod dispatch;
pub mod job;
pub mod notify;
pub mod pg;
pub mod progress;
pub mod repair;
pub mod schedule;
pub mod store;
pub mod upsert;

pub use config::{LineMappings, SyncConfig};
pub use dispatch::{DispatchError, ProcessingMode, WebhookAck, WebhookDispatcher, WebhookPayload};
pub use job::{JobKind, JobRequest, JobRunner, JobStatus, JobSummary, LineSyncer, SyncSettings};
pub use notify::{LogNotifier, NotificationSink, SlackNotifier};
pub use pg::PgCatalogStore;
pub use progress::{PathOutcome, ProgressTracker, SyncStats};
pub use repair::{PriceRepairer, RepairReport};
pub use store::{
    ApplyOptions, CatalogSnapshot, CatalogStore, MemoryCatalogStore, SailWindow, StoreError,
    WriteStep,
};
pub use upsert::{UpsertError, UpsertReport, Upserter};

pub const CRATE_NAME: &str = "voyage-sync";

/// Everything a running service needs, wired from one config.
pub struct SyncRuntime {
    pub config: SyncConfig,
    pub pool: ConnectionPool,
    pub store: Arc<dyn CatalogStore>,
    pub syncer: Arc<LineSyncer>,
    pub dispatcher: WebhookDispatcher,
    pub repairer: PriceRepairer,
    shutdown: watch::Sender<bool>,
}

impl SyncRuntime {
    pub fn build(
        config: SyncConfig,
        connector: Arc<dyn FeedConnector>,
        store: Arc<dyn CatalogStore>,
        mappings: LineMappings,
    ) -> Result<Self> {
        let pool = ConnectionPool::new(connector, config.pool.clone());
        let fetcher = DocumentFetcher::new(pool.clone(), config.retry);
        let downloader = BulkDownloader::new(fetcher, config.bulk());

        let normalizer = Normalizer::new(config.pricing_rules(), config.default_currency.clone())
            .with_pricing_lines(config.write_pricing_lines);
        let upserter = Upserter::new(
            Arc::clone(&store),
            normalizer,
            ApplyOptions {
                write_pricing_lines: config.write_pricing_lines,
                force: false,
            },
        )
        .with_line_mappings(mappings.clone());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let syncer = Arc::new(LineSyncer::new(
            downloader,
            upserter,
            SyncSettings::from_config(&config),
            shutdown_rx,
        ));

        let notifier: Arc<dyn NotificationSink> = match &config.slack_webhook_url {
            Some(url) => Arc::new(SlackNotifier::new(url.clone()).context("building slack client")?),
            None => Arc::new(LogNotifier),
        };
        let dispatcher = WebhookDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&syncer) as Arc<dyn JobRunner>,
            notifier,
            mappings,
            config.fast_path_limit,
        );
        let repairer = PriceRepairer::new(Arc::clone(&store), config.pricing_rules());

        Ok(Self {
            config,
            pool,
            store,
            syncer,
            dispatcher,
            repairer,
            shutdown,
        })
    }

    /// Postgres catalog and the FTP feed, as configured.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let max_connections = u32::try_from(config.db_concurrency + 2).unwrap_or(u32::MAX);
        let pg = pg::connect(&config.database_url, max_connections)
            .await
            .context("connecting to postgres")?;
        let mappings = LineMappings::load(&config.line_mappings_path)?;
        info!(
            host = %config.ftp.host,
            pool_size = config.pool.size,
            mappings = mappings.len(),
            mappings_version = mappings.version(),
            "sync runtime configured"
        );
        let connector = Arc::new(FtpConnector::new(config.ftp.clone()));
        Self::build(config, connector, Arc::new(PgCatalogStore::new(pg)), mappings)
    }

    pub fn fetcher(&self) -> &DocumentFetcher {
        self.syncer.downloader().fetcher()
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        schedule::maybe_build_scheduler(
            &self.config,
            self.fetcher().clone(),
            self.dispatcher.clone(),
            self.repairer.clone(),
        )
        .await
    }

    /// Stop jobs at their next batch boundary, wait for them to persist
    /// their checkpoints, then close the feed pool.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.dispatcher.wait_idle().await;
        self.pool.shutdown().await;
        info!("sync runtime stopped");
    }
}
