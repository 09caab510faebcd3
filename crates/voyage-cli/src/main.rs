use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use voyage_feed::{Normalizer, ParsedDocument};
use voyage_ftp::{ConnectionPool, DocumentFetcher, FtpConnector};
use voyage_sync::schedule::crawl_all_lines;
use voyage_sync::{pg, JobSummary, SyncConfig, SyncRuntime};

#[derive(Debug, Parser)]
#[command(name = "voyage")]
#[command(about = "Cruise feed ingestion and price reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Webhook receiver plus the cron scheduler, until Ctrl-C.
    Serve,
    /// Apply the embedded schema migrations.
    Migrate,
    /// Sync every document of one line over the configured month window.
    SyncLine {
        line_id: i32,
        /// First month to sync, as YYYY-MM (defaults to the current month).
        #[arg(long, value_parser = parse_month)]
        from: Option<(i32, u32)>,
    },
    /// Sync specific documents, e.g. `2025/05/22/231/8734921.json`.
    SyncPaths {
        #[arg(long)]
        line_id: i32,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// One pass of the scheduled crawl: a line job per listed line.
    Crawl,
    /// Recompute drifted cheapest prices from stored documents.
    RepairPrices,
    /// Parse, reconcile and normalize one document without writing it.
    Inspect {
        path: String,
        /// Read `path` from the local filesystem instead of the feed.
        #[arg(long)]
        local: bool,
    },
}

fn parse_month(raw: &str) -> Result<(i32, u32), String> {
    let (year, month) = raw.split_once('-').ok_or("expected YYYY-MM")?;
    let year: i32 = year.parse().map_err(|_| format!("bad year in {raw}"))?;
    let month: u32 = month.parse().map_err(|_| format!("bad month in {raw}"))?;
    if !(1..=12).contains(&month) {
        return Err(format!("month out of range in {raw}"));
    }
    Ok((year, month))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Migrate => {
            migrate(&config).await?;
            println!("migrations applied");
        }
        Commands::SyncLine { line_id, from } => {
            let runtime = SyncRuntime::connect(config).await?;
            let summary = runtime.dispatcher.run_line_now(line_id, from).await;
            runtime.dispatcher.wait_idle().await;
            runtime.shutdown().await;
            match summary? {
                Some(summary) => print_summary(&summary)?,
                None => bail!("line {line_id} is already syncing"),
            }
        }
        Commands::SyncPaths { line_id, paths } => {
            let runtime = SyncRuntime::connect(config).await?;
            let summary = runtime.syncer.run_paths(Uuid::new_v4(), line_id, &paths).await;
            runtime.shutdown().await;
            print_summary(&summary?)?;
        }
        Commands::Crawl => {
            let runtime = SyncRuntime::connect(config).await?;
            let lines = crawl_all_lines(runtime.fetcher(), &runtime.dispatcher).await;
            runtime.dispatcher.wait_idle().await;
            runtime.shutdown().await;
            println!("crawled lines: {:?}", lines?);
        }
        Commands::RepairPrices => {
            let runtime = SyncRuntime::connect(config).await?;
            let report = runtime.repairer.repair_cheapest_pricing().await;
            runtime.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&report?)?);
        }
        Commands::Inspect { path, local } => inspect(&config, &path, local).await?,
    }

    Ok(())
}

async fn migrate(config: &SyncConfig) -> Result<()> {
    let pool = pg::connect(&config.database_url, 2)
        .await
        .context("connecting to postgres")?;
    pg::migrate(&pool).await.context("running migrations")?;
    pool.close().await;
    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    migrate(&config).await?;
    let port = config.web_port;
    let runtime = SyncRuntime::connect(config).await?;

    let scheduler = runtime.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!("scheduler started");
    }

    let state = voyage_web::AppState::from_runtime(&runtime);
    voyage_web::serve(state, port, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
        }
        info!("shutdown requested");
    })
    .await?;

    if let Some(mut sched) = scheduler {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    runtime.shutdown().await;
    Ok(())
}

async fn inspect(config: &SyncConfig, path: &str, local: bool) -> Result<()> {
    let parsed = if local {
        let bytes = std::fs::read(PathBuf::from(path)).with_context(|| format!("reading {path}"))?;
        ParsedDocument::from_bytes(path, &bytes)?
    } else {
        let pool = ConnectionPool::new(Arc::new(FtpConnector::new(config.ftp.clone())), config.pool.clone());
        let fetcher = DocumentFetcher::new(pool.clone(), config.retry);
        let parsed = fetcher.fetch(path).await;
        pool.shutdown().await;
        parsed?
    };
    if let Some(repair) = parsed.repair {
        warn!(?repair, "document needed repair");
    }

    let normalizer = Normalizer::new(config.pricing_rules(), config.default_currency.clone())
        .with_pricing_lines(config.write_pricing_lines);
    let normalized = normalizer.normalize(&parsed)?;
    if let Err(violation) = normalized.cheapest.check_invariant() {
        bail!("cheapest price disagrees with categories: {violation:?}");
    }
    println!("{}", serde_json::to_string_pretty(&normalized)?);
    Ok(())
}

fn print_summary(summary: &JobSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    if !summary.is_completed() {
        bail!("job {} did not complete", summary.job_id);
    }
    Ok(())
}
