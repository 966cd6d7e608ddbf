//! coinpulse: crypto market snapshot ingest and analysis
//!
//! Fetches market snapshots, filters anomalies, aggregates the clean rows into
//! a summary and serves the latest summary on a small dashboard.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use coinpulse_core::{
    CoinGeckoFeed, DashboardServer, EtlService, FileClassifierStore, IngestService,
    JsonFileStore, LogNotifier, MetricsCollector, Notifier, TransformPipeline, WebhookNotifier,
};
use coinpulse_scheduler::{FnJob, Scheduler};

use crate::config::{AppConfig, LogFormat, DEFAULT_LOG_FILTER};

#[derive(Parser)]
#[command(name = "coinpulse", version, about = "Crypto market snapshot ingest and analysis")]
struct Cli {
    /// Config file (defaults to ./coinpulse.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run scheduled fetch and ETL jobs plus the dashboard until Ctrl+C
    Serve,
    /// Fetch market pages once and store them
    Fetch {
        #[arg(long)]
        pages: Option<u32>,
        #[arg(long)]
        per_page: Option<u32>,
    },
    /// Run the ETL once over stored records
    Etl {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Retrain the anomaly classifier from stored records
    Train {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Serve the dashboard only
    Dashboard,
}

struct Services {
    store: Arc<JsonFileStore>,
    metrics: Arc<MetricsCollector>,
    ingest: Arc<IngestService>,
    etl: Arc<EtlService>,
}

impl Services {
    fn build(config: &AppConfig) -> Result<Self> {
        let store = Arc::new(JsonFileStore::new(&config.storage.data_dir));
        let metrics = Arc::new(MetricsCollector::new());

        let feed = CoinGeckoFeed::new(&config.feed).context("failed to create market feed")?;
        let ingest = IngestService::new(Arc::new(feed), store.clone(), metrics.clone());

        let notifier: Arc<dyn Notifier> = match (&config.notify.webhook_url, config.notify.enabled) {
            (Some(url), true) => Arc::new(WebhookNotifier::new(url.clone())?),
            _ => Arc::new(LogNotifier),
        };
        let classifier_store = Arc::new(FileClassifierStore::new(&config.storage.classifier_path));
        let pipeline = TransformPipeline::new(config.pipeline.clone(), classifier_store);
        let etl = EtlService::new(store.clone(), pipeline, notifier, metrics.clone());

        Ok(Self {
            store,
            metrics,
            ingest: Arc::new(ingest),
            etl: Arc::new(etl),
        })
    }

    fn dashboard(&self, config: &AppConfig) -> DashboardServer {
        DashboardServer::new(self.store.clone(), self.metrics.clone(), config.dashboard.clone())
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, dotenv) = AppConfig::load(cli.config.as_deref())?;
    init_tracing(&config);
    dotenv.log();

    let services = Services::build(&config)?;

    match cli.command {
        Command::Serve => serve(&config, &services).await?,
        Command::Fetch { pages, per_page } => {
            let stored = services
                .ingest
                .fetch_and_store(
                    pages.unwrap_or(config.feed.pages),
                    per_page.unwrap_or(config.feed.per_page),
                    config.feed.page_delay(),
                )
                .await?;
            info!(stored, "fetch complete");
        }
        Command::Etl { days } => {
            let stored = services
                .etl
                .run(days.unwrap_or(config.schedule.etl_window_days))
                .await?;
            println!("{}", serde_json::to_string_pretty(&stored)?);
        }
        Command::Train { days } => {
            let samples = services
                .etl
                .retrain(days.unwrap_or(config.schedule.etl_window_days))
                .await?;
            info!(samples, path = %config.storage.classifier_path.display(), "classifier retrained");
        }
        Command::Dashboard => {
            let handle = services.dashboard(&config).start()?;
            info!(addr = %handle.local_addr(), "dashboard running, press Ctrl+C to stop");
            signal::ctrl_c().await?;
            handle.stop().await;
        }
    }

    Ok(())
}

async fn serve(config: &AppConfig, services: &Services) -> Result<()> {
    let mut scheduler = Scheduler::new();

    let ingest = services.ingest.clone();
    let feed = config.feed.clone();
    scheduler.add_job(
        "fetch_market_data",
        Duration::from_secs(config.schedule.fetch_interval_secs),
        FnJob::new(move || {
            let ingest = ingest.clone();
            let feed = feed.clone();
            async move {
                ingest
                    .fetch_and_store(feed.pages, feed.per_page, feed.page_delay())
                    .await?;
                Ok::<(), anyhow::Error>(())
            }
        }),
    )?;

    let etl = services.etl.clone();
    let days = config.schedule.etl_window_days;
    scheduler.add_job(
        "run_etl",
        Duration::from_secs(config.schedule.etl_interval_secs),
        FnJob::new(move || {
            let etl = etl.clone();
            async move {
                etl.run(days).await?;
                Ok::<(), anyhow::Error>(())
            }
        }),
    )?;

    let dashboard = services.dashboard(config).start()?;
    scheduler.start()?;
    info!(
        addr = %dashboard.local_addr(),
        fetch_interval_secs = config.schedule.fetch_interval_secs,
        etl_interval_secs = config.schedule.etl_interval_secs,
        "coinpulse running, press Ctrl+C to stop"
    );

    signal::ctrl_c().await?;
    info!("shutdown requested");

    if let Err(e) = scheduler.stop().await {
        warn!(error = %e, "scheduler did not stop cleanly");
    }
    for stats in scheduler.job_stats() {
        info!(job = %stats.name, runs = stats.runs, failures = stats.failures, "job totals");
    }
    dashboard.stop().await;

    Ok(())
}
