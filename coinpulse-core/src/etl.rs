//! ETL and ingest services
//!
//! `IngestService` pulls market pages from a feed into the store.
//! `EtlService` reads a recent window back out, runs the transform pipeline,
//! saves the summary and sends a notification either way.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::feeds::{FeedError, MarketDataFeed};
use crate::metrics::MetricsCollector;
use crate::models::{MarketRecord, StoredSummary};
use crate::notifier::{Notification, Notifier};
use crate::pipeline::{PipelineError, TransformPipeline};
use crate::store::{MarketStore, StoreError};

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("extract failed: {0}")]
    Extract(#[source] StoreError),

    #[error("{0}")]
    Transform(#[from] PipelineError),

    #[error("load failed: {0}")]
    Load(#[source] StoreError),

    #[error("transform task aborted: {0}")]
    TaskAborted(String),
}

impl EtlError {
    /// Stage that failed: `extract`, `transform/<stage>` or `load`.
    pub fn stage(&self) -> String {
        match self {
            Self::Extract(_) => "extract".to_string(),
            Self::Transform(e) => format!("transform/{}", e.stage),
            Self::Load(_) => "load".to_string(),
            Self::TaskAborted(_) => "transform".to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Extract(e) | Self::Load(e) => e.kind(),
            Self::Transform(e) => e.kind(),
            Self::TaskAborted(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("fetch of page {page} failed: {source}")]
    Feed {
        page: u32,
        #[source]
        source: FeedError,
    },

    #[error("storing page {page} failed: {source}")]
    Store {
        page: u32,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Feed { source, .. } => source.kind(),
            Self::Store { source, .. } => source.kind(),
        }
    }
}

pub struct EtlService {
    store: Arc<dyn MarketStore>,
    pipeline: Arc<Mutex<TransformPipeline>>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<MetricsCollector>,
}

impl EtlService {
    pub fn new(
        store: Arc<dyn MarketStore>,
        pipeline: TransformPipeline,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            pipeline: Arc::new(Mutex::new(pipeline)),
            notifier,
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Analyze the last `days` of stored records. Falls back to every stored
    /// record when the window is empty.
    pub async fn run(&self, days: u32) -> Result<StoredSummary, EtlError> {
        let started = Instant::now();
        info!(days, "starting ETL run");

        let result = self.execute(days).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(stored) => {
                let stats = &stored.summary.pipeline_stats;
                self.metrics.record_etl_success(stats, elapsed);
                info!(
                    summary_id = %stored.id,
                    analyzed = stats.records_analyzed,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "ETL run completed"
                );
                let body = format!(
                    "Analyzed {} of {} records ({} anomalies, {} duplicates, {} invalid, {} malformed). Total market cap: {:.2}",
                    stats.records_analyzed,
                    stats.input_records,
                    stats.anomalies_detected,
                    stats.duplicates_removed,
                    stats.invalid_removed,
                    stats.malformed_rows,
                    stored.summary.market_cap_analysis.total_market_cap,
                );
                self.send(Notification::success("ETL pipeline completed successfully", body))
                    .await;
            }
            Err(e) => {
                self.metrics.record_etl_failure(&e.to_string(), elapsed);
                warn!(stage = %e.stage(), error = %e, "ETL run failed");
                let body = format!("ETL pipeline failed during {}: {}", e.stage(), e);
                self.send(Notification::failure("ETL pipeline failed", body)).await;
            }
        }

        result
    }

    /// Fit a new classifier on the last `days` of stored records and persist
    /// it. Returns the number of training samples.
    pub async fn retrain(&self, days: u32) -> Result<usize, EtlError> {
        let records = self.extract(days).await?;
        let pipeline = self.pipeline.clone();
        let samples = tokio::task::spawn_blocking(move || {
            let mut pipeline = pipeline.lock();
            pipeline.retrain(&records)
        })
        .await
        .map_err(|e| EtlError::TaskAborted(e.to_string()))??;

        info!(samples, days, "classifier retrained");
        Ok(samples)
    }

    async fn execute(&self, days: u32) -> Result<StoredSummary, EtlError> {
        let records = self.extract(days).await?;

        let pipeline = self.pipeline.clone();
        let summary = tokio::task::spawn_blocking(move || {
            let mut pipeline = pipeline.lock();
            pipeline.run(&records)
        })
        .await
        .map_err(|e| EtlError::TaskAborted(e.to_string()))??;

        self.store
            .save_summary(&summary)
            .await
            .map_err(EtlError::Load)
    }

    async fn extract(&self, days: u32) -> Result<Vec<MarketRecord>, EtlError> {
        let since = Utc::now() - chrono::Duration::days(i64::from(days));
        let recent = self.store.fetch_recent(since).await.map_err(EtlError::Extract)?;
        if !recent.is_empty() {
            info!(records = recent.len(), %since, "extracted recent records");
            return Ok(recent);
        }

        let all = self.store.fetch_all().await.map_err(EtlError::Extract)?;
        info!(records = all.len(), %since, "no records in window, using full history");
        Ok(all)
    }

    async fn send(&self, notification: Notification) {
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(error = %e, subject = %notification.subject, "notification not delivered");
        }
    }
}

pub struct IngestService {
    feed: Arc<dyn MarketDataFeed>,
    store: Arc<dyn MarketStore>,
    metrics: Arc<MetricsCollector>,
}

impl IngestService {
    pub fn new(
        feed: Arc<dyn MarketDataFeed>,
        store: Arc<dyn MarketStore>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            feed,
            store,
            metrics,
        }
    }

    /// Fetch `pages` pages sequentially, store each one as it arrives and
    /// pause `delay` between requests. Stops early on an empty page. Returns
    /// the number of records stored.
    pub async fn fetch_and_store(
        &self,
        pages: u32,
        per_page: u32,
        delay: Duration,
    ) -> Result<usize, IngestError> {
        let mut stored = 0;
        let mut fetched_pages = 0;

        for page in 1..=pages {
            let records = match self.feed.fetch_page(page, per_page).await {
                Ok(records) => records,
                Err(source) => {
                    self.metrics.record_fetch_failure(&source.to_string());
                    return Err(IngestError::Feed { page, source });
                }
            };
            fetched_pages += 1;
            if records.is_empty() {
                info!(page, feed = self.feed.name(), "empty page, stopping");
                break;
            }

            match self.store.insert_records(&records, Utc::now()).await {
                Ok(count) => stored += count,
                Err(source) => {
                    self.metrics.record_fetch_failure(&source.to_string());
                    return Err(IngestError::Store { page, source });
                }
            }
            info!(page, rows = records.len(), feed = self.feed.name(), "stored market page");

            if page < pages && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        self.metrics.record_fetch(fetched_pages, stored);
        info!(pages = fetched_pages, records = stored, "market fetch completed");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NotificationLevel;
    use crate::pipeline::PipelineConfig;
    use crate::store::{InMemoryClassifierStore, InMemoryStore};
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(
            &self,
            notification: &Notification,
        ) -> Result<(), crate::notifier::NotifyError> {
            self.sent.lock().push(notification.clone());
            Ok(())
        }
    }

    struct PagedFeed {
        pages: Vec<Vec<MarketRecord>>,
        fail_on: Option<u32>,
    }

    #[async_trait]
    impl MarketDataFeed for PagedFeed {
        async fn fetch_page(&self, page: u32, _per_page: u32) -> Result<Vec<MarketRecord>, FeedError> {
            if self.fail_on == Some(page) {
                return Err(FeedError::RateLimited);
            }
            Ok(self.pages.get(page as usize - 1).cloned().unwrap_or_default())
        }

        fn name(&self) -> &str {
            "paged"
        }
    }

    fn coin(id: &str, price: f64, cap: f64) -> MarketRecord {
        let mut r = MarketRecord::new(id, id.to_uppercase());
        r.current_price = Some(price);
        r.market_cap = Some(cap);
        r.circulating_supply = Some(cap / price);
        r.total_supply = Some(cap / price);
        r
    }

    fn service(store: Arc<InMemoryStore>, notifier: Arc<RecordingNotifier>) -> EtlService {
        let pipeline = TransformPipeline::new(
            PipelineConfig::default(),
            Arc::new(InMemoryClassifierStore::new()),
        );
        EtlService::new(store, pipeline, notifier, Arc::new(MetricsCollector::new()))
    }

    #[tokio::test]
    async fn test_run_saves_summary_and_notifies_success() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_records(
                &[coin("a", 1.0, 100.0), coin("b", 2.0, 50.0), coin("c", 3.0, 200.0)],
                Utc::now(),
            )
            .await
            .unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let etl = service(store.clone(), notifier.clone());

        let stored = etl.run(30).await.unwrap();
        assert_eq!(stored.summary.market_cap_analysis.total_market_cap, 350.0);
        assert_eq!(store.summary_count(), 1);

        let sent = notifier.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].level, NotificationLevel::Success);
        assert_eq!(etl.metrics().get_etl_metrics().runs_total, 1);
    }

    #[tokio::test]
    async fn test_empty_window_falls_back_to_all_records() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_records(
                &[coin("old", 1.0, 10.0)],
                Utc::now() - chrono::Duration::days(90),
            )
            .await
            .unwrap();
        let etl = service(store, Arc::new(RecordingNotifier::default()));

        let stored = etl.run(1).await.unwrap();
        assert_eq!(stored.summary.pipeline_stats.input_records, 1);
        assert_eq!(stored.summary.market_cap_analysis.total_market_cap, 10.0);
    }

    #[tokio::test]
    async fn test_empty_store_saves_zero_summary() {
        let store = Arc::new(InMemoryStore::new());
        let etl = service(store.clone(), Arc::new(RecordingNotifier::default()));

        let stored = etl.run(30).await.unwrap();
        assert!(stored.summary.is_empty());
        assert_eq!(store.summary_count(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_names_extract_stage_and_notifies() {
        let store = Arc::new(InMemoryStore::new());
        store.set_offline(true);
        let notifier = Arc::new(RecordingNotifier::default());
        let etl = service(store, notifier.clone());

        let err = etl.run(30).await.unwrap_err();
        assert_eq!(err.stage(), "extract");
        assert!(err.is_retryable());

        let sent = notifier.sent.lock();
        assert_eq!(sent[0].level, NotificationLevel::Failure);
        assert_eq!(etl.metrics().get_etl_metrics().runs_failed, 1);
    }

    #[tokio::test]
    async fn test_retrain_uses_stored_records() {
        let store = Arc::new(InMemoryStore::new());
        let records: Vec<MarketRecord> = (1..=12)
            .map(|i| coin(&format!("c{i}"), i as f64, 100.0 * i as f64))
            .collect();
        store.insert_records(&records, Utc::now()).await.unwrap();
        let etl = service(store, Arc::new(RecordingNotifier::default()));

        assert_eq!(etl.retrain(30).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_ingest_stores_pages_until_empty() {
        let store = Arc::new(InMemoryStore::new());
        let feed = Arc::new(PagedFeed {
            pages: vec![vec![coin("a", 1.0, 1.0), coin("b", 1.0, 1.0)], vec![coin("c", 1.0, 1.0)]],
            fail_on: None,
        });
        let metrics = Arc::new(MetricsCollector::new());
        let ingest = IngestService::new(feed, store.clone(), metrics.clone());

        let stored = ingest.fetch_and_store(5, 2, Duration::ZERO).await.unwrap();
        assert_eq!(stored, 3);
        assert_eq!(store.record_count(), 3);
        assert_eq!(metrics.get_ingest_metrics().pages_fetched_total, 3);
    }

    #[tokio::test]
    async fn test_ingest_feed_error_keeps_earlier_pages() {
        let store = Arc::new(InMemoryStore::new());
        let feed = Arc::new(PagedFeed {
            pages: vec![vec![coin("a", 1.0, 1.0)], vec![coin("b", 1.0, 1.0)]],
            fail_on: Some(2),
        });
        let metrics = Arc::new(MetricsCollector::new());
        let ingest = IngestService::new(feed, store.clone(), metrics.clone());

        let err = ingest.fetch_and_store(2, 1, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, IngestError::Feed { page: 2, .. }));
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        assert_eq!(store.record_count(), 1);
        assert_eq!(metrics.get_ingest_metrics().fetches_failed, 1);
    }
}
