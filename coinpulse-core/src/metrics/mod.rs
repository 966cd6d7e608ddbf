//! Run metrics for the ETL and ingest services
//!
//! Counters are updated by the services after each run and served read-only
//! by the dashboard API.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::PipelineStats;

/// ETL run counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EtlMetrics {
    pub runs_total: u64,
    pub runs_failed: u64,
    pub records_analyzed_total: u64,
    pub anomalies_total: u64,
    pub malformed_total: u64,
    pub duplicates_total: u64,
    pub invalid_total: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_duration_ms: u64,
    pub last_error: Option<String>,
    pub last_stats: Option<PipelineStats>,
}

/// Market fetch counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestMetrics {
    pub fetches_total: u64,
    pub fetches_failed: u64,
    pub pages_fetched_total: u64,
    pub records_stored_total: u64,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub etl: EtlMetrics,
    pub ingest: IngestMetrics,
}

pub struct MetricsCollector {
    started_at: DateTime<Utc>,
    etl: Arc<RwLock<EtlMetrics>>,
    ingest: Arc<RwLock<IngestMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            etl: Arc::new(RwLock::new(EtlMetrics::default())),
            ingest: Arc::new(RwLock::new(IngestMetrics::default())),
        }
    }

    pub fn record_etl_success(&self, stats: &PipelineStats, elapsed: Duration) {
        let now = Utc::now();
        let mut metrics = self.etl.write();
        metrics.runs_total += 1;
        metrics.records_analyzed_total += stats.records_analyzed as u64;
        metrics.anomalies_total += stats.anomalies_detected as u64;
        metrics.malformed_total += stats.malformed_rows as u64;
        metrics.duplicates_total += stats.duplicates_removed as u64;
        metrics.invalid_total += stats.invalid_removed as u64;
        metrics.last_run_at = Some(now);
        metrics.last_success_at = Some(now);
        metrics.last_duration_ms = elapsed.as_millis() as u64;
        metrics.last_error = None;
        metrics.last_stats = Some(stats.clone());
    }

    pub fn record_etl_failure(&self, error: &str, elapsed: Duration) {
        let mut metrics = self.etl.write();
        metrics.runs_total += 1;
        metrics.runs_failed += 1;
        metrics.last_run_at = Some(Utc::now());
        metrics.last_duration_ms = elapsed.as_millis() as u64;
        metrics.last_error = Some(error.to_string());
    }

    pub fn record_fetch(&self, pages: u32, records_stored: usize) {
        let mut metrics = self.ingest.write();
        metrics.fetches_total += 1;
        metrics.pages_fetched_total += u64::from(pages);
        metrics.records_stored_total += records_stored as u64;
        metrics.last_fetch_at = Some(Utc::now());
        metrics.last_error = None;
    }

    pub fn record_fetch_failure(&self, error: &str) {
        let mut metrics = self.ingest.write();
        metrics.fetches_total += 1;
        metrics.fetches_failed += 1;
        metrics.last_fetch_at = Some(Utc::now());
        metrics.last_error = Some(error.to_string());
    }

    pub fn get_etl_metrics(&self) -> EtlMetrics {
        self.etl.read().clone()
    }

    pub fn get_ingest_metrics(&self) -> IngestMetrics {
        self.ingest.read().clone()
    }

    pub fn get_all_metrics(&self) -> ServiceMetrics {
        let now = Utc::now();
        ServiceMetrics {
            timestamp: now,
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            etl: self.get_etl_metrics(),
            ingest: self.get_ingest_metrics(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_then_failure_counters() {
        let metrics = MetricsCollector::new();
        let stats = PipelineStats {
            input_records: 10,
            malformed_rows: 1,
            anomalies_detected: 2,
            duplicates_removed: 1,
            invalid_removed: 1,
            records_analyzed: 5,
        };

        metrics.record_etl_success(&stats, Duration::from_millis(12));
        metrics.record_etl_failure("store offline", Duration::from_millis(3));

        let etl = metrics.get_etl_metrics();
        assert_eq!(etl.runs_total, 2);
        assert_eq!(etl.runs_failed, 1);
        assert_eq!(etl.records_analyzed_total, 5);
        assert_eq!(etl.anomalies_total, 2);
        assert_eq!(etl.last_error.as_deref(), Some("store offline"));
        assert_eq!(etl.last_duration_ms, 3);
        assert!(etl.last_success_at.is_some());
    }

    #[test]
    fn test_fetch_counters() {
        let metrics = MetricsCollector::new();
        metrics.record_fetch(3, 300);
        metrics.record_fetch_failure("rate limit exceeded");

        let ingest = metrics.get_all_metrics().ingest;
        assert_eq!(ingest.fetches_total, 2);
        assert_eq!(ingest.fetches_failed, 1);
        assert_eq!(ingest.pages_fetched_total, 3);
        assert_eq!(ingest.records_stored_total, 300);
    }
}
