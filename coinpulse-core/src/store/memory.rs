//! In-process market store

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{MarketStore, StoreError};
use crate::models::{AnalysisSummary, MarketRecord, StoredRecord, StoredSummary};

/// Keeps everything in memory. Can be switched offline to exercise
/// store-failure paths.
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<Vec<StoredRecord>>,
    summaries: RwLock<Vec<StoredSummary>>,
    offline: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    pub fn summary_count(&self) -> usize {
        self.summaries.read().len()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MarketStore for InMemoryStore {
    async fn insert_records(
        &self,
        records: &[MarketRecord],
        fetched_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.check_online()?;
        let mut stored = self.records.write();
        stored.extend(records.iter().cloned().map(|record| StoredRecord { fetched_at, record }));
        Ok(records.len())
    }

    async fn fetch_recent(&self, since: DateTime<Utc>) -> Result<Vec<MarketRecord>, StoreError> {
        self.check_online()?;
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.fetched_at >= since)
            .map(|r| r.record.clone())
            .collect())
    }

    async fn fetch_all(&self) -> Result<Vec<MarketRecord>, StoreError> {
        self.check_online()?;
        Ok(self.records.read().iter().map(|r| r.record.clone()).collect())
    }

    async fn save_summary(&self, summary: &AnalysisSummary) -> Result<StoredSummary, StoreError> {
        self.check_online()?;
        let stored = StoredSummary::new(summary.clone());
        self.summaries.write().push(stored.clone());
        Ok(stored)
    }

    async fn latest_summary(&self) -> Result<Option<StoredSummary>, StoreError> {
        self.check_online()?;
        Ok(self.summaries.read().last().cloned())
    }

    async fn recent_summaries(&self, limit: usize) -> Result<Vec<StoredSummary>, StoreError> {
        self.check_online()?;
        Ok(self.summaries.read().iter().rev().take(limit).cloned().collect())
    }
}
