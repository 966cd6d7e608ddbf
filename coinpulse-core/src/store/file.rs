//! JSON-lines market store on the local filesystem

use std::io::{ErrorKind as IoErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{MarketStore, StoreError};
use crate::models::{AnalysisSummary, MarketRecord, StoredRecord, StoredSummary};

pub const MARKET_DATA_FILE: &str = "market_data.jsonl";
pub const ANALYSIS_RESULTS_FILE: &str = "analysis_results.jsonl";

/// Two append-only files in `data_dir`: raw rows and analysis summaries.
pub struct JsonFileStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn market_data_path(&self) -> PathBuf {
        self.data_dir.join(MARKET_DATA_FILE)
    }

    fn analysis_results_path(&self) -> PathBuf {
        self.data_dir.join(ANALYSIS_RESULTS_FILE)
    }

    async fn append<T: Serialize>(&self, path: &Path, items: &[T]) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for item in items {
            buf.push_str(&serde_json::to_string(item)?);
            buf.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await?;

        // Terminate a torn last line so the new rows start on their own line.
        if file.metadata().await?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                warn!(path = %path.display(), "terminating torn last line before append");
                buf.insert(0, '\n');
            }
        }

        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Reads every line of `path`; a missing file is empty. Lines that fail to
    /// parse (e.g. a torn final write) are skipped with a warning.
    async fn read_all<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>, StoreError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut items = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(item) => items.push(item),
                Err(e) => warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "skipping unreadable store line"
                ),
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl MarketStore for JsonFileStore {
    async fn insert_records(
        &self,
        records: &[MarketRecord],
        fetched_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let stored: Vec<StoredRecord> = records
            .iter()
            .cloned()
            .map(|record| StoredRecord { fetched_at, record })
            .collect();
        self.append(&self.market_data_path(), &stored).await?;
        debug!(count = stored.len(), "stored market records");
        Ok(stored.len())
    }

    async fn fetch_recent(&self, since: DateTime<Utc>) -> Result<Vec<MarketRecord>, StoreError> {
        let stored: Vec<StoredRecord> = self.read_all(&self.market_data_path()).await?;
        Ok(stored
            .into_iter()
            .filter(|r| r.fetched_at >= since)
            .map(|r| r.record)
            .collect())
    }

    async fn fetch_all(&self) -> Result<Vec<MarketRecord>, StoreError> {
        let stored: Vec<StoredRecord> = self.read_all(&self.market_data_path()).await?;
        Ok(stored.into_iter().map(|r| r.record).collect())
    }

    async fn save_summary(&self, summary: &AnalysisSummary) -> Result<StoredSummary, StoreError> {
        let stored = StoredSummary::new(summary.clone());
        self.append(&self.analysis_results_path(), std::slice::from_ref(&stored))
            .await?;
        Ok(stored)
    }

    async fn latest_summary(&self) -> Result<Option<StoredSummary>, StoreError> {
        let summaries: Vec<StoredSummary> = self.read_all(&self.analysis_results_path()).await?;
        Ok(summaries.into_iter().last())
    }

    async fn recent_summaries(&self, limit: usize) -> Result<Vec<StoredSummary>, StoreError> {
        let summaries: Vec<StoredSummary> = self.read_all(&self.analysis_results_path()).await?;
        Ok(summaries.into_iter().rev().take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("coinpulse-store-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_missing_files_read_as_empty() {
        let store = JsonFileStore::new(scratch_dir());
        assert!(store.fetch_all().await.unwrap().is_empty());
        assert!(store.latest_summary().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_round_trip_with_fetch_time() {
        let dir = scratch_dir();
        let store = JsonFileStore::new(&dir);
        let now = Utc::now();

        let mut btc = MarketRecord::new("bitcoin", "Bitcoin");
        btc.market_cap = Some(1.0e12);
        store
            .insert_records(&[MarketRecord::new("old", "Old")], now - Duration::days(45))
            .await
            .unwrap();
        store.insert_records(&[btc.clone()], now).await.unwrap();

        let recent = store.fetch_recent(now - Duration::days(30)).await.unwrap();
        assert_eq!(recent, vec![btc]);
        assert_eq!(store.fetch_all().await.unwrap().len(), 2);
        assert!(dir.join(MARKET_DATA_FILE).exists());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_summaries_append_and_read_newest_first() {
        let dir = scratch_dir();
        let store = JsonFileStore::new(&dir);

        let first = store.save_summary(&AnalysisSummary::zero()).await.unwrap();
        let second = store.save_summary(&AnalysisSummary::zero()).await.unwrap();

        assert_eq!(store.latest_summary().await.unwrap().unwrap().id, second.id);
        let recent = store.recent_summaries(5).await.unwrap();
        assert_eq!(recent.iter().map(|s| s.id).collect::<Vec<_>>(), vec![second.id, first.id]);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_torn_line_is_skipped() {
        let dir = scratch_dir();
        let store = JsonFileStore::new(&dir);
        store
            .insert_records(&[MarketRecord::new("a", "A")], Utc::now())
            .await
            .unwrap();
        let path = dir.join(MARKET_DATA_FILE);
        let mut contents = tokio::fs::read_to_string(&path).await.unwrap();
        contents.push_str("{\"fetched_at\": \"2024-");
        tokio::fs::write(&path, contents).await.unwrap();

        assert_eq!(store.fetch_all().await.unwrap().len(), 1);

        store
            .insert_records(&[MarketRecord::new("b", "B"), MarketRecord::new("c", "C")], Utc::now())
            .await
            .unwrap();
        let ids: Vec<String> = store
            .fetch_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
