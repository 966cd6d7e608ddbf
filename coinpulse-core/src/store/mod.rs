//! Persistence collaborators
//!
//! `MarketStore` holds raw snapshots and analysis summaries; `ClassifierStore`
//! holds the trained anomaly model. Both are injected into the services that
//! use them, so tests run against the in-memory implementations.

pub mod classifier;
pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::anomaly::ClassifierState;
use crate::error::ErrorKind;
use crate::models::{AnalysisSummary, MarketRecord, StoredSummary};

pub use classifier::{FileClassifierStore, InMemoryClassifierStore};
pub use file::JsonFileStore;
pub use memory::InMemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Unavailable(_) => ErrorKind::Recoverable,
            Self::Serialization(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Raw market snapshots in, analysis summaries out.
#[async_trait]
pub trait MarketStore: Send + Sync {
    /// Append a batch of raw records, stamped with `fetched_at`.
    async fn insert_records(
        &self,
        records: &[MarketRecord],
        fetched_at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// All records fetched at or after `since`, oldest first.
    async fn fetch_recent(&self, since: DateTime<Utc>) -> Result<Vec<MarketRecord>, StoreError>;

    async fn fetch_all(&self) -> Result<Vec<MarketRecord>, StoreError>;

    /// Persist one summary, stamped with the current time.
    async fn save_summary(&self, summary: &AnalysisSummary) -> Result<StoredSummary, StoreError>;

    async fn latest_summary(&self) -> Result<Option<StoredSummary>, StoreError>;

    /// Up to `limit` summaries, newest first.
    async fn recent_summaries(&self, limit: usize) -> Result<Vec<StoredSummary>, StoreError>;
}

#[derive(Error, Debug)]
pub enum ClassifierStoreError {
    #[error("no trained classifier state found")]
    NotFound,

    #[error("classifier store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("classifier state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl ClassifierStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound | Self::Corrupt(_) => ErrorKind::Fatal,
            Self::Io(_) => ErrorKind::Recoverable,
        }
    }
}

/// Load/save of trained classifier state. No internal locking: callers must
/// serialize fit-and-save across processes.
pub trait ClassifierStore: Send + Sync {
    fn load(&self) -> Result<ClassifierState, ClassifierStoreError>;

    fn save(&self, state: &ClassifierState) -> Result<(), ClassifierStoreError>;
}
