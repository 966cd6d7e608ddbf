//! Crypto market snapshot analytics
//!
//! Raw market rows are filtered for anomalies, sanitized and aggregated into
//! one `AnalysisSummary` per run. Feeds, stores, notifications and the
//! dashboard are injected collaborators around that transform stage.

pub mod aggregator;
pub mod anomaly;
pub mod api;
pub mod error;
pub mod etl;
pub mod feeds;
pub mod metrics;
pub mod models;
pub mod notifier;
pub mod pipeline;
pub mod sanitizer;
pub mod store;

// Re-export main types for easy access
pub use anomaly::{AnomalyConfig, AnomalyError, AnomalyFilter, Classification, ClassifierState};
pub use api::{DashboardConfig, DashboardHandle, DashboardServer};
pub use error::ErrorKind;
pub use etl::{EtlError, EtlService, IngestError, IngestService};
pub use feeds::{CoinGeckoFeed, FeedConfig, FeedError, MarketDataFeed};
pub use metrics::MetricsCollector;
pub use models::{AnalysisSummary, MarketRecord, PipelineStats, SanitizedRecord, StoredSummary};
pub use notifier::{LogNotifier, Notification, Notifier, WebhookNotifier};
pub use pipeline::{BootstrapPolicy, PipelineConfig, PipelineError, PipelineStage, TransformPipeline};
pub use sanitizer::{DedupeKey, RecordSanitizer, SanitizeReport};
pub use store::{
    ClassifierStore, ClassifierStoreError, FileClassifierStore, InMemoryClassifierStore,
    InMemoryStore, JsonFileStore, MarketStore, StoreError,
};
