//! Market snapshot records and the analysis summary document

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row per tracked asset at one observation time, as returned by the
/// `/coins/markets` endpoint. Unknown upstream fields are ignored and JSON
/// `null` maps to `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRecord {
    pub id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub circulating_supply: Option<f64>,
    #[serde(default)]
    pub total_supply: Option<f64>,
    #[serde(default)]
    pub total_volume: Option<f64>,
    #[serde(default)]
    pub price_change_percentage_24h: Option<f64>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl MarketRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            symbol: String::new(),
            name: name.into(),
            current_price: None,
            market_cap: None,
            circulating_supply: None,
            total_supply: None,
            total_volume: None,
            price_change_percentage_24h: None,
            last_updated: None,
        }
    }

    /// Numeric fields in a fixed order, used for malformed-row checks.
    pub(crate) fn numeric_fields(&self) -> [(&'static str, Option<f64>); 6] {
        [
            ("current_price", self.current_price),
            ("market_cap", self.market_cap),
            ("circulating_supply", self.circulating_supply),
            ("total_supply", self.total_supply),
            ("total_volume", self.total_volume),
            ("price_change_percentage_24h", self.price_change_percentage_24h),
        ]
    }
}

/// A market record after deduplication and fill, extended with derived columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizedRecord {
    pub record: MarketRecord,
    /// `circulating_supply / total_supply`; `None` when total supply is zero.
    pub supply_utilization: Option<f64>,
    /// 1-based rank by descending market cap.
    pub market_cap_rank: usize,
    pub price_volatility: f64,
}

impl SanitizedRecord {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn market_cap(&self) -> f64 {
        self.record.market_cap.unwrap_or(0.0)
    }

    pub fn price_change_24h(&self) -> f64 {
        self.record.price_change_percentage_24h.unwrap_or(0.0)
    }

    pub fn into_record(self) -> MarketRecord {
        self.record
    }
}

/// `{name, value}` pair used by every ranked list in the summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub name: String,
    pub value: f64,
}

impl RankedEntry {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub mean: f64,
    pub median: f64,
    /// Sample standard deviation (n - 1); zero when fewer than two values.
    pub std: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketCapAnalysis {
    pub total_market_cap: f64,
    pub top_10_market_cap: f64,
    pub market_cap_distribution: Distribution,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceAnalysis {
    pub avg_price_change_24h: f64,
    pub most_volatile: Vec<RankedEntry>,
    pub least_volatile: Vec<RankedEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupplyAnalysis {
    pub avg_supply_utilization: f64,
    pub records_with_utilization: usize,
    pub highest_utilization: Vec<RankedEntry>,
    pub lowest_utilization: Vec<RankedEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopPerformers {
    pub by_market_cap: Vec<RankedEntry>,
    pub by_volume: Vec<RankedEntry>,
    pub by_price_change: Vec<RankedEntry>,
}

/// Row accounting for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub input_records: usize,
    pub malformed_rows: usize,
    pub anomalies_detected: usize,
    pub duplicates_removed: usize,
    pub invalid_removed: usize,
    pub records_analyzed: usize,
}

/// Output of one transform run. The `Default` value is the canonical zero
/// summary returned for empty input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub market_cap_analysis: MarketCapAnalysis,
    pub price_analysis: PriceAnalysis,
    pub supply_analysis: SupplyAnalysis,
    pub top_performers: TopPerformers,
    pub pipeline_stats: PipelineStats,
}

impl AnalysisSummary {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pipeline_stats.records_analyzed == 0
    }
}

/// A summary as persisted by a store, stamped at save time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSummary {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub summary: AnalysisSummary,
}

impl StoredSummary {
    pub fn new(summary: AnalysisSummary) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            summary,
        }
    }
}

/// A raw record as persisted by a store, stamped with its fetch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub fetched_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: MarketRecord,
}
