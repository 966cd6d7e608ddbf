//! Deduplication, fill policy and validity checks for market records

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{MarketRecord, SanitizedRecord};

/// Rows removed by each sanitation step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizeReport {
    pub duplicates_removed: usize,
    pub invalid_removed: usize,
}

/// Which columns identify a duplicate row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeKey {
    /// `(id, last_updated)`: one row per asset per observation time.
    #[default]
    Observation,
    /// `id` only: the latest row per asset wins regardless of timestamp.
    Asset,
}

#[derive(Debug, Clone, Default)]
pub struct RecordSanitizer {
    dedupe_key: DedupeKey,
}

impl RecordSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dedupe_key(mut self, key: DedupeKey) -> Self {
        self.dedupe_key = key;
        self
    }

    pub fn dedupe_key(&self) -> DedupeKey {
        self.dedupe_key
    }

    pub fn sanitize(&self, records: &[MarketRecord]) -> Vec<SanitizedRecord> {
        self.sanitize_with_report(records).0
    }

    /// Dedupe, fill, discard invalid rows, then derive ranked columns.
    /// The input is left untouched.
    pub fn sanitize_with_report(
        &self,
        records: &[MarketRecord],
    ) -> (Vec<SanitizedRecord>, SanitizeReport) {
        let deduped = dedupe_keep_last(records, self.dedupe_key);
        let duplicates_removed = records.len() - deduped.len();

        let valid: Vec<MarketRecord> = deduped
            .into_iter()
            .map(fill_missing)
            .filter(is_valid)
            .collect();
        let invalid_removed = records.len() - duplicates_removed - valid.len();

        let report = SanitizeReport {
            duplicates_removed,
            invalid_removed,
        };
        debug!(
            input = records.len(),
            kept = valid.len(),
            duplicates_removed,
            invalid_removed,
            "sanitized batch"
        );

        (derive_columns(valid), report)
    }
}

/// Keep the last occurrence of each key; survivors stay in input order.
fn dedupe_keep_last(records: &[MarketRecord], key: DedupeKey) -> Vec<MarketRecord> {
    let mut seen: HashSet<(&str, Option<DateTime<Utc>>)> = HashSet::with_capacity(records.len());
    let mut kept: Vec<MarketRecord> = records
        .iter()
        .rev()
        .filter(|r| {
            let observed = match key {
                DedupeKey::Observation => r.last_updated,
                DedupeKey::Asset => None,
            };
            seen.insert((r.id.as_str(), observed))
        })
        .cloned()
        .collect();
    kept.reverse();
    kept
}

fn fill_missing(mut record: MarketRecord) -> MarketRecord {
    record.price_change_percentage_24h = Some(record.price_change_percentage_24h.unwrap_or(0.0));
    record.market_cap = Some(record.market_cap.unwrap_or(0.0));
    let circulating = record.circulating_supply.unwrap_or(0.0);
    record.circulating_supply = Some(circulating);
    record.total_supply = Some(record.total_supply.unwrap_or(circulating));
    record
}

fn is_valid(record: &MarketRecord) -> bool {
    record.market_cap.map_or(false, |v| v > 0.0) && record.current_price.map_or(false, |v| v > 0.0)
}

fn derive_columns(records: Vec<MarketRecord>) -> Vec<SanitizedRecord> {
    // stable sort: equal caps keep input order
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(OrderedFloat(records[i].market_cap.unwrap_or(0.0))));
    let mut ranks = vec![0usize; records.len()];
    for (position, &i) in order.iter().enumerate() {
        ranks[i] = position + 1;
    }

    records
        .into_iter()
        .zip(ranks)
        .map(|(record, market_cap_rank)| {
            let circulating = record.circulating_supply.unwrap_or(0.0);
            let total = record.total_supply.unwrap_or(0.0);
            let supply_utilization = if total == 0.0 {
                None
            } else {
                Some(circulating / total)
            };
            let price_volatility = record.price_change_percentage_24h.unwrap_or(0.0).abs();

            SanitizedRecord {
                record,
                supply_utilization,
                market_cap_rank,
                price_volatility,
            }
        })
        .collect()
}
