//! Summary statistics over sanitized market records
//!
//! Every function here is pure and independent of the others. Rankings are a
//! stable sort followed by truncation, so equal keys keep their input order.

use ordered_float::OrderedFloat;

use crate::models::{
    Distribution, MarketCapAnalysis, PriceAnalysis, RankedEntry, SanitizedRecord, SupplyAnalysis,
    TopPerformers,
};

pub const TOP_MARKET_CAP_COUNT: usize = 10;
pub const PRICE_LEADERS_COUNT: usize = 5;
pub const UTILIZATION_LEADERS_COUNT: usize = 5;
pub const TOP_PERFORMERS_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankOrder {
    Largest,
    Smallest,
}

/// Stable top-N selection. Records for which `key` returns `None` are skipped.
pub fn rank_by<F>(records: &[SanitizedRecord], n: usize, order: RankOrder, key: F) -> Vec<RankedEntry>
where
    F: Fn(&SanitizedRecord) -> Option<f64>,
{
    let mut keyed: Vec<(&SanitizedRecord, f64)> = records
        .iter()
        .filter_map(|r| key(r).map(|v| (r, v)))
        .collect();

    match order {
        RankOrder::Largest => keyed.sort_by(|a, b| OrderedFloat(b.1).cmp(&OrderedFloat(a.1))),
        RankOrder::Smallest => keyed.sort_by(|a, b| OrderedFloat(a.1).cmp(&OrderedFloat(b.1))),
    }

    keyed
        .into_iter()
        .take(n)
        .map(|(r, v)| RankedEntry::new(r.name(), v))
        .collect()
}

pub fn market_cap_summary(records: &[SanitizedRecord]) -> MarketCapAnalysis {
    let caps: Vec<f64> = records.iter().map(SanitizedRecord::market_cap).collect();
    let top_10_market_cap = rank_by(records, TOP_MARKET_CAP_COUNT, RankOrder::Largest, |r| {
        Some(r.market_cap())
    })
    .iter()
    .map(|e| e.value)
    .sum();

    MarketCapAnalysis {
        total_market_cap: caps.iter().sum(),
        top_10_market_cap,
        market_cap_distribution: distribution(&caps),
    }
}

pub fn price_change_summary(records: &[SanitizedRecord]) -> PriceAnalysis {
    let changes: Vec<f64> = records.iter().map(SanitizedRecord::price_change_24h).collect();
    let change = |r: &SanitizedRecord| Some(r.price_change_24h());

    PriceAnalysis {
        avg_price_change_24h: mean(&changes),
        most_volatile: rank_by(records, PRICE_LEADERS_COUNT, RankOrder::Largest, change),
        least_volatile: rank_by(records, PRICE_LEADERS_COUNT, RankOrder::Smallest, change),
    }
}

/// Only records with a defined utilization take part.
pub fn supply_utilization_summary(records: &[SanitizedRecord]) -> SupplyAnalysis {
    let defined: Vec<f64> = records.iter().filter_map(|r| r.supply_utilization).collect();
    let utilization = |r: &SanitizedRecord| r.supply_utilization;

    SupplyAnalysis {
        avg_supply_utilization: mean(&defined),
        records_with_utilization: defined.len(),
        highest_utilization: rank_by(records, UTILIZATION_LEADERS_COUNT, RankOrder::Largest, utilization),
        lowest_utilization: rank_by(records, UTILIZATION_LEADERS_COUNT, RankOrder::Smallest, utilization),
    }
}

pub fn top_performers(records: &[SanitizedRecord]) -> TopPerformers {
    TopPerformers {
        by_market_cap: rank_by(records, TOP_PERFORMERS_COUNT, RankOrder::Largest, |r| {
            Some(r.market_cap())
        }),
        // unknown volume is not ranked
        by_volume: rank_by(records, TOP_PERFORMERS_COUNT, RankOrder::Largest, |r| {
            r.record.total_volume
        }),
        by_price_change: rank_by(records, TOP_PERFORMERS_COUNT, RankOrder::Largest, |r| {
            Some(r.price_change_24h())
        }),
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Mean, median and sample standard deviation (n - 1).
fn distribution(values: &[f64]) -> Distribution {
    let m = mean(values);
    let std = if values.len() < 2 {
        0.0
    } else {
        let ss = values.iter().map(|v| (v - m).powi(2)).sum::<f64>();
        (ss / (values.len() - 1) as f64).sqrt()
    };

    Distribution {
        mean: m,
        median: median(values),
        std,
    }
}
