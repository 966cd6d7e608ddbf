//! Anomaly filtering for raw market records
//!
//! Records are projected onto a fixed five-feature vector, standardized with
//! statistics learned at fit time, and scored by an isolation forest. Fitting
//! is an explicit operation; classification never refits.

pub mod forest;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::models::MarketRecord;
pub use forest::IsolationForest;

pub const FEATURE_COUNT: usize = 5;

/// Feature order used for both fitting and classification.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "current_price",
    "market_cap",
    "circulating_supply",
    "total_supply",
    "price_change_percentage_24h",
];

pub type FeatureVector = [f64; FEATURE_COUNT];

const STATE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum AnomalyError {
    #[error("anomaly model has not been fitted or loaded")]
    NotFitted,

    #[error("cannot fit anomaly model on an empty batch")]
    EmptyTrainingSet,

    #[error("invalid anomaly configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported classifier state version {0}")]
    UnsupportedVersion(u32),
}

/// Tunables for the outlier model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Expected fraction of outliers in the training batch.
    pub contamination: f64,
    pub n_estimators: usize,
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            contamination: 0.1,
            n_estimators: 100,
            max_samples: 256,
            seed: 42,
        }
    }
}

impl AnomalyConfig {
    pub fn with_contamination(mut self, contamination: f64) -> Self {
        self.contamination = contamination;
        self
    }

    pub fn validate(&self) -> Result<(), AnomalyError> {
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(AnomalyError::InvalidConfig(format!(
                "contamination must be in (0, 0.5], got {}",
                self.contamination
            )));
        }
        if self.n_estimators == 0 {
            return Err(AnomalyError::InvalidConfig(
                "n_estimators must be > 0".to_string(),
            ));
        }
        if self.max_samples == 0 {
            return Err(AnomalyError::InvalidConfig(
                "max_samples must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Zero-mean, unit-variance scaling learned from the training batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaler {
    pub mean: FeatureVector,
    pub scale: FeatureVector,
}

impl FeatureScaler {
    pub fn fit(rows: &[FeatureVector]) -> Self {
        let mut mean = [0.0; FEATURE_COUNT];
        let mut scale = [1.0; FEATURE_COUNT];
        if rows.is_empty() {
            return Self { mean, scale };
        }

        let n = rows.len() as f64;
        for f in 0..FEATURE_COUNT {
            // Sums run in units of the largest magnitude so they stay finite
            // for values near f64::MAX.
            let bound = rows
                .iter()
                .map(|r| r[f].abs())
                .filter(|v| v.is_finite())
                .fold(0.0, f64::max);
            if bound == 0.0 {
                continue;
            }

            let m = rows.iter().map(|r| r[f] / bound).sum::<f64>() / n;
            let var = rows.iter().map(|r| (r[f] / bound - m).powi(2)).sum::<f64>() / n;
            let std = var.sqrt() * bound;
            mean[f] = m * bound;
            // constant features pass through unscaled
            scale[f] = if var.is_nan() || var <= 0.0 {
                1.0
            } else if std.is_finite() && std > 0.0 {
                std
            } else {
                bound
            };
        }

        Self { mean, scale }
    }

    pub fn transform(&self, row: &FeatureVector) -> FeatureVector {
        let mut out = [0.0; FEATURE_COUNT];
        for f in 0..FEATURE_COUNT {
            let centered = row[f] - self.mean[f];
            out[f] = if centered.is_finite() {
                centered / self.scale[f]
            } else {
                row[f] / self.scale[f] - self.mean[f] / self.scale[f]
            };
        }
        out
    }
}

/// Persistable trained model: scaler, forest and decision threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierState {
    pub version: u32,
    pub contamination: f64,
    pub scaler: FeatureScaler,
    pub forest: IsolationForest,
    /// Scores strictly above this are anomalous.
    pub threshold: f64,
    pub training_samples: usize,
    pub trained_at: DateTime<Utc>,
}

/// Disjoint split of a batch into normal and anomalous rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub normal: Vec<MarketRecord>,
    pub anomalous: Vec<MarketRecord>,
}

/// Feature projection; missing and non-finite values become 0.
pub fn features(record: &MarketRecord) -> FeatureVector {
    let clean = |v: Option<f64>| v.filter(|x| x.is_finite()).unwrap_or(0.0);
    [
        clean(record.current_price),
        clean(record.market_cap),
        clean(record.circulating_supply),
        clean(record.total_supply),
        clean(record.price_change_percentage_24h),
    ]
}

pub struct AnomalyFilter {
    config: AnomalyConfig,
    state: Option<ClassifierState>,
}

impl AnomalyFilter {
    pub fn new(config: AnomalyConfig) -> Result<Self, AnomalyError> {
        config.validate()?;
        Ok(Self {
            config,
            state: None,
        })
    }

    /// Restore a filter from previously trained state.
    pub fn from_state(config: AnomalyConfig, state: ClassifierState) -> Result<Self, AnomalyError> {
        config.validate()?;
        if state.version != STATE_VERSION {
            return Err(AnomalyError::UnsupportedVersion(state.version));
        }
        Ok(Self {
            config,
            state: Some(state),
        })
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&ClassifierState> {
        self.state.as_ref()
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Learn scaling and the decision boundary from `records`.
    ///
    /// The threshold is chosen so that `floor(contamination * n)` of the
    /// training rows score above it.
    pub fn fit(&mut self, records: &[MarketRecord]) -> Result<&ClassifierState, AnomalyError> {
        if records.is_empty() {
            return Err(AnomalyError::EmptyTrainingSet);
        }

        let raw: Vec<FeatureVector> = records.iter().map(features).collect();
        let scaler = FeatureScaler::fit(&raw);
        let scaled: Vec<FeatureVector> = raw.iter().map(|r| scaler.transform(r)).collect();

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let forest = IsolationForest::fit(
            &scaled,
            self.config.n_estimators,
            self.config.max_samples,
            &mut rng,
        );

        let mut scores: Vec<f64> = scaled.iter().map(|x| forest.score(x)).collect();
        scores.sort_by(|a, b| b.total_cmp(a));
        let expected_outliers = (self.config.contamination * scores.len() as f64).floor() as usize;
        let threshold = scores[expected_outliers.min(scores.len() - 1)];

        debug!(
            samples = records.len(),
            expected_outliers,
            threshold,
            "fitted anomaly model"
        );

        let state = self.state.insert(ClassifierState {
            version: STATE_VERSION,
            contamination: self.config.contamination,
            scaler,
            forest,
            threshold,
            training_samples: records.len(),
            trained_at: Utc::now(),
        });
        Ok(&*state)
    }

    /// Per-row anomaly flags, in input order.
    pub fn predict(&self, records: &[MarketRecord]) -> Result<Vec<bool>, AnomalyError> {
        let state = self.state.as_ref().ok_or(AnomalyError::NotFitted)?;
        Ok(records
            .iter()
            .map(|r| {
                let x = state.scaler.transform(&features(r));
                state.forest.score(&x) > state.threshold
            })
            .collect())
    }

    pub fn classify(&self, records: &[MarketRecord]) -> Result<Classification, AnomalyError> {
        let flags = self.predict(records)?;
        let mut out = Classification::default();
        for (record, anomalous) in records.iter().zip(flags) {
            if anomalous {
                out.anomalous.push(record.clone());
            } else {
                out.normal.push(record.clone());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coin(id: &str, price: f64, cap: f64, change: f64) -> MarketRecord {
        let mut r = MarketRecord::new(id, id.to_uppercase());
        r.current_price = Some(price);
        r.market_cap = Some(cap);
        r.circulating_supply = Some(cap / price);
        r.total_supply = Some(cap / price * 1.1);
        r.price_change_percentage_24h = Some(change);
        r
    }

    fn baseline() -> Vec<MarketRecord> {
        (0..60)
            .map(|i| {
                let i = i as f64;
                coin(&format!("c{i}"), 1.0 + (i % 6.0) * 0.1, 1.0e6 + i * 1.0e3, (i % 5.0) - 2.0)
            })
            .collect()
    }

    #[test]
    fn test_classify_before_fit_is_not_fitted() {
        let filter = AnomalyFilter::new(AnomalyConfig::default()).unwrap();
        let err = filter.classify(&baseline()).unwrap_err();
        assert!(matches!(err, AnomalyError::NotFitted));
    }

    #[test]
    fn test_invalid_contamination_rejected() {
        for bad in [0.0, -0.1, 0.75, f64::NAN] {
            let config = AnomalyConfig::default().with_contamination(bad);
            assert!(matches!(
                AnomalyFilter::new(config),
                Err(AnomalyError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_fit_empty_batch_fails() {
        let mut filter = AnomalyFilter::new(AnomalyConfig::default()).unwrap();
        assert!(matches!(filter.fit(&[]), Err(AnomalyError::EmptyTrainingSet)));
    }

    #[test]
    fn test_partition_is_disjoint_and_complete() {
        let config = AnomalyConfig::default().with_contamination(0.2);
        let mut filter = AnomalyFilter::new(config).unwrap();
        filter.fit(&baseline()).unwrap();

        let mut batch = baseline();
        batch.push(coin("whale", 90_000.0, 5.0e12, 80.0));
        let input = batch.clone();

        let result = filter.classify(&batch).unwrap();
        assert_eq!(batch, input);
        assert_eq!(result.normal.len() + result.anomalous.len(), batch.len());
        for record in &batch {
            let in_normal = result.normal.iter().any(|r| r.id == record.id);
            let in_anomalous = result.anomalous.iter().any(|r| r.id == record.id);
            assert!(in_normal ^ in_anomalous, "{} must be in exactly one side", record.id);
        }
        assert!(result.anomalous.iter().any(|r| r.id == "whale"));
    }

    #[test]
    fn test_fit_flags_expected_fraction_of_training_rows() {
        let batch = baseline();
        let mut filter = AnomalyFilter::new(AnomalyConfig::default()).unwrap();
        filter.fit(&batch).unwrap();

        let flagged = filter.predict(&batch).unwrap().into_iter().filter(|f| *f).count();
        // ties at the threshold can only reduce the count
        assert!(flagged <= 6);
    }

    #[test]
    fn test_small_training_batch_flags_nothing() {
        let batch = vec![
            coin("a", 1.0, 100.0, 1.0),
            coin("b", 2.0, 50.0, -1.0),
            coin("c", 3.0, 200.0, 4.0),
        ];
        let mut filter = AnomalyFilter::new(AnomalyConfig::default()).unwrap();
        filter.fit(&batch).unwrap();
        let result = filter.classify(&batch).unwrap();
        assert_eq!(result.normal.len(), 3);
        assert!(result.anomalous.is_empty());
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut filter = AnomalyFilter::new(AnomalyConfig::default()).unwrap();
        let state = filter.fit(&baseline()).unwrap().clone();
        let json = serde_json::to_string(&state).unwrap();
        let restored: ClassifierState = serde_json::from_str(&json).unwrap();

        let reloaded = AnomalyFilter::from_state(AnomalyConfig::default(), restored).unwrap();
        assert_eq!(
            reloaded.predict(&baseline()).unwrap(),
            filter.predict(&baseline()).unwrap()
        );
    }

    #[test]
    fn test_missing_values_become_zero_features() {
        let record = MarketRecord::new("x", "X");
        assert_eq!(features(&record), [0.0; FEATURE_COUNT]);
    }

    #[test]
    fn test_scaler_constant_feature_keeps_unit_scale() {
        let rows = vec![[1.0, 2.0, 3.0, 4.0, 5.0], [1.0, 4.0, 3.0, 4.0, 5.0]];
        let scaler = FeatureScaler::fit(&rows);
        assert_eq!(scaler.scale[0], 1.0);
        assert_eq!(scaler.mean[1], 3.0);
        assert_eq!(scaler.transform(&rows[1])[1], 1.0);
    }

    #[test]
    fn test_scaler_stays_finite_near_f64_max() {
        let rows = vec![
            [1.0, 1.0, 1.0, 1.0, 1.5e308],
            [1.0, 1.0, 1.0, 1.0, -1.5e308],
            [1.0, 1.0, 1.0, 1.0, 1.5e308],
            [1.0, 1.0, 1.0, 1.0, 2.0],
        ];
        let scaler = FeatureScaler::fit(&rows);
        assert!(scaler.mean[4].is_finite());
        assert!(scaler.scale[4].is_finite() && scaler.scale[4] > 0.0);
        for row in &rows {
            assert!(scaler.transform(row).iter().all(|v| v.is_finite()));
        }
    }
}
