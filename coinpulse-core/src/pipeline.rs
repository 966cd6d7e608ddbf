//! Transform stage: anomaly filter, sanitizer, aggregator
//!
//! A run moves through `Idle -> Filtering -> Sanitizing -> Aggregating -> Done`
//! and never goes back. Malformed rows are dropped and counted; classifier and
//! store failures abort the run and name the stage they happened in.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::aggregator;
use crate::anomaly::{AnomalyConfig, AnomalyError, AnomalyFilter};
use crate::error::ErrorKind;
use crate::models::{AnalysisSummary, MarketRecord, PipelineStats};
use crate::sanitizer::{DedupeKey, RecordSanitizer};
use crate::store::{ClassifierStore, ClassifierStoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Filtering,
    Sanitizing,
    Aggregating,
    Done,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Filtering => "filtering",
            Self::Sanitizing => "sanitizing",
            Self::Aggregating => "aggregating",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// What to do when no trained classifier state exists yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPolicy {
    /// Fit on the first batch seen, persist, then filter that same batch.
    #[default]
    TrainOnFirstBatch,
    /// Fail with `NotFitted` until `retrain` has been called.
    RequireTrained,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub anomaly: AnomalyConfig,
    pub bootstrap: BootstrapPolicy,
    pub dedupe_key: DedupeKey,
}

impl PipelineConfig {
    pub fn with_anomaly(mut self, anomaly: AnomalyConfig) -> Self {
        self.anomaly = anomaly;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: BootstrapPolicy) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_dedupe_key(mut self, dedupe_key: DedupeKey) -> Self {
        self.dedupe_key = dedupe_key;
        self
    }
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error(transparent)]
    Anomaly(#[from] AnomalyError),

    #[error(transparent)]
    ClassifierStore(#[from] ClassifierStoreError),
}

#[derive(Error, Debug)]
#[error("transform failed while {stage}: {source}")]
pub struct PipelineError {
    pub stage: PipelineStage,
    #[source]
    pub source: TransformError,
}

impl PipelineError {
    fn at(stage: PipelineStage, source: impl Into<TransformError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }

    pub fn is_not_fitted(&self) -> bool {
        matches!(self.source, TransformError::Anomaly(AnomalyError::NotFitted))
    }

    pub fn kind(&self) -> ErrorKind {
        match &self.source {
            TransformError::ClassifierStore(e) => e.kind(),
            TransformError::Anomaly(_) => ErrorKind::Fatal,
        }
    }
}

/// Rows that cannot be processed at all: no id, a non-finite number, or a
/// negative supply or volume.
pub fn is_malformed(record: &MarketRecord) -> bool {
    if record.id.trim().is_empty() {
        return true;
    }
    if record
        .numeric_fields()
        .iter()
        .any(|(_, v)| v.map_or(false, |x| !x.is_finite()))
    {
        return true;
    }
    [record.circulating_supply, record.total_supply, record.total_volume]
        .iter()
        .any(|v| v.map_or(false, |x| x < 0.0))
}

pub struct TransformPipeline {
    config: PipelineConfig,
    classifier_store: Arc<dyn ClassifierStore>,
    filter: Option<AnomalyFilter>,
    sanitizer: RecordSanitizer,
    stage: PipelineStage,
    last_stats: Option<PipelineStats>,
}

impl TransformPipeline {
    pub fn new(config: PipelineConfig, classifier_store: Arc<dyn ClassifierStore>) -> Self {
        let sanitizer = RecordSanitizer::new().with_dedupe_key(config.dedupe_key);
        Self {
            config,
            classifier_store,
            filter: None,
            sanitizer,
            stage: PipelineStage::Idle,
            last_stats: None,
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn last_stats(&self) -> Option<&PipelineStats> {
        self.last_stats.as_ref()
    }

    /// Whether a classifier is loaded in memory. Does not consult the store.
    pub fn has_classifier(&self) -> bool {
        self.filter.as_ref().map_or(false, AnomalyFilter::is_fitted)
    }

    /// Turn one raw batch into one summary.
    pub fn run(&mut self, raw: &[MarketRecord]) -> Result<AnalysisSummary, PipelineError> {
        let started = Instant::now();
        self.stage = PipelineStage::Idle;

        let mut stats = PipelineStats {
            input_records: raw.len(),
            ..PipelineStats::default()
        };

        let well_formed: Vec<MarketRecord> = raw.iter().filter(|r| !is_malformed(r)).cloned().collect();
        stats.malformed_rows = raw.len() - well_formed.len();
        if stats.malformed_rows > 0 {
            warn!(dropped = stats.malformed_rows, "dropped malformed rows");
        }

        if well_formed.is_empty() {
            debug!(input = raw.len(), "nothing to analyze, returning zero summary");
            self.stage = PipelineStage::Done;
            let summary = AnalysisSummary {
                pipeline_stats: stats.clone(),
                ..AnalysisSummary::zero()
            };
            self.last_stats = Some(stats);
            return Ok(summary);
        }

        self.stage = PipelineStage::Filtering;
        self.ensure_filter(&well_formed)
            .map_err(|e| PipelineError::at(PipelineStage::Filtering, e))?;
        let classification = self
            .filter
            .as_ref()
            .ok_or(AnomalyError::NotFitted)
            .and_then(|filter| filter.classify(&well_formed))
            .map_err(|e| PipelineError::at(PipelineStage::Filtering, e))?;
        stats.anomalies_detected = classification.anomalous.len();

        self.stage = PipelineStage::Sanitizing;
        let (sanitized, report) = self.sanitizer.sanitize_with_report(&classification.normal);
        stats.duplicates_removed = report.duplicates_removed;
        stats.invalid_removed = report.invalid_removed;
        stats.records_analyzed = sanitized.len();

        self.stage = PipelineStage::Aggregating;
        let summary = AnalysisSummary {
            market_cap_analysis: aggregator::market_cap_summary(&sanitized),
            price_analysis: aggregator::price_change_summary(&sanitized),
            supply_analysis: aggregator::supply_utilization_summary(&sanitized),
            top_performers: aggregator::top_performers(&sanitized),
            pipeline_stats: stats.clone(),
        };

        self.stage = PipelineStage::Done;
        info!(
            input = stats.input_records,
            malformed = stats.malformed_rows,
            anomalies = stats.anomalies_detected,
            duplicates = stats.duplicates_removed,
            invalid = stats.invalid_removed,
            analyzed = stats.records_analyzed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "transform complete"
        );
        self.last_stats = Some(stats);

        Ok(summary)
    }

    /// Fit a fresh classifier on `records`, persist it and use it for
    /// subsequent runs. Malformed rows are ignored. The previous classifier
    /// stays in place if fitting or saving fails. Returns the number of
    /// training samples.
    pub fn retrain(&mut self, records: &[MarketRecord]) -> Result<usize, PipelineError> {
        let err = |e: TransformError| PipelineError::at(PipelineStage::Filtering, e);

        let training: Vec<MarketRecord> = records.iter().filter(|r| !is_malformed(r)).cloned().collect();
        let mut filter = AnomalyFilter::new(self.config.anomaly.clone()).map_err(|e| err(e.into()))?;
        let state = filter.fit(&training).map_err(|e| err(e.into()))?;
        self.classifier_store.save(state).map_err(|e| err(e.into()))?;
        let samples = state.training_samples;

        self.filter = Some(filter);
        info!(samples, "retrained anomaly classifier");
        Ok(samples)
    }

    /// Forget the in-memory classifier; the next run reloads from the store.
    pub fn unload_classifier(&mut self) {
        self.filter = None;
    }

    fn ensure_filter(&mut self, batch: &[MarketRecord]) -> Result<(), TransformError> {
        if self.has_classifier() {
            return Ok(());
        }

        let filter = match self.classifier_store.load() {
            Ok(state) => {
                debug!(samples = state.training_samples, "loaded classifier state");
                AnomalyFilter::from_state(self.config.anomaly.clone(), state)?
            }
            Err(ClassifierStoreError::NotFound) => match self.config.bootstrap {
                BootstrapPolicy::RequireTrained => return Err(AnomalyError::NotFitted.into()),
                BootstrapPolicy::TrainOnFirstBatch => {
                    warn!(
                        samples = batch.len(),
                        "no classifier state found, training on the current batch"
                    );
                    let mut filter = AnomalyFilter::new(self.config.anomaly.clone())?;
                    let state = filter.fit(batch)?;
                    self.classifier_store.save(state)?;
                    filter
                }
            },
            Err(e) => return Err(e.into()),
        };

        self.filter = Some(filter);
        Ok(())
    }
}
