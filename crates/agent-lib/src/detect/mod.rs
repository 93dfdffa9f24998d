//! Anomaly detection pipeline
//!
//! Trains an isolation forest on a baseline window of samples, calibrates
//! its detection threshold against a validation split so the measured
//! false-positive rate stays within budget, and persists the whole model
//! (forest, scaler, threshold, feature columns) as one atomic record.
//! Inference scores fresh samples and extracts explained events.

mod forest;

pub use forest::IsolationForest;

use crate::config::{AnomalyConfig, FeatureConfig};
use crate::features::{cpu_temp_median, FeatureBuilder, FeatureError, FeatureMatrix, Scaler};
use crate::models::{now_ts, Event, EventKind, ModelAlgo, ModelRecord, Sample, FEATURE_METRICS};
use crate::store::{semver_major, Store, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Model record name for the anomaly detector.
pub const MODEL_NAME: &str = "anomaly";

/// Blob format version; loaders reject a different major.
pub const MODEL_FORMAT_VERSION: &str = "1.0.0";

/// Minimum baseline rows before training is worthwhile.
pub const MIN_BASELINE_ROWS: usize = 1000;

/// Features quoted in an event explanation.
const TOP_K_FEATURES: usize = 3;

/// Validation share of the baseline window.
const VALIDATION_SPLIT: f64 = 0.2;

/// Training RNG seed; fixed so retrains on identical data reproduce.
const TRAIN_SEED: u64 = 42;

/// Default ceiling on one training run.
const DEFAULT_TRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("not enough baseline data: got {got} rows, need {needed}")]
    NotEnoughData { got: usize, needed: usize },

    #[error("anomaly model not trained")]
    ModelNotTrained,

    #[error("anomaly model stale: {0}")]
    ModelStale(String),

    #[error("calibration failed: {0}")]
    CalibrationFailed(String),

    #[error("training exceeded its time ceiling")]
    TrainTimeout,

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("model codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Everything needed for inference, serialized as the model blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyModel {
    pub forest: IsolationForest,
    pub scaler: Scaler,
    pub threshold: f64,
    pub columns: Vec<String>,
}

/// Training summary, logged and stored in the model metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainReport {
    pub train_rows: usize,
    pub validation_rows: usize,
    pub threshold: f64,
    pub feature_count: usize,
    pub validation_fpr: f64,
}

pub struct AnomalyDetector {
    config: AnomalyConfig,
    builder: FeatureBuilder,
    train_timeout: std::time::Duration,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig, features: &FeatureConfig) -> Self {
        Self {
            config,
            builder: FeatureBuilder::new(features.short_window, features.long_window),
            train_timeout: DEFAULT_TRAIN_TIMEOUT,
        }
    }

    /// Override the training time ceiling.
    pub fn with_train_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.train_timeout = timeout;
        self
    }

    /// Train on the configured baseline window ending at `now` and
    /// persist the resulting model record.
    pub fn train(&self, store: &Store, now: i64) -> Result<TrainReport, DetectError> {
        let from = now - i64::from(self.config.baseline_window_days) * 86_400;
        let samples = store.read_samples(from, now, None)?;
        let (model, report) = self.train_on(&samples)?;
        self.persist(store, &model, &report, (from, now))?;
        Ok(report)
    }

    /// Fit forest, scaler, and calibrated threshold on a baseline slice.
    pub fn train_on(&self, samples: &[Sample]) -> Result<(AnomalyModel, TrainReport), DetectError> {
        if samples.len() < MIN_BASELINE_ROWS {
            return Err(DetectError::NotEnoughData {
                got: samples.len(),
                needed: MIN_BASELINE_ROWS,
            });
        }

        let split = ((samples.len() as f64) * (1.0 - VALIDATION_SPLIT)) as usize;
        let (train_samples, val_samples) = samples.split_at(split);

        let temp_fill = cpu_temp_median(train_samples);
        let train_matrix = self.builder.build(train_samples, temp_fill)?;
        let val_matrix = self.builder.build(val_samples, temp_fill)?;

        let scaler = Scaler::fit(&train_matrix, temp_fill);
        let train_scaled = scaler.transform(&train_matrix)?;
        let val_scaled = scaler.transform(&val_matrix)?;

        info!(
            train_rows = train_scaled.len(),
            trees = self.config.n_estimators,
            max_samples = self.config.max_samples,
            "training isolation forest"
        );
        let deadline = std::time::Instant::now() + self.train_timeout;
        let forest = IsolationForest::fit_bounded(
            &train_scaled,
            self.config.n_estimators,
            self.config.max_samples,
            TRAIN_SEED,
            Some(deadline),
        )
        .ok_or(DetectError::TrainTimeout)?;

        // Contamination centres the pre-calibration threshold; validation
        // then picks the most sensitive threshold within the FPR budget.
        let train_scores = forest.scores(&train_scaled);
        let default_threshold = quantile(&train_scores, 1.0 - self.config.contamination);
        let val_scores = forest.scores(&val_scaled);
        let mut threshold = calibrate_threshold(&val_scores, self.config.target_fpr)?;
        if !threshold.is_finite() {
            threshold = default_threshold;
        }

        let validation_fpr =
            val_scores.iter().filter(|&&s| s > threshold).count() as f64 / val_scores.len() as f64;

        let report = TrainReport {
            train_rows: train_scaled.len(),
            validation_rows: val_scores.len(),
            threshold,
            feature_count: train_matrix.columns.len(),
            validation_fpr,
        };
        info!(
            threshold = report.threshold,
            validation_fpr = report.validation_fpr,
            "calibrated detection threshold"
        );

        let model = AnomalyModel {
            forest,
            scaler,
            threshold,
            columns: train_matrix.columns,
        };
        Ok((model, report))
    }

    fn persist(
        &self,
        store: &Store,
        model: &AnomalyModel,
        report: &TrainReport,
        window: (i64, i64),
    ) -> Result<(), DetectError> {
        let record = ModelRecord {
            name: MODEL_NAME.to_string(),
            algo: ModelAlgo::IsolationForest,
            version: MODEL_FORMAT_VERSION.to_string(),
            trained_at: now_ts(),
            meta: serde_json::json!({
                "threshold": model.threshold,
                "target_fpr": self.config.target_fpr,
                "contamination": self.config.contamination,
                "n_estimators": self.config.n_estimators,
                "max_samples": self.config.max_samples,
                "columns": model.columns,
                "temp_fill": model.scaler.temp_fill,
                "train_rows": report.train_rows,
                "validation_rows": report.validation_rows,
                "validation_fpr": report.validation_fpr,
                "window": [window.0, window.1],
            }),
            blob: serde_json::to_vec(model)?,
        };
        store.save_model(&record)?;
        Ok(())
    }

    /// Load the persisted model, rejecting missing or incompatible blobs.
    pub fn load(&self, store: &Store) -> Result<AnomalyModel, DetectError> {
        let record = store
            .load_model(MODEL_NAME)?
            .ok_or(DetectError::ModelNotTrained)?;
        if record.algo != ModelAlgo::IsolationForest {
            return Err(DetectError::ModelStale(format!(
                "unexpected algo {}",
                record.algo.as_str()
            )));
        }
        let supported = semver_major(MODEL_FORMAT_VERSION);
        if semver_major(&record.version) != supported {
            return Err(DetectError::ModelStale(format!(
                "model format {} unsupported (expected major {})",
                record.version,
                supported.unwrap_or(0)
            )));
        }
        Ok(serde_json::from_slice(&record.blob)?)
    }

    /// Score fresh samples with the persisted model and return an event
    /// per anomalous row.
    pub fn detect(&self, store: &Store, samples: &[Sample]) -> Result<Vec<Event>, DetectError> {
        let model = self.load(store)?;
        self.detect_with(&model, samples)
    }

    /// Score fresh samples with an already-loaded model.
    pub fn detect_with(
        &self,
        model: &AnomalyModel,
        samples: &[Sample],
    ) -> Result<Vec<Event>, DetectError> {
        let matrix = self.builder.build(samples, model.scaler.temp_fill)?;
        if matrix.columns != model.columns {
            return Err(DetectError::ModelStale(
                "feature columns differ from the trained model".to_string(),
            ));
        }
        let scaled = model.scaler.transform(&matrix).map_err(|_| {
            DetectError::ModelStale("scaler no longer matches feature layout".to_string())
        })?;

        let mut events = Vec::new();
        for (i, row) in scaled.iter().enumerate() {
            let score = model.forest.score(row);
            if score > model.threshold {
                events.push(self.explain(model, &matrix, i, score));
            }
        }
        debug!(
            rows = scaled.len(),
            anomalies = events.len(),
            "detection pass complete"
        );
        Ok(events)
    }

    /// Build an event from the top deviating features of one row.
    fn explain(&self, model: &AnomalyModel, matrix: &FeatureMatrix, row: usize, score: f64) -> Event {
        let zscores = model.scaler.zscores(&matrix.data[row]);
        let mut ranked: Vec<(usize, f64)> = zscores
            .iter()
            .enumerate()
            .map(|(i, &z)| (i, z))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.abs()
                .partial_cmp(&a.1.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut tags = Vec::new();
        let mut parts = Vec::new();
        for &(col, z) in ranked.iter().take(TOP_K_FEATURES) {
            let metric = base_metric(&matrix.columns[col]);
            parts.push(format!("metric={metric} zscore={z:+.2}"));
            tags.push(metric.to_string());
        }

        Event::new(
            matrix.timestamps[row],
            EventKind::Anomaly,
            Some(score),
            &tags,
            parts.join(", "),
        )
    }
}

/// Map a feature column back to the metric it was derived from.
fn base_metric(column: &str) -> &str {
    FEATURE_METRICS
        .iter()
        .find(|m| column.starts_with(*m))
        .copied()
        .unwrap_or(column)
}

/// Most sensitive threshold whose false-positive rate on the (assumed
/// nominal) validation scores stays within `target_fpr`. Falls back to
/// the score quantile at exactly `1 - target_fpr` when ties make the
/// step function skip the budget.
fn calibrate_threshold(val_scores: &[f64], target_fpr: f64) -> Result<f64, DetectError> {
    if val_scores.is_empty() {
        return Err(DetectError::CalibrationFailed(
            "empty validation split".to_string(),
        ));
    }
    let mut sorted = val_scores.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = sorted.len();
    let allowed = (target_fpr * n as f64).floor() as usize;
    // Lowest candidate with at most `allowed` scores strictly above it.
    let candidate = sorted[n - 1 - allowed.min(n - 1)];
    let fpr = sorted.iter().filter(|&&s| s > candidate).count() as f64 / n as f64;
    if fpr <= target_fpr {
        Ok(candidate)
    } else {
        Ok(quantile(&sorted, 1.0 - target_fpr))
    }
}

/// Linear-interpolated quantile of unsorted values, q in [0, 1].
fn quantile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = pos - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnomalyConfig, FeatureConfig};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(AnomalyConfig::default(), &FeatureConfig::default())
    }

    /// Synthetic host behavior: noisy daily pattern with optional CPU
    /// spikes injected at known timestamps.
    fn synthesize(n: usize, spike_every: usize, seed: u64, start_ts: i64) -> (Vec<Sample>, HashSet<i64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut spikes = HashSet::new();
        let samples = (0..n)
            .map(|i| {
                let ts = start_ts + i as i64;
                let phase = (i as f64 / 300.0).sin();
                let mut cpu = 20.0 + 6.0 * phase + rng.gen_range(-3.0..3.0);
                let mut net = 1e5 + 2e4 * phase + rng.gen_range(-1e4..1e4);
                if spike_every > 0 && i % spike_every == 0 && i > 0 {
                    cpu = 92.0 + rng.gen_range(0.0..6.0);
                    net *= 40.0;
                    spikes.insert(ts);
                }
                Sample {
                    ts,
                    host: "synth".to_string(),
                    cpu_pct: cpu.clamp(0.0, 100.0),
                    mem_pct: 45.0 + 5.0 * phase + rng.gen_range(-1.0..1.0),
                    swap_pct: 2.0,
                    disk_read_bps: 5e4 + rng.gen_range(-5e3..5e3),
                    disk_write_bps: 8e4 + rng.gen_range(-5e3..5e3),
                    net_up_bps: net.max(0.0),
                    net_down_bps: 2.0 * net.max(0.0),
                    proc_count: 180,
                    cpu_temp: Some(55.0 + 2.0 * phase),
                }
            })
            .collect();
        (samples, spikes)
    }

    #[test]
    fn test_not_enough_data() {
        let (samples, _) = synthesize(100, 0, 1, 0);
        let err = detector().train_on(&samples).unwrap_err();
        assert!(matches!(err, DetectError::NotEnoughData { .. }));
    }

    #[test]
    fn test_model_not_trained() {
        let store = Store::open_memory().unwrap();
        let (samples, _) = synthesize(100, 0, 1, 0);
        let err = detector().detect(&store, &samples).unwrap_err();
        assert!(matches!(err, DetectError::ModelNotTrained));
    }

    #[test]
    fn test_train_persists_and_reloads() {
        let store = Store::open_memory().unwrap();
        let (samples, _) = synthesize(2000, 0, 1, 0);
        store.insert_samples(&samples).unwrap();

        let report = detector().train(&store, 2000).unwrap();
        assert!(report.validation_fpr <= 0.05 + 1e-9);
        assert_eq!(report.feature_count, 100);

        let model = detector().load(&store).unwrap();
        assert_eq!(model.columns.len(), 100);
        assert!(model.threshold > 0.0 && model.threshold <= 1.0);
    }

    #[test]
    fn test_stale_version_rejected() {
        let store = Store::open_memory().unwrap();
        let (samples, _) = synthesize(1200, 0, 1, 0);
        let (model, report) = detector().train_on(&samples).unwrap();
        let d = detector();
        d.persist(&store, &model, &report, (0, 1200)).unwrap();

        // Corrupt the stored version to a different major.
        let mut record = store.load_model(MODEL_NAME).unwrap().unwrap();
        record.version = "2.0.0".to_string();
        store.save_model(&record).unwrap();

        let err = d.load(&store).unwrap_err();
        assert!(matches!(err, DetectError::ModelStale(_)));
    }

    // Train on a mostly-nominal baseline with 5% injected CPU spikes,
    // detect on a disjoint slice: precision and false-positive rate must
    // hold up. A detection counts as true if a spike landed within the
    // lag window (5 ticks) before it.
    #[test]
    fn test_precision_and_fpr_on_synthetic_spikes() {
        let (baseline, _) = synthesize(10_000, 20, 11, 0);
        let (test_set, test_spikes) = synthesize(2_000, 20, 23, 20_000);

        let d = detector();
        let (model, _report) = d.train_on(&baseline).unwrap();
        let events = d.detect_with(&model, &test_set).unwrap();
        assert!(!events.is_empty(), "spikes should be detected");

        let near_spike = |ts: i64| (0..=5).any(|back| test_spikes.contains(&(ts - back)));

        let tp = events.iter().filter(|e| near_spike(e.ts)).count();
        let precision = tp as f64 / events.len() as f64;
        assert!(precision >= 0.70, "precision {precision:.3}");

        // FPR over nominal rows: emitted feature rows start after the
        // warmup window.
        let builder = FeatureBuilder::new(5, 30);
        let first_row_ts = test_set[builder.min_samples() - 1].ts;
        let nominal_rows = test_set
            .iter()
            .filter(|s| s.ts >= first_row_ts && !near_spike(s.ts))
            .count();
        let fp = events.len() - tp;
        let fpr = fp as f64 / nominal_rows as f64;
        assert!(fpr <= 0.05, "fpr {fpr:.4}");
    }

    #[test]
    fn test_events_carry_attribution() {
        let (baseline, _) = synthesize(3_000, 0, 5, 0);
        let (mut test_set, _) = synthesize(200, 0, 6, 10_000);
        // Hand-crafted sustained CPU spike over the last few ticks.
        let n = test_set.len();
        for s in &mut test_set[n - 3..] {
            s.cpu_pct = 99.0;
        }

        let d = detector();
        let (model, _) = d.train_on(&baseline).unwrap();
        let events = d.detect_with(&model, &test_set).unwrap();

        let spike_event = events.iter().find(|e| e.ts >= 10_197);
        let event = spike_event.expect("hand-crafted spike must be flagged");
        assert!(event.metric_tags.contains("cpu_pct"), "tags: {}", event.metric_tags);
        assert!(event.explanation.contains("metric=cpu_pct zscore="));
        assert!(event.explanation.len() <= crate::models::MAX_EXPLANATION_LEN);
        assert_eq!(event.kind, EventKind::Anomaly);
        assert!(event.score.unwrap() > model.threshold);
    }

    #[test]
    fn test_calibrate_threshold_respects_budget() {
        let scores: Vec<f64> = (0..1000).map(|i| i as f64 / 1000.0).collect();
        let threshold = calibrate_threshold(&scores, 0.05).unwrap();
        let fpr = scores.iter().filter(|&&s| s > threshold).count() as f64 / 1000.0;
        assert!(fpr <= 0.05);
        // Most sensitive within budget: not absurdly high.
        assert!(threshold < 0.96);
    }

    #[test]
    fn test_quantile() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&values, 0.0), 1.0);
        assert_eq!(quantile(&values, 1.0), 5.0);
        assert_eq!(quantile(&values, 0.5), 3.0);
    }
}
