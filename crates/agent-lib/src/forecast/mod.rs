//! Time-to-threshold forecasting
//!
//! One regressor per monitored metric, projected forward until the
//! predicted value crosses its configured threshold. The default linear
//! algorithm fits a least-squares trend of value against time; the
//! `gbrt` alternative boosts shallow trees over lag windows at the
//! projection resolution and rolls predictions forward. Residuals on a
//! held-out split form the confidence band: the upper bound drives
//! breach events so risk surfaces early, the point estimate is for
//! display.

mod gbrt;

pub use gbrt::GradientBoost;

use crate::config::{ForecastAlgo, ForecastConfig, ThresholdConfig};
use crate::features::FeatureError;
use crate::models::{now_ts, Event, EventKind, ModelAlgo, ModelRecord, Sample};
use crate::store::{semver_major, Store, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Model record name for the forecaster.
pub const MODEL_NAME: &str = "forecast";

/// Blob format version; loaders reject a different major.
pub const MODEL_FORMAT_VERSION: &str = "1.0.0";

/// Metrics with configured breach thresholds.
pub const FORECAST_TARGETS: &[&str] = &["cpu_pct", "mem_pct", "swap_pct"];

/// Projection resolution in seconds.
pub const STEP_SECS: i64 = 60;

/// Minimum training samples per metric.
pub const MIN_TRAIN_SAMPLES: usize = 100;

/// Lag window for the gbrt regressor, in projection steps.
const GBRT_LAGS: usize = 8;

/// Held-out share used for the residual distribution.
const VALIDATION_SPLIT: f64 = 0.2;

#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("not enough data to fit forecaster: got {got} samples, need {needed}")]
    InsufficientData { got: usize, needed: usize },

    #[error("forecast model not trained")]
    ModelNotTrained,

    #[error("forecast model stale: {0}")]
    ModelStale(String),

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("model codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Trained regressor for one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Regressor {
    /// Least-squares trend anchored at `t0`.
    Linear {
        t0: i64,
        intercept: f64,
        slope_per_sec: f64,
    },
    /// Boosted trees over the last [`GBRT_LAGS`] values at step
    /// resolution, rolled forward one step at a time.
    Gbrt(GradientBoost),
}

/// Per-metric model with its residual band.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetricModel {
    metric: String,
    regressor: Regressor,
    /// 5th percentile of validation residuals (typically negative).
    residual_lo: f64,
    /// 95th percentile of validation residuals.
    residual_hi: f64,
}

/// Serialized forecaster blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastModel {
    metrics: Vec<MetricModel>,
    horizon_secs: i64,
}

/// Seconds until a metric crosses its threshold. `None` means not
/// within the horizon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricForecast {
    /// Point estimate, for display.
    pub eta_seconds: Option<f64>,
    /// Earliest plausible crossing (upper confidence bound), used for
    /// alerting.
    pub lo_eta: Option<f64>,
    /// Latest plausible crossing (lower confidence bound).
    pub hi_eta: Option<f64>,
}

pub struct Forecaster {
    config: ForecastConfig,
}

impl Forecaster {
    pub fn new(config: ForecastConfig) -> Self {
        Self { config }
    }

    /// Train regressors for every target metric on the given history and
    /// persist them as one model record.
    pub fn train(&self, store: &Store, samples: &[Sample]) -> Result<ForecastModel, ForecastError> {
        let model = self.train_on(samples)?;
        self.persist(store, &model)?;
        Ok(model)
    }

    /// Fit without persisting.
    pub fn train_on(&self, samples: &[Sample]) -> Result<ForecastModel, ForecastError> {
        if samples.len() < MIN_TRAIN_SAMPLES {
            return Err(ForecastError::InsufficientData {
                got: samples.len(),
                needed: MIN_TRAIN_SAMPLES,
            });
        }

        let mut metrics = Vec::new();
        for &metric in FORECAST_TARGETS {
            let ts: Vec<i64> = samples.iter().map(|s| s.ts).collect();
            let values: Vec<f64> = samples
                .iter()
                .map(|s| s.metric(metric).unwrap_or(0.0))
                .collect();
            metrics.push(self.fit_metric(metric, &ts, &values));
        }

        info!(
            metrics = metrics.len(),
            algo = ?self.config.algo,
            horizon_hours = self.config.horizon_hours,
            "forecaster trained"
        );
        Ok(ForecastModel {
            metrics,
            horizon_secs: i64::from(self.config.horizon_hours) * 3600,
        })
    }

    fn fit_metric(&self, metric: &str, ts: &[i64], values: &[f64]) -> MetricModel {
        let split = ((values.len() as f64) * (1.0 - VALIDATION_SPLIT)) as usize;

        let (regressor, residuals) = match self.config.algo {
            ForecastAlgo::Linear => {
                let t0 = ts[0];
                let xs: Vec<f64> = ts[..split].iter().map(|&t| (t - t0) as f64).collect();
                let (intercept, slope_per_sec) = linear_fit(&xs, &values[..split]);
                let regressor = Regressor::Linear {
                    t0,
                    intercept,
                    slope_per_sec,
                };
                let residuals: Vec<f64> = ts[split..]
                    .iter()
                    .zip(&values[split..])
                    .map(|(&t, &v)| v - (intercept + slope_per_sec * (t - t0) as f64))
                    .collect();
                (regressor, residuals)
            }
            ForecastAlgo::Gbrt => {
                let grid = downsample(ts, values, STEP_SECS);
                let (rows, targets) = lag_windows(&grid, GBRT_LAGS);
                if rows.len() < 2 {
                    // History too short for lag windows at projection
                    // resolution; a trend fit still gives an estimate.
                    warn!(
                        metric,
                        grid_points = grid.len(),
                        "history too short for gbrt, falling back to linear trend"
                    );
                    let t0 = ts[0];
                    let xs: Vec<f64> = ts[..split].iter().map(|&t| (t - t0) as f64).collect();
                    let (intercept, slope_per_sec) = linear_fit(&xs, &values[..split]);
                    let regressor = Regressor::Linear {
                        t0,
                        intercept,
                        slope_per_sec,
                    };
                    let residuals: Vec<f64> = ts[split..]
                        .iter()
                        .zip(&values[split..])
                        .map(|(&t, &v)| v - (intercept + slope_per_sec * (t - t0) as f64))
                        .collect();
                    (regressor, residuals)
                } else {
                    let train_n = ((rows.len() as f64) * (1.0 - VALIDATION_SPLIT)) as usize;
                    let train_n = train_n.max(1).min(rows.len());
                    let boost = GradientBoost::fit(&rows[..train_n], &targets[..train_n]);
                    let residuals: Vec<f64> = rows[train_n..]
                        .iter()
                        .zip(&targets[train_n..])
                        .map(|(row, &target)| target - boost.predict(row))
                        .collect();
                    (Regressor::Gbrt(boost), residuals)
                }
            }
        };

        let (residual_lo, residual_hi) = residual_band(&residuals);
        debug!(metric, residual_lo, residual_hi, "fitted metric regressor");
        MetricModel {
            metric: metric.to_string(),
            regressor,
            residual_lo,
            residual_hi,
        }
    }

    fn persist(&self, store: &Store, model: &ForecastModel) -> Result<(), ForecastError> {
        let algo = match self.config.algo {
            ForecastAlgo::Linear => ModelAlgo::LinearRegressor,
            ForecastAlgo::Gbrt => ModelAlgo::GradientBoost,
        };
        let record = ModelRecord {
            name: MODEL_NAME.to_string(),
            algo,
            version: MODEL_FORMAT_VERSION.to_string(),
            trained_at: now_ts(),
            meta: serde_json::json!({
                "targets": FORECAST_TARGETS,
                "horizon_secs": model.horizon_secs,
                "step_secs": STEP_SECS,
            }),
            blob: serde_json::to_vec(model)?,
        };
        store.save_model(&record)?;
        Ok(())
    }

    /// Load the persisted forecaster.
    pub fn load(&self, store: &Store) -> Result<ForecastModel, ForecastError> {
        let record = store
            .load_model(MODEL_NAME)?
            .ok_or(ForecastError::ModelNotTrained)?;
        let supported = semver_major(MODEL_FORMAT_VERSION);
        if semver_major(&record.version) != supported {
            return Err(ForecastError::ModelStale(format!(
                "model format {} unsupported",
                record.version
            )));
        }
        Ok(serde_json::from_slice(&record.blob)?)
    }

    /// Project every metric forward from the most recent samples.
    pub fn forecast(
        &self,
        model: &ForecastModel,
        recent: &[Sample],
        thresholds: &ThresholdConfig,
    ) -> BTreeMap<String, MetricForecast> {
        let mut out = BTreeMap::new();
        let Some(last) = recent.last() else {
            return out;
        };

        for metric_model in &model.metrics {
            let threshold = threshold_for(&metric_model.metric, thresholds);
            let forecast = project(metric_model, recent, last.ts, threshold, model.horizon_secs);
            out.insert(metric_model.metric.clone(), forecast);
        }
        out
    }

    /// Breach events for every metric whose earliest plausible crossing
    /// is within `min_eta` seconds.
    pub fn breach_events(
        forecasts: &BTreeMap<String, MetricForecast>,
        min_eta: f64,
        now: i64,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        for (metric, forecast) in forecasts {
            if let Some(lo_eta) = forecast.lo_eta {
                if lo_eta <= min_eta {
                    let display = forecast.eta_seconds.unwrap_or(lo_eta);
                    events.push(Event::new(
                        now,
                        EventKind::ForecastBreach,
                        Some(lo_eta),
                        &[metric.clone()],
                        format!(
                            "{metric} projected to cross threshold in {:.0}s (point estimate {:.0}s)",
                            lo_eta, display
                        ),
                    ));
                }
            }
        }
        events
    }
}

fn threshold_for(metric: &str, thresholds: &ThresholdConfig) -> f64 {
    match metric {
        "cpu_pct" => thresholds.cpu_pct,
        "mem_pct" => thresholds.mem_pct,
        "swap_pct" => thresholds.swap_pct,
        _ => thresholds.disk_pct,
    }
}

/// Step the projection forward and record the first crossing of the
/// point estimate and of both confidence bounds.
fn project(
    model: &MetricModel,
    recent: &[Sample],
    now: i64,
    threshold: f64,
    horizon_secs: i64,
) -> MetricForecast {
    let mut eta_seconds = None;
    let mut lo_eta = None;
    let mut hi_eta = None;

    // gbrt rolls a window of recent values forward; linear projects the
    // trained trend directly.
    let mut window: Vec<f64> = match &model.regressor {
        Regressor::Gbrt(_) => {
            let grid = downsample(
                &recent.iter().map(|s| s.ts).collect::<Vec<_>>(),
                &recent
                    .iter()
                    .map(|s| s.metric(&model.metric).unwrap_or(0.0))
                    .collect::<Vec<_>>(),
                STEP_SECS,
            );
            if grid.len() < GBRT_LAGS {
                return MetricForecast {
                    eta_seconds: None,
                    lo_eta: None,
                    hi_eta: None,
                };
            }
            grid[grid.len() - GBRT_LAGS..].to_vec()
        }
        Regressor::Linear { .. } => Vec::new(),
    };

    let mut t = STEP_SECS;
    while t <= horizon_secs {
        let predicted = match &model.regressor {
            Regressor::Linear {
                t0,
                intercept,
                slope_per_sec,
            } => intercept + slope_per_sec * (now + t - t0) as f64,
            Regressor::Gbrt(boost) => {
                let predicted = boost.predict(&window);
                window.remove(0);
                window.push(predicted);
                predicted
            }
        };

        if eta_seconds.is_none() && predicted >= threshold {
            eta_seconds = Some(t as f64);
        }
        if lo_eta.is_none() && predicted + model.residual_hi >= threshold {
            lo_eta = Some(t as f64);
        }
        if hi_eta.is_none() && predicted + model.residual_lo >= threshold {
            hi_eta = Some(t as f64);
        }
        if eta_seconds.is_some() && lo_eta.is_some() && hi_eta.is_some() {
            break;
        }
        t += STEP_SECS;
    }

    MetricForecast {
        eta_seconds,
        lo_eta,
        hi_eta,
    }
}

/// Ordinary least squares of `ys` against `xs`: `(intercept, slope)`.
fn linear_fit(xs: &[f64], ys: &[f64]) -> (f64, f64) {
    let slope = slope_xy(xs, ys);
    let mean_x = xs.iter().sum::<f64>() / xs.len() as f64;
    let mean_y = ys.iter().sum::<f64>() / ys.len() as f64;
    (mean_y - slope * mean_x, slope)
}

fn slope_xy(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mean_x) * (y - mean_y);
        var += (x - mean_x) * (x - mean_x);
    }
    if var.abs() < f64::EPSILON {
        return 0.0;
    }
    cov / var
}

/// Resample a series onto a fixed-step grid, keeping the last value per
/// bucket.
fn downsample(ts: &[i64], values: &[f64], step_secs: i64) -> Vec<f64> {
    let mut grid = Vec::new();
    let mut bucket: Option<i64> = None;
    for (&t, &v) in ts.iter().zip(values) {
        let b = t.div_euclid(step_secs);
        match bucket {
            Some(current) if current == b => {
                *grid.last_mut().unwrap() = v;
            }
            _ => {
                grid.push(v);
                bucket = Some(b);
            }
        }
    }
    grid
}

/// Lag-window rows and next-value targets over a gridded series.
fn lag_windows(grid: &[f64], lags: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut rows = Vec::new();
    let mut targets = Vec::new();
    if grid.len() <= lags {
        return (rows, targets);
    }
    for i in lags..grid.len() {
        rows.push(grid[i - lags..i].to_vec());
        targets.push(grid[i]);
    }
    (rows, targets)
}

/// 5th and 95th percentiles of the residuals; zero band when empty.
fn residual_band(residuals: &[f64]) -> (f64, f64) {
    if residuals.is_empty() {
        return (0.0, 0.0);
    }
    let mut sorted = residuals.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pick = |q: f64| {
        let pos = (q * (sorted.len() - 1) as f64).round() as usize;
        sorted[pos.min(sorted.len() - 1)]
    };
    (pick(0.05), pick(0.95))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForecastAlgo, ForecastConfig, ThresholdConfig};

    fn sample(ts: i64, mem: f64) -> Sample {
        Sample {
            ts,
            host: "test".to_string(),
            cpu_pct: 10.0,
            mem_pct: mem,
            swap_pct: 1.0,
            disk_read_bps: 0.0,
            disk_write_bps: 0.0,
            net_up_bps: 0.0,
            net_down_bps: 0.0,
            proc_count: 10,
            cpu_temp: None,
        }
    }

    /// mem_pct rising 1%/min, one sample per second, ending at 50%.
    fn rising_memory(n: usize) -> Vec<Sample> {
        let end = 50.0;
        (0..n)
            .map(|i| {
                let remaining = (n - 1 - i) as f64;
                sample(i as i64, end - remaining / 60.0)
            })
            .collect()
    }

    #[test]
    fn test_insufficient_data() {
        let forecaster = Forecaster::new(ForecastConfig::default());
        let err = forecaster.train_on(&rising_memory(10)).unwrap_err();
        assert!(matches!(err, ForecastError::InsufficientData { .. }));
    }

    // Linearly rising memory at 1%/min sitting at 50%, threshold 90:
    // the crossing is 40 minutes out.
    #[test]
    fn test_linear_eta_for_rising_memory() {
        let samples = rising_memory(1800);
        let forecaster = Forecaster::new(ForecastConfig::default());
        let model = forecaster.train_on(&samples).unwrap();

        let thresholds = ThresholdConfig::default();
        let forecasts = forecaster.forecast(&model, &samples, &thresholds);
        let mem = &forecasts["mem_pct"];

        let eta = mem.eta_seconds.expect("crossing within horizon");
        assert!(
            (2400.0..=2520.0).contains(&eta),
            "eta {eta} outside [2400, 2520]"
        );
        // Band brackets the point estimate.
        assert!(mem.lo_eta.unwrap() <= eta);
        assert!(mem.hi_eta.unwrap() >= eta);
    }

    #[test]
    fn test_flat_metric_never_crosses() {
        let samples: Vec<Sample> = (0..600).map(|i| sample(i, 40.0)).collect();
        let forecaster = Forecaster::new(ForecastConfig::default());
        let model = forecaster.train_on(&samples).unwrap();

        let forecasts = forecaster.forecast(&model, &samples, &ThresholdConfig::default());
        assert_eq!(forecasts["mem_pct"].eta_seconds, None);
        assert_eq!(forecasts["cpu_pct"].eta_seconds, None);
    }

    #[test]
    fn test_gbrt_tracks_rising_memory() {
        let samples = rising_memory(7200);
        let config = ForecastConfig {
            algo: ForecastAlgo::Gbrt,
            ..ForecastConfig::default()
        };
        let forecaster = Forecaster::new(config);
        let model = forecaster.train_on(&samples).unwrap();

        let forecasts = forecaster.forecast(&model, &samples, &ThresholdConfig::default());
        let mem = &forecasts["mem_pct"];
        // Trees cannot extrapolate beyond the training range, so the
        // point estimate may stay below threshold; the projection must
        // still be finite and well-formed.
        if let (Some(lo), Some(hi)) = (mem.lo_eta, mem.hi_eta) {
            assert!(lo <= hi);
        }
    }

    #[test]
    fn test_persist_and_reload() {
        let store = Store::open_memory().unwrap();
        let samples = rising_memory(1800);
        let forecaster = Forecaster::new(ForecastConfig::default());
        let trained = forecaster.train(&store, &samples).unwrap();

        let loaded = forecaster.load(&store).unwrap();
        let thresholds = ThresholdConfig::default();
        assert_eq!(
            forecaster.forecast(&trained, &samples, &thresholds),
            forecaster.forecast(&loaded, &samples, &thresholds)
        );
    }

    #[test]
    fn test_breach_events_respect_min_eta() {
        let mut forecasts = BTreeMap::new();
        forecasts.insert(
            "mem_pct".to_string(),
            MetricForecast {
                eta_seconds: Some(3000.0),
                lo_eta: Some(2400.0),
                hi_eta: Some(3600.0),
            },
        );
        forecasts.insert(
            "cpu_pct".to_string(),
            MetricForecast {
                eta_seconds: None,
                lo_eta: None,
                hi_eta: None,
            },
        );

        let events = Forecaster::breach_events(&forecasts, 86_400.0, 1000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ForecastBreach);
        assert_eq!(events[0].metric_tags, "mem_pct");
        assert_eq!(events[0].score, Some(2400.0));

        let none = Forecaster::breach_events(&forecasts, 600.0, 1000);
        assert!(none.is_empty());
    }

    #[test]
    fn test_downsample_keeps_last_per_bucket() {
        let ts = vec![0, 1, 59, 60, 61, 120];
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(downsample(&ts, &values, 60), vec![3.0, 5.0, 6.0]);
    }

    #[test]
    fn test_residual_band_ordering() {
        let residuals: Vec<f64> = (-50..=50).map(f64::from).collect();
        let (lo, hi) = residual_band(&residuals);
        assert!(lo < 0.0 && hi > 0.0);
        assert!((lo + 45.0).abs() <= 1.0);
        assert!((hi - 45.0).abs() <= 1.0);
    }
}
