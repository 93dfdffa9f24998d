//! Windowed feature construction and normalization
//!
//! Turns a contiguous run of samples into a dense feature matrix: lags,
//! rolling statistics over a short and a long window, exponential moving
//! averages, a least-squares slope, and a burstiness ratio for the I/O
//! rates. Feature rows are transient; only the fitted [`Scaler`] is
//! persisted, inside the model blob.

use crate::models::{Sample, FEATURE_METRICS, IO_METRICS};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lag offsets, in ticks.
pub const LAGS: usize = 5;

/// EMA smoothing constants. Column suffix is `alpha * 10`.
const EMA_ALPHAS: [f64; 2] = [0.1, 0.3];

/// Keeps the burstiness ratio finite on idle I/O.
const BURST_EPSILON: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("insufficient data: need at least {needed} samples, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("feature column mismatch: expected {expected} columns, got {got}")]
    ColumnMismatch { expected: usize, got: usize },
}

/// Dense feature matrix with its column names and row timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    /// Row-major values, one row per emitted timestamp.
    pub data: Vec<Vec<f64>>,
    pub columns: Vec<String>,
    pub timestamps: Vec<i64>,
}

impl FeatureMatrix {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// Deterministic feature construction: identical input yields identical
/// output, byte for byte, with a stable column order.
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    short_window: usize,
    long_window: usize,
}

impl FeatureBuilder {
    pub fn new(short_window: usize, long_window: usize) -> Self {
        assert!(short_window >= 2, "short window must be >= 2");
        assert!(long_window > short_window, "long window must exceed short");
        Self {
            short_window,
            long_window,
        }
    }

    /// Minimum number of input samples for one feature row.
    pub fn min_samples(&self) -> usize {
        self.long_window + LAGS
    }

    /// Column names in emission order.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = Vec::new();
        for metric in FEATURE_METRICS {
            for lag in 1..=LAGS {
                columns.push(format!("{metric}_lag{lag}"));
            }
            columns.push(format!("{metric}_rmean_s"));
            columns.push(format!("{metric}_rstd_s"));
            columns.push(format!("{metric}_rmean_l"));
            columns.push(format!("{metric}_rstd_l"));
            for alpha in EMA_ALPHAS {
                columns.push(format!("{metric}_ema{}", (alpha * 10.0) as u32));
            }
            columns.push(format!("{metric}_slope"));
            if IO_METRICS.contains(metric) {
                columns.push(format!("{metric}_burst"));
            }
        }
        columns
    }

    /// Build the feature matrix for a contiguous sample window. Rows are
    /// emitted only where every lag and rolling window is fully covered.
    /// Missing `cpu_temp` readings are replaced by `temp_fill` (the
    /// training-time median, carried in the scaler).
    pub fn build(
        &self,
        samples: &[Sample],
        temp_fill: f64,
    ) -> Result<FeatureMatrix, FeatureError> {
        let needed = self.min_samples();
        if samples.len() < needed {
            return Err(FeatureError::InsufficientData {
                needed,
                got: samples.len(),
            });
        }

        let n = samples.len();
        let start = self.long_window + LAGS - 1;
        let rows = n - start;
        let mut data = vec![Vec::with_capacity(self.columns().len()); rows];

        for metric in FEATURE_METRICS {
            let series: Vec<f64> = samples
                .iter()
                .map(|s| s.metric(metric).unwrap_or(temp_fill))
                .collect();
            let emas: Vec<Vec<f64>> = EMA_ALPHAS.iter().map(|&a| ema(&series, a)).collect();
            let io = IO_METRICS.contains(metric);

            for (row, i) in (start..n).enumerate() {
                let out = &mut data[row];
                for lag in 1..=LAGS {
                    out.push(series[i - lag]);
                }
                let short = &series[i + 1 - self.short_window..=i];
                let long = &series[i + 1 - self.long_window..=i];
                out.push(mean(short));
                out.push(sample_std(short));
                let long_mean = mean(long);
                out.push(long_mean);
                out.push(sample_std(long));
                for ema_series in &emas {
                    out.push(ema_series[i]);
                }
                out.push(slope(long));
                if io {
                    let short_max = short.iter().fold(f64::MIN, |a, &b| a.max(b));
                    out.push(short_max / (long_mean + BURST_EPSILON));
                }
            }
        }

        Ok(FeatureMatrix {
            data,
            columns: self.columns(),
            timestamps: samples[start..].iter().map(|s| s.ts).collect(),
        })
    }
}

/// Per-column standardization fitted once at training time and applied
/// identically at train and inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    pub columns: Vec<String>,
    /// Training-time median used to impute missing `cpu_temp`.
    pub temp_fill: f64,
}

impl Scaler {
    /// Fit column means and standard deviations. A zero-variance column
    /// keeps its mean but gets scale 1, so its normalized value is the
    /// raw deviation from the training mean.
    pub fn fit(matrix: &FeatureMatrix, temp_fill: f64) -> Self {
        let cols = matrix.columns.len();
        let rows = matrix.data.len().max(1) as f64;

        let mut means = vec![0.0; cols];
        for row in &matrix.data {
            for (m, v) in means.iter_mut().zip(row) {
                *m += v;
            }
        }
        for m in &mut means {
            *m /= rows;
        }

        let mut stds = vec![0.0; cols];
        for row in &matrix.data {
            for ((s, v), m) in stds.iter_mut().zip(row).zip(&means) {
                *s += (v - m) * (v - m);
            }
        }
        for s in &mut stds {
            *s = (*s / rows).sqrt();
            if *s <= f64::EPSILON {
                *s = 1.0;
            }
        }

        Self {
            means,
            stds,
            columns: matrix.columns.clone(),
            temp_fill,
        }
    }

    /// Standardize a whole matrix.
    pub fn transform(&self, matrix: &FeatureMatrix) -> Result<Vec<Vec<f64>>, FeatureError> {
        if matrix.columns != self.columns {
            return Err(FeatureError::ColumnMismatch {
                expected: self.columns.len(),
                got: matrix.columns.len(),
            });
        }
        Ok(matrix.data.iter().map(|row| self.zscores(row)).collect())
    }

    /// Z-scores of one raw feature row against the training statistics.
    pub fn zscores(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.means.iter().zip(&self.stds))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }
}

/// Median of the present `cpu_temp` readings; 0 when none are present.
pub fn cpu_temp_median(samples: &[Sample]) -> f64 {
    let mut temps: Vec<f64> = samples.iter().filter_map(|s| s.cpu_temp).collect();
    if temps.is_empty() {
        return 0.0;
    }
    temps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = temps.len() / 2;
    if temps.len() % 2 == 0 {
        (temps[mid - 1] + temps[mid]) / 2.0
    } else {
        temps[mid]
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Least-squares slope of `values` against their index.
pub fn slope(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let sum_x = (n - 1.0) * n / 2.0;
    let sum_x2 = (n - 1.0) * n * (2.0 * n - 1.0) / 6.0;
    let sum_y: f64 = values.iter().sum();
    let sum_xy: f64 = values.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
    let denom = n * sum_x2 - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denom
}

fn ema(values: &[f64], alpha: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut acc = values[0];
    out.push(acc);
    for &v in &values[1..] {
        acc = alpha * v + (1.0 - alpha) * acc;
        out.push(acc);
    }
    out
}
