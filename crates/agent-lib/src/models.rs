//! Core data models for the monitoring agent

use serde::{Deserialize, Serialize};

/// Raw counters read from the platform in one pass.
///
/// Gauges (percentages, process count, temperature) are instantaneous;
/// disk and network fields are cumulative byte counters since boot and
/// are turned into per-second rates by the sampler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawCounters {
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
    pub swap_pct: Option<f64>,
    pub proc_count: Option<u32>,
    pub disk_read_bytes: Option<u64>,
    pub disk_write_bytes: Option<u64>,
    pub net_up_bytes: Option<u64>,
    pub net_down_bytes: Option<u64>,
    pub cpu_temp: Option<f64>,
}

impl RawCounters {
    /// True when not a single counter could be read.
    pub fn is_empty(&self) -> bool {
        self.cpu_pct.is_none()
            && self.mem_pct.is_none()
            && self.swap_pct.is_none()
            && self.proc_count.is_none()
            && self.disk_read_bytes.is_none()
            && self.disk_write_bytes.is_none()
            && self.net_up_bytes.is_none()
            && self.net_down_bytes.is_none()
    }
}

/// One observation of system metrics at a point in time.
///
/// Immutable once created; inserted in batches and pruned after the
/// retention window. Percentages are in `[0, 100]`, rates in bytes/sec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// UTC timestamp in whole seconds.
    pub ts: i64,
    pub host: String,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub swap_pct: f64,
    pub disk_read_bps: f64,
    pub disk_write_bps: f64,
    pub net_up_bps: f64,
    pub net_down_bps: f64,
    pub proc_count: u32,
    /// Absent on platforms without an exposed sensor.
    pub cpu_temp: Option<f64>,
}

impl Sample {
    /// Look up a metric value by column name.
    pub fn metric(&self, name: &str) -> Option<f64> {
        match name {
            "cpu_pct" => Some(self.cpu_pct),
            "mem_pct" => Some(self.mem_pct),
            "swap_pct" => Some(self.swap_pct),
            "disk_read_bps" => Some(self.disk_read_bps),
            "disk_write_bps" => Some(self.disk_write_bps),
            "net_up_bps" => Some(self.net_up_bps),
            "net_down_bps" => Some(self.net_down_bps),
            "proc_count" => Some(f64::from(self.proc_count)),
            "cpu_temp" => self.cpu_temp,
            _ => None,
        }
    }
}

/// Metric columns that feed the feature builder, in stable order.
pub const FEATURE_METRICS: &[&str] = &[
    "cpu_pct",
    "mem_pct",
    "swap_pct",
    "disk_read_bps",
    "disk_write_bps",
    "net_up_bps",
    "net_down_bps",
    "cpu_temp",
];

/// I/O rate metrics that additionally get a burstiness feature.
pub const IO_METRICS: &[&str] = &[
    "disk_read_bps",
    "disk_write_bps",
    "net_up_bps",
    "net_down_bps",
];

/// Kind of a persisted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Anomaly,
    ForecastBreach,
    Threshold,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Anomaly => "anomaly",
            EventKind::ForecastBreach => "forecast_breach",
            EventKind::Threshold => "threshold",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "anomaly" => Ok(EventKind::Anomaly),
            "forecast_breach" => Ok(EventKind::ForecastBreach),
            "threshold" => Ok(EventKind::Threshold),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Maximum length of a persisted event explanation.
pub const MAX_EXPLANATION_LEN: usize = 512;

/// An anomaly, forecast-breach, or threshold occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by the store on insert.
    pub id: Option<i64>,
    pub ts: i64,
    pub kind: EventKind,
    /// Anomaly score, or breach ETA in seconds for forecast events.
    pub score: Option<f64>,
    /// Comma-delimited metric names implicated, ordered and deduplicated.
    pub metric_tags: String,
    pub explanation: String,
}

impl Event {
    pub fn new(
        ts: i64,
        kind: EventKind,
        score: Option<f64>,
        tags: &[String],
        explanation: String,
    ) -> Self {
        let mut seen: Vec<String> = Vec::new();
        for tag in tags {
            if !seen.contains(tag) {
                seen.push(tag.clone());
            }
        }
        let mut explanation = explanation;
        explanation.truncate(MAX_EXPLANATION_LEN);
        Self {
            id: None,
            ts,
            kind,
            score,
            metric_tags: seen.join(","),
            explanation,
        }
    }
}

/// Alert severity handed to the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Notification produced by the rule engine for the external notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub body: String,
    pub source_event_id: Option<i64>,
}

/// A persisted model row: opaque blob plus versioned metadata.
#[derive(Debug, Clone)]
pub struct ModelRecord {
    pub name: String,
    pub algo: ModelAlgo,
    pub version: String,
    pub trained_at: i64,
    pub meta: serde_json::Value,
    pub blob: Vec<u8>,
}

/// Supported model algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelAlgo {
    IsolationForest,
    LinearRegressor,
    GradientBoost,
}

impl ModelAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelAlgo::IsolationForest => "isolation_forest",
            ModelAlgo::LinearRegressor => "linear_regressor",
            ModelAlgo::GradientBoost => "gradient_boost",
        }
    }
}

impl std::str::FromStr for ModelAlgo {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "isolation_forest" => Ok(ModelAlgo::IsolationForest),
            "linear_regressor" => Ok(ModelAlgo::LinearRegressor),
            "gradient_boost" => Ok(ModelAlgo::GradientBoost),
            other => Err(format!("unknown model algo: {other}")),
        }
    }
}

/// Current UTC timestamp in whole seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_dedups_and_truncates() {
        let tags = vec![
            "cpu_pct".to_string(),
            "mem_pct".to_string(),
            "cpu_pct".to_string(),
        ];
        let event = Event::new(100, EventKind::Anomaly, Some(0.7), &tags, "x".repeat(600));
        assert_eq!(event.metric_tags, "cpu_pct,mem_pct");
        assert_eq!(event.explanation.len(), MAX_EXPLANATION_LEN);
    }

    #[test]
    fn test_event_kind_round_trip() {
        for kind in [
            EventKind::Anomaly,
            EventKind::ForecastBreach,
            EventKind::Threshold,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_sample_metric_lookup() {
        let sample = Sample {
            ts: 1,
            host: "h".to_string(),
            cpu_pct: 10.0,
            mem_pct: 20.0,
            swap_pct: 5.0,
            disk_read_bps: 1.0,
            disk_write_bps: 2.0,
            net_up_bps: 3.0,
            net_down_bps: 4.0,
            proc_count: 100,
            cpu_temp: None,
        };
        assert_eq!(sample.metric("cpu_pct"), Some(10.0));
        assert_eq!(sample.metric("cpu_temp"), None);
        assert_eq!(sample.metric("bogus"), None);
    }

    #[test]
    fn test_raw_counters_empty() {
        assert!(RawCounters::default().is_empty());
        let counters = RawCounters {
            cpu_pct: Some(1.0),
            ..Default::default()
        };
        assert!(!counters.is_empty());
    }
}
