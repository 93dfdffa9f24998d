//! System metrics sampling
//!
//! This module provides the platform adapter seam, the sampler that turns
//! raw counters into [`Sample`]s, and the timer-driven sampling loop.
//! The core never reads OS counters directly; each platform provides one
//! [`PlatformAdapter`] implementation.

mod platform;
pub mod rate;
mod r#loop;

pub use platform::SysinfoAdapter;
pub use r#loop::SamplerLoop;
pub use rate::RateTracker;

use crate::models::{RawCounters, Sample};
use thiserror::Error;
use tracing::warn;

/// Sampler errors. A missing individual counter is not an error; these
/// cover the cases where a tick cannot produce a sample at all.
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("no counters could be read: {0}")]
    Unavailable(String),

    #[error("platform read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Injectable platform seam: reads every counter in one pass.
pub trait PlatformAdapter: Send {
    fn read_counters(&mut self, now: i64) -> Result<RawCounters, SamplerError>;
}

/// Turns raw platform counters into complete [`Sample`]s, deriving
/// per-second rates from the cumulative byte counters.
pub struct MetricsSampler<A: PlatformAdapter> {
    adapter: A,
    host: String,
    rates: RateTracker,
}

impl<A: PlatformAdapter> MetricsSampler<A> {
    pub fn new(adapter: A, host: impl Into<String>) -> Self {
        Self {
            adapter,
            host: host.into(),
            rates: RateTracker::new(),
        }
    }

    /// Sample current system metrics.
    ///
    /// A transiently missing gauge is logged and reads as zero; a read
    /// where no counter at all is available yields [`SamplerError`] and
    /// the tick is dropped by the caller.
    pub fn sample(&mut self, now: i64) -> Result<Sample, SamplerError> {
        let counters = self.adapter.read_counters(now)?;

        if counters.is_empty() {
            return Err(SamplerError::Unavailable(
                "platform adapter returned no counters".to_string(),
            ));
        }

        let rates = self.rates.update(&counters);

        Ok(Sample {
            ts: now,
            host: self.host.clone(),
            cpu_pct: gauge_or_zero(counters.cpu_pct, "cpu_pct"),
            mem_pct: gauge_or_zero(counters.mem_pct, "mem_pct"),
            swap_pct: gauge_or_zero(counters.swap_pct, "swap_pct"),
            disk_read_bps: rates.disk_read_bps,
            disk_write_bps: rates.disk_write_bps,
            net_up_bps: rates.net_up_bps,
            net_down_bps: rates.net_down_bps,
            proc_count: counters.proc_count.unwrap_or_else(|| {
                warn!(counter = "proc_count", "counter unavailable this tick");
                0
            }),
            cpu_temp: counters.cpu_temp,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

fn gauge_or_zero(value: Option<f64>, name: &'static str) -> f64 {
    match value {
        Some(v) => v,
        None => {
            warn!(counter = name, "counter unavailable this tick");
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted adapter that replays a fixed sequence of counter reads.
    pub struct ScriptedAdapter {
        pub reads: VecDeque<RawCounters>,
    }

    impl ScriptedAdapter {
        pub fn new(reads: Vec<RawCounters>) -> Self {
            Self {
                reads: reads.into(),
            }
        }
    }

    impl PlatformAdapter for ScriptedAdapter {
        fn read_counters(&mut self, _now: i64) -> Result<RawCounters, SamplerError> {
            self.reads
                .pop_front()
                .ok_or_else(|| SamplerError::Unavailable("script exhausted".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ScriptedAdapter;
    use super::*;

    fn counters(cpu: f64, net_up: u64) -> RawCounters {
        RawCounters {
            cpu_pct: Some(cpu),
            mem_pct: Some(40.0),
            swap_pct: Some(1.0),
            proc_count: Some(200),
            disk_read_bytes: Some(0),
            disk_write_bytes: Some(0),
            net_up_bytes: Some(net_up),
            net_down_bytes: Some(0),
            cpu_temp: None,
        }
    }

    #[test]
    fn test_first_tick_has_zero_rates() {
        let adapter = ScriptedAdapter::new(vec![counters(10.0, 1000)]);
        let mut sampler = MetricsSampler::new(adapter, "host-a");

        let sample = sampler.sample(100).unwrap();
        assert_eq!(sample.ts, 100);
        assert_eq!(sample.host, "host-a");
        assert_eq!(sample.cpu_pct, 10.0);
        assert_eq!(sample.net_up_bps, 0.0);
    }

    #[test]
    fn test_missing_gauge_reads_zero() {
        let mut c = counters(10.0, 0);
        c.mem_pct = None;
        let adapter = ScriptedAdapter::new(vec![c]);
        let mut sampler = MetricsSampler::new(adapter, "host-a");

        let sample = sampler.sample(100).unwrap();
        assert_eq!(sample.mem_pct, 0.0);
    }

    #[test]
    fn test_total_failure_is_error() {
        let adapter = ScriptedAdapter::new(vec![RawCounters::default()]);
        let mut sampler = MetricsSampler::new(adapter, "host-a");
        assert!(sampler.sample(100).is_err());
    }
}
