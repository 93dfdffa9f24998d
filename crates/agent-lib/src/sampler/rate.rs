//! Rate derivation from monotonically-increasing byte counters

use crate::models::RawCounters;
use std::time::Instant;
use tracing::warn;

/// Convert a pair of monotonic counter readings into a bytes-per-second
/// rate. A wrapped or reset counter (`cur < prev`) and a non-positive
/// time delta both yield zero with a warning.
pub fn derive(prev: u64, cur: u64, dt_seconds: f64) -> f64 {
    if dt_seconds <= 0.0 {
        warn!(dt = dt_seconds, "non-positive time delta, rate forced to 0");
        return 0.0;
    }
    if cur < prev {
        warn!(prev, cur, "counter wrapped or reset, rate forced to 0");
        return 0.0;
    }
    (cur - prev) as f64 / dt_seconds
}

/// Derived per-second rates for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateSet {
    pub disk_read_bps: f64,
    pub disk_write_bps: f64,
    pub net_up_bps: f64,
    pub net_down_bps: f64,
}

/// Tracks the previous counter readings so each tick can be converted
/// into rates. The first observation has no prior and reads as zero.
pub struct RateTracker {
    prev: Option<RawCounters>,
    last_read: Option<Instant>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self {
            prev: None,
            last_read: None,
        }
    }

    /// Update with the current counters, using wall-clock time since the
    /// previous update as the delta.
    pub fn update(&mut self, counters: &RawCounters) -> RateSet {
        let now = Instant::now();
        let dt = self
            .last_read
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_read = Some(now);
        self.update_with_dt(counters, dt)
    }

    /// Update with an explicit time delta.
    pub fn update_with_dt(&mut self, counters: &RawCounters, dt_seconds: f64) -> RateSet {
        let rates = match &self.prev {
            None => RateSet::default(),
            Some(prev) => RateSet {
                disk_read_bps: derive_opt(prev.disk_read_bytes, counters.disk_read_bytes, dt_seconds),
                disk_write_bps: derive_opt(
                    prev.disk_write_bytes,
                    counters.disk_write_bytes,
                    dt_seconds,
                ),
                net_up_bps: derive_opt(prev.net_up_bytes, counters.net_up_bytes, dt_seconds),
                net_down_bps: derive_opt(prev.net_down_bytes, counters.net_down_bytes, dt_seconds),
            },
        };
        self.prev = Some(counters.clone());
        rates
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn derive_opt(prev: Option<u64>, cur: Option<u64>, dt_seconds: f64) -> f64 {
    match (prev, cur) {
        (Some(prev), Some(cur)) => derive(prev, cur, dt_seconds),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_basic() {
        assert_eq!(derive(1000, 3000, 2.0), 1000.0);
    }

    #[test]
    fn test_derive_counter_wrap_yields_zero() {
        assert_eq!(derive(1000, 500, 1.0), 0.0);
    }

    #[test]
    fn test_derive_non_positive_dt_yields_zero() {
        assert_eq!(derive(1000, 2000, 0.0), 0.0);
        assert_eq!(derive(1000, 2000, -1.0), 0.0);
    }

    #[test]
    fn test_derive_no_advance_yields_zero() {
        assert_eq!(derive(1000, 1000, 1.0), 0.0);
    }

    // Rates are >= 0 for any monotone counter sequence and zero exactly
    // when the counter did not advance, wrapped, or dt was non-positive.
    #[test]
    fn test_rates_non_negative_over_sequences() {
        let counters = [0u64, 10, 10, 500, 499, 1_000_000, u64::MAX];
        for window in counters.windows(2) {
            for dt in [-1.0, 0.0, 0.5, 1.0, 10.0] {
                let rate = derive(window[0], window[1], dt);
                assert!(rate >= 0.0 && rate.is_finite());
                let advanced = window[1] > window[0];
                if !advanced || dt <= 0.0 {
                    assert_eq!(rate, 0.0);
                }
            }
        }
    }

    #[test]
    fn test_tracker_first_observation_is_zero() {
        let mut tracker = RateTracker::new();
        let counters = RawCounters {
            net_up_bytes: Some(5000),
            ..Default::default()
        };
        assert_eq!(tracker.update_with_dt(&counters, 1.0), RateSet::default());
    }

    #[test]
    fn test_tracker_second_observation_derives() {
        let mut tracker = RateTracker::new();
        let first = RawCounters {
            net_up_bytes: Some(1000),
            net_down_bytes: Some(2000),
            disk_read_bytes: Some(0),
            disk_write_bytes: Some(0),
            ..Default::default()
        };
        let second = RawCounters {
            net_up_bytes: Some(3000),
            net_down_bytes: Some(2000),
            disk_read_bytes: Some(4096),
            disk_write_bytes: Some(0),
            ..Default::default()
        };
        tracker.update_with_dt(&first, 1.0);
        let rates = tracker.update_with_dt(&second, 2.0);
        assert_eq!(rates.net_up_bps, 1000.0);
        assert_eq!(rates.net_down_bps, 0.0);
        assert_eq!(rates.disk_read_bps, 2048.0);
    }
}
