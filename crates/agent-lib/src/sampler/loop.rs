//! Timer-driven sampling loop
//!
//! Ticks are scheduled against absolute deadlines: after a slow tick the
//! next sleep shrinks so the mean cadence matches the configured rate.
//! Ticks are never skipped, but a tick may be late. A failed sample is
//! logged and the tick dropped; the loop keeps running.

use super::{MetricsSampler, PlatformAdapter};
use crate::ingest::IngressQueue;
use crate::models::now_ts;
use crate::runtime::ShutdownToken;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Sleep slice so shutdown is noticed promptly during the timer wait.
const SLEEP_SLICE: Duration = Duration::from_millis(200);

pub struct SamplerLoop<A: PlatformAdapter> {
    sampler: MetricsSampler<A>,
    queue: Arc<IngressQueue>,
    period: Duration,
    shutdown: ShutdownToken,
}

impl<A: PlatformAdapter> SamplerLoop<A> {
    pub fn new(
        sampler: MetricsSampler<A>,
        queue: Arc<IngressQueue>,
        rate_seconds: f64,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            sampler,
            queue,
            period: Duration::from_secs_f64(rate_seconds),
            shutdown,
        }
    }

    /// Sampler thread body. Returns the number of ticks that produced a
    /// sample.
    pub fn run(mut self) -> u64 {
        info!(
            period_ms = self.period.as_millis() as u64,
            host = self.sampler.host(),
            "sampler started"
        );

        let mut produced = 0u64;
        let mut dropped_ticks = 0u64;
        let mut next_deadline = Instant::now() + self.period;

        loop {
            match self.sampler.sample(now_ts()) {
                Ok(sample) => {
                    self.queue.push(sample);
                    produced += 1;
                }
                Err(err) => {
                    dropped_ticks += 1;
                    warn!(error = %err, dropped_ticks, "sample failed, tick dropped");
                }
            }

            if self.shutdown.is_set() {
                break;
            }

            // Absolute deadline: a late tick shortens the next sleep
            // instead of shifting the whole schedule.
            let now = Instant::now();
            if next_deadline > now {
                self.sleep_until(next_deadline);
            } else {
                debug!(
                    behind_ms = (now - next_deadline).as_millis() as u64,
                    "tick ran late"
                );
            }
            next_deadline += self.period;

            if self.shutdown.is_set() {
                break;
            }
        }

        info!(produced, dropped_ticks, "sampler stopped");
        produced
    }

    fn sleep_until(&self, deadline: Instant) {
        loop {
            if self.shutdown.is_set() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawCounters;
    use crate::sampler::test_support::ScriptedAdapter;

    fn counters() -> RawCounters {
        RawCounters {
            cpu_pct: Some(5.0),
            mem_pct: Some(50.0),
            swap_pct: Some(0.0),
            proc_count: Some(10),
            disk_read_bytes: Some(0),
            disk_write_bytes: Some(0),
            net_up_bytes: Some(0),
            net_down_bytes: Some(0),
            cpu_temp: None,
        }
    }

    #[test]
    fn test_loop_produces_samples_until_shutdown() {
        let adapter = ScriptedAdapter::new(vec![counters(); 64]);
        let sampler = MetricsSampler::new(adapter, "test-host");
        let queue = Arc::new(IngressQueue::new(128));
        let shutdown = ShutdownToken::new();

        let handle = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || SamplerLoop::new(sampler, queue, 0.01, shutdown).run())
        };

        std::thread::sleep(Duration::from_millis(80));
        shutdown.set();
        let produced = handle.join().unwrap();

        assert!(produced >= 2, "expected several ticks, got {produced}");
        assert_eq!(queue.len() as u64, produced);
    }

    #[test]
    fn test_failed_tick_is_dropped_not_fatal() {
        // Script: one good read, then exhausted (errors forever).
        let adapter = ScriptedAdapter::new(vec![counters()]);
        let sampler = MetricsSampler::new(adapter, "test-host");
        let queue = Arc::new(IngressQueue::new(16));
        let shutdown = ShutdownToken::new();

        let handle = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || SamplerLoop::new(sampler, queue, 0.01, shutdown).run())
        };

        std::thread::sleep(Duration::from_millis(60));
        shutdown.set();
        let produced = handle.join().unwrap();

        assert_eq!(produced, 1);
        assert_eq!(queue.len(), 1);
    }
}
