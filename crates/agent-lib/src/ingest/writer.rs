//! Batching writer thread
//!
//! Drains the ingress queue and commits samples to the store in single
//! transactions: up to `batch_size` samples, or whatever accumulated
//! after `batch_timeout`, whichever comes first. Transient store
//! failures are retried with jittered exponential backoff; a batch that
//! keeps failing is dropped and the writer moves on.

use super::queue::IngressQueue;
use crate::models::Sample;
use crate::runtime::ShutdownToken;
use crate::store::Store;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Maximum commit attempts for one batch.
const MAX_RETRIES: u32 = 5;

/// First retry delay; doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(25);

/// Ceiling for a single backoff sleep.
const BACKOFF_CAP: Duration = Duration::from_millis(500);

/// Time allowed for the final flush on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Poll granularity while accumulating a batch.
const RECV_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_millis(1000),
        }
    }
}

pub struct BatchWriter {
    queue: Arc<IngressQueue>,
    store: Store,
    config: WriterConfig,
    shutdown: ShutdownToken,
    written: u64,
    dropped_batches: u64,
}

impl BatchWriter {
    pub fn new(
        queue: Arc<IngressQueue>,
        store: Store,
        config: WriterConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            queue,
            store,
            config,
            shutdown,
            written: 0,
            dropped_batches: 0,
        }
    }

    /// Writer thread body. Returns the total number of samples written.
    pub fn run(mut self) -> u64 {
        info!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout.as_millis() as u64,
            "batch writer started"
        );

        while !self.shutdown.is_set() {
            let batch = self.collect_batch();
            if !batch.is_empty() {
                self.commit_with_retry(&batch);
            }
        }

        self.final_flush();
        info!(
            written = self.written,
            dropped_batches = self.dropped_batches,
            "batch writer stopped"
        );
        self.written
    }

    /// Accumulate one batch: full, or whatever arrived within the batch
    /// timeout. Returns early on shutdown so the final flush can run.
    fn collect_batch(&self) -> Vec<Sample> {
        let deadline = Instant::now() + self.config.batch_timeout;
        let mut batch: Vec<Sample> = Vec::with_capacity(self.config.batch_size);

        while batch.len() < self.config.batch_size && !self.shutdown.is_set() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(RECV_SLICE);
            if let Some(sample) = self.queue.recv_timeout(wait) {
                batch.push(sample);
                let room = self.config.batch_size - batch.len();
                batch.extend(self.queue.drain(room));
            }
        }
        batch
    }

    fn commit_with_retry(&mut self, batch: &[Sample]) {
        let mut attempt = 0u32;
        loop {
            match self.store.insert_samples(batch) {
                Ok(count) => {
                    self.written += count as u64;
                    debug!(count, total = self.written, "committed batch");
                    return;
                }
                Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "store busy, retrying batch"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    self.dropped_batches += 1;
                    error!(
                        count = batch.len(),
                        dropped_batches = self.dropped_batches,
                        error = %err,
                        "dropping batch after persistent store failure"
                    );
                    return;
                }
            }
        }
    }

    /// Flush everything still queued in one last pass, bounded by the
    /// shutdown grace period.
    fn final_flush(&mut self) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.queue.is_empty() && Instant::now() < deadline {
            let batch = self.queue.drain(self.config.batch_size);
            if batch.is_empty() {
                break;
            }
            if let Err(err) = self.store.insert_samples(&batch) {
                error!(error = %err, "final flush failed, samples lost");
                return;
            }
            self.written += batch.len() as u64;
        }
        let remaining = self.queue.len();
        if remaining > 0 {
            warn!(remaining, "shutdown grace expired with samples still queued");
        }
    }
}

/// Exponential backoff with jitter, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(BACKOFF_CAP);
    let jitter_us = rand::thread_rng().gen_range(0..=base.as_micros() as u64 / 4);
    (base + Duration::from_micros(jitter_us)).min(BACKOFF_CAP)
}
