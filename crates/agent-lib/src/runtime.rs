//! Runtime orchestration
//!
//! Three long-lived workers share one shutdown token: the sampler thread
//! (timer wait, counter reads, non-blocking enqueue), the writer thread
//! (blocking dequeue, store commits), and the maintenance thread
//! (retention pruning, model upkeep, rule evaluation). On shutdown the
//! sampler exits at the end of its tick, the writer performs one final
//! flush, and maintenance exits at its next wakeup.

use crate::alerts::{Firing, Notifier, RuleEngine, DEFAULT_MIN_ETA_SECS};
use crate::config::AgentConfig;
use crate::detect::{self, AnomalyDetector, AnomalyModel, DetectError};
use crate::forecast::{self, ForecastError, ForecastModel, Forecaster};
use crate::ingest::{BatchWriter, IngressQueue, QueueStats, WriterConfig};
use crate::models::now_ts;
use crate::sampler::{MetricsSampler, PlatformAdapter, SamplerLoop};
use crate::store::Store;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cooperative shutdown flag shared by every worker thread.
#[derive(Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Maintenance cadences.
#[derive(Debug, Clone)]
pub struct MaintenanceIntervals {
    /// Rule evaluation over fresh samples and events.
    pub rules: Duration,
    /// Model upkeep: training when absent, detection, forecasting.
    pub models: Duration,
    /// Retention pruning.
    pub prune: Duration,
}

impl Default for MaintenanceIntervals {
    fn default() -> Self {
        Self {
            rules: Duration::from_secs(1),
            models: Duration::from_secs(60),
            prune: Duration::from_secs(3600),
        }
    }
}

/// Extra samples read past the feature warmup on each detection pass.
const DETECT_SPAN: usize = 120;

/// Recent samples fed to the forecaster projection.
const FORECAST_CONTEXT: usize = 900;

/// Event batch consumed per rule pass.
const EVENT_BATCH: usize = 256;

/// Maintenance worker: owns the rule engine (and its cooldown state),
/// model caches, and the read cursors over samples and events.
pub struct MaintenanceLoop {
    store: Store,
    config: AgentConfig,
    intervals: MaintenanceIntervals,
    engine: RuleEngine,
    notifier: Box<dyn Notifier>,
    detector: AnomalyDetector,
    forecaster: Forecaster,
    anomaly_cache: Option<(i64, AnomalyModel)>,
    forecast_cache: Option<(i64, ForecastModel)>,
    last_sample_ts: i64,
    last_event_id: i64,
    last_detect_ts: i64,
}

impl MaintenanceLoop {
    pub fn new(store: Store, config: AgentConfig, notifier: Box<dyn Notifier>) -> Result<Self> {
        let engine = RuleEngine::with_default_rules(&config.thresholds, config.rules.cooldown_seconds);
        let detector = AnomalyDetector::new(config.anomaly.clone(), &config.features);
        let forecaster = Forecaster::new(config.forecast.clone());

        // Start the cursors at the current tail so old history is not
        // replayed through the rules on startup.
        let last_sample_ts = store
            .latest_samples(1)?
            .first()
            .map(|s| s.ts)
            .unwrap_or(0);
        let last_event_id = store.last_event_id()?;

        Ok(Self {
            store,
            config,
            intervals: MaintenanceIntervals::default(),
            engine,
            notifier,
            detector,
            forecaster,
            anomaly_cache: None,
            forecast_cache: None,
            last_sample_ts,
            last_detect_ts: last_sample_ts,
            last_event_id,
        })
    }

    /// Override cadences (tests use short ones).
    pub fn with_intervals(mut self, intervals: MaintenanceIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    /// Maintenance thread body.
    pub fn run(mut self, shutdown: ShutdownToken) {
        info!("maintenance loop started");
        let mut next_models = Instant::now() + self.intervals.models;
        let mut next_prune = Instant::now() + self.intervals.prune;

        while !shutdown.is_set() {
            let now = now_ts();
            self.tick_rules(now);

            let t = Instant::now();
            if t >= next_models {
                self.tick_models(now);
                next_models = Instant::now() + self.intervals.models;
            }
            if t >= next_prune {
                self.tick_prune(now);
                next_prune = Instant::now() + self.intervals.prune;
            }

            std::thread::sleep(self.intervals.rules);
        }
        info!("maintenance loop stopped");
    }

    /// Evaluate threshold rules over fresh samples and event rules over
    /// newly written events.
    pub fn tick_rules(&mut self, now: i64) {
        match self.store.read_samples(self.last_sample_ts + 1, i64::MAX, None) {
            Ok(samples) => {
                for sample in &samples {
                    self.last_sample_ts = self.last_sample_ts.max(sample.ts);
                    let firings = self.engine.evaluate_sample(sample, sample.ts);
                    for firing in firings {
                        self.deliver(firing);
                    }
                }
            }
            Err(err) => warn!(error = %err, "rule pass could not read samples"),
        }

        match self.store.events_after(self.last_event_id, EVENT_BATCH) {
            Ok(events) => {
                for event in &events {
                    self.last_event_id = self.last_event_id.max(event.id.unwrap_or(0));
                    let firings = self.engine.evaluate_event(event, now);
                    for firing in firings {
                        self.deliver(firing);
                    }
                }
            }
            Err(err) => warn!(error = %err, "rule pass could not read events"),
        }
    }

    /// Model upkeep: train missing models when enough data has
    /// accumulated, then run detection and forecasting over the recent
    /// window, persisting any resulting events.
    pub fn tick_models(&mut self, now: i64) {
        self.maybe_train(now);
        self.refresh_caches();
        self.detect_pass();
        self.forecast_pass(now);
    }

    pub fn tick_prune(&mut self, now: i64) {
        if let Err(err) = self.store.prune(self.config.storage.retention_days, now) {
            warn!(error = %err, "retention pruning failed");
        }
    }

    fn maybe_train(&mut self, now: i64) {
        match self.store.model_trained_at(detect::MODEL_NAME) {
            Ok(None) => match self.detector.train(&self.store, now) {
                Ok(report) => info!(
                    threshold = report.threshold,
                    train_rows = report.train_rows,
                    "anomaly model trained"
                ),
                Err(DetectError::NotEnoughData { got, needed }) => {
                    debug!(got, needed, "anomaly baseline still accumulating")
                }
                Err(err) => warn!(error = %err, "anomaly training failed"),
            },
            Ok(Some(_)) => {}
            Err(err) => warn!(error = %err, "could not check anomaly model"),
        }

        match self.store.model_trained_at(forecast::MODEL_NAME) {
            Ok(None) => {
                let from = now - i64::from(self.config.anomaly.baseline_window_days) * 86_400;
                let history = match self.store.read_samples(from, now, None) {
                    Ok(h) => h,
                    Err(err) => {
                        warn!(error = %err, "could not read forecast history");
                        return;
                    }
                };
                match self.forecaster.train(&self.store, &history) {
                    Ok(_) => info!("forecast model trained"),
                    Err(ForecastError::InsufficientData { got, needed }) => {
                        debug!(got, needed, "forecast history still accumulating")
                    }
                    Err(err) => warn!(error = %err, "forecast training failed"),
                }
            }
            Ok(Some(_)) => {}
            Err(err) => warn!(error = %err, "could not check forecast model"),
        }
    }

    /// Reload cached models when the stored record is newer.
    fn refresh_caches(&mut self) {
        if let Ok(Some(trained_at)) = self.store.model_trained_at(detect::MODEL_NAME) {
            let stale = self
                .anomaly_cache
                .as_ref()
                .map_or(true, |(cached, _)| *cached != trained_at);
            if stale {
                match self.detector.load(&self.store) {
                    Ok(model) => self.anomaly_cache = Some((trained_at, model)),
                    Err(err) => {
                        warn!(error = %err, "failed to load anomaly model");
                        self.anomaly_cache = None;
                    }
                }
            }
        }

        if let Ok(Some(trained_at)) = self.store.model_trained_at(forecast::MODEL_NAME) {
            let stale = self
                .forecast_cache
                .as_ref()
                .map_or(true, |(cached, _)| *cached != trained_at);
            if stale {
                match self.forecaster.load(&self.store) {
                    Ok(model) => self.forecast_cache = Some((trained_at, model)),
                    Err(err) => {
                        warn!(error = %err, "failed to load forecast model");
                        self.forecast_cache = None;
                    }
                }
            }
        }
    }

    fn detect_pass(&mut self) {
        let Some((_, model)) = &self.anomaly_cache else {
            return;
        };
        let want = self.detector_context();
        let recent = match self.store.latest_samples(want) {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "detection pass could not read samples");
                return;
            }
        };
        match self.detector.detect_with(model, &recent) {
            Ok(events) => {
                for event in events {
                    // Overlapping windows rescore old rows; only emit
                    // events past the detection cursor.
                    if event.ts > self.last_detect_ts {
                        if let Err(err) = self.store.write_event(&event) {
                            warn!(error = %err, "failed to persist anomaly event");
                        }
                    }
                }
                if let Some(last) = recent.last() {
                    self.last_detect_ts = self.last_detect_ts.max(last.ts);
                }
            }
            Err(DetectError::Feature(_)) => {
                debug!("not enough recent samples for a detection pass")
            }
            Err(DetectError::ModelStale(reason)) => {
                warn!(reason, "anomaly model stale, dropping cache");
                self.anomaly_cache = None;
            }
            Err(err) => warn!(error = %err, "detection pass failed"),
        }
    }

    fn forecast_pass(&mut self, now: i64) {
        let Some((_, model)) = &self.forecast_cache else {
            return;
        };
        let recent = match self.store.latest_samples(FORECAST_CONTEXT) {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "forecast pass could not read samples");
                return;
            }
        };
        if recent.is_empty() {
            return;
        }
        let forecasts = self
            .forecaster
            .forecast(model, &recent, &self.config.thresholds);
        for event in Forecaster::breach_events(&forecasts, DEFAULT_MIN_ETA_SECS, now) {
            if let Err(err) = self.store.write_event(&event) {
                warn!(error = %err, "failed to persist forecast event");
            }
        }
    }

    /// Persist a threshold event if the firing carries one, then hand
    /// the notification off. Delivery failures are the notifier's
    /// concern; they never propagate.
    fn deliver(&mut self, firing: Firing) {
        let mut notification = firing.notification;
        if let Some(event) = firing.event {
            match self.store.write_event(&event) {
                Ok(id) => {
                    notification.source_event_id = Some(id);
                    // The rule pass cursor skips self-written events.
                    self.last_event_id = self.last_event_id.max(id);
                }
                Err(err) => warn!(error = %err, "failed to persist threshold event"),
            }
        }
        self.notifier.notify(&notification);
    }

    fn detector_context(&self) -> usize {
        self.config.features.long_window + crate::features::LAGS + DETECT_SPAN
    }
}

/// Running agent: the three worker threads plus shared handles.
pub struct Agent {
    shutdown: ShutdownToken,
    store: Store,
    queue: Arc<IngressQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Open the store and start the sampler, writer, and maintenance
    /// threads.
    pub fn start<A, N>(
        config: AgentConfig,
        adapter: A,
        host: impl Into<String>,
        notifier: N,
    ) -> Result<Self>
    where
        A: PlatformAdapter + 'static,
        N: Notifier + 'static,
    {
        let store = Store::open(
            Path::new(&config.storage.db_path),
            config.storage.wal_checkpoint_interval,
        )
        .context("failed to open store")?;

        let shutdown = ShutdownToken::new();
        let queue = Arc::new(IngressQueue::new(config.sampling.max_queue_size));

        let sampler = MetricsSampler::new(adapter, host.into());
        let sampler_loop = SamplerLoop::new(
            sampler,
            queue.clone(),
            config.sampling.rate_seconds,
            shutdown.clone(),
        );
        let sampler_handle = std::thread::Builder::new()
            .name("sysmon-sampler".to_string())
            .spawn(move || {
                sampler_loop.run();
            })
            .context("failed to spawn sampler thread")?;

        let writer = BatchWriter::new(
            queue.clone(),
            store.clone(),
            WriterConfig {
                batch_size: config.sampling.batch_size,
                ..WriterConfig::default()
            },
            shutdown.clone(),
        );
        let writer_handle = std::thread::Builder::new()
            .name("sysmon-writer".to_string())
            .spawn(move || {
                writer.run();
            })
            .context("failed to spawn writer thread")?;

        let maintenance = MaintenanceLoop::new(store.clone(), config, Box::new(notifier))
            .context("failed to initialize maintenance loop")?;
        let maintenance_shutdown = shutdown.clone();
        let maintenance_handle = std::thread::Builder::new()
            .name("sysmon-maint".to_string())
            .spawn(move || maintenance.run(maintenance_shutdown))
            .context("failed to spawn maintenance thread")?;

        info!("agent started");
        Ok(Self {
            shutdown,
            store,
            queue,
            handles: vec![sampler_handle, writer_handle, maintenance_handle],
        })
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Signal shutdown and wait for every worker to exit.
    pub fn stop(self) {
        self.shutdown.set();
        self.join();
    }

    /// Wait for the workers; call after the shutdown token was set.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        info!("agent stopped");
    }
}
