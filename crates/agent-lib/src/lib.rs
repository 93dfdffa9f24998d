//! Core library for the sysmon agent
//!
//! This crate provides the always-on monitoring pipeline:
//! - System counter sampling with rate derivation
//! - Bounded ingestion into a WAL-mode SQLite store
//! - Windowed feature construction and normalization
//! - Isolation-forest anomaly detection with FPR calibration
//! - Per-metric time-to-threshold forecasting
//! - Alert rules with per-rule cooldown

pub mod alerts;
pub mod config;
pub mod detect;
pub mod export;
pub mod features;
pub mod forecast;
pub mod ingest;
pub mod models;
pub mod runtime;
pub mod sampler;
pub mod store;

pub use config::AgentConfig;
pub use models::{Event, EventKind, Notification, RawCounters, Sample, Severity};
pub use runtime::{Agent, ShutdownToken};
pub use store::Store;
