//! sysmon-agent - single-host resource monitor
//!
//! Samples OS counters once per tick, persists them in a local SQLite
//! store, detects anomalies, forecasts time-to-threshold, and raises
//! alerts locally. Runs until interrupted.

use agent_lib::alerts::ConsoleNotifier;
use agent_lib::sampler::SysinfoAdapter;
use agent_lib::{Agent, AgentConfig};
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    // Optional first argument: path to a TOML config file.
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AgentConfig::load(config_path.as_deref()).context("invalid configuration")?;

    let host = SysinfoAdapter::hostname();
    info!(host = %host, db_path = %config.storage.db_path, "starting sysmon-agent");

    let agent = Agent::start(config, SysinfoAdapter::new(), host, ConsoleNotifier)?;

    let token = agent.shutdown_token();
    ctrlc::set_handler(move || {
        info!("interrupt received, shutting down");
        token.set();
    })
    .context("failed to install signal handler")?;

    // Workers exit once the shutdown token is set.
    agent.join();
    Ok(())
}
