//! CDP engine simulator
//!
//! Replays a TOML scenario against the lending core with in-memory
//! collaborators and prints the event log as JSON lines:
//! - Protocol profile from `CDP_PROFILE` or a TOML file
//! - Collateral assets and initial prices from the scenario file
//! - One JSON line per event, per failed step, and a closing summary

mod scenario;

use std::io::Write;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cdp_core::{config, init_config, ProtocolConfig};
use scenario::{Scenario, Simulation};

/// Environment variable names.
mod env {
    pub const SCENARIO: &str = "CDP_SCENARIO";
    pub const PROTOCOL_CONFIG: &str = "CDP_PROTOCOL_CONFIG";
}

const DEFAULT_SCENARIO: &str = "demos/liquidation.toml";

fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Logs go to stderr so stdout stays a clean event stream
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cdp_core=debug,cdp_chain=info")),
        )
        .init();

    // CDP_PROTOCOL_CONFIG points at a TOML file; otherwise CDP_PROFILE picks
    // a built-in profile (default, testing, conservative)
    let protocol = match std::env::var(env::PROTOCOL_CONFIG) {
        Ok(path) => ProtocolConfig::from_file(&path)?,
        Err(_) => ProtocolConfig::from_env(),
    };
    protocol.log_config();
    init_config(protocol);

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(env::SCENARIO).ok())
        .unwrap_or_else(|| DEFAULT_SCENARIO.to_string());
    let scenario = Scenario::from_file(&path)?;
    info!(
        path = %path,
        steps = scenario.steps.len(),
        assets = scenario.assets.assets.len(),
        "Scenario loaded"
    );

    let mut simulation = Simulation::new(config().clone(), &scenario)
        .context("Failed to set up simulation")?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let summary = simulation.run(&scenario.steps, &mut out)?;
    out.flush()?;

    info!(
        steps = summary.steps,
        failed = summary.failed,
        events = summary.events,
        "Scenario complete"
    );
    Ok(())
}
