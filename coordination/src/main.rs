//! Coordination host
//!
//! Runs the coordination pipeline on a fixed interval with an in-process
//! loopback transport.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, run until Ctrl-C
//! coordination
//!
//! # Config file, three agents, ten cycles, durable state
//! coordination --config coord.toml --agents w1,w2,w3 --cycles 10 --state-dir ./state
//!
//! # Environment overrides
//! COORD_CYCLE_INTERVAL_MS=250 RUST_LOG=coordination=debug coordination
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use coordination::agent::LifecycleError;
use coordination::config::CoordinationConfig;
use coordination::telemetry;
use coordination::{AgentId, CoordinationRuntime, LifecycleEvent};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file (COORD_* variables override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop after this many cycles (default: run until Ctrl-C)
    #[arg(long)]
    cycles: Option<u64>,

    /// Milliseconds between cycles (overrides orchestrator.cycle_interval_ms)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Comma-separated agent ids to register and activate at startup
    #[arg(long, value_delimiter = ',')]
    agents: Vec<String>,

    /// Directory for the JSON state store (overrides state.dir)
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing(telemetry::DEFAULT_DIRECTIVE);
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CoordinationConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CoordinationConfig::from_env().context("reading COORD_* environment")?,
    };
    if let Some(ms) = args.interval_ms {
        config.orchestrator.cycle_interval_ms = ms;
    }
    if let Some(dir) = args.state_dir {
        config.state.dir = Some(dir);
    }

    let interval_ms = config.orchestrator.cycle_interval_ms.max(1);
    let runtime = CoordinationRuntime::builder(config)
        .build()
        .context("building coordination runtime")?;

    for id in args.agents.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        match runtime.lifecycle().register(AgentId::from(id), Default::default()) {
            Ok(_) | Err(LifecycleError::AlreadyRegistered(_)) => {}
            Err(e) => return Err(e).with_context(|| format!("registering agent {}", id)),
        }
        if let Err(e) = runtime.lifecycle().advance(id, LifecycleEvent::Activate) {
            warn!(agent_id = id, error = %e, "agent not activated");
        }
    }

    info!(interval_ms, cycles = ?args.cycles, "coordination host started");

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    let mut completed = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping");
                break;
            }
        }

        let run = runtime.run_cycle(Vec::new()).await.context("running cycle")?;
        completed += 1;

        if let Some(notice) = &run.report.emergency {
            error!(
                cycle = run.report.cycle,
                record_id = %notice.record_id,
                reason = %notice.reason,
                "emergency halt raised, no further cycles accepted"
            );
            break;
        }
        if args.cycles.is_some_and(|limit| completed >= limit) {
            break;
        }
    }

    info!(cycles = completed, "coordination host stopped");
    Ok(())
}
