//! # p2g4-runner
//!
//! Everything around the simulation engine needed to run it as a process:
//! the command line and configuration files, the socket transport to the
//! device processes with its wire codec, and the CSV trace dump which can
//! also compare a run against an earlier one.

pub mod codec;
pub mod config;
pub mod dump;
pub mod socket_link;

use config::RunConfig;
use dump::{DumpMode, DumpSink};
use p2g4_common::{NullSink, TraceError, TraceSink};
use p2g4_models::{BitErrorRng, ChannelModem, ModelArgs, ModelError, PluginRegistry};
use p2g4_phy::{DeviceLink, LinkError, Phy, PhyError, PhyStats};
use serde::Serialize;
use socket_link::SocketListener;
use thiserror::Error;
use tracing::info;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Simulation error: {0}")]
    Phy(#[from] PhyError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

// ============================================================================
// Run
// ============================================================================

/// Outcome of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub stats: PhyStats,
    /// Differences found when comparing against earlier traces.
    pub differences: u64,
}

/// Instantiate the channel and every device's modem.
pub fn build_channel_modem(registry: &PluginRegistry, cfg: &RunConfig) -> Result<ChannelModem, RunnerError> {
    let n = cfg.devices;
    let channel = registry.create_channel(&cfg.channel.name, &ModelArgs::channel(&cfg.channel.args, n))?;
    let modems = (0..n)
        .map(|d| {
            let spec = cfg.modem_for(d);
            registry.create_modem(&spec.name, &ModelArgs::modem(&spec.args, d, n))
        })
        .collect::<Result<Vec<_>, _>>()?;
    info!(
        "Channel {}, default modem {}, seed {}",
        cfg.channel.name, cfg.modem.name, cfg.seed
    );
    Ok(ChannelModem::new(channel, modems, BitErrorRng::new(cfg.seed)))
}

/// Trace sink selected by the configuration.
pub fn open_sink(cfg: &RunConfig) -> Result<Box<dyn TraceSink>, RunnerError> {
    if !cfg.dump && !cfg.compare {
        return Ok(Box::new(NullSink));
    }
    let mode = if cfg.compare {
        DumpMode::Compare {
            stop_on_diff: cfg.stop_on_diff,
        }
    } else {
        DumpMode::Write
    };
    Ok(Box::new(DumpSink::open(
        &cfg.results_dir,
        &cfg.sim_id,
        &cfg.phy_id,
        cfg.devices,
        mode,
    )?))
}

/// Run a simulation with devices connecting over the PHY socket.
pub fn run(cfg: &RunConfig) -> Result<RunReport, RunnerError> {
    cfg.validate()?;
    let registry = PluginRegistry::with_builtins(&cfg.lib_dir);
    let chm = build_channel_modem(&registry, cfg)?;
    let sink = open_sink(cfg)?;

    let listener = SocketListener::bind(cfg.socket_path())?;
    let link = listener.accept_devices(cfg.devices)?;
    run_with_link(cfg, chm, link, sink)
}

/// Run a simulation over an already connected link.
///
/// The sink is closed even when the simulation fails, so partial traces are
/// flushed.
pub fn run_with_link<L: DeviceLink>(
    cfg: &RunConfig,
    chm: ChannelModem,
    link: L,
    sink: Box<dyn TraceSink>,
) -> Result<RunReport, RunnerError> {
    let mut phy = Phy::new(cfg.phy_config(), chm, link, sink);
    let result = phy.run();
    let closed = phy.into_sink().close();
    let stats = result?;
    let differences = closed?;
    info!(
        "Simulation ended at {} us after {} events",
        stats.end_time.as_micros(),
        stats.events
    );
    Ok(RunReport { stats, differences })
}
