//! Command line and configuration files.
//!
//! A run is configured from optional YAML files, merged in the order given,
//! and then from command line flags, which take precedence.

use crate::RunnerError;
use clap::{ArgAction, Args, Parser, Subcommand};
use p2g4_models::random::DEFAULT_SEED;
use p2g4_models::registry::{DEFAULT_CHANNEL, DEFAULT_MODEM};
use p2g4_phy::{PhyConfig, DEFAULT_SIM_LENGTH};
use p2g4_common::SimTime;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ============================================================================
// CLI
// ============================================================================

/// p2g4 - 2.4 GHz physical layer simulator
#[derive(Parser, Debug)]
#[command(name = "p2g4")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation
    Run(RunArgs),
    /// List the available channel and modem models
    Models(ModelsArgs),
}

/// Options of `p2g4 run`.
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// YAML configuration files, applied in order
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Vec<PathBuf>,

    /// Simulation id, shared with the devices
    #[arg(short = 's', long)]
    pub sim_id: Option<String>,

    /// Id of this PHY within the simulation
    #[arg(short = 'p', long)]
    pub phy_id: Option<String>,

    /// Number of devices
    #[arg(short = 'D', long)]
    pub devices: Option<usize>,

    /// Simulation length in microseconds
    #[arg(long, value_name = "US")]
    pub sim_length: Option<u64>,

    /// Seed of the bit error random generator
    #[arg(long)]
    pub seed: Option<u64>,

    /// Do not dump traces
    #[arg(long)]
    pub no_dump: bool,

    /// Compare against previously dumped traces instead of dumping
    #[arg(long)]
    pub compare: bool,

    /// Stop at the first comparison difference
    #[arg(long)]
    pub stop_on_diff: bool,

    /// Report the packet size of receptions with CRC errors
    #[arg(long)]
    pub crcerr_data: bool,

    /// Channel model
    #[arg(long)]
    pub channel: Option<String>,

    /// Argument for the channel model (repeatable)
    #[arg(long = "channel-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub channel_args: Vec<String>,

    /// Default modem model
    #[arg(long)]
    pub modem: Option<String>,

    /// Argument for the default modem (repeatable)
    #[arg(long = "modem-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub modem_args: Vec<String>,

    /// Modem of one device, as DEVICE=NAME (repeatable)
    #[arg(long = "dev-modem", value_name = "DEVICE=NAME", value_parser = parse_dev_modem)]
    pub dev_modems: Vec<(usize, String)>,

    /// Directory for trace dumps
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Directory of the device sockets
    #[arg(long)]
    pub socket_dir: Option<PathBuf>,

    /// Directory of channel and modem libraries
    #[arg(long)]
    pub lib_dir: Option<PathBuf>,
}

/// Options of `p2g4 models`.
#[derive(Args, Debug, Default, Clone)]
pub struct ModelsArgs {
    /// Directory of channel and modem libraries
    #[arg(long, default_value = "lib")]
    pub lib_dir: PathBuf,
}

fn parse_dev_modem(s: &str) -> Result<(usize, String), String> {
    let (dev, name) = s
        .split_once('=')
        .ok_or_else(|| format!("expected DEVICE=NAME, got '{}'", s))?;
    let dev = dev
        .trim()
        .parse()
        .map_err(|_| format!("invalid device number '{}'", dev))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty modem name in '{}'", s));
    }
    Ok((dev, name.to_string()))
}

// ============================================================================
// Resolved Configuration
// ============================================================================

/// A model selection: name and arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ModelSpec {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            args: Vec::new(),
        }
    }
}

/// Complete configuration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub sim_id: String,
    pub phy_id: String,
    pub devices: usize,
    /// Microseconds; unbounded when absent.
    pub sim_length: Option<u64>,
    pub seed: u64,
    pub dump: bool,
    pub compare: bool,
    pub stop_on_diff: bool,
    pub crcerr_data: bool,
    pub channel: ModelSpec,
    pub modem: ModelSpec,
    /// Modems overriding the default for some devices.
    pub device_modems: BTreeMap<usize, ModelSpec>,
    pub results_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub lib_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sim_id: "Random".to_string(),
            phy_id: "2G4".to_string(),
            devices: 0,
            sim_length: None,
            seed: DEFAULT_SEED,
            dump: true,
            compare: false,
            stop_on_diff: false,
            crcerr_data: false,
            channel: ModelSpec::named(DEFAULT_CHANNEL),
            modem: ModelSpec::named(DEFAULT_MODEM),
            device_modems: BTreeMap::new(),
            results_dir: PathBuf::from("results"),
            socket_dir: std::env::temp_dir().join("p2g4"),
            lib_dir: PathBuf::from("lib"),
        }
    }
}

impl RunConfig {
    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.devices == 0 {
            return Err(RunnerError::Config("the number of devices must be at least 1".to_string()));
        }
        if let Some(d) = self.device_modems.keys().find(|&&d| d >= self.devices) {
            return Err(RunnerError::Config(format!(
                "modem given for device {} but there are only {} devices",
                d, self.devices
            )));
        }
        if self.stop_on_diff && !self.compare {
            return Err(RunnerError::Config("stop_on_diff requires compare".to_string()));
        }
        if self.sim_id.is_empty() || self.sim_id.contains('/') {
            return Err(RunnerError::Config(format!("invalid simulation id '{}'", self.sim_id)));
        }
        Ok(())
    }

    /// Modem of device `d`.
    pub fn modem_for(&self, d: usize) -> &ModelSpec {
        self.device_modems.get(&d).unwrap_or(&self.modem)
    }

    /// Engine configuration.
    pub fn phy_config(&self) -> PhyConfig {
        PhyConfig {
            n_devs: self.devices,
            sim_length: self.sim_length.map_or(DEFAULT_SIM_LENGTH, SimTime::from_micros),
            crcerr_data: self.crcerr_data,
        }
    }

    /// Path of the socket the devices connect to.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(&self.sim_id).join(format!("{}.sock", self.phy_id))
    }
}

/// Merge `overlay` into `base`: mappings merge key by key, anything else
/// replaces.
fn merge_yaml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (k, v) in overlay {
                match base.get_mut(&k) {
                    Some(existing) => merge_yaml(existing, v),
                    None => {
                        base.insert(k, v);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Load and merge YAML files into one configuration.
pub fn load_config_files(paths: &[PathBuf]) -> Result<RunConfig, RunnerError> {
    let mut merged = Value::Mapping(Default::default());
    for path in paths {
        merge_yaml(&mut merged, read_yaml(path)?);
    }
    Ok(serde_yaml::from_value(merged)?)
}

fn read_yaml(path: &Path) -> Result<Value, RunnerError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RunnerError::Config(format!("reading {}: {}", path.display(), e)))?;
    let value: Value = serde_yaml::from_str(&text)?;
    // An empty file is a null document.
    Ok(if value.is_null() {
        Value::Mapping(Default::default())
    } else {
        value
    })
}

impl RunArgs {
    /// Resolve files and flags into a run configuration.
    pub fn resolve(&self) -> Result<RunConfig, RunnerError> {
        let mut cfg = load_config_files(&self.config)?;

        if let Some(v) = &self.sim_id {
            cfg.sim_id = v.clone();
        }
        if let Some(v) = &self.phy_id {
            cfg.phy_id = v.clone();
        }
        if let Some(v) = self.devices {
            cfg.devices = v;
        }
        if let Some(v) = self.sim_length {
            cfg.sim_length = Some(v);
        }
        if let Some(v) = self.seed {
            cfg.seed = v;
        }
        if self.no_dump {
            cfg.dump = false;
        }
        if self.compare {
            cfg.compare = true;
        }
        if self.stop_on_diff {
            cfg.stop_on_diff = true;
        }
        if self.crcerr_data {
            cfg.crcerr_data = true;
        }
        if let Some(v) = &self.channel {
            cfg.channel = ModelSpec::named(v);
        }
        if !self.channel_args.is_empty() {
            cfg.channel.args = self.channel_args.clone();
        }
        if let Some(v) = &self.modem {
            cfg.modem = ModelSpec::named(v);
        }
        if !self.modem_args.is_empty() {
            cfg.modem.args = self.modem_args.clone();
        }
        for (d, name) in &self.dev_modems {
            cfg.device_modems.insert(*d, ModelSpec::named(name));
        }
        if let Some(v) = &self.results_dir {
            cfg.results_dir = v.clone();
        }
        if let Some(v) = &self.socket_dir {
            cfg.socket_dir = v.clone();
        }
        if let Some(v) = &self.lib_dir {
            cfg.lib_dir = v.clone();
        }

        cfg.validate()?;
        Ok(cfg)
    }
}
