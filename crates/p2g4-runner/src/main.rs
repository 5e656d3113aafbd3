//! # p2g4
//!
//! Command-line entry point of the 2.4 GHz PHY simulator.

use clap::Parser;
use p2g4_models::PluginRegistry;
use p2g4_runner::config::{Cli, Commands, ModelsArgs, RunArgs};
use p2g4_runner::RunnerError;
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(verbose: u8) {
    // RUST_LOG wins over -v
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn cmd_run(args: &RunArgs) -> Result<u64, RunnerError> {
    let cfg = args.resolve()?;
    info!(
        "Simulation {} phy {} with {} devices",
        cfg.sim_id, cfg.phy_id, cfg.devices
    );
    let report = p2g4_runner::run(&cfg)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.differences)
}

/// Library files named `lib_2G4<kind>_<name>.so`.
fn library_models(dir: &Path, kind: &str) -> Vec<String> {
    let prefix = format!("lib_2G4{}_", kind);
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|f| {
            f.strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".so"))
                .map(str::to_string)
        })
        .collect();
    names.sort();
    names
}

fn cmd_models(args: &ModelsArgs) {
    let registry = PluginRegistry::with_builtins(args.lib_dir.clone());

    println!("Channel models:");
    for name in registry.channel_names() {
        println!("  {} (built-in)", name);
    }
    for name in library_models(registry.lib_dir(), "Channel") {
        println!("  {} ({})", name, registry.channel_library(&name).display());
    }

    println!("Modem models:");
    for name in registry.modem_names() {
        println!("  {} (built-in)", name);
    }
    for name in library_models(registry.lib_dir(), "Modem") {
        println!("  {} ({})", name, registry.modem_library(&name).display());
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run(args) => match cmd_run(&args) {
            Ok(0) => ExitCode::SUCCESS,
            Ok(differences) => {
                warn!("{} differences found while comparing traces", differences);
                ExitCode::FAILURE
            }
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        },
        Commands::Models(args) => {
            cmd_models(&args);
            ExitCode::SUCCESS
        }
    }
}
