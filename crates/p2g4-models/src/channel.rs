//! Built-in channel models.

use crate::{ChannelModel, ModelArgs, ModelError};
use clap::Parser;
use p2g4_common::{SimTime, TxList};
use std::path::PathBuf;

/// ISI-limited SNR reported by channels without multipath (dB).
pub const NO_ISI_SNR: f64 = 100.0;

#[derive(Parser, Debug)]
#[command(name = "NtNcable", no_binary_name = true)]
struct NtNcableArgs {
    /// Attenuation between any pair of devices in dB
    #[arg(long = "at", default_value_t = NtNcable::DEFAULT_ATTENUATION_DB)]
    attenuation: f64,

    /// File with "<tx> <rx> <att_dB>" lines overriding individual links
    #[arg(long)]
    file: Option<PathBuf>,
}

/// N-to-N cable: every link has a fixed attenuation, no fading, no ISI.
#[derive(Debug, Clone)]
pub struct NtNcable {
    n_devs: usize,
    /// Row-major `[tx][rx]` attenuation in dB.
    matrix: Vec<f64>,
}

impl NtNcable {
    /// Default attenuation between every pair of devices.
    pub const DEFAULT_ATTENUATION_DB: f64 = 60.0;

    /// Uniform cable with `attenuation` dB on every link.
    pub fn uniform(n_devs: usize, attenuation: f64) -> Self {
        Self {
            n_devs,
            matrix: vec![attenuation; n_devs * n_devs],
        }
    }

    /// Construct from command-line style arguments.
    pub fn from_args(args: &ModelArgs<'_>) -> Result<Self, ModelError> {
        let parsed = NtNcableArgs::try_parse_from(args.args).map_err(|e| ModelError::InvalidArgs {
            model: "NtNcable".to_string(),
            message: e.to_string(),
        })?;
        let mut cable = Self::uniform(args.n_devs, parsed.attenuation);
        if let Some(path) = parsed.file {
            let text = std::fs::read_to_string(&path)?;
            cable.apply_overrides(&text)?;
        }
        Ok(cable)
    }

    /// Apply "<tx> <rx> <att>" overrides. Blank lines and `#` comments are skipped.
    pub fn apply_overrides(&mut self, text: &str) -> Result<(), ModelError> {
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let bad = || ModelError::InvalidArgs {
                model: "NtNcable".to_string(),
                message: format!("line {}: expected '<tx> <rx> <att>', got '{}'", lineno + 1, line),
            };
            let mut fields = line.split_whitespace();
            let tx: usize = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
            let rx: usize = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
            let att: f64 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
            if tx >= self.n_devs || rx >= self.n_devs {
                return Err(bad());
            }
            self.matrix[tx * self.n_devs + rx] = att;
        }
        Ok(())
    }

    /// Attenuation from `tx` to `rx`.
    pub fn attenuation(&self, tx: usize, rx: usize) -> f64 {
        self.matrix[tx * self.n_devs + rx]
    }
}

impl ChannelModel for NtNcable {
    fn calc(
        &mut self,
        txl: &TxList,
        _tx_nbr: Option<usize>,
        rx_nbr: usize,
        _now: SimTime,
        att: &mut [f64],
    ) -> Result<f64, ModelError> {
        for (i, _) in txl.active() {
            att[i] = self.attenuation(i, rx_nbr);
        }
        Ok(NO_ISI_SNR)
    }
}
