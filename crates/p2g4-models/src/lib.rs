//! # p2g4-models
//!
//! Channel and modem models for the 2.4 GHz PHY simulator.
//!
//! This crate provides:
//! - The model interfaces ([`ChannelModel`], [`ModemModel`])
//! - Built-in models ([`channel::NtNcable`], [`modem::Magic`], [`modem::BleSimple`])
//! - A name-keyed plugin registry with dynamic library fallback ([`PluginRegistry`])
//! - The channel/modem facade with result caching ([`ChannelModem`])
//! - The seeded Bernoulli sampler ([`BitErrorRng`])

pub mod channel;
pub mod dll;
pub mod facade;
pub mod modem;
pub mod random;
pub mod registry;

use p2g4_common::{Probability, RadioParams, RssiValue, SimTime, TxList, TxV2};
use thiserror::Error;

pub use facade::ChannelModem;
pub use random::BitErrorRng;
pub use registry::{ModelArgs, PluginRegistry};

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while creating or evaluating models.
#[derive(Debug, Error)]
pub enum ModelError {
    /// No built-in model and no library with this name.
    #[error("Unknown {kind} model: {name}")]
    Unknown {
        /// "channel" or "modem".
        kind: &'static str,
        /// Requested model name.
        name: String,
    },

    /// The model rejected its arguments.
    #[error("Invalid arguments for {model}: {message}")]
    InvalidArgs {
        /// Model name.
        model: String,
        /// Parser message.
        message: String,
    },

    /// Failed to load a plugin library.
    #[error("Failed to load plugin: {0}")]
    Load(#[from] libloading::Error),

    /// A required entry point is missing from a plugin library.
    #[error("Symbol {symbol} not found in {library}")]
    SymbolNotFound {
        /// Missing symbol.
        symbol: &'static str,
        /// Library path.
        library: String,
    },

    /// A plugin reported a failure.
    #[error("Plugin {name} failed: {message}")]
    PluginFailed {
        /// Plugin name.
        name: String,
        /// Failure description.
        message: String,
    },

    /// Reading a model input file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Model Interfaces
// ============================================================================

/// Result of the analog part of a receiver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalogRx {
    /// Signal to noise and interference ratio of the desired signal (dB).
    pub snr: f64,
    /// Total power seen at the receiver input (dBm).
    pub rssi_power: f64,
}

/// Propagation between devices.
pub trait ChannelModel {
    /// Fill `att[i]` with the attenuation (dB) from every device whose
    /// carrier is on to receiver `rx_nbr`, and return the SNR limit (dB)
    /// caused by inter-symbol interference on the `tx_nbr` link.
    ///
    /// `tx_nbr` is `None` when no particular transmitter is wanted (RSSI).
    fn calc(
        &mut self,
        txl: &TxList,
        tx_nbr: Option<usize>,
        rx_nbr: usize,
        now: SimTime,
        att: &mut [f64],
    ) -> Result<f64, ModelError>;
}

/// One device's receiver.
pub trait ModemModel {
    /// Analog front end: given the received power (dBm) of every device
    /// (`f64::NEG_INFINITY` for silent ones), compute the SNR of `desired`
    /// and the total input power.
    fn analog_rx(
        &mut self,
        rx_radio: &RadioParams,
        rx_powers: &[f64],
        txl: &TxList,
        desired: Option<usize>,
    ) -> Result<AnalogRx, ModelError>;

    /// Bit error probability for the given SNR.
    fn digital_perf_ber(&mut self, rx_radio: &RadioParams, snr: f64) -> Result<Probability, ModelError>;

    /// Probability of synchronizing to `tx` at the given SNR.
    fn digital_perf_sync(
        &mut self,
        rx_radio: &RadioParams,
        snr: f64,
        tx: &TxV2,
    ) -> Result<Probability, ModelError>;

    /// RSSI the device would report for the given input power.
    fn digital_rssi(&mut self, rx_radio: &RadioParams, rssi_power: f64) -> Result<RssiValue, ModelError>;
}
