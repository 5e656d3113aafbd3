//! # p2g4-phy
//!
//! Discrete-event engine of the 2.4 GHz physical layer simulator.
//!
//! This crate provides:
//! - The per-device event queue ([`EventQueue`], [`EventKind`])
//! - The device link abstraction ([`DeviceLink`], [`Request`], [`Response`])
//! - The transmit, receive, CCA, RSSI and wait state machines
//! - The simulation context and main loop ([`Phy`])

mod cca;
pub mod error;
pub mod link;
mod phy;
pub mod queue;
mod rx;
mod tx;

use p2g4_common::SimTime;
use serde::{Deserialize, Serialize};

pub use cca::CcaStatus;
pub use error::PhyError;
pub use link::{DeviceLink, LinkError, Request, Response};
pub use phy::{DeviceOp, Phy};
pub use queue::{EventKind, EventQueue, NextEvent};
pub use rx::{RxState, RxStatus};

/// Default simulation length: practically unbounded.
pub const DEFAULT_SIM_LENGTH: SimTime = SimTime::from_micros(u64::MAX - 1_000_000_000);

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhyConfig {
    /// Number of devices.
    pub n_devs: usize,
    /// The simulation stops when the clock would reach this time.
    pub sim_length: SimTime,
    /// Keep the packet size of receptions that end with a CRC error.
    pub crcerr_data: bool,
}

impl PhyConfig {
    /// Configuration for `n_devs` devices with default settings.
    pub fn new(n_devs: usize) -> Self {
        Self {
            n_devs,
            sim_length: DEFAULT_SIM_LENGTH,
            crcerr_data: false,
        }
    }
}

/// Statistics collected during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhyStats {
    /// Simulated time when the run ended.
    pub end_time: SimTime,
    /// Events dispatched.
    pub events: u64,
    /// Transmissions requested.
    pub tx: u64,
    /// Receptions requested.
    pub rx: u64,
    pub rx_ok: u64,
    pub rx_crc_error: u64,
    pub rx_header_error: u64,
    pub rx_nosync: u64,
    /// Receptions stopped by the device after the address.
    pub rx_stopped: u64,
    /// RSSI measurements, including immediate ones.
    pub rssi: u64,
    pub cca: u64,
    pub waits: u64,
    pub disconnects: u64,
}
