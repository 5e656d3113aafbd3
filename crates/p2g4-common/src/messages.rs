//! Device protocol message bodies.
//!
//! Two protocol generations coexist. v1 bodies are kept only at the edge of
//! the engine and are converted to their v2 counterparts on arrival (see
//! [`crate::remap`]).

use crate::{Freq, Modulation, Power, RssiValue, SimTime};
use serde::{Deserialize, Serialize};

/// Abort parameters carried by every long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortParams {
    /// The operation is cut short at this time.
    pub abort_time: SimTime,
    /// The device is asked for fresh abort parameters at this time.
    pub recheck_time: SimTime,
}

impl Default for AbortParams {
    fn default() -> Self {
        Self {
            abort_time: SimTime::NEVER,
            recheck_time: SimTime::NEVER,
        }
    }
}

/// Modulation and centre frequency of a radio operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RadioParams {
    pub modulation: Modulation,
    pub center_freq: Freq,
}

/// Which generation of the device protocol an operation was requested with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtoVersion {
    #[default]
    V1,
    V2,
}

// ============================================================================
// Requests
// ============================================================================

/// Wait until `end` and reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitRequest {
    pub end: SimTime,
}

/// v1 transmission: carrier and packet share one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxV1 {
    pub start_time: SimTime,
    pub end_time: SimTime,
    pub abort: AbortParams,
    pub phy_address: u32,
    pub radio_params: RadioParams,
    pub power_level: Power,
    pub packet_size: u16,
}

/// v2 transmission with separate carrier and packet windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxV2 {
    pub start_tx_time: SimTime,
    pub end_tx_time: SimTime,
    pub start_packet_time: SimTime,
    pub end_packet_time: SimTime,
    pub abort: AbortParams,
    pub phy_address: u64,
    pub radio_params: RadioParams,
    pub power_level: Power,
    pub packet_size: u16,
    pub coding_rate: u16,
}

/// v1 reception request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxV1 {
    pub start_time: SimTime,
    pub scan_duration: u32,
    pub phy_address: u32,
    pub radio_params: RadioParams,
    pub antenna_gain: Power,
    pub sync_threshold: u16,
    pub header_threshold: u16,
    pub pream_and_addr_duration: u16,
    pub header_duration: u16,
    pub bps: u32,
    pub abort: AbortParams,
}

/// v2 reception request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxV2 {
    pub start_time: SimTime,
    pub scan_duration: u32,
    /// Bits per second used to pace the bit-error calculation.
    pub error_calc_rate: u32,
    pub antenna_gain: Power,
    pub pream_and_addr_duration: u16,
    pub header_duration: u16,
    /// How many microseconds of the preamble may have been missed.
    pub acceptable_pre_truncation: u16,
    pub sync_threshold: u16,
    pub header_threshold: u16,
    pub resp_type: u8,
    pub prelocked_tx: bool,
    pub coding_rate: u16,
    /// Payload duration override, [`RxV2::NO_FORCED_DURATION`] when unused.
    pub forced_packet_duration: u32,
    pub radio_params: RadioParams,
    pub abort: AbortParams,
    /// Addresses this receiver will synchronize to.
    pub addresses: Vec<u64>,
}

impl RxV2 {
    /// Value of `forced_packet_duration` meaning "follow the transmitter".
    pub const NO_FORCED_DURATION: u32 = u32::MAX;
}

impl Default for RxV2 {
    fn default() -> Self {
        Self {
            start_time: SimTime::ZERO,
            scan_duration: 0,
            error_calc_rate: 1_000_000,
            antenna_gain: Power(0),
            pream_and_addr_duration: 0,
            header_duration: 0,
            acceptable_pre_truncation: 0,
            sync_threshold: 0,
            header_threshold: 0,
            resp_type: 0,
            prelocked_tx: false,
            coding_rate: 0,
            forced_packet_duration: Self::NO_FORCED_DURATION,
            radio_params: RadioParams::default(),
            abort: AbortParams::default(),
            addresses: Vec::new(),
        }
    }
}

/// Single RSSI measurement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RssiRequest {
    pub meas_time: SimTime,
    pub radio_params: RadioParams,
    pub antenna_gain: Power,
}

/// Stop the CCA search as soon as a modulated signal is found.
pub const CCA_STOP_ON_MOD: u8 = 0x1;
/// Stop the CCA search as soon as the RSSI threshold is exceeded.
pub const CCA_STOP_ON_RSSI: u8 = 0x2;

/// Clear channel assessment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CcaRequest {
    pub start_time: SimTime,
    pub scan_duration: u32,
    pub scan_period: u32,
    pub rssi_threshold: RssiValue,
    pub mod_threshold: RssiValue,
    pub stop_when_found: u8,
    pub antenna_gain: Power,
    pub radio_params: RadioParams,
    pub abort: AbortParams,
}

// ============================================================================
// Responses
// ============================================================================

/// Reception outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum RxStatus {
    Ok = 1,
    /// CRC error.
    PacketContentError = 2,
    HeaderError = 3,
    #[default]
    NoSync = 4,
    /// Address found, reception ongoing.
    InProgress = 5,
}

impl RxStatus {
    /// Decode a wire status byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RxStatus::Ok),
            2 => Some(RxStatus::PacketContentError),
            3 => Some(RxStatus::HeaderError),
            4 => Some(RxStatus::NoSync),
            5 => Some(RxStatus::InProgress),
            _ => None,
        }
    }

    /// Short name used in traces.
    pub fn as_str(&self) -> &'static str {
        match self {
            RxStatus::Ok => "OK",
            RxStatus::PacketContentError => "CRC_ERROR",
            RxStatus::HeaderError => "HEADER_ERROR",
            RxStatus::NoSync => "NOSYNC",
            RxStatus::InProgress => "IN_PROGRESS",
        }
    }
}

/// Transmission completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxDone {
    pub end_time: SimTime,
}

/// v1 reception outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxDoneV1 {
    pub end_time: SimTime,
    pub rx_time_stamp: SimTime,
    pub packet_size: u16,
    pub status: RxStatus,
    pub rssi: RssiValue,
}

/// v2 reception outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxDoneV2 {
    pub end_time: SimTime,
    pub rx_time_stamp: SimTime,
    pub packet_size: u16,
    pub status: RxStatus,
    pub rssi: RssiValue,
    pub phy_address: u64,
    pub coding_rate: u16,
}

/// RSSI measurement result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RssiDone {
    pub rssi: RssiValue,
}

/// CCA result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CcaDone {
    pub end_time: SimTime,
    pub rssi_ave: RssiValue,
    pub rssi_max: RssiValue,
    pub mod_rx_power: RssiValue,
    pub mod_found: bool,
    pub rssi_overthreshold: bool,
}
