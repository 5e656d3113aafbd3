//! # p2g4-common
//!
//! Common types for the 2.4 GHz physical-layer simulator.
//!
//! This crate provides the primitives shared by the engine, the models and
//! the runner:
//! - Time representation ([`SimTime`])
//! - Fixed-point radio units ([`Power`], [`Freq`], [`RssiValue`], [`Modulation`])
//! - Device protocol messages ([`messages`]) and the v1/v2 remapping ([`remap`])
//! - The transmission registry ([`txlist`])
//! - The trace sink interface ([`trace`])

pub mod messages;
pub mod remap;
pub mod trace;
pub mod txlist;

use serde::{Deserialize, Serialize};

pub use messages::*;
pub use trace::{NullSink, TraceError, TraceSink};
pub use txlist::{TxList, TxSlot, TxState};

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in microseconds since simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// A time that is never reached.
    pub const NEVER: SimTime = SimTime(u64::MAX);

    /// Create from microseconds.
    pub const fn from_micros(us: u64) -> Self {
        SimTime(us)
    }

    /// Get as microseconds.
    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// Whether this is [`SimTime::NEVER`].
    pub fn is_never(&self) -> bool {
        self.0 == u64::MAX
    }

    /// Time `us` microseconds later, saturating at [`SimTime::NEVER`].
    pub fn plus(&self, us: u64) -> SimTime {
        SimTime(self.0.saturating_add(us))
    }

    /// Time `us` microseconds earlier, saturating at zero.
    pub fn minus(&self, us: u64) -> SimTime {
        SimTime(self.0.saturating_sub(us))
    }

    /// Microseconds elapsed since `earlier` (zero if `earlier` is later).
    pub fn since(&self, earlier: SimTime) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::ops::Add<u64> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: u64) -> Self::Output {
        self.plus(rhs)
    }
}

impl std::ops::Sub<u64> for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: u64) -> Self::Output {
        self.minus(rhs)
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_never() {
            write!(f, "NEVER")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// ============================================================================
// Radio Units
// ============================================================================

/// Probability encoded as a fraction of [`PROB_ONE`].
pub type Probability = u32;

/// Probability 1.
pub const PROB_ONE: Probability = u32::MAX;

/// Convert a floating point probability into the fixed encoding.
pub fn prob_from_f64(p: f64) -> Probability {
    if p.is_nan() || p <= 0.0 {
        0
    } else if p >= 1.0 {
        PROB_ONE
    } else {
        (p * PROB_ONE as f64) as Probability
    }
}

/// Transmit power or antenna gain, dBm in signed 8.8 fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Power(pub i16);

impl Power {
    /// Convert from dBm.
    pub fn from_dbm(dbm: f64) -> Self {
        Power((dbm * 256.0).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16)
    }

    /// Convert to dBm.
    pub fn to_dbm(&self) -> f64 {
        self.0 as f64 / 256.0
    }
}

/// Centre frequency as an offset above 2400 MHz, in 8.8 fixed point MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Freq(pub u16);

impl Freq {
    /// Build from an offset in MHz above 2400 MHz.
    pub fn from_mhz_offset(mhz: f64) -> Self {
        Freq((mhz * 256.0).round().clamp(0.0, u16::MAX as f64) as u16)
    }

    /// Offset in MHz above 2400 MHz.
    pub fn mhz_offset(&self) -> f64 {
        self.0 as f64 / 256.0
    }

    /// Absolute frequency in MHz.
    pub fn mhz(&self) -> f64 {
        2400.0 + self.mhz_offset()
    }
}

/// A measured RSSI, dBm in signed 16.16 fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RssiValue(pub i32);

impl RssiValue {
    /// Lowest representable RSSI.
    pub const MIN: RssiValue = RssiValue(i32::MIN);

    /// Convert from dBm.
    pub fn from_dbm(dbm: f64) -> Self {
        RssiValue((dbm * 65536.0).round().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
    }

    /// Convert to dBm.
    pub fn to_dbm(&self) -> f64 {
        self.0 as f64 / 65536.0
    }
}

/// Modulations that only differ in the low nibble are mutually receivable.
pub const MOD_SIMILAR_MASK: u16 = 0xFFF0;

/// Modulation type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Modulation(pub u16);

impl Modulation {
    /// BLE 1 Mbps GFSK.
    pub const BLE1M: Modulation = Modulation(0x10);
    /// BLE 2 Mbps GFSK.
    pub const BLE2M: Modulation = Modulation(0x20);
    /// Proprietary 2 Mbps GFSK.
    pub const PROP2M: Modulation = Modulation(0x21);
    /// Proprietary 3 Mbps GFSK.
    pub const PROP3M: Modulation = Modulation(0x31);
    /// Proprietary 4 Mbps GFSK.
    pub const PROP4M: Modulation = Modulation(0x41);
    /// IEEE 802.15.4 250 kbps O-QPSK DSSS.
    pub const IEEE802154_250K: Modulation = Modulation(0x50);
    /// BLE coded PHY.
    pub const BLE_CODED: Modulation = Modulation(0x60);
    /// Wideband (WLAN-like) interferer.
    pub const WLAN: Modulation = Modulation(0x160);
    /// Unmodulated carrier.
    pub const CW: Modulation = Modulation(0x170);

    /// Whether a receiver tuned to `self` can demodulate `other`.
    pub fn is_similar(&self, other: Modulation) -> bool {
        (self.0 & MOD_SIMILAR_MASK) == (other.0 & MOD_SIMILAR_MASK)
    }
}

/// Convert dBm into linear milliwatts.
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Convert linear milliwatts into dBm.
pub fn mw_to_dbm(mw: f64) -> f64 {
    10.0 * mw.log10()
}

// ============================================================================
// Tests
// ============================================================================
