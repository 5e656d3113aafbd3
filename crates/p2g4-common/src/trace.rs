//! Trace sink interface.
//!
//! Completed operations are handed to a [`TraceSink`] as immutable records.
//! Sinks never feed back into the simulation, except that a sink may refuse
//! to continue (e.g. a comparison mismatch in stop-on-diff mode).

use crate::messages::{CcaDone, CcaRequest, RssiDone, RssiRequest, RxDoneV2, RxV2, TxV2};
use crate::SimTime;
use thiserror::Error;

/// Errors raised by a trace sink.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Underlying file I/O failed.
    #[error("Trace I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Compare mode found a difference and was asked to stop on it.
    #[error("Trace mismatch for device {device} in {stream} at line {line}: expected '{expected}', got '{actual}'")]
    Mismatch {
        device: usize,
        stream: &'static str,
        line: usize,
        expected: String,
        actual: String,
    },
}

/// A finished transmission.
#[derive(Debug, Clone, Copy)]
pub struct TxRecord<'a> {
    pub device: usize,
    pub tx: &'a TxV2,
    pub packet: &'a [u8],
}

/// A finished reception.
#[derive(Debug, Clone, Copy)]
pub struct RxRecord<'a> {
    pub device: usize,
    pub rx: &'a RxV2,
    pub done: &'a RxDoneV2,
    /// Transmitter the receiver synchronized to, if any.
    pub tx_nbr: Option<usize>,
    /// Payload, present only when it was delivered to the device.
    pub packet: &'a [u8],
}

/// A finished RSSI measurement.
#[derive(Debug, Clone, Copy)]
pub struct RssiRecord<'a> {
    pub device: usize,
    pub request: &'a RssiRequest,
    pub done: &'a RssiDone,
}

/// A finished CCA search.
#[derive(Debug, Clone, Copy)]
pub struct CcaRecord<'a> {
    pub device: usize,
    pub request: &'a CcaRequest,
    pub done: &'a CcaDone,
}

/// One channel/modem evaluation for a receiver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModemRxRecord {
    pub time: SimTime,
    pub rx_nbr: usize,
    pub tx_nbr: Option<usize>,
    pub ctr: u64,
    pub snr_analog: f64,
    pub snr_isi: f64,
    pub snr_total: f64,
    pub ber: u32,
    pub sync_prob: u32,
    pub rx_power: f64,
}

/// Receiver of trace records.
///
/// All methods default to doing nothing so sinks only implement the
/// streams they care about.
pub trait TraceSink {
    fn tx(&mut self, _rec: &TxRecord<'_>) -> Result<(), TraceError> {
        Ok(())
    }

    fn rx(&mut self, _rec: &RxRecord<'_>) -> Result<(), TraceError> {
        Ok(())
    }

    fn rssi(&mut self, _rec: &RssiRecord<'_>) -> Result<(), TraceError> {
        Ok(())
    }

    fn cca(&mut self, _rec: &CcaRecord<'_>) -> Result<(), TraceError> {
        Ok(())
    }

    fn modem_rx(&mut self, _rec: &ModemRxRecord) -> Result<(), TraceError> {
        Ok(())
    }

    /// Flush and close the sink at the end of a run.
    ///
    /// Returns the number of differences found by a comparing sink.
    fn close(&mut self) -> Result<u64, TraceError> {
        Ok(0)
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TraceSink for NullSink {}
