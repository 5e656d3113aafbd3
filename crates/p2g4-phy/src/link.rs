//! Boundary towards the device processes.
//!
//! The engine talks to every device through a [`DeviceLink`]: it blocks on
//! [`DeviceLink::recv`] for the device's next message and answers with
//! [`DeviceLink::send`]. How bytes travel is up to the implementation.

use p2g4_common::{
    AbortParams, CcaDone, CcaRequest, RssiDone, RssiRequest, RxDoneV1, RxDoneV2, RxV1, RxV2, TxDone, TxV1, TxV2,
    WaitRequest,
};
use thiserror::Error;

/// Transport level failures.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device {0} is not connected")]
    NotConnected(usize),

    #[error("Malformed message from device {device}: {reason}")]
    Malformed { device: usize, reason: String },
}

/// Message from a device.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Wait(WaitRequest),
    TxV1(TxV1, Vec<u8>),
    TxV2(TxV2, Vec<u8>),
    RxV1(RxV1),
    RxV2(RxV2),
    Rssi(RssiRequest),
    Cca(CcaRequest),
    Disconnect,
    Terminate,
    /// Continue a v1 reception after the address was found.
    RxCont,
    /// Continue a v2 reception, optionally with new abort parameters.
    RxV2Cont(Option<AbortParams>),
    /// Stop a reception after the address was found.
    RxStop,
    /// New abort parameters, answering [`Response::AbortReeval`].
    AbortUpdate(AbortParams),
    /// RSSI wanted right now, in the middle of an abort re-evaluation.
    ImmediateRssi(RssiRequest),
}

impl Request {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Wait(_) => "WAIT",
            Request::TxV1(..) => "TX",
            Request::TxV2(..) => "TXV2",
            Request::RxV1(_) => "RX",
            Request::RxV2(_) => "RXV2",
            Request::Rssi(_) => "RSSI",
            Request::Cca(_) => "CCA",
            Request::Disconnect => "DISCONNECT",
            Request::Terminate => "TERMINATE",
            Request::RxCont => "RXCONT",
            Request::RxV2Cont(_) => "RXV2CONT",
            Request::RxStop => "RXSTOP",
            Request::AbortUpdate(_) => "ABORT_UPDATE",
            Request::ImmediateRssi(_) => "IMMRSSI",
        }
    }
}

/// Message to a device.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    WaitDone,
    TxDone(TxDone),
    RxAddressFoundV1(RxDoneV1, Vec<u8>),
    RxAddressFoundV2(RxDoneV2, Vec<u8>),
    RxDoneV1(RxDoneV1),
    RxDoneV2(RxDoneV2),
    RssiDone(RssiDone),
    CcaDone(CcaDone),
    /// Ask the device for new abort parameters.
    AbortReeval,
    ImmediateRssiDone(RssiDone),
}

/// Connection to all device processes.
pub trait DeviceLink {
    /// Block until `device` sends its next message.
    fn recv(&mut self, device: usize) -> Result<Request, LinkError>;

    /// Send a message to `device`.
    fn send(&mut self, device: usize, response: Response) -> Result<(), LinkError>;

    /// Close the connection with `device`. Further sends are dropped.
    fn disconnect(&mut self, device: usize);

    /// Close every connection, asking devices to terminate.
    fn terminate_all(&mut self);
}
