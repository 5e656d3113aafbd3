//! Binary codec of the device protocol.
//!
//! Every message is a little-endian `u32` code followed by a fixed
//! little-endian body. Transmissions carry their payload after the body
//! (`packet_size` bytes), v2 receptions their address list (a `u16` count
//! followed by `u64` addresses) and address-found answers the received
//! payload (a `u16` length followed by the bytes).
//!
//! Decoding works on a growing buffer: an incomplete message yields
//! `Ok(None)` and leaves the buffer untouched.

use bytes::{Buf, BufMut, BytesMut};
use p2g4_common::{
    AbortParams, CcaDone, CcaRequest, Freq, Modulation, Power, RadioParams, RssiDone, RssiRequest, RssiValue, RxDoneV1,
    RxDoneV2, RxStatus, RxV1, RxV2, SimTime, TxDone, TxV1, TxV2, WaitRequest,
};
use p2g4_phy::{Request, Response};
use thiserror::Error;

// ============================================================================
// Message Codes
// ============================================================================

pub const MSG_WAIT: u32 = 0x01;
pub const MSG_TX: u32 = 0x02;
pub const MSG_RSSI: u32 = 0x03;
pub const MSG_RX: u32 = 0x04;
pub const MSG_RX_CONT: u32 = 0x05;
pub const MSG_RX_STOP: u32 = 0x06;
pub const MSG_ABORT_UPDATE: u32 = 0x07;
pub const MSG_IMMEDIATE_RSSI: u32 = 0x08;
pub const MSG_TX_V2: u32 = 0x12;
pub const MSG_RX_V2: u32 = 0x14;
pub const MSG_RX_V2_CONT: u32 = 0x15;
pub const MSG_CCA: u32 = 0x16;
pub const MSG_TERMINATE: u32 = 0xFFFE;
pub const MSG_DISCONNECT: u32 = 0xFFFF;

pub const MSG_WAIT_DONE: u32 = 0x81;
pub const MSG_TX_DONE: u32 = 0x100;
pub const MSG_RSSI_DONE: u32 = 0x101;
pub const MSG_RX_ADDRESS_FOUND: u32 = 0x102;
pub const MSG_RX_DONE: u32 = 0x103;
pub const MSG_ABORT_REEVAL: u32 = 0x104;
pub const MSG_IMMEDIATE_RSSI_DONE: u32 = 0x105;
pub const MSG_RX_V2_ADDRESS_FOUND: u32 = 0x106;
pub const MSG_RX_V2_DONE: u32 = 0x107;
pub const MSG_CCA_DONE: u32 = 0x108;

/// Errors raised while decoding a message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unknown message code 0x{0:X}")]
    UnknownCode(u32),

    #[error("Invalid {field}: {value}")]
    InvalidField { field: &'static str, value: u64 },

    /// Internal marker for a message that is not complete yet.
    #[error("Truncated message")]
    Truncated,
}

// ============================================================================
// Primitive Readers/Writers
// ============================================================================

fn need(src: &[u8], n: usize) -> Result<(), CodecError> {
    if src.len() < n {
        Err(CodecError::Truncated)
    } else {
        Ok(())
    }
}

fn get_u8(src: &mut &[u8]) -> Result<u8, CodecError> {
    need(src, 1)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut &[u8]) -> Result<u16, CodecError> {
    need(src, 2)?;
    Ok(src.get_u16_le())
}

fn get_i16(src: &mut &[u8]) -> Result<i16, CodecError> {
    need(src, 2)?;
    Ok(src.get_i16_le())
}

fn get_u32(src: &mut &[u8]) -> Result<u32, CodecError> {
    need(src, 4)?;
    Ok(src.get_u32_le())
}

fn get_i32(src: &mut &[u8]) -> Result<i32, CodecError> {
    need(src, 4)?;
    Ok(src.get_i32_le())
}

fn get_u64(src: &mut &[u8]) -> Result<u64, CodecError> {
    need(src, 8)?;
    Ok(src.get_u64_le())
}

fn get_time(src: &mut &[u8]) -> Result<SimTime, CodecError> {
    get_u64(src).map(SimTime::from_micros)
}

fn get_bool(src: &mut &[u8], field: &'static str) -> Result<bool, CodecError> {
    match get_u8(src)? {
        0 => Ok(false),
        1 => Ok(true),
        v => Err(CodecError::InvalidField { field, value: v as u64 }),
    }
}

fn get_bytes(src: &mut &[u8], n: usize) -> Result<Vec<u8>, CodecError> {
    need(src, n)?;
    let out = src[..n].to_vec();
    src.advance(n);
    Ok(out)
}

fn get_abort(src: &mut &[u8]) -> Result<AbortParams, CodecError> {
    Ok(AbortParams {
        abort_time: get_time(src)?,
        recheck_time: get_time(src)?,
    })
}

fn put_abort(dst: &mut BytesMut, abort: &AbortParams) {
    dst.put_u64_le(abort.abort_time.as_micros());
    dst.put_u64_le(abort.recheck_time.as_micros());
}

fn get_radio(src: &mut &[u8]) -> Result<RadioParams, CodecError> {
    Ok(RadioParams {
        modulation: Modulation(get_u16(src)?),
        center_freq: Freq(get_u16(src)?),
    })
}

fn put_radio(dst: &mut BytesMut, radio: &RadioParams) {
    dst.put_u16_le(radio.modulation.0);
    dst.put_u16_le(radio.center_freq.0);
}

fn get_rssi_request(src: &mut &[u8]) -> Result<RssiRequest, CodecError> {
    Ok(RssiRequest {
        meas_time: get_time(src)?,
        radio_params: get_radio(src)?,
        antenna_gain: Power(get_i16(src)?),
    })
}

fn put_rssi_request(dst: &mut BytesMut, req: &RssiRequest) {
    dst.put_u64_le(req.meas_time.as_micros());
    put_radio(dst, &req.radio_params);
    dst.put_i16_le(req.antenna_gain.0);
}

fn get_status(src: &mut &[u8]) -> Result<RxStatus, CodecError> {
    let v = get_u8(src)?;
    RxStatus::from_u8(v).ok_or(CodecError::InvalidField {
        field: "rx status",
        value: v as u64,
    })
}

fn get_rx_done_v1(src: &mut &[u8]) -> Result<RxDoneV1, CodecError> {
    Ok(RxDoneV1 {
        end_time: get_time(src)?,
        rx_time_stamp: get_time(src)?,
        packet_size: get_u16(src)?,
        status: get_status(src)?,
        rssi: RssiValue(get_i32(src)?),
    })
}

fn put_rx_done_v1(dst: &mut BytesMut, done: &RxDoneV1) {
    dst.put_u64_le(done.end_time.as_micros());
    dst.put_u64_le(done.rx_time_stamp.as_micros());
    dst.put_u16_le(done.packet_size);
    dst.put_u8(done.status as u8);
    dst.put_i32_le(done.rssi.0);
}

fn get_rx_done_v2(src: &mut &[u8]) -> Result<RxDoneV2, CodecError> {
    Ok(RxDoneV2 {
        end_time: get_time(src)?,
        rx_time_stamp: get_time(src)?,
        packet_size: get_u16(src)?,
        status: get_status(src)?,
        rssi: RssiValue(get_i32(src)?),
        phy_address: get_u64(src)?,
        coding_rate: get_u16(src)?,
    })
}

fn put_rx_done_v2(dst: &mut BytesMut, done: &RxDoneV2) {
    dst.put_u64_le(done.end_time.as_micros());
    dst.put_u64_le(done.rx_time_stamp.as_micros());
    dst.put_u16_le(done.packet_size);
    dst.put_u8(done.status as u8);
    dst.put_i32_le(done.rssi.0);
    dst.put_u64_le(done.phy_address);
    dst.put_u16_le(done.coding_rate);
}

fn get_payload(src: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = get_u16(src)? as usize;
    get_bytes(src, len)
}

fn put_payload(dst: &mut BytesMut, payload: &[u8]) {
    let len = payload.len().min(u16::MAX as usize);
    dst.put_u16_le(len as u16);
    dst.put_slice(&payload[..len]);
}

/// Run `parse` over the buffered bytes; consume them only once a whole
/// message was decoded.
fn decode_with<T>(
    src: &mut BytesMut,
    parse: impl FnOnce(&mut &[u8]) -> Result<T, CodecError>,
) -> Result<Option<T>, CodecError> {
    let mut cursor: &[u8] = &src[..];
    match parse(&mut cursor) {
        Ok(msg) => {
            let consumed = src.len() - cursor.len();
            src.advance(consumed);
            Ok(Some(msg))
        }
        Err(CodecError::Truncated) => Ok(None),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Append `req` to `dst`.
pub fn encode_request(req: &Request, dst: &mut BytesMut) {
    match req {
        Request::Wait(w) => {
            dst.put_u32_le(MSG_WAIT);
            dst.put_u64_le(w.end.as_micros());
        }
        Request::TxV1(tx, packet) => {
            dst.put_u32_le(MSG_TX);
            dst.put_u64_le(tx.start_time.as_micros());
            dst.put_u64_le(tx.end_time.as_micros());
            put_abort(dst, &tx.abort);
            dst.put_u32_le(tx.phy_address);
            put_radio(dst, &tx.radio_params);
            dst.put_i16_le(tx.power_level.0);
            dst.put_u16_le(tx.packet_size);
            dst.put_slice(packet);
        }
        Request::TxV2(tx, packet) => {
            dst.put_u32_le(MSG_TX_V2);
            dst.put_u64_le(tx.start_tx_time.as_micros());
            dst.put_u64_le(tx.end_tx_time.as_micros());
            dst.put_u64_le(tx.start_packet_time.as_micros());
            dst.put_u64_le(tx.end_packet_time.as_micros());
            put_abort(dst, &tx.abort);
            dst.put_u64_le(tx.phy_address);
            put_radio(dst, &tx.radio_params);
            dst.put_i16_le(tx.power_level.0);
            dst.put_u16_le(tx.packet_size);
            dst.put_u16_le(tx.coding_rate);
            dst.put_slice(packet);
        }
        Request::RxV1(rx) => {
            dst.put_u32_le(MSG_RX);
            dst.put_u64_le(rx.start_time.as_micros());
            dst.put_u32_le(rx.scan_duration);
            dst.put_u32_le(rx.phy_address);
            put_radio(dst, &rx.radio_params);
            dst.put_i16_le(rx.antenna_gain.0);
            dst.put_u16_le(rx.sync_threshold);
            dst.put_u16_le(rx.header_threshold);
            dst.put_u16_le(rx.pream_and_addr_duration);
            dst.put_u16_le(rx.header_duration);
            dst.put_u32_le(rx.bps);
            put_abort(dst, &rx.abort);
        }
        Request::RxV2(rx) => {
            dst.put_u32_le(MSG_RX_V2);
            dst.put_u64_le(rx.start_time.as_micros());
            dst.put_u32_le(rx.scan_duration);
            dst.put_u32_le(rx.error_calc_rate);
            dst.put_i16_le(rx.antenna_gain.0);
            dst.put_u16_le(rx.pream_and_addr_duration);
            dst.put_u16_le(rx.header_duration);
            dst.put_u16_le(rx.acceptable_pre_truncation);
            dst.put_u16_le(rx.sync_threshold);
            dst.put_u16_le(rx.header_threshold);
            dst.put_u8(rx.resp_type);
            dst.put_u8(rx.prelocked_tx as u8);
            dst.put_u16_le(rx.coding_rate);
            dst.put_u32_le(rx.forced_packet_duration);
            put_radio(dst, &rx.radio_params);
            put_abort(dst, &rx.abort);
            let n = rx.addresses.len().min(u16::MAX as usize);
            dst.put_u16_le(n as u16);
            for address in &rx.addresses[..n] {
                dst.put_u64_le(*address);
            }
        }
        Request::Rssi(req) => {
            dst.put_u32_le(MSG_RSSI);
            put_rssi_request(dst, req);
        }
        Request::Cca(req) => {
            dst.put_u32_le(MSG_CCA);
            dst.put_u64_le(req.start_time.as_micros());
            dst.put_u32_le(req.scan_duration);
            dst.put_u32_le(req.scan_period);
            dst.put_i32_le(req.rssi_threshold.0);
            dst.put_i32_le(req.mod_threshold.0);
            dst.put_u8(req.stop_when_found);
            dst.put_i16_le(req.antenna_gain.0);
            put_radio(dst, &req.radio_params);
            put_abort(dst, &req.abort);
        }
        Request::Disconnect => dst.put_u32_le(MSG_DISCONNECT),
        Request::Terminate => dst.put_u32_le(MSG_TERMINATE),
        Request::RxCont => dst.put_u32_le(MSG_RX_CONT),
        Request::RxV2Cont(abort) => {
            dst.put_u32_le(MSG_RX_V2_CONT);
            dst.put_u8(abort.is_some() as u8);
            put_abort(dst, &abort.unwrap_or_default());
        }
        Request::RxStop => dst.put_u32_le(MSG_RX_STOP),
        Request::AbortUpdate(abort) => {
            dst.put_u32_le(MSG_ABORT_UPDATE);
            put_abort(dst, abort);
        }
        Request::ImmediateRssi(req) => {
            dst.put_u32_le(MSG_IMMEDIATE_RSSI);
            put_rssi_request(dst, req);
        }
    }
}

fn parse_request(src: &mut &[u8]) -> Result<Request, CodecError> {
    let code = get_u32(src)?;
    let req = match code {
        MSG_WAIT => Request::Wait(WaitRequest { end: get_time(src)? }),
        MSG_TX => {
            let tx = TxV1 {
                start_time: get_time(src)?,
                end_time: get_time(src)?,
                abort: get_abort(src)?,
                phy_address: get_u32(src)?,
                radio_params: get_radio(src)?,
                power_level: Power(get_i16(src)?),
                packet_size: get_u16(src)?,
            };
            let packet = get_bytes(src, tx.packet_size as usize)?;
            Request::TxV1(tx, packet)
        }
        MSG_TX_V2 => {
            let tx = TxV2 {
                start_tx_time: get_time(src)?,
                end_tx_time: get_time(src)?,
                start_packet_time: get_time(src)?,
                end_packet_time: get_time(src)?,
                abort: get_abort(src)?,
                phy_address: get_u64(src)?,
                radio_params: get_radio(src)?,
                power_level: Power(get_i16(src)?),
                packet_size: get_u16(src)?,
                coding_rate: get_u16(src)?,
            };
            let packet = get_bytes(src, tx.packet_size as usize)?;
            Request::TxV2(tx, packet)
        }
        MSG_RX => Request::RxV1(RxV1 {
            start_time: get_time(src)?,
            scan_duration: get_u32(src)?,
            phy_address: get_u32(src)?,
            radio_params: get_radio(src)?,
            antenna_gain: Power(get_i16(src)?),
            sync_threshold: get_u16(src)?,
            header_threshold: get_u16(src)?,
            pream_and_addr_duration: get_u16(src)?,
            header_duration: get_u16(src)?,
            bps: get_u32(src)?,
            abort: get_abort(src)?,
        }),
        MSG_RX_V2 => {
            let mut rx = RxV2 {
                start_time: get_time(src)?,
                scan_duration: get_u32(src)?,
                error_calc_rate: get_u32(src)?,
                antenna_gain: Power(get_i16(src)?),
                pream_and_addr_duration: get_u16(src)?,
                header_duration: get_u16(src)?,
                acceptable_pre_truncation: get_u16(src)?,
                sync_threshold: get_u16(src)?,
                header_threshold: get_u16(src)?,
                resp_type: get_u8(src)?,
                prelocked_tx: get_bool(src, "prelocked_tx")?,
                coding_rate: get_u16(src)?,
                forced_packet_duration: get_u32(src)?,
                radio_params: get_radio(src)?,
                abort: get_abort(src)?,
                addresses: Vec::new(),
            };
            let n = get_u16(src)? as usize;
            need(src, n * 8)?;
            rx.addresses = (0..n).map(|_| src.get_u64_le()).collect();
            Request::RxV2(rx)
        }
        MSG_RSSI => Request::Rssi(get_rssi_request(src)?),
        MSG_CCA => Request::Cca(CcaRequest {
            start_time: get_time(src)?,
            scan_duration: get_u32(src)?,
            scan_period: get_u32(src)?,
            rssi_threshold: RssiValue(get_i32(src)?),
            mod_threshold: RssiValue(get_i32(src)?),
            stop_when_found: get_u8(src)?,
            antenna_gain: Power(get_i16(src)?),
            radio_params: get_radio(src)?,
            abort: get_abort(src)?,
        }),
        MSG_DISCONNECT => Request::Disconnect,
        MSG_TERMINATE => Request::Terminate,
        MSG_RX_CONT => Request::RxCont,
        MSG_RX_V2_CONT => {
            let present = get_bool(src, "abort flag")?;
            let abort = get_abort(src)?;
            Request::RxV2Cont(present.then_some(abort))
        }
        MSG_RX_STOP => Request::RxStop,
        MSG_ABORT_UPDATE => Request::AbortUpdate(get_abort(src)?),
        MSG_IMMEDIATE_RSSI => Request::ImmediateRssi(get_rssi_request(src)?),
        other => return Err(CodecError::UnknownCode(other)),
    };
    Ok(req)
}

/// Take one complete request off the front of `src`, if there is one.
pub fn decode_request(src: &mut BytesMut) -> Result<Option<Request>, CodecError> {
    decode_with(src, parse_request)
}

// ============================================================================
// Responses
// ============================================================================

/// Append `resp` to `dst`.
pub fn encode_response(resp: &Response, dst: &mut BytesMut) {
    match resp {
        Response::WaitDone => dst.put_u32_le(MSG_WAIT_DONE),
        Response::TxDone(done) => {
            dst.put_u32_le(MSG_TX_DONE);
            dst.put_u64_le(done.end_time.as_micros());
        }
        Response::RxAddressFoundV1(done, payload) => {
            dst.put_u32_le(MSG_RX_ADDRESS_FOUND);
            put_rx_done_v1(dst, done);
            put_payload(dst, payload);
        }
        Response::RxAddressFoundV2(done, payload) => {
            dst.put_u32_le(MSG_RX_V2_ADDRESS_FOUND);
            put_rx_done_v2(dst, done);
            put_payload(dst, payload);
        }
        Response::RxDoneV1(done) => {
            dst.put_u32_le(MSG_RX_DONE);
            put_rx_done_v1(dst, done);
        }
        Response::RxDoneV2(done) => {
            dst.put_u32_le(MSG_RX_V2_DONE);
            put_rx_done_v2(dst, done);
        }
        Response::RssiDone(done) => {
            dst.put_u32_le(MSG_RSSI_DONE);
            dst.put_i32_le(done.rssi.0);
        }
        Response::CcaDone(done) => {
            dst.put_u32_le(MSG_CCA_DONE);
            dst.put_u64_le(done.end_time.as_micros());
            dst.put_i32_le(done.rssi_ave.0);
            dst.put_i32_le(done.rssi_max.0);
            dst.put_i32_le(done.mod_rx_power.0);
            dst.put_u8(done.mod_found as u8);
            dst.put_u8(done.rssi_overthreshold as u8);
        }
        Response::AbortReeval => dst.put_u32_le(MSG_ABORT_REEVAL),
        Response::ImmediateRssiDone(done) => {
            dst.put_u32_le(MSG_IMMEDIATE_RSSI_DONE);
            dst.put_i32_le(done.rssi.0);
        }
    }
}

fn parse_response(src: &mut &[u8]) -> Result<Response, CodecError> {
    let code = get_u32(src)?;
    let resp = match code {
        MSG_WAIT_DONE => Response::WaitDone,
        MSG_TX_DONE => Response::TxDone(TxDone { end_time: get_time(src)? }),
        MSG_RX_ADDRESS_FOUND => {
            let done = get_rx_done_v1(src)?;
            Response::RxAddressFoundV1(done, get_payload(src)?)
        }
        MSG_RX_V2_ADDRESS_FOUND => {
            let done = get_rx_done_v2(src)?;
            Response::RxAddressFoundV2(done, get_payload(src)?)
        }
        MSG_RX_DONE => Response::RxDoneV1(get_rx_done_v1(src)?),
        MSG_RX_V2_DONE => Response::RxDoneV2(get_rx_done_v2(src)?),
        MSG_RSSI_DONE => Response::RssiDone(RssiDone {
            rssi: RssiValue(get_i32(src)?),
        }),
        MSG_CCA_DONE => Response::CcaDone(CcaDone {
            end_time: get_time(src)?,
            rssi_ave: RssiValue(get_i32(src)?),
            rssi_max: RssiValue(get_i32(src)?),
            mod_rx_power: RssiValue(get_i32(src)?),
            mod_found: get_bool(src, "mod_found")?,
            rssi_overthreshold: get_bool(src, "rssi_overthreshold")?,
        }),
        MSG_ABORT_REEVAL => Response::AbortReeval,
        MSG_IMMEDIATE_RSSI_DONE => Response::ImmediateRssiDone(RssiDone {
            rssi: RssiValue(get_i32(src)?),
        }),
        other => return Err(CodecError::UnknownCode(other)),
    };
    Ok(resp)
}

/// Take one complete response off the front of `src`, if there is one.
pub fn decode_response(src: &mut BytesMut) -> Result<Option<Response>, CodecError> {
    decode_with(src, parse_response)
}
