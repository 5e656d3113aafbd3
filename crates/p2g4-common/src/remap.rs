//! Mapping between v1 and v2 protocol bodies.
//!
//! The engine only ever runs v2 operations. v1 requests are widened on
//! arrival and v2 results narrowed back, so that a v1 device observes
//! exactly what it always did.

use crate::messages::{RxDoneV1, RxDoneV2, RxV1, RxV2, TxV1, TxV2};

/// Widen a v1 transmission: carrier and packet cover the same window.
pub fn tx_v1_to_v2(tx: &TxV1) -> TxV2 {
    TxV2 {
        start_tx_time: tx.start_time,
        end_tx_time: tx.end_time,
        start_packet_time: tx.start_time,
        end_packet_time: tx.end_time,
        abort: tx.abort,
        phy_address: tx.phy_address as u64,
        radio_params: tx.radio_params,
        power_level: tx.power_level,
        packet_size: tx.packet_size,
        coding_rate: 0,
    }
}

/// Widen a v1 reception: one address, no truncation allowance, bit errors
/// paced at the bit rate.
pub fn rx_v1_to_v2(rx: &RxV1) -> RxV2 {
    RxV2 {
        start_time: rx.start_time,
        scan_duration: rx.scan_duration,
        error_calc_rate: rx.bps,
        antenna_gain: rx.antenna_gain,
        pream_and_addr_duration: rx.pream_and_addr_duration,
        header_duration: rx.header_duration,
        acceptable_pre_truncation: 0,
        sync_threshold: rx.sync_threshold,
        header_threshold: rx.header_threshold,
        resp_type: 0,
        prelocked_tx: false,
        coding_rate: 0,
        forced_packet_duration: RxV2::NO_FORCED_DURATION,
        radio_params: rx.radio_params,
        abort: rx.abort,
        addresses: vec![rx.phy_address as u64],
    }
}

/// Narrow a v2 reception outcome for a v1 device.
pub fn rx_done_v2_to_v1(done: &RxDoneV2) -> RxDoneV1 {
    RxDoneV1 {
        end_time: done.end_time,
        rx_time_stamp: done.rx_time_stamp,
        packet_size: done.packet_size,
        status: done.status,
        rssi: done.rssi,
    }
}
