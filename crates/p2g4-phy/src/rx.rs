//! Receive state machine.
//!
//! searching -> found -> syncing -> header -> payload -> done.
//!
//! While searching, a receiver waits for a transmitter whose packet fits
//! (address, frequency, modulation, truncation budget). Once found, sync is
//! decided by the modem and bit errors are accumulated through the
//! preamble/address, the header and the payload at the receiver's error
//! calculation cadence.

use crate::link::{DeviceLink, Request, Response};
use crate::phy::DeviceOp;
use crate::queue::EventKind;
use crate::{Phy, PhyError};
use p2g4_common::remap::rx_done_v2_to_v1;
use p2g4_common::trace::RxRecord;
use p2g4_common::{AbortParams, ProtoVersion, RxDoneV2, RxStatus as RxOutcome, RxV2, SimTime};
use p2g4_models::facade::RxTuning;
use tracing::{debug, trace, warn};

/// Whether a receiver is looking for a transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxState {
    #[default]
    NotSearching,
    Searching,
}

/// Bit error accounting pace derived from the error calculation rate.
///
/// Rates that are a multiple of 1 Mbps produce several errors samples every
/// microsecond; rates dividing 1 MHz produce one sample every few
/// microseconds.
pub fn error_cadence(rate: u32) -> Option<(u32, u64)> {
    if rate == 0 {
        None
    } else if rate % 1_000_000 == 0 {
        Some((rate / 1_000_000, 1))
    } else if 1_000_000 % rate == 0 {
        Some((1, (1_000_000 / rate) as u64))
    } else {
        None
    }
}

/// One device's reception.
#[derive(Debug, Clone, Default)]
pub struct RxStatus {
    pub req: RxV2,
    pub version: ProtoVersion,
    pub state: RxState,
    /// Transmitter the receiver is locked onto.
    pub tx_nbr: Option<usize>,
    /// Last microsecond in which sync may start.
    pub scan_end: SimTime,
    pub sync_start: SimTime,
    pub sync_end: SimTime,
    pub header_end: SimTime,
    pub payload_end: SimTime,
    pub biterrors: u32,
    pub errors_per_call: u32,
    pub us_per_call: u64,
    /// Time of the last bit error evaluation of the current lock.
    pub last_eval: Option<SimTime>,
    /// Microseconds evaluated but not yet worth a whole sampling step.
    pub pending_us: u64,
    pub done: RxDoneV2,
}

impl RxStatus {
    fn tuning(&self) -> RxTuning {
        RxTuning {
            radio: self.req.radio_params,
            antenna_gain: self.req.antenna_gain,
        }
    }

    /// Next evaluation time within a phase ending at `end`.
    ///
    /// The abort and recheck times cut a sampling step short.
    fn next_eval(&self, now: SimTime, end: SimTime) -> SimTime {
        (now + self.us_per_call)
            .min(end)
            .min(self.req.abort.abort_time)
            .min(self.req.abort.recheck_time)
            .max(now + 1)
    }

    /// Whole sampling steps covered by an evaluation at `now`.
    ///
    /// The first evaluation of a lock counts as one step. A step cut short
    /// is carried over to the next evaluation.
    fn take_steps(&mut self, now: SimTime) -> u32 {
        let elapsed = match self.last_eval {
            Some(last) => now.since(last),
            None => self.us_per_call,
        };
        self.last_eval = Some(now);
        let us = self.pending_us + elapsed;
        let per_call = self.us_per_call.max(1);
        self.pending_us = us % per_call;
        u32::try_from(us / per_call).unwrap_or(u32::MAX)
    }
}

impl<L: DeviceLink> Phy<L> {
    pub(crate) fn prepare_rx(&mut self, d: usize, req: RxV2, version: ProtoVersion) -> Result<(), PhyError> {
        self.past_check(d, req.start_time, "Rx")?;
        self.check_new_abort(d, &req.abort, req.start_time, "Rx")?;
        if req.addresses.is_empty() {
            return Err(self.protocol(d, "Rx without any address"));
        }
        if req.prelocked_tx {
            return Err(self.protocol(d, "prelocked Rx is not supported"));
        }
        let Some((errors_per_call, us_per_call)) = error_cadence(req.error_calc_rate) else {
            return Err(self.protocol(
                d,
                format!(
                    "Rx error calculation rate of {} bps neither a multiple nor a divisor of 1 MHz",
                    req.error_calc_rate
                ),
            ));
        };

        let mut scan_end = req.start_time + (req.scan_duration.max(1) as u64 - 1);
        if req.abort.abort_time < scan_end {
            scan_end = req.abort.abort_time - 1;
        }

        trace!(
            "@{} device {} wants to Rx at {} until {} (abort {}, recheck {})",
            self.now,
            d,
            req.start_time,
            scan_end,
            req.abort.abort_time,
            req.abort.recheck_time
        );

        let start = req.start_time;
        self.rx[d] = RxStatus {
            req,
            version,
            scan_end,
            errors_per_call,
            us_per_call,
            ..Default::default()
        };
        self.chm.new_rx_context(d);
        self.ops[d] = DeviceOp::Rx(version);
        self.stats.rx += 1;
        self.schedule(start, EventKind::SearchStart, d)
    }

    fn rx_apply_abort(&mut self, d: usize, abort: AbortParams) {
        let rx = &mut self.rx[d];
        rx.req.abort = abort;
        if abort.abort_time < rx.scan_end {
            rx.scan_end = abort.abort_time - 1;
        }
    }

    /// Refresh the abort parameters if the recheck time came. Returns
    /// whether the reception goes on.
    fn rx_recheck_abort(&mut self, d: usize) -> Result<bool, PhyError> {
        if self.now < self.rx[d].req.abort.recheck_time {
            return Ok(true);
        }
        match self.reevaluate_abort(d, "Rx")? {
            Some(abort) => {
                self.rx_apply_abort(d, abort);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn rx_measure_rssi(&mut self, d: usize) -> Result<(), PhyError> {
        let tuning = self.rx[d].tuning();
        let rssi = self.chm.rssi(&self.txl, d, &tuning, self.now, self.sink.as_mut())?;
        self.rx[d].done.rssi = rssi;
        Ok(())
    }

    fn rx_back_to_search(&mut self, d: usize, at: SimTime) -> Result<(), PhyError> {
        let rx = &mut self.rx[d];
        rx.state = RxState::Searching;
        rx.tx_nbr = None;
        rx.biterrors = 0;
        rx.last_eval = None;
        rx.pending_us = 0;
        self.schedule(at, EventKind::SearchStart, d)
    }

    fn rx_enqueue_search_reeval(&mut self, d: usize) -> Result<(), PhyError> {
        let rx = &mut self.rx[d];
        rx.state = RxState::Searching;
        let at = (rx.scan_end + 1).min(rx.req.abort.recheck_time).max(self.now);
        self.schedule(at, EventKind::RxSearchReeval, d)
    }

    /// Dump, answer and move on to the device's next request.
    fn rx_finish(&mut self, d: usize, deliver_packet: bool) -> Result<(), PhyError> {
        self.queue.remove(d);
        let rx = &mut self.rx[d];
        rx.state = RxState::NotSearching;
        rx.done.end_time = self.now;

        match rx.done.status {
            RxOutcome::Ok => self.stats.rx_ok += 1,
            RxOutcome::PacketContentError => self.stats.rx_crc_error += 1,
            RxOutcome::HeaderError => self.stats.rx_header_error += 1,
            RxOutcome::NoSync => self.stats.rx_nosync += 1,
            RxOutcome::InProgress => self.stats.rx_stopped += 1,
        }

        let rx = &self.rx[d];
        let packet = match (deliver_packet, rx.tx_nbr) {
            (true, Some(tx)) => self.txl.slot(tx).packet.as_slice(),
            _ => &[][..],
        };
        self.sink.rx(&RxRecord {
            device: d,
            rx: &rx.req,
            done: &rx.done,
            tx_nbr: rx.tx_nbr,
            packet,
        })?;
        debug!(
            "@{} device {} Rx done: {} ({} bit errors)",
            self.now,
            d,
            rx.done.status.as_str(),
            rx.biterrors
        );

        // A stopped reception already got its last answer with the address.
        if rx.done.status != RxOutcome::InProgress {
            let response = match rx.version {
                ProtoVersion::V1 => Response::RxDoneV1(rx_done_v2_to_v1(&rx.done)),
                ProtoVersion::V2 => Response::RxDoneV2(rx.done),
            };
            if !self.respond(d, response) {
                return Ok(());
            }
        }
        self.handle_next_request(d)
    }

    fn rx_finish_nosync(&mut self, d: usize) -> Result<(), PhyError> {
        let rx = &mut self.rx[d];
        rx.done.packet_size = 0;
        rx.done.rx_time_stamp = self.now;
        rx.done.status = RxOutcome::NoSync;
        rx.done.phy_address = 0;
        let aborting = rx.req.abort.abort_time == self.now;
        if !aborting {
            self.rx_measure_rssi(d)?;
        }
        self.rx[d].tx_nbr = None;
        self.rx_finish(d, false)
    }

    fn rx_tx_nbr(&self, d: usize) -> Result<usize, PhyError> {
        self.rx[d]
            .tx_nbr
            .ok_or_else(|| self.internal(format!("receiver {} has no transmitter", d)))
    }

    /// Accumulate the bit errors of the sampling steps elapsed since the last
    /// evaluation. The modem decides while the packet is on air; a vanished
    /// packet costs every sample.
    fn rx_accumulate_errors(&mut self, d: usize, tx: usize) -> Result<(), PhyError> {
        let now = self.now;
        let rx = &mut self.rx[d];
        let samples = rx.take_steps(now).saturating_mul(rx.errors_per_call);
        if samples == 0 {
            return Ok(());
        }
        let errors = if self.txl.is_packet_ongoing(tx) {
            let tuning = self.rx[d].tuning();
            self.chm
                .bit_errors(&self.txl, tx, d, &tuning, now, samples, self.sink.as_mut())?
        } else {
            samples
        };
        let rx = &mut self.rx[d];
        rx.biterrors = rx.biterrors.saturating_add(errors);
        Ok(())
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    pub(crate) fn rx_search_start(&mut self, d: usize) -> Result<(), PhyError> {
        let rx = &mut self.rx[d];
        rx.state = RxState::Searching;
        rx.tx_nbr = None;
        if self.now <= rx.scan_end {
            if let Some(tx) = self.txl.find_fitting_tx(&rx.req, self.now) {
                trace!("@{} receiver {} found ongoing packet of device {}", self.now, d, tx);
                rx.tx_nbr = Some(tx);
                rx.state = RxState::NotSearching;
                return self.schedule(self.now, EventKind::RxFound, d);
            }
        }
        self.rx_enqueue_search_reeval(d)
    }

    pub(crate) fn on_rx_search_reeval(&mut self, d: usize) -> Result<(), PhyError> {
        if !self.rx_recheck_abort(d)? {
            return Ok(());
        }
        if self.now > self.rx[d].scan_end {
            trace!("@{} receiver {} scan over without sync", self.now, d);
            return self.rx_finish_nosync(d);
        }
        self.rx_enqueue_search_reeval(d)
    }

    pub(crate) fn on_rx_found(&mut self, d: usize) -> Result<(), PhyError> {
        let tx = self.rx_tx_nbr(d)?;
        let tuning = self.rx[d].tuning();
        let synched = self
            .chm
            .is_packet_synched(&self.txl, tx, d, &tuning, self.now, self.sink.as_mut())?;
        if !synched {
            trace!("@{} receiver {} failed to sync to device {}", self.now, d, tx);
            return self.rx_back_to_search(d, self.now + 1);
        }

        let ptx = self.txl.slot(tx).tx;
        let now = self.now;
        let rx = &mut self.rx[d];
        let packet_start = ptx.start_packet_time;
        rx.sync_start = packet_start + rx.req.acceptable_pre_truncation as u64;
        rx.sync_end = packet_start + (rx.req.pream_and_addr_duration as u64).saturating_sub(1);
        rx.header_end = rx.sync_end + rx.req.header_duration as u64;
        rx.payload_end = if rx.req.forced_packet_duration == RxV2::NO_FORCED_DURATION {
            ptx.end_packet_time
        } else {
            rx.header_end + rx.req.forced_packet_duration as u64
        };
        rx.biterrors = 0;
        rx.last_eval = None;
        rx.pending_us = 0;
        rx.done.phy_address = ptx.phy_address;
        rx.done.coding_rate = ptx.coding_rate;

        let at = rx.sync_start.max(now).min(rx.sync_end.max(now));
        trace!(
            "@{} receiver {} synching to device {} (sync end {}, header end {}, payload end {})",
            now,
            d,
            tx,
            rx.sync_end,
            rx.header_end,
            rx.payload_end
        );
        self.schedule(at, EventKind::RxSync, d)
    }

    pub(crate) fn on_rx_sync(&mut self, d: usize) -> Result<(), PhyError> {
        if !self.rx_recheck_abort(d)? {
            return Ok(());
        }
        if self.now >= self.rx[d].req.abort.abort_time {
            return self.rx_finish_nosync(d);
        }

        let tx = self.rx_tx_nbr(d)?;
        if !self.txl.is_packet_ongoing(tx) {
            // Sync is lost whenever the packet goes away, even at the very
            // end of the address.
            trace!("@{} receiver {} lost device {} during sync", self.now, d, tx);
            return self.rx_back_to_search(d, self.now + 1);
        }

        self.rx_accumulate_errors(d, tx)?;
        let rx = &self.rx[d];
        if rx.biterrors >= rx.req.sync_threshold as u32 {
            trace!("@{} receiver {} sync failed with {} bit errors", self.now, d, rx.biterrors);
            return self.rx_back_to_search(d, self.now + 1);
        }

        if self.now < rx.sync_end {
            let at = rx.next_eval(self.now, rx.sync_end);
            return self.schedule(at, EventKind::RxSync, d);
        }

        self.rx_measure_rssi(d)?;
        let packet_size = self.txl.slot(tx).tx.packet_size;
        let rx = &mut self.rx[d];
        rx.biterrors = 0;
        rx.done.rx_time_stamp = self.txl.slot(tx).tx.start_packet_time + rx.req.pream_and_addr_duration as u64;
        rx.done.end_time = self.now;
        rx.done.packet_size = packet_size;
        rx.done.status = RxOutcome::InProgress;
        debug!("@{} receiver {} address found (device {})", self.now, d, tx);

        let payload = self.txl.slot(tx).packet.clone();
        let response = match rx.version {
            ProtoVersion::V1 => Response::RxAddressFoundV1(rx_done_v2_to_v1(&rx.done), payload),
            ProtoVersion::V2 => Response::RxAddressFoundV2(rx.done, payload),
        };
        if !self.respond(d, response) {
            return Ok(());
        }

        let directive = match self.link.recv(d) {
            Ok(r) => r,
            Err(e) => {
                warn!("@{} device {}: {}; treating it as disconnected", self.now, d, e);
                self.retire(d);
                return Ok(());
            }
        };
        match directive {
            Request::Disconnect => {
                debug!("@{} device {} disconnected during Rx", self.now, d);
                self.retire(d);
                Ok(())
            }
            Request::Terminate => {
                self.terminate(d);
                Ok(())
            }
            Request::RxCont if self.rx[d].version == ProtoVersion::V1 => self.rx_continue(d),
            Request::RxV2Cont(abort) if self.rx[d].version == ProtoVersion::V2 => {
                if let Some(abort) = abort {
                    self.check_new_abort(d, &abort, self.now, "Rx")?;
                    self.rx_apply_abort(d, abort);
                }
                self.rx_continue(d)
            }
            Request::RxStop => self.rx_finish(d, true),
            other => Err(self.protocol(d, format!("unexpected {} after an Rx address was found", other.name()))),
        }
    }

    fn rx_continue(&mut self, d: usize) -> Result<(), PhyError> {
        let rx = &self.rx[d];
        let at = rx.next_eval(self.now, rx.header_end);
        self.schedule(at, EventKind::RxHeader, d)
    }

    pub(crate) fn on_rx_header(&mut self, d: usize) -> Result<(), PhyError> {
        if !self.rx_recheck_abort(d)? {
            return Ok(());
        }
        let tx = self.rx_tx_nbr(d)?;
        self.rx_accumulate_errors(d, tx)?;

        let now = self.now;
        let rx = &mut self.rx[d];
        let header_over = now >= rx.header_end;
        if (header_over && rx.biterrors > rx.req.header_threshold as u32) || now >= rx.req.abort.abort_time {
            rx.done.packet_size = 0;
            rx.done.status = RxOutcome::HeaderError;
            return self.rx_finish(d, false);
        }
        if header_over {
            let at = rx.next_eval(now, rx.payload_end);
            self.schedule(at, EventKind::RxPayload, d)
        } else {
            let at = rx.next_eval(now, rx.header_end);
            self.schedule(at, EventKind::RxHeader, d)
        }
    }

    pub(crate) fn on_rx_payload(&mut self, d: usize) -> Result<(), PhyError> {
        if !self.rx_recheck_abort(d)? {
            return Ok(());
        }
        let tx = self.rx_tx_nbr(d)?;
        self.rx_accumulate_errors(d, tx)?;

        let now = self.now;
        let crcerr_data = self.cfg.crcerr_data;
        let rx = &mut self.rx[d];
        let payload_over = now >= rx.payload_end;
        if (payload_over && rx.biterrors > 0) || now >= rx.req.abort.abort_time {
            if !crcerr_data {
                rx.done.packet_size = 0;
            }
            rx.done.status = RxOutcome::PacketContentError;
            return self.rx_finish(d, false);
        }
        if payload_over {
            rx.done.status = RxOutcome::Ok;
            return self.rx_finish(d, true);
        }
        let at = rx.next_eval(now, rx.payload_end);
        self.schedule(at, EventKind::RxPayload, d)
    }
}
