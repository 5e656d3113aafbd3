//! Transmit state machine.
//!
//! requested -> carrier on -> packet ongoing -> packet ended -> ended.
//! The carrier may start before and end after the packet. An abort cuts the
//! whole transmission short.

use crate::link::{DeviceLink, Response};
use crate::phy::DeviceOp;
use crate::queue::EventKind;
use crate::rx::RxState;
use crate::{Phy, PhyError};
use p2g4_common::trace::TxRecord;
use p2g4_common::{ProtoVersion, TxDone, TxState, TxV2};
use tracing::trace;

impl<L: DeviceLink> Phy<L> {
    pub(crate) fn prepare_tx(
        &mut self,
        d: usize,
        tx: TxV2,
        packet: Vec<u8>,
        version: ProtoVersion,
    ) -> Result<(), PhyError> {
        self.past_check(d, tx.start_tx_time, "Tx")?;
        if tx.start_tx_time >= tx.end_tx_time {
            return Err(self.protocol(
                d,
                format!("Tx end ({}) not after its start ({})", tx.end_tx_time, tx.start_tx_time),
            ));
        }
        if tx.start_packet_time < tx.start_tx_time
            || tx.end_packet_time < tx.start_packet_time
            || tx.end_packet_time > tx.end_tx_time
        {
            return Err(self.protocol(
                d,
                format!(
                    "Tx packet [{}, {}] outside its carrier [{}, {}]",
                    tx.start_packet_time, tx.end_packet_time, tx.start_tx_time, tx.end_tx_time
                ),
            ));
        }
        self.check_new_abort(d, &tx.abort, tx.start_tx_time, "Tx")?;

        trace!(
            "@{} device {} wants to Tx at {} (abort {}, recheck {})",
            self.now,
            d,
            tx.start_tx_time,
            tx.abort.abort_time,
            tx.abort.recheck_time
        );

        self.txl.register(d, tx, packet);
        self.ops[d] = DeviceOp::Tx(version);
        self.stats.tx += 1;
        self.schedule(tx.start_tx_time, EventKind::TxStart, d)
    }

    /// Schedule the next thing that happens to device `d`'s transmission.
    ///
    /// Packet events go before a carrier end at the same time; an abort
    /// recheck goes before anything at the same time.
    fn tx_schedule_next(&mut self, d: usize) -> Result<(), PhyError> {
        let slot = self.txl.slot(d);
        let tx = slot.tx;
        let state = slot.state;

        let end = tx.end_tx_time.min(tx.abort.abort_time);
        let (mut time, mut kind) = (end, EventKind::TxEnd);
        if !state.contains(TxState::PACKET_STARTED) {
            if tx.start_packet_time <= end {
                (time, kind) = (tx.start_packet_time, EventKind::TxPacketStart);
            }
        } else if state.contains(TxState::PACKET_ONGOING) && tx.end_packet_time <= end {
            (time, kind) = (tx.end_packet_time, EventKind::TxPacketEnd);
        }
        if tx.abort.recheck_time <= time {
            (time, kind) = (tx.abort.recheck_time, EventKind::TxAbortReeval);
        }
        self.schedule(time.max(self.now), kind, d)
    }

    /// Put device `d`'s packet on air and wake up receivers waiting for it.
    fn tx_start_packet(&mut self, d: usize) -> Result<(), PhyError> {
        self.txl.start_packet(d);
        trace!("@{} device {} packet started", self.now, d);

        for r in 0..self.cfg.n_devs {
            if !matches!(self.ops[r], DeviceOp::Rx(_)) {
                continue;
            }
            let rx = &self.rx[r];
            if rx.state != RxState::Searching || self.now > rx.scan_end || !self.txl.fits(d, &rx.req, self.now) {
                continue;
            }
            trace!("@{} device {} found by receiver {}", self.now, d, r);
            let rx = &mut self.rx[r];
            rx.tx_nbr = Some(d);
            rx.state = RxState::NotSearching;
            self.schedule(self.now, EventKind::RxFound, r)?;
        }
        Ok(())
    }

    pub(crate) fn on_tx_start(&mut self, d: usize) -> Result<(), PhyError> {
        self.txl.start_carrier(d);
        trace!("@{} device {} carrier on", self.now, d);
        if self.txl.slot(d).tx.start_packet_time <= self.now {
            self.tx_start_packet(d)?;
        }
        self.tx_schedule_next(d)
    }

    pub(crate) fn on_tx_packet_start(&mut self, d: usize) -> Result<(), PhyError> {
        self.tx_start_packet(d)?;
        self.tx_schedule_next(d)
    }

    pub(crate) fn on_tx_packet_end(&mut self, d: usize) -> Result<(), PhyError> {
        self.txl.end_packet(d);
        trace!("@{} device {} packet ended", self.now, d);
        self.tx_schedule_next(d)
    }

    pub(crate) fn on_tx_abort_reeval(&mut self, d: usize) -> Result<(), PhyError> {
        let Some(abort) = self.reevaluate_abort(d, "Tx")? else {
            return Ok(());
        };
        self.txl.set_abort(d, abort);
        self.tx_schedule_next(d)
    }

    pub(crate) fn on_tx_end(&mut self, d: usize) -> Result<(), PhyError> {
        self.queue.remove(d);
        let slot = self.txl.slot(d);
        self.sink.tx(&TxRecord {
            device: d,
            tx: &slot.tx,
            packet: &slot.packet,
        })?;
        self.txl.clear(d);
        trace!("@{} device {} Tx done", self.now, d);
        if self.respond(d, Response::TxDone(TxDone { end_time: self.now })) {
            self.handle_next_request(d)?;
        }
        Ok(())
    }
}
