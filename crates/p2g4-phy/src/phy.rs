//! The simulation context and main loop.
//!
//! [`Phy`] owns the clock, the event queue, the transmission registry, the
//! channel/modem facade, the per-device operation state and the link to the
//! devices. Events are dispatched through a fixed handler table indexed by
//! [`EventKind`].

use crate::cca::CcaStatus;
use crate::link::{DeviceLink, Request, Response};
use crate::queue::{EventKind, EventQueue};
use crate::rx::RxStatus;
use crate::{PhyConfig, PhyError, PhyStats};
use p2g4_common::remap::{rx_v1_to_v2, tx_v1_to_v2};
use p2g4_common::trace::RssiRecord;
use p2g4_common::{AbortParams, ProtoVersion, RssiDone, RssiRequest, SimTime, TraceSink, TxList};
use p2g4_models::facade::RxTuning;
use p2g4_models::ChannelModem;
use tracing::{debug, info, trace, warn};

/// What a device is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceOp {
    #[default]
    Idle,
    Wait,
    Tx(ProtoVersion),
    Rx(ProtoVersion),
    Rssi,
    Cca,
}

type Handler<L> = fn(&mut Phy<L>, usize) -> Result<(), PhyError>;

/// The physical layer simulation.
pub struct Phy<L: DeviceLink> {
    pub(crate) cfg: PhyConfig,
    pub(crate) now: SimTime,
    pub(crate) active_devs: usize,
    pub(crate) queue: EventQueue,
    pub(crate) txl: TxList,
    pub(crate) chm: ChannelModem,
    pub(crate) link: L,
    pub(crate) sink: Box<dyn TraceSink>,
    pub(crate) stats: PhyStats,
    pub(crate) ops: Vec<DeviceOp>,
    pub(crate) rx: Vec<RxStatus>,
    pub(crate) cca: Vec<CcaStatus>,
    pub(crate) rssi: Vec<RssiRequest>,
}

impl<L: DeviceLink> Phy<L> {
    /// Handlers indexed by [`EventKind::index`].
    const HANDLERS: [Handler<L>; EventKind::COUNT] = [
        Self::on_none,
        Self::on_wait_done,
        Self::on_tx_end,
        Self::on_tx_packet_end,
        Self::on_rssi_meas,
        Self::on_cca_meas,
        Self::on_rx_search_reeval,
        Self::on_rx_found,
        Self::on_rx_sync,
        Self::on_rx_header,
        Self::on_rx_payload,
        Self::on_tx_abort_reeval,
        Self::on_tx_packet_start,
        Self::on_tx_start,
        Self::on_search_start,
    ];

    /// Create the simulation. `chm` must serve `cfg.n_devs` devices.
    pub fn new(cfg: PhyConfig, chm: ChannelModem, link: L, sink: Box<dyn TraceSink>) -> Self {
        let n = cfg.n_devs;
        Self {
            cfg,
            now: SimTime::ZERO,
            active_devs: n,
            queue: EventQueue::new(n),
            txl: TxList::new(n),
            chm,
            link,
            sink,
            stats: PhyStats::default(),
            ops: vec![DeviceOp::Idle; n],
            rx: (0..n).map(|_| RxStatus::default()).collect(),
            cca: vec![CcaStatus::default(); n],
            rssi: vec![RssiRequest::default(); n],
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Devices still taking part.
    pub fn active_devs(&self) -> usize {
        self.active_devs
    }

    /// Statistics gathered so far.
    pub fn stats(&self) -> &PhyStats {
        &self.stats
    }

    /// Transmission registry.
    pub fn txl(&self) -> &TxList {
        &self.txl
    }

    /// Event queue.
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Device `d`'s current operation.
    pub fn op(&self, d: usize) -> DeviceOp {
        self.ops[d]
    }

    /// The device link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Mutable access to the device link.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Consume the simulation, returning the trace sink.
    pub fn into_sink(self) -> Box<dyn TraceSink> {
        self.sink
    }

    /// Run until every device left, the queue drained or the time limit.
    ///
    /// The devices are told to terminate whether or not the run succeeded.
    pub fn run(&mut self) -> Result<PhyStats, PhyError> {
        let result = self.main_loop();
        self.stats.end_time = self.now;
        self.link.terminate_all();
        result.map(|_| self.stats.clone())
    }

    fn main_loop(&mut self) -> Result<(), PhyError> {
        for d in 0..self.cfg.n_devs {
            if self.active_devs == 0 {
                break;
            }
            self.handle_next_request(d)?;
        }

        while self.active_devs > 0 {
            let Some(next) = self.queue.select_next() else {
                debug!("@{} no more events", self.now);
                break;
            };
            if next.time >= self.cfg.sim_length {
                info!("@{} simulation length reached", self.cfg.sim_length);
                self.now = self.cfg.sim_length;
                break;
            }
            self.now = next.time;
            self.stats.events += 1;
            trace!("@{} device {} {:?}", self.now, next.device, next.kind);
            (Self::HANDLERS[next.kind.index()])(self, next.device)?;
        }
        Ok(())
    }

    // ========================================================================
    // Helpers shared by the state machines
    // ========================================================================

    pub(crate) fn schedule(&mut self, time: SimTime, kind: EventKind, d: usize) -> Result<(), PhyError> {
        if time < self.now {
            return Err(PhyError::Internal {
                time: self.now,
                reason: format!("device {} {:?} scheduled in the past ({})", d, kind, time),
            });
        }
        self.queue.schedule(time, kind, d);
        Ok(())
    }

    pub(crate) fn protocol(&self, d: usize, reason: impl Into<String>) -> PhyError {
        PhyError::Protocol {
            device: d,
            time: self.now,
            reason: reason.into(),
        }
    }

    pub(crate) fn internal(&self, reason: impl Into<String>) -> PhyError {
        PhyError::Internal {
            time: self.now,
            reason: reason.into(),
        }
    }

    /// Send `response`; a failing link retires the device. Returns whether
    /// the device is still with us.
    pub(crate) fn respond(&mut self, d: usize, response: Response) -> bool {
        match self.link.send(d, response) {
            Ok(()) => true,
            Err(e) => {
                warn!("@{} device {}: {}; treating it as disconnected", self.now, d, e);
                self.retire(d);
                false
            }
        }
    }

    /// Drop device `d` from the simulation.
    pub(crate) fn retire(&mut self, d: usize) {
        self.queue.remove(d);
        if matches!(self.ops[d], DeviceOp::Tx(_)) && self.txl.state(d).is_on() {
            self.txl.clear(d);
        }
        self.ops[d] = DeviceOp::Idle;
        self.link.disconnect(d);
        self.active_devs = self.active_devs.saturating_sub(1);
        self.stats.disconnects += 1;
        info!("@{} device {} disconnected ({} left)", self.now, d, self.active_devs);
    }

    /// Stop the whole simulation on a device's request.
    pub(crate) fn terminate(&mut self, d: usize) {
        info!(
            "@{} device {} terminated the simulation ({} were left)",
            self.now,
            d,
            self.active_devs.saturating_sub(1)
        );
        self.queue.remove(d);
        self.active_devs = 0;
    }

    /// Validate the abort parameters of a new operation starting at `start`.
    pub(crate) fn check_new_abort(
        &self,
        d: usize,
        abort: &AbortParams,
        start: SimTime,
        what: &str,
    ) -> Result<(), PhyError> {
        if self.now >= abort.abort_time {
            return Err(self.protocol(d, format!("{} abort in the past ({})", what, abort.abort_time)));
        }
        if self.now >= abort.recheck_time {
            return Err(self.protocol(d, format!("{} abort recheck in the past ({})", what, abort.recheck_time)));
        }
        if start > abort.abort_time {
            return Err(self.protocol(d, format!("{} abort ({}) before its start ({})", what, abort.abort_time, start)));
        }
        if start > abort.recheck_time {
            return Err(self.protocol(
                d,
                format!("{} abort recheck ({}) before its start ({})", what, abort.recheck_time, start),
            ));
        }
        Ok(())
    }

    pub(crate) fn past_check(&self, d: usize, start: SimTime, what: &str) -> Result<(), PhyError> {
        if start < self.now {
            return Err(self.protocol(d, format!("{} start ({}) already passed", what, start)));
        }
        Ok(())
    }

    /// Ask device `d` for fresh abort parameters.
    ///
    /// Immediate RSSI requests are served while waiting. Returns `None` when
    /// the device left or terminated the simulation; the caller must then
    /// stop handling the event.
    pub(crate) fn reevaluate_abort(&mut self, d: usize, what: &str) -> Result<Option<AbortParams>, PhyError> {
        trace!("@{} device {}: {} abort re-evaluation", self.now, d, what);
        if !self.respond(d, Response::AbortReeval) {
            return Ok(None);
        }
        loop {
            match self.link.recv(d) {
                Ok(Request::AbortUpdate(abort)) => {
                    if self.now > abort.abort_time {
                        return Err(self.protocol(d, format!("{} abort in the past ({})", what, abort.abort_time)));
                    }
                    if self.now > abort.recheck_time {
                        return Err(self.protocol(
                            d,
                            format!("{} abort recheck in the past ({})", what, abort.recheck_time),
                        ));
                    }
                    if self.now == abort.recheck_time {
                        debug!(
                            "@{} device {} asked to recheck its {} abort right now; it may loop forever",
                            self.now, d, what
                        );
                    }
                    return Ok(Some(abort));
                }
                Ok(Request::ImmediateRssi(req)) => {
                    let tuning = RxTuning {
                        radio: req.radio_params,
                        antenna_gain: req.antenna_gain,
                    };
                    let rssi = self.chm.rssi(&self.txl, d, &tuning, self.now, self.sink.as_mut())?;
                    self.stats.rssi += 1;
                    if !self.respond(d, Response::ImmediateRssiDone(RssiDone { rssi })) {
                        return Ok(None);
                    }
                }
                Ok(Request::Terminate) => {
                    self.terminate(d);
                    return Ok(None);
                }
                Ok(Request::Disconnect) => {
                    self.retire(d);
                    return Ok(None);
                }
                Ok(other) => {
                    warn!(
                        "@{} device {} sent {} during a {} abort re-evaluation; treating it as disconnected",
                        self.now,
                        d,
                        other.name(),
                        what
                    );
                    self.retire(d);
                    return Ok(None);
                }
                Err(e) => {
                    warn!("@{} device {}: {}; treating it as disconnected", self.now, d, e);
                    self.retire(d);
                    return Ok(None);
                }
            }
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Read and set up device `d`'s next operation.
    pub(crate) fn handle_next_request(&mut self, d: usize) -> Result<(), PhyError> {
        self.ops[d] = DeviceOp::Idle;
        let request = match self.link.recv(d) {
            Ok(r) => r,
            Err(e) => {
                warn!("@{} device {}: {}; treating it as disconnected", self.now, d, e);
                self.retire(d);
                return Ok(());
            }
        };
        match request {
            Request::Wait(w) => {
                if w.end < self.now {
                    return Err(self.protocol(d, format!("wait end ({}) already passed", w.end)));
                }
                trace!("@{} device {} waits until {}", self.now, d, w.end);
                self.ops[d] = DeviceOp::Wait;
                self.stats.waits += 1;
                self.schedule(w.end, EventKind::WaitDone, d)
            }
            Request::TxV1(tx, packet) => self.prepare_tx(d, tx_v1_to_v2(&tx), packet, ProtoVersion::V1),
            Request::TxV2(tx, packet) => self.prepare_tx(d, tx, packet, ProtoVersion::V2),
            Request::RxV1(rx) => self.prepare_rx(d, rx_v1_to_v2(&rx), ProtoVersion::V1),
            Request::RxV2(rx) => self.prepare_rx(d, rx, ProtoVersion::V2),
            Request::Rssi(req) => self.prepare_rssi(d, req),
            Request::Cca(req) => self.prepare_cca(d, req),
            Request::Disconnect => {
                self.retire(d);
                Ok(())
            }
            Request::Terminate => {
                self.terminate(d);
                Ok(())
            }
            other => Err(self.protocol(d, format!("unexpected {} while idle", other.name()))),
        }
    }

    fn prepare_rssi(&mut self, d: usize, req: RssiRequest) -> Result<(), PhyError> {
        self.past_check(d, req.meas_time, "RSSI measurement")?;
        trace!("@{} device {} wants an RSSI measurement at {}", self.now, d, req.meas_time);
        self.rssi[d] = req;
        self.ops[d] = DeviceOp::Rssi;
        self.schedule(req.meas_time, EventKind::RssiMeas, d)
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn on_none(&mut self, d: usize) -> Result<(), PhyError> {
        Err(self.internal(format!("empty event for device {}", d)))
    }

    fn on_wait_done(&mut self, d: usize) -> Result<(), PhyError> {
        trace!("@{} device {} wait done", self.now, d);
        self.queue.remove(d);
        if self.respond(d, Response::WaitDone) {
            self.handle_next_request(d)?;
        }
        Ok(())
    }

    fn on_rssi_meas(&mut self, d: usize) -> Result<(), PhyError> {
        self.queue.remove(d);
        let req = self.rssi[d];
        let tuning = RxTuning {
            radio: req.radio_params,
            antenna_gain: req.antenna_gain,
        };
        let rssi = self.chm.rssi(&self.txl, d, &tuning, self.now, self.sink.as_mut())?;
        let done = RssiDone { rssi };
        self.sink.rssi(&RssiRecord {
            device: d,
            request: &self.rssi[d],
            done: &done,
        })?;
        self.stats.rssi += 1;
        trace!("@{} device {} RSSI {:.2} dBm", self.now, d, rssi.to_dbm());
        if self.respond(d, Response::RssiDone(done)) {
            self.handle_next_request(d)?;
        }
        Ok(())
    }

    fn on_search_start(&mut self, d: usize) -> Result<(), PhyError> {
        match self.ops[d] {
            DeviceOp::Rx(_) => self.rx_search_start(d),
            DeviceOp::Cca => self.cca_start(d),
            op => Err(self.internal(format!("search start for device {} doing {:?}", d, op))),
        }
    }
}
