//! Clear channel assessment.
//!
//! A CCA samples the channel every `scan_period` microseconds over its scan
//! window, looking for power above a threshold and/or a compatible modulated
//! signal above a threshold. It may stop early once either is found.

use crate::link::{DeviceLink, Response};
use crate::phy::DeviceOp;
use crate::queue::EventKind;
use crate::{Phy, PhyError};
use p2g4_common::trace::CcaRecord;
use p2g4_common::{CcaDone, CcaRequest, RssiValue, SimTime, CCA_STOP_ON_MOD, CCA_STOP_ON_RSSI};
use p2g4_models::facade::{average_rssi, rssi_to_mw, RxTuning};
use tracing::trace;

/// One device's ongoing CCA.
#[derive(Debug, Clone, Default)]
pub struct CcaStatus {
    pub req: CcaRequest,
    /// Last microsecond of the scan window.
    pub scan_end: SimTime,
    pub next_meas: SimTime,
    /// Sum of the samples in mW.
    pub rssi_acc: f64,
    pub n_meas: u32,
    pub done: CcaDone,
}

impl CcaStatus {
    fn should_stop(&self) -> bool {
        let stop = self.req.stop_when_found;
        (stop & CCA_STOP_ON_MOD != 0 && self.done.mod_found)
            || (stop & CCA_STOP_ON_RSSI != 0 && self.done.rssi_overthreshold)
    }
}

impl<L: DeviceLink> Phy<L> {
    pub(crate) fn prepare_cca(&mut self, d: usize, req: CcaRequest) -> Result<(), PhyError> {
        self.past_check(d, req.start_time, "CCA")?;
        self.check_new_abort(d, &req.abort, req.start_time, "CCA")?;
        if req.scan_period == 0 {
            return Err(self.protocol(d, "CCA scan period of 0"));
        }

        let mut scan_end = req.start_time + (req.scan_duration.max(1) as u64 - 1);
        if req.abort.abort_time < scan_end {
            scan_end = req.abort.abort_time - 1;
        }
        trace!(
            "@{} device {} wants a CCA at {} until {} every {} us",
            self.now,
            d,
            req.start_time,
            scan_end,
            req.scan_period
        );

        self.cca[d] = CcaStatus {
            req,
            scan_end,
            next_meas: req.start_time,
            done: CcaDone {
                rssi_max: RssiValue::MIN,
                mod_rx_power: RssiValue::MIN,
                ..Default::default()
            },
            ..Default::default()
        };
        self.ops[d] = DeviceOp::Cca;
        self.stats.cca += 1;
        self.schedule(req.start_time, EventKind::SearchStart, d)
    }

    pub(crate) fn cca_start(&mut self, d: usize) -> Result<(), PhyError> {
        self.on_cca_meas(d)
    }

    pub(crate) fn on_cca_meas(&mut self, d: usize) -> Result<(), PhyError> {
        if self.now >= self.cca[d].req.abort.recheck_time {
            let Some(abort) = self.reevaluate_abort(d, "CCA")? else {
                return Ok(());
            };
            let cca = &mut self.cca[d];
            cca.req.abort = abort;
            if abort.abort_time < cca.scan_end {
                cca.scan_end = abort.abort_time - 1;
            }
        }

        let cca = &self.cca[d];
        if self.now >= cca.req.abort.abort_time || self.now > cca.scan_end {
            return self.cca_finish(d);
        }

        if self.now >= cca.next_meas {
            let tuning = RxTuning {
                radio: cca.req.radio_params,
                antenna_gain: cca.req.antenna_gain,
            };
            let sample = self.chm.cca_sample(&self.txl, d, &tuning, self.now, self.sink.as_mut())?;
            let cca = &mut self.cca[d];
            cca.rssi_acc += rssi_to_mw(sample.rssi);
            cca.n_meas += 1;
            cca.done.rssi_max = cca.done.rssi_max.max(sample.rssi);
            if let Some(mod_rssi) = sample.mod_rssi {
                cca.done.mod_rx_power = cca.done.mod_rx_power.max(mod_rssi);
                cca.done.mod_found |= mod_rssi > cca.req.mod_threshold;
            }
            cca.done.rssi_overthreshold |= sample.rssi > cca.req.rssi_threshold;
            trace!(
                "@{} device {} CCA sample {:.2} dBm (modulated {:?})",
                self.now,
                d,
                sample.rssi.to_dbm(),
                sample.mod_rssi.map(|r| r.to_dbm())
            );

            let period = cca.req.scan_period as u64;
            if cca.should_stop() || cca.next_meas + period > cca.scan_end {
                return self.cca_finish(d);
            }
            cca.next_meas = cca.next_meas + period;
        }

        let cca = &self.cca[d];
        let at = cca.next_meas.min(cca.req.abort.recheck_time).max(self.now);
        self.schedule(at, EventKind::CcaMeas, d)
    }

    fn cca_finish(&mut self, d: usize) -> Result<(), PhyError> {
        self.queue.remove(d);
        let cca = &mut self.cca[d];
        cca.done.end_time = self.now;
        cca.done.rssi_ave = average_rssi(cca.rssi_acc, cca.n_meas);
        let done = cca.done;
        self.sink.cca(&CcaRecord {
            device: d,
            request: &self.cca[d].req,
            done: &done,
        })?;
        trace!(
            "@{} device {} CCA done: average {:.2} dBm over {} samples, mod found {}, over threshold {}",
            self.now,
            d,
            done.rssi_ave.to_dbm(),
            self.cca[d].n_meas,
            done.mod_found,
            done.rssi_overthreshold
        );
        if self.respond(d, Response::CcaDone(done)) {
            self.handle_next_request(d)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_stop_honours_flags() {
        let mut cca = CcaStatus::default();
        cca.done.mod_found = true;
        assert!(!cca.should_stop());
        cca.req.stop_when_found = CCA_STOP_ON_RSSI;
        assert!(!cca.should_stop());
        cca.req.stop_when_found = CCA_STOP_ON_MOD;
        assert!(cca.should_stop());
        cca.done = CcaDone {
            rssi_overthreshold: true,
            ..Default::default()
        };
        assert!(!cca.should_stop());
        cca.req.stop_when_found = CCA_STOP_ON_MOD | CCA_STOP_ON_RSSI;
        assert!(cca.should_stop());
    }
}
