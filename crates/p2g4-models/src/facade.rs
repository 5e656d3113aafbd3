//! Channel/modem facade.
//!
//! Glues the channel model and the per-device modems together, caches the
//! last evaluation per receiver and turns probabilities into bit errors and
//! sync decisions using the simulation's random source.
//!
//! A receiver's cached evaluation is reused while neither the transmission
//! registry's change counter nor the receiver's own counter have moved and
//! the evaluation was for the same transmitter.

use crate::{BitErrorRng, ChannelModel, ModelError, ModemModel};
use p2g4_common::trace::ModemRxRecord;
use p2g4_common::{
    dbm_to_mw, mw_to_dbm, Power, Probability, RadioParams, RssiValue, SimTime, TraceError, TraceSink, TxList,
};
use thiserror::Error;
use tracing::trace;

/// Errors raised by the facade.
#[derive(Debug, Error)]
pub enum FacadeError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Trace(#[from] TraceError),
}

/// Combine analog and ISI limited SNRs (dB).
pub fn combine_snr(snr_analog: f64, snr_isi: f64) -> f64 {
    -10.0 * (10f64.powf(-snr_analog / 10.0) + 10f64.powf(-snr_isi / 10.0)).log10()
}

/// What a receiver is listening with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RxTuning {
    pub radio: RadioParams,
    pub antenna_gain: Power,
}

#[derive(Debug, Clone)]
struct ReceiverStatus {
    last_tx_ctr: Option<u64>,
    last_rx_ctr: u64,
    rx_ctr: u64,
    last_tx_nbr: Option<usize>,
    att: Vec<f64>,
    rx_pow: Vec<f64>,
    snr_isi: f64,
    snr_analog: f64,
    snr_total: f64,
    rssi_power: f64,
    ber: Probability,
    sync_prob: Probability,
}

impl ReceiverStatus {
    fn new(n_devs: usize) -> Self {
        Self {
            last_tx_ctr: None,
            last_rx_ctr: 0,
            rx_ctr: 0,
            last_tx_nbr: None,
            att: vec![0.0; n_devs],
            rx_pow: vec![f64::NEG_INFINITY; n_devs],
            snr_isi: 0.0,
            snr_analog: 0.0,
            snr_total: 0.0,
            rssi_power: f64::NEG_INFINITY,
            ber: 0,
            sync_prob: 0,
        }
    }
}

/// Result of a CCA sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CcaSample {
    /// Total power RSSI.
    pub rssi: RssiValue,
    /// RSSI of the strongest compatible modulated signal, if any.
    pub mod_rssi: Option<RssiValue>,
}

/// The channel/modem facade.
pub struct ChannelModem {
    channel: Box<dyn ChannelModel>,
    modems: Vec<Box<dyn ModemModel>>,
    status: Vec<ReceiverStatus>,
    rng: BitErrorRng,
}

impl ChannelModem {
    /// Build the facade from one channel and one modem per device.
    pub fn new(channel: Box<dyn ChannelModel>, modems: Vec<Box<dyn ModemModel>>, rng: BitErrorRng) -> Self {
        let n_devs = modems.len();
        Self {
            channel,
            modems,
            status: (0..n_devs).map(|_| ReceiverStatus::new(n_devs)).collect(),
            rng,
        }
    }

    /// Number of devices served.
    pub fn n_devs(&self) -> usize {
        self.modems.len()
    }

    /// Invalidate receiver `rx_nbr`'s cached evaluation.
    pub fn new_rx_context(&mut self, rx_nbr: usize) {
        self.status[rx_nbr].rx_ctr += 1;
    }

    fn needs_recalc(&self, txl: &TxList, tx_nbr: Option<usize>, rx_nbr: usize) -> bool {
        let st = &self.status[rx_nbr];
        st.rx_ctr != st.last_rx_ctr || st.last_tx_ctr != Some(txl.ctr()) || st.last_tx_nbr != tx_nbr
    }

    fn recalc(
        &mut self,
        txl: &TxList,
        tx_nbr: Option<usize>,
        rx_nbr: usize,
        tuning: &RxTuning,
        now: SimTime,
        sink: &mut dyn TraceSink,
    ) -> Result<(), FacadeError> {
        let st = &mut self.status[rx_nbr];
        let modem = &mut self.modems[rx_nbr];

        st.snr_isi = self.channel.calc(txl, tx_nbr, rx_nbr, now, &mut st.att)?;
        st.rx_pow.fill(f64::NEG_INFINITY);
        for (i, slot) in txl.active() {
            st.rx_pow[i] = slot.tx.power_level.to_dbm() - st.att[i] + tuning.antenna_gain.to_dbm();
        }

        let analog = modem.analog_rx(&tuning.radio, &st.rx_pow, txl, tx_nbr)?;
        st.snr_analog = analog.snr;
        st.rssi_power = analog.rssi_power;
        st.snr_total = combine_snr(st.snr_analog, st.snr_isi);

        if let Some(tx) = tx_nbr {
            st.ber = modem.digital_perf_ber(&tuning.radio, st.snr_total)?;
            st.sync_prob = modem.digital_perf_sync(&tuning.radio, st.snr_total, &txl.slot(tx).tx)?;
        } else {
            st.ber = 0;
            st.sync_prob = 0;
        }

        st.last_tx_ctr = Some(txl.ctr());
        st.last_rx_ctr = st.rx_ctr;
        st.last_tx_nbr = tx_nbr;

        trace!(
            "@{} rx {} tx {:?}: SNR {:.2} dB (analog {:.2}, ISI {:.2}), BER {}, sync {}",
            now,
            rx_nbr,
            tx_nbr,
            st.snr_total,
            st.snr_analog,
            st.snr_isi,
            st.ber,
            st.sync_prob
        );

        sink.modem_rx(&ModemRxRecord {
            time: now,
            rx_nbr,
            tx_nbr,
            ctr: txl.ctr(),
            snr_analog: st.snr_analog,
            snr_isi: st.snr_isi,
            snr_total: st.snr_total,
            ber: st.ber,
            sync_prob: st.sync_prob,
            rx_power: tx_nbr.map_or(st.rssi_power, |tx| st.rx_pow[tx]),
        })?;
        Ok(())
    }

    /// Number of bit errors in `n_calcs` bits received by `rx_nbr` from `tx_nbr` at `now`.
    #[allow(clippy::too_many_arguments)]
    pub fn bit_errors(
        &mut self,
        txl: &TxList,
        tx_nbr: usize,
        rx_nbr: usize,
        tuning: &RxTuning,
        now: SimTime,
        n_calcs: u32,
        sink: &mut dyn TraceSink,
    ) -> Result<u32, FacadeError> {
        if self.needs_recalc(txl, Some(tx_nbr), rx_nbr) {
            self.recalc(txl, Some(tx_nbr), rx_nbr, tuning, now, sink)?;
        }
        let ber = self.status[rx_nbr].ber;
        Ok(self.rng.bern_count(ber, n_calcs))
    }

    /// Whether `rx_nbr` synchronizes to `tx_nbr`'s packet at `now`.
    ///
    /// Always evaluates the link afresh.
    pub fn is_packet_synched(
        &mut self,
        txl: &TxList,
        tx_nbr: usize,
        rx_nbr: usize,
        tuning: &RxTuning,
        now: SimTime,
        sink: &mut dyn TraceSink,
    ) -> Result<bool, FacadeError> {
        self.new_rx_context(rx_nbr);
        self.recalc(txl, Some(tx_nbr), rx_nbr, tuning, now, sink)?;
        let p = self.status[rx_nbr].sync_prob;
        Ok(self.rng.bern(p))
    }

    /// RSSI measured by `rx_nbr` at `now`.
    pub fn rssi(
        &mut self,
        txl: &TxList,
        rx_nbr: usize,
        tuning: &RxTuning,
        now: SimTime,
        sink: &mut dyn TraceSink,
    ) -> Result<RssiValue, FacadeError> {
        self.recalc(txl, None, rx_nbr, tuning, now, sink)?;
        let power = self.status[rx_nbr].rssi_power;
        Ok(self.modems[rx_nbr].digital_rssi(&tuning.radio, power)?)
    }

    /// One CCA sample: total RSSI plus the strongest signal the receiver
    /// could demodulate (same centre frequency, similar modulation).
    pub fn cca_sample(
        &mut self,
        txl: &TxList,
        rx_nbr: usize,
        tuning: &RxTuning,
        now: SimTime,
        sink: &mut dyn TraceSink,
    ) -> Result<CcaSample, FacadeError> {
        let rssi = self.rssi(txl, rx_nbr, tuning, now, sink)?;
        let st = &self.status[rx_nbr];
        let strongest = txl
            .active()
            .filter(|(_, slot)| {
                slot.tx.radio_params.center_freq == tuning.radio.center_freq
                    && tuning.radio.modulation.is_similar(slot.tx.radio_params.modulation)
            })
            .map(|(i, _)| st.rx_pow[i])
            .fold(None, |best: Option<f64>, p| Some(best.map_or(p, |b| b.max(p))));
        let mod_rssi = match strongest {
            Some(p) => Some(self.modems[rx_nbr].digital_rssi(&tuning.radio, p)?),
            None => None,
        };
        Ok(CcaSample { rssi, mod_rssi })
    }
}

/// Average of RSSI readings computed on linear power.
pub fn average_rssi(sum_mw: f64, count: u32) -> RssiValue {
    if count == 0 {
        return RssiValue::MIN;
    }
    RssiValue::from_dbm(mw_to_dbm(sum_mw / count as f64))
}

/// Linear power of an RSSI reading.
pub fn rssi_to_mw(rssi: RssiValue) -> f64 {
    dbm_to_mw(rssi.to_dbm())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::NtNcable;
    use crate::modem::Magic;
    use crate::AnalogRx;
    use p2g4_common::{Freq, Modulation, NullSink, TxV2, PROB_ONE};
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingModem {
        calls: Rc<Cell<u32>>,
        ber: Probability,
    }

    impl ModemModel for CountingModem {
        fn analog_rx(
            &mut self,
            _rx_radio: &RadioParams,
            _rx_powers: &[f64],
            _txl: &TxList,
            _desired: Option<usize>,
        ) -> Result<AnalogRx, ModelError> {
            self.calls.set(self.calls.get() + 1);
            Ok(AnalogRx {
                snr: 30.0,
                rssi_power: -60.0,
            })
        }

        fn digital_perf_ber(&mut self, _rx_radio: &RadioParams, _snr: f64) -> Result<Probability, ModelError> {
            Ok(self.ber)
        }

        fn digital_perf_sync(&mut self, _r: &RadioParams, _snr: f64, _tx: &TxV2) -> Result<Probability, ModelError> {
            Ok(PROB_ONE)
        }

        fn digital_rssi(&mut self, _rx_radio: &RadioParams, p: f64) -> Result<RssiValue, ModelError> {
            Ok(RssiValue::from_dbm(p))
        }
    }

    fn tuning() -> RxTuning {
        RxTuning {
            radio: RadioParams {
                modulation: Modulation::BLE1M,
                center_freq: Freq(512),
            },
            antenna_gain: Power(0),
        }
    }

    fn one_carrier() -> TxList {
        let mut txl = TxList::new(2);
        let tx = TxV2 {
            radio_params: tuning().radio,
            power_level: Power::from_dbm(0.0),
            ..Default::default()
        };
        txl.register(0, tx, Vec::new());
        txl.start_carrier(0);
        txl.start_packet(0);
        txl
    }

    fn counting_facade(ber: Probability) -> (ChannelModem, Rc<Cell<u32>>) {
        let calls = Rc::new(Cell::new(0));
        let modems: Vec<Box<dyn ModemModel>> = (0..2)
            .map(|_| {
                Box::new(CountingModem {
                    calls: calls.clone(),
                    ber,
                }) as Box<dyn ModemModel>
            })
            .collect();
        let chm = ChannelModem::new(Box::new(NtNcable::uniform(2, 60.0)), modems, BitErrorRng::new(1));
        (chm, calls)
    }

    #[test]
    fn test_combine_snr() {
        assert!((combine_snr(20.0, 20.0) - (20.0 - 10.0 * 2f64.log10())).abs() < 1e-9);
        assert!((combine_snr(10.0, 100.0) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_bit_errors_reuse_cached_evaluation() {
        let txl = one_carrier();
        let (mut chm, calls) = counting_facade(0);
        let now = SimTime::from_micros(10);
        let a = chm.bit_errors(&txl, 0, 1, &tuning(), now, 1, &mut NullSink).unwrap();
        let b = chm.bit_errors(&txl, 0, 1, &tuning(), now + 1, 1, &mut NullSink).unwrap();
        assert_eq!(a, b);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_registry_change_forces_recalc() {
        let mut txl = one_carrier();
        let (mut chm, calls) = counting_facade(0);
        chm.bit_errors(&txl, 0, 1, &tuning(), SimTime::ZERO, 1, &mut NullSink).unwrap();
        txl.register(1, TxV2::default(), Vec::new());
        txl.start_carrier(1);
        chm.bit_errors(&txl, 0, 1, &tuning(), SimTime::ZERO, 1, &mut NullSink).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_sync_always_recalculates() {
        let txl = one_carrier();
        let (mut chm, calls) = counting_facade(0);
        assert!(chm.is_packet_synched(&txl, 0, 1, &tuning(), SimTime::ZERO, &mut NullSink).unwrap());
        assert!(chm.is_packet_synched(&txl, 0, 1, &tuning(), SimTime::ZERO, &mut NullSink).unwrap());
        assert_eq!(calls.get(), 2);
        // The sync evaluation is reused by the following bit error query.
        chm.bit_errors(&txl, 0, 1, &tuning(), SimTime::ZERO, 1, &mut NullSink).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_bit_errors_follow_ber() {
        let txl = one_carrier();
        let (mut chm, _) = counting_facade(PROB_ONE);
        let errors = chm.bit_errors(&txl, 0, 1, &tuning(), SimTime::ZERO, 4, &mut NullSink).unwrap();
        assert_eq!(errors, 4);
    }

    #[test]
    fn test_rssi_through_cable() {
        let txl = one_carrier();
        let modems: Vec<Box<dyn ModemModel>> = vec![Box::new(Magic::default()), Box::new(Magic::default())];
        let mut chm = ChannelModem::new(Box::new(NtNcable::uniform(2, 60.0)), modems, BitErrorRng::new(1));
        let rssi = chm.rssi(&txl, 1, &tuning(), SimTime::ZERO, &mut NullSink).unwrap();
        // -60 dBm signal over a -100 dBm noise floor
        assert!((rssi.to_dbm() + 60.0).abs() < 0.01);

        let sample = chm.cca_sample(&txl, 1, &tuning(), SimTime::ZERO, &mut NullSink).unwrap();
        let mod_rssi = sample.mod_rssi.unwrap();
        assert!((mod_rssi.to_dbm() + 60.0).abs() < 1e-3);
    }

    #[test]
    fn test_average_rssi_is_linear() {
        let readings = [-60.0, -70.0, -80.0].map(RssiValue::from_dbm);
        let sum: f64 = readings.iter().map(|r| rssi_to_mw(*r)).sum();
        let avg = average_rssi(sum, 3);
        let expected = 10.0 * ((1e-6 + 1e-7 + 1e-8) / 3.0f64).log10();
        assert!((avg.to_dbm() - expected).abs() < 1e-4);
        assert_eq!(average_rssi(0.0, 0), RssiValue::MIN);
    }
}
