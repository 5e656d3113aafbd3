//! Built-in modem models.

use crate::{AnalogRx, ModelArgs, ModelError, ModemModel};
use clap::Parser;
use p2g4_common::{dbm_to_mw, mw_to_dbm, prob_from_f64, Probability, RadioParams, RssiValue, TxList, TxV2, PROB_ONE};

/// Default receiver noise floor (dBm).
pub const DEFAULT_NOISE_FLOOR_DBM: f64 = -100.0;

/// Interferer rejection as a function of the frequency offset (MHz).
///
/// Co-channel signals count fully; signals more than 3 MHz away are ignored.
fn adjacent_rejection_db(offset_mhz: f64) -> Option<f64> {
    let offset = offset_mhz.abs();
    if offset < 0.5 {
        Some(0.0)
    } else if offset <= 1.0 {
        Some(30.0)
    } else if offset <= 3.0 {
        Some(50.0)
    } else {
        None
    }
}

/// Compute SNR of `desired` and total in-band power, with rejection applied
/// to every other carrier.
fn sum_powers(
    rx_radio: &RadioParams,
    rx_powers: &[f64],
    txl: &TxList,
    desired: Option<usize>,
    noise_floor_dbm: f64,
    co_channel_only: bool,
) -> AnalogRx {
    let noise_mw = dbm_to_mw(noise_floor_dbm);
    let mut interference_mw = 0.0;
    let mut total_mw = noise_mw;
    let mut desired_dbm = f64::NEG_INFINITY;

    for (i, slot) in txl.active() {
        let offset = slot.tx.radio_params.center_freq.mhz_offset() - rx_radio.center_freq.mhz_offset();
        let rejection = match adjacent_rejection_db(offset) {
            Some(r) if !co_channel_only || r == 0.0 => r,
            _ => continue,
        };
        let p_dbm = rx_powers[i] - rejection;
        let p_mw = dbm_to_mw(p_dbm);
        total_mw += p_mw;
        if Some(i) == desired {
            desired_dbm = p_dbm;
        } else {
            interference_mw += p_mw;
        }
    }

    AnalogRx {
        snr: desired_dbm - mw_to_dbm(interference_mw + noise_mw),
        rssi_power: mw_to_dbm(total_mw),
    }
}

#[derive(Parser, Debug)]
#[command(name = "Magic", no_binary_name = true)]
struct MagicArgs {
    /// Noise floor in dBm
    #[arg(long = "nf", default_value_t = DEFAULT_NOISE_FLOOR_DBM)]
    noise_floor: f64,

    /// SNR (dB) at or above which reception is perfect
    #[arg(long = "snr-threshold", default_value_t = Magic::DEFAULT_SNR_THRESHOLD_DB)]
    snr_threshold: f64,
}

/// Threshold modem: error free above an SNR threshold, useless below it.
///
/// Only co-channel signals interfere.
#[derive(Debug, Clone)]
pub struct Magic {
    noise_floor_dbm: f64,
    snr_threshold_db: f64,
}

impl Magic {
    /// Default SNR threshold.
    pub const DEFAULT_SNR_THRESHOLD_DB: f64 = 6.0;

    /// Create with explicit parameters.
    pub fn new(noise_floor_dbm: f64, snr_threshold_db: f64) -> Self {
        Self {
            noise_floor_dbm,
            snr_threshold_db,
        }
    }

    /// Construct from command-line style arguments.
    pub fn from_args(args: &ModelArgs<'_>) -> Result<Self, ModelError> {
        let parsed = MagicArgs::try_parse_from(args.args).map_err(|e| ModelError::InvalidArgs {
            model: "Magic".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::new(parsed.noise_floor, parsed.snr_threshold))
    }
}

impl Default for Magic {
    fn default() -> Self {
        Self::new(DEFAULT_NOISE_FLOOR_DBM, Self::DEFAULT_SNR_THRESHOLD_DB)
    }
}

impl ModemModel for Magic {
    fn analog_rx(
        &mut self,
        rx_radio: &RadioParams,
        rx_powers: &[f64],
        txl: &TxList,
        desired: Option<usize>,
    ) -> Result<AnalogRx, ModelError> {
        Ok(sum_powers(rx_radio, rx_powers, txl, desired, self.noise_floor_dbm, true))
    }

    fn digital_perf_ber(&mut self, _rx_radio: &RadioParams, snr: f64) -> Result<Probability, ModelError> {
        Ok(if snr >= self.snr_threshold_db { 0 } else { PROB_ONE / 2 })
    }

    fn digital_perf_sync(&mut self, _rx_radio: &RadioParams, snr: f64, _tx: &TxV2) -> Result<Probability, ModelError> {
        Ok(if snr >= self.snr_threshold_db { PROB_ONE } else { 0 })
    }

    fn digital_rssi(&mut self, _rx_radio: &RadioParams, rssi_power: f64) -> Result<RssiValue, ModelError> {
        Ok(RssiValue::from_dbm(rssi_power))
    }
}

#[derive(Parser, Debug)]
#[command(name = "BLE_simple", no_binary_name = true)]
struct BleSimpleArgs {
    /// Noise floor in dBm
    #[arg(long = "nf", default_value_t = DEFAULT_NOISE_FLOOR_DBM)]
    noise_floor: f64,

    /// Implementation loss in dB subtracted from the SNR
    #[arg(long = "loss", default_value_t = 0.0)]
    implementation_loss: f64,
}

/// Non-coherent FSK modem with simple adjacent channel rejection.
#[derive(Debug, Clone)]
pub struct BleSimple {
    noise_floor_dbm: f64,
    implementation_loss_db: f64,
}

impl BleSimple {
    /// Preamble plus access address bits that must be error free to sync.
    pub const SYNC_BITS: i32 = 40;

    /// Construct from command-line style arguments.
    pub fn from_args(args: &ModelArgs<'_>) -> Result<Self, ModelError> {
        let parsed = BleSimpleArgs::try_parse_from(args.args).map_err(|e| ModelError::InvalidArgs {
            model: "BLE_simple".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            noise_floor_dbm: parsed.noise_floor,
            implementation_loss_db: parsed.implementation_loss,
        })
    }

    fn ber(&self, snr: f64) -> f64 {
        let snr_lin = 10f64.powf((snr - self.implementation_loss_db) / 10.0);
        0.5 * (-snr_lin / 2.0).exp()
    }
}

impl ModemModel for BleSimple {
    fn analog_rx(
        &mut self,
        rx_radio: &RadioParams,
        rx_powers: &[f64],
        txl: &TxList,
        desired: Option<usize>,
    ) -> Result<AnalogRx, ModelError> {
        Ok(sum_powers(rx_radio, rx_powers, txl, desired, self.noise_floor_dbm, false))
    }

    fn digital_perf_ber(&mut self, _rx_radio: &RadioParams, snr: f64) -> Result<Probability, ModelError> {
        Ok(prob_from_f64(self.ber(snr)))
    }

    fn digital_perf_sync(&mut self, _rx_radio: &RadioParams, snr: f64, _tx: &TxV2) -> Result<Probability, ModelError> {
        Ok(prob_from_f64((1.0 - self.ber(snr)).powi(Self::SYNC_BITS)))
    }

    fn digital_rssi(&mut self, _rx_radio: &RadioParams, rssi_power: f64) -> Result<RssiValue, ModelError> {
        Ok(RssiValue::from_dbm(rssi_power))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2g4_common::{Freq, Modulation, Power, SimTime};

    fn radio(freq: u16) -> RadioParams {
        RadioParams {
            modulation: Modulation::BLE1M,
            center_freq: Freq(freq),
        }
    }

    fn air(freqs: &[u16]) -> TxList {
        let mut txl = TxList::new(freqs.len());
        for (d, &f) in freqs.iter().enumerate() {
            let tx = TxV2 {
                end_tx_time: SimTime::from_micros(100),
                radio_params: radio(f),
                power_level: Power::from_dbm(0.0),
                ..Default::default()
            };
            txl.register(d, tx, Vec::new());
            txl.start_carrier(d);
        }
        txl
    }

    #[test]
    fn test_magic_clean_link() {
        let txl = air(&[512]);
        let mut modem = Magic::default();
        let rx = radio(512);
        let analog = modem.analog_rx(&rx, &[-60.0], &txl, Some(0)).unwrap();
        assert!((analog.snr - 40.0).abs() < 1e-6);
        assert_eq!(modem.digital_perf_ber(&rx, analog.snr).unwrap(), 0);
        assert_eq!(modem.digital_perf_sync(&rx, analog.snr, &TxV2::default()).unwrap(), PROB_ONE);
    }

    #[test]
    fn test_magic_collision() {
        let txl = air(&[512, 512]);
        let mut modem = Magic::default();
        let rx = radio(512);
        let analog = modem.analog_rx(&rx, &[-60.0, -61.0], &txl, Some(0)).unwrap();
        assert!(analog.snr < Magic::DEFAULT_SNR_THRESHOLD_DB);
        assert_eq!(modem.digital_perf_sync(&rx, analog.snr, &TxV2::default()).unwrap(), 0);
    }

    #[test]
    fn test_magic_ignores_other_channels() {
        let txl = air(&[512, 768]);
        let mut modem = Magic::default();
        let analog = modem.analog_rx(&radio(512), &[-60.0, -20.0], &txl, Some(0)).unwrap();
        assert!((analog.snr - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_rssi_power_sums_noise_and_signals() {
        let txl = air(&[512]);
        let mut modem = Magic::default();
        let analog = modem.analog_rx(&radio(512), &[-100.0], &txl, None).unwrap();
        assert!((analog.rssi_power - (-100.0 + 10.0 * 2f64.log10())).abs() < 1e-9);
    }

    #[test]
    fn test_ble_simple_ber_falls_with_snr() {
        let args: Vec<String> = Vec::new();
        let mut modem = BleSimple::from_args(&ModelArgs::modem(&args, 0, 1)).unwrap();
        let rx = radio(512);
        let low = modem.digital_perf_ber(&rx, 0.0).unwrap();
        let high = modem.digital_perf_ber(&rx, 20.0).unwrap();
        assert!(high < low);
        assert!(modem.digital_perf_sync(&rx, 20.0, &TxV2::default()).unwrap() > PROB_ONE / 2);
    }

    #[test]
    fn test_ble_simple_adjacent_channel_rejection() {
        let txl = air(&[512, 768]);
        let args: Vec<String> = Vec::new();
        let mut modem = BleSimple::from_args(&ModelArgs::modem(&args, 0, 2)).unwrap();
        let analog = modem.analog_rx(&radio(512), &[-60.0, -60.0], &txl, Some(0)).unwrap();
        // -90 dBm after rejection on top of a -100 dBm noise floor
        assert!(analog.snr > 29.5 && analog.snr < 30.0);
    }
}
