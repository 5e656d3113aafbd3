//! Dynamic loading of external channel and modem models.
//!
//! A channel library must export `channel_init`, `channel_calc` and
//! `channel_delete`. A modem library must export `modem_init`,
//! `modem_analog_rx`, `modem_digital_perf_ber`, `modem_digital_perf_sync`,
//! `modem_digital_RSSI` and `modem_delete`. Every symbol is resolved at load
//! time; a missing one is an error.
//!
//! Transmissions are passed as a flat array of [`FfiTx`], one entry per
//! device, with `state == 0` for silent devices.

use crate::{AnalogRx, ChannelModel, ModelArgs, ModelError, ModemModel};
use libloading::Library;
use p2g4_common::{Probability, RadioParams, RssiValue, SimTime, TxList, TxV2};
use std::ffi::{c_char, c_int, c_uint, c_void, CString};
use std::path::Path;
use std::sync::Arc;

// ============================================================================
// FFI Types
// ============================================================================

/// Transmission as seen by an external model.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FfiTx {
    pub start_tx_time: u64,
    pub end_tx_time: u64,
    pub start_packet_time: u64,
    pub end_packet_time: u64,
    pub phy_address: u64,
    pub modulation: u16,
    pub center_freq: u16,
    pub power_level: i16,
    pub packet_size: u16,
    pub coding_rate: u16,
    /// Activity bitmask, 0 when the device is not transmitting.
    pub state: u8,
    _padding: u8,
}

impl FfiTx {
    fn from_tx(tx: &TxV2, state: u8) -> Self {
        Self {
            start_tx_time: tx.start_tx_time.as_micros(),
            end_tx_time: tx.end_tx_time.as_micros(),
            start_packet_time: tx.start_packet_time.as_micros(),
            end_packet_time: tx.end_packet_time.as_micros(),
            phy_address: tx.phy_address,
            modulation: tx.radio_params.modulation.0,
            center_freq: tx.radio_params.center_freq.0,
            power_level: tx.power_level.0,
            packet_size: tx.packet_size,
            coding_rate: tx.coding_rate,
            state,
            _padding: 0,
        }
    }
}

/// Receiver radio parameters as seen by an external model.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FfiRadio {
    pub modulation: u16,
    pub center_freq: u16,
}

impl From<&RadioParams> for FfiRadio {
    fn from(p: &RadioParams) -> Self {
        Self {
            modulation: p.modulation.0,
            center_freq: p.center_freq.0,
        }
    }
}

/// Snapshot the registry into `out`, one entry per device.
fn flatten(txl: &TxList, out: &mut Vec<FfiTx>) {
    out.clear();
    out.extend((0..txl.len()).map(|d| {
        let slot = txl.slot(d);
        FfiTx::from_tx(&slot.tx, slot.state.bits())
    }));
}

fn index_arg(d: Option<usize>) -> c_int {
    d.map_or(-1, |d| d as c_int)
}

// ============================================================================
// Function Types
// ============================================================================

type FnChannelInit = unsafe extern "C" fn(c_int, *const *const c_char, c_uint) -> *mut c_void;
type FnChannelCalc =
    unsafe extern "C" fn(*mut c_void, *const FfiTx, c_uint, c_int, c_uint, u64, *mut f64, *mut f64) -> c_int;
type FnChannelDelete = unsafe extern "C" fn(*mut c_void);

type FnModemInit = unsafe extern "C" fn(c_int, *const *const c_char, c_uint, c_uint) -> *mut c_void;
type FnModemAnalogRx = unsafe extern "C" fn(
    *mut c_void,
    *const FfiRadio,
    *const FfiTx,
    c_uint,
    c_int,
    *const f64,
    *mut f64,
    *mut f64,
) -> c_int;
type FnModemDigitalPerfBer = unsafe extern "C" fn(*mut c_void, *const FfiRadio, f64) -> u32;
type FnModemDigitalPerfSync = unsafe extern "C" fn(*mut c_void, *const FfiRadio, f64, *const FfiTx) -> u32;
type FnModemDigitalRssi = unsafe extern "C" fn(*mut c_void, *const FfiRadio, f64, *mut i32);
type FnModemDelete = unsafe extern "C" fn(*mut c_void);

/// NUL-terminated copies of the arguments, kept alive for the plugin.
struct CArgs {
    _owned: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl CArgs {
    fn new(name: &str, args: &[String]) -> Result<Self, ModelError> {
        let owned = args
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ModelError::InvalidArgs {
                model: name.to_string(),
                message: e.to_string(),
            })?;
        let ptrs = owned.iter().map(|c| c.as_ptr()).collect();
        Ok(Self { _owned: owned, ptrs })
    }
}

fn resolve<T: Copy>(library: &Library, path: &Path, symbol: &'static str) -> Result<T, ModelError> {
    // SAFETY: the caller names the symbol with the signature documented for
    // model libraries.
    unsafe {
        library
            .get::<T>(symbol.as_bytes())
            .map(|s| *s)
            .map_err(|_| ModelError::SymbolNotFound {
                symbol,
                library: path.display().to_string(),
            })
    }
}

// ============================================================================
// DynChannel
// ============================================================================

/// A channel model living in a shared library.
pub struct DynChannel {
    _library: Arc<Library>,
    name: String,
    handle: *mut c_void,
    calc: FnChannelCalc,
    delete: FnChannelDelete,
    txs: Vec<FfiTx>,
}

impl DynChannel {
    /// Load the library at `path` and initialize one channel instance.
    pub fn load(path: &Path, name: &str, args: &ModelArgs<'_>) -> Result<Self, ModelError> {
        // SAFETY: loading runs the library's initializers; model libraries are
        // trusted by whoever configured the simulation.
        let library = unsafe { Library::new(path)? };
        let init: FnChannelInit = resolve(&library, path, "channel_init")?;
        let calc: FnChannelCalc = resolve(&library, path, "channel_calc")?;
        let delete: FnChannelDelete = resolve(&library, path, "channel_delete")?;

        let cargs = CArgs::new(name, args.args)?;
        // SAFETY: argv points to `argc` valid C strings that outlive the call.
        let handle = unsafe { init(cargs.ptrs.len() as c_int, cargs.ptrs.as_ptr(), args.n_devs as c_uint) };
        if handle.is_null() {
            return Err(ModelError::PluginFailed {
                name: name.to_string(),
                message: "channel_init returned NULL".to_string(),
            });
        }

        Ok(Self {
            _library: Arc::new(library),
            name: name.to_string(),
            handle,
            calc,
            delete,
            txs: Vec::with_capacity(args.n_devs),
        })
    }
}

impl ChannelModel for DynChannel {
    fn calc(
        &mut self,
        txl: &TxList,
        tx_nbr: Option<usize>,
        rx_nbr: usize,
        now: SimTime,
        att: &mut [f64],
    ) -> Result<f64, ModelError> {
        flatten(txl, &mut self.txs);
        let mut isi = 0.0;
        // SAFETY: `txs` and `att` hold one entry per device and stay borrowed
        // for the duration of the call.
        let rc = unsafe {
            (self.calc)(
                self.handle,
                self.txs.as_ptr(),
                self.txs.len() as c_uint,
                index_arg(tx_nbr),
                rx_nbr as c_uint,
                now.as_micros(),
                att.as_mut_ptr(),
                &mut isi,
            )
        };
        if rc != 0 {
            return Err(ModelError::PluginFailed {
                name: self.name.clone(),
                message: format!("channel_calc returned {}", rc),
            });
        }
        Ok(isi)
    }
}

impl Drop for DynChannel {
    fn drop(&mut self) {
        // SAFETY: handle came from channel_init and is released exactly once.
        unsafe { (self.delete)(self.handle) }
    }
}

// ============================================================================
// DynModem
// ============================================================================

/// A modem model living in a shared library.
pub struct DynModem {
    _library: Arc<Library>,
    name: String,
    handle: *mut c_void,
    analog_rx: FnModemAnalogRx,
    perf_ber: FnModemDigitalPerfBer,
    perf_sync: FnModemDigitalPerfSync,
    rssi: FnModemDigitalRssi,
    delete: FnModemDelete,
    txs: Vec<FfiTx>,
}

impl DynModem {
    /// Load the library at `path` and initialize the modem of one device.
    pub fn load(path: &Path, name: &str, args: &ModelArgs<'_>) -> Result<Self, ModelError> {
        // SAFETY: see DynChannel::load.
        let library = unsafe { Library::new(path)? };
        let init: FnModemInit = resolve(&library, path, "modem_init")?;
        let analog_rx: FnModemAnalogRx = resolve(&library, path, "modem_analog_rx")?;
        let perf_ber: FnModemDigitalPerfBer = resolve(&library, path, "modem_digital_perf_ber")?;
        let perf_sync: FnModemDigitalPerfSync = resolve(&library, path, "modem_digital_perf_sync")?;
        let rssi: FnModemDigitalRssi = resolve(&library, path, "modem_digital_RSSI")?;
        let delete: FnModemDelete = resolve(&library, path, "modem_delete")?;

        let cargs = CArgs::new(name, args.args)?;
        // SAFETY: argv points to `argc` valid C strings that outlive the call.
        let handle = unsafe {
            init(
                cargs.ptrs.len() as c_int,
                cargs.ptrs.as_ptr(),
                args.dev_nbr as c_uint,
                args.n_devs as c_uint,
            )
        };
        if handle.is_null() {
            return Err(ModelError::PluginFailed {
                name: name.to_string(),
                message: "modem_init returned NULL".to_string(),
            });
        }

        Ok(Self {
            _library: Arc::new(library),
            name: name.to_string(),
            handle,
            analog_rx,
            perf_ber,
            perf_sync,
            rssi,
            delete,
            txs: Vec::with_capacity(args.n_devs),
        })
    }
}

impl ModemModel for DynModem {
    fn analog_rx(
        &mut self,
        rx_radio: &RadioParams,
        rx_powers: &[f64],
        txl: &TxList,
        desired: Option<usize>,
    ) -> Result<AnalogRx, ModelError> {
        flatten(txl, &mut self.txs);
        let radio = FfiRadio::from(rx_radio);
        let mut out = AnalogRx {
            snr: 0.0,
            rssi_power: 0.0,
        };
        // SAFETY: all pointers reference live buffers sized for the device count.
        let rc = unsafe {
            (self.analog_rx)(
                self.handle,
                &radio,
                self.txs.as_ptr(),
                self.txs.len() as c_uint,
                index_arg(desired),
                rx_powers.as_ptr(),
                &mut out.snr,
                &mut out.rssi_power,
            )
        };
        if rc != 0 {
            return Err(ModelError::PluginFailed {
                name: self.name.clone(),
                message: format!("modem_analog_rx returned {}", rc),
            });
        }
        Ok(out)
    }

    fn digital_perf_ber(&mut self, rx_radio: &RadioParams, snr: f64) -> Result<Probability, ModelError> {
        let radio = FfiRadio::from(rx_radio);
        // SAFETY: `radio` outlives the call.
        Ok(unsafe { (self.perf_ber)(self.handle, &radio, snr) })
    }

    fn digital_perf_sync(&mut self, rx_radio: &RadioParams, snr: f64, tx: &TxV2) -> Result<Probability, ModelError> {
        let radio = FfiRadio::from(rx_radio);
        let ffi_tx = FfiTx::from_tx(tx, 0);
        // SAFETY: `radio` and `ffi_tx` outlive the call.
        Ok(unsafe { (self.perf_sync)(self.handle, &radio, snr, &ffi_tx) })
    }

    fn digital_rssi(&mut self, rx_radio: &RadioParams, rssi_power: f64) -> Result<RssiValue, ModelError> {
        let radio = FfiRadio::from(rx_radio);
        let mut rssi = 0i32;
        // SAFETY: `radio` and `rssi` outlive the call.
        unsafe { (self.rssi)(self.handle, &radio, rssi_power, &mut rssi) };
        Ok(RssiValue(rssi))
    }
}

impl Drop for DynModem {
    fn drop(&mut self) {
        // SAFETY: handle came from modem_init and is released exactly once.
        unsafe { (self.delete)(self.handle) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2g4_common::{Freq, Modulation, Power};

    #[test]
    fn test_missing_library_fails() {
        let err = DynChannel::load(Path::new("/nonexistent/lib_2G4Channel_X.so"), "X", &ModelArgs::channel(&[], 2));
        assert!(matches!(err, Err(ModelError::Load(_))));
    }

    #[test]
    fn test_flatten_marks_silent_devices() {
        let mut txl = TxList::new(2);
        let tx = TxV2 {
            phy_address: 0xAA,
            power_level: Power::from_dbm(2.0),
            radio_params: RadioParams {
                modulation: Modulation::BLE1M,
                center_freq: Freq(512),
            },
            ..Default::default()
        };
        txl.register(1, tx, Vec::new());
        txl.start_carrier(1);

        let mut out = Vec::new();
        flatten(&txl, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].state, 0);
        assert_eq!(out[1].state, 1);
        assert_eq!(out[1].phy_address, 0xAA);
        assert_eq!(out[1].center_freq, 512);
        assert_eq!(out[1].power_level, 512);
    }

    #[test]
    fn test_c_args_reject_interior_nul() {
        assert!(CArgs::new("m", &["ok".to_string()]).is_ok());
        assert!(CArgs::new("m", &["bad\0arg".to_string()]).is_err());
    }
}
