//! End-to-end tests of the engine against scripted devices.
//!
//! Every device follows a fixed list of requests. Responses are recorded so
//! the tests can check exactly what each device would have observed.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use p2g4_common::trace::{RxRecord, TxRecord};
use p2g4_common::{
    AbortParams, CcaRequest, Freq, Modulation, NullSink, Power, Probability, RadioParams, RssiRequest, RssiValue,
    RxStatus, RxV1, RxV2, SimTime, TraceError, TraceSink, TxList, TxV1, TxV2, WaitRequest, PROB_ONE,
};
use p2g4_models::channel::NtNcable;
use p2g4_models::{AnalogRx, BitErrorRng, ChannelModem, ModelError, ModemModel};
use p2g4_phy::{DeviceLink, LinkError, Phy, PhyConfig, PhyError, Request, Response};

// ============================================================================
// Test Doubles
// ============================================================================

/// Devices replaying a fixed script. A device whose script ran out
/// disconnects.
struct ScriptedLink {
    scripts: Vec<VecDeque<Request>>,
    sent: Vec<Vec<Response>>,
    connected: Vec<bool>,
}

impl ScriptedLink {
    fn new(scripts: Vec<Vec<Request>>) -> Self {
        let n = scripts.len();
        Self {
            scripts: scripts.into_iter().map(VecDeque::from).collect(),
            sent: vec![Vec::new(); n],
            connected: vec![true; n],
        }
    }
}

impl DeviceLink for ScriptedLink {
    fn recv(&mut self, device: usize) -> Result<Request, LinkError> {
        if !self.connected[device] {
            return Err(LinkError::NotConnected(device));
        }
        Ok(self.scripts[device].pop_front().unwrap_or(Request::Disconnect))
    }

    fn send(&mut self, device: usize, response: Response) -> Result<(), LinkError> {
        if !self.connected[device] {
            return Err(LinkError::NotConnected(device));
        }
        self.sent[device].push(response);
        Ok(())
    }

    fn disconnect(&mut self, device: usize) {
        self.connected[device] = false;
    }

    fn terminate_all(&mut self) {
        self.connected.fill(false);
    }
}

/// Error-free receiver: perfect sync, no bit errors, RSSI equal to the
/// strongest input (or a -100 dBm floor).
#[derive(Default)]
struct PerfectModem;

impl ModemModel for PerfectModem {
    fn analog_rx(
        &mut self,
        _rx_radio: &RadioParams,
        rx_powers: &[f64],
        _txl: &TxList,
        _desired: Option<usize>,
    ) -> Result<AnalogRx, ModelError> {
        let strongest = rx_powers.iter().copied().fold(-100.0, f64::max);
        Ok(AnalogRx {
            snr: 100.0,
            rssi_power: strongest,
        })
    }

    fn digital_perf_ber(&mut self, _rx_radio: &RadioParams, _snr: f64) -> Result<Probability, ModelError> {
        Ok(0)
    }

    fn digital_perf_sync(&mut self, _rx_radio: &RadioParams, _snr: f64, _tx: &TxV2) -> Result<Probability, ModelError> {
        Ok(PROB_ONE)
    }

    fn digital_rssi(&mut self, _rx_radio: &RadioParams, rssi_power: f64) -> Result<RssiValue, ModelError> {
        Ok(RssiValue::from_dbm(rssi_power))
    }
}

/// Error-free for its first `clean_ber_calls` BER evaluations, then every
/// bit is wrong. Sync succeeds with probability `sync`.
struct DegradingModem {
    clean_ber_calls: u32,
    sync: Probability,
}

impl ModemModel for DegradingModem {
    fn analog_rx(
        &mut self,
        _rx_radio: &RadioParams,
        _rx_powers: &[f64],
        _txl: &TxList,
        _desired: Option<usize>,
    ) -> Result<AnalogRx, ModelError> {
        Ok(AnalogRx {
            snr: 100.0,
            rssi_power: -100.0,
        })
    }

    fn digital_perf_ber(&mut self, _rx_radio: &RadioParams, _snr: f64) -> Result<Probability, ModelError> {
        if self.clean_ber_calls > 0 {
            self.clean_ber_calls -= 1;
            Ok(0)
        } else {
            Ok(PROB_ONE)
        }
    }

    fn digital_perf_sync(&mut self, _rx_radio: &RadioParams, _snr: f64, _tx: &TxV2) -> Result<Probability, ModelError> {
        Ok(self.sync)
    }

    fn digital_rssi(&mut self, _rx_radio: &RadioParams, rssi_power: f64) -> Result<RssiValue, ModelError> {
        Ok(RssiValue::from_dbm(rssi_power))
    }
}

/// Reports a scripted sequence of RSSI readings.
struct ScriptedRssiModem {
    readings: VecDeque<f64>,
}

impl ModemModel for ScriptedRssiModem {
    fn analog_rx(
        &mut self,
        _rx_radio: &RadioParams,
        _rx_powers: &[f64],
        _txl: &TxList,
        _desired: Option<usize>,
    ) -> Result<AnalogRx, ModelError> {
        Ok(AnalogRx {
            snr: 100.0,
            rssi_power: -100.0,
        })
    }

    fn digital_perf_ber(&mut self, _rx_radio: &RadioParams, _snr: f64) -> Result<Probability, ModelError> {
        Ok(0)
    }

    fn digital_perf_sync(&mut self, _rx_radio: &RadioParams, _snr: f64, _tx: &TxV2) -> Result<Probability, ModelError> {
        Ok(PROB_ONE)
    }

    fn digital_rssi(&mut self, _rx_radio: &RadioParams, _rssi_power: f64) -> Result<RssiValue, ModelError> {
        let dbm = self.readings.pop_front().unwrap_or(-100.0);
        Ok(RssiValue::from_dbm(dbm))
    }
}

/// Records the order in which transmissions and receptions complete.
#[derive(Clone, Default)]
struct OrderSink {
    tx_done: Rc<RefCell<Vec<usize>>>,
    rx_done: Rc<RefCell<Vec<(usize, Option<usize>, usize)>>>,
}

impl TraceSink for OrderSink {
    fn tx(&mut self, rec: &TxRecord<'_>) -> Result<(), TraceError> {
        self.tx_done.borrow_mut().push(rec.device);
        Ok(())
    }

    fn rx(&mut self, rec: &RxRecord<'_>) -> Result<(), TraceError> {
        self.rx_done.borrow_mut().push((rec.device, rec.tx_nbr, rec.packet.len()));
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

const ADDRESS: u64 = 0x8E89_BED6;

fn t(us: u64) -> SimTime {
    SimTime::from_micros(us)
}

fn radio() -> RadioParams {
    RadioParams {
        modulation: Modulation::BLE1M,
        center_freq: Freq(512),
    }
}

fn perfect_phy(scripts: Vec<Vec<Request>>, sink: Box<dyn TraceSink>) -> Phy<ScriptedLink> {
    let n = scripts.len();
    let modems: Vec<Box<dyn ModemModel>> = (0..n).map(|_| Box::new(PerfectModem) as Box<dyn ModemModel>).collect();
    let chm = ChannelModem::new(Box::new(NtNcable::uniform(n, 60.0)), modems, BitErrorRng::new(1));
    Phy::new(PhyConfig::new(n), chm, ScriptedLink::new(scripts), sink)
}

/// Perfect modems everywhere except on the receiving device 1.
fn degraded_phy(
    cfg: PhyConfig,
    scripts: Vec<Vec<Request>>,
    rx_modem: DegradingModem,
    sink: Box<dyn TraceSink>,
) -> Phy<ScriptedLink> {
    let n = scripts.len();
    let mut modems: Vec<Box<dyn ModemModel>> =
        (0..n).map(|_| Box::new(PerfectModem) as Box<dyn ModemModel>).collect();
    modems[1] = Box::new(rx_modem);
    let chm = ChannelModem::new(Box::new(NtNcable::uniform(n, 60.0)), modems, BitErrorRng::new(1));
    Phy::new(cfg, chm, ScriptedLink::new(scripts), sink)
}

fn tx_request(start: u64, end: u64, payload: &[u8]) -> Request {
    let tx = TxV2 {
        start_tx_time: t(start),
        end_tx_time: t(end),
        start_packet_time: t(start),
        end_packet_time: t(end),
        phy_address: ADDRESS,
        radio_params: radio(),
        power_level: Power::from_dbm(0.0),
        packet_size: payload.len() as u16,
        ..Default::default()
    };
    Request::TxV2(tx, payload.to_vec())
}

fn rx_request(start: u64, scan: u32) -> RxV2 {
    RxV2 {
        start_time: t(start),
        scan_duration: scan,
        pream_and_addr_duration: 40,
        header_duration: 16,
        sync_threshold: 2,
        header_threshold: 0,
        radio_params: radio(),
        addresses: vec![ADDRESS],
        ..Default::default()
    }
}

fn rx_done(resp: &Response) -> p2g4_common::RxDoneV2 {
    match resp {
        Response::RxDoneV2(done) => *done,
        other => panic!("expected RxDoneV2, got {:?}", other),
    }
}

// ============================================================================
// Reception
// ============================================================================

#[test]
fn test_rx_of_whole_packet() {
    let payload = [1, 2, 3, 4];
    let sink = OrderSink::default();
    let mut phy = perfect_phy(
        vec![
            vec![tx_request(100, 1000, &payload)],
            vec![Request::RxV2(rx_request(0, 5000)), Request::RxV2Cont(None)],
        ],
        Box::new(sink.clone()),
    );
    let stats = phy.run().unwrap();

    let sent = &phy.link().sent;
    assert_eq!(sent[0], vec![Response::TxDone(p2g4_common::TxDone { end_time: t(1000) })]);
    assert_eq!(sent[1].len(), 2);

    match &sent[1][0] {
        Response::RxAddressFoundV2(found, data) => {
            assert_eq!(found.status, RxStatus::InProgress);
            assert_eq!(found.rx_time_stamp, t(140));
            assert_eq!(found.end_time, t(139));
            assert_eq!(found.packet_size, 4);
            assert_eq!(found.phy_address, ADDRESS);
            assert!((found.rssi.to_dbm() + 60.0).abs() < 1e-3);
            assert_eq!(data.as_slice(), &payload);
        }
        other => panic!("expected address found, got {:?}", other),
    }

    let done = rx_done(&sent[1][1]);
    assert_eq!(done.status, RxStatus::Ok);
    assert_eq!(done.end_time, t(1000));
    assert_eq!(done.rx_time_stamp, t(140));
    assert_eq!(done.packet_size, 4);

    assert_eq!(*sink.rx_done.borrow(), vec![(1, Some(0), 4)]);
    assert_eq!(stats.rx_ok, 1);
    assert_eq!(stats.tx, 1);
    assert_eq!(stats.end_time, t(1000));
}

#[test]
fn test_rx_without_transmitter_times_out() {
    let mut phy = perfect_phy(
        vec![
            vec![Request::Wait(WaitRequest { end: t(200) })],
            vec![Request::RxV2(rx_request(0, 50))],
        ],
        Box::new(NullSink),
    );
    let stats = phy.run().unwrap();

    let sent = &phy.link().sent;
    assert_eq!(sent[1].len(), 1);
    let done = rx_done(&sent[1][0]);
    assert_eq!(done.status, RxStatus::NoSync);
    assert_eq!(done.end_time, t(50));
    assert_eq!(done.packet_size, 0);
    // Nothing on air: the noise floor.
    assert!((done.rssi.to_dbm() + 100.0).abs() < 1e-3);
    assert_eq!(stats.rx_nosync, 1);
    assert_eq!(sent[0], vec![Response::WaitDone]);
}

#[test]
fn test_packet_lost_during_sync() {
    let sink = OrderSink::default();
    let mut phy = perfect_phy(
        vec![
            // Packet ends before the 40 us preamble and address are over.
            vec![tx_request(100, 120, &[9; 2])],
            vec![Request::RxV2(rx_request(0, 300))],
        ],
        Box::new(sink.clone()),
    );
    phy.run().unwrap();

    let sent = &phy.link().sent;
    assert_eq!(sent[1].len(), 1, "no address may be reported: {:?}", sent[1]);
    let done = rx_done(&sent[1][0]);
    assert_eq!(done.status, RxStatus::NoSync);
    assert_eq!(done.end_time, t(300));
    assert_eq!(*sink.rx_done.borrow(), vec![(1, None, 0)]);
}

#[test]
fn test_rx_stop_after_address() {
    let mut phy = perfect_phy(
        vec![
            vec![tx_request(100, 1000, &[1, 2])],
            vec![Request::RxV2(rx_request(0, 5000)), Request::RxStop],
        ],
        Box::new(NullSink),
    );
    let stats = phy.run().unwrap();

    let sent = &phy.link().sent;
    // Only the address found answer, nothing after the stop.
    assert_eq!(sent[1].len(), 1);
    assert!(matches!(sent[1][0], Response::RxAddressFoundV2(..)));
    assert_eq!(stats.rx_stopped, 1);
}

#[test]
fn test_wrong_address_is_not_received() {
    let mut rx = rx_request(0, 500);
    rx.addresses = vec![0x1234];
    let mut phy = perfect_phy(
        vec![vec![tx_request(100, 400, &[1])], vec![Request::RxV2(rx)]],
        Box::new(NullSink),
    );
    phy.run().unwrap();

    let done = rx_done(&phy.link().sent[1][0]);
    assert_eq!(done.status, RxStatus::NoSync);
    assert_eq!(done.end_time, t(500));
}

#[test]
fn test_abort_on_last_scan_microsecond_keeps_scan_end() {
    let mut rx = rx_request(0, 50);
    rx.abort.abort_time = t(49);
    let mut phy = perfect_phy(
        vec![vec![Request::Wait(WaitRequest { end: t(200) })], vec![Request::RxV2(rx)]],
        Box::new(NullSink),
    );
    phy.run().unwrap();

    let done = rx_done(&phy.link().sent[1][0]);
    assert_eq!(done.status, RxStatus::NoSync);
    assert_eq!(done.end_time, t(50));
    // Not aborting at 50, so the closing RSSI is measured.
    assert!((done.rssi.to_dbm() + 100.0).abs() < 1e-3);
}

#[test]
fn test_forced_packet_duration_sets_payload_end() {
    let mut rx = rx_request(0, 5000);
    rx.forced_packet_duration = 200;
    let mut phy = perfect_phy(
        vec![
            vec![tx_request(100, 1000, &[1, 2])],
            vec![Request::RxV2(rx), Request::RxV2Cont(None)],
        ],
        Box::new(NullSink),
    );
    phy.run().unwrap();

    let done = rx_done(&phy.link().sent[1][1]);
    assert_eq!(done.status, RxStatus::Ok);
    // Sync end 139, header end 155, then 200 us of payload.
    assert_eq!(done.end_time, t(355));
}

#[test]
fn test_sync_fails_on_bit_errors() {
    let sink = OrderSink::default();
    let modem = DegradingModem {
        clean_ber_calls: 0,
        sync: PROB_ONE,
    };
    let mut phy = degraded_phy(
        PhyConfig::new(2),
        vec![vec![tx_request(100, 1000, &[1])], vec![Request::RxV2(rx_request(0, 300))]],
        modem,
        Box::new(sink.clone()),
    );
    let stats = phy.run().unwrap();

    let sent = &phy.link().sent[1];
    assert_eq!(sent.len(), 1, "no address may be reported: {:?}", sent);
    let done = rx_done(&sent[0]);
    assert_eq!(done.status, RxStatus::NoSync);
    assert_eq!(done.end_time, t(300));
    assert_eq!(stats.rx_nosync, 1);
    assert_eq!(*sink.rx_done.borrow(), vec![(1, None, 0)]);
}

#[test]
fn test_sync_refused_by_modem() {
    let modem = DegradingModem {
        clean_ber_calls: u32::MAX,
        sync: 0,
    };
    let mut phy = degraded_phy(
        PhyConfig::new(2),
        vec![vec![tx_request(100, 1000, &[1])], vec![Request::RxV2(rx_request(0, 300))]],
        modem,
        Box::new(NullSink),
    );
    phy.run().unwrap();

    let sent = &phy.link().sent[1];
    assert_eq!(sent.len(), 1);
    assert_eq!(rx_done(&sent[0]).status, RxStatus::NoSync);
}

#[test]
fn test_header_errors_end_reception() {
    // The address is clean; errors start with the header.
    let modem = DegradingModem {
        clean_ber_calls: 1,
        sync: PROB_ONE,
    };
    let mut phy = degraded_phy(
        PhyConfig::new(2),
        vec![
            vec![tx_request(100, 1000, &[1, 2, 3])],
            vec![Request::RxV2(rx_request(0, 5000)), Request::RxV2Cont(None)],
        ],
        modem,
        Box::new(NullSink),
    );
    let stats = phy.run().unwrap();

    let sent = &phy.link().sent[1];
    assert!(matches!(sent[0], Response::RxAddressFoundV2(..)));
    let done = rx_done(&sent[1]);
    assert_eq!(done.status, RxStatus::HeaderError);
    assert_eq!(done.end_time, t(155));
    assert_eq!(done.packet_size, 0);
    assert_eq!(stats.rx_header_error, 1);
}

/// Device 0 sends to device 1. Device 2's carrier on another channel
/// starting at 500 makes the receiver's link be evaluated again, which is
/// when its modem starts failing.
fn payload_error_run(crcerr_data: bool) -> (p2g4_common::RxDoneV2, p2g4_phy::PhyStats) {
    let modem = DegradingModem {
        clean_ber_calls: 2,
        sync: PROB_ONE,
    };
    let mut interferer = match tx_request(500, 600, &[0xAA]) {
        Request::TxV2(tx, _) => tx,
        _ => unreachable!(),
    };
    interferer.phy_address = 0x1;
    interferer.radio_params.center_freq = Freq(40 << 8);
    let cfg = PhyConfig {
        crcerr_data,
        ..PhyConfig::new(3)
    };
    let mut phy = degraded_phy(
        cfg,
        vec![
            vec![tx_request(100, 1000, &[1, 2, 3, 4])],
            vec![Request::RxV2(rx_request(0, 5000)), Request::RxV2Cont(None)],
            vec![Request::TxV2(interferer, vec![0xAA])],
        ],
        modem,
        Box::new(NullSink),
    );
    let stats = phy.run().unwrap();
    (rx_done(&phy.link().sent[1][1]), stats)
}

#[test]
fn test_payload_errors_give_crc_error() {
    let (done, stats) = payload_error_run(false);
    assert_eq!(done.status, RxStatus::PacketContentError);
    assert_eq!(done.end_time, t(1000));
    assert_eq!(done.packet_size, 0);
    assert_eq!(stats.rx_crc_error, 1);
}

#[test]
fn test_crcerr_data_keeps_packet_size() {
    let (done, _) = payload_error_run(true);
    assert_eq!(done.status, RxStatus::PacketContentError);
    assert_eq!(done.packet_size, 4);
}

fn slow_rx_request() -> RxV2 {
    RxV2 {
        // One error sample every 8 us.
        error_calc_rate: 125_000,
        ..rx_request(0, 5000)
    }
}

#[test]
fn test_slow_error_sampling_honours_abort() {
    let mut phy = perfect_phy(
        vec![
            vec![tx_request(100, 1000, &[1, 2])],
            vec![
                Request::RxV2(slow_rx_request()),
                Request::RxV2Cont(Some(AbortParams {
                    abort_time: t(205),
                    recheck_time: SimTime::NEVER,
                })),
            ],
        ],
        Box::new(NullSink),
    );
    phy.run().unwrap();

    let done = rx_done(&phy.link().sent[1][1]);
    assert_eq!(done.status, RxStatus::PacketContentError);
    assert_eq!(done.end_time, t(205));
}

#[test]
fn test_slow_error_sampling_honours_recheck() {
    let mut phy = perfect_phy(
        vec![
            vec![tx_request(100, 1000, &[1, 2])],
            vec![
                Request::RxV2(slow_rx_request()),
                Request::RxV2Cont(Some(AbortParams {
                    abort_time: SimTime::NEVER,
                    recheck_time: t(205),
                })),
                Request::AbortUpdate(AbortParams::default()),
            ],
        ],
        Box::new(NullSink),
    );
    phy.run().unwrap();

    let sent = &phy.link().sent[1];
    assert_eq!(sent.len(), 3, "{:?}", sent);
    assert_eq!(sent[1], Response::AbortReeval);
    let done = rx_done(&sent[2]);
    assert_eq!(done.status, RxStatus::Ok);
    assert_eq!(done.end_time, t(1000));
}

#[test]
fn test_v1_devices_see_v1_answers() {
    let tx = TxV1 {
        start_time: t(100),
        end_time: t(1000),
        phy_address: 0x1234,
        radio_params: radio(),
        power_level: Power::from_dbm(0.0),
        packet_size: 3,
        ..Default::default()
    };
    let rx = RxV1 {
        start_time: t(0),
        scan_duration: 5000,
        phy_address: 0x1234,
        radio_params: radio(),
        sync_threshold: 2,
        header_threshold: 0,
        pream_and_addr_duration: 40,
        header_duration: 16,
        bps: 1_000_000,
        ..Default::default()
    };
    let mut phy = perfect_phy(
        vec![
            vec![Request::TxV1(tx, vec![7, 8, 9])],
            vec![Request::RxV1(rx), Request::RxCont],
        ],
        Box::new(NullSink),
    );
    phy.run().unwrap();

    let sent = &phy.link().sent[1];
    assert_eq!(sent.len(), 2);
    match &sent[0] {
        Response::RxAddressFoundV1(found, data) => {
            assert_eq!(found.rx_time_stamp, t(140));
            assert_eq!(data, &vec![7, 8, 9]);
        }
        other => panic!("expected v1 address found, got {:?}", other),
    }
    match &sent[1] {
        Response::RxDoneV1(done) => {
            assert_eq!(done.status, RxStatus::Ok);
            assert_eq!(done.end_time, t(1000));
        }
        other => panic!("expected RxDoneV1, got {:?}", other),
    }
}

#[test]
fn test_v2_continue_on_v1_reception_is_fatal() {
    let rx = RxV1 {
        start_time: t(0),
        scan_duration: 5000,
        phy_address: ADDRESS as u32,
        radio_params: radio(),
        sync_threshold: 2,
        pream_and_addr_duration: 40,
        bps: 1_000_000,
        ..Default::default()
    };
    let mut phy = perfect_phy(
        vec![
            vec![tx_request(100, 1000, &[1])],
            vec![Request::RxV1(rx), Request::RxV2Cont(None)],
        ],
        Box::new(NullSink),
    );
    let err = phy.run().unwrap_err();
    assert!(matches!(err, PhyError::Protocol { device: 1, .. }), "{err}");
}

// ============================================================================
// Transmission
// ============================================================================

#[test]
fn test_simultaneous_transmissions_in_device_order() {
    let sink = OrderSink::default();
    let mut phy = perfect_phy(
        vec![
            vec![tx_request(100, 200, &[1])],
            vec![tx_request(100, 200, &[2])],
            vec![tx_request(100, 200, &[3])],
            vec![Request::RxV2(rx_request(0, 5000)), Request::RxV2Cont(None)],
        ],
        Box::new(sink.clone()),
    );
    phy.run().unwrap();
    assert_eq!(*sink.tx_done.borrow(), vec![0, 1, 2]);
    // The searching receiver locks onto the lowest device.
    assert_eq!(*sink.rx_done.borrow(), vec![(3, Some(0), 1)]);
}

#[test]
fn test_tx_abort_cuts_transmission() {
    let mut tx = match tx_request(100, 1000, &[1, 2, 3]) {
        Request::TxV2(tx, _) => tx,
        _ => unreachable!(),
    };
    tx.abort = AbortParams {
        abort_time: t(300),
        recheck_time: SimTime::NEVER,
    };
    let mut phy = perfect_phy(vec![vec![Request::TxV2(tx, vec![1, 2, 3])]], Box::new(NullSink));
    phy.run().unwrap();
    assert_eq!(
        phy.link().sent[0],
        vec![Response::TxDone(p2g4_common::TxDone { end_time: t(300) })]
    );
}

#[test]
fn test_tx_end_not_after_start_is_fatal() {
    let mut phy = perfect_phy(vec![vec![tx_request(100, 100, &[1])]], Box::new(NullSink));
    let err = phy.run().unwrap_err();
    assert!(matches!(err, PhyError::Protocol { device: 0, .. }));
}

#[test]
fn test_abort_in_the_past_is_fatal() {
    let mut tx = match tx_request(150, 300, &[1]) {
        Request::TxV2(tx, _) => tx,
        _ => unreachable!(),
    };
    tx.abort.abort_time = t(50);
    let mut phy = perfect_phy(
        vec![vec![Request::Wait(WaitRequest { end: t(100) }), Request::TxV2(tx, vec![1])]],
        Box::new(NullSink),
    );
    let err = phy.run().unwrap_err();
    match err {
        PhyError::Protocol { device, time, .. } => {
            assert_eq!(device, 0);
            assert_eq!(time, t(100));
        }
        other => panic!("unexpected error {other}"),
    }
    // The devices are still told to go away.
    assert!(phy.link().connected.iter().all(|c| !c));
}

// ============================================================================
// Abort re-evaluation
// ============================================================================

#[test]
fn test_abort_reevaluation_serves_immediate_rssi() {
    let mut rx = rx_request(0, 1000);
    rx.abort.recheck_time = t(50);
    let rssi = RssiRequest {
        meas_time: t(50),
        radio_params: radio(),
        antenna_gain: Power(0),
    };
    let mut phy = perfect_phy(
        vec![vec![
            Request::RxV2(rx),
            Request::ImmediateRssi(rssi),
            Request::AbortUpdate(AbortParams {
                abort_time: t(60),
                recheck_time: SimTime::NEVER,
            }),
        ]],
        Box::new(NullSink),
    );
    let stats = phy.run().unwrap();

    let sent = &phy.link().sent[0];
    assert_eq!(sent.len(), 3, "{:?}", sent);
    assert_eq!(sent[0], Response::AbortReeval);
    assert!(matches!(sent[1], Response::ImmediateRssiDone(_)));
    let done = rx_done(&sent[2]);
    assert_eq!(done.status, RxStatus::NoSync);
    assert_eq!(done.end_time, t(60));
    assert_eq!(stats.rssi, 1);
}

#[test]
fn test_abort_update_in_the_past_is_fatal() {
    let mut rx = rx_request(0, 1000);
    rx.abort.recheck_time = t(50);
    let mut phy = perfect_phy(
        vec![vec![
            Request::RxV2(rx),
            Request::AbortUpdate(AbortParams {
                abort_time: t(40),
                recheck_time: SimTime::NEVER,
            }),
        ]],
        Box::new(NullSink),
    );
    assert!(matches!(phy.run(), Err(PhyError::Protocol { device: 0, .. })));
}

#[test]
fn test_disconnect_during_reevaluation_retires_device() {
    let mut rx = rx_request(0, 1000);
    rx.abort.recheck_time = t(50);
    let mut phy = perfect_phy(
        vec![vec![Request::RxV2(rx), Request::Disconnect]],
        Box::new(NullSink),
    );
    let stats = phy.run().unwrap();
    assert_eq!(phy.link().sent[0], vec![Response::AbortReeval]);
    assert_eq!(stats.disconnects, 1);
    assert_eq!(stats.end_time, t(50));
}

// ============================================================================
// CCA, RSSI, wait, termination
// ============================================================================

#[test]
fn test_cca_averages_linear_power() {
    let modem = ScriptedRssiModem {
        readings: VecDeque::from(vec![-60.0, -70.0, -80.0]),
    };
    let chm = ChannelModem::new(
        Box::new(NtNcable::uniform(1, 60.0)),
        vec![Box::new(modem)],
        BitErrorRng::new(1),
    );
    let cca = CcaRequest {
        start_time: t(0),
        scan_duration: 30,
        scan_period: 10,
        rssi_threshold: RssiValue::from_dbm(-65.0),
        mod_threshold: RssiValue::from_dbm(-65.0),
        stop_when_found: 0,
        antenna_gain: Power(0),
        radio_params: radio(),
        abort: AbortParams::default(),
    };
    let link = ScriptedLink::new(vec![vec![Request::Cca(cca)]]);
    let mut phy = Phy::new(PhyConfig::new(1), chm, link, Box::new(NullSink));
    phy.run().unwrap();

    let done = match &phy.link().sent[0][0] {
        Response::CcaDone(done) => *done,
        other => panic!("expected CcaDone, got {:?}", other),
    };
    let expected = 10.0 * ((1e-6 + 1e-7 + 1e-8) / 3.0f64).log10();
    assert!((done.rssi_ave.to_dbm() - expected).abs() < 1e-3, "{}", done.rssi_ave.to_dbm());
    assert!((done.rssi_max.to_dbm() + 60.0).abs() < 1e-3);
    assert_eq!(done.end_time, t(20));
    assert!(done.rssi_overthreshold);
    assert!(!done.mod_found);
    assert_eq!(done.mod_rx_power, RssiValue::MIN);
}

#[test]
fn test_cca_stops_on_modulated_signal() {
    let cca = CcaRequest {
        start_time: t(150),
        scan_duration: 1000,
        scan_period: 10,
        rssi_threshold: RssiValue::from_dbm(-20.0),
        mod_threshold: RssiValue::from_dbm(-90.0),
        stop_when_found: p2g4_common::CCA_STOP_ON_MOD,
        antenna_gain: Power(0),
        radio_params: radio(),
        abort: AbortParams::default(),
    };
    let mut phy = perfect_phy(
        vec![vec![tx_request(100, 1000, &[1])], vec![Request::Cca(cca)]],
        Box::new(NullSink),
    );
    phy.run().unwrap();

    let done = match &phy.link().sent[1][0] {
        Response::CcaDone(done) => *done,
        other => panic!("expected CcaDone, got {:?}", other),
    };
    assert!(done.mod_found);
    assert!(!done.rssi_overthreshold);
    assert_eq!(done.end_time, t(150));
    assert!((done.mod_rx_power.to_dbm() + 60.0).abs() < 1e-3);
}

#[test]
fn test_cca_with_zero_period_is_fatal() {
    let cca = CcaRequest {
        scan_duration: 10,
        ..Default::default()
    };
    let mut phy = perfect_phy(vec![vec![Request::Cca(cca)]], Box::new(NullSink));
    assert!(matches!(phy.run(), Err(PhyError::Protocol { .. })));
}

#[test]
fn test_rssi_sees_ongoing_transmission() {
    let rssi = RssiRequest {
        meas_time: t(500),
        radio_params: radio(),
        antenna_gain: Power(0),
    };
    let mut phy = perfect_phy(
        vec![vec![tx_request(100, 1000, &[1])], vec![Request::Rssi(rssi)]],
        Box::new(NullSink),
    );
    phy.run().unwrap();
    match &phy.link().sent[1][0] {
        Response::RssiDone(done) => assert!((done.rssi.to_dbm() + 60.0).abs() < 1e-3),
        other => panic!("expected RssiDone, got {:?}", other),
    }
}

#[test]
fn test_terminate_ends_run() {
    let mut phy = perfect_phy(
        vec![
            vec![Request::Wait(WaitRequest { end: t(10) }), Request::Terminate],
            vec![Request::Wait(WaitRequest { end: t(1_000_000) })],
        ],
        Box::new(NullSink),
    );
    let stats = phy.run().unwrap();
    assert_eq!(stats.end_time, t(10));
    assert!(phy.link().sent[1].is_empty());
}

#[test]
fn test_sim_length_bounds_run() {
    let scripts = vec![vec![Request::Wait(WaitRequest { end: t(5000) })]];
    let modems: Vec<Box<dyn ModemModel>> = vec![Box::new(PerfectModem)];
    let chm = ChannelModem::new(Box::new(NtNcable::uniform(1, 60.0)), modems, BitErrorRng::new(1));
    let cfg = PhyConfig {
        sim_length: t(1000),
        ..PhyConfig::new(1)
    };
    let mut phy = Phy::new(cfg, chm, ScriptedLink::new(scripts), Box::new(NullSink));
    let stats = phy.run().unwrap();
    assert_eq!(stats.end_time, t(1000));
    assert!(phy.link().sent[0].is_empty());
}

#[test]
fn test_wait_in_the_past_is_fatal() {
    let mut phy = perfect_phy(
        vec![vec![
            Request::Wait(WaitRequest { end: t(100) }),
            Request::Wait(WaitRequest { end: t(50) }),
        ]],
        Box::new(NullSink),
    );
    assert!(matches!(phy.run(), Err(PhyError::Protocol { device: 0, .. })));
}
