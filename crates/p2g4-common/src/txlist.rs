//! Transmission registry.
//!
//! One slot per device holding the parameters and payload of its current
//! (or pending) transmission together with an activity bitmask. Every
//! mutation that changes what the air looks like to a receiver bumps a
//! global change counter, so interference computations can be skipped when
//! nothing has moved.

use crate::messages::{AbortParams, RxV2, TxV2};
use crate::SimTime;

/// Transmission activity bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TxState(u8);

impl TxState {
    /// Not transmitting.
    pub const OFF: TxState = TxState(0);
    /// Carrier is on air.
    pub const CARRIER_ON: TxState = TxState(0x1);
    /// Packet payload is on air.
    pub const PACKET_ONGOING: TxState = TxState(0x2);
    /// Packet has started at some point.
    pub const PACKET_STARTED: TxState = TxState(0x4);
    /// Packet has ended.
    pub const PACKET_ENDED: TxState = TxState(0x8);

    /// Raw bits.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Whether all bits of `other` are set.
    pub fn contains(&self, other: TxState) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the carrier is on.
    pub fn is_on(&self) -> bool {
        self.0 & Self::CARRIER_ON.0 != 0
    }
}

impl std::ops::BitOr for TxState {
    type Output = TxState;

    fn bitor(self, rhs: Self) -> Self::Output {
        TxState(self.0 | rhs.0)
    }
}

/// One device's transmission.
#[derive(Debug, Clone, Default)]
pub struct TxSlot {
    pub tx: TxV2,
    pub packet: Vec<u8>,
    pub state: TxState,
}

/// Registry of all devices' transmissions.
#[derive(Debug, Clone)]
pub struct TxList {
    slots: Vec<TxSlot>,
    ctr: u64,
    highest_active: Option<usize>,
}

impl TxList {
    /// Create a registry for `n_devs` devices, all OFF.
    pub fn new(n_devs: usize) -> Self {
        Self {
            slots: vec![TxSlot::default(); n_devs],
            ctr: 0,
            highest_active: None,
        }
    }

    /// Number of device slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the registry has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Change counter, bumped whenever a carrier appears or disappears.
    pub fn ctr(&self) -> u64 {
        self.ctr
    }

    /// Highest device index with an active carrier.
    pub fn highest_active(&self) -> Option<usize> {
        self.highest_active
    }

    /// Slot of device `d`.
    pub fn slot(&self, d: usize) -> &TxSlot {
        &self.slots[d]
    }

    /// Activity state of device `d`.
    pub fn state(&self, d: usize) -> TxState {
        self.slots[d].state
    }

    /// Whether device `d`'s packet is currently on air.
    pub fn is_packet_ongoing(&self, d: usize) -> bool {
        self.slots[d].state.contains(TxState::PACKET_ONGOING)
    }

    /// Indices and slots of all devices whose carrier is on.
    pub fn active(&self) -> impl Iterator<Item = (usize, &TxSlot)> + '_ {
        let bound = self.highest_active.map_or(0, |h| h + 1);
        self.slots[..bound]
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state.is_on())
    }

    /// Store a transmission without putting it on air.
    pub fn register(&mut self, d: usize, tx: TxV2, packet: Vec<u8>) {
        let slot = &mut self.slots[d];
        slot.tx = tx;
        slot.packet = packet;
        slot.state = TxState::OFF;
    }

    /// Put device `d`'s carrier on air.
    pub fn start_carrier(&mut self, d: usize) {
        self.slots[d].state = TxState::CARRIER_ON;
        self.ctr += 1;
        if self.highest_active.map_or(true, |h| d > h) {
            self.highest_active = Some(d);
        }
    }

    /// Mark device `d`'s packet as on air.
    pub fn start_packet(&mut self, d: usize) {
        let slot = &mut self.slots[d];
        slot.state = slot.state | TxState::PACKET_ONGOING | TxState::PACKET_STARTED;
    }

    /// Mark device `d`'s packet as finished; the carrier may continue.
    pub fn end_packet(&mut self, d: usize) {
        let slot = &mut self.slots[d];
        slot.state = TxState((slot.state.0 & !TxState::PACKET_ONGOING.0) | TxState::PACKET_ENDED.0);
    }

    /// Take device `d` off air and drop its payload.
    pub fn clear(&mut self, d: usize) {
        let slot = &mut self.slots[d];
        slot.packet = Vec::new();
        slot.state = TxState::OFF;
        self.ctr += 1;

        if self.highest_active == Some(d) {
            let mut h = d;
            self.highest_active = loop {
                if self.slots[h].state.is_on() {
                    break Some(h);
                }
                if h == 0 {
                    break None;
                }
                h -= 1;
            };
        }
    }

    /// Replace device `d`'s abort parameters.
    pub fn set_abort(&mut self, d: usize, abort: AbortParams) {
        self.slots[d].tx.abort = abort;
    }

    /// Whether a receiver could lock onto device `d`'s packet at `now`.
    ///
    /// The packet must be on air with one of the receiver's addresses, on the
    /// same centre frequency with a similar modulation, and must not have
    /// started more than `acceptable_pre_truncation` microseconds ago.
    pub fn fits(&self, d: usize, rx: &RxV2, now: SimTime) -> bool {
        let slot = &self.slots[d];
        let tx = &slot.tx;
        slot.state.contains(TxState::PACKET_ONGOING)
            && rx.addresses.contains(&tx.phy_address)
            && tx.radio_params.center_freq == rx.radio_params.center_freq
            && rx.radio_params.modulation.is_similar(tx.radio_params.modulation)
            && now.since(tx.start_packet_time) <= rx.acceptable_pre_truncation as u64
    }

    /// First transmitter (lowest index) that [fits](Self::fits) `rx` at `now`.
    pub fn find_fitting_tx(&self, rx: &RxV2, now: SimTime) -> Option<usize> {
        self.active().map(|(i, _)| i).find(|&i| self.fits(i, rx, now))
    }
}
