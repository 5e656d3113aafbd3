//! Per-device event queue.
//!
//! Every device owns exactly one slot. Scheduling overwrites the slot, so a
//! device never has more than one pending event. The next event is the
//! earliest one; at equal times the higher priority kind wins, and at equal
//! kind the lower device index.

use p2g4_common::SimTime;

/// Event kinds. The discriminant is the priority: higher runs first when
/// several devices are due in the same microsecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventKind {
    None = 0,
    WaitDone,
    TxEnd,
    TxPacketEnd,
    RssiMeas,
    CcaMeas,
    RxSearchReeval,
    RxFound,
    RxSync,
    RxHeader,
    RxPayload,
    TxAbortReeval,
    TxPacketStart,
    TxStart,
    /// Start of an Rx search or of a CCA search.
    SearchStart,
}

impl EventKind {
    /// Number of kinds, i.e. the size of a handler table.
    pub const COUNT: usize = EventKind::SearchStart as usize + 1;

    /// All kinds, lowest priority first.
    pub const ALL: [EventKind; EventKind::COUNT] = [
        EventKind::None,
        EventKind::WaitDone,
        EventKind::TxEnd,
        EventKind::TxPacketEnd,
        EventKind::RssiMeas,
        EventKind::CcaMeas,
        EventKind::RxSearchReeval,
        EventKind::RxFound,
        EventKind::RxSync,
        EventKind::RxHeader,
        EventKind::RxPayload,
        EventKind::TxAbortReeval,
        EventKind::TxPacketStart,
        EventKind::TxStart,
        EventKind::SearchStart,
    ];

    /// Index into a handler table.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A pending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub time: SimTime,
    pub kind: EventKind,
}

/// The event selected to run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextEvent {
    pub device: usize,
    pub time: SimTime,
    pub kind: EventKind,
}

/// One event slot per device.
#[derive(Debug, Clone)]
pub struct EventQueue {
    slots: Vec<Option<Scheduled>>,
}

impl EventQueue {
    /// Queue for `n_devs` devices, all idle.
    pub fn new(n_devs: usize) -> Self {
        Self {
            slots: vec![None; n_devs],
        }
    }

    /// Schedule `kind` at `time` for `device`, replacing its pending event.
    pub fn schedule(&mut self, time: SimTime, kind: EventKind, device: usize) {
        self.slots[device] = Some(Scheduled { time, kind });
    }

    /// Drop `device`'s pending event.
    pub fn remove(&mut self, device: usize) {
        self.slots[device] = None;
    }

    /// `device`'s pending event.
    pub fn pending(&self, device: usize) -> Option<Scheduled> {
        self.slots[device]
    }

    /// Whether no device has a pending event.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// The event that must run next, if any.
    pub fn select_next(&self) -> Option<NextEvent> {
        let mut best: Option<NextEvent> = None;
        for (device, slot) in self.slots.iter().enumerate() {
            let Some(s) = slot else { continue };
            let better = match best {
                None => true,
                Some(b) => s.time < b.time || (s.time == b.time && s.kind > b.kind),
            };
            if better {
                best = Some(NextEvent {
                    device,
                    time: s.time,
                    kind: s.kind,
                });
            }
        }
        best
    }
}
