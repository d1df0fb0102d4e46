//! CAN interface (spec.md §4.7): receive-slot bookkeeping, enumeration
//! delay scheduling, bus-off recovery, and a bounded TX staging queue. The
//! actual FDCAN peripheral register access lives in `target`-gated code not
//! exercised under `host-test`; this module models the slot/queue state
//! that `original_source/.../can_if.c`'s `CANIFInit`/`CANIFPStatus` own.

pub mod id;

use heapless::Deque;

use crate::fault::{FaultKind, FaultState};
use crate::message::Reply;

/// One receive slot, per spec.md §4.7: broadcast, device-addressed general,
/// one per no-ack fast-setpoint class, firmware-update, and the two
/// auto-responding query slots.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RxSlot {
    Broadcast,
    DeviceGeneral,
    VoltageNoAck,
    VCompNoAck,
    CurrentNoAck,
    SpeedNoAck,
    PositionNoAck,
    Update,
    DeviceQuery,
    FirmwareVersion,
}

pub const NUM_RX_SLOTS: usize = 10;

/// A received frame queued for the Message layer; `slot` records which RX
/// object matched so the interface can decide whether an auto-response
/// applies before even reaching dispatch.
#[derive(Clone, Copy, Debug)]
pub struct RxFrame {
    pub slot: RxSlot,
    pub id: u32,
    pub len: u8,
    pub data: [u8; 8],
}

impl RxFrame {
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

const TX_QUEUE_CAPACITY: usize = 9;

/// A frame staged for transmission plus its retry budget, per spec.md
/// §4.7's "TX slot is polled for completion before being reused, with a
/// bounded retry count on failure".
#[derive(Clone, Copy, Debug)]
pub struct TxFrame {
    pub id: u32,
    pub len: u8,
    pub data: [u8; 8],
    pub retries_remaining: u8,
}

pub const MAX_TX_RETRIES: u8 = 3;

fn tx_frame_from_reply(reply: &Reply) -> TxFrame {
    let mut data = [0u8; 8];
    let len = reply.payload.len().min(8);
    data[..len].copy_from_slice(&reply.payload[..len]);
    TxFrame {
        id: reply.id,
        len: len as u8,
        data,
        retries_remaining: MAX_TX_RETRIES,
    }
}

/// A scheduled enumeration response, delayed by `device_number * 1ms` to
/// avoid bus collision among simultaneously-enumerating devices (spec.md
/// §4.7).
struct PendingEnumerate {
    ticks_remaining: u32,
    id: u32,
}

pub struct CanInterface {
    tx_queue: Deque<TxFrame, TX_QUEUE_CAPACITY>,
    pending_enumerate: Option<PendingEnumerate>,
    bus_off: bool,
    status_reg: u8,
    error_reg: u16,
}

impl CanInterface {
    pub fn new() -> Self {
        Self {
            tx_queue: Deque::new(),
            pending_enumerate: None,
            bus_off: false,
            status_reg: 0,
            error_reg: 0,
        }
    }

    pub fn status(&self) -> crate::message::CanStatus {
        crate::message::CanStatus {
            status_reg: self.status_reg,
            error_reg: self.error_reg,
        }
    }

    /// Stages `reply` for transmission, dropping it if the queue is full
    /// (bounded capacity, per the concurrency model's "no unbounded
    /// buffering" expectation).
    pub fn stage(&mut self, reply: &Reply) {
        let _ = self.tx_queue.push_back(tx_frame_from_reply(reply));
    }

    pub fn poll_tx(&mut self) -> Option<TxFrame> {
        self.tx_queue.pop_front()
    }

    /// Called when a staged frame's hardware transmission fails; re-queues
    /// it if retries remain.
    pub fn tx_failed(&mut self, mut frame: TxFrame) {
        if frame.retries_remaining > 0 {
            frame.retries_remaining -= 1;
            let _ = self.tx_queue.push_back(frame);
        }
    }

    /// Schedules the enumeration response per spec.md §4.7: only devices
    /// with a non-zero device number respond, after `device_number` ms.
    pub fn schedule_enumerate(&mut self, device_number: u8, tick_hz: u32) {
        if device_number == 0 {
            return;
        }
        let ticks_per_ms = (tick_hz / 1000).max(1);
        self.pending_enumerate = Some(PendingEnumerate {
            ticks_remaining: device_number as u32 * ticks_per_ms,
            id: id::system_id(id::SystemApi::Enumerate, device_number),
        });
    }

    /// Advances the enumeration delay by one tick; returns the reply to
    /// stage once the delay elapses.
    pub fn tick_enumerate(&mut self) -> Option<u32> {
        let pending = self.pending_enumerate.as_mut()?;
        if pending.ticks_remaining == 0 {
            let id = pending.id;
            self.pending_enumerate = None;
            return Some(id);
        }
        pending.ticks_remaining -= 1;
        None
    }

    /// Reflects a bus-off event from the peripheral: raises the
    /// communication fault and begins the hardware's auto-recovery
    /// sequence (modeled here only as the status flag it flips).
    pub fn on_bus_off(&mut self, faults: &mut FaultState) {
        self.bus_off = true;
        self.status_reg |= 0x01;
        faults.update(FaultKind::Communication, true);
    }

    /// Reflects the peripheral returning to error-active; clears the
    /// bus-off-derived portion of the communication fault condition. The
    /// caller still feeds link-timeout-derived presence separately.
    pub fn on_error_active(&mut self, faults: &mut FaultState, link_timed_out: bool) {
        self.bus_off = false;
        self.status_reg &= !0x01;
        faults.update(FaultKind::Communication, link_timed_out);
    }

    pub fn bus_off(&self) -> bool {
        self.bus_off
    }
}

impl Default for CanInterface {
    fn default() -> Self {
        Self::new()
    }
}

/// RX filter matching, per spec.md §4.7's ten-slot configuration. Returns
/// the slot a given id matches, if any, for `device_number`.
pub fn match_rx_slot(raw_id: u32, device_number: u8) -> Option<RxSlot> {
    let decoded = id::CanId::decode(raw_id);

    if decoded.api_class == id::ApiClass::System as u8 && decoded.device_number == 0 {
        return Some(RxSlot::Broadcast);
    }
    if decoded.device_number != device_number {
        return None;
    }
    if decoded.api_class == id::ApiClass::Update as u8 {
        return Some(RxSlot::Update);
    }
    if decoded.api_class == id::ApiClass::System as u8 {
        return if decoded.api_index == id::SystemApi::DeviceQuery as u8 {
            Some(RxSlot::DeviceQuery)
        } else if decoded.api_index == id::SystemApi::FirmwareVersion as u8 {
            Some(RxSlot::FirmwareVersion)
        } else {
            Some(RxSlot::DeviceGeneral)
        };
    }
    if decoded.api_index == 1 {
        // SetpointIndex::SetNoAck, matched against the five fast-setpoint
        // classes' dedicated no-ack receive objects.
        return match decoded.api_class {
            c if c == id::ApiClass::Voltage as u8 => Some(RxSlot::VoltageNoAck),
            c if c == id::ApiClass::VComp as u8 => Some(RxSlot::VCompNoAck),
            c if c == id::ApiClass::Current as u8 => Some(RxSlot::CurrentNoAck),
            c if c == id::ApiClass::Speed as u8 => Some(RxSlot::SpeedNoAck),
            c if c == id::ApiClass::Position as u8 => Some(RxSlot::PositionNoAck),
            _ => Some(RxSlot::DeviceGeneral),
        };
    }
    Some(RxSlot::DeviceGeneral)
}
