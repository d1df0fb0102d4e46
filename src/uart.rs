//! UART interface (spec.md §4.8): byte-stuffed packet framing over serial,
//! and the CAN bridge.
//!
//! Grounded in `original_source/.../uart_if.c`'s `UARTRxISR` state machine and
//! `UARTIFSendMessage`'s stuffing/staging pair, re-expressed as a plain state
//! machine with no peripheral access so it is exercised under `host-test`.

use heapless::Deque;
use heapless::Vec as HVec;

pub const MAX_PAYLOAD: usize = 12;
const TX_RING_CAPACITY: usize = 64;

const SOP: u8 = 0xFF;
const ESC: u8 = 0xFE;
const ESC_SOP: u8 = 0xFE;
const ESC_ESC: u8 = 0xFD;

/// One fully received packet: the 4-byte little-endian message id plus
/// whatever payload followed it, per spec.md §3's "first 4 payload bytes are
/// the little-endian 32-bit message ID".
#[derive(Clone, Debug)]
pub struct Packet {
    pub id: u32,
    pub body: HVec<u8, MAX_PAYLOAD>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RxState {
    Idle,
    Length,
    Data,
    Escape,
}

/// Receive state machine, per spec.md §4.8. Owns no peripheral state; the
/// caller feeds it bytes as the UART ISR delivers them and polls for
/// completed packets.
pub struct Decoder {
    state: RxState,
    expected_len: u8,
    buf: HVec<u8, MAX_PAYLOAD>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: RxState::Idle,
            expected_len: 0,
            buf: HVec::new(),
        }
    }

    /// Feeds one received byte. Returns the assembled payload (pre-strip of
    /// the message-id prefix) once a full packet has arrived.
    pub fn push_byte(&mut self, byte: u8) -> Option<HVec<u8, MAX_PAYLOAD>> {
        // A raw SOP always resyncs, regardless of current state: a dropped
        // escape or a noise byte must not wedge the machine until the next
        // coincidental 0xFF lines up with the length counter.
        if byte == SOP && self.state != RxState::Idle {
            self.buf.clear();
            self.expected_len = 0;
            self.state = RxState::Length;
            return None;
        }
        match self.state {
            RxState::Idle => {
                if byte == SOP {
                    self.buf.clear();
                    self.expected_len = 0;
                    self.state = RxState::Length;
                }
                None
            }
            RxState::Length => {
                if byte as usize > MAX_PAYLOAD {
                    self.state = RxState::Idle;
                    return None;
                }
                self.expected_len = byte;
                self.state = RxState::Data;
                if self.expected_len == 0 {
                    self.state = RxState::Idle;
                    return Some(HVec::new());
                }
                None
            }
            RxState::Data => {
                if byte == ESC {
                    self.state = RxState::Escape;
                    return None;
                }
                self.finish_byte(byte)
            }
            RxState::Escape => {
                let literal = match byte {
                    ESC_SOP => SOP,
                    ESC_ESC => ESC,
                    _ => {
                        self.state = RxState::Idle;
                        return None;
                    }
                };
                self.state = RxState::Data;
                self.finish_byte(literal)
            }
        }
    }

    fn finish_byte(&mut self, byte: u8) -> Option<HVec<u8, MAX_PAYLOAD>> {
        let _ = self.buf.push(byte);
        if self.buf.len() == self.expected_len as usize {
            self.state = RxState::Idle;
            return Some(core::mem::replace(&mut self.buf, HVec::new()));
        }
        None
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a decoded payload into its message id and remaining body, per
/// spec.md §3. Returns `None` if the payload is shorter than 4 bytes.
pub fn split_id(payload: &[u8]) -> Option<(u32, &[u8])> {
    if payload.len() < 4 {
        return None;
    }
    let id = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Some((id, &payload[4..]))
}

/// Byte-stuffs `id` followed by `body` into a length-prefixed frame, per
/// spec.md §3/§6. Returns `None` if the combined payload would exceed
/// `MAX_PAYLOAD` before stuffing.
pub fn encode(id: u32, body: &[u8]) -> Option<HVec<u8, 32>> {
    let raw_len = 4 + body.len();
    if raw_len > MAX_PAYLOAD {
        return None;
    }
    let mut out: HVec<u8, 32> = HVec::new();
    let _ = out.push(SOP);
    let _ = out.push(raw_len as u8);
    for &b in id.to_le_bytes().iter().chain(body.iter()) {
        match b {
            SOP => {
                let _ = out.push(ESC);
                let _ = out.push(ESC_SOP);
            }
            ESC => {
                let _ = out.push(ESC);
                let _ = out.push(ESC_ESC);
            }
            other => {
                let _ = out.push(other);
            }
        }
    }
    Some(out)
}

/// Bounded ring buffer staging stuffed bytes for transmit, drained to the
/// UART peripheral as space becomes available (spec.md §4.8).
pub struct TxRing {
    bytes: Deque<u8, TX_RING_CAPACITY>,
}

impl TxRing {
    pub fn new() -> Self {
        Self {
            bytes: Deque::new(),
        }
    }

    /// Stages a whole stuffed frame. Drops the entire frame (rather than
    /// staging a truncated one) if it would not fit.
    pub fn stage_frame(&mut self, frame: &[u8]) -> bool {
        if frame.len() > self.bytes.capacity() - self.bytes.len() {
            return false;
        }
        for &b in frame {
            let _ = self.bytes.push_back(b);
        }
        true
    }

    pub fn next_byte(&mut self) -> Option<u8> {
        self.bytes.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Default for TxRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a decoded packet should be handled locally, bridged onto CAN, or
/// both, per spec.md §4.8's bridging rule.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BridgeDecision {
    Local,
    Bridge,
}

/// Decides whether `dest_device` addresses the local node. Broadcast
/// (device-number 0) is always bridged in addition to being handled locally
/// by the Message layer; any other non-matching device number is bridge-only.
pub fn bridge_decision(dest_device: u8, local_device: u8) -> BridgeDecision {
    if dest_device == 0 || dest_device != local_device {
        BridgeDecision::Bridge
    } else {
        BridgeDecision::Local
    }
}
