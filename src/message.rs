//! Message layer (spec.md §4.9): the single dispatch point for decoded API
//! calls regardless of source interface (CAN or UART), the device
//! assignment state machine, grouped/deferred setpoint commits, and the
//! four-slot periodic status scheduler.
//!
//! Grounded in `original_source/.../message.c`'s `MessageCommandHandler`
//! (per-class dispatch switch), `MessageSystemHandler` (assignment state
//! machine, halt/resume/reset/enumerate), and `MessageTick`'s periodic
//! status loop, re-expressed as a table-driven interpreter per the
//! re-architecture note on the opcode-walking loop.

use heapless::Vec as HVec;

use crate::can::id::{system_id, ApiClass, CanId, SystemApi};
use crate::command;
use crate::controller::Controller;
use crate::fault::FaultKind;
use crate::hbridge::NeutralMode;
use crate::limits::SoftLimitMode;
use crate::param::{ParamStore, Params, DEVICE_NUMBER_MAX, FIRMWARE_VERSION, HARDWARE_VERSION};
use crate::setpoint::ControlMode;

pub const MAX_PAYLOAD: usize = 8;
pub type Payload = HVec<u8, MAX_PAYLOAD>;

#[derive(Clone, Debug)]
pub struct Reply {
    pub id: u32,
    pub payload: Payload,
}

impl Reply {
    fn empty(id: u32) -> Self {
        Self {
            id,
            payload: Payload::new(),
        }
    }

    fn with(id: u32, bytes: &[u8]) -> Self {
        let mut payload = Payload::new();
        let _ = payload.extend_from_slice(bytes);
        Self { id, payload }
    }
}

/// Observable-externally UI signals, per spec.md §7's "specific blink
/// pattern" requirement and §4.7's "signals the UI that assignment is
/// pending" — out-of-scope LED hardware consumes these.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UiSignal {
    AssignmentPending,
    AssignmentCommitted,
    CalibrationFailed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AssignState {
    Idle,
    PendingAssign { pending_id: u8, ticks_remaining: u32 },
}

/// 5 seconds at the nominal 1 kHz control tick, per spec.md §4.7/§5.
pub const ASSIGN_TIMEOUT_TICKS: u32 = 5_000;

fn le16(v: i16) -> [u8; 2] {
    v.to_le_bytes()
}

fn le32(v: i32) -> [u8; 4] {
    v.to_le_bytes()
}

/// One of the five setpoint API classes, sharing a uniform set/query/gain
/// dispatch shape.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SetpointClass {
    Voltage,
    VComp,
    Current,
    Speed,
    Position,
}

/// Common API index layout reused across the five setpoint classes. Real
/// hardware's LM API has more indices (trim, compensation variants); this
/// is the subset spec.md names.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SetpointIndex {
    Set = 0,
    SetNoAck = 1,
    SetPGain = 2,
    SetIGain = 3,
    SetDGain = 4,
    SetSrc = 5,
    SetRateA = 6,
    SetRateB = 7,
    /// Selects this class as the active control mode (`LM_API_*_EN` on real
    /// hardware), cancelling any pending grouped setpoints per spec.md §4.5.
    Enable = 8,
    /// Drives this class's output to neutral without changing mode
    /// (`LM_API_*_DIS`).
    Disable = 9,
}

/// Maps a wire setpoint class onto the regulator's control mode one-to-one.
fn class_to_mode(class: SetpointClass) -> ControlMode {
    match class {
        SetpointClass::Voltage => ControlMode::Voltage,
        SetpointClass::VComp => ControlMode::VComp,
        SetpointClass::Current => ControlMode::Current,
        SetpointClass::Speed => ControlMode::Speed,
        SetpointClass::Position => ControlMode::Position,
    }
}

/// Status-class (read-only) API indices: one status field per index,
/// spec.md §4.9's "status" handler.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum StatusApi {
    VoltOut = 0,
    VoltBus = 1,
    Current = 2,
    Temperature = 3,
    Position = 4,
    Speed = 5,
    Limit = 6,
    Faults = 7,
    StickyFaults = 8,
}

/// Configuration-class (read/write) API indices, spec.md §4.9's
/// "configuration" handler. A zero-length payload is a query; otherwise the
/// fixed-width value is written and acknowledged.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConfigApi {
    VoltageMax = 0,
    BrakeCoast = 1,
    PotTurns = 2,
    EncoderLines = 3,
    LimitMode = 4,
    FaultTime = 5,
}

fn limit_mode_to_wire(mode: SoftLimitMode) -> u8 {
    match mode {
        SoftLimitMode::Disabled => 0,
        SoftLimitMode::ForwardOnly => 1,
        SoftLimitMode::ReverseOnly => 2,
        SoftLimitMode::Both => 3,
    }
}

fn limit_mode_from_wire(b: u8) -> Option<SoftLimitMode> {
    Some(match b {
        0 => SoftLimitMode::Disabled,
        1 => SoftLimitMode::ForwardOnly,
        2 => SoftLimitMode::ReverseOnly,
        3 => SoftLimitMode::Both,
        _ => return None,
    })
}

pub struct Message {
    pending: crate::setpoint::PendingSetpoints,
    pstat: [PstatSlot; 4],
    assign: AssignState,
    device_number: u8,
}

impl Message {
    pub fn new(device_number: u8) -> Self {
        Self {
            pending: crate::setpoint::PendingSetpoints::default(),
            pstat: Default::default(),
            assign: AssignState::Idle,
            device_number,
        }
    }

    pub fn device_number(&self) -> u8 {
        self.device_number
    }

    pub fn pstat_slot_mut(&mut self, slot: usize) -> &mut PstatSlot {
        &mut self.pstat[slot]
    }

    /// Advances the assignment timeout; called once per control tick.
    /// Returns `Some(UiSignal)` if the timeout fires this tick.
    pub fn tick_assign(&mut self) -> Option<UiSignal> {
        if let AssignState::PendingAssign {
            pending_id,
            ticks_remaining,
        } = &mut self.assign
        {
            if *ticks_remaining == 0 {
                // Special rule: timing out with pending==current commits to
                // 0 (unassign) rather than leaving the id unchanged.
                if *pending_id == self.device_number {
                    self.device_number = 0;
                }
                self.assign = AssignState::Idle;
                return Some(UiSignal::AssignmentCommitted);
            }
            *ticks_remaining -= 1;
        }
        None
    }

    /// The physical confirm button, observed externally per spec.md §4.7.
    /// Commits the pending assignment immediately, persisting the new
    /// device number.
    pub fn confirm_button_press<S: ParamStore>(&mut self, params: &mut Params<S>) -> Option<UiSignal> {
        if let AssignState::PendingAssign { pending_id, .. } = self.assign {
            self.device_number = pending_id;
            params.block_mut().device_number = pending_id;
            let _ = params.save();
            self.assign = AssignState::Idle;
            return Some(UiSignal::AssignmentCommitted);
        }
        None
    }

    /// Runs the periodic-status scheduler for one control tick. Returns up
    /// to 4 replies to transmit on whichever link is active.
    pub fn tick_pstat(&mut self, controller: &mut Controller, can_status: CanStatus) -> HVec<Reply, 4> {
        let snapshot = Snapshot::capture(controller, can_status, self.device_number);
        let mut out = HVec::new();
        for (idx, slot) in self.pstat.iter_mut().enumerate() {
            if let Some(payload) = slot.tick(&snapshot, controller) {
                let id = pstat_id(idx as u8, self.device_number);
                let _ = out.push(Reply::with(id, &payload));
            }
        }
        out
    }

    /// Dispatches one decoded frame. `payload.len() == 0` is always treated
    /// as a query. Returns the reply to transmit, if any (ACK, query
    /// response, or nothing for "no-ack" setters and malformed input).
    pub fn handle_frame<S: ParamStore>(
        &mut self,
        controller: &mut Controller,
        params: &mut Params<S>,
        id: u32,
        payload: &[u8],
    ) -> Option<Reply> {
        let decoded = CanId::decode(id);
        if decoded.api_class == ApiClass::System as u8 {
            return self.handle_system(controller, params, decoded, payload);
        }
        if decoded.device_number != self.device_number {
            return None;
        }

        if decoded.api_class == ApiClass::Status as u8 {
            return self.handle_status_class(controller, decoded, payload);
        }
        if decoded.api_class == ApiClass::Configuration as u8 {
            return self.handle_configuration_class(controller, decoded, payload);
        }
        if decoded.api_class == ApiClass::PeriodicStatus as u8 {
            return self.handle_pstat_config(decoded, payload);
        }

        let class = match decoded.api_class {
            c if c == ApiClass::Voltage as u8 => SetpointClass::Voltage,
            c if c == ApiClass::VComp as u8 => SetpointClass::VComp,
            c if c == ApiClass::Current as u8 => SetpointClass::Current,
            c if c == ApiClass::Speed as u8 => SetpointClass::Speed,
            c if c == ApiClass::Position as u8 => SetpointClass::Position,
            _ => return None,
        };
        self.handle_setpoint_class(controller, class, decoded, payload)
    }

    /// Status class (spec.md §4.9): read-only, one field per index. Any
    /// non-empty payload is malformed (status has no setter) and is ignored
    /// silently, per the general error semantics.
    fn handle_status_class(
        &self,
        controller: &Controller,
        decoded: CanId,
        payload: &[u8],
    ) -> Option<Reply> {
        if !payload.is_empty() {
            return None;
        }
        let snapshot = Snapshot::capture(controller, CanStatus::default(), self.device_number);
        let reply = match decoded.api_index {
            i if i == StatusApi::VoltOut as u8 => {
                Reply::with(decoded_id(decoded), &le16(snapshot.voltage_out))
            }
            i if i == StatusApi::VoltBus as u8 => {
                Reply::with(decoded_id(decoded), &le16(snapshot.bus_voltage))
            }
            i if i == StatusApi::Current as u8 => {
                Reply::with(decoded_id(decoded), &le16(snapshot.current))
            }
            i if i == StatusApi::Temperature as u8 => {
                Reply::with(decoded_id(decoded), &le16(snapshot.temperature))
            }
            i if i == StatusApi::Position as u8 => {
                Reply::with(decoded_id(decoded), &le32(snapshot.position))
            }
            i if i == StatusApi::Speed as u8 => {
                Reply::with(decoded_id(decoded), &le32(snapshot.speed))
            }
            i if i == StatusApi::Limit as u8 => {
                Reply::with(decoded_id(decoded), &[snapshot.limit])
            }
            i if i == StatusApi::Faults as u8 => {
                Reply::with(decoded_id(decoded), &[snapshot.faults])
            }
            i if i == StatusApi::StickyFaults as u8 => {
                Reply::with(decoded_id(decoded), &[snapshot.sticky_faults])
            }
            _ => return None,
        };
        Some(reply)
    }

    /// Configuration class (spec.md §4.9): zero-length payload queries the
    /// current value, a fixed-width payload writes it through the Command
    /// layer and acknowledges.
    fn handle_configuration_class(
        &self,
        controller: &mut Controller,
        decoded: CanId,
        payload: &[u8],
    ) -> Option<Reply> {
        match decoded.api_index {
            i if i == ConfigApi::VoltageMax as u8 => {
                if payload.is_empty() {
                    return Some(Reply::with(
                        decoded_id(decoded),
                        &controller.hbridge().voltage_max_get().to_le_bytes(),
                    ));
                }
                if payload.len() < 2 {
                    return None;
                }
                let max = u16::from_le_bytes([payload[0], payload[1]]);
                command::set_voltage_max(controller, max);
                Some(Reply::empty(ack_reply_id(decoded)))
            }
            i if i == ConfigApi::BrakeCoast as u8 => {
                if payload.is_empty() {
                    let is_brake = controller.hbridge().brake_coast_get() == NeutralMode::Brake;
                    return Some(Reply::with(decoded_id(decoded), &[is_brake as u8]));
                }
                let mode = if payload[0] != 0 {
                    NeutralMode::Brake
                } else {
                    NeutralMode::Coast
                };
                command::set_brake_coast(controller, mode);
                Some(Reply::empty(ack_reply_id(decoded)))
            }
            i if i == ConfigApi::PotTurns as u8 => {
                if payload.is_empty() {
                    return Some(Reply::with(
                        decoded_id(decoded),
                        &controller.sensors().pot_turns_get().to_le_bytes(),
                    ));
                }
                if payload.len() < 2 {
                    return None;
                }
                let turns = u16::from_le_bytes([payload[0], payload[1]]);
                command::set_pot_turns(controller, turns);
                Some(Reply::empty(ack_reply_id(decoded)))
            }
            i if i == ConfigApi::EncoderLines as u8 => {
                if payload.is_empty() {
                    return Some(Reply::with(
                        decoded_id(decoded),
                        &controller.sensors().encoder_lines_get().to_le_bytes(),
                    ));
                }
                if payload.len() < 2 {
                    return None;
                }
                let lines = u16::from_le_bytes([payload[0], payload[1]]);
                command::set_encoder_lines(controller, lines);
                Some(Reply::empty(ack_reply_id(decoded)))
            }
            i if i == ConfigApi::LimitMode as u8 => {
                if payload.is_empty() {
                    return Some(Reply::with(
                        decoded_id(decoded),
                        &[limit_mode_to_wire(controller.limits().mode_get())],
                    ));
                }
                let Some(mode) = limit_mode_from_wire(payload[0]) else {
                    return None;
                };
                command::set_limit_mode(controller, mode);
                Some(Reply::empty(ack_reply_id(decoded)))
            }
            i if i == ConfigApi::FaultTime as u8 => {
                if payload.is_empty() {
                    return Some(Reply::with(
                        decoded_id(decoded),
                        &controller.faults().hold_off_ticks_get().to_le_bytes(),
                    ));
                }
                if payload.len() < 4 {
                    return None;
                }
                let ticks = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                command::set_fault_time(controller, ticks);
                Some(Reply::empty(ack_reply_id(decoded)))
            }
            _ => None,
        }
    }

    /// Periodic-status configuration (spec.md §4.9): `api_index` 0..3 sets
    /// slot n's period (`pstat_per_en_Sn`, 0 disables), 4..7 sets slot
    /// `n - 4`'s 8-byte format descriptor (`pstat_cfg_Sn`). Fire-and-forget,
    /// like the periodic transmissions themselves; no ACK.
    fn handle_pstat_config(&mut self, decoded: CanId, payload: &[u8]) -> Option<Reply> {
        const NUM_PSTAT_SLOTS: u8 = 4;
        let idx = decoded.api_index;
        if idx < NUM_PSTAT_SLOTS {
            if payload.len() != 4 {
                return None;
            }
            let period = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            self.pstat[idx as usize].set_period(period);
        } else if idx < NUM_PSTAT_SLOTS * 2 {
            if payload.len() != PSTAT_DESCRIPTOR_LEN {
                return None;
            }
            let mut descriptor = [PstatOpcode::End as u8; PSTAT_DESCRIPTOR_LEN];
            descriptor.copy_from_slice(payload);
            self.pstat[(idx - NUM_PSTAT_SLOTS) as usize].set_descriptor(descriptor);
        }
        None
    }

    fn handle_system<S: ParamStore>(
        &mut self,
        controller: &mut Controller,
        params: &mut Params<S>,
        decoded: CanId,
        payload: &[u8],
    ) -> Option<Reply> {
        match decoded.api_index {
            i if i == SystemApi::Halt as u8 => {
                controller.halt_set(true);
                None
            }
            i if i == SystemApi::Resume as u8 => {
                controller.halt_set(false);
                None
            }
            i if i == SystemApi::Reset as u8 => {
                // Bootloader hand-off is out of scope; record the request
                // as a forced halt so the caller observes a safe state.
                controller.halt_set(true);
                None
            }
            i if i == SystemApi::Enumerate as u8 => {
                if self.device_number == 0 {
                    return None;
                }
                Some(Reply::empty(system_id(
                    SystemApi::Enumerate,
                    self.device_number,
                )))
            }
            i if i == SystemApi::DeviceAssign as u8 => {
                if payload.is_empty() {
                    return None;
                }
                let new_id = payload[0];
                if new_id == 0 {
                    self.device_number = 0;
                    params.block_mut().device_number = 0;
                    let _ = params.save();
                    self.assign = AssignState::Idle;
                    return None;
                }
                if new_id > DEVICE_NUMBER_MAX || self.device_number == 0 {
                    return None;
                }
                controller.halt_set(true);
                self.assign = AssignState::PendingAssign {
                    pending_id: new_id,
                    ticks_remaining: ASSIGN_TIMEOUT_TICKS,
                };
                None
            }
            i if i == SystemApi::DeviceQuery as u8 => {
                if decoded.device_number != self.device_number {
                    return None;
                }
                Some(Reply::with(
                    system_id(SystemApi::DeviceQuery, self.device_number),
                    &[
                        crate::can::id::DEVICE_TYPE_MOTOR_CONTROLLER,
                        crate::can::id::MANUFACTURER_LM,
                    ],
                ))
            }
            i if i == SystemApi::FirmwareVersion as u8 => {
                if decoded.device_number != self.device_number {
                    return None;
                }
                let mut bytes = [0u8; 5];
                bytes[0] = HARDWARE_VERSION;
                bytes[1..5].copy_from_slice(&FIRMWARE_VERSION.to_le_bytes());
                Some(Reply::with(
                    system_id(SystemApi::FirmwareVersion, self.device_number),
                    &bytes,
                ))
            }
            i if i == SystemApi::Heartbeat as u8 => None,
            i if i == SystemApi::Sync as u8 => {
                if payload.is_empty() {
                    return None;
                }
                let group = payload[0];
                let mut pending = core::mem::take(&mut self.pending);
                pending.commit(group, |slot, value| {
                    apply_committed(controller, slot, value)
                });
                self.pending = pending;
                None
            }
            i if i == SystemApi::Update as u8 => None,
            _ => None,
        }
    }

    fn handle_setpoint_class(
        &mut self,
        controller: &mut Controller,
        class: SetpointClass,
        decoded: CanId,
        payload: &[u8],
    ) -> Option<Reply> {
        match decoded.api_index {
            i if i == SetpointIndex::Set as u8 || i == SetpointIndex::SetNoAck as u8 => {
                let no_ack = decoded.api_index == SetpointIndex::SetNoAck as u8;
                if payload.is_empty() {
                    return Some(self.query_reply(class, decoded, controller));
                }
                self.apply_set(controller, class, payload);
                if no_ack {
                    None
                } else {
                    Some(Reply::empty(ack_reply_id(decoded)))
                }
            }
            i if i == SetpointIndex::SetPGain as u8 => {
                set_gain(controller, class, payload, GainKind::P);
                None
            }
            i if i == SetpointIndex::SetIGain as u8 => {
                set_gain(controller, class, payload, GainKind::I);
                None
            }
            i if i == SetpointIndex::SetDGain as u8 => {
                set_gain(controller, class, payload, GainKind::D);
                None
            }
            i if i == SetpointIndex::SetSrc as u8 => {
                if payload.is_empty() {
                    return None;
                }
                match class {
                    SetpointClass::Speed => command::set_speed_src(
                        controller,
                        if payload[0] == 0 {
                            crate::sensors::SpeedSource::Encoder
                        } else {
                            crate::sensors::SpeedSource::InvEncoder
                        },
                    ),
                    SetpointClass::Position => command::set_position_src(
                        controller,
                        if payload[0] == 0 {
                            crate::sensors::PositionSource::Encoder
                        } else {
                            crate::sensors::PositionSource::Potentiometer
                        },
                    ),
                    _ => {}
                }
                None
            }
            i if i == SetpointIndex::SetRateA as u8 => {
                if payload.len() < 2 {
                    return None;
                }
                let rate = i32::from(u16::from_le_bytes([payload[0], payload[1]]));
                match class {
                    SetpointClass::Voltage => {
                        let _ = command::set_voltage_rate(controller, rate);
                    }
                    SetpointClass::VComp => {
                        let _ = command::set_vcomp_in_ramp(controller, rate);
                    }
                    _ => {}
                }
                None
            }
            i if i == SetpointIndex::SetRateB as u8 => {
                if payload.len() < 2 || class != SetpointClass::VComp {
                    return None;
                }
                let rate = i32::from(u16::from_le_bytes([payload[0], payload[1]]));
                let _ = command::set_vcomp_comp_ramp(controller, rate);
                None
            }
            i if i == SetpointIndex::Enable as u8 => {
                command::set_mode(controller, class_to_mode(class));
                // A mode switch cancels all pending grouped setpoints
                // (spec.md §4.5); `PendingSetpoints` lives on the Message
                // layer, so this is the call site responsible for it.
                self.pending.cancel_all();
                Some(Reply::empty(ack_reply_id(decoded)))
            }
            i if i == SetpointIndex::Disable as u8 => {
                if controller.mode() == class_to_mode(class) {
                    command::force_neutral(controller);
                }
                Some(Reply::empty(ack_reply_id(decoded)))
            }
            _ => None,
        }
    }

    fn apply_set(&mut self, controller: &mut Controller, class: SetpointClass, payload: &[u8]) {
        use crate::setpoint::SetpointSlot;

        // Voltage, VComp and Current are 16-bit setpoints on the wire
        // (plain i16 fraction-of-bus for the first two, Q8.8 amperes for
        // Current); Speed and Position are 32-bit Q16.16.
        let (value, group) = match class {
            SetpointClass::Voltage | SetpointClass::VComp | SetpointClass::Current => {
                if payload.len() < 2 {
                    return;
                }
                let v = i32::from(i16::from_le_bytes([payload[0], payload[1]]));
                let g = payload.get(2).copied().unwrap_or(0);
                (v, g)
            }
            SetpointClass::Speed | SetpointClass::Position => {
                if payload.len() < 4 {
                    return;
                }
                let v = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let g = payload.get(4).copied().unwrap_or(0);
                (v, g)
            }
        };

        let slot = match class {
            SetpointClass::Voltage => SetpointSlot::Voltage,
            SetpointClass::VComp => SetpointSlot::VComp,
            SetpointClass::Current => SetpointSlot::Current,
            SetpointClass::Speed => SetpointSlot::Speed,
            SetpointClass::Position => SetpointSlot::Position,
        };

        if group == 0 {
            apply_committed(controller, slot, value);
        } else {
            self.pending.defer(slot, value, group);
        }
    }

    fn query_reply(&self, class: SetpointClass, decoded: CanId, controller: &Controller) -> Reply {
        let setpoints = controller.setpoints();
        match class {
            SetpointClass::Voltage => {
                Reply::with(decoded_id(decoded), &le16(setpoints.voltage.target as i16))
            }
            SetpointClass::VComp => Reply::with(
                decoded_id(decoded),
                &le16(setpoints.vcomp_in.target as i16),
            ),
            SetpointClass::Current => {
                Reply::with(decoded_id(decoded), &le16(setpoints.current.target as i16))
            }
            SetpointClass::Speed => Reply::with(decoded_id(decoded), &le32(setpoints.speed.target)),
            SetpointClass::Position => {
                Reply::with(decoded_id(decoded), &le32(setpoints.position.target))
            }
        }
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new(1)
    }
}

fn decoded_id(decoded: CanId) -> u32 {
    decoded.encode()
}

fn ack_reply_id(decoded: CanId) -> u32 {
    crate::can::id::ack_id(decoded.device_number)
}

enum GainKind {
    P,
    I,
    D,
}

fn set_gain(controller: &mut Controller, class: SetpointClass, payload: &[u8], kind: GainKind) {
    if payload.len() < 4 {
        return;
    }
    let g = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    match (class, kind) {
        (SetpointClass::Current, GainKind::P) => command::set_current_p(controller, g),
        (SetpointClass::Current, GainKind::I) => command::set_current_i(controller, g),
        (SetpointClass::Current, GainKind::D) => command::set_current_d(controller, g),
        (SetpointClass::Speed, GainKind::P) => command::set_speed_p(controller, g),
        (SetpointClass::Speed, GainKind::I) => command::set_speed_i(controller, g),
        (SetpointClass::Speed, GainKind::D) => command::set_speed_d(controller, g),
        (SetpointClass::Position, GainKind::P) => command::set_position_p(controller, g),
        (SetpointClass::Position, GainKind::I) => command::set_position_i(controller, g),
        (SetpointClass::Position, GainKind::D) => command::set_position_d(controller, g),
        _ => {}
    }
}

fn apply_committed(controller: &mut Controller, slot: crate::setpoint::SetpointSlot, value: i32) {
    use crate::setpoint::SetpointSlot;
    let _ = match slot {
        SetpointSlot::Voltage => command::set_voltage(controller, value as i16),
        SetpointSlot::VComp => command::set_vcomp(controller, value as i16),
        SetpointSlot::Current => command::set_current(controller, value),
        SetpointSlot::Speed => command::set_speed(controller, value),
        SetpointSlot::Position => command::set_position(controller, value),
    };
}

/// CAN controller status/error registers, sampled by the CAN interface and
/// fed into periodic status assembly (`canSTS`/`canERR` opcodes).
#[derive(Clone, Copy, Default)]
pub struct CanStatus {
    pub status_reg: u8,
    pub error_reg: u16,
}

/// Everything a periodic-status payload can reference, captured once per
/// tick so every enabled slot sees the same values (spec.md §4.9).
struct Snapshot {
    voltage_out: i16,
    bus_voltage: i16,
    current: i16,
    temperature: i16,
    position: i32,
    speed: i32,
    limit: u8,
    limit_clr: u8,
    faults: u8,
    sticky_faults: u8,
    fault_counters: [u8; 5],
    can_status: u8,
    can_error: u16,
}

impl Snapshot {
    fn capture(controller: &Controller, can_status: CanStatus, _device_number: u8) -> Self {
        let limits = controller.limits();
        let faults = controller.faults();
        Self {
            voltage_out: controller.hbridge().last_duty(),
            bus_voltage: controller.sensors().bus_voltage(),
            current: controller.sensors().current(),
            temperature: controller.sensors().temperature(),
            position: controller.sensors().position(controller.setpoints().position_src),
            speed: controller.sensors().speed(controller.setpoints().speed_src),
            limit: (!limits.forward_ok() as u8) | ((!limits.reverse_ok() as u8) << 1),
            limit_clr: (!limits.sticky_forward_ok() as u8) | ((!limits.sticky_reverse_ok() as u8) << 1),
            faults: faults.active(),
            sticky_faults: faults.sticky(),
            fault_counters: [
                faults.counter(FaultKind::Current).min(255) as u8,
                faults.counter(FaultKind::Temperature).min(255) as u8,
                faults.counter(FaultKind::BusVoltage).min(255) as u8,
                faults.counter(FaultKind::GateDriver).min(255) as u8,
                faults.counter(FaultKind::Communication).min(255) as u8,
            ],
            can_status: can_status.status_reg,
            can_error: can_status.error_reg,
        }
    }
}

/// Closed opcode enumeration selecting one byte of a periodic status
/// payload, per spec.md §4.9.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PstatOpcode {
    VoltageOutLow = 0,
    VoltageOutHigh = 1,
    BusVoltageLow = 2,
    BusVoltageHigh = 3,
    CurrentLow = 4,
    CurrentHigh = 5,
    TemperatureLow = 6,
    TemperatureHigh = 7,
    PositionB0 = 8,
    PositionB1 = 9,
    PositionB2 = 10,
    PositionB3 = 11,
    SpeedB0 = 12,
    SpeedB1 = 13,
    SpeedB2 = 14,
    SpeedB3 = 15,
    Limit = 16,
    LimitClr = 17,
    Faults = 18,
    StickyFaults = 19,
    StickyFaultsClr = 20,
    FaultCounter0 = 21,
    FaultCounter1 = 22,
    FaultCounter2 = 23,
    FaultCounter3 = 24,
    FaultCounter4 = 25,
    CanStatus = 26,
    CanErrorLow = 27,
    CanErrorHigh = 28,
    End = 255,
}

impl PstatOpcode {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::VoltageOutLow,
            1 => Self::VoltageOutHigh,
            2 => Self::BusVoltageLow,
            3 => Self::BusVoltageHigh,
            4 => Self::CurrentLow,
            5 => Self::CurrentHigh,
            6 => Self::TemperatureLow,
            7 => Self::TemperatureHigh,
            8 => Self::PositionB0,
            9 => Self::PositionB1,
            10 => Self::PositionB2,
            11 => Self::PositionB3,
            12 => Self::SpeedB0,
            13 => Self::SpeedB1,
            14 => Self::SpeedB2,
            15 => Self::SpeedB3,
            16 => Self::Limit,
            17 => Self::LimitClr,
            18 => Self::Faults,
            19 => Self::StickyFaults,
            20 => Self::StickyFaultsClr,
            21 => Self::FaultCounter0,
            22 => Self::FaultCounter1,
            23 => Self::FaultCounter2,
            24 => Self::FaultCounter3,
            25 => Self::FaultCounter4,
            26 => Self::CanStatus,
            27 => Self::CanErrorLow,
            28 => Self::CanErrorHigh,
            255 => Self::End,
            _ => return None,
        })
    }

    /// Resolves this opcode to one byte of `snapshot`. `StickyFaultsClr` and
    /// `LimitClr` read the same byte their non-clearing counterparts do;
    /// the atomic clear they additionally perform needs a mutable
    /// controller reference this function does not have, so `PstatSlot::tick`
    /// special-cases both before falling through to this function for every
    /// other opcode.
    fn resolve(self, s: &Snapshot) -> u8 {
        match self {
            Self::VoltageOutLow => s.voltage_out.to_le_bytes()[0],
            Self::VoltageOutHigh => s.voltage_out.to_le_bytes()[1],
            Self::BusVoltageLow => s.bus_voltage.to_le_bytes()[0],
            Self::BusVoltageHigh => s.bus_voltage.to_le_bytes()[1],
            Self::CurrentLow => s.current.to_le_bytes()[0],
            Self::CurrentHigh => s.current.to_le_bytes()[1],
            Self::TemperatureLow => s.temperature.to_le_bytes()[0],
            Self::TemperatureHigh => s.temperature.to_le_bytes()[1],
            Self::PositionB0 => s.position.to_le_bytes()[0],
            Self::PositionB1 => s.position.to_le_bytes()[1],
            Self::PositionB2 => s.position.to_le_bytes()[2],
            Self::PositionB3 => s.position.to_le_bytes()[3],
            Self::SpeedB0 => s.speed.to_le_bytes()[0],
            Self::SpeedB1 => s.speed.to_le_bytes()[1],
            Self::SpeedB2 => s.speed.to_le_bytes()[2],
            Self::SpeedB3 => s.speed.to_le_bytes()[3],
            Self::Limit => s.limit,
            Self::LimitClr => s.limit_clr,
            Self::Faults => s.faults,
            Self::StickyFaults => s.sticky_faults,
            Self::StickyFaultsClr => s.sticky_faults,
            Self::FaultCounter0 => s.fault_counters[0],
            Self::FaultCounter1 => s.fault_counters[1],
            Self::FaultCounter2 => s.fault_counters[2],
            Self::FaultCounter3 => s.fault_counters[3],
            Self::FaultCounter4 => s.fault_counters[4],
            Self::CanStatus => s.can_status,
            Self::CanErrorLow => s.can_error.to_le_bytes()[0],
            Self::CanErrorHigh => s.can_error.to_le_bytes()[1],
            Self::End => 0,
        }
    }
}

pub const PSTAT_DESCRIPTOR_LEN: usize = 8;

#[derive(Clone, Copy)]
pub struct PstatSlot {
    period_ticks: u32,
    descriptor: [u8; PSTAT_DESCRIPTOR_LEN],
    countdown: u32,
}

impl Default for PstatSlot {
    fn default() -> Self {
        Self {
            period_ticks: 0,
            descriptor: [PstatOpcode::End as u8; PSTAT_DESCRIPTOR_LEN],
            countdown: 0,
        }
    }
}

impl PstatSlot {
    pub fn configure(&mut self, period_ticks: u32, descriptor: [u8; PSTAT_DESCRIPTOR_LEN]) {
        self.period_ticks = period_ticks;
        self.descriptor = descriptor;
        self.countdown = period_ticks;
    }

    /// Sets this slot's period independently of its descriptor
    /// (`pstat_per_en_Sn`); 0 disables the slot.
    fn set_period(&mut self, period_ticks: u32) {
        self.period_ticks = period_ticks;
        self.countdown = period_ticks;
    }

    /// Sets this slot's format descriptor independently of its period
    /// (`pstat_cfg_Sn`).
    fn set_descriptor(&mut self, descriptor: [u8; PSTAT_DESCRIPTOR_LEN]) {
        self.descriptor = descriptor;
    }

    fn tick(
        &mut self,
        snapshot: &Snapshot,
        controller: &mut Controller,
    ) -> Option<HVec<u8, PSTAT_DESCRIPTOR_LEN>> {
        if self.period_ticks == 0 {
            return None;
        }
        if self.countdown == 0 {
            self.countdown = self.period_ticks;
        } else {
            self.countdown -= 1;
            if self.countdown != 0 {
                return None;
            }
        }

        let mut out = HVec::new();
        for &byte in &self.descriptor {
            match PstatOpcode::from_byte(byte) {
                Some(PstatOpcode::End) | None => break,
                Some(PstatOpcode::StickyFaultsClr) => {
                    controller.faults_mut().sticky_clear_all();
                    let _ = out.push(snapshot.sticky_faults);
                }
                Some(PstatOpcode::LimitClr) => {
                    controller.limits_mut().clear_sticky();
                    let _ = out.push(snapshot.limit_clr);
                }
                Some(op) => {
                    let _ = out.push(op.resolve(snapshot));
                }
            }
        }
        Some(out)
    }
}

fn pstat_id(slot_index: u8, device_number: u8) -> u32 {
    CanId {
        device_type: crate::can::id::DEVICE_TYPE_MOTOR_CONTROLLER,
        manufacturer: crate::can::id::MANUFACTURER_LM,
        api_class: ApiClass::PeriodicStatus as u8,
        api_index: slot_index,
        device_number,
    }
    .encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultState;
    use crate::hbridge::HBridge;
    use crate::limits::Limits;
    use crate::param::{ParamBlock, RingParamStore};
    use crate::sensors::Sensors;

    fn new_controller() -> Controller {
        Controller::new(
            HBridge::new(10000, false),
            Sensors::new(1000),
            Limits::new(),
            FaultState::new(2),
            10000,
        )
    }

    fn voltage_set_id(devno: u8) -> u32 {
        CanId {
            device_type: crate::can::id::DEVICE_TYPE_MOTOR_CONTROLLER,
            manufacturer: crate::can::id::MANUFACTURER_LM,
            api_class: ApiClass::Voltage as u8,
            api_index: SetpointIndex::Set as u8,
            device_number: devno,
        }
        .encode()
    }

    #[test]
    fn voltage_set_applies_immediately_and_acks() {
        let mut controller = new_controller();
        let mut msg = Message::new(7);
        let mut params: Params<RingParamStore<2>> = Params::new(RingParamStore::new());

        let reply = msg.handle_frame(
            &mut controller,
            &mut params,
            voltage_set_id(7),
            &le16(16384),
        );
        assert!(reply.is_some());
        controller.tick();
        assert_eq!(controller.hbridge().last_duty(), 10000); // clamped to voltage_max
    }

    #[test]
    fn grouped_setpoints_defer_until_sync() {
        let mut controller = new_controller();
        let mut msg = Message::new(3);
        let mut params: Params<RingParamStore<2>> = Params::new(RingParamStore::new());

        let mut payload = Payload::new();
        let _ = payload.extend_from_slice(&le16(10000));
        let _ = payload.push(0x01);
        msg.handle_frame(&mut controller, &mut params, voltage_set_id(3), &payload);
        controller.tick();
        assert_eq!(controller.hbridge().last_duty(), 0, "must not apply before sync");

        let sync_id = system_id(SystemApi::Sync, 0);
        msg.handle_frame(&mut controller, &mut params, sync_id, &[0x01]);
        controller.tick();
        assert_eq!(controller.hbridge().last_duty(), 10000);
    }

    #[test]
    fn device_assign_zero_unassigns_immediately() {
        let mut controller = new_controller();
        let mut msg = Message::new(9);
        let mut params: Params<RingParamStore<2>> = Params::new(RingParamStore::new());

        let id = system_id(SystemApi::DeviceAssign, 0);
        msg.handle_frame(&mut controller, &mut params, id, &[0]);
        assert_eq!(msg.device_number(), 0);
    }

    #[test]
    fn device_assign_nonzero_requires_confirm_and_times_out_to_idle() {
        let mut controller = new_controller();
        let mut msg = Message::new(9);
        let mut params: Params<RingParamStore<2>> = Params::new(RingParamStore::new());

        let id = system_id(SystemApi::DeviceAssign, 0);
        msg.handle_frame(&mut controller, &mut params, id, &[12]);
        assert_eq!(msg.device_number(), 9, "not yet committed");

        for _ in 0..ASSIGN_TIMEOUT_TICKS {
            msg.tick_assign();
        }
        assert_eq!(msg.device_number(), 9, "times out without change (pending != current)");
    }

    #[test]
    fn device_assign_timeout_with_pending_equal_current_commits_zero() {
        let mut controller = new_controller();
        let mut msg = Message::new(9);
        let mut params: Params<RingParamStore<2>> = Params::new(RingParamStore::new());

        let id = system_id(SystemApi::DeviceAssign, 0);
        msg.handle_frame(&mut controller, &mut params, id, &[9]);
        for _ in 0..ASSIGN_TIMEOUT_TICKS {
            msg.tick_assign();
        }
        assert_eq!(msg.device_number(), 0);
    }

    #[test]
    fn confirm_button_commits_pending_assignment() {
        let mut controller = new_controller();
        let mut msg = Message::new(9);
        let mut params: Params<RingParamStore<2>> = Params::new(RingParamStore::new());

        let id = system_id(SystemApi::DeviceAssign, 0);
        msg.handle_frame(&mut controller, &mut params, id, &[12]);
        msg.confirm_button_press(&mut params);
        assert_eq!(msg.device_number(), 12);
        assert_eq!(params.block().device_number, 12);
    }

    #[test]
    fn pstat_slot_assembles_descriptor_until_end_marker() {
        let mut controller = new_controller();
        let mut slot = PstatSlot::default();
        let mut descriptor = [PstatOpcode::End as u8; PSTAT_DESCRIPTOR_LEN];
        descriptor[0] = PstatOpcode::Faults as u8;
        descriptor[1] = PstatOpcode::Limit as u8;
        slot.configure(1, descriptor);

        let snapshot = Snapshot::capture(&controller, CanStatus::default(), 1);
        let payload = slot.tick(&snapshot, &mut controller).unwrap();
        assert_eq!(payload.len(), 2);
    }

    #[test]
    fn pstat_disabled_slot_never_emits() {
        let mut controller = new_controller();
        let mut slot = PstatSlot::default();
        let snapshot = Snapshot::capture(&controller, CanStatus::default(), 1);
        assert!(slot.tick(&snapshot, &mut controller).is_none());
    }

    #[test]
    fn sticky_faults_clr_opcode_clears_sticky_latch() {
        let mut controller = new_controller();
        controller
            .faults_mut()
            .update(crate::fault::FaultKind::Current, true);
        controller
            .faults_mut()
            .update(crate::fault::FaultKind::Current, false);
        assert_ne!(controller.faults().sticky(), 0);

        let mut slot = PstatSlot::default();
        let mut descriptor = [PstatOpcode::End as u8; PSTAT_DESCRIPTOR_LEN];
        descriptor[0] = PstatOpcode::StickyFaultsClr as u8;
        slot.configure(1, descriptor);

        let snapshot = Snapshot::capture(&controller, CanStatus::default(), 1);
        let payload = slot.tick(&snapshot, &mut controller).unwrap();
        assert_ne!(payload[0], 0, "payload reflects the pre-clear value");
        assert_eq!(controller.faults().sticky(), 0, "sticky latch must be cleared");
    }

    #[test]
    fn limit_clr_opcode_clears_sticky_limit_latch() {
        let mut controller = new_controller();
        controller.limits_mut().poll_hardware(true, false);
        controller.limits_mut().poll_hardware(false, false);
        assert!(!controller.limits().sticky_forward_ok());

        let mut slot = PstatSlot::default();
        let mut descriptor = [PstatOpcode::End as u8; PSTAT_DESCRIPTOR_LEN];
        descriptor[0] = PstatOpcode::LimitClr as u8;
        slot.configure(1, descriptor);

        let snapshot = Snapshot::capture(&controller, CanStatus::default(), 1);
        let _ = slot.tick(&snapshot, &mut controller).unwrap();
        assert!(controller.limits().sticky_forward_ok());
    }

    #[test]
    fn setpoint_enable_switches_mode_and_cancels_pending() {
        let mut controller = new_controller();
        let mut msg = Message::new(4);
        let mut params: Params<RingParamStore<2>> = Params::new(RingParamStore::new());

        let mut grouped = Payload::new();
        let _ = grouped.extend_from_slice(&le16(1000));
        let _ = grouped.push(0x01);
        msg.handle_frame(&mut controller, &mut params, voltage_set_id(4), &grouped);

        let enable_id = CanId {
            device_type: crate::can::id::DEVICE_TYPE_MOTOR_CONTROLLER,
            manufacturer: crate::can::id::MANUFACTURER_LM,
            api_class: ApiClass::Speed as u8,
            api_index: SetpointIndex::Enable as u8,
            device_number: 4,
        }
        .encode();
        msg.handle_frame(&mut controller, &mut params, enable_id, &[]);
        assert_eq!(controller.mode(), ControlMode::Speed);

        let sync_id = system_id(SystemApi::Sync, 0);
        msg.handle_frame(&mut controller, &mut params, sync_id, &[0x01]);
        controller.tick();
        assert_eq!(
            controller.hbridge().last_duty(),
            0,
            "pending voltage setpoint must have been cancelled by the mode switch"
        );
    }

    #[test]
    fn configuration_class_writes_and_queries_voltage_max() {
        let mut controller = new_controller();
        let mut msg = Message::new(4);
        let mut params: Params<RingParamStore<2>> = Params::new(RingParamStore::new());

        let id = CanId {
            device_type: crate::can::id::DEVICE_TYPE_MOTOR_CONTROLLER,
            manufacturer: crate::can::id::MANUFACTURER_LM,
            api_class: ApiClass::Configuration as u8,
            api_index: ConfigApi::VoltageMax as u8,
            device_number: 4,
        }
        .encode();
        let reply = msg
            .handle_frame(&mut controller, &mut params, id, &5000u16.to_le_bytes())
            .unwrap();
        assert!(reply.payload.is_empty(), "write acknowledges with an empty payload");
        assert_eq!(controller.hbridge().voltage_max_get(), 5000);

        let query = msg.handle_frame(&mut controller, &mut params, id, &[]).unwrap();
        assert_eq!(query.payload.as_slice(), &5000u16.to_le_bytes());
    }

    #[test]
    fn status_class_reports_current_faults() {
        let mut controller = new_controller();
        let mut msg = Message::new(4);
        let mut params: Params<RingParamStore<2>> = Params::new(RingParamStore::new());
        controller
            .faults_mut()
            .update(crate::fault::FaultKind::Current, true);

        let id = CanId {
            device_type: crate::can::id::DEVICE_TYPE_MOTOR_CONTROLLER,
            manufacturer: crate::can::id::MANUFACTURER_LM,
            api_class: ApiClass::Status as u8,
            api_index: StatusApi::Faults as u8,
            device_number: 4,
        }
        .encode();
        let reply = msg.handle_frame(&mut controller, &mut params, id, &[]).unwrap();
        assert_eq!(reply.payload.as_slice(), &[controller.faults().active()]);
    }

    #[test]
    fn pstat_config_sets_period_and_descriptor_independently() {
        let mut msg = Message::new(4);

        let per_en_id = CanId {
            device_type: crate::can::id::DEVICE_TYPE_MOTOR_CONTROLLER,
            manufacturer: crate::can::id::MANUFACTURER_LM,
            api_class: ApiClass::PeriodicStatus as u8,
            api_index: 0,
            device_number: 4,
        }
        .encode();
        msg.handle_pstat_config(CanId::decode(per_en_id), &10u32.to_le_bytes());

        let mut descriptor = [PstatOpcode::End as u8; PSTAT_DESCRIPTOR_LEN];
        descriptor[0] = PstatOpcode::Faults as u8;
        let cfg_id = CanId {
            device_type: crate::can::id::DEVICE_TYPE_MOTOR_CONTROLLER,
            manufacturer: crate::can::id::MANUFACTURER_LM,
            api_class: ApiClass::PeriodicStatus as u8,
            api_index: 4,
            device_number: 4,
        }
        .encode();
        msg.handle_pstat_config(CanId::decode(cfg_id), &descriptor);

        assert_eq!(msg.pstat[0].period_ticks, 10);
        assert_eq!(msg.pstat[0].descriptor, descriptor);
    }
}
