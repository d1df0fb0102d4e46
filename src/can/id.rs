//! 29-bit extended CAN identifier encode/decode (spec.md §3): <device-type,
//! manufacturer, API-class, API-index, device-number>.
//!
//! Field widths follow the real Jaguar wire protocol rather than the
//! distilled 8/8/6/4/6 description (which sums to 32 bits and cannot fit a
//! 29-bit extended identifier): device-type is 5 bits, not 8. The other four
//! fields match exactly.

pub const DEVICE_TYPE_BITS: u32 = 5;
pub const MANUFACTURER_BITS: u32 = 8;
pub const API_CLASS_BITS: u32 = 6;
pub const API_INDEX_BITS: u32 = 4;
pub const DEVICE_NUMBER_BITS: u32 = 6;

const DEVICE_NUMBER_SHIFT: u32 = 0;
const API_INDEX_SHIFT: u32 = DEVICE_NUMBER_SHIFT + DEVICE_NUMBER_BITS;
const API_CLASS_SHIFT: u32 = API_INDEX_SHIFT + API_INDEX_BITS;
const MANUFACTURER_SHIFT: u32 = API_CLASS_SHIFT + API_CLASS_BITS;
const DEVICE_TYPE_SHIFT: u32 = MANUFACTURER_SHIFT + MANUFACTURER_BITS;

pub const DEVICE_NUMBER_MASK: u32 = ((1 << DEVICE_NUMBER_BITS) - 1) << DEVICE_NUMBER_SHIFT;
pub const API_INDEX_MASK: u32 = ((1 << API_INDEX_BITS) - 1) << API_INDEX_SHIFT;
pub const API_CLASS_MASK: u32 = ((1 << API_CLASS_BITS) - 1) << API_CLASS_SHIFT;
pub const MANUFACTURER_MASK: u32 = ((1 << MANUFACTURER_BITS) - 1) << MANUFACTURER_SHIFT;
pub const DEVICE_TYPE_MASK: u32 = ((1 << DEVICE_TYPE_BITS) - 1) << DEVICE_TYPE_SHIFT;

/// Everything except device-number: identifies the API regardless of which
/// device is addressed, used throughout the Message layer's dispatch.
pub const API_MASK: u32 = DEVICE_TYPE_MASK | MANUFACTURER_MASK | API_CLASS_MASK | API_INDEX_MASK;

pub const DEVICE_TYPE_MOTOR_CONTROLLER: u8 = 2;
pub const MANUFACTURER_LM: u8 = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CanId {
    pub device_type: u8,
    pub manufacturer: u8,
    pub api_class: u8,
    pub api_index: u8,
    pub device_number: u8,
}

impl CanId {
    pub fn encode(self) -> u32 {
        ((self.device_type as u32) << DEVICE_TYPE_SHIFT)
            | ((self.manufacturer as u32) << MANUFACTURER_SHIFT)
            | ((self.api_class as u32) << API_CLASS_SHIFT)
            | ((self.api_index as u32) << API_INDEX_SHIFT)
            | ((self.device_number as u32) << DEVICE_NUMBER_SHIFT)
    }

    pub fn decode(raw: u32) -> Self {
        Self {
            device_type: ((raw & DEVICE_TYPE_MASK) >> DEVICE_TYPE_SHIFT) as u8,
            manufacturer: ((raw & MANUFACTURER_MASK) >> MANUFACTURER_SHIFT) as u8,
            api_class: ((raw & API_CLASS_MASK) >> API_CLASS_SHIFT) as u8,
            api_index: ((raw & API_INDEX_MASK) >> API_INDEX_SHIFT) as u8,
            device_number: ((raw & DEVICE_NUMBER_MASK) >> DEVICE_NUMBER_SHIFT) as u8,
        }
    }

    /// The API portion of this id with device-number masked to zero, used to
    /// match a frame against a well-known broadcast/class identifier.
    pub fn api_bits(self) -> u32 {
        self.encode() & API_MASK
    }
}

/// API classes, per spec.md §4.9's per-class handler list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ApiClass {
    System = 0,
    Voltage = 1,
    VComp = 2,
    Current = 3,
    Speed = 4,
    Position = 5,
    Status = 6,
    Configuration = 7,
    PeriodicStatus = 8,
    Update = 9,
}

/// System-class API indices, the well-known broadcast identifiers of
/// spec.md §4.7/§6.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SystemApi {
    Halt = 0,
    Resume = 1,
    Reset = 2,
    Enumerate = 3,
    DeviceAssign = 4,
    DeviceQuery = 5,
    FirmwareVersion = 6,
    Heartbeat = 7,
    Sync = 8,
    Update = 9,
}

pub fn system_id(api: SystemApi, device_number: u8) -> u32 {
    CanId {
        device_type: DEVICE_TYPE_MOTOR_CONTROLLER,
        manufacturer: MANUFACTURER_LM,
        api_class: ApiClass::System as u8,
        api_index: api as u8,
        device_number,
    }
    .encode()
}

pub fn ack_id(device_number: u8) -> u32 {
    // The ACK identifier borrows the System class's top unused index; real
    // hardware reuses `CAN_MSGID_API_ACK` in the same class for this.
    CanId {
        device_type: DEVICE_TYPE_MOTOR_CONTROLLER,
        manufacturer: MANUFACTURER_LM,
        api_class: ApiClass::System as u8,
        api_index: 0x0f,
        device_number,
    }
    .encode()
}
