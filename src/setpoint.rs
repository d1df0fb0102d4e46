//! Control mode and setpoint model (spec.md §3): a tagged variant over the
//! five control modes, a target/actual/ramp-rate setpoint per mode, and a
//! pending-setpoint record used by the grouped synchronized update
//! mechanism (§4.7's sync command, §4.9's grouped setpoints).
//!
//! Generalizes the teacher's re-architecture note about a `pending<T>`
//! struct parameterized over value type into a fixed array of identically
//! shaped slots, one per mode.

use crate::fixed::{ramp_step, Q16_16, Q8_8};
use crate::sensors::{PositionSource, SpeedSource};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ControlMode {
    Voltage,
    VComp,
    Current,
    Speed,
    Position,
}

/// One ramped value: a commanded `target` and the currently-applied
/// `actual`, stepped toward `target` by `rate` each tick.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ramped {
    pub target: i32,
    pub actual: i32,
    pub rate: i32,
}

impl Ramped {
    pub fn set_target(&mut self, target: i32) {
        self.target = target;
    }

    pub fn tick(&mut self) {
        self.actual = ramp_step(self.actual, self.target, self.rate);
    }

    /// Snaps `actual` (and `target`) to `value` with no ramping, used on
    /// mode entry so the newly active mode engages smoothly at the
    /// sensor's current reading (spec.md §4.5).
    pub fn snap(&mut self, value: i32) {
        self.actual = value;
        self.target = value;
    }
}

/// Which of the five setpoint slots a pending-update or sync operation
/// addresses.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SetpointSlot {
    Voltage,
    VComp,
    Current,
    Speed,
    Position,
}

pub const NUM_SLOTS: usize = 5;
pub const ALL_SLOTS: [SetpointSlot; NUM_SLOTS] = [
    SetpointSlot::Voltage,
    SetpointSlot::VComp,
    SetpointSlot::Current,
    SetpointSlot::Speed,
    SetpointSlot::Position,
];

/// A deferred setpoint: a value and the group mask it is pending under.
/// `mask == 0` means nothing is pending in this slot.
#[derive(Clone, Copy, Debug, Default)]
struct Pending {
    value: i32,
    mask: u8,
}

/// Holds all five pending-setpoint slots. Owned by the Message layer per
/// spec.md §3's ownership rules; the Controller never reads this directly
/// except through `Command` application at commit time.
#[derive(Default)]
pub struct PendingSetpoints {
    slots: [Pending; NUM_SLOTS],
}

impl PendingSetpoints {
    /// Stores `value` under `group_mask` for `slot`, displacing whatever
    /// was previously pending there. `group_mask == 0` is not a valid call
    /// site for this function: callers apply immediately instead (spec.md
    /// §4.9).
    pub fn defer(&mut self, slot: SetpointSlot, value: i32, group_mask: u8) {
        self.slots[slot as usize] = Pending {
            value,
            mask: group_mask,
        };
    }

    pub fn cancel_all(&mut self) {
        self.slots = [Pending::default(); NUM_SLOTS];
    }

    /// Runs the sync commit: for each slot whose pending mask ANDs non-zero
    /// with `group_byte`, invokes `apply` with the slot and its pending
    /// value, then clears that slot's mask. Returns nothing; `apply` is
    /// expected to route into the Command layer.
    pub fn commit(&mut self, group_byte: u8, mut apply: impl FnMut(SetpointSlot, i32)) {
        for (idx, slot) in ALL_SLOTS.into_iter().enumerate() {
            let pending = &mut self.slots[idx];
            if pending.mask & group_byte != 0 {
                apply(slot, pending.value);
                pending.mask = 0;
            }
        }
    }
}

/// Per-mode setpoint storage, one `Ramped` value per mode. The active
/// mode's slot is driven by `Controller::tick`; the others sit idle.
pub struct Setpoints {
    pub voltage: Ramped,
    pub vcomp_in: Ramped,
    pub vcomp_comp: Ramped,
    pub current: Ramped,
    pub speed: Ramped,
    pub position: Ramped,
    pub speed_src: SpeedSource,
    pub position_src: PositionSource,
}

impl Setpoints {
    pub fn new() -> Self {
        Self {
            voltage: Ramped::default(),
            vcomp_in: Ramped::default(),
            vcomp_comp: Ramped::default(),
            current: Ramped::default(),
            speed: Ramped::default(),
            position: Ramped::default(),
            speed_src: SpeedSource::Encoder,
            position_src: PositionSource::Encoder,
        }
    }
}

impl Default for Setpoints {
    fn default() -> Self {
        Self::new()
    }
}

pub type Current = Q8_8;
pub type Speed = Q16_16;
pub type Position = Q16_16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defer_then_commit_applies_on_matching_group() {
        let mut pending = PendingSetpoints::default();
        pending.defer(SetpointSlot::Voltage, 1234, 0x01);
        pending.defer(SetpointSlot::Speed, 5678, 0x01);

        let mut applied = alloc_applied();
        pending.commit(0x02, |slot, value| applied.push((slot, value)));
        assert!(applied.is_empty(), "non-matching group must not commit");

        pending.commit(0x01, |slot, value| applied.push((slot, value)));
        assert_eq!(applied.len(), 2);
    }

    #[test]
    fn group_zero_pending_is_never_stored_as_deferred() {
        // Callers are expected to apply group==0 immediately rather than
        // calling `defer`; `commit` with group_byte 0 never matches
        // anything already deferred under a nonzero mask.
        let mut pending = PendingSetpoints::default();
        pending.defer(SetpointSlot::Current, 1, 0x04);
        let mut applied = alloc_applied();
        pending.commit(0, |slot, value| applied.push((slot, value)));
        assert!(applied.is_empty());
    }

    #[test]
    fn cancel_all_clears_every_slot() {
        let mut pending = PendingSetpoints::default();
        pending.defer(SetpointSlot::Position, 1, 0xff);
        pending.cancel_all();
        let mut applied = alloc_applied();
        pending.commit(0xff, |slot, value| applied.push((slot, value)));
        assert!(applied.is_empty());
    }

    #[test]
    fn ramped_snap_sets_both_target_and_actual() {
        let mut r = Ramped::default();
        r.rate = 1;
        r.snap(500);
        assert_eq!(r.actual, 500);
        assert_eq!(r.target, 500);
        r.tick();
        assert_eq!(r.actual, 500, "snap must not require ramping to arrive");
    }

    fn alloc_applied() -> std::vec::Vec<(SetpointSlot, i32)> {
        std::vec::Vec::new()
    }
}
