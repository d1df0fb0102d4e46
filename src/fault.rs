//! Fault state (spec.md §3, §4.5, §7): a bitfield of active faults, a
//! sticky mirror that only clears on request, per-kind counters, and a
//! configurable hold-off time before a cleared condition actually drops
//! the active bit.

use defmt::Format;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
#[repr(u8)]
pub enum FaultKind {
    Current = 0,
    Temperature = 1,
    BusVoltage = 2,
    GateDriver = 3,
    Communication = 4,
}

pub const NUM_FAULT_KINDS: usize = 5;
const ALL_KINDS: [FaultKind; NUM_FAULT_KINDS] = [
    FaultKind::Current,
    FaultKind::Temperature,
    FaultKind::BusVoltage,
    FaultKind::GateDriver,
    FaultKind::Communication,
];

fn bit(kind: FaultKind) -> u8 {
    1 << (kind as u8)
}

pub struct FaultState {
    active: u8,
    sticky: u8,
    counters: [u32; NUM_FAULT_KINDS],
    /// Ticks since each kind's condition last cleared; `None` while the
    /// condition is still present.
    clear_countdown: [Option<u32>; NUM_FAULT_KINDS],
    hold_off_ticks: u32,
}

impl FaultState {
    pub fn new(hold_off_ticks: u32) -> Self {
        Self {
            active: 0,
            sticky: 0,
            counters: [0; NUM_FAULT_KINDS],
            clear_countdown: [None; NUM_FAULT_KINDS],
            hold_off_ticks,
        }
    }

    pub fn hold_off_ticks_get(&self) -> u32 {
        self.hold_off_ticks
    }

    pub fn hold_off_ticks_set(&mut self, ticks: u32) {
        self.hold_off_ticks = ticks;
    }

    pub fn active(&self) -> u8 {
        self.active
    }

    pub fn sticky(&self) -> u8 {
        self.sticky
    }

    pub fn any_active(&self) -> bool {
        self.active != 0
    }

    pub fn counter(&self, kind: FaultKind) -> u32 {
        self.counters[kind as usize]
    }

    /// Call once per control tick per fault kind with whether the raw
    /// condition is currently present. Transitions the active bit
    /// (set immediately, cleared only after `hold_off_ticks` of the
    /// condition being continuously absent) and latches the sticky bit.
    pub fn update(&mut self, kind: FaultKind, condition_present: bool) {
        let idx = kind as usize;
        let b = bit(kind);

        if condition_present {
            if self.active & b == 0 {
                self.counters[idx] = self.counters[idx].saturating_add(1);
            }
            self.active |= b;
            self.sticky |= b;
            self.clear_countdown[idx] = None;
            return;
        }

        if self.active & b == 0 {
            return;
        }

        match self.clear_countdown[idx] {
            None => self.clear_countdown[idx] = Some(self.hold_off_ticks),
            Some(0) => {
                self.active &= !b;
                self.clear_countdown[idx] = None;
            }
            Some(remaining) => self.clear_countdown[idx] = Some(remaining - 1),
        }
    }

    /// Clears the sticky bit for `kind`, atomically returning whether it
    /// was set beforehand (matches the "status-read with clear=true"
    /// scenario from spec.md §8).
    pub fn sticky_clear(&mut self, kind: FaultKind) -> bool {
        let b = bit(kind);
        let was_set = self.sticky & b != 0;
        self.sticky &= !b;
        was_set
    }

    pub fn sticky_clear_all(&mut self) {
        self.sticky = 0;
    }

    pub fn tick_all(&mut self, conditions: [bool; NUM_FAULT_KINDS]) {
        for (kind, present) in ALL_KINDS.into_iter().zip(conditions) {
            self.update(kind, present);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trip_sets_active_and_sticky_immediately() {
        let mut f = FaultState::new(5);
        f.update(FaultKind::Current, true);
        assert!(f.any_active());
        assert_ne!(f.sticky() & 0b1, 0);
    }

    #[test]
    fn active_clears_only_after_hold_off_elapses() {
        let mut f = FaultState::new(3);
        f.update(FaultKind::Current, true);
        f.update(FaultKind::Current, false);
        assert!(f.any_active(), "must still be active during hold-off");
        f.update(FaultKind::Current, false);
        f.update(FaultKind::Current, false);
        assert!(f.any_active());
        f.update(FaultKind::Current, false);
        assert!(!f.any_active());
    }

    #[test]
    fn hold_off_resets_if_condition_reappears() {
        let mut f = FaultState::new(3);
        f.update(FaultKind::Current, true);
        f.update(FaultKind::Current, false);
        f.update(FaultKind::Current, false);
        f.update(FaultKind::Current, true); // reappears mid hold-off
        f.update(FaultKind::Current, false);
        f.update(FaultKind::Current, false);
        assert!(f.any_active(), "hold-off should have restarted");
    }

    #[test]
    fn sticky_only_clears_on_explicit_request() {
        let mut f = FaultState::new(0);
        f.update(FaultKind::Temperature, true);
        f.update(FaultKind::Temperature, false);
        assert!(!f.any_active());
        assert_ne!(f.sticky() & bit(FaultKind::Temperature), 0);
        assert!(f.sticky_clear(FaultKind::Temperature));
        assert_eq!(f.sticky() & bit(FaultKind::Temperature), 0);
        assert!(!f.sticky_clear(FaultKind::Temperature));
    }

    #[test]
    fn counters_increment_once_per_trip_not_per_tick() {
        let mut f = FaultState::new(0);
        f.update(FaultKind::GateDriver, true);
        f.update(FaultKind::GateDriver, true);
        f.update(FaultKind::GateDriver, true);
        assert_eq!(f.counter(FaultKind::GateDriver), 1);
        f.update(FaultKind::GateDriver, false);
        f.update(FaultKind::GateDriver, true);
        assert_eq!(f.counter(FaultKind::GateDriver), 2);
    }
}
