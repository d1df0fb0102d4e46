//! H-bridge driver (spec.md §4.2): turns a signed duty request into a
//! forward/reverse/neutral PWM command, enforcing the configured max-output
//! clamp and the brake/coast neutral policy.

use defmt::Format;

/// Neutral policy when the commanded duty is zero.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub enum NeutralMode {
    /// Both low-side switches on; shorts the motor terminals.
    Brake,
    /// All switches off; motor terminals float.
    Coast,
}

/// Direction the bridge is currently driving, used to enforce the
/// "transitions pass through neutral for at least one PWM period"
/// invariant from spec.md §4.2.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
enum Polarity {
    Forward,
    Reverse,
    Neutral,
}

pub struct HBridge {
    voltage_max: u16,
    neutral_mode: NeutralMode,
    /// Set by hardware jumper; when true, `brake_coast_set` is a no-op.
    neutral_mode_locked: bool,
    polarity: Polarity,
    /// The last duty actually written to the hardware (post-clamp,
    /// post-neutral-forcing), in the same units as the Voltage setpoint.
    last_duty: i16,
}

impl HBridge {
    pub fn new(voltage_max: u16, neutral_mode_locked: bool) -> Self {
        Self {
            voltage_max,
            neutral_mode: NeutralMode::Coast,
            neutral_mode_locked,
            polarity: Polarity::Neutral,
            last_duty: 0,
        }
    }

    pub fn voltage_max_get(&self) -> u16 {
        self.voltage_max
    }

    pub fn voltage_max_set(&mut self, max: u16) {
        self.voltage_max = max;
    }

    pub fn brake_coast_get(&self) -> NeutralMode {
        self.neutral_mode
    }

    /// Writes are ignored when the neutral mode is locked by a hardware
    /// jumper, per spec.md §4.2.
    pub fn brake_coast_set(&mut self, mode: NeutralMode) {
        if !self.neutral_mode_locked {
            self.neutral_mode = mode;
        }
    }

    pub fn last_duty(&self) -> i16 {
        self.last_duty
    }

    /// Applies a signed duty command. The magnitude is clamped to
    /// `voltage_max` first; the sign then selects polarity, with a
    /// mandatory neutral step inserted between opposite polarities.
    pub fn set(&mut self, duty: i16) {
        let clamped = clamp_to_max(duty, self.voltage_max);
        let target_polarity = if clamped > 0 {
            Polarity::Forward
        } else if clamped < 0 {
            Polarity::Reverse
        } else {
            Polarity::Neutral
        };

        let reversing = matches!(
            (self.polarity, target_polarity),
            (Polarity::Forward, Polarity::Reverse) | (Polarity::Reverse, Polarity::Forward)
        );

        if reversing {
            // Shoot-through guard: force one neutral period before flipping
            // polarity. The caller's next `set` call (one PWM period later,
            // since this runs once per control tick) will then apply the
            // requested polarity.
            self.polarity = Polarity::Neutral;
            self.last_duty = 0;
            return;
        }

        self.polarity = target_polarity;
        self.last_duty = clamped;
    }

    /// The regulator's escape hatch: halt and any active fault route here.
    pub fn force_neutral(&mut self) {
        self.polarity = Polarity::Neutral;
        self.last_duty = 0;
    }
}

fn clamp_to_max(duty: i16, max: u16) -> i16 {
    let max = max.min(i16::MAX as u16) as i32;
    let d = duty as i32;
    if d > max {
        max as i16
    } else if d < -max {
        -(max as i16)
    } else {
        duty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_to_voltage_max() {
        let mut hb = HBridge::new(10000, false);
        hb.set(32767);
        assert_eq!(hb.last_duty(), 10000);
        hb.set(-32768);
        assert_eq!(hb.last_duty(), -10000);
    }

    #[test]
    fn output_magnitude_never_exceeds_max_for_any_input() {
        let mut hb = HBridge::new(5000, false);
        for duty in [-32768i16, -5001, -5000, -1, 0, 1, 5000, 5001, 32767] {
            hb.set(duty);
            assert!(hb.last_duty().unsigned_abs() <= 5000);
        }
    }

    #[test]
    fn reversal_passes_through_neutral() {
        let mut hb = HBridge::new(10000, false);
        hb.set(5000);
        assert_eq!(hb.last_duty(), 5000);
        hb.set(-5000);
        // First call after a polarity flip must land on neutral.
        assert_eq!(hb.last_duty(), 0);
        hb.set(-5000);
        assert_eq!(hb.last_duty(), -5000);
    }

    #[test]
    fn same_sign_updates_do_not_force_neutral() {
        let mut hb = HBridge::new(10000, false);
        hb.set(1000);
        hb.set(2000);
        assert_eq!(hb.last_duty(), 2000);
    }

    #[test]
    fn locked_jumper_ignores_policy_writes() {
        let mut hb = HBridge::new(10000, true);
        hb.brake_coast_set(NeutralMode::Brake);
        assert_eq!(hb.brake_coast_get(), NeutralMode::Coast);
    }

    #[test]
    fn force_neutral_overrides_any_pending_duty() {
        let mut hb = HBridge::new(10000, false);
        hb.set(5000);
        hb.force_neutral();
        assert_eq!(hb.last_duty(), 0);
    }
}
