//! Command layer (spec.md §4.6): a thin, validated facade over the
//! Controller's setpoints, PID gains and mode. CAN, UART and the servo link
//! all route their immediate (non-grouped) updates through this module;
//! grouped/deferred updates go through `setpoint::PendingSetpoints` and
//! land here only at sync-commit time.
//!
//! Every setter silently rejects while the controller is halted, per
//! spec.md §4.6 — a halted controller does not acknowledge motion commands,
//! though configuration such as PID gains still applies so a link can stage
//! values ahead of a resume.

use crate::controller::Controller;
use crate::fixed::Q16_16;
use crate::hbridge::NeutralMode;
use crate::limits::SoftLimitMode;
use crate::sensors::{PositionSource, SpeedSource};
use crate::setpoint::ControlMode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandError {
    /// The controller is halted; motion setpoints are rejected.
    Halted,
    OutOfRange,
}

type Result<T = ()> = core::result::Result<T, CommandError>;

fn reject_if_halted(c: &Controller) -> Result {
    if c.halted() {
        Err(CommandError::Halted)
    } else {
        Ok(())
    }
}

pub fn set_mode(c: &mut Controller, mode: ControlMode) {
    // Mode switches are always accepted, halted or not: a link needs to be
    // able to select a mode before issuing a resume.
    c.set_mode(mode);
}

pub fn force_neutral(c: &mut Controller) {
    c.hbridge_force_neutral();
}

pub fn set_voltage(c: &mut Controller, target: i16) -> Result {
    reject_if_halted(c)?;
    c.setpoints_mut().voltage.set_target(target as i32);
    Ok(())
}

pub fn set_voltage_rate(c: &mut Controller, rate: i32) -> Result {
    if rate < 0 {
        return Err(CommandError::OutOfRange);
    }
    c.setpoints_mut().voltage.rate = rate;
    Ok(())
}

pub fn set_vcomp(c: &mut Controller, target: i16) -> Result {
    reject_if_halted(c)?;
    c.setpoints_mut().vcomp_in.set_target(target as i32);
    Ok(())
}

pub fn set_vcomp_in_ramp(c: &mut Controller, rate: i32) -> Result {
    if rate < 0 {
        return Err(CommandError::OutOfRange);
    }
    c.setpoints_mut().vcomp_in.rate = rate;
    Ok(())
}

pub fn set_vcomp_comp_ramp(c: &mut Controller, rate: i32) -> Result {
    if rate < 0 {
        return Err(CommandError::OutOfRange);
    }
    c.setpoints_mut().vcomp_comp.rate = rate;
    Ok(())
}

pub fn set_current(c: &mut Controller, target: Q16_16) -> Result {
    reject_if_halted(c)?;
    c.setpoints_mut().current.set_target(target);
    Ok(())
}

pub fn set_current_p(c: &mut Controller, p: Q16_16) {
    c.pid_current_mut().set_p(p);
}

pub fn set_current_i(c: &mut Controller, i: Q16_16) {
    c.pid_current_mut().set_i(i);
}

pub fn set_current_d(c: &mut Controller, d: Q16_16) {
    c.pid_current_mut().set_d(d);
}

pub fn set_speed(c: &mut Controller, target: Q16_16) -> Result {
    reject_if_halted(c)?;
    c.setpoints_mut().speed.set_target(target);
    Ok(())
}

pub fn set_speed_p(c: &mut Controller, p: Q16_16) {
    c.pid_speed_mut().set_p(p);
}

pub fn set_speed_i(c: &mut Controller, i: Q16_16) {
    c.pid_speed_mut().set_i(i);
}

pub fn set_speed_d(c: &mut Controller, d: Q16_16) {
    c.pid_speed_mut().set_d(d);
}

pub fn set_speed_src(c: &mut Controller, src: SpeedSource) {
    c.setpoints_mut().speed_src = src;
}

pub fn set_position(c: &mut Controller, target: Q16_16) -> Result {
    reject_if_halted(c)?;
    c.setpoints_mut().position.set_target(target);
    Ok(())
}

pub fn set_position_p(c: &mut Controller, p: Q16_16) {
    c.pid_position_mut().set_p(p);
}

pub fn set_position_i(c: &mut Controller, i: Q16_16) {
    c.pid_position_mut().set_i(i);
}

pub fn set_position_d(c: &mut Controller, d: Q16_16) {
    c.pid_position_mut().set_d(d);
}

pub fn set_position_src(c: &mut Controller, src: PositionSource) {
    c.setpoints_mut().position_src = src;
}

// --- Configuration-class facades (spec.md §4.9's `configuration` handler).
// These apply regardless of halt state, matching the gain setters above: a
// link stages board configuration whether or not the regulator is running.

pub fn set_voltage_max(c: &mut Controller, max: u16) {
    c.hbridge_mut().voltage_max_set(max);
}

pub fn set_brake_coast(c: &mut Controller, mode: NeutralMode) {
    c.hbridge_mut().brake_coast_set(mode);
}

pub fn set_pot_turns(c: &mut Controller, turns: u16) {
    c.sensors_mut().pot_turns_set(turns);
}

pub fn set_encoder_lines(c: &mut Controller, lines: u16) {
    c.sensors_mut().encoder_lines_set(lines);
}

pub fn set_limit_mode(c: &mut Controller, mode: SoftLimitMode) {
    c.limits_mut().mode_set(mode);
}

pub fn set_fault_time(c: &mut Controller, ticks: u32) {
    c.faults_mut().hold_off_ticks_set(ticks);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultState;
    use crate::hbridge::HBridge;
    use crate::limits::Limits;
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

    #[test]
    fn motion_setpoints_rejected_while_halted() {
        let mut c = new_controller();
        c.halt_set(true);
        assert_eq!(set_voltage(&mut c, 1000), Err(CommandError::Halted));
        assert_eq!(set_current(&mut c, 100), Err(CommandError::Halted));
        assert_eq!(set_speed(&mut c, 100), Err(CommandError::Halted));
        assert_eq!(set_position(&mut c, 100), Err(CommandError::Halted));
    }

    #[test]
    fn mode_switch_accepted_even_while_halted() {
        let mut c = new_controller();
        c.halt_set(true);
        set_mode(&mut c, ControlMode::Speed);
        assert_eq!(c.mode(), ControlMode::Speed);
    }

    #[test]
    fn negative_ramp_rate_is_out_of_range() {
        let mut c = new_controller();
        assert_eq!(set_voltage_rate(&mut c, -1), Err(CommandError::OutOfRange));
    }

    #[test]
    fn gains_apply_even_while_halted() {
        let mut c = new_controller();
        c.halt_set(true);
        set_current_p(&mut c, 1 << 16);
        assert_eq!(c.pid_current_mut().gains().p, 1 << 16);
    }

    #[test]
    fn configuration_facades_apply_even_while_halted() {
        let mut c = new_controller();
        c.halt_set(true);
        set_voltage_max(&mut c, 8000);
        assert_eq!(c.hbridge().voltage_max_get(), 8000);
        set_brake_coast(&mut c, crate::hbridge::NeutralMode::Brake);
        assert_eq!(c.hbridge().brake_coast_get(), crate::hbridge::NeutralMode::Brake);
        set_pot_turns(&mut c, 5);
        assert_eq!(c.sensors().pot_turns_get(), 5);
        set_encoder_lines(&mut c, 500);
        assert_eq!(c.sensors().encoder_lines_get(), 500);
        set_limit_mode(&mut c, crate::limits::SoftLimitMode::Both);
        assert_eq!(c.limits().mode_get(), crate::limits::SoftLimitMode::Both);
        set_fault_time(&mut c, 42);
        assert_eq!(c.faults().hold_off_ticks_get(), 42);
    }
}
