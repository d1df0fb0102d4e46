//! Servo pulse input (spec.md §4/§6): pulse-width-to-command interpretation,
//! link validity, and the three-state calibration process.
//!
//! Grounded in `original_source/.../servo_if.c`'s `ServoIFPulseInterpret`
//! (linear scaling) and `ServoIFCalibrationStart/End/Abort` (the exact
//! validation chain this module's `calibration_end` reproduces).

use crate::fault::FaultKind::Communication;
use crate::fault::FaultState;

pub const DEFAULT_NEUTRAL_WIDTH: u32 = 1500;
pub const DEFAULT_MIN_WIDTH: u32 = 750;
pub const DEFAULT_MAX_WIDTH: u32 = 2250;

/// Valid absolute pulse-width and period bounds; outside these the signal is
/// not a servo pulse at all and the link is declared lost, independent of
/// calibration.
pub const VALID_WIDTH_MIN: u32 = 300;
pub const VALID_WIDTH_MAX: u32 = 2700;
pub const VALID_PERIOD_MIN: u32 = 10_000;
pub const VALID_PERIOD_MAX: u32 = 30_000;

/// Tolerance, in the same width units, used by calibration validation.
const NEUTRAL_SLOP: u32 = 100;
const RANGE_MIN: u32 = 200;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ServoWidths {
    pub negative: u32,
    pub neutral: u32,
    pub positive: u32,
}

impl Default for ServoWidths {
    fn default() -> Self {
        Self {
            negative: DEFAULT_NEUTRAL_WIDTH - DEFAULT_MIN_WIDTH,
            neutral: DEFAULT_NEUTRAL_WIDTH,
            positive: DEFAULT_MAX_WIDTH - DEFAULT_NEUTRAL_WIDTH,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PulseResult {
    /// Width or period fell outside the valid absolute range.
    LinkLost,
    /// Calibration is active; the pulse was logged, not interpreted.
    Calibrating,
    Command(i16),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CalibrationState {
    Idle,
    Active {
        min_width: u32,
        max_width: u32,
        last_width: u32,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CalibrationStartError {
    /// A fault other than Communication is active.
    FaultActive,
    /// The servo link is not the currently active command source.
    NotActiveLink,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CalibrationEndError {
    /// Calibration was not active; nothing to end.
    NotCalibrating,
    /// Collected widths failed validation; calibration returns to idle with
    /// the prior widths unchanged.
    Invalid,
}

pub struct Servo {
    widths: ServoWidths,
    calibration: CalibrationState,
}

impl Servo {
    pub fn new(widths: ServoWidths) -> Self {
        Self {
            widths,
            calibration: CalibrationState::Idle,
        }
    }

    pub fn widths(&self) -> ServoWidths {
        self.widths
    }

    pub fn calibrating(&self) -> bool {
        !matches!(self.calibration, CalibrationState::Idle)
    }

    /// Starts calibration, per spec.md §4's restriction: refused if any
    /// fault other than Communication is active, or if the servo link is
    /// not presently the active command source (`original_source`'s
    /// `ControllerLinkType() != LINK_TYPE_SERVO` check).
    pub fn calibration_start(
        &mut self,
        faults: &FaultState,
        servo_is_active_link: bool,
    ) -> Result<(), CalibrationStartError> {
        if faults.active() & !(1 << Communication as u8) != 0 {
            return Err(CalibrationStartError::FaultActive);
        }
        if !servo_is_active_link {
            return Err(CalibrationStartError::NotActiveLink);
        }
        self.calibration = CalibrationState::Active {
            min_width: u32::MAX,
            max_width: 0,
            last_width: self.widths.neutral,
        };
        Ok(())
    }

    pub fn calibration_abort(&mut self) {
        self.calibration = CalibrationState::Idle;
    }

    /// Validates the collected samples and, on success, commits the new
    /// widths. Reproduces `ServoIFCalibrationEnd`'s five checks exactly.
    pub fn calibration_end(&mut self) -> Result<ServoWidths, CalibrationEndError> {
        let CalibrationState::Active {
            min_width,
            max_width,
            last_width,
        } = self.calibration
        else {
            return Err(CalibrationEndError::NotCalibrating);
        };
        self.calibration = CalibrationState::Idle;

        if min_width > last_width || last_width > max_width {
            return Err(CalibrationEndError::Invalid);
        }
        if last_width.abs_diff(DEFAULT_NEUTRAL_WIDTH) > NEUTRAL_SLOP {
            return Err(CalibrationEndError::Invalid);
        }

        let diff1 = last_width - min_width;
        let diff2 = max_width - last_width;
        if diff1 < RANGE_MIN || diff2 < RANGE_MIN {
            return Err(CalibrationEndError::Invalid);
        }
        if diff1.abs_diff(diff2) > NEUTRAL_SLOP {
            return Err(CalibrationEndError::Invalid);
        }

        self.widths = ServoWidths {
            negative: diff1,
            neutral: last_width,
            positive: diff2,
        };
        Ok(self.widths)
    }

    /// Feeds one measured pulse. Width/period validity is checked before
    /// calibration-vs-interpret branching, matching `ServoIFIntHandler`'s
    /// ordering: an out-of-range pulse declares link-lost regardless of
    /// calibration state.
    pub fn on_pulse(&mut self, width: u32, period: u32) -> PulseResult {
        if !(VALID_WIDTH_MIN..=VALID_WIDTH_MAX).contains(&width)
            || !(VALID_PERIOD_MIN..=VALID_PERIOD_MAX).contains(&period)
        {
            return PulseResult::LinkLost;
        }

        if let CalibrationState::Active {
            min_width,
            max_width,
            ..
        } = &mut self.calibration
        {
            *min_width = (*min_width).min(width);
            *max_width = (*max_width).max(width);
            self.calibration = CalibrationState::Active {
                min_width: *min_width,
                max_width: *max_width,
                last_width: width,
            };
            return PulseResult::Calibrating;
        }

        PulseResult::Command(self.interpret(width))
    }

    /// Linear interpretation per spec.md §6: widths below neutral map to
    /// `[-32768, 0]` scaled by the negative span; widths at or above map to
    /// `[0, 32767]` scaled by the positive span.
    fn interpret(&self, width: u32) -> i16 {
        if width < self.widths.neutral {
            let delta = self.widths.neutral - width;
            let scaled = (delta as i64 * 32768) / self.widths.negative as i64;
            if scaled >= 32768 {
                i16::MIN
            } else {
                -(scaled as i32) as i16
            }
        } else {
            let delta = width - self.widths.neutral;
            let scaled = (delta as i64 * 32767) / self.widths.positive as i64;
            if scaled >= 32767 {
                i16::MAX
            } else {
                scaled as i16
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultKind;

    fn new_servo() -> Servo {
        Servo::new(ServoWidths::default())
    }

    #[test]
    fn pulse_at_neutral_maps_to_zero() {
        let mut s = new_servo();
        assert_eq!(
            s.on_pulse(DEFAULT_NEUTRAL_WIDTH, 20_000),
            PulseResult::Command(0)
        );
    }

    #[test]
    fn pulse_at_span_boundaries_maps_to_full_scale() {
        let mut s = new_servo();
        assert_eq!(
            s.on_pulse(DEFAULT_MIN_WIDTH, 20_000),
            PulseResult::Command(i16::MIN)
        );
        assert_eq!(
            s.on_pulse(DEFAULT_MAX_WIDTH, 20_000),
            PulseResult::Command(i16::MAX)
        );
    }

    #[test]
    fn pulse_outside_valid_range_reports_link_lost() {
        let mut s = new_servo();
        assert_eq!(s.on_pulse(100, 20_000), PulseResult::LinkLost);
        assert_eq!(s.on_pulse(DEFAULT_NEUTRAL_WIDTH, 1_000), PulseResult::LinkLost);
    }

    #[test]
    fn calibration_logs_without_commanding_motor() {
        let faults = FaultState::new(5);
        let mut s = new_servo();
        s.calibration_start(&faults, true).unwrap();
        assert_eq!(s.on_pulse(1600, 20_000), PulseResult::Calibrating);
        assert!(s.calibrating());
    }

    #[test]
    fn calibration_start_refused_while_noncomm_fault_active() {
        let mut faults = FaultState::new(5);
        faults.update(FaultKind::Current, true);
        let mut s = new_servo();
        assert_eq!(
            s.calibration_start(&faults, true),
            Err(CalibrationStartError::FaultActive)
        );
    }

    #[test]
    fn calibration_start_allowed_during_comm_fault() {
        let mut faults = FaultState::new(5);
        faults.update(FaultKind::Communication, true);
        let mut s = new_servo();
        assert!(s.calibration_start(&faults, true).is_ok());
    }

    #[test]
    fn successful_calibration_commits_new_widths() {
        let faults = FaultState::new(5);
        let mut s = new_servo();
        s.calibration_start(&faults, true).unwrap();
        s.on_pulse(1000, 20_000);
        s.on_pulse(2000, 20_000);
        s.on_pulse(1550, 20_000); // most recent pulse becomes the neutral candidate
        let widths = s.calibration_end().unwrap();
        assert_eq!(widths.neutral, 1550);
        assert_eq!(widths.negative, 550);
        assert_eq!(widths.positive, 450);
        assert!(!s.calibrating());
    }

    #[test]
    fn calibration_fails_when_neutral_not_centered() {
        let faults = FaultState::new(5);
        let mut s = new_servo();
        s.calibration_start(&faults, true).unwrap();
        s.on_pulse(1000, 20_000);
        s.on_pulse(2300, 20_000);
        s.on_pulse(1500, 20_000);
        assert_eq!(s.calibration_end(), Err(CalibrationEndError::Invalid));
        // Prior widths must be unchanged on failure.
        assert_eq!(s.widths(), ServoWidths::default());
    }

    #[test]
    fn calibration_fails_when_span_too_narrow() {
        let faults = FaultState::new(5);
        let mut s = new_servo();
        s.calibration_start(&faults, true).unwrap();
        s.on_pulse(1450, 20_000);
        s.on_pulse(1550, 20_000);
        s.on_pulse(1500, 20_000);
        assert_eq!(s.calibration_end(), Err(CalibrationEndError::Invalid));
    }

    #[test]
    fn abort_discards_samples_without_validation() {
        let faults = FaultState::new(5);
        let mut s = new_servo();
        s.calibration_start(&faults, true).unwrap();
        s.on_pulse(1000, 20_000);
        s.calibration_abort();
        assert!(!s.calibrating());
        assert_eq!(
            s.calibration_end(),
            Err(CalibrationEndError::NotCalibrating)
        );
    }
}
