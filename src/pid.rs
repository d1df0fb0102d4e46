//! PID state for the regulated control modes (VComp, Current, Speed,
//! Position), per spec.md §3/§4.5. Grounded in the teacher's `pid.rs` split
//! between a coefficient struct and a running-state struct, but re-derived
//! for fixed-point single-axis control: one PID instance per mode instead
//! of the teacher's float multi-axis rate/attitude/velocity cascade.

use crate::fixed::{clamp_sym, q16_16_mul, Q16_16};

/// Proportional, integral and derivative gains, Q16.16 signed fixed point
/// per spec.md §3.
#[derive(Clone, Copy, Debug, Default)]
pub struct Gains {
    pub p: Q16_16,
    pub i: Q16_16,
    pub d: Q16_16,
}

pub struct Pid {
    gains: Gains,
    integrator: Q16_16,
    last_error: Q16_16,
    /// Output saturation bound, derived from the H-bridge max voltage.
    output_bound: i32,
}

impl Pid {
    pub fn new(output_bound: i32) -> Self {
        Self {
            gains: Gains::default(),
            integrator: 0,
            last_error: 0,
            output_bound,
        }
    }

    pub fn gains(&self) -> Gains {
        self.gains
    }

    pub fn set_p(&mut self, p: Q16_16) {
        self.gains.p = p;
    }

    pub fn set_i(&mut self, i: Q16_16) {
        self.gains.i = i;
    }

    pub fn set_d(&mut self, d: Q16_16) {
        self.gains.d = d;
    }

    pub fn output_bound_set(&mut self, bound: i32) {
        self.output_bound = bound;
    }

    /// Resets the integrator and derivative history. Called on mode switch
    /// and on fault/halt entry, per spec.md §4.5.
    pub fn reset(&mut self) {
        self.integrator = 0;
        self.last_error = 0;
    }

    /// Runs one PID step given `target - measured` as `error`, at a fixed
    /// tick period. Returns a duty command clamped to `output_bound`.
    ///
    /// Anti-windup: the integrator does not accumulate while the previous
    /// output was saturated in the same direction as the current error,
    /// per spec.md §4.5.
    pub fn step(&mut self, error: Q16_16, prev_output_saturated_same_sign: bool) -> i32 {
        let p_term = q16_16_mul(self.gains.p, error);

        if !prev_output_saturated_same_sign {
            self.integrator = self
                .integrator
                .saturating_add(q16_16_mul(self.gains.i, error));
            self.integrator = clamp_sym(self.integrator, self.output_bound);
        }

        let derivative = error.saturating_sub(self.last_error);
        self.last_error = error;
        let d_term = q16_16_mul(self.gains.d, derivative);

        let output = p_term
            .saturating_add(self.integrator)
            .saturating_add(d_term);
        clamp_sym(output, self.output_bound)
    }

    /// Whether an output saturated in the same direction as `error` — the
    /// anti-windup gate callers should pass into the *next* `step` call.
    pub fn saturated_same_sign(output: i32, bound: i32, error: Q16_16) -> bool {
        (output >= bound && error > 0) || (output <= -bound && error < 0)
    }
}
