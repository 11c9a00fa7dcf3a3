//! Six-step (trapezoidal) commutation machinery shared by the sensored and
//! sensorless BLDC drivers.

pub mod sensored;
pub mod sensorless;

pub use self::sensored::SixStepSensored;
pub use self::sensorless::SixStepSensorless;

use core::f32::consts::FRAC_PI_3;

use crate::config::ControlMode;
use crate::driver::{Direction, MotorContext};
use crate::hal::{MotorHal, Phase, NUM_PHASES};

pub const NUM_COMMUTATION_STEPS: u8 = 6;

/// How a phase is driven within one commutation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseDrive {
    /// High side PWM at the commanded duty.
    High,
    /// Tied to the negative rail.
    Low,
    /// Undriven; carries the back-EMF of interest.
    Float,
}

use PhaseDrive::{Float, High, Low};

/// Phase drive assignment per commutation step, [A, B, C].
pub(crate) const COMMUTATION_TABLE: [[PhaseDrive; NUM_PHASES]; NUM_COMMUTATION_STEPS as usize] = [
    [High, Low, Float],  // Step 0: A-High, B-Low
    [High, Float, Low],  // Step 1: A-High, C-Low
    [Float, High, Low],  // Step 2: B-High, C-Low
    [Low, High, Float],  // Step 3: B-High, A-Low
    [Low, Float, High],  // Step 4: C-High, A-Low
    [Float, Low, High],  // Step 5: C-High, B-Low
];

/// The undriven phase for a commutation step.
pub(crate) fn floating_phase(step: u8) -> Phase {
    match step % NUM_COMMUTATION_STEPS {
        0 => Phase::C,
        1 => Phase::B,
        2 => Phase::A,
        3 => Phase::C,
        4 => Phase::B,
        _ => Phase::A,
    }
}

/// Mean of the two conducting phase currents.
pub(crate) fn conducting_current(currents: &[f32; NUM_PHASES], step: u8) -> f32 {
    let floating = floating_phase(step);
    let mut sum = 0.0;
    for phase in Phase::ALL {
        if phase != floating {
            sum += currents[phase.index()];
        }
    }
    sum / 2.0
}

/// Drive the three phases according to the commutation table entry.
pub(crate) fn apply_step<H: MotorHal>(hal: &mut H, step: u8, duty: f32) {
    let assignment = COMMUTATION_TABLE[(step % NUM_COMMUTATION_STEPS) as usize];
    for phase in Phase::ALL {
        match assignment[phase.index()] {
            High => hal.set_phase_duty(phase, duty),
            Low => hal.set_phase_low(phase),
            Float => hal.set_phase_float(phase),
        }
    }
}

/// Release all phases: zero duty, everything floating.
pub(crate) fn stop_output<H: MotorHal>(hal: &mut H) {
    for phase in Phase::ALL {
        hal.set_phase_duty(phase, 0.0);
        hal.set_phase_float(phase);
    }
}

/// Dynamic brake: all phases tied low.
pub(crate) fn brake_output<H: MotorHal>(hal: &mut H) {
    for phase in Phase::ALL {
        hal.set_phase_low(phase);
    }
}

/// Next step in the commanded direction.
pub(crate) fn next_step(step: u8, direction: Direction) -> u8 {
    match direction {
        Direction::Forward => (step + 1) % NUM_COMMUTATION_STEPS,
        Direction::Reverse => (step + NUM_COMMUTATION_STEPS - 1) % NUM_COMMUTATION_STEPS,
    }
}

/// Mechanical speed implied by one 60-electrical-degree step period.
pub(crate) fn step_speed(pole_pairs: u8, period_us: f32) -> f32 {
    if period_us <= 0.0 {
        return 0.0;
    }
    FRAC_PI_3 * 1_000_000.0 / (pole_pairs as f32 * period_us)
}

/// Duty for this tick from the active control mode's loop, in [0, 1].
pub(crate) fn regulate_duty(
    ctx: &mut MotorContext,
    measured_current: f32,
    speed: f32,
    dt: f32,
) -> f32 {
    let duty = match *ctx.control_mode {
        ControlMode::Torque | ControlMode::Current => ctx
            .pids
            .current
            .update(ctx.setpoint.current - measured_current, dt),
        ControlMode::Velocity => ctx.pids.velocity.update(ctx.setpoint.velocity - speed, dt),
        ControlMode::Position => {
            let velocity_ref = ctx
                .pids
                .position
                .update(ctx.setpoint.position - ctx.state.position, dt);
            ctx.pids.velocity.update(velocity_ref - speed, dt)
        }
        ControlMode::Voltage => ctx.setpoint.voltage / ctx.config.max_voltage,
    };
    duty.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commutation_table_shape() {
        for step in 0..NUM_COMMUTATION_STEPS {
            let assignment = COMMUTATION_TABLE[step as usize];
            let highs = assignment.iter().filter(|d| **d == High).count();
            let lows = assignment.iter().filter(|d| **d == Low).count();
            let floats = assignment.iter().filter(|d| **d == Float).count();
            // Exactly one high, one low and one floating phase per step.
            assert_eq!((highs, lows, floats), (1, 1, 1));
        }
    }

    #[test]
    fn test_floating_phase_matches_table() {
        for step in 0..NUM_COMMUTATION_STEPS {
            let floating = floating_phase(step);
            assert_eq!(
                COMMUTATION_TABLE[step as usize][floating.index()],
                Float,
                "step {} floating phase mismatch",
                step
            );
        }
    }

    #[test]
    fn test_conducting_current_excludes_floating_phase() {
        // Step 0 floats phase C; its current must not contribute.
        let currents = [2.0, 4.0, 100.0];
        assert_eq!(conducting_current(&currents, 0), 3.0);
    }

    #[test]
    fn test_next_step_wraps_both_directions() {
        assert_eq!(next_step(5, Direction::Forward), 0);
        assert_eq!(next_step(0, Direction::Reverse), 5);
    }

    #[test]
    fn test_step_speed() {
        // 4 pole pairs at 1000 us per step: one electrical rev in 6 ms,
        // one mechanical rev in 24 ms.
        let speed = step_speed(4, 1000.0);
        let expected = core::f32::consts::TAU / 0.024;
        assert!((speed - expected).abs() < 0.5);
    }
}
