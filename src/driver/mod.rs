//! Driver capability contract shared by the commutation/FOC variants.
//!
//! The orchestrator dispatches per-tick work through [`MotorDriver`] and
//! never branches on the concrete variant; drivers receive a borrowed
//! [`MotorContext`] view of the motor they act on.

pub mod foc;
pub mod six_step;

use crate::config::{ControlMode, MotorConfig, StartupConfig};
use crate::error::MotorError;
use crate::hal::MotorHal;
use crate::motor::{ControlPids, MotorMode, MotorState, Setpoint};

/// Rotation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Forward,
    Reverse,
}

/// Borrowed view of one motor for the duration of a driver call.
pub struct MotorContext<'a> {
    pub config: &'a MotorConfig,
    pub state: &'a mut MotorState,
    pub setpoint: &'a mut Setpoint,
    pub control_mode: &'a mut ControlMode,
    pub pids: &'a mut ControlPids,
}

/// Capability set implemented by every driver variant.
///
/// Operations that do not apply to a variant report
/// [`MotorError::Unsupported`] instead of silently doing something else.
pub trait MotorDriver<H: MotorHal> {
    fn init(&mut self, ctx: &mut MotorContext, hal: &mut H) -> Result<(), MotorError>;
    fn deinit(&mut self, ctx: &mut MotorContext, hal: &mut H) -> Result<(), MotorError>;

    /// Clear runtime state after a fault; configuration is untouched.
    fn reset(&mut self);

    /// Acquire feedback for this tick and run safety checks.
    fn update_state(
        &mut self,
        ctx: &mut MotorContext,
        hal: &mut H,
        dt: f32,
    ) -> Result<(), MotorError>;

    /// Advance commutation/field orientation for the active mode.
    fn commutate(
        &mut self,
        ctx: &mut MotorContext,
        hal: &mut H,
        mode: MotorMode,
        dt: f32,
    ) -> Result<(), MotorError>;

    /// Write the tick's output to the PWM stage.
    fn update_pwm(
        &mut self,
        ctx: &mut MotorContext,
        hal: &mut H,
        mode: MotorMode,
    ) -> Result<(), MotorError>;

    /// Latest position estimate (electrical angle in radians).
    fn estimate_position(&self) -> Result<f32, MotorError>;

    /// Latest mechanical speed estimate in rad/s.
    fn estimate_speed(&self) -> Result<f32, MotorError>;

    /// Clarke/Park of the latest phase currents; FOC variants only.
    fn foc_transform(&mut self, ctx: &mut MotorContext) -> Result<(f32, f32), MotorError> {
        let _ = ctx;
        Err(MotorError::Unsupported)
    }

    /// Whether this variant parks the rotor before open-loop startup.
    fn uses_alignment(&self) -> bool {
        true
    }

    /// Estimator lock quality; gates TRANSITION -> RUNNING.
    fn is_locked(&self) -> bool;

    fn set_voltage(&mut self, ctx: &mut MotorContext, voltage: f32) -> Result<(), MotorError> {
        if !voltage.is_finite() {
            return Err(MotorError::InvalidArgs);
        }
        ctx.setpoint.voltage = voltage.clamp(-ctx.config.max_voltage, ctx.config.max_voltage);
        *ctx.control_mode = ControlMode::Voltage;
        Ok(())
    }

    fn set_current(&mut self, ctx: &mut MotorContext, current: f32) -> Result<(), MotorError> {
        if !current.is_finite() {
            return Err(MotorError::InvalidArgs);
        }
        ctx.setpoint.current = current.clamp(-ctx.config.max_current, ctx.config.max_current);
        *ctx.control_mode = ControlMode::Current;
        Ok(())
    }

    fn set_velocity(&mut self, ctx: &mut MotorContext, velocity: f32) -> Result<(), MotorError> {
        if !velocity.is_finite() {
            return Err(MotorError::InvalidArgs);
        }
        ctx.setpoint.velocity = velocity.clamp(-ctx.config.max_velocity, ctx.config.max_velocity);
        *ctx.control_mode = ControlMode::Velocity;
        Ok(())
    }

    fn set_position(&mut self, ctx: &mut MotorContext, position: f32) -> Result<(), MotorError> {
        if !position.is_finite() {
            return Err(MotorError::InvalidArgs);
        }
        ctx.setpoint.position = position;
        *ctx.control_mode = ControlMode::Position;
        Ok(())
    }

    fn set_torque(&mut self, ctx: &mut MotorContext, torque: f32) -> Result<(), MotorError> {
        if !torque.is_finite() {
            return Err(MotorError::InvalidArgs);
        }
        ctx.setpoint.torque = torque;
        // Torque commands ride the current loop.
        let current = torque / ctx.config.torque_constant;
        ctx.setpoint.current = current.clamp(-ctx.config.max_current, ctx.config.max_current);
        *ctx.control_mode = ControlMode::Torque;
        Ok(())
    }
}

/// Copy this tick's ADC feedback into the motor state and enforce limits.
pub(crate) fn acquire_state<H: MotorHal>(
    ctx: &mut MotorContext,
    hal: &mut H,
) -> Result<(), MotorError> {
    hal.adc_start_conversion();

    ctx.state.phase_voltages = hal.phase_voltages();
    ctx.state.phase_currents = hal.phase_currents();
    ctx.state.temperature = hal.temperature();
    ctx.state.dc_voltage = hal.dc_voltage();

    for phase in 0..ctx.state.phase_voltages.len() {
        if ctx.state.phase_voltages[phase] > ctx.config.max_voltage {
            return Err(MotorError::Overvoltage);
        }
        if libm::fabsf(ctx.state.phase_currents[phase]) > ctx.config.max_current {
            return Err(MotorError::Overcurrent);
        }
    }

    Ok(())
}

/// Forced-commutation ramp used before closed-loop feedback exists.
///
/// The step period shrinks geometrically from the slowest startup period
/// toward the fastest while the duty rises, one increment per step.
pub(crate) struct OpenLoopRamp {
    period_us: f32,
    period_min_us: f32,
    period_max_us: f32,
    acceleration: f32,
    duty: f32,
    duty_start: f32,
    duty_increment: f32,
    elapsed_us: f32,
}

impl OpenLoopRamp {
    pub(crate) fn new(startup: &StartupConfig) -> Self {
        Self {
            period_us: startup.period_max_us as f32,
            period_min_us: startup.period_min_us as f32,
            period_max_us: startup.period_max_us as f32,
            acceleration: startup.acceleration,
            duty: startup.align_duty,
            duty_start: startup.align_duty,
            duty_increment: startup.duty_increment,
            elapsed_us: 0.0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.period_us = self.period_max_us;
        self.duty = self.duty_start;
        self.elapsed_us = 0.0;
    }

    /// Advance by `dt_us`; returns true when the step should advance.
    pub(crate) fn update(&mut self, dt_us: f32) -> bool {
        self.elapsed_us += dt_us;
        if self.elapsed_us < self.period_us {
            return false;
        }
        self.elapsed_us = 0.0;

        if self.period_us > self.period_min_us {
            self.period_us = (self.period_us * self.acceleration).max(self.period_min_us);
        }
        self.duty = (self.duty + self.duty_increment).min(1.0);
        true
    }

    /// Current step period in microseconds.
    pub(crate) fn period_us(&self) -> f32 {
        self.period_us
    }

    pub(crate) fn duty(&self) -> f32 {
        self.duty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramp_accelerates_to_floor() {
        let startup = StartupConfig::default();
        let mut ramp = OpenLoopRamp::new(&startup);
        let mut advances = 0;
        for _ in 0..10_000 {
            if ramp.update(1000.0) {
                advances += 1;
            }
        }
        assert!(advances > 0);
        assert!((ramp.period_us() - startup.period_min_us as f32).abs() < 1.0);
        assert!(ramp.duty() > startup.align_duty);
        assert!(ramp.duty() <= 1.0);
    }

    #[test]
    fn test_ramp_reset_restores_start() {
        let startup = StartupConfig::default();
        let mut ramp = OpenLoopRamp::new(&startup);
        for _ in 0..1000 {
            ramp.update(1000.0);
        }
        ramp.reset();
        assert_eq!(ramp.period_us(), startup.period_max_us as f32);
        assert_eq!(ramp.duty(), startup.align_duty);
    }
}
