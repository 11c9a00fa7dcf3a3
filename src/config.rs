//! Motor configuration.
//!
//! `MotorConfig` is populated by the integrator before init and is immutable
//! afterwards; `validate` gates both init and fault recovery.

use crate::driver::foc::field_weakening::FieldWeakeningConfig;
use crate::error::MotorError;
use crate::hal::{AdcConfig, PwmConfig};
use crate::pid::PidConfig;

/// Motor types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MotorType {
    /// Brushless DC.
    Bldc,
    /// Permanent magnet synchronous.
    Pmsm,
    /// Stepper motor.
    Stepper,
}

/// Control methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlMethod {
    /// Basic 6-step commutation.
    SixStep,
    /// Field oriented control.
    Foc,
    /// Direct torque control.
    Dtc,
    /// Sensorless (back-EMF based).
    Sensorless,
    /// V/f control.
    Vf,
}

/// Control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlMode {
    Voltage,
    Current,
    Velocity,
    Position,
    Torque,
}

/// Startup sequencing parameters.
#[derive(Debug, Clone, Copy)]
pub struct StartupConfig {
    /// Rotor park dwell before open loop, in seconds.
    pub align_time_s: f32,
    /// Duty applied while parking, in [0, 1].
    pub align_duty: f32,
    /// Slowest forced-commutation step period in microseconds.
    pub period_max_us: u32,
    /// Fastest forced-commutation step period in microseconds.
    pub period_min_us: u32,
    /// Per-step period multiplier during the open-loop ramp, in (0, 1).
    pub acceleration: f32,
    /// Duty added on each open-loop step, in [0, 1].
    pub duty_increment: f32,
    /// Consecutive ticks above `min_startup_speed` before TRANSITION.
    pub startup_debounce_ticks: u32,
    /// Consecutive locked ticks before RUNNING.
    pub lock_debounce_ticks: u32,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            align_time_s: 0.5,
            align_duty: 0.20,
            period_max_us: 50_000,
            period_min_us: 5_000,
            acceleration: 0.8,
            duty_increment: 0.05,
            startup_debounce_ticks: 10,
            lock_debounce_ticks: 10,
        }
    }
}

impl StartupConfig {
    fn is_valid(&self) -> bool {
        self.align_time_s >= 0.0
            && (0.0..=1.0).contains(&self.align_duty)
            && self.period_min_us > 0
            && self.period_min_us <= self.period_max_us
            && self.acceleration > 0.0
            && self.acceleration < 1.0
            && (0.0..=1.0).contains(&self.duty_increment)
            && self.startup_debounce_ticks > 0
            && self.lock_debounce_ticks > 0
    }
}

/// Back-EMF zero-crossing detection parameters.
///
/// Blanking time and the commutation delay fraction are deliberately tunable;
/// validate them against the target hardware.
#[derive(Debug, Clone, Copy)]
pub struct SensorlessConfig {
    /// EMA coefficient for the back-EMF low-pass filter, in [0, 1].
    pub bemf_filter_alpha: f32,
    /// Zero-crossing detection threshold in volts.
    pub zc_threshold: f32,
    /// Hysteresis added to the threshold in volts.
    pub zc_hysteresis: f32,
    /// Time after a commutation during which crossings are ignored.
    pub blanking_us: u32,
    /// Fraction of the previous period between crossing and commutation;
    /// 0.5 is the nominal 30 electrical degrees.
    pub zc_delay_fraction: f32,
}

impl Default for SensorlessConfig {
    fn default() -> Self {
        Self {
            bemf_filter_alpha: 0.1,
            zc_threshold: 0.1,
            zc_hysteresis: 0.5,
            blanking_us: 10,
            zc_delay_fraction: 0.5,
        }
    }
}

impl SensorlessConfig {
    fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.bemf_filter_alpha)
            && self.zc_threshold >= 0.0
            && self.zc_hysteresis >= 0.0
            && (0.0..=1.0).contains(&self.zc_delay_fraction)
    }
}

/// Stall detection parameters.
#[derive(Debug, Clone, Copy)]
pub struct StallConfig {
    /// Mechanical speed below which the rotor counts as stalled, rad/s.
    pub speed_threshold: f32,
    /// Commanded setpoint magnitude that counts as demanding motion
    /// (interpreted in the active control mode's unit).
    pub command_margin: f32,
    /// How long both conditions must hold before the fault, in seconds.
    pub dwell_s: f32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            speed_threshold: 2.0,
            command_margin: 0.5,
            dwell_s: 0.5,
        }
    }
}

impl StallConfig {
    fn is_valid(&self) -> bool {
        self.speed_threshold > 0.0 && self.command_margin >= 0.0 && self.dwell_s > 0.0
    }
}

/// Static per-motor parameters; immutable once the motor is created.
#[derive(Debug, Clone, Copy)]
pub struct MotorConfig {
    pub motor_type: MotorType,
    pub control_method: ControlMethod,
    /// Control mode active after init; setpoint setters switch it later.
    pub control_mode: ControlMode,
    /// Number of pole pairs.
    pub pole_pairs: u8,
    /// Phase resistance in ohms.
    pub phase_resistance: f32,
    /// Phase inductance in henries.
    pub phase_inductance: f32,
    /// Torque constant in Nm/A.
    pub torque_constant: f32,
    /// Maximum phase current in amperes.
    pub max_current: f32,
    /// Maximum phase voltage in volts.
    pub max_voltage: f32,
    /// Maximum mechanical velocity in rad/s.
    pub max_velocity: f32,
    /// Mechanical speed that must be reached in open loop before the
    /// transition to closed loop, rad/s.
    pub min_startup_speed: f32,
    pub current_pid: PidConfig,
    pub velocity_pid: PidConfig,
    pub position_pid: PidConfig,
    pub startup: StartupConfig,
    pub sensorless: SensorlessConfig,
    pub field_weakening: FieldWeakeningConfig,
    pub stall: StallConfig,
    pub pwm: PwmConfig,
    pub adc: AdcConfig,
}

impl MotorConfig {
    /// Check every invariant the state machine and drivers rely on.
    ///
    /// Called from `Motor::new` and again on fault clear; a motor is never
    /// created from a config that fails here.
    pub fn validate(&self) -> Result<(), MotorError> {
        if self.pole_pairs < 1 {
            return Err(MotorError::ConfigInvalid);
        }
        if !(self.max_current > 0.0 && self.max_voltage > 0.0 && self.max_velocity > 0.0) {
            return Err(MotorError::ConfigInvalid);
        }
        if self.phase_resistance < 0.0
            || self.phase_inductance < 0.0
            || self.torque_constant <= 0.0
            || self.min_startup_speed <= 0.0
        {
            return Err(MotorError::ConfigInvalid);
        }
        if !self.current_pid.is_valid()
            || !self.velocity_pid.is_valid()
            || !self.position_pid.is_valid()
        {
            return Err(MotorError::ConfigInvalid);
        }
        if !self.startup.is_valid() || !self.sensorless.is_valid() || !self.stall.is_valid() {
            return Err(MotorError::ConfigInvalid);
        }
        self.field_weakening.validate()?;

        // Only combinations with a concrete driver are accepted.
        match (self.motor_type, self.control_method) {
            (MotorType::Bldc, ControlMethod::SixStep)
            | (MotorType::Bldc, ControlMethod::Sensorless)
            | (MotorType::Pmsm, ControlMethod::Foc) => Ok(()),
            _ => Err(MotorError::Unsupported),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_valid_config_passes() {
        assert!(bldc_sensored_config().validate().is_ok());
        assert!(bldc_sensorless_config().validate().is_ok());
        assert!(pmsm_foc_config().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_limits() {
        let mut config = bldc_sensored_config();
        config.max_current = 0.0;
        assert_eq!(config.validate(), Err(MotorError::ConfigInvalid));

        let mut config = bldc_sensored_config();
        config.max_voltage = -24.0;
        assert_eq!(config.validate(), Err(MotorError::ConfigInvalid));
    }

    #[test]
    fn test_rejects_zero_pole_pairs() {
        let mut config = bldc_sensored_config();
        config.pole_pairs = 0;
        assert_eq!(config.validate(), Err(MotorError::ConfigInvalid));
    }

    #[test]
    fn test_rejects_bad_pid() {
        let mut config = bldc_sensored_config();
        config.current_pid.output_min = config.current_pid.output_max;
        assert_eq!(config.validate(), Err(MotorError::ConfigInvalid));
    }

    #[test]
    fn test_rejects_driverless_combination() {
        let mut config = bldc_sensored_config();
        config.control_method = ControlMethod::Dtc;
        assert_eq!(config.validate(), Err(MotorError::Unsupported));

        let mut config = bldc_sensored_config();
        config.motor_type = MotorType::Stepper;
        assert_eq!(config.validate(), Err(MotorError::Unsupported));
    }

    #[test]
    fn test_rejects_bad_sensorless_params() {
        let mut config = bldc_sensorless_config();
        config.sensorless.bemf_filter_alpha = 1.5;
        assert_eq!(config.validate(), Err(MotorError::ConfigInvalid));
    }
}
