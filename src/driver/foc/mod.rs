//! Field-oriented control driver for PMSM.
//!
//! Per tick: Clarke/Park the measured phase currents into (id, iq) at the
//! observer's angle estimate, regulate both against their references with
//! the d/q current loops, limit the voltage vector to the available bus
//! circle and hand the stationary-frame command to SVPWM.

pub mod field_weakening;

use core::f32::consts::FRAC_PI_3;

use self::field_weakening::FieldWeakeningState;

use crate::config::{ControlMethod, ControlMode, MotorType, StartupConfig};
use crate::driver::six_step::step_speed;
use crate::driver::{acquire_state, MotorContext, MotorDriver, OpenLoopRamp};
use crate::error::MotorError;
use crate::hal::{MotorHal, Phase};
use crate::motor::MotorMode;
use crate::observer::{Observer, ObserverInput};
use crate::pid::{Pid, PidConfig};
use crate::svpwm::svpwm;
use crate::transforms::{clarke, inverse_park, limit_voltage, normalize_angle, park};

const INV_SQRT3: f32 = 0.577_350_26; // 1 / sqrt(3)

// D axis - flux current loop defaults.
const DEFAULT_D_KP: f32 = 2.0;
const DEFAULT_D_KI: f32 = 500.0;
const DEFAULT_D_KD: f32 = 0.0;
const DEFAULT_D_DERIV_EMA_ALPHA: f32 = 0.1;

// Q axis - torque current loop defaults.
const DEFAULT_Q_KP: f32 = 2.0;
const DEFAULT_Q_KI: f32 = 500.0;
const DEFAULT_Q_KD: f32 = 0.0;
const DEFAULT_Q_DERIV_EMA_ALPHA: f32 = 0.1;

pub struct FocDriver<O: Observer> {
    observer: O,
    electrical_angle: f32,
    /// Mechanical speed estimate in rad/s.
    mech_speed: f32,
    id: f32,
    iq: f32,
    vd: f32,
    vq: f32,
    v_alpha: f32,
    v_beta: f32,
    current_d: Pid,
    current_q: Pid,
    field_weakening: FieldWeakeningState,
    ramp: OpenLoopRamp,
}

impl<O: Observer> FocDriver<O> {
    pub fn new(
        startup: &StartupConfig,
        observer: O,
        d_config: PidConfig,
        q_config: PidConfig,
    ) -> Self {
        Self {
            observer,
            electrical_angle: 0.0,
            mech_speed: 0.0,
            id: 0.0,
            iq: 0.0,
            vd: 0.0,
            vq: 0.0,
            v_alpha: 0.0,
            v_beta: 0.0,
            current_d: Pid::new(d_config),
            current_q: Pid::new(q_config),
            field_weakening: FieldWeakeningState::default(),
            ramp: OpenLoopRamp::new(startup),
        }
    }

    /// Driver with the stock d/q loop gains, clamped to `max_voltage`.
    pub fn with_default_gains(startup: &StartupConfig, observer: O, max_voltage: f32) -> Self {
        let d_config = PidConfig {
            kp: DEFAULT_D_KP,
            ki: DEFAULT_D_KI,
            kd: DEFAULT_D_KD,
            output_min: -max_voltage,
            output_max: max_voltage,
            derivative_ema_alpha: DEFAULT_D_DERIV_EMA_ALPHA,
        };
        let q_config = PidConfig {
            kp: DEFAULT_Q_KP,
            ki: DEFAULT_Q_KI,
            kd: DEFAULT_Q_KD,
            output_min: -max_voltage,
            output_max: max_voltage,
            derivative_ema_alpha: DEFAULT_Q_DERIV_EMA_ALPHA,
        };
        Self::new(startup, observer, d_config, q_config)
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn dq_currents(&self) -> (f32, f32) {
        (self.id, self.iq)
    }

    pub fn dq_voltages(&self) -> (f32, f32) {
        (self.vd, self.vq)
    }

    /// Voltage available for modulation: the inscribed circle of the bus,
    /// capped by the configured maximum.
    fn voltage_limit(ctx: &MotorContext) -> f32 {
        let bus_limit = ctx.state.dc_voltage * INV_SQRT3;
        if bus_limit < ctx.config.max_voltage {
            bus_limit
        } else {
            ctx.config.max_voltage
        }
    }

    fn observer_input(&self, ctx: &MotorContext) -> ObserverInput {
        let (i_alpha, i_beta) = clarke(
            ctx.state.phase_currents[Phase::A.index()],
            ctx.state.phase_currents[Phase::B.index()],
        );
        ObserverInput {
            v_alpha: self.v_alpha,
            v_beta: self.v_beta,
            i_alpha,
            i_beta,
        }
    }

    /// Clarke/Park the latest phase currents at the current angle estimate.
    fn transform_currents(&mut self, ctx: &MotorContext) -> (f32, f32) {
        let (i_alpha, i_beta) = clarke(
            ctx.state.phase_currents[Phase::A.index()],
            ctx.state.phase_currents[Phase::B.index()],
        );
        let (id, iq) = park(i_alpha, i_beta, self.electrical_angle);
        self.id = id;
        self.iq = iq;
        (id, iq)
    }

    /// Torque-axis current reference for the active control mode.
    fn iq_reference(&mut self, ctx: &mut MotorContext, dt: f32) -> f32 {
        let iq_ref = match *ctx.control_mode {
            ControlMode::Torque => ctx.setpoint.torque / ctx.config.torque_constant,
            ControlMode::Current => ctx.setpoint.current,
            ControlMode::Velocity => ctx
                .pids
                .velocity
                .update(ctx.setpoint.velocity - self.mech_speed, dt),
            ControlMode::Position => {
                let velocity_ref = ctx
                    .pids
                    .position
                    .update(ctx.setpoint.position - ctx.state.position, dt)
                    .clamp(-ctx.config.max_velocity, ctx.config.max_velocity);
                ctx.pids.velocity.update(velocity_ref - self.mech_speed, dt)
            }
            // Voltage mode bypasses the current loops entirely.
            ControlMode::Voltage => 0.0,
        };
        iq_ref.clamp(-ctx.config.max_current, ctx.config.max_current)
    }

    /// One closed-loop field-orientation pass.
    fn run_closed_loop(
        &mut self,
        ctx: &mut MotorContext,
        braking: bool,
        dt: f32,
    ) -> Result<(), MotorError> {
        let input = self.observer_input(ctx);
        let (theta, omega) = self.observer.update(&input, dt)?;
        self.electrical_angle = normalize_angle(theta);
        self.mech_speed = omega / ctx.config.pole_pairs as f32;
        ctx.state.velocity = self.mech_speed;
        ctx.state.position = self.electrical_angle / ctx.config.pole_pairs as f32;

        self.transform_currents(ctx);

        let v_limit = Self::voltage_limit(ctx);

        if !braking && *ctx.control_mode == ControlMode::Voltage {
            self.vd = 0.0;
            self.vq = ctx.setpoint.voltage.clamp(-v_limit, v_limit);
        } else {
            let iq_ref = if braking { 0.0 } else { self.iq_reference(ctx, dt) };
            let id_ref = if braking {
                0.0
            } else {
                self.field_weakening
                    .update(&ctx.config.field_weakening, self.vd, self.vq, v_limit)
            };

            let vd = self.current_d.update(id_ref - self.id, dt);
            let vq = self.current_q.update(iq_ref - self.iq, dt);

            // Keep the vector inside the bus-voltage circle; saturation is a
            // state flag that feeds field weakening, not an error.
            let (vd_limited, vq_limited) = limit_voltage(vd, vq, v_limit);
            ctx.state.saturated = vd_limited != vd || vq_limited != vq;
            self.vd = vd_limited;
            self.vq = vq_limited;
        }

        let (v_alpha, v_beta) = inverse_park(self.vd, self.vq, self.electrical_angle);
        self.v_alpha = v_alpha;
        self.v_beta = v_beta;

        Ok(())
    }

    /// Forced rotation before the observer has anything to track.
    fn run_open_loop(&mut self, ctx: &mut MotorContext, dt: f32) {
        let dt_us = dt * 1_000_000.0;
        self.ramp.update(dt_us);

        // One ramp period sweeps 60 electrical degrees.
        self.electrical_angle =
            normalize_angle(self.electrical_angle + FRAC_PI_3 * dt_us / self.ramp.period_us());
        self.mech_speed = step_speed(ctx.config.pole_pairs, self.ramp.period_us());
        ctx.state.velocity = self.mech_speed;

        let v_limit = Self::voltage_limit(ctx);
        self.vd = 0.0;
        self.vq = self.ramp.duty() * v_limit;
        let (v_alpha, v_beta) = inverse_park(self.vd, self.vq, self.electrical_angle);
        self.v_alpha = v_alpha;
        self.v_beta = v_beta;

        // Let the observer chew on the forced trajectory so the estimate is
        // already close when the transition starts; acquisition noise is not
        // a fault yet.
        let input = self.observer_input(ctx);
        let _ = self.observer.update(&input, dt);
        self.transform_currents(ctx);
    }
}

impl<O: Observer, H: MotorHal> MotorDriver<H> for FocDriver<O> {
    fn init(&mut self, ctx: &mut MotorContext, hal: &mut H) -> Result<(), MotorError> {
        if ctx.config.motor_type != MotorType::Pmsm
            || ctx.config.control_method != ControlMethod::Foc
        {
            return Err(MotorError::ConfigInvalid);
        }

        hal.pwm_init(&ctx.config.pwm)?;
        hal.adc_init(&ctx.config.adc)?;
        hal.gpio_init()?;

        <Self as MotorDriver<H>>::reset(self);
        for phase in Phase::ALL {
            hal.set_phase_duty(phase, 0.0);
            hal.set_phase_float(phase);
        }
        Ok(())
    }

    fn deinit(&mut self, _ctx: &mut MotorContext, hal: &mut H) -> Result<(), MotorError> {
        for phase in Phase::ALL {
            hal.set_phase_duty(phase, 0.0);
            hal.set_phase_float(phase);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.observer.reset();
        self.electrical_angle = 0.0;
        self.mech_speed = 0.0;
        self.id = 0.0;
        self.iq = 0.0;
        self.vd = 0.0;
        self.vq = 0.0;
        self.v_alpha = 0.0;
        self.v_beta = 0.0;
        self.current_d.reset();
        self.current_q.reset();
        self.field_weakening.reset();
        self.ramp.reset();
    }

    fn update_state(
        &mut self,
        ctx: &mut MotorContext,
        hal: &mut H,
        _dt: f32,
    ) -> Result<(), MotorError> {
        acquire_state(ctx, hal)
    }

    fn commutate(
        &mut self,
        ctx: &mut MotorContext,
        hal: &mut H,
        mode: MotorMode,
        dt: f32,
    ) -> Result<(), MotorError> {
        let _ = hal;
        match mode {
            MotorMode::Idle | MotorMode::Stopped | MotorMode::Error => {
                self.vd = 0.0;
                self.vq = 0.0;
                self.v_alpha = 0.0;
                self.v_beta = 0.0;
                self.mech_speed = 0.0;
                ctx.state.velocity = 0.0;
            }
            MotorMode::Aligning => {
                // Park the rotor on the d axis at a known angle.
                self.observer.reset();
                self.electrical_angle = 0.0;
                self.mech_speed = 0.0;
                self.vd = ctx.config.startup.align_duty * Self::voltage_limit(ctx);
                self.vq = 0.0;
                let (v_alpha, v_beta) = inverse_park(self.vd, self.vq, 0.0);
                self.v_alpha = v_alpha;
                self.v_beta = v_beta;
                ctx.state.velocity = 0.0;
            }
            MotorMode::OpenLoop => {
                self.run_open_loop(ctx, dt);
            }
            MotorMode::Transition | MotorMode::Running => {
                self.run_closed_loop(ctx, false, dt)?;
            }
            MotorMode::Braking => {
                self.run_closed_loop(ctx, true, dt)?;
            }
        }
        Ok(())
    }

    fn update_pwm(
        &mut self,
        ctx: &mut MotorContext,
        hal: &mut H,
        mode: MotorMode,
    ) -> Result<(), MotorError> {
        match mode {
            MotorMode::Aligning
            | MotorMode::OpenLoop
            | MotorMode::Transition
            | MotorMode::Running
            | MotorMode::Braking => {
                let duties = svpwm(self.v_alpha, self.v_beta, ctx.state.dc_voltage);
                for phase in Phase::ALL {
                    hal.set_phase_duty(phase, duties[phase.index()]);
                }
            }
            MotorMode::Idle | MotorMode::Stopped | MotorMode::Error => {
                for phase in Phase::ALL {
                    hal.set_phase_duty(phase, 0.0);
                    hal.set_phase_float(phase);
                }
            }
        }
        Ok(())
    }

    fn estimate_position(&self) -> Result<f32, MotorError> {
        Ok(self.electrical_angle)
    }

    fn estimate_speed(&self) -> Result<f32, MotorError> {
        Ok(self.mech_speed)
    }

    fn foc_transform(&mut self, ctx: &mut MotorContext) -> Result<(f32, f32), MotorError> {
        Ok(self.transform_currents(ctx))
    }

    fn is_locked(&self) -> bool {
        self.observer.is_converged()
    }
}
