//! Sensored (Hall) six-step BLDC driver.
//!
//! Each tick reads the Hall state; a transition advances the commutation
//! step and yields the speed estimate from the measured step interval.

use core::f32::consts::FRAC_PI_3;

use super::{
    apply_step, brake_output, conducting_current, next_step, regulate_duty, step_speed,
    stop_output,
};
use crate::config::{ControlMethod, MotorType};
use crate::driver::{acquire_state, Direction, MotorContext, MotorDriver, OpenLoopRamp};
use crate::error::MotorError;
use crate::hal::MotorHal;
use crate::motor::MotorMode;

/// Commutation index per raw Hall code 0bABC; 0xFF marks invalid codes.
/// Forward Hall sequence: 3 -> 1 -> 5 -> 4 -> 6 -> 2 -> 3.
const HALL_TO_STEP_FORWARD: [u8; 8] = [0xFF, 1, 5, 0, 3, 2, 4, 0xFF];
/// Reverse rotation mapping; the same codes walk the table backwards.
const HALL_TO_STEP_REVERSE: [u8; 8] = [0xFF, 0, 4, 5, 2, 1, 3, 0xFF];

/// Longest believable step interval; anything slower reads as standstill.
const SPEED_TIMEOUT_US: u32 = 50_000;

/// Valid edges in a row before the Hall feedback counts as locked.
const LOCK_EDGE_STREAK: u32 = 2;

pub struct SixStepSensored {
    step: u8,
    direction: Direction,
    pwm_duty: f32,
    last_hall_state: u8,
    last_commutation_us: u32,
    commutation_period_us: u32,
    estimated_speed: f32,
    /// Step has been adopted from a Hall reading since the last reset.
    synced: bool,
    valid_edge_streak: u32,
    ramp: OpenLoopRamp,
}

impl SixStepSensored {
    pub fn new(startup: &crate::config::StartupConfig, direction: Direction) -> Self {
        Self {
            step: 0,
            direction,
            pwm_duty: 0.0,
            last_hall_state: 0,
            last_commutation_us: 0,
            commutation_period_us: 0,
            estimated_speed: 0.0,
            synced: false,
            valid_edge_streak: 0,
            ramp: OpenLoopRamp::new(startup),
        }
    }

    pub fn step(&self) -> u8 {
        self.step
    }

    fn hall_to_step(&self, hall: u8) -> Option<u8> {
        let table = match self.direction {
            Direction::Forward => &HALL_TO_STEP_FORWARD,
            Direction::Reverse => &HALL_TO_STEP_REVERSE,
        };
        match table.get(hall as usize) {
            Some(&step) if step != 0xFF => Some(step),
            _ => None,
        }
    }

    fn signed_speed(&self, magnitude: f32) -> f32 {
        match self.direction {
            Direction::Forward => magnitude,
            Direction::Reverse => -magnitude,
        }
    }

    /// Process a Hall edge if one occurred.
    ///
    /// With `sync_step` the commutation step follows the Hall reading: the
    /// first valid reading is adopted outright, after which every edge must
    /// land exactly one step onward in the commanded direction.
    fn track_hall(
        &mut self,
        pole_pairs: u8,
        now: u32,
        hall: u8,
        sync_step: bool,
    ) -> Result<(), MotorError> {
        let Some(hall_step) = self.hall_to_step(hall) else {
            error!("invalid hall state {}", hall);
            self.valid_edge_streak = 0;
            return Err(MotorError::SensorFault);
        };

        if hall == self.last_hall_state {
            return Ok(());
        }

        if sync_step {
            if !self.synced {
                self.step = hall_step;
                self.synced = true;
                self.valid_edge_streak = 0;
            } else {
                let expected = next_step(self.step, self.direction);
                if hall_step != expected {
                    // Out-of-sequence transition: the rotor cannot jump more
                    // than one step between edges.
                    error!("hall sequence violation: step {} -> {}", self.step, hall_step);
                    self.valid_edge_streak = 0;
                    return Err(MotorError::SensorFault);
                }
                self.step = hall_step;
                self.valid_edge_streak = self.valid_edge_streak.saturating_add(1);
            }
        }

        if self.last_commutation_us != 0 {
            let period = now.wrapping_sub(self.last_commutation_us);
            if period > 0 {
                self.commutation_period_us = period;
                self.estimated_speed = self.signed_speed(step_speed(pole_pairs, period as f32));
                trace!("hall edge: step {}, period {} us", self.step, period);
            }
        }
        self.last_commutation_us = now;
        self.last_hall_state = hall;

        Ok(())
    }
}

impl<H: MotorHal> MotorDriver<H> for SixStepSensored {
    fn init(&mut self, ctx: &mut MotorContext, hal: &mut H) -> Result<(), MotorError> {
        if ctx.config.motor_type != MotorType::Bldc
            || ctx.config.control_method != ControlMethod::SixStep
        {
            return Err(MotorError::ConfigInvalid);
        }

        hal.pwm_init(&ctx.config.pwm)?;
        hal.adc_init(&ctx.config.adc)?;
        hal.gpio_init()?;
        hal.hall_init()?;

        <Self as MotorDriver<H>>::reset(self);
        stop_output(hal);
        Ok(())
    }

    fn deinit(&mut self, _ctx: &mut MotorContext, hal: &mut H) -> Result<(), MotorError> {
        stop_output(hal);
        Ok(())
    }

    fn reset(&mut self) {
        self.step = 0;
        self.pwm_duty = 0.0;
        self.last_hall_state = 0;
        self.last_commutation_us = 0;
        self.commutation_period_us = 0;
        self.estimated_speed = 0.0;
        self.synced = false;
        self.valid_edge_streak = 0;
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
        let now = ctx.state.last_update_us;
        let hall = hal.hall_state();
        let pole_pairs = ctx.config.pole_pairs;

        match mode {
            MotorMode::Idle | MotorMode::Stopped | MotorMode::Error => {
                self.pwm_duty = 0.0;
            }
            MotorMode::Aligning => {
                self.step = 0;
                self.synced = false;
                self.pwm_duty = ctx.config.startup.align_duty;
                self.track_hall(pole_pairs, now, hall, false)?;
            }
            MotorMode::OpenLoop => {
                if self.ramp.update(dt * 1_000_000.0) {
                    self.step = next_step(self.step, self.direction);
                }
                self.pwm_duty = self.ramp.duty();
                self.track_hall(pole_pairs, now, hall, false)?;
            }
            MotorMode::Transition | MotorMode::Running => {
                self.track_hall(pole_pairs, now, hall, true)?;
                let measured = conducting_current(&ctx.state.phase_currents, self.step);
                self.pwm_duty = regulate_duty(ctx, measured, self.estimated_speed, dt);
            }
            MotorMode::Braking => {
                self.track_hall(pole_pairs, now, hall, false)?;
                self.pwm_duty = 0.0;
            }
        }

        if self.last_commutation_us != 0
            && now.wrapping_sub(self.last_commutation_us) > SPEED_TIMEOUT_US
        {
            self.estimated_speed = 0.0;
        }

        ctx.state.velocity = self.estimated_speed;
        ctx.state.position = self.step as f32 * FRAC_PI_3 / pole_pairs as f32;

        Ok(())
    }

    fn update_pwm(
        &mut self,
        _ctx: &mut MotorContext,
        hal: &mut H,
        mode: MotorMode,
    ) -> Result<(), MotorError> {
        match mode {
            MotorMode::Aligning
            | MotorMode::OpenLoop
            | MotorMode::Transition
            | MotorMode::Running => apply_step(hal, self.step, self.pwm_duty),
            MotorMode::Braking => brake_output(hal),
            MotorMode::Idle | MotorMode::Stopped | MotorMode::Error => stop_output(hal),
        }
        Ok(())
    }

    fn estimate_position(&self) -> Result<f32, MotorError> {
        Ok(self.step as f32 * FRAC_PI_3)
    }

    fn estimate_speed(&self) -> Result<f32, MotorError> {
        Ok(self.estimated_speed)
    }

    fn is_locked(&self) -> bool {
        self.synced && self.valid_edge_streak >= LOCK_EDGE_STREAK && self.estimated_speed != 0.0
    }
}
