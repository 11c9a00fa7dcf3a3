//! Sensorless (back-EMF) six-step BLDC driver.
//!
//! The floating phase's voltage, referenced to the virtual neutral and
//! low-pass filtered, yields zero crossings that stand in for Hall edges.
//! Commutation is scheduled a tunable fraction of the previous crossing
//! interval after each detection, nominally 30 electrical degrees.

use core::f32::consts::FRAC_PI_3;

use super::{
    apply_step, brake_output, conducting_current, floating_phase, next_step, regulate_duty,
    step_speed, stop_output,
};
use crate::config::{ControlMethod, MotorType};
use crate::driver::{acquire_state, Direction, MotorContext, MotorDriver, OpenLoopRamp};
use crate::error::MotorError;
use crate::hal::{MotorHal, NUM_PHASES};
use crate::motor::MotorMode;

/// Longest believable crossing interval; anything slower reads as standstill.
const MAX_COMMUTATION_PERIOD_US: u32 = 50_000;

/// Relative period jitter tolerated while counting stable crossings.
const ZC_PERIOD_TOLERANCE: f32 = 0.2;

/// Stable crossing intervals in a row before the estimate counts as locked.
const ZC_STABLE_STREAK: u32 = 3;

/// Expected slope of the next zero crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZcEdge {
    Rising,
    Falling,
}

impl ZcEdge {
    fn flipped(self) -> Self {
        match self {
            ZcEdge::Rising => ZcEdge::Falling,
            ZcEdge::Falling => ZcEdge::Rising,
        }
    }
}

pub struct SixStepSensorless {
    step: u8,
    direction: Direction,
    pwm_duty: f32,
    zc_edge: ZcEdge,
    bemf_filtered: [f32; NUM_PHASES],
    last_zc_us: u32,
    last_commutation_us: u32,
    /// Interval between the two most recent crossings.
    commutation_period_us: u32,
    /// Interval before that; the commutation delay is computed from it.
    prev_period_us: u32,
    pending_commutation_us: Option<u32>,
    estimated_speed: f32,
    stable_streak: u32,
    ramp: OpenLoopRamp,
}

impl SixStepSensorless {
    pub fn new(startup: &crate::config::StartupConfig, direction: Direction) -> Self {
        Self {
            step: 0,
            direction,
            pwm_duty: 0.0,
            zc_edge: ZcEdge::Rising,
            bemf_filtered: [0.0; NUM_PHASES],
            last_zc_us: 0,
            last_commutation_us: 0,
            commutation_period_us: MAX_COMMUTATION_PERIOD_US,
            prev_period_us: MAX_COMMUTATION_PERIOD_US,
            pending_commutation_us: None,
            estimated_speed: 0.0,
            stable_streak: 0,
            ramp: OpenLoopRamp::new(startup),
        }
    }

    pub fn step(&self) -> u8 {
        self.step
    }

    fn signed_speed(&self, magnitude: f32) -> f32 {
        match self.direction {
            Direction::Forward => magnitude,
            Direction::Reverse => -magnitude,
        }
    }

    fn advance_step(&mut self, now: u32) {
        self.step = next_step(self.step, self.direction);
        self.last_commutation_us = now;
        self.zc_edge = self.zc_edge.flipped();
        self.pending_commutation_us = None;
    }

    fn has_zero_crossed(&self, bemf: f32, threshold: f32, hysteresis: f32) -> bool {
        match self.zc_edge {
            ZcEdge::Rising => bemf > threshold + hysteresis,
            ZcEdge::Falling => bemf < -(threshold + hysteresis),
        }
    }

    /// Closed-loop commutation: detect crossings, schedule and execute the
    /// delayed step advance.
    fn run_zero_crossing(&mut self, ctx: &mut MotorContext, now: u32) {
        let cfg = &ctx.config.sensorless;

        // Execute a previously scheduled commutation once its time arrives.
        if let Some(at) = self.pending_commutation_us {
            if (now.wrapping_sub(at) as i32) >= 0 {
                self.advance_step(now);
                trace!("commutated to step {}", self.step);
            }
        }

        // Blanking: ignore the floating phase while it rings after a
        // commutation.
        let since_commutation = now.wrapping_sub(self.last_commutation_us);
        if self.pending_commutation_us.is_some() || since_commutation < cfg.blanking_us {
            return;
        }

        let bemf = self.bemf_filtered[floating_phase(self.step).index()];
        if !self.has_zero_crossed(bemf, cfg.zc_threshold, cfg.zc_hysteresis) {
            return;
        }

        let period = now.wrapping_sub(self.last_zc_us);
        if period == 0 {
            return;
        }

        // Lock quality: consecutive crossing intervals within tolerance.
        let reference = self.commutation_period_us.max(1) as f32;
        let jitter = libm::fabsf(period as f32 - reference) / reference;
        if jitter <= ZC_PERIOD_TOLERANCE {
            self.stable_streak = self.stable_streak.saturating_add(1);
        } else {
            self.stable_streak = 0;
        }

        self.prev_period_us = self.commutation_period_us;
        self.commutation_period_us = period;
        self.estimated_speed =
            self.signed_speed(step_speed(ctx.config.pole_pairs, period as f32));

        // Commutate half-way (nominally) through the next 60 degrees; the
        // delay comes from the previous interval so one noisy measurement
        // cannot feed straight back into the commutation timing.
        let delay_us = (cfg.zc_delay_fraction * self.prev_period_us as f32) as u32;
        self.pending_commutation_us = Some(now.wrapping_add(delay_us));
        self.last_zc_us = now;
        trace!("zero crossing: period {} us, delay {} us", period, delay_us);
    }
}

impl<H: MotorHal> MotorDriver<H> for SixStepSensorless {
    fn init(&mut self, ctx: &mut MotorContext, hal: &mut H) -> Result<(), MotorError> {
        if ctx.config.motor_type != MotorType::Bldc
            || ctx.config.control_method != ControlMethod::Sensorless
        {
            return Err(MotorError::ConfigInvalid);
        }

        hal.pwm_init(&ctx.config.pwm)?;
        hal.adc_init(&ctx.config.adc)?;
        hal.gpio_init()?;

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
        self.zc_edge = ZcEdge::Rising;
        self.bemf_filtered = [0.0; NUM_PHASES];
        self.last_zc_us = 0;
        self.last_commutation_us = 0;
        self.commutation_period_us = MAX_COMMUTATION_PERIOD_US;
        self.prev_period_us = MAX_COMMUTATION_PERIOD_US;
        self.pending_commutation_us = None;
        self.estimated_speed = 0.0;
        self.stable_streak = 0;
        self.ramp.reset();
    }

    fn update_state(
        &mut self,
        ctx: &mut MotorContext,
        hal: &mut H,
        _dt: f32,
    ) -> Result<(), MotorError> {
        acquire_state(ctx, hal)?;

        // Sample the floating phase against the virtual neutral and low-pass
        // filter it; the other phases keep their last filtered value.
        let floating = floating_phase(self.step).index();
        let neutral = ctx.state.dc_voltage / 2.0;
        let raw = ctx.state.phase_voltages[floating] - neutral;
        let alpha = ctx.config.sensorless.bemf_filter_alpha;
        self.bemf_filtered[floating] += alpha * (raw - self.bemf_filtered[floating]);

        Ok(())
    }

    fn commutate(
        &mut self,
        ctx: &mut MotorContext,
        hal: &mut H,
        mode: MotorMode,
        dt: f32,
    ) -> Result<(), MotorError> {
        let _ = hal;
        let now = ctx.state.last_update_us;
        let pole_pairs = ctx.config.pole_pairs;

        match mode {
            MotorMode::Idle | MotorMode::Stopped | MotorMode::Error => {
                self.pwm_duty = 0.0;
            }
            MotorMode::Aligning => {
                self.step = 0;
                self.pwm_duty = ctx.config.startup.align_duty;
            }
            MotorMode::OpenLoop => {
                if self.ramp.update(dt * 1_000_000.0) {
                    self.step = next_step(self.step, self.direction);
                    // Seed the crossing timeline so the closed loop starts
                    // from the forced-commutation cadence.
                    self.last_commutation_us = now;
                    self.last_zc_us = now;
                    let period = self.ramp.period_us() as u32;
                    self.prev_period_us = period;
                    self.commutation_period_us = period;
                }
                self.pwm_duty = self.ramp.duty();
                self.estimated_speed =
                    self.signed_speed(step_speed(pole_pairs, self.ramp.period_us()));
            }
            MotorMode::Transition | MotorMode::Running => {
                let measured = conducting_current(&ctx.state.phase_currents, self.step);
                self.pwm_duty = regulate_duty(ctx, measured, self.estimated_speed, dt);
                self.run_zero_crossing(ctx, now);
            }
            MotorMode::Braking => {
                self.pwm_duty = 0.0;
            }
        }

        // Without crossings the rotor is as good as stopped.
        if !matches!(mode, MotorMode::OpenLoop)
            && self.last_zc_us != 0
            && now.wrapping_sub(self.last_zc_us) > MAX_COMMUTATION_PERIOD_US
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

    /// Forced commutation has no rotor to park against.
    fn uses_alignment(&self) -> bool {
        false
    }

    fn is_locked(&self) -> bool {
        self.stable_streak >= ZC_STABLE_STREAK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::bldc_sensorless_config;
    use crate::config::{ControlMode, MotorConfig};
    use crate::hal::mock::MockHal;
    use crate::motor::{ControlPids, MotorState, Setpoint};

    struct Rig {
        config: MotorConfig,
        state: MotorState,
        setpoint: Setpoint,
        control_mode: ControlMode,
        pids: ControlPids,
        hal: MockHal,
        driver: SixStepSensorless,
    }

    impl Rig {
        fn new() -> Self {
            let config = bldc_sensorless_config();
            let control_mode = config.control_mode;
            let pids = ControlPids::new(&config);
            Self {
                config,
                state: MotorState::default(),
                setpoint: Setpoint::default(),
                control_mode,
                pids,
                hal: MockHal::new(),
                driver: SixStepSensorless::new(&config.startup, Direction::Forward),
            }
        }

        fn tick(&mut self, mode: MotorMode, dt: f32) -> Result<(), MotorError> {
            self.state.last_update_us = self.state.last_update_us.wrapping_add((dt * 1e6) as u32);
            let mut ctx = MotorContext {
                config: &self.config,
                state: &mut self.state,
                setpoint: &mut self.setpoint,
                control_mode: &mut self.control_mode,
                pids: &mut self.pids,
            };
            self.driver.update_state(&mut ctx, &mut self.hal, dt)?;
            let mut ctx = MotorContext {
                config: &self.config,
                state: &mut self.state,
                setpoint: &mut self.setpoint,
                control_mode: &mut self.control_mode,
                pids: &mut self.pids,
            };
            self.driver.commutate(&mut ctx, &mut self.hal, mode, dt)
        }
    }

    #[test]
    fn test_open_loop_ramp_spins_up() {
        let mut rig = Rig::new();
        let start_step = rig.driver.step();
        let mut advanced = false;
        for _ in 0..2000 {
            rig.tick(MotorMode::OpenLoop, 0.001).unwrap();
            if rig.driver.step() != start_step {
                advanced = true;
            }
        }
        assert!(advanced);
        let speed = MotorDriver::<MockHal>::estimate_speed(&rig.driver).unwrap();
        assert!(speed > rig.config.min_startup_speed);
    }

    #[test]
    fn test_zero_crossing_speed_converges() {
        let mut rig = Rig::new();

        // Spin up open loop so the crossing timeline is seeded.
        for _ in 0..2000 {
            rig.tick(MotorMode::OpenLoop, 0.001).unwrap();
        }

        // Synthetic trapezoidal back-EMF: the floating phase swings +/-2 V
        // around the virtual neutral with a crossing interval of 5 ms.
        let period_us = 5000u32;
        let dt = 0.0001;
        let neutral = rig.hal.dc_voltage / 2.0;
        for tick in 0..4000u32 {
            let t_us = tick * 100;
            let sign = if (t_us / period_us) % 2 == 0 { 1.0 } else { -1.0 };
            rig.hal.voltages = [neutral + sign * 2.0; 3];
            rig.tick(MotorMode::Running, dt).unwrap();
        }

        let expected = step_speed(rig.config.pole_pairs, period_us as f32);
        let speed = MotorDriver::<MockHal>::estimate_speed(&rig.driver).unwrap();
        assert!(
            (speed - expected).abs() < 0.25 * expected,
            "speed {} expected {}",
            speed,
            expected
        );
        assert!(MotorDriver::<MockHal>::is_locked(&rig.driver));
    }

    #[test]
    fn test_blanking_rejects_crossings() {
        let mut rig = Rig::new();
        rig.config.sensorless.blanking_us = 1_000_000;

        for _ in 0..2000 {
            rig.tick(MotorMode::OpenLoop, 0.001).unwrap();
        }
        let step = rig.driver.step();

        // Strong back-EMF the whole time, but the blanking window never ends.
        let neutral = rig.hal.dc_voltage / 2.0;
        rig.hal.voltages = [neutral + 5.0; 3];
        for _ in 0..500 {
            rig.tick(MotorMode::Running, 0.0001).unwrap();
        }
        assert_eq!(rig.driver.step(), step);
        assert!(!MotorDriver::<MockHal>::is_locked(&rig.driver));
    }

    #[test]
    fn test_commutation_delayed_by_previous_period() {
        let mut rig = Rig::new();
        rig.config.sensorless.zc_hysteresis = 0.1;

        for _ in 0..2000 {
            rig.tick(MotorMode::OpenLoop, 0.001).unwrap();
        }
        let seeded_period = rig.driver.commutation_period_us;
        let step_before = rig.driver.step();

        // Immediate rising crossing; the step must not advance until the
        // scheduled delay (half the seeded period) has elapsed.
        let neutral = rig.hal.dc_voltage / 2.0;
        rig.hal.voltages = [neutral + 5.0; 3];

        let dt = 0.0001;
        let mut ticks_until_advance = None;
        for tick in 0..200 {
            rig.tick(MotorMode::Running, dt).unwrap();
            if rig.driver.step() != step_before {
                ticks_until_advance = Some(tick);
                break;
            }
        }
        let ticks = ticks_until_advance.expect("commutation never happened") as f32;
        let delay_ticks = 0.5 * seeded_period as f32 / (dt * 1e6);
        // Filter lag adds a few ticks on top of the scheduled delay.
        assert!(ticks >= delay_ticks, "ticks {} delay {}", ticks, delay_ticks);
    }

    #[test]
    fn test_speed_times_out_without_crossings() {
        let mut rig = Rig::new();
        for _ in 0..2000 {
            rig.tick(MotorMode::OpenLoop, 0.001).unwrap();
        }
        assert!(MotorDriver::<MockHal>::estimate_speed(&rig.driver).unwrap() > 0.0);

        // No back-EMF at all: braking decays the estimate to zero.
        let neutral = rig.hal.dc_voltage / 2.0;
        rig.hal.voltages = [neutral; 3];
        for _ in 0..60 {
            rig.tick(MotorMode::Braking, 0.001).unwrap();
        }
        assert_eq!(
            MotorDriver::<MockHal>::estimate_speed(&rig.driver).unwrap(),
            0.0
        );
    }
}
