//! Motor aggregate and per-tick orchestration.
//!
//! `Motor` owns one physical motor: configuration, live state, setpoint, the
//! active driver and its HAL. `run` executes exactly one control tick and
//! drives the operating-mode state machine; faults latch into ERROR until an
//! explicit clear.

use libm::fabsf;

use crate::config::{ControlMode, MotorConfig};
use crate::driver::{MotorContext, MotorDriver};
use crate::error::MotorError;
use crate::hal::{MotorHal, NUM_PHASES};
use crate::pid::Pid;
use crate::shared::SharedSetpoint;

/// Mechanical speed treated as standstill, rad/s.
const STOP_SPEED_THRESHOLD: f32 = 1.0;

/// Longest allowed stay in open loop before startup counts as failed.
const OPEN_LOOP_TIMEOUT_S: f32 = 2.0;

/// Motor operating modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MotorMode {
    /// Constructed but not initialized.
    Idle,
    /// Initialized, outputs released.
    Stopped,
    /// Rotor parked at a known electrical angle.
    Aligning,
    /// Forced commutation, no feedback dependency.
    OpenLoop,
    /// Closed loop running, estimator lock not yet confirmed.
    Transition,
    /// Normal closed-loop operation.
    Running,
    /// Active braking down to standstill.
    Braking,
    /// Latched fault; cleared only by `clear_fault`.
    Error,
}

/// Control loop setpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct Setpoint {
    pub voltage: f32,
    pub current: f32,
    pub velocity: f32,
    pub position: f32,
    pub torque: f32,
}

impl Setpoint {
    pub const ZERO: Setpoint = Setpoint {
        voltage: 0.0,
        current: 0.0,
        velocity: 0.0,
        position: 0.0,
        torque: 0.0,
    };
}

/// Live feedback snapshot, written only by the active driver.
#[derive(Debug, Clone, Copy)]
pub struct MotorState {
    pub phase_voltages: [f32; NUM_PHASES],
    pub phase_currents: [f32; NUM_PHASES],
    pub dc_voltage: f32,
    /// Mechanical position in radians.
    pub position: f32,
    /// Mechanical velocity in rad/s.
    pub velocity: f32,
    pub temperature: f32,
    /// The last tick hit a voltage or current clamp.
    pub saturated: bool,
    pub is_initialized: bool,
    /// Tick-time in microseconds, accumulated from caller-supplied dt.
    pub last_update_us: u32,
}

impl Default for MotorState {
    fn default() -> Self {
        Self {
            phase_voltages: [0.0; NUM_PHASES],
            phase_currents: [0.0; NUM_PHASES],
            dc_voltage: 0.0,
            position: 0.0,
            velocity: 0.0,
            temperature: 0.0,
            saturated: false,
            is_initialized: false,
            last_update_us: 0,
        }
    }
}

/// Outer-loop PID controllers owned by the motor and shared with the driver
/// through the context.
pub struct ControlPids {
    pub current: Pid,
    pub velocity: Pid,
    pub position: Pid,
}

impl ControlPids {
    pub fn new(config: &MotorConfig) -> Self {
        Self {
            current: Pid::new(config.current_pid),
            velocity: Pid::new(config.velocity_pid),
            position: Pid::new(config.position_pid),
        }
    }

    fn reset(&mut self) {
        self.current.reset();
        self.velocity.reset();
        self.position.reset();
    }
}

/// One motor: configuration, state, setpoint, driver, HAL.
pub struct Motor<D, H> {
    config: MotorConfig,
    state: MotorState,
    setpoint: Setpoint,
    control_mode: ControlMode,
    pids: ControlPids,
    driver: D,
    hal: H,
    mode: MotorMode,
    motor_error: Option<MotorError>,
    align_elapsed_s: f32,
    open_loop_elapsed_s: f32,
    startup_streak: u32,
    lock_streak: u32,
    stall_elapsed_s: f32,
}

impl<D, H> Motor<D, H>
where
    D: MotorDriver<H>,
    H: MotorHal,
{
    /// Build a motor from a validated configuration.
    ///
    /// A config that fails validation produces no motor at all.
    pub fn new(config: MotorConfig, driver: D, hal: H) -> Result<Self, MotorError> {
        config.validate()?;
        Ok(Self {
            pids: ControlPids::new(&config),
            control_mode: config.control_mode,
            config,
            state: MotorState::default(),
            setpoint: Setpoint::ZERO,
            driver,
            hal,
            mode: MotorMode::Idle,
            motor_error: None,
            align_elapsed_s: 0.0,
            open_loop_elapsed_s: 0.0,
            startup_streak: 0,
            lock_streak: 0,
            stall_elapsed_s: 0.0,
        })
    }

    fn parts(&mut self) -> (MotorContext<'_>, &mut D, &mut H) {
        let Motor {
            config,
            state,
            setpoint,
            control_mode,
            pids,
            driver,
            hal,
            ..
        } = self;
        (
            MotorContext {
                config,
                state,
                setpoint,
                control_mode,
                pids,
            },
            driver,
            hal,
        )
    }

    /// Bring up the driver and hardware; IDLE -> STOPPED.
    pub fn init(&mut self) -> Result<(), MotorError> {
        {
            let (mut ctx, driver, hal) = self.parts();
            driver.init(&mut ctx, hal)?;
        }
        self.state.is_initialized = true;
        self.enter_mode(MotorMode::Stopped);
        info!("motor initialized");
        Ok(())
    }

    /// Release the hardware; the motor returns to IDLE.
    pub fn deinit(&mut self) -> Result<(), MotorError> {
        {
            let (mut ctx, driver, hal) = self.parts();
            driver.deinit(&mut ctx, hal)?;
        }
        self.state.is_initialized = false;
        self.mode = MotorMode::Idle;
        Ok(())
    }

    /// Begin the startup sequence from STOPPED.
    pub fn start(&mut self) -> Result<(), MotorError> {
        if !self.state.is_initialized {
            return Err(MotorError::Uninitialized);
        }
        match self.mode {
            MotorMode::Stopped => {
                self.reset_loops();
                self.driver.reset();
                let first = if self.driver.uses_alignment() {
                    MotorMode::Aligning
                } else {
                    // Forced commutation has nothing to park against.
                    MotorMode::OpenLoop
                };
                self.enter_mode(first);
                Ok(())
            }
            MotorMode::Error => Err(self.motor_error.unwrap_or(MotorError::InvalidArgs)),
            _ => Ok(()),
        }
    }

    /// Stop command: brake down if the rotor is moving, stop outright
    /// otherwise.
    pub fn stop(&mut self) -> Result<(), MotorError> {
        match self.mode {
            MotorMode::Aligning
            | MotorMode::OpenLoop
            | MotorMode::Transition
            | MotorMode::Running => {
                let speed = self.driver.estimate_speed().unwrap_or(self.state.velocity);
                if fabsf(speed) > STOP_SPEED_THRESHOLD {
                    self.enter_mode(MotorMode::Braking);
                } else {
                    self.reset_loops();
                    self.enter_mode(MotorMode::Stopped);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Immediate disable: outputs released now, braking bypassed.
    ///
    /// Has no effect in ERROR; faults are only left via `clear_fault`.
    pub fn disable(&mut self) {
        if matches!(self.mode, MotorMode::Error | MotorMode::Idle) {
            return;
        }
        self.reset_loops();
        self.enter_mode(MotorMode::Stopped);
        let (mut ctx, driver, hal) = self.parts();
        let _ = driver.update_pwm(&mut ctx, hal, MotorMode::Stopped);
    }

    /// Leave ERROR after revalidating the configuration.
    pub fn clear_fault(&mut self) -> Result<(), MotorError> {
        if self.mode != MotorMode::Error {
            return Ok(());
        }
        self.config.validate()?;
        self.driver.reset();
        self.reset_loops();
        self.motor_error = None;
        self.enter_mode(MotorMode::Stopped);
        info!("fault cleared");
        Ok(())
    }

    /// Execute exactly one control tick.
    ///
    /// In ERROR mode ticks are no-ops until the fault is cleared. Any fault
    /// raised during the tick latches the motor into ERROR and is also
    /// returned to the caller.
    pub fn run(&mut self, dt: f32) -> Result<(), MotorError> {
        if !self.state.is_initialized {
            return Err(MotorError::Uninitialized);
        }
        if !(dt > 0.0) || !dt.is_finite() {
            return Err(MotorError::InvalidArgs);
        }
        if self.mode == MotorMode::Error {
            return Ok(());
        }

        self.state.last_update_us = self.state.last_update_us.wrapping_add((dt * 1e6) as u32);

        match self.tick(dt) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.fault(error);
                Err(error)
            }
        }
    }

    fn tick(&mut self, dt: f32) -> Result<(), MotorError> {
        {
            let (mut ctx, driver, hal) = self.parts();
            driver.update_state(&mut ctx, hal, dt)?;
        }
        self.check_feedback()?;
        self.advance_mode(dt)?;

        let mode = self.mode;
        let (mut ctx, driver, hal) = self.parts();
        driver.commutate(&mut ctx, hal, mode, dt)?;
        driver.update_pwm(&mut ctx, hal, mode)?;
        Ok(())
    }

    /// Per-tick state machine transitions.
    fn advance_mode(&mut self, dt: f32) -> Result<(), MotorError> {
        let speed = self.driver.estimate_speed().unwrap_or(self.state.velocity);

        match self.mode {
            MotorMode::Aligning => {
                self.align_elapsed_s += dt;
                if self.align_elapsed_s >= self.config.startup.align_time_s {
                    self.enter_mode(MotorMode::OpenLoop);
                }
            }
            MotorMode::OpenLoop => {
                self.open_loop_elapsed_s += dt;
                // Debounced: a single noisy estimate above the threshold is
                // not a spun-up rotor.
                if fabsf(speed) >= self.config.min_startup_speed {
                    self.startup_streak += 1;
                } else {
                    self.startup_streak = 0;
                }
                if self.startup_streak >= self.config.startup.startup_debounce_ticks {
                    self.enter_mode(MotorMode::Transition);
                } else if self.open_loop_elapsed_s > OPEN_LOOP_TIMEOUT_S {
                    return Err(MotorError::Stall);
                }
            }
            MotorMode::Transition => {
                if self.driver.is_locked() {
                    self.lock_streak += 1;
                } else {
                    self.lock_streak = 0;
                }
                if self.lock_streak >= self.config.startup.lock_debounce_ticks {
                    self.enter_mode(MotorMode::Running);
                }
            }
            MotorMode::Running => {
                self.check_stall(speed, dt)?;
            }
            MotorMode::Braking => {
                if fabsf(speed) <= STOP_SPEED_THRESHOLD {
                    self.reset_loops();
                    self.enter_mode(MotorMode::Stopped);
                }
            }
            MotorMode::Idle | MotorMode::Stopped | MotorMode::Error => {}
        }
        Ok(())
    }

    fn check_stall(&mut self, speed: f32, dt: f32) -> Result<(), MotorError> {
        let commanding = match self.control_mode {
            ControlMode::Velocity => fabsf(self.setpoint.velocity) > self.config.stall.speed_threshold,
            ControlMode::Torque => fabsf(self.setpoint.torque) > self.config.stall.command_margin,
            ControlMode::Current => fabsf(self.setpoint.current) > self.config.stall.command_margin,
            ControlMode::Voltage => fabsf(self.setpoint.voltage) > self.config.stall.command_margin,
            // Position mode legitimately holds at zero speed.
            ControlMode::Position => false,
        };

        if commanding && fabsf(speed) < self.config.stall.speed_threshold {
            self.stall_elapsed_s += dt;
            if self.stall_elapsed_s >= self.config.stall.dwell_s {
                return Err(MotorError::Stall);
            }
        } else {
            self.stall_elapsed_s = 0.0;
        }
        Ok(())
    }

    /// Reject non-finite feedback before it reaches any loop.
    fn check_feedback(&self) -> Result<(), MotorError> {
        let state = &self.state;
        let finite = state.dc_voltage.is_finite()
            && state.position.is_finite()
            && state.velocity.is_finite()
            && state.temperature.is_finite()
            && state.phase_voltages.iter().all(|v| v.is_finite())
            && state.phase_currents.iter().all(|c| c.is_finite());
        if finite {
            Ok(())
        } else {
            Err(MotorError::SensorFault)
        }
    }

    fn fault(&mut self, error: MotorError) {
        error!("motor fault: {}", error);
        self.motor_error = Some(error);
        self.mode = MotorMode::Error;
        let (mut ctx, driver, hal) = self.parts();
        let _ = driver.update_pwm(&mut ctx, hal, MotorMode::Error);
    }

    fn enter_mode(&mut self, mode: MotorMode) {
        if self.mode != mode {
            info!("mode {} -> {}", self.mode, mode);
        }
        self.mode = mode;
        match mode {
            MotorMode::Aligning => self.align_elapsed_s = 0.0,
            MotorMode::OpenLoop => {
                self.open_loop_elapsed_s = 0.0;
                self.startup_streak = 0;
            }
            MotorMode::Transition => self.lock_streak = 0,
            MotorMode::Running => self.stall_elapsed_s = 0.0,
            _ => {}
        }
    }

    fn reset_loops(&mut self) {
        self.pids.reset();
        self.stall_elapsed_s = 0.0;
    }

    /// Copy the cross-context setpoint into the control context.
    ///
    /// Call at the top of the tick context; see `SharedSetpoint` for the
    /// concurrency contract.
    pub fn sync_setpoint(&mut self, shared: &SharedSetpoint) {
        self.setpoint = shared.snapshot();
    }

    pub fn set_voltage(&mut self, voltage: f32) -> Result<(), MotorError> {
        let (mut ctx, driver, _) = self.parts();
        driver.set_voltage(&mut ctx, voltage)
    }

    pub fn set_current(&mut self, current: f32) -> Result<(), MotorError> {
        let (mut ctx, driver, _) = self.parts();
        driver.set_current(&mut ctx, current)
    }

    pub fn set_velocity(&mut self, velocity: f32) -> Result<(), MotorError> {
        let (mut ctx, driver, _) = self.parts();
        driver.set_velocity(&mut ctx, velocity)
    }

    pub fn set_position(&mut self, position: f32) -> Result<(), MotorError> {
        let (mut ctx, driver, _) = self.parts();
        driver.set_position(&mut ctx, position)
    }

    pub fn set_torque(&mut self, torque: f32) -> Result<(), MotorError> {
        let (mut ctx, driver, _) = self.parts();
        driver.set_torque(&mut ctx, torque)
    }

    pub fn mode(&self) -> MotorMode {
        self.mode
    }

    pub fn state(&self) -> &MotorState {
        &self.state
    }

    pub fn setpoint(&self) -> &Setpoint {
        &self.setpoint
    }

    pub fn control_mode(&self) -> ControlMode {
        self.control_mode
    }

    pub fn motor_error(&self) -> Option<MotorError> {
        self.motor_error
    }

    pub fn config(&self) -> &MotorConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }
}
