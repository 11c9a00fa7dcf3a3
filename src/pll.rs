//! Phase-locked loop angle/speed tracker.
//!
//! Shared building block for the sensorless observers: a PI correction on a
//! wrapped phase error produces a smoothed angle/speed pair from noisy
//! samples.

use core::f32::consts::{PI, TAU};

use libm::fabsf;

use crate::transforms::normalize_angle;

/// Phase error magnitude below which the loop counts as locked.
const CONVERGENCE_THRESHOLD: f32 = 0.05;
/// Phase error clamp; anything larger is a glitch, not a correction.
const MAX_PHASE_ERROR: f32 = TAU;
const MAX_INTEGRATOR: f32 = 50.0;

#[derive(Debug, Clone, Copy)]
pub struct PllConfig {
    pub kp: f32,
    pub ki: f32,
    /// Clamp on the tracked speed in rad/s.
    pub max_omega: f32,
    /// EMA weight kept on the previous estimate when filtering is enabled.
    pub filter_alpha: f32,
    pub enable_filtering: bool,
}

impl PllConfig {
    pub fn is_valid(&self) -> bool {
        self.kp.is_finite()
            && self.ki.is_finite()
            && self.kp > 0.0
            && self.ki >= 0.0
            && self.max_omega > 0.0
            && (0.0..=1.0).contains(&self.filter_alpha)
    }
}

impl Default for PllConfig {
    fn default() -> Self {
        Self {
            kp: 100.0,
            ki: 2000.0,
            max_omega: 5000.0,
            filter_alpha: 0.0,
            enable_filtering: false,
        }
    }
}

/// PLL tracking state.
pub struct Pll {
    config: PllConfig,
    theta: f32,
    omega: f32,
    integrator: f32,
    prev_error: f32,
    max_error: f32,
    converged: bool,
}

impl Pll {
    pub fn new(config: PllConfig) -> Self {
        Self {
            config,
            theta: 0.0,
            omega: 0.0,
            integrator: 0.0,
            prev_error: 0.0,
            max_error: 0.0,
            converged: false,
        }
    }

    pub fn reset(&mut self) {
        self.theta = 0.0;
        self.omega = 0.0;
        self.integrator = 0.0;
        self.prev_error = 0.0;
        self.max_error = 0.0;
        self.converged = false;
    }

    /// Advance the loop with an externally computed phase error.
    pub fn update(&mut self, phase_error: f32, dt: f32) -> (f32, f32) {
        let phase_error = phase_error.clamp(-MAX_PHASE_ERROR, MAX_PHASE_ERROR);

        let abs_error = fabsf(phase_error);
        if abs_error > self.max_error {
            self.max_error = abs_error;
        }
        self.converged = abs_error < CONVERGENCE_THRESHOLD;

        // PI correction; the output is angular velocity.
        self.integrator += self.config.ki * phase_error * dt;
        self.integrator = self.integrator.clamp(-MAX_INTEGRATOR, MAX_INTEGRATOR);

        let omega = (self.config.kp * phase_error + self.integrator)
            .clamp(-self.config.max_omega, self.config.max_omega);
        let theta = self.theta + omega * dt;

        if self.config.enable_filtering {
            let alpha = self.config.filter_alpha;
            self.theta = alpha * self.theta + (1.0 - alpha) * theta;
            self.omega = alpha * self.omega + (1.0 - alpha) * omega;
        } else {
            self.theta = theta;
            self.omega = omega;
        }
        self.theta = normalize_angle(self.theta);
        self.prev_error = phase_error;

        (self.theta, self.omega)
    }

    /// Track a noisy absolute angle sample.
    pub fn track(&mut self, angle_sample: f32, dt: f32) -> (f32, f32) {
        let error = wrap_angle(angle_sample - self.theta);
        self.update(error, dt)
    }

    pub fn theta(&self) -> f32 {
        self.theta
    }

    pub fn omega(&self) -> f32 {
        self.omega
    }

    pub fn last_error(&self) -> f32 {
        self.prev_error
    }

    /// Largest phase error seen since the last reset.
    pub fn max_error(&self) -> f32 {
        self.max_error
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }
}

/// Wrap an angle difference to (-pi, pi].
pub fn wrap_angle(angle: f32) -> f32 {
    let mut wrapped = angle;
    while wrapped > PI {
        wrapped -= TAU;
    }
    while wrapped <= -PI {
        wrapped += TAU;
    }
    wrapped
}
