//! Back-EMF PLL observer.
//!
//! Estimates the back-EMF vector from the motor model `e = v - Rs*i`, forms
//! a phase error between the measured and expected back-EMF directions, and
//! tracks angle and speed with the shared PLL.

use libm::sqrtf;

use super::{DivergenceGuard, Observer, ObserverInput, ObserverKind};
use crate::error::MotorError;
use crate::pll::{wrap_angle, Pll, PllConfig};
use crate::transforms::cos_sin;

/// Below this back-EMF magnitude the rotor is essentially parked and the
/// phase error is meaningless; hold the last estimate instead.
const MIN_BEMF_MAGNITUDE: f32 = 0.01;

/// Residual bound and consecutive-tick limit for loss-of-lock detection.
/// The cross-product residual saturates at 1.0, so the bound sits below it.
const RESIDUAL_BOUND: f32 = 0.9;
const RESIDUAL_LIMIT_TICKS: u32 = 25;

/// Margin over the PLL speed clamp for the angle-delta plausibility check.
const SPEED_PLAUSIBILITY_MARGIN: f32 = 1.5;

pub struct BemfPllObserver {
    /// Phase resistance used in the back-EMF model.
    rs: f32,
    pll: Pll,
    max_omega: f32,
    bemf_alpha: f32,
    bemf_beta: f32,
    bemf_magnitude: f32,
    prev_theta: f32,
    prev_omega: f32,
    guard: DivergenceGuard,
    update_count: u32,
}

impl BemfPllObserver {
    pub fn new(phase_resistance: f32, pll_config: PllConfig) -> Self {
        let max_omega = pll_config.max_omega;
        Self {
            rs: phase_resistance,
            pll: Pll::new(pll_config),
            max_omega,
            bemf_alpha: 0.0,
            bemf_beta: 0.0,
            bemf_magnitude: 0.0,
            prev_theta: 0.0,
            prev_omega: 0.0,
            guard: DivergenceGuard::new(RESIDUAL_BOUND, RESIDUAL_LIMIT_TICKS),
            update_count: 0,
        }
    }

    pub fn bemf_magnitude(&self) -> f32 {
        self.bemf_magnitude
    }

    /// Estimate from the tick before the current one.
    pub fn previous_estimate(&self) -> (f32, f32) {
        (self.prev_theta, self.prev_omega)
    }

    pub fn update_count(&self) -> u32 {
        self.update_count
    }

    fn compute_bemf(&mut self, input: &ObserverInput) {
        self.bemf_alpha = input.v_alpha - self.rs * input.i_alpha;
        self.bemf_beta = input.v_beta - self.rs * input.i_beta;
        self.bemf_magnitude =
            sqrtf(self.bemf_alpha * self.bemf_alpha + self.bemf_beta * self.bemf_beta);
    }
}

impl Observer for BemfPllObserver {
    fn update(&mut self, input: &ObserverInput, dt: f32) -> Result<(f32, f32), MotorError> {
        if dt <= 0.0 {
            return Err(MotorError::InvalidArgs);
        }

        self.compute_bemf(input);

        // Too little signal to correct against; the rotor cannot have moved
        // far, so hold the estimate.
        if self.bemf_magnitude < MIN_BEMF_MAGNITUDE {
            return Ok((self.pll.theta(), self.pll.omega()));
        }

        // Expected back-EMF direction for the current angle estimate: the
        // back-EMF vector leads the rotor flux by 90 degrees.
        let (cos_theta, sin_theta) = cos_sin(self.pll.theta());
        let expected_alpha = -self.bemf_magnitude * sin_theta;
        let expected_beta = self.bemf_magnitude * cos_theta;

        // Cross product of measured and expected vectors, normalized by the
        // squared magnitude: small-angle approximation of the phase error.
        let phase_error = (self.bemf_alpha * expected_beta - self.bemf_beta * expected_alpha)
            / (self.bemf_magnitude * self.bemf_magnitude + 1e-6);

        let (theta, omega) = self.pll.update(phase_error, dt);

        // Consistency checks against the previous estimate.
        let implied_omega = wrap_angle(theta - self.prev_theta) / dt;
        if libm::fabsf(implied_omega) > self.max_omega * SPEED_PLAUSIBILITY_MARGIN {
            return Err(MotorError::EstimatorDivergence);
        }
        self.guard.check(phase_error)?;

        self.prev_theta = theta;
        self.prev_omega = omega;
        self.update_count = self.update_count.wrapping_add(1);

        Ok((theta, omega))
    }

    fn reset(&mut self) {
        self.pll.reset();
        self.guard.reset();
        self.bemf_alpha = 0.0;
        self.bemf_beta = 0.0;
        self.bemf_magnitude = 0.0;
        self.prev_theta = 0.0;
        self.prev_omega = 0.0;
        self.update_count = 0;
    }

    fn kind(&self) -> ObserverKind {
        ObserverKind::BackEmfPll
    }

    fn is_converged(&self) -> bool {
        self.pll.is_converged()
    }

    fn theta(&self) -> f32 {
        self.pll.theta()
    }

    fn omega(&self) -> f32 {
        self.pll.omega()
    }
}
