//! Sensorless angle/speed estimation for field-oriented control.
//!
//! An observer consumes stationary-frame voltages and currents each tick and
//! advances an electrical angle/speed estimate. Concrete variants are
//! interchangeable behind the [`Observer`] trait; the FOC driver never
//! inspects which one is installed.

pub mod bemf_pll;

pub use self::bemf_pll::BemfPllObserver;

use crate::error::MotorError;

/// Concrete estimator variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ObserverKind {
    BackEmfPll,
    SlidingMode,
    Ekf,
}

/// Stationary-frame feedback consumed by an observer update.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObserverInput {
    pub v_alpha: f32,
    pub v_beta: f32,
    pub i_alpha: f32,
    pub i_beta: f32,
}

/// Angle/speed estimator capability.
pub trait Observer {
    /// Consume one feedback sample and advance the estimate.
    ///
    /// Returns the electrical angle in [0, 2pi) and the electrical angular
    /// velocity in rad/s. Loss of lock surfaces as
    /// `MotorError::EstimatorDivergence`, never as a silently held estimate.
    fn update(&mut self, input: &ObserverInput, dt: f32) -> Result<(f32, f32), MotorError>;

    /// Clear dynamic state; configuration is untouched.
    fn reset(&mut self);

    /// Tag identifying the concrete variant.
    fn kind(&self) -> ObserverKind;

    /// Whether the estimate currently tracks the input.
    fn is_converged(&self) -> bool;

    fn theta(&self) -> f32;
    fn omega(&self) -> f32;
}

/// Residual watchdog shared by observer implementations.
///
/// A single bad sample is noise; `limit` consecutive residuals beyond
/// `bound` is divergence.
pub(crate) struct DivergenceGuard {
    bound: f32,
    limit: u32,
    strikes: u32,
}

impl DivergenceGuard {
    pub(crate) fn new(bound: f32, limit: u32) -> Self {
        Self {
            bound,
            limit,
            strikes: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.strikes = 0;
    }

    pub(crate) fn check(&mut self, residual: f32) -> Result<(), MotorError> {
        if libm::fabsf(residual) > self.bound {
            self.strikes += 1;
            if self.strikes >= self.limit {
                warn!("observer residual out of bounds for {} ticks", self.strikes);
                return Err(MotorError::EstimatorDivergence);
            }
        } else {
            self.strikes = 0;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tolerates_isolated_glitches() {
        let mut guard = DivergenceGuard::new(1.0, 3);
        assert!(guard.check(2.0).is_ok());
        assert!(guard.check(0.1).is_ok());
        assert!(guard.check(2.0).is_ok());
        assert!(guard.check(2.0).is_ok());
    }

    #[test]
    fn test_guard_trips_on_consecutive_strikes() {
        let mut guard = DivergenceGuard::new(1.0, 3);
        assert!(guard.check(2.0).is_ok());
        assert!(guard.check(-2.0).is_ok());
        assert_eq!(guard.check(2.0), Err(MotorError::EstimatorDivergence));
    }
}
