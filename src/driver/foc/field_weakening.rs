//! Field weakening.
//!
//! Injects negative d-axis current when the requested voltage vector runs
//! out of bus-voltage headroom, extending the speed range beyond the
//! voltage-limited base speed. The reference is corrected incrementally each
//! tick rather than solved in closed form, so the current loop never sees an
//! abrupt reference step.

use libm::sqrtf;

use crate::error::MotorError;

/// D-axis current bounds and correction gain.
///
/// By convention `id_min <= id_max <= 0`: field weakening only ever demands
/// flux-opposing current.
#[derive(Debug, Clone, Copy)]
pub struct FieldWeakeningConfig {
    /// Most negative allowed d-axis reference in amperes.
    pub id_min: f32,
    /// Least negative allowed d-axis reference in amperes.
    pub id_max: f32,
    /// Correction gain in A/V per tick.
    pub k_fw: f32,
    /// Fraction of the available voltage kept as headroom, in [0, 1).
    pub voltage_margin: f32,
}

impl Default for FieldWeakeningConfig {
    fn default() -> Self {
        Self {
            id_min: -10.0,
            id_max: 0.0,
            k_fw: 0.05,
            voltage_margin: 0.05,
        }
    }
}

impl FieldWeakeningConfig {
    pub fn validate(&self) -> Result<(), MotorError> {
        let ordered = self.id_min <= self.id_max && self.id_max <= 0.0;
        let finite = self.id_min.is_finite() && self.k_fw.is_finite();
        if !ordered || !finite || self.k_fw < 0.0 || !(0.0..1.0).contains(&self.voltage_margin) {
            return Err(MotorError::ConfigInvalid);
        }
        Ok(())
    }
}

/// Per-motor field weakening state.
#[derive(Debug, Default)]
pub struct FieldWeakeningState {
    id_ref: f32,
}

impl FieldWeakeningState {
    /// Recompute the d-axis reference from this tick's voltage demand.
    ///
    /// `vd`/`vq` are the previous tick's voltage commands and `v_max` the
    /// voltage currently available from the bus. While the demand exceeds
    /// the margin-reduced limit the reference walks negative; once headroom
    /// returns it walks back up and parks at `id_max`.
    pub fn update(&mut self, config: &FieldWeakeningConfig, vd: f32, vq: f32, v_max: f32) -> f32 {
        let limit = (1.0 - config.voltage_margin) * v_max;
        let v_mag = sqrtf(vd * vd + vq * vq);

        self.id_ref =
            (self.id_ref + config.k_fw * (limit - v_mag)).clamp(config.id_min, config.id_max);
        self.id_ref
    }

    pub fn reset(&mut self) {
        self.id_ref = 0.0;
    }

    pub fn id_ref(&self) -> f32 {
        self.id_ref
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FieldWeakeningConfig {
        FieldWeakeningConfig::default()
    }

    #[test]
    fn test_zero_without_violation() {
        let mut state = FieldWeakeningState::default();
        // Demand well under the limit: the reference stays parked at zero.
        for _ in 0..100 {
            assert_eq!(state.update(&config(), 3.0, 4.0, 24.0), 0.0);
        }
    }

    #[test]
    fn test_walks_negative_under_violation() {
        let mut state = FieldWeakeningState::default();
        let mut prev = 0.0;
        for _ in 0..10 {
            let id_ref = state.update(&config(), 10.0, 22.0, 24.0);
            assert!(id_ref <= prev);
            prev = id_ref;
        }
        assert!(prev < 0.0);
    }

    #[test]
    fn test_clamped_to_id_min() {
        let mut state = FieldWeakeningState::default();
        let cfg = config();
        for _ in 0..10_000 {
            let id_ref = state.update(&cfg, 0.0, 100.0, 24.0);
            assert!(id_ref >= cfg.id_min && id_ref <= cfg.id_max);
        }
        assert_eq!(state.id_ref(), cfg.id_min);
    }

    #[test]
    fn test_relaxes_back_to_zero() {
        let mut state = FieldWeakeningState::default();
        let cfg = config();
        for _ in 0..100 {
            state.update(&cfg, 10.0, 22.0, 24.0);
        }
        assert!(state.id_ref() < 0.0);
        for _ in 0..10_000 {
            state.update(&cfg, 0.0, 1.0, 24.0);
        }
        assert_eq!(state.id_ref(), 0.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());

        let mut bad = config();
        bad.id_max = 1.0;
        assert_eq!(bad.validate(), Err(MotorError::ConfigInvalid));

        let mut bad = config();
        bad.id_min = 0.5;
        assert_eq!(bad.validate(), Err(MotorError::ConfigInvalid));

        let mut bad = config();
        bad.voltage_margin = 1.0;
        assert_eq!(bad.validate(), Err(MotorError::ConfigInvalid));
    }
}
