//! PID control loop shared by every closed loop in the core.

/// PID gains, output clamp and derivative filtering.
#[derive(Debug, Clone, Copy)]
pub struct PidConfig {
    /// Proportional gain.
    pub kp: f32,
    /// Integral gain.
    pub ki: f32,
    /// Derivative gain.
    pub kd: f32,
    /// Minimum output.
    pub output_min: f32,
    /// Maximum output.
    pub output_max: f32,
    /// EMA coefficient for derivative smoothing; 1.0 disables filtering.
    pub derivative_ema_alpha: f32,
}

impl PidConfig {
    /// Config with a symmetric output range of ±`output_limit`.
    pub fn symmetric(kp: f32, ki: f32, kd: f32, output_limit: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            output_min: -output_limit,
            output_max: output_limit,
            derivative_ema_alpha: 1.0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.kp.is_finite()
            && self.ki.is_finite()
            && self.kd.is_finite()
            && self.kp >= 0.0
            && self.ki >= 0.0
            && self.kd >= 0.0
            && self.output_min < self.output_max
            && (0.0..=1.0).contains(&self.derivative_ema_alpha)
    }
}

/// PID controller with EMA-smoothed derivative and conditional anti-windup.
pub struct Pid {
    config: PidConfig,
    /// Accumulated integral term (already weighted by ki).
    integral: f32,
    prev_error: f32,
    prev_derivative: f32,
    has_prev_error: bool,
    saturated: bool,
}

impl Pid {
    pub fn new(config: PidConfig) -> Self {
        Self {
            config,
            integral: 0.0,
            prev_error: 0.0,
            prev_derivative: 0.0,
            has_prev_error: false,
            saturated: false,
        }
    }

    /// Zero all dynamic state; gains and limits are untouched.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
        self.prev_derivative = 0.0;
        self.has_prev_error = false;
        self.saturated = false;
    }

    /// Advance the loop with the control error over `dt` seconds.
    ///
    /// The derivative is formed from the error delta and passed through an
    /// EMA filter before it is weighted; the raw delta never reaches the
    /// output. The integral accumulates `ki * error * dt` only while doing so
    /// does not push the unclamped output further into saturation.
    pub fn update(&mut self, error: f32, dt: f32) -> f32 {
        let mut derivative = self.prev_derivative;
        if dt > 0.0 && self.has_prev_error {
            let raw = (error - self.prev_error) / dt;
            let alpha = self.config.derivative_ema_alpha;
            derivative = alpha * raw + (1.0 - alpha) * self.prev_derivative;
        }
        self.prev_derivative = derivative;
        self.prev_error = error;
        self.has_prev_error = true;

        let increment = self.config.ki * error * dt;
        let tentative =
            self.config.kp * error + self.integral + increment + self.config.kd * derivative;

        let inside = tentative <= self.config.output_max && tentative >= self.config.output_min;
        let recovering = (tentative > self.config.output_max && increment < 0.0)
            || (tentative < self.config.output_min && increment > 0.0);
        if inside || recovering {
            self.integral += increment;
        }

        let output = self.config.kp * error + self.integral + self.config.kd * derivative;
        let clamped = output.clamp(self.config.output_min, self.config.output_max);
        self.saturated = output != clamped;
        clamped
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    /// Whether the last output hit a clamp.
    pub fn is_saturated(&self) -> bool {
        self.saturated
    }

    pub fn config(&self) -> &PidConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 0.0001;

    fn approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < EPSILON
    }

    fn config(kp: f32, ki: f32, kd: f32, limit: f32, alpha: f32) -> PidConfig {
        PidConfig {
            kp,
            ki,
            kd,
            output_min: -limit,
            output_max: limit,
            derivative_ema_alpha: alpha,
        }
    }

    #[test]
    fn test_proportional_only() {
        let mut pid = Pid::new(config(1.0, 0.0, 0.0, 10.0, 1.0));
        assert!(approx_eq(pid.update(5.0, 0.1), 5.0));
        assert!(approx_eq(pid.update(-5.0, 0.1), -5.0));
    }

    #[test]
    fn test_output_limiting() {
        let mut pid = Pid::new(config(1.0, 0.0, 0.0, 10.0, 1.0));
        assert!(approx_eq(pid.update(20.0, 0.1), 10.0));
        assert!(pid.is_saturated());
    }

    #[test]
    fn test_zero_error_round_trip() {
        let mut pid = Pid::new(config(1.0, 1.0, 1.0, 10.0, 0.5));
        for _ in 0..10 {
            assert!(approx_eq(pid.update(0.0, 0.01), 0.0));
        }
    }

    #[test]
    fn test_integral_accumulation() {
        let mut pid = Pid::new(config(0.0, 1.0, 0.0, 100.0, 1.0));
        // Error 10, dt 0.1: the integral gains 1.0 per step.
        pid.update(10.0, 0.1);
        assert!(approx_eq(pid.integral(), 1.0));
        pid.update(10.0, 0.1);
        assert!(approx_eq(pid.integral(), 2.0));
    }

    #[test]
    fn test_anti_windup_positive() {
        let mut pid = Pid::new(config(0.0, 1.0, 0.0, 10.0, 1.0));
        let mut prev = 0.0;
        for _ in 0..50 {
            let out = pid.update(20.0, 0.1);
            // Monotone rise until the clamp, never beyond it.
            assert!(out >= prev);
            assert!(out <= 10.0);
            prev = out;
        }
        // The integral stopped at a value the clamp allows.
        assert!(pid.integral() <= 10.0);
        let frozen = pid.integral();
        pid.update(20.0, 0.1);
        assert!(approx_eq(pid.integral(), frozen));
    }

    #[test]
    fn test_anti_windup_negative() {
        let mut pid = Pid::new(config(0.0, 1.0, 0.0, 10.0, 1.0));
        for _ in 0..50 {
            let out = pid.update(-20.0, 0.1);
            assert!(out >= -10.0);
        }
        assert!(pid.integral() >= -10.0);
    }

    #[test]
    fn test_integral_recovers_from_saturation() {
        let mut pid = Pid::new(config(0.0, 1.0, 0.0, 10.0, 1.0));
        for _ in 0..50 {
            pid.update(20.0, 0.1);
        }
        // Reversed error must integrate immediately even though the output
        // is still pinned at the clamp.
        let before = pid.integral();
        pid.update(-20.0, 0.1);
        assert!(pid.integral() < before);
    }

    #[test]
    fn test_derivative_ema() {
        let mut pid = Pid::new(config(0.0, 0.0, 1.0, 100.0, 0.5));
        // First sample has no previous error: derivative is zero.
        assert!(approx_eq(pid.update(5.0, 0.1), 0.0));
        // Raw derivative 10, filtered by alpha 0.5 -> 5.
        assert!(approx_eq(pid.update(6.0, 0.1), 5.0));
        // Raw still 10, EMA converges: 0.5*10 + 0.5*5 = 7.5.
        assert!(approx_eq(pid.update(7.0, 0.1), 7.5));
    }

    #[test]
    fn test_derivative_unfiltered() {
        let mut pid = Pid::new(config(0.0, 0.0, 1.0, 100.0, 1.0));
        pid.update(5.0, 0.1);
        assert!(approx_eq(pid.update(6.0, 0.1), 10.0));
        assert!(approx_eq(pid.update(5.0, 0.1), -10.0));
    }

    #[test]
    fn test_zero_dt_keeps_derivative() {
        let mut pid = Pid::new(config(1.0, 1.0, 1.0, 100.0, 1.0));
        let out = pid.update(5.0, 0.0);
        // Only the proportional term contributes with dt = 0.
        assert!(approx_eq(out, 5.0));
    }

    #[test]
    fn test_reset() {
        let mut pid = Pid::new(config(1.0, 1.0, 1.0, 100.0, 0.5));
        pid.update(5.0, 0.1);
        pid.update(7.0, 0.1);
        pid.reset();
        assert!(approx_eq(pid.integral(), 0.0));
        assert!(approx_eq(pid.update(0.0, 0.1), 0.0));
    }

    #[test]
    fn test_config_validation() {
        assert!(config(1.0, 1.0, 1.0, 10.0, 0.1).is_valid());
        let mut bad = config(1.0, 1.0, 1.0, 10.0, 0.1);
        bad.output_min = bad.output_max;
        assert!(!bad.is_valid());
        let mut bad = config(1.0, 1.0, 1.0, 10.0, 1.5);
        assert!(!bad.is_valid());
        bad.derivative_ema_alpha = 0.5;
        bad.kp = -1.0;
        assert!(!bad.is_valid());
    }
}
