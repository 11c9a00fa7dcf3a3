//! Coordinate transforms for field-oriented control.
//!
//! Clarke and Park transforms between the three-phase, stationary two-axis
//! and rotating dq reference frames, plus the voltage-vector limiter used
//! ahead of modulation.

use core::f32::consts::{PI, TAU};

use libm::{cosf, sinf, sqrtf};

// Enable idsp-based fast trigonometric functions.
const USE_IDSP_COSSIN: bool = true;

const INV_SQRT3: f32 = 0.577_350_26; // 1 / sqrt(3)
const SQRT3_DIV_2: f32 = 0.866_025_4; // sqrt(3) / 2

/// Cosine and sine of `theta`.
///
/// Uses idsp::cossin() for fast calculation (~40 cycles on Cortex-M)
/// compared to libm::cosf/sinf (~100-200 cycles). Can be switched via
/// USE_IDSP_COSSIN.
pub fn cos_sin(theta: f32) -> (f32, f32) {
    if USE_IDSP_COSSIN {
        cos_sin_idsp(theta)
    } else {
        cos_sin_libm(theta)
    }
}

#[inline]
fn cos_sin_idsp(theta: f32) -> (f32, f32) {
    // idsp uses i32::MIN..=i32::MAX to represent -pi..pi, so fold the
    // [0, 2pi) input into [-pi, pi] before scaling to full range.
    let normalized = if theta > PI { theta - TAU } else { theta };

    const SCALE: f32 = 2147483648.0 / PI; // 2^31 / pi
    let phase: i32 = (normalized * SCALE) as i32;

    let (cos_i32, sin_i32) = idsp::cossin(phase);

    const I32_TO_F32: f32 = 1.0 / 2147483648.0; // 1 / 2^31
    (cos_i32 as f32 * I32_TO_F32, sin_i32 as f32 * I32_TO_F32)
}

#[inline]
fn cos_sin_libm(theta: f32) -> (f32, f32) {
    (cosf(theta), sinf(theta))
}

/// Clarke transform from two measured phase currents (abc -> alpha/beta).
pub fn clarke(ia: f32, ib: f32) -> (f32, f32) {
    (ia, (ia + 2.0 * ib) * INV_SQRT3)
}

/// Clarke transform from all three phase currents.
pub fn clarke3(ia: f32, ib: f32, ic: f32) -> (f32, f32) {
    (ia, INV_SQRT3 * (ib - ic))
}

/// Park transform (alpha/beta -> dq) at electrical angle `theta`.
pub fn park(alpha: f32, beta: f32, theta: f32) -> (f32, f32) {
    let (cos_theta, sin_theta) = cos_sin(theta);
    (
        alpha * cos_theta + beta * sin_theta,
        -alpha * sin_theta + beta * cos_theta,
    )
}

/// Inverse Park transform (dq -> alpha/beta).
pub fn inverse_park(d: f32, q: f32, theta: f32) -> (f32, f32) {
    let (cos_theta, sin_theta) = cos_sin(theta);
    (
        d * cos_theta - q * sin_theta,
        d * sin_theta + q * cos_theta,
    )
}

/// Inverse Clarke transform (alpha/beta -> abc).
pub fn inverse_clarke(v_alpha: f32, v_beta: f32) -> (f32, f32, f32) {
    (
        v_alpha,
        -0.5 * v_alpha + SQRT3_DIV_2 * v_beta,
        -0.5 * v_alpha - SQRT3_DIV_2 * v_beta,
    )
}

/// Limit the dq voltage vector to `max_voltage` magnitude.
///
/// Both components are scaled down proportionally so the vector direction is
/// preserved and the magnitude lands exactly on the circle boundary.
pub fn limit_voltage(vd: f32, vq: f32, max_voltage: f32) -> (f32, f32) {
    let magnitude = sqrtf(vd * vd + vq * vq);

    if magnitude > max_voltage {
        let scale = max_voltage / magnitude;
        (vd * scale, vq * scale)
    } else {
        (vd, vq)
    }
}

/// Normalize an angle to [0, 2pi).
pub fn normalize_angle(angle: f32) -> f32 {
    let mut normalized = angle;
    while normalized >= TAU {
        normalized -= TAU;
    }
    while normalized < 0.0 {
        normalized += TAU;
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 0.001;

    fn approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < EPSILON
    }

    #[test]
    fn test_cos_sin_matches_libm() {
        let mut theta = 0.0f32;
        while theta < TAU {
            let (c_fast, s_fast) = cos_sin_idsp(theta);
            let (c_ref, s_ref) = cos_sin_libm(theta);
            assert!((c_fast - c_ref).abs() < 0.001);
            assert!((s_fast - s_ref).abs() < 0.001);
            theta += 0.05;
        }
    }

    #[test]
    fn test_inverse_park_zero_angle() {
        let (v_alpha, v_beta) = inverse_park(1.0, 0.0, 0.0);
        assert!(approx_eq(v_alpha, 1.0));
        assert!(approx_eq(v_beta, 0.0));
    }

    #[test]
    fn test_park_aligns_rotating_vector() {
        // A current vector at the rotor angle maps entirely onto the d axis.
        let theta = 1.2f32;
        let (cos_theta, sin_theta) = cos_sin_libm(theta);
        let (d, q) = park(cos_theta, sin_theta, theta);
        assert!(approx_eq(d, 1.0));
        assert!(approx_eq(q, 0.0));
    }

    #[test]
    fn test_park_inverse_park_consistency() {
        let theta = 2.5f32;
        let (alpha, beta) = inverse_park(0.7, -0.3, theta);
        let (d, q) = park(alpha, beta, theta);
        assert!(approx_eq(d, 0.7));
        assert!(approx_eq(q, -0.3));
    }

    #[test]
    fn test_clarke_balanced_set() {
        // Balanced currents: clarke3 and the two-phase form agree.
        let (ia, ib) = (0.6f32, -0.1f32);
        let ic = -ia - ib;
        let (a2, b2) = clarke(ia, ib);
        let (a3, b3) = clarke3(ia, ib, ic);
        assert!(approx_eq(a2, a3));
        assert!(approx_eq(b2, b3));
    }

    #[test]
    fn test_inverse_clarke() {
        let (v_u, v_v, v_w) = inverse_clarke(1.0, 0.0);
        assert!(approx_eq(v_u, 1.0));
        assert!(approx_eq(v_v, -0.5));
        assert!(approx_eq(v_w, -0.5));
        // Sum is zero for a balanced three-phase set.
        assert!(approx_eq(v_u + v_v + v_w, 0.0));
    }

    #[test]
    fn test_limit_voltage() {
        let (vd, vq) = limit_voltage(10.0, 0.0, 5.0);
        assert!(approx_eq(vd, 5.0));
        assert!(approx_eq(vq, 0.0));

        // Magnitude 5 is inside a limit of 10: untouched.
        let (vd, vq) = limit_voltage(3.0, 4.0, 10.0);
        assert!(approx_eq(vd, 3.0));
        assert!(approx_eq(vq, 4.0));
    }

    #[test]
    fn test_limit_voltage_preserves_ratio() {
        let (vd, vq) = limit_voltage(6.0, 8.0, 5.0);
        // Direction preserved, magnitude exactly on the boundary.
        assert!(approx_eq(vq / vd, 8.0 / 6.0));
        assert!(approx_eq(sqrtf(vd * vd + vq * vq), 5.0));
    }

    #[test]
    fn test_normalize_angle() {
        assert!(approx_eq(normalize_angle(0.0), 0.0));
        assert!(approx_eq(normalize_angle(7.0), 7.0 - TAU));
        assert!(approx_eq(normalize_angle(-1.0), TAU - 1.0));
    }
}
