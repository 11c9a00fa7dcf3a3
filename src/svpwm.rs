//! Space vector PWM duty generation.
//!
//! Uses a fast x/y/z coordinate transformation and sign-based sector
//! detection instead of trigonometric functions. Duties are centered at 0.5
//! for the zero vector, consistent with center-aligned modulation.

const SQRT3: f32 = 1.732_050_8; // sqrt(3)

/// Compute per-phase duty cycles for the requested stationary-frame voltage.
///
/// # Arguments
/// * `v_alpha` - Alpha-axis voltage command (volts)
/// * `v_beta` - Beta-axis voltage command (volts)
/// * `v_bus` - DC bus voltage (volts)
///
/// # Returns
/// Duty cycles [a, b, c], each in [0, 1].
pub fn svpwm(v_alpha: f32, v_beta: f32, v_bus: f32) -> [f32; 3] {
    // A dead bus cannot be modulated; hold every phase at midpoint.
    if v_bus <= 0.0 {
        return [0.5, 0.5, 0.5];
    }

    let v_alpha_norm = v_alpha / v_bus;
    let v_beta_norm = v_beta / v_bus;

    // Map the normalized alpha/beta plane onto three axes aligned with the
    // six SVPWM sectors.
    let sqrt3_alpha = SQRT3 * v_alpha_norm;
    let x = v_beta_norm;
    let y = (v_beta_norm + sqrt3_alpha) / 2.0;
    let z = (v_beta_norm - sqrt3_alpha) / 2.0;

    // Sector from the signs of x/y/z; no atan2 required.
    let sector: u8 = match (x >= 0.0, y >= 0.0, z >= 0.0) {
        (true, true, false) => 1,
        (_, true, true) => 2,
        (true, false, true) => 3,
        (false, false, true) => 4,
        (_, false, false) => 5,
        (false, true, false) => 6,
    };

    // Per-phase switching times in [-1, 1].
    let (ta, tb, tc) = match sector {
        1 | 4 => (x - z, x + z, -x + z),
        2 | 5 => (y - z, y + z, -y - z),
        3 | 6 => (y - x, -y + x, -y - x),
        _ => (0.0, 0.0, 0.0),
    };

    [
        ((ta + 1.0) / 2.0).clamp(0.0, 1.0),
        ((tb + 1.0) / 2.0).clamp(0.0, 1.0),
        ((tc + 1.0) / 2.0).clamp(0.0, 1.0),
    ]
}
