//! Helicity frames, helicity angles and breakup momenta.
//!
//! Helicity frames are chained down a decay tree: the frame of a combination
//! is built from its momentum in the rest frame of its parent, using the
//! parent's axes to fix the `y` direction.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Right-handed axes `[x, y, z]`.
pub type CoordinateSystem = [Vector3<f64>; 3];

/// Axes the final-state momenta are given in.
pub fn lab_frame() -> CoordinateSystem {
    [Vector3::x(), Vector3::y(), Vector3::z()]
}

/// Helicity frame of direction `v` seen from `c`: `z = v/|v|`,
/// `y = c.z × z`, `x = y × z`.
///
/// Returns `c` when `v` vanishes or points along `c.z`.
pub fn helicity_frame(v: &Vector3<f64>, c: &CoordinateSystem) -> CoordinateSystem {
    let norm = v.norm();
    if norm == 0.0 {
        return *c;
    }
    let z = v / norm;
    let y = c[2].cross(&z);
    let y_norm = y.norm();
    if y_norm == 0.0 {
        if z.dot(&c[2]) > 0.0 {
            return *c;
        }
        // anti-parallel: keep y, flip x and z
        return [c[1].cross(&z), c[1], z];
    }
    let y = y / y_norm;
    [y.cross(&z), y, z]
}

/// Direction of a decay daughter in the helicity frame of its parent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HelicityAngles {
    /// Azimuth in `[-π, π]`
    pub phi: f64,
    /// Polar angle in `[0, π]`
    pub theta: f64,
}

/// Angles of `v` in `c`. A direction along `c.z` has `phi = 0`.
pub fn angles(v: &Vector3<f64>, c: &CoordinateSystem) -> HelicityAngles {
    let x = v.dot(&c[0]);
    let y = v.dot(&c[1]);
    let z = v.dot(&c[2]);
    HelicityAngles { phi: y.atan2(x), theta: x.hypot(y).atan2(z) }
}

/// Squared breakup momentum of `R -> a b` in the rest frame of `R`.
///
/// Negative below threshold.
pub fn breakup_momentum_squared(m2_r: f64, m_a: f64, m_b: f64) -> f64 {
    if m_a == m_b {
        return m2_r / 4.0 - m_a * m_a;
    }
    (m2_r - (m_a + m_b).powi(2)) * (m2_r - (m_a - m_b).powi(2)) / (4.0 * m2_r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn test_helicity_frame_is_right_handed() {
        let c = helicity_frame(&Vector3::new(0.3, -0.8, 0.2), &lab_frame());
        assert_relative_eq!(c[0].cross(&c[1]), c[2], epsilon = 1e-12);
        assert_relative_eq!(c[2], Vector3::new(0.3, -0.8, 0.2).normalize(), epsilon = 1e-12);
        assert_relative_eq!(c[1].dot(&Vector3::z()), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_helicity_frame_along_z() {
        let lab = lab_frame();
        assert_eq!(helicity_frame(&Vector3::new(0.0, 0.0, 2.0), &lab), lab);
        assert_eq!(helicity_frame(&Vector3::zeros(), &lab), lab);
        let flipped = helicity_frame(&Vector3::new(0.0, 0.0, -1.0), &lab);
        assert_relative_eq!(flipped[0].cross(&flipped[1]), flipped[2], epsilon = 1e-12);
        assert_relative_eq!(flipped[2], -Vector3::z(), epsilon = 1e-12);
    }

    #[test]
    fn test_angles_in_lab_frame() {
        let a = angles(&Vector3::new(0.0, 1.0, 0.0), &lab_frame());
        assert_relative_eq!(a.phi, FRAC_PI_2, epsilon = 1e-12);
        assert_relative_eq!(a.theta, FRAC_PI_2, epsilon = 1e-12);

        let down = angles(&Vector3::new(0.0, 0.0, -3.0), &lab_frame());
        assert_eq!(down.phi, 0.0);
        assert_relative_eq!(down.theta, PI, epsilon = 1e-12);
    }

    #[test]
    fn test_breakup_momentum_equal_and_unequal_masses() {
        // two pions of |p| = 0.4 back to back
        let m = 0.139_57;
        let e = (m * m + 0.16f64).sqrt();
        assert_relative_eq!(breakup_momentum_squared(4.0 * e * e, m, m), 0.16, epsilon = 1e-12);

        let (ma, mb): (f64, f64) = (0.139_57, 0.493_68);
        let q2: f64 = 0.09;
        let m_r = (ma * ma + q2).sqrt() + (mb * mb + q2).sqrt();
        assert_relative_eq!(breakup_momentum_squared(m_r * m_r, ma, mb), q2, epsilon = 1e-12);
        assert!(breakup_momentum_squared(0.3, ma, mb) < 0.0);
    }
}
