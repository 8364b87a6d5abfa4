//! Minkowski four-vectors on top of `nalgebra`.
//!
//! Components are ordered `(E, px, py, pz)`.

use nalgebra::{Matrix4, Vector3, Vector4};

/// Four-momentum `(E, px, py, pz)`.
pub type FourVector = Vector4<f64>;

/// Build a four-vector from energy and three-momentum components.
#[inline]
pub fn four_vector(e: f64, px: f64, py: f64, pz: f64) -> FourVector {
    Vector4::new(e, px, py, pz)
}

/// Four-vector of a particle of mass `m` with three-momentum `p`.
pub fn from_mass_and_momentum(m: f64, p: Vector3<f64>) -> FourVector {
    Vector4::new((m * m + p.norm_squared()).sqrt(), p.x, p.y, p.z)
}

/// Spatial part.
#[inline]
pub fn vect(p: &FourVector) -> Vector3<f64> {
    Vector3::new(p[1], p[2], p[3])
}

/// Minkowski product with metric `(+, -, -, -)`.
#[inline]
pub fn minkowski_dot(a: &FourVector, b: &FourVector) -> f64 {
    a[0] * b[0] - a[1] * b[1] - a[2] * b[2] - a[3] * b[3]
}

/// Invariant mass squared.
#[inline]
pub fn mass_squared(p: &FourVector) -> f64 {
    minkowski_dot(p, p)
}

/// Signed invariant mass: `sign(m²)·sqrt(|m²|)`.
///
/// Space-like vectors map to negative masses instead of NaN.
#[inline]
pub fn mass(p: &FourVector) -> f64 {
    let m2 = mass_squared(p);
    m2.signum() * m2.abs().sqrt()
}

/// Lorentz transformation into the rest frame of `frame`.
///
/// Identity when `frame` is at rest or not time-like.
pub fn rest_frame_boost(frame: &FourVector) -> Matrix4<f64> {
    let e = frame[0];
    if e <= 0.0 {
        return Matrix4::identity();
    }
    let beta = vect(frame) / e;
    let b2 = beta.norm_squared();
    if b2 == 0.0 || b2 >= 1.0 {
        return Matrix4::identity();
    }
    let gamma = 1.0 / (1.0 - b2).sqrt();
    let k = (gamma - 1.0) / b2;
    let mut boost = Matrix4::identity();
    boost[(0, 0)] = gamma;
    for i in 0..3 {
        boost[(0, i + 1)] = -gamma * beta[i];
        boost[(i + 1, 0)] = -gamma * beta[i];
        for j in 0..3 {
            boost[(i + 1, j + 1)] += k * beta[i] * beta[j];
        }
    }
    boost
}

/// Boost `p` into the rest frame of `frame`.
///
/// Returns `p` unchanged when `frame` is at rest or not time-like.
pub fn boost_to_rest_frame(p: &FourVector, frame: &FourVector) -> FourVector {
    rest_frame_boost(frame) * p
}
