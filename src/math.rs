//! Frame conversions between quaternions, Euler angles and rotation matrices.
//!
//! Euler angles are roll/pitch/yaw in radians, composed as `Rz(yaw) * Ry(pitch) * Rx(roll)`.
//! Quaternions are stored scalar-first as `[w, x, y, z]`.

use core::fmt;

use nalgebra::{Matrix3, Vector3, Vector4};
use num_traits::Float;

/// Below this `|cos(pitch)|` the Euler-rate coupling matrix is treated as singular.
pub const EULER_RATE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rotation {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl Rotation {
    pub const fn new(roll: f64, pitch: f64, yaw: f64) -> Self {
        Self { roll, pitch, yaw }
    }

    pub fn to_vector(&self) -> Vector3<f64> {
        Vector3::new(self.roll, self.pitch, self.yaw)
    }
}

/// Numerical failures near gimbal lock
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DomainError {
    /// `asin` argument of the pitch extraction left [-1, 1]
    PitchOutOfRange(f64),
    /// `cos(pitch)` too close to zero to invert
    EulerRateSingular(f64),
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PitchOutOfRange(sin_pitch) => {
                write!(f, "pitch extraction out of domain: sin(pitch) = {sin_pitch}")
            }
            Self::EulerRateSingular(cos_pitch) => {
                write!(f, "euler rate transform singular: cos(pitch) = {cos_pitch}")
            }
        }
    }
}

/// Extracts roll, pitch and yaw from a `[w, x, y, z]` quaternion.
///
/// The quaternion is divided by its squared norm first. For the unit quaternions
/// produced by the attitude filter this is the usual normalization; a non-unit
/// input is scaled rather than projected onto the unit sphere.
///
/// Fails when the pitch term leaves the `asin` domain, which happens at or
/// numerically past ±90° of pitch.
pub fn quaternion_to_euler(q: &Vector4<f64>) -> Result<Rotation, DomainError> {
    let norm_sq = q.norm_squared();
    let [w, x, y, z]: [f64; 4] = (q / norm_sq).into();

    let sin_pitch = 2.0 * (w * y - z * x);
    if !(-1.0..=1.0).contains(&sin_pitch) {
        return Err(DomainError::PitchOutOfRange(sin_pitch));
    }

    Ok(Rotation {
        roll: Float::atan2(2.0 * (w * x + y * z), w * w + z * z - (x * x + y * y)),
        pitch: Float::asin(sin_pitch),
        yaw: Float::atan2(2.0 * (w * z + x * y), w * w + x * x - (y * y + z * z)),
    })
}

/// Unit quaternion for the given roll, pitch and yaw.
pub fn euler_to_quaternion(rpy: &Rotation) -> Vector4<f64> {
    let (sr, cr) = Float::sin_cos(rpy.roll * 0.5);
    let (sp, cp) = Float::sin_cos(rpy.pitch * 0.5);
    let (sy, cy) = Float::sin_cos(rpy.yaw * 0.5);

    Vector4::new(
        cr * cp * cy + sr * sp * sy,
        sr * cp * cy - cr * sp * sy,
        cr * sp * cy + sr * cp * sy,
        cr * cp * sy - sr * sp * cy,
    )
}

/// `Rz(yaw) * Ry(pitch) * Rx(roll)`, multiplied out.
///
/// `Ry` is built from the negated angle with the sine terms mirrored, which lands
/// on the conventional right-handed pitch matrix.
pub fn rotation_matrix(rpy: &Rotation) -> Matrix3<f64> {
    let (sr, cr) = Float::sin_cos(rpy.roll);
    let (sp, cp) = Float::sin_cos(rpy.pitch);
    let (sy, cy) = Float::sin_cos(rpy.yaw);

    Matrix3::new(
        cy * cp,
        cy * sp * sr - sy * cr,
        cy * sp * cr + sy * sr,
        sy * cp,
        sy * sp * sr + cy * cr,
        sy * sp * cr - cy * sr,
        -sp,
        cp * sr,
        cp * cr,
    )
}

/// Applies the inverse of [`rotation_matrix`] to `v`.
///
/// The estimator feeds body angular rates through this before the Euler-rate
/// transform. That treats an angular velocity as a plain vector under rotation,
/// which is an approximation; downstream controllers are tuned against it.
pub fn body_to_world(rpy: &Rotation, v: &Vector3<f64>) -> Vector3<f64> {
    // Orthonormal, so the inverse is the transpose
    rotation_matrix(rpy).tr_mul(v)
}

/// Maps an angular rate onto roll/pitch/yaw rates with the kinematic coupling matrix.
pub fn angular_rate_to_euler_rate(
    rpy: &Rotation,
    omega: &Vector3<f64>,
) -> Result<Vector3<f64>, DomainError> {
    let (sp, cp) = Float::sin_cos(rpy.pitch);
    let (sy, cy) = Float::sin_cos(rpy.yaw);

    if Float::abs(cp) < EULER_RATE_EPSILON {
        return Err(DomainError::EulerRateSingular(cp));
    }

    let tp = sp / cp;

    #[rustfmt::skip]
    let phi = Matrix3::new(
        cy / cp,  sy / cp,  0.0,
        -sy,      cy,       0.0,
        cy * tp,  sy * tp,  1.0,
    );

    Ok(phi * omega)
}
