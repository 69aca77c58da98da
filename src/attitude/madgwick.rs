use nalgebra::{Vector3, Vector4};

use super::AttitudeFilter;

/// Gradient-descent orientation filter using gyro and accelerometer only.
///
/// Yaw is unobservable without a magnetometer and drifts with the gyro. The
/// bias-integral triple is passed through untouched.
#[derive(Debug, Clone, Copy)]
pub struct MadgwickFilter {
    beta: f64, // Algorithm gain
}

impl MadgwickFilter {
    pub const fn new(beta: f64) -> Self {
        Self { beta }
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }
}

impl Default for MadgwickFilter {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl AttitudeFilter for MadgwickFilter {
    fn update(
        &self,
        gyro: Vector3<f64>,
        accel: Vector3<f64>,
        dt: f64,
        orientation: Vector4<f64>,
        bias_integral: Vector3<f64>,
    ) -> (Vector4<f64>, Vector3<f64>) {
        let [gx, gy, gz]: [f64; 3] = gyro.into();
        let [q1, q2, q3, q4]: [f64; 4] = orientation.into();

        // Rate of change of quaternion from gyroscope
        let mut q_dot = Vector4::new(
            0.5 * (-q2 * gx - q3 * gy - q4 * gz),
            0.5 * (q1 * gx + q3 * gz - q4 * gy),
            0.5 * (q1 * gy - q2 * gz + q4 * gx),
            0.5 * (q1 * gz + q2 * gy - q3 * gx),
        );

        // Free fall or a dead accelerometer gives no gravity reference
        if let Some(accel) = accel.try_normalize(0.0) {
            let [ax, ay, az]: [f64; 3] = accel.into();

            // Auxiliary variables to avoid repeated arithmetic
            let two_q1 = 2.0 * q1;
            let two_q2 = 2.0 * q2;
            let two_q3 = 2.0 * q3;
            let two_q4 = 2.0 * q4;
            let four_q1 = 4.0 * q1;
            let four_q2 = 4.0 * q2;
            let four_q3 = 4.0 * q3;
            let eight_q2 = 8.0 * q2;
            let eight_q3 = 8.0 * q3;
            let q1q1 = q1 * q1;
            let q2q2 = q2 * q2;
            let q3q3 = q3 * q3;
            let q4q4 = q4 * q4;

            // Gradient descent algorithm corrective step
            let s = Vector4::new(
                four_q1 * q3q3 + two_q3 * ax + four_q1 * q2q2 - two_q2 * ay,
                four_q2 * q4q4 - two_q4 * ax + 4.0 * q1q1 * q2 - two_q1 * ay - four_q2
                    + eight_q2 * q2q2
                    + eight_q2 * q3q3
                    + four_q2 * az,
                4.0 * q1q1 * q3 + two_q1 * ax + four_q3 * q4q4 - two_q4 * ay - four_q3
                    + eight_q3 * q2q2
                    + eight_q3 * q3q3
                    + four_q3 * az,
                4.0 * q2q2 * q4 - two_q2 * ax + 4.0 * q3q3 * q4 - two_q3 * ay,
            );

            // Zero at the optimum
            if let Some(s) = s.try_normalize(0.0) {
                q_dot -= s * self.beta;
            }
        }

        // Integrate to yield quaternion
        let q = orientation + q_dot * dt;

        (q.try_normalize(0.0).unwrap_or(orientation), bias_integral)
    }
}
