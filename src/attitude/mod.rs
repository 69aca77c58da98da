pub mod madgwick;

use embassy_time::Instant;
use log::trace;
use nalgebra::{Vector3, Vector4};

use crate::math::{quaternion_to_euler, Rotation};

/// One inertial sample: angular rate in rad/s and linear acceleration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuReading {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
    /// Sample interval reported by the driver. Not used for timing, the
    /// tracker measures elapsed time itself.
    pub dt_hint: f64,
}

impl ImuReading {
    pub fn new(gyro: Vector3<f64>, accel: Vector3<f64>) -> Self {
        Self {
            gyro,
            accel,
            dt_hint: 0.0,
        }
    }
}

impl From<(f64, f64, f64, f64, f64, f64, f64)> for ImuReading {
    fn from((gx, gy, gz, ax, ay, az, dt_hint): (f64, f64, f64, f64, f64, f64, f64)) -> Self {
        Self {
            gyro: Vector3::new(gx, gy, gz),
            accel: Vector3::new(ax, ay, az),
            dt_hint,
        }
    }
}

/// Orientation filter step.
///
/// Given gyro (rad/s), accelerometer, elapsed seconds, the current `[w, x, y, z]`
/// orientation and the bias-integral triple, returns the next orientation and
/// bias-integral triple. Implementations hold no state of their own between calls.
pub trait AttitudeFilter {
    fn update(
        &self,
        gyro: Vector3<f64>,
        accel: Vector3<f64>,
        dt: f64,
        orientation: Vector4<f64>,
        bias_integral: Vector3<f64>,
    ) -> (Vector4<f64>, Vector3<f64>);
}

impl<F> AttitudeFilter for F
where
    F: Fn(Vector3<f64>, Vector3<f64>, f64, Vector4<f64>, Vector3<f64>) -> (Vector4<f64>, Vector3<f64>),
{
    fn update(
        &self,
        gyro: Vector3<f64>,
        accel: Vector3<f64>,
        dt: f64,
        orientation: Vector4<f64>,
        bias_integral: Vector3<f64>,
    ) -> (Vector4<f64>, Vector3<f64>) {
        self(gyro, accel, dt, orientation, bias_integral)
    }
}

/// Orientation state fed by inertial samples, with cached Euler angles and rates.
#[derive(Debug, Clone, Copy)]
pub struct AttitudeTracker {
    orientation: Vector4<f64>, // Sensor frame relative to world, [w, x, y, z]
    bias_integral: Vector3<f64>,
    rotation: Rotation,
    angular_rate: Vector3<f64>,
    last_update: Instant,
}

impl AttitudeTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            orientation: Vector4::new(1.0, 0.0, 0.0, 0.0),
            bias_integral: Vector3::zeros(),
            rotation: Rotation::default(),
            angular_rate: Vector3::zeros(),
            last_update: now,
        }
    }

    /// Runs one filter step for a sample taken at `now`.
    ///
    /// The cached Euler angles keep their previous value when the new orientation
    /// sits on the pitch singularity. The cached rate is always replaced.
    pub fn update<F: AttitudeFilter + ?Sized>(
        &mut self,
        filter: &F,
        reading: &ImuReading,
        now: Instant,
    ) {
        let delta_t = now.saturating_duration_since(self.last_update).as_micros() as f64 / 1e6;
        self.last_update = now;

        let (orientation, bias_integral) = filter.update(
            reading.gyro,
            reading.accel,
            delta_t,
            self.orientation,
            self.bias_integral,
        );
        self.orientation = orientation;
        self.bias_integral = bias_integral;

        match quaternion_to_euler(&self.orientation) {
            Ok(rotation) => self.rotation = rotation,
            Err(err) => trace!("Keeping previous attitude: {err}"),
        }

        self.angular_rate = reading.gyro;
    }

    pub fn orientation(&self) -> &Vector4<f64> {
        &self.orientation
    }

    pub fn bias_integral(&self) -> &Vector3<f64> {
        &self.bias_integral
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn angular_rate(&self) -> Vector3<f64> {
        self.angular_rate
    }
}

#[cfg(test)]
mod tests {
    use super::madgwick::MadgwickFilter;
    use super::*;
    use crate::math::euler_to_quaternion;
    use core::cell::Cell;
    use core::f64::consts::FRAC_1_SQRT_2;

    type V = Vector3<f64>;
    type Q = Vector4<f64>;

    fn level() -> ImuReading {
        ImuReading::new(Vector3::zeros(), Vector3::new(0.0, 0.0, 1.0))
    }

    #[test]
    fn starts_at_identity() {
        let tracker = AttitudeTracker::new(Instant::from_millis(0));
        assert_eq!(*tracker.orientation(), Vector4::new(1.0, 0.0, 0.0, 0.0));
        assert_eq!(tracker.rotation(), Rotation::default());
        assert_eq!(tracker.angular_rate(), Vector3::zeros());
    }

    #[test]
    fn reading_from_tuple_ignores_dt_hint_for_timing() {
        let reading = ImuReading::from((0.1, 0.2, 0.3, 0.0, 0.0, 1.0, 0.5));
        assert_eq!(reading.gyro, Vector3::new(0.1, 0.2, 0.3));
        assert_eq!(reading.accel, Vector3::new(0.0, 0.0, 1.0));

        let seen_dt = Cell::new(-1.0);
        let filter = |_g: V, _a: V, dt: f64, q: Q, b: V| {
            seen_dt.set(dt);
            (q, b)
        };
        let mut tracker = AttitudeTracker::new(Instant::from_millis(100));
        tracker.update(&filter, &reading, Instant::from_millis(110));
        assert!((seen_dt.get() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn threads_full_filter_state() {
        let filter = |_g: V, _a: V, _dt: f64, q: Q, b: V| {
            (q, b + Vector3::new(1.0, 2.0, 3.0))
        };
        let mut tracker = AttitudeTracker::new(Instant::from_millis(0));
        tracker.update(&filter, &level(), Instant::from_millis(5));
        tracker.update(&filter, &level(), Instant::from_millis(10));
        assert_eq!(*tracker.bias_integral(), Vector3::new(2.0, 4.0, 6.0));
    }

    #[test]
    fn caches_euler_and_rate() {
        let target = Rotation::new(0.2, -0.1, 0.7);
        let filter = move |_g: V, _a: V, _dt: f64, _q: Q, b: V| (euler_to_quaternion(&target), b);
        let mut tracker = AttitudeTracker::new(Instant::from_millis(0));
        let reading = ImuReading::new(Vector3::new(0.5, -0.5, 0.25), Vector3::z());
        tracker.update(&filter, &reading, Instant::from_millis(1));

        let rotation = tracker.rotation();
        assert!((rotation.roll - 0.2).abs() < 1e-9);
        assert!((rotation.pitch + 0.1).abs() < 1e-9);
        assert!((rotation.yaw - 0.7).abs() < 1e-9);
        assert_eq!(tracker.angular_rate(), Vector3::new(0.5, -0.5, 0.25));
    }

    #[test]
    fn singular_orientation_keeps_cached_euler() {
        let target = Rotation::new(0.3, 0.4, -0.5);
        let step = Cell::new(0);
        let filter = |_g: V, _a: V, _dt: f64, _q: Q, b: V| {
            step.set(step.get() + 1);
            let q = if step.get() == 1 {
                euler_to_quaternion(&target)
            } else {
                Vector4::new(FRAC_1_SQRT_2, 0.0, FRAC_1_SQRT_2, 0.0) * 0.9
            };
            (q, b)
        };

        let mut tracker = AttitudeTracker::new(Instant::from_millis(0));
        tracker.update(&filter, &level(), Instant::from_millis(1));
        let before = tracker.rotation();

        let reading = ImuReading::new(Vector3::new(1.0, 2.0, 3.0), Vector3::z());
        tracker.update(&filter, &reading, Instant::from_millis(2));

        assert_eq!(tracker.rotation(), before);
        // Orientation and rate still move on
        assert!((tracker.orientation()[0] - FRAC_1_SQRT_2 * 0.9).abs() < 1e-12);
        assert_eq!(tracker.angular_rate(), Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn level_samples_converge_to_identity() {
        let filter = MadgwickFilter::new(0.1);
        let mut tracker = AttitudeTracker::new(Instant::from_millis(0));

        // Start rolled over and let gravity pull it back
        let tilted = euler_to_quaternion(&Rotation::new(0.3, 0.0, 0.0));
        let seed = move |_g: V, _a: V, _dt: f64, _q: Q, b: V| (tilted, b);
        tracker.update(&seed, &level(), Instant::from_millis(0));
        assert!(tracker.orientation()[1] > 0.1);

        for step in 1..=2000 {
            tracker.update(&filter, &level(), Instant::from_millis(step * 10));
        }

        let q = tracker.orientation();
        assert!((q[0] - 1.0).abs() < 1e-3, "w = {}", q[0]);
        assert!(q[1].abs() < 5e-3, "x = {}", q[1]);
        assert!(q[2].abs() < 5e-3, "y = {}", q[2]);
        assert!(q[3].abs() < 5e-3, "z = {}", q[3]);
        assert!(tracker.rotation().roll.abs() < 1e-2);
    }
}
