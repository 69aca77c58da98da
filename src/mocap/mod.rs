//! Motion-capture position tracking.
//!
//! Frames carry an absolute position and a millisecond timestamp. Velocity is a
//! finite difference between consecutive valid frames, exponentially smoothed.

pub mod listener;

use log::{debug, info};
use nalgebra::Vector3;

/// A validity component below this marks a frame where the tracker lost the vehicle.
pub const LOST_TRACK_SENTINEL: f64 = -999.0;

/// Decoded motion-capture frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MocapFrame {
    /// Quaternion-shaped status field, only the first component is inspected
    pub validity: [f64; 4],
    pub position: Vector3<f64>,
    pub timestamp_ms: i64,
}

impl MocapFrame {
    pub fn tracked(position: Vector3<f64>, timestamp_ms: i64) -> Self {
        Self {
            validity: [1.0, 0.0, 0.0, 0.0],
            position,
            timestamp_ms,
        }
    }

    pub fn lost(timestamp_ms: i64) -> Self {
        Self {
            validity: [-1000.0, 0.0, 0.0, 0.0],
            position: Vector3::zeros(),
            timestamp_ms,
        }
    }

    pub fn is_tracking_lost(&self) -> bool {
        self.validity[0] < LOST_TRACK_SENTINEL
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MocapConfig {
    /// Weight of the newest differenced velocity
    pub alpha: f64,
    pub nominal_rate_hz: f64,
    /// Measured intervals longer than `late_factor` nominal periods replace the nominal one
    pub late_factor: f64,
}

impl Default for MocapConfig {
    fn default() -> Self {
        Self {
            alpha: 0.8,
            nominal_rate_hz: 120.0,
            late_factor: 1.1,
        }
    }
}

impl MocapConfig {
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_nominal_rate_hz(mut self, rate_hz: f64) -> Self {
        self.nominal_rate_hz = rate_hz;
        self
    }

    pub fn with_late_factor(mut self, late_factor: f64) -> Self {
        self.late_factor = late_factor;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MocapTracker {
    config: MocapConfig,
    valid: bool,
    position: Vector3<f64>,
    velocity: Vector3<f64>,
    last_update_ms: i64,
}

impl MocapTracker {
    pub fn new(config: MocapConfig) -> Self {
        Self {
            config,
            valid: false,
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            last_update_ms: 0,
        }
    }

    pub fn update(&mut self, frame: &MocapFrame) {
        if frame.is_tracking_lost() {
            if self.valid {
                debug!("Mocap tracking lost at {}ms", frame.timestamp_ms);
            }
            // Position is kept as the last known fix
            self.valid = false;
            self.velocity = Vector3::zeros();
            return;
        }

        let raw_velocity = if self.valid {
            let mut dt = 1.0 / self.config.nominal_rate_hz;
            let dt_measured = (frame.timestamp_ms - self.last_update_ms) as f64 / 1000.0;
            // Only late frames stretch the interval, early ones keep the nominal period
            if dt_measured > self.config.late_factor * dt {
                dt = dt_measured;
            }
            (frame.position - self.position) / dt
        } else {
            info!("Mocap tracking acquired at {}ms", frame.timestamp_ms);
            Vector3::zeros()
        };

        let alpha = self.config.alpha;
        self.velocity = raw_velocity * alpha + self.velocity * (1.0 - alpha);
        self.position = frame.position;
        self.last_update_ms = frame.timestamp_ms;
        self.valid = true;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Last known position, stale while tracking is lost
    pub fn position(&self) -> Vector3<f64> {
        self.position
    }

    pub fn velocity(&self) -> Vector3<f64> {
        self.velocity
    }

    pub fn config(&self) -> &MocapConfig {
        &self.config
    }
}

impl Default for MocapTracker {
    fn default() -> Self {
        Self::new(MocapConfig::default())
    }
}
