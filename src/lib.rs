//! State estimation for a mocap-tracked quadrotor.
//!
//! Fuses high-rate inertial samples with motion-capture positions into the
//! 12-element state vector the flight controller consumes:
//! `[x, y, z, roll, pitch, yaw, dx, dy, dz, wx, wy, wz]`.
//!
//! - [`attitude`]: orientation from an injectable [`attitude::AttitudeFilter`]
//! - [`mocap`]: position, smoothed velocity and the tracking validity state
//! - [`estimator`]: snapshot assembly, optional publishing and the mocap listener
//! - [`math`]: quaternion, Euler and rotation conversions
//!
//! # Features
//! - `std` (default): host critical sections and float math, plus a threaded mocap listener
//! - without `std`: bare metal, math through `libm`; a critical-section implementation
//!   and an `embassy-time` driver must be linked in by the firmware

#![cfg_attr(not(feature = "std"), no_std)]

pub mod attitude;
pub mod estimator;
pub mod math;
pub mod mocap;

pub use attitude::{madgwick::MadgwickFilter, AttitudeFilter, AttitudeTracker, ImuReading};
pub use estimator::{Estimator, EstimatorConfig, NoPublish, StatePublisher, StateVector};
pub use math::{DomainError, Rotation};
pub use mocap::{listener::MocapSource, MocapConfig, MocapFrame, MocapTracker};
