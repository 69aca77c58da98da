//! Fused state estimate for the flight controller.
//!
//! Inertial samples arrive on the caller's thread, mocap frames arrive from the
//! listener, and the control loop reads snapshots with [`Estimator::sample`]. Both
//! trackers live behind one critical-section mutex, so a snapshot always reflects
//! whole updates.

use core::{
    cell::{Cell, RefCell},
    convert::Infallible,
    fmt::Debug,
};

use embassy_futures::join::join;
use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use embassy_time::{Duration, Instant};
use log::{info, warn};
use nalgebra::{Vector3, Vector4};

use crate::{
    attitude::{AttitudeFilter, AttitudeTracker, ImuReading},
    math::{angular_rate_to_euler_rate, body_to_world, Rotation},
    mocap::{
        listener::{self, FrameQueue, MocapSource},
        MocapConfig, MocapFrame, MocapTracker,
    },
};

pub const STATE_ESTIMATE_CHANNEL: &str = "crazyflie_state_estimate";
pub const MOCAP_CHANNEL: &str = "crazyflie2_squ_ext";

/// `[x, y, z, roll, pitch, yaw, dx, dy, dz, wx, wy, wz]`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StateVector(pub [f64; 12]);

impl StateVector {
    fn from_parts(
        position: Vector3<f64>,
        rotation: Rotation,
        velocity: Vector3<f64>,
        angular_rate: Vector3<f64>,
    ) -> Self {
        let mut xhat = [0.0; 12];
        xhat[0..3].copy_from_slice(position.as_slice());
        xhat[3..6].copy_from_slice(rotation.to_vector().as_slice());
        xhat[6..9].copy_from_slice(velocity.as_slice());
        xhat[9..12].copy_from_slice(angular_rate.as_slice());
        Self(xhat)
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::from_column_slice(&self.0[0..3])
    }

    pub fn rpy(&self) -> Rotation {
        Rotation::new(self.0[3], self.0[4], self.0[5])
    }

    pub fn velocity(&self) -> Vector3<f64> {
        Vector3::from_column_slice(&self.0[6..9])
    }

    /// Body rates, or Euler rates when the estimator converts them
    pub fn angular_rate(&self) -> Vector3<f64> {
        Vector3::from_column_slice(&self.0[9..12])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// Output side of the estimator
pub trait StatePublisher {
    type Error: Debug;

    fn publish(&self, channel: &str, state: &StateVector) -> Result<(), Self::Error>;
}

/// Publisher for estimators that only serve [`Estimator::sample`] callers
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPublish;

impl StatePublisher for NoPublish {
    type Error = Infallible;

    fn publish(&self, _channel: &str, _state: &StateVector) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EstimatorConfig {
    /// Run the mocap listener when [`Estimator::run_mocap_listener`] is driven
    pub listen_to_mocap: bool,
    /// Hand every sampled state to the publisher
    pub publish: bool,
    /// Report roll/pitch/yaw rates instead of raw body rates
    pub use_euler_rate: bool,
    pub mocap: MocapConfig,
    pub mocap_channel: &'static str,
    pub state_channel: &'static str,
    /// Wait before reopening a failed mocap session
    pub restart_backoff: Duration,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            listen_to_mocap: false,
            publish: false,
            use_euler_rate: false,
            mocap: MocapConfig::default(),
            mocap_channel: MOCAP_CHANNEL,
            state_channel: STATE_ESTIMATE_CHANNEL,
            restart_backoff: Duration::from_millis(100),
        }
    }
}

impl EstimatorConfig {
    pub fn with_mocap_listener(mut self, listen: bool) -> Self {
        self.listen_to_mocap = listen;
        self
    }

    pub fn with_publish(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }

    pub fn with_euler_rate(mut self, use_euler_rate: bool) -> Self {
        self.use_euler_rate = use_euler_rate;
        self
    }

    pub fn with_mocap(mut self, mocap: MocapConfig) -> Self {
        self.mocap = mocap;
        self
    }

    pub fn with_mocap_channel(mut self, channel: &'static str) -> Self {
        self.mocap_channel = channel;
        self
    }

    pub fn with_state_channel(mut self, channel: &'static str) -> Self {
        self.state_channel = channel;
        self
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }
}

#[derive(Clone, Copy)]
struct FusionState {
    attitude: AttitudeTracker,
    mocap: MocapTracker,
}

pub struct Estimator<F, P = NoPublish> {
    config: EstimatorConfig,
    filter: F,
    publisher: P,
    state: Mutex<CriticalSectionRawMutex, RefCell<FusionState>>,
    frames: FrameQueue,
    listening: Mutex<CriticalSectionRawMutex, Cell<bool>>,
}

/// Releases the listener slot when a running listener is dropped
struct ListenerClaim<'a>(&'a Mutex<CriticalSectionRawMutex, Cell<bool>>);

impl Drop for ListenerClaim<'_> {
    fn drop(&mut self) {
        self.0.lock(|listening| listening.set(false));
    }
}

impl<F: AttitudeFilter> Estimator<F, NoPublish> {
    pub fn without_publisher(config: EstimatorConfig, filter: F) -> Self {
        Self::new(config, filter, NoPublish)
    }
}

impl<F: AttitudeFilter, P: StatePublisher> Estimator<F, P> {
    pub fn new(config: EstimatorConfig, filter: F, publisher: P) -> Self {
        Self::new_at(config, filter, publisher, Instant::now())
    }

    /// Like [`Estimator::new`], with the first inertial interval measured from `started`
    pub fn new_at(config: EstimatorConfig, filter: F, publisher: P, started: Instant) -> Self {
        Self {
            state: Mutex::new(RefCell::new(FusionState {
                attitude: AttitudeTracker::new(started),
                mocap: MocapTracker::new(config.mocap),
            })),
            frames: FrameQueue::new(),
            listening: Mutex::new(Cell::new(false)),
            config,
            filter,
            publisher,
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn add_imu_reading(&self, reading: &ImuReading) {
        self.add_imu_reading_at(reading, Instant::now());
    }

    /// Runs the filter outside the lock. Inertial samples must come from a
    /// single producer.
    pub fn add_imu_reading_at(&self, reading: &ImuReading, now: Instant) {
        let mut attitude = self.state.lock(|state| state.borrow().attitude);
        attitude.update(&self.filter, reading, now);
        self.state
            .lock(|state| state.borrow_mut().attitude = attitude);
    }

    pub fn add_mocap_frame(&self, frame: &MocapFrame) {
        self.state
            .lock(|state| state.borrow_mut().mocap.update(frame));
    }

    pub fn orientation(&self) -> Vector4<f64> {
        self.state
            .lock(|state| *state.borrow().attitude.orientation())
    }

    pub fn mocap_valid(&self) -> bool {
        self.state.lock(|state| state.borrow().mocap.is_valid())
    }

    /// Current state estimate, published first when publishing is enabled
    pub fn sample(&self) -> StateVector {
        let FusionState { attitude, mocap } = self.state.lock(|state| *state.borrow());

        let rotation = attitude.rotation();
        let gyro = attitude.angular_rate();

        let angular_rate = if self.config.use_euler_rate {
            angular_rate_to_euler_rate(&rotation, &body_to_world(&rotation, &gyro))
                .unwrap_or_else(|_| Vector3::zeros())
        } else {
            gyro
        };

        let xhat =
            StateVector::from_parts(mocap.position(), rotation, mocap.velocity(), angular_rate);

        if self.config.publish {
            if let Err(err) = self.publisher.publish(self.config.state_channel, &xhat) {
                warn!(
                    "Failed to publish state on '{}': {err:?}",
                    self.config.state_channel
                );
            }
        }

        xhat
    }

    /// Feeds mocap frames from sessions opened by `connect` into the estimator.
    ///
    /// Completes immediately when the listener is disabled in the config or
    /// already running, otherwise runs until dropped.
    pub async fn run_mocap_listener<S, C>(&self, connect: C)
    where
        S: MocapSource,
        C: FnMut(&str) -> S,
    {
        if !self.claim_listener() {
            return;
        }
        let _claim = ListenerClaim(&self.listening);
        self.listen(connect).await;
    }

    fn claim_listener(&self) -> bool {
        if !self.config.listen_to_mocap {
            info!("Mocap listener disabled");
            return false;
        }
        if self.listening.lock(|listening| listening.replace(true)) {
            warn!("Mocap listener already running");
            return false;
        }
        true
    }

    async fn listen<S, C>(&self, connect: C)
    where
        S: MocapSource,
        C: FnMut(&str) -> S,
    {
        join(
            listener::supervise(
                connect,
                self.config.mocap_channel,
                self.frames.sender(),
                self.config.restart_backoff,
            ),
            listener::drain(self.frames.receiver(), |frame| {
                self.add_mocap_frame(frame)
            }),
        )
        .await;
    }
}

#[cfg(feature = "std")]
impl<F, P> Estimator<F, P>
where
    F: AttitudeFilter + Send + Sync + 'static,
    P: StatePublisher + Send + Sync + 'static,
{
    /// Runs the mocap listener on its own thread for the life of the process.
    ///
    /// Returns `None` when the listener is disabled in the config or already running.
    pub fn spawn_mocap_listener<S, C>(
        self: &std::sync::Arc<Self>,
        connect: C,
    ) -> Option<std::thread::JoinHandle<()>>
    where
        S: MocapSource,
        C: FnMut(&str) -> S + Send + 'static,
    {
        if !self.claim_listener() {
            return None;
        }

        let estimator = std::sync::Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("mocap-listener".into())
            .spawn(move || futures::executor::block_on(estimator.listen(connect)));

        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("Failed to spawn mocap listener: {err}");
                self.listening.lock(|listening| listening.set(false));
                None
            }
        }
    }
}
