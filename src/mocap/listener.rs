//! Background mocap listener.
//!
//! A transport session is opened through a connect closure and its frames are
//! pushed into a bounded queue. A failing session is dropped and reopened after
//! a backoff; the tracker side only ever sees frames from the queue. Dropping
//! the listener future stops it.

use core::fmt::Debug;

use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    channel::{Channel, Receiver, Sender},
};
use embassy_time::{Duration, Timer};
use log::{debug, warn};

use super::MocapFrame;

pub const MOCAP_QUEUE_DEPTH: usize = 8;

pub type FrameQueue = Channel<CriticalSectionRawMutex, MocapFrame, MOCAP_QUEUE_DEPTH>;
pub type FrameSender<'a> = Sender<'a, CriticalSectionRawMutex, MocapFrame, MOCAP_QUEUE_DEPTH>;
pub type FrameReceiver<'a> = Receiver<'a, CriticalSectionRawMutex, MocapFrame, MOCAP_QUEUE_DEPTH>;

/// Subscription delivering decoded mocap frames
#[allow(async_fn_in_trait)]
pub trait MocapSource {
    type Error: Debug;

    /// Waits for the next frame. An error ends the session.
    async fn receive(&mut self) -> Result<MocapFrame, Self::Error>;
}

/// Keeps a source connected to `channel` and forwards its frames into `frames`.
///
/// Runs until dropped.
pub async fn supervise<S, C>(
    mut connect: C,
    channel: &str,
    frames: FrameSender<'_>,
    restart_backoff: Duration,
) where
    S: MocapSource,
    C: FnMut(&str) -> S,
{
    let mut session: u32 = 0;
    loop {
        session = session.wrapping_add(1);
        debug!("Opening mocap session {session} on '{channel}'");

        let mut source = connect(channel);
        let err = forward(&mut source, frames).await;
        drop(source);

        warn!("Mocap session {session} on '{channel}' failed: {err:?}");

        if restart_backoff.as_ticks() > 0 {
            Timer::after(restart_backoff).await;
        }
    }
}

async fn forward<S: MocapSource>(source: &mut S, frames: FrameSender<'_>) -> S::Error {
    loop {
        match source.receive().await {
            Ok(frame) => frames.send(frame).await,
            Err(err) => return err,
        }
    }
}

/// Hands every queued frame to `apply`, in arrival order. Runs until dropped.
pub async fn drain<F: FnMut(&MocapFrame)>(frames: FrameReceiver<'_>, mut apply: F) {
    loop {
        let frame = frames.receive().await;
        apply(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};
    use embassy_futures::{block_on, join::join, select::select, yield_now};
    use embassy_time::MockDriver;
    use nalgebra::Vector3;
    use std::collections::VecDeque;

    #[derive(Debug, PartialEq)]
    struct Disconnected;

    #[derive(Default)]
    struct Script {
        steps: VecDeque<Result<MocapFrame, Disconnected>>,
    }

    impl MocapSource for Script {
        type Error = Disconnected;

        async fn receive(&mut self) -> Result<MocapFrame, Disconnected> {
            match self.steps.pop_front() {
                Some(step) => step,
                None => core::future::pending().await,
            }
        }
    }

    fn frame(x: f64, timestamp_ms: i64) -> MocapFrame {
        MocapFrame::tracked(Vector3::new(x, 0.0, 0.0), timestamp_ms)
    }

    #[test]
    fn restarts_failed_session() {
        let queue = FrameQueue::new();
        let mut sessions = vec![
            Script {
                steps: VecDeque::from([Ok(frame(3.0, 16))]),
            },
            Script {
                steps: VecDeque::from([Ok(frame(1.0, 0)), Ok(frame(2.0, 8)), Err(Disconnected)]),
            },
        ];
        let connects = Cell::new(0);
        let received = RefCell::new(Vec::new());

        let connect = |channel: &str| {
            assert_eq!(channel, "vehicle");
            connects.set(connects.get() + 1);
            sessions.pop().unwrap_or_default()
        };

        block_on(select(
            join(
                supervise(connect, "vehicle", queue.sender(), Duration::from_ticks(0)),
                drain(queue.receiver(), |frame| received.borrow_mut().push(*frame)),
            ),
            async {
                while received.borrow().len() < 3 {
                    yield_now().await;
                }
            },
        ));

        assert_eq!(connects.get(), 2);
        let xs: Vec<f64> = received.borrow().iter().map(|f| f.position.x).collect();
        assert_eq!(xs, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn waits_out_backoff_before_reconnecting() {
        let queue = FrameQueue::new();
        let mut sessions = vec![
            Script::default(),
            Script {
                steps: VecDeque::from([Ok(frame(1.0, 0)), Err(Disconnected)]),
            },
        ];
        let connects = Cell::new(0);
        let received = RefCell::new(Vec::new());

        let connect = |_: &str| {
            connects.set(connects.get() + 1);
            sessions.pop().unwrap_or_default()
        };

        block_on(select(
            join(
                supervise(connect, "vehicle", queue.sender(), Duration::from_millis(100)),
                drain(queue.receiver(), |frame| received.borrow_mut().push(*frame)),
            ),
            async {
                while received.borrow().is_empty() {
                    yield_now().await;
                }
                for _ in 0..100 {
                    yield_now().await;
                }
                assert_eq!(connects.get(), 1);

                MockDriver::get().advance(Duration::from_millis(100));
                while connects.get() < 2 {
                    yield_now().await;
                }
            },
        ));

        assert_eq!(connects.get(), 2);
    }

    #[test]
    fn queue_preserves_order_under_backpressure() {
        let queue = FrameQueue::new();
        let steps = (0..3 * MOCAP_QUEUE_DEPTH as i64)
            .map(|i| Ok(frame(i as f64, i * 8)))
            .collect();
        let mut once = Some(Script { steps });
        let received = RefCell::new(Vec::new());

        block_on(select(
            join(
                supervise(
                    |_: &str| once.take().unwrap_or_default(),
                    "vehicle",
                    queue.sender(),
                    Duration::from_ticks(0),
                ),
                drain(queue.receiver(), |frame| received.borrow_mut().push(frame.timestamp_ms)),
            ),
            async {
                while received.borrow().len() < 3 * MOCAP_QUEUE_DEPTH {
                    yield_now().await;
                }
            },
        ));

        let expected: Vec<i64> = (0..3 * MOCAP_QUEUE_DEPTH as i64).map(|i| i * 8).collect();
        assert_eq!(*received.borrow(), expected);
    }
}
