//! Timers owned by a recording session
//!
//! The max-duration deadline, the periodic upload interval and the in-flight
//! periodic flush all live here so that leaving the Active state can cancel
//! every one of them with a single call.

use std::future::pending;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::warn;

use crate::upload::FlushReport;

/// A timer that fired for the session
#[derive(Debug)]
pub enum SessionTimer {
    /// The maximum recording duration elapsed
    MaxDuration,
    /// Time for a periodic flush
    Upload,
    /// A periodic flush finished
    FlushFinished(FlushReport),
}

#[derive(Debug, Default)]
pub struct Scheduler {
    deadline: Option<Instant>,
    upload: Option<Interval>,
    in_flight: Option<JoinHandle<FlushReport>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm_deadline(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    /// Periodic upload ticks, the first one a full period from now
    pub fn arm_upload(&mut self, every: Duration) {
        let every = every.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.upload = Some(interval);
    }

    pub fn cancel_upload(&mut self) {
        self.upload = None;
    }

    pub fn track_flush(&mut self, handle: JoinHandle<FlushReport>) {
        if let Some(previous) = self.in_flight.replace(handle) {
            previous.abort();
        }
    }

    pub fn flush_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn has_upload(&self) -> bool {
        self.upload.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.deadline.is_none() && self.upload.is_none() && self.in_flight.is_none()
    }

    /// Disarm everything; an aborted flush leaves its events buffered
    pub fn cancel_all(&mut self) {
        self.deadline = None;
        self.upload = None;
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }

    /// Wait for the next timer. Never resolves while nothing is armed.
    pub async fn next(&mut self) -> SessionTimer {
        tokio::select! {
            _ = sleep_until_opt(self.deadline) => {
                self.deadline = None;
                SessionTimer::MaxDuration
            }
            _ = tick_opt(self.upload.as_mut()) => SessionTimer::Upload,
            result = join_opt(self.in_flight.as_mut()) => {
                self.in_flight = None;
                match result {
                    Ok(report) => SessionTimer::FlushFinished(report),
                    Err(e) => {
                        warn!("Periodic flush task ended abnormally: {}", e);
                        SessionTimer::FlushFinished(FlushReport::default())
                    }
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn tick_opt(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn join_opt(handle: Option<&mut JoinHandle<FlushReport>>) -> Result<FlushReport, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => pending().await,
    }
}
