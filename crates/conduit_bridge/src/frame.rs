//! Frame Ticker
//!
//! The shared frame-update timer of a bridge generation.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// One frame update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTick {
    /// Frames since the ticker started
    pub index: u64,
    /// Time since the ticker started
    pub elapsed: Duration,
}

/// Calls a function at a fixed frame rate until stopped.
pub struct FrameTicker {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FrameTicker {
    /// Start ticking at `frame_rate` frames per second. Must be called from
    /// within a tokio runtime. A rate of zero yields `None`.
    pub fn start<F>(frame_rate: u32, on_frame: F) -> Option<Self>
    where
        F: Fn(FrameTick) + Send + 'static,
    {
        if frame_rate == 0 {
            return None;
        }
        let period = Duration::from_secs_f64(1.0 / f64::from(frame_rate));

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut index = 0u64;
            loop {
                interval.tick().await;
                on_frame(FrameTick {
                    index,
                    elapsed: started.elapsed(),
                });
                index += 1;
            }
        });

        tracing::debug!(frame_rate, "Frame ticker started");
        Some(Self {
            task: Mutex::new(Some(task)),
        })
    }

    /// Stop ticking.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::debug!("Frame ticker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for FrameTicker {
    fn drop(&mut self) {
        self.stop();
    }
}
