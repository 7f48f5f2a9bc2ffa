// SPDX-License-Identifier: GPL-3.0-only
//! Producer loop threads for camera providers
//!
//! Providers run their frame source (a V4L2 mmap stream or the synthetic
//! pattern generator) on a loop thread of their own. The loop hands frames
//! to a [`FrameProducer`](super::frame_reader::FrameProducer) and never
//! touches the session controller directly.

use crate::errors::ThreadError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Action returned by the loop callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Run another iteration
    Continue,
    /// Stop the loop gracefully
    Stop,
}

/// Controller for a producer loop running on its own thread
///
/// Dropping the controller stops the loop and joins the thread.
pub struct ProducerLoop {
    thread_handle: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    name: String,
}

impl ProducerLoop {
    /// Start a loop whose state is built on the loop thread
    ///
    /// `init_fn` runs once on the new thread. If it fails the thread exits
    /// before the first iteration and `on_init_error` receives the message.
    pub fn start_with_init<S, I, F, E>(
        name: &str,
        init_fn: I,
        mut loop_fn: F,
        on_init_error: E,
    ) -> Result<Self, ThreadError>
    where
        S: 'static,
        I: FnOnce() -> Result<S, String> + Send + 'static,
        F: FnMut(&mut S, &AtomicBool) -> LoopAction + Send + 'static,
        E: FnOnce(String) + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&stop_signal);
        let loop_name = name.to_string();

        info!(name = %name, "Starting producer loop");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut state = match init_fn() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(name = %loop_name, error = %e, "Producer init failed");
                        on_init_error(e);
                        return;
                    }
                };

                while !stop.load(Ordering::SeqCst) {
                    if loop_fn(&mut state, &stop) == LoopAction::Stop {
                        debug!(name = %loop_name, "Producer loop finished");
                        break;
                    }
                }

                info!(name = %loop_name, "Producer loop thread exiting");
            })
            .map_err(|e| ThreadError::SpawnFailed(e.to_string()))?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            stop_signal,
            name: name.to_string(),
        })
    }

    /// Start a loop without per-thread state
    pub fn start<F>(name: &str, mut loop_fn: F) -> Result<Self, ThreadError>
    where
        F: FnMut(&AtomicBool) -> LoopAction + Send + 'static,
    {
        Self::start_with_init(
            name,
            || Ok(()),
            move |_: &mut (), stop| loop_fn(stop),
            |_| {},
        )
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop to stop without waiting
    pub fn request_stop(&self) {
        debug!(name = %self.name, "Requesting producer loop stop");
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Stop the loop and wait for the thread to finish
    pub fn stop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.thread_handle.take() {
            if handle.thread().id() == thread::current().id() {
                // Stopped from inside its own iteration; the loop exits on its own
                return;
            }
            if let Err(e) = handle.join() {
                warn!(name = %self.name, "Producer loop thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for ProducerLoop {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "ProducerLoop dropped, stopping loop");
            self.stop();
        }
    }
}

/// Keeps a loop close to a target frame interval
///
/// Sleeps in short slices so a stop request is noticed promptly.
#[derive(Debug)]
pub struct FramePacer {
    interval: Duration,
    next_deadline: Instant,
}

impl FramePacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_deadline: Instant::now(),
        }
    }

    /// Wait until the next frame is due. Returns false if `stop` was raised.
    pub fn wait(&mut self, stop: &AtomicBool) -> bool {
        const SLICE: Duration = Duration::from_millis(5);

        loop {
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= self.next_deadline {
                break;
            }
            thread::sleep((self.next_deadline - now).min(SLICE));
        }

        self.next_deadline += self.interval;
        // Fell far behind: restart the schedule instead of bursting
        let now = Instant::now();
        if self.next_deadline + self.interval < now {
            self.next_deadline = now + self.interval;
        }
        true
    }
}
