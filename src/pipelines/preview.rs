// SPDX-License-Identifier: GPL-3.0-only

//! Preview pipeline facade
//!
//! [`PreviewPipeline`] is what a host drives: `start` with the display size,
//! `on_resize` when the surface changes, `deliver_frame` to install the frame
//! consumer and `stop` to tear everything down. Device enumeration and size
//! negotiation run synchronously on the caller's thread; everything touching
//! the device runs on the capture worker.

use crate::backends::camera::{
    CameraDevice, CameraProvider, CaptureThread, ControllerMessage, DeviceSessionController,
    FrameCallback, FrameGate, PreviewSize, PreviewSizeTracker, SessionState, SessionStatus, SharedConsumer,
    SharedStatus, select_device,
};
use crate::config::Config;
use crate::constants::capture::WORKER_THREAD_NAME;
use crate::constants::timing::IDLE_POLL_INTERVAL;
use crate::errors::{AppError, AppResult, CameraError, ThreadError};
use crate::media::FrameBuffer;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One-shot messages for the host UI
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// `start` was called before camera permission was granted
    PermissionDenied,
    /// Calibration was requested but the pattern was not in the frame
    PatternNotFound,
    /// A new calibration was computed for the device
    CalibrationSaved { device_id: String },
    /// Calibration solving or persistence failed
    CalibrationFailed(String),
}

/// Facade over device selection, size negotiation and the capture worker
pub struct PreviewPipeline {
    provider: Arc<dyn CameraProvider>,
    config: Config,
    permission_granted: bool,

    worker: Option<CaptureThread<ControllerMessage>>,
    device: Option<CameraDevice>,
    tracker: PreviewSizeTracker,
    display: (u32, u32),
    scale: f32,

    status: SharedStatus,
    consumer: SharedConsumer,
    gate: FrameGate,
    notice_tx: Sender<Notice>,
    notice_rx: Receiver<Notice>,
}

impl PreviewPipeline {
    pub fn new(provider: Arc<dyn CameraProvider>, config: Config) -> Self {
        let (notice_tx, notice_rx) = mpsc::channel();
        Self {
            provider,
            config,
            permission_granted: true,
            worker: None,
            device: None,
            tracker: PreviewSizeTracker::new(),
            display: (0, 0),
            scale: 0.0,
            status: Arc::new(Mutex::new(SessionStatus::default())),
            consumer: Arc::new(Mutex::new(None)),
            gate: FrameGate::new(),
            notice_tx,
            notice_rx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Camera permission as reported by the host; `start` is refused without it
    pub fn set_permission_granted(&mut self, granted: bool) {
        debug!(granted, "Camera permission changed");
        self.permission_granted = granted;
    }

    /// True while a worker exists and the session has not fallen back to Closed
    pub fn is_running(&self) -> bool {
        self.worker.is_some() && self.state() != SessionState::Closed
    }

    /// Select a device, negotiate the preview size and open the camera
    ///
    /// Returns false when no session could be started; the reason is in
    /// [`last_error`](Self::last_error). Calling it on a running pipeline
    /// behaves like [`on_resize`](Self::on_resize) and returns true; if the
    /// last session configuration failed it is retried even at the same size.
    pub fn start(&mut self, width: u32, height: u32) -> bool {
        if !self.permission_granted {
            warn!("Camera permission not granted");
            self.record_error(CameraError::DeviceAccessDenied(
                "camera permission not granted".into(),
            ));
            self.notify(Notice::PermissionDenied);
            return false;
        }

        if self.is_running() {
            debug!(width, height, "Already running, treating start as resize");
            if !self.on_resize(width, height) && self.status().configure_failed {
                self.retry_configure();
            }
            return true;
        }

        // A worker whose session closed on its own (disconnect, open failure)
        // is replaced
        if self.worker.is_some()
            && let Err(e) = self.stop()
        {
            warn!(error = %e, "Could not stop the previous worker");
            return false;
        }

        match self.launch(width, height) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to start preview");
                self.tracker.reset();
                self.device = None;
                self.scale = 0.0;
                self.set_closed();
                self.record_error(e);
                false
            }
        }
    }

    fn retry_configure(&self) {
        let (Some(worker), Some(size)) = (self.worker.as_ref(), self.tracker.current()) else {
            return;
        };
        info!(size = %size, "Retrying failed session configuration");
        worker.post(ControllerMessage::Configure { size });
    }

    fn launch(&mut self, width: u32, height: u32) -> AppResult<()> {
        let devices = self.provider.enumerate()?;
        let device = select_device(&devices, &self.config.device)?.clone();
        let size = self
            .tracker
            .update(&device.output_sizes, width, height)?
            .size();

        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            *status = SessionStatus {
                state: SessionState::Opening,
                device_id: Some(device.id.clone()),
                preview_size: Some(size),
                ..SessionStatus::default()
            };
        }

        let provider = Arc::clone(&self.provider);
        let settings = self.config.controller_settings();
        let status = Arc::clone(&self.status);
        let consumer = Arc::clone(&self.consumer);
        let gate = self.gate.clone();
        gate.open();
        let worker = CaptureThread::start(WORKER_THREAD_NAME, move |handle| {
            DeviceSessionController::new(provider, handle, settings, status, consumer, gate)
        })?;

        info!(
            device = %device.id,
            size = %size,
            provider = self.provider.name(),
            "Starting preview"
        );
        worker.post(ControllerMessage::Open {
            device: device.clone(),
            size: Some(size),
        });

        self.worker = Some(worker);
        self.device = Some(device);
        self.display = (width, height);
        self.update_scale(size);
        Ok(())
    }

    /// Stop the worker and release the camera
    ///
    /// No consumer callback starts once this is called; one already running
    /// finishes first. Blocks until the worker has closed everything. Safe
    /// before `start` and when called repeatedly. Calling it from the frame
    /// consumer fails with [`ThreadError::SelfJoin`] and leaves the pipeline
    /// running.
    pub fn stop(&mut self) -> AppResult<()> {
        let Some(mut worker) = self.worker.take() else {
            debug!("Stop requested, pipeline not running");
            self.set_closed();
            return Ok(());
        };

        if worker.is_current() {
            warn!(name = %worker.name(), "Stop called from the capture worker, ignoring");
            let name = worker.name().to_string();
            self.worker = Some(worker);
            return Err(ThreadError::SelfJoin(name).into());
        }

        // Frame notifications still queued ahead of the quit are skipped
        self.gate.close();

        match worker.quit_and_join() {
            Ok(()) => {}
            Err(ThreadError::SelfJoin(name)) => {
                self.gate.open();
                self.worker = Some(worker);
                return Err(ThreadError::SelfJoin(name).into());
            }
            Err(e) => {
                error!(error = %e, "Capture worker did not exit cleanly");
                self.reset_after_stop();
                self.record_error(e.clone());
                return Err(e.into());
            }
        }

        info!("Preview stopped");
        self.reset_after_stop();
        Ok(())
    }

    fn reset_after_stop(&mut self) {
        self.tracker.reset();
        self.device = None;
        self.scale = 0.0;
        self.set_closed();
    }

    fn set_closed(&self) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.state = SessionState::Closed;
    }

    /// Renegotiate for a new display size; returns true if the session is
    /// being reconfigured
    pub fn on_resize(&mut self, width: u32, height: u32) -> bool {
        let Some(device) = self.device.as_ref() else {
            debug!(width, height, "Resize before start, ignoring");
            return false;
        };

        let change = match self.tracker.update(&device.output_sizes, width, height) {
            Ok(change) => change,
            Err(e) => {
                warn!(error = %e, "Size negotiation failed on resize");
                self.record_error(e);
                return false;
            }
        };

        self.display = (width, height);
        self.update_scale(change.size());

        if !change.is_changed() {
            debug!(size = %change.size(), "Preview size unchanged");
            return false;
        }

        info!(size = %change.size(), "Preview size changed");
        self.worker.as_ref().is_some_and(|worker| {
            worker.post(ControllerMessage::Configure {
                size: change.size(),
            })
        })
    }

    fn update_scale(&mut self, size: PreviewSize) {
        let (width, height) = self.display;
        self.scale = self
            .config
            .layout
            .scale(width, height, size.width, size.height);
        debug!(scale = self.scale, layout = ?self.config.layout, "Display scale");
    }

    /// Install the frame consumer, replacing any previous one
    ///
    /// The callback runs on the capture worker, once per delivered frame. The
    /// frame is only borrowed for the duration of the call.
    pub fn deliver_frame<F>(&self, callback: F)
    where
        F: FnMut(&FrameBuffer<'_>) + Send + 'static,
    {
        self.set_consumer(Some(Box::new(callback)));
    }

    pub fn clear_consumer(&self) {
        self.set_consumer(None);
    }

    fn set_consumer(&self, callback: Option<FrameCallback>) {
        let mut consumer = self.consumer.lock().unwrap_or_else(|e| e.into_inner());
        *consumer = callback;
    }

    pub fn status(&self) -> SessionStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn preview_size(&self) -> Option<PreviewSize> {
        self.tracker.current()
    }

    /// Display scale; 0 in exact layout or when not started
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn last_error(&self) -> Option<AppError> {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_error
            .clone()
    }

    /// Device picked by the last successful `start`
    pub fn device(&self) -> Option<&CameraDevice> {
        self.device.as_ref()
    }

    /// Poll the status until `state` is reached; false on timeout
    pub fn wait_for_state(&self, state: SessionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state() == state {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(IDLE_POLL_INTERVAL);
        }
    }

    /// Sender for components (such as the marker stage) that raise notices
    pub fn notice_sender(&self) -> Sender<Notice> {
        self.notice_tx.clone()
    }

    /// Take all pending notices
    pub fn drain_notices(&self) -> Vec<Notice> {
        self.notice_rx.try_iter().collect()
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notice_tx.send(notice);
    }

    fn record_error(&self, error: impl Into<AppError>) {
        let error = error.into();
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.last_error = Some(error);
    }
}

impl Drop for PreviewPipeline {
    fn drop(&mut self) {
        if self.worker.is_some()
            && let Err(e) = self.stop()
        {
            warn!(error = %e, "Preview pipeline dropped without a clean stop");
        }
    }
}

impl std::fmt::Debug for PreviewPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewPipeline")
            .field("provider", &self.provider.name())
            .field("device", &self.device.as_ref().map(|d| &d.id))
            .field("preview_size", &self.tracker.current())
            .field("scale", &self.scale)
            .field("running", &self.worker.is_some())
            .finish()
    }
}
