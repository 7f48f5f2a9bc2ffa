// SPDX-License-Identifier: GPL-3.0-only

//! Device and capture session state machine
//!
//! [`DeviceSessionController`] runs as the actor of the capture worker. It owns
//! the open device, the active capture session and the frame reader, and is the
//! only code that touches them. Providers never call into the controller:
//! every asynchronous result arrives as a [`ControllerMessage`] through
//! [`DeviceCallbacks`] or [`SessionCallbacks`].
//!
//! ```text
//!  Closed ──open──▶ Opening ──opened + size──▶ Configuring ──configured──▶ Previewing
//!    ▲                 │                          │   ▲                        │
//!    │                 │ size arrives later ──────┘   └──── size changed ──────┤
//!    └──── disconnect / error / stop (via Closing) ◀──────────────────────────┘
//! ```
//!
//! Each open and each session configuration gets a generation number.
//! Callbacks carrying an older generation are stale: they are ignored, and a
//! device or session they hand over is closed on the spot.

use super::capture_thread::{WorkerActor, WorkerHandle};
use super::frame_reader::FrameReader;
use super::types::*;
use super::{CameraProvider, CaptureSession, DeviceHandle};
use crate::constants::capture::MAX_IMAGES;
use crate::constants::timing::FRAME_LOG_INTERVAL;
use crate::errors::{AppError, CameraError};
use crate::media::FrameBuffer;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Consumer invoked on the worker with each delivered frame
pub type FrameCallback = Box<dyn FnMut(&FrameBuffer<'_>) + Send>;

/// Consumer slot shared between the pipeline and the worker
pub type SharedConsumer = Arc<Mutex<Option<FrameCallback>>>;

/// Status snapshot shared between the pipeline and the worker
pub type SharedStatus = Arc<Mutex<SessionStatus>>;

/// Switch the pipeline flips to cut frame delivery ahead of queued messages
///
/// The worker checks it under the consumer lock right before every callback,
/// so once [`close`](Self::close) returns no new callback starts.
#[derive(Debug, Clone)]
pub struct FrameGate(Arc<AtomicBool>);

impl FrameGate {
    /// A gate that lets frames through
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn open(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for FrameGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Observable state of the controller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub device_id: Option<String>,
    pub preview_size: Option<PreviewSize>,
    /// Most recent failure, kept until the next start
    pub last_error: Option<AppError>,
    /// The last session configuration failed and nothing has retried it yet
    pub configure_failed: bool,
    /// Frames handed to the consumer
    pub frames_delivered: u64,
    /// Frames discarded by the reader in favour of newer ones
    pub frames_dropped: u64,
    /// Frames rejected for a bad layout or a consumer panic
    pub frames_failed: u64,
}

/// Capture parameters the controller applies to every session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub af_mode: AfMode,
    pub ae_mode: AeMode,
    /// Frame reader capacity
    pub max_images: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            af_mode: AfMode::ContinuousPicture,
            ae_mode: AeMode::OnAutoFlash,
            max_images: MAX_IMAGES,
        }
    }
}

/// Device lifecycle callbacks
pub enum DeviceEvent {
    Opened(Box<dyn DeviceHandle>),
    OpenFailed(CameraError),
    Disconnected,
    Error(DeviceErrorCode),
}

/// Session lifecycle callbacks
pub enum SessionEvent {
    Configured(Box<dyn CaptureSession>),
    ConfigureFailed(String),
}

/// Everything the capture worker can be asked to do
pub enum ControllerMessage {
    /// Open a device; configure right away when the size is known
    Open {
        device: CameraDevice,
        size: Option<PreviewSize>,
    },
    /// Use this preview size, reconfiguring a live session
    Configure { size: PreviewSize },
    Device { generation: u64, event: DeviceEvent },
    Session { generation: u64, event: SessionEvent },
    FrameAvailable { generation: u64 },
}

impl ControllerMessage {
    fn kind(&self) -> &'static str {
        match self {
            ControllerMessage::Open { .. } => "open",
            ControllerMessage::Configure { .. } => "configure",
            ControllerMessage::Device { .. } => "device",
            ControllerMessage::Session { .. } => "session",
            ControllerMessage::FrameAvailable { .. } => "frame",
        }
    }
}

/// Handed to a provider when a device is opened
#[derive(Clone, Debug)]
pub struct DeviceCallbacks {
    worker: WorkerHandle<ControllerMessage>,
    generation: u64,
}

impl DeviceCallbacks {
    pub fn new(worker: WorkerHandle<ControllerMessage>, generation: u64) -> Self {
        Self { worker, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The device is ready. If the worker is gone the device is closed here.
    pub fn opened(&self, device: Box<dyn DeviceHandle>) {
        let message = ControllerMessage::Device {
            generation: self.generation,
            event: DeviceEvent::Opened(device),
        };
        if let Err(ControllerMessage::Device {
            event: DeviceEvent::Opened(mut device),
            ..
        }) = self.worker.try_post(message)
        {
            debug!(device = %device.id(), "Capture worker gone, closing device");
            device.close();
        }
    }

    pub fn open_failed(&self, error: CameraError) {
        self.post(DeviceEvent::OpenFailed(error));
    }

    pub fn disconnected(&self) {
        self.post(DeviceEvent::Disconnected);
    }

    pub fn error(&self, code: DeviceErrorCode) {
        self.post(DeviceEvent::Error(code));
    }

    fn post(&self, event: DeviceEvent) {
        self.worker.post(ControllerMessage::Device {
            generation: self.generation,
            event,
        });
    }
}

/// Handed to a device when a session is created
#[derive(Clone, Debug)]
pub struct SessionCallbacks {
    worker: WorkerHandle<ControllerMessage>,
    generation: u64,
}

impl SessionCallbacks {
    pub fn new(worker: WorkerHandle<ControllerMessage>, generation: u64) -> Self {
        Self { worker, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The session is ready. If the worker is gone the session is closed here.
    pub fn configured(&self, session: Box<dyn CaptureSession>) {
        let message = ControllerMessage::Session {
            generation: self.generation,
            event: SessionEvent::Configured(session),
        };
        if let Err(ControllerMessage::Session {
            event: SessionEvent::Configured(mut session),
            ..
        }) = self.worker.try_post(message)
        {
            debug!("Capture worker gone, closing session");
            session.close();
        }
    }

    pub fn configure_failed(&self, reason: impl Into<String>) {
        self.worker.post(ControllerMessage::Session {
            generation: self.generation,
            event: SessionEvent::ConfigureFailed(reason.into()),
        });
    }
}

/// Owner of the device, session and frame reader; lives on the capture worker
pub struct DeviceSessionController {
    provider: Arc<dyn CameraProvider>,
    worker: WorkerHandle<ControllerMessage>,
    settings: ControllerSettings,
    status: SharedStatus,
    consumer: SharedConsumer,
    gate: FrameGate,

    state: SessionState,
    device_info: Option<CameraDevice>,
    device: Option<Box<dyn DeviceHandle>>,
    session: Option<Box<dyn CaptureSession>>,
    reader: Option<FrameReader>,
    target_size: Option<PreviewSize>,

    device_generation: u64,
    session_generation: u64,
}

impl DeviceSessionController {
    pub fn new(
        provider: Arc<dyn CameraProvider>,
        worker: WorkerHandle<ControllerMessage>,
        settings: ControllerSettings,
        status: SharedStatus,
        consumer: SharedConsumer,
        gate: FrameGate,
    ) -> Self {
        Self {
            provider,
            worker,
            settings,
            status,
            consumer,
            gate,
            state: SessionState::Closed,
            device_info: None,
            device: None,
            session: None,
            reader: None,
            target_size: None,
            device_generation: 0,
            session_generation: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Session state change");
            self.state = state;
            self.update_status(|s| s.state = state);
        }
    }

    fn update_status(&self, f: impl FnOnce(&mut SessionStatus)) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
    }

    fn report(&self, error: impl Into<AppError>) {
        let error = error.into();
        self.update_status(|s| s.last_error = Some(error));
    }

    fn device_id(&self) -> String {
        self.device_info
            .as_ref()
            .map(|d| d.id.clone())
            .unwrap_or_default()
    }

    fn open(&mut self, device: CameraDevice, size: Option<PreviewSize>) {
        if self.state != SessionState::Closed {
            info!(device = %device.id, "Reopening, closing current device first");
            self.teardown();
        }

        self.device_generation += 1;
        self.target_size = size;

        let id = device.id.clone();
        self.update_status(|s| {
            s.device_id = Some(device.id.clone());
            s.preview_size = size;
            s.configure_failed = false;
        });
        self.device_info = Some(device);
        self.set_state(SessionState::Opening);

        info!(device = %id, provider = self.provider.name(), "Opening camera");
        let callbacks = DeviceCallbacks::new(self.worker.clone(), self.device_generation);
        if let Err(e) = self.provider.open(&id, callbacks) {
            error!(device = %id, error = %e, "Failed to open camera");
            self.report(e);
            self.teardown();
        }
    }

    fn on_device_event(&mut self, generation: u64, event: DeviceEvent) {
        if generation != self.device_generation
            || matches!(self.state, SessionState::Closed | SessionState::Closing)
        {
            debug!(
                generation,
                current = self.device_generation,
                "Ignoring stale device callback"
            );
            if let DeviceEvent::Opened(mut device) = event {
                device.close();
            }
            return;
        }

        match event {
            DeviceEvent::Opened(mut device) => {
                if self.device.is_some() {
                    warn!(device = %device.id(), "Device already open, closing duplicate");
                    device.close();
                    return;
                }
                info!(device = %device.id(), "Camera opened");
                self.device = Some(device);
                match self.target_size {
                    Some(size) => self.configure(size),
                    None => debug!("Camera open, waiting for a preview size"),
                }
            }
            DeviceEvent::OpenFailed(e) => {
                error!(device = %self.device_id(), error = %e, "Camera open failed");
                self.report(e);
                self.teardown();
            }
            DeviceEvent::Disconnected => {
                let id = self.device_id();
                warn!(device = %id, "Camera disconnected");
                self.report(CameraError::DeviceDisconnected(id));
                self.teardown();
            }
            DeviceEvent::Error(code) => {
                let id = self.device_id();
                error!(device = %id, %code, "Camera device error");
                self.report(device_error(code, &id));
                self.teardown();
            }
        }
    }

    fn on_configure(&mut self, size: PreviewSize) {
        let previous = self.target_size.replace(size);
        self.update_status(|s| s.preview_size = Some(size));

        match self.state {
            SessionState::Closed | SessionState::Closing => {
                debug!(size = %size, "Stored preview size for the next open");
            }
            SessionState::Opening => {
                if self.device.is_some() {
                    self.configure(size);
                } else {
                    debug!(size = %size, "Camera still opening, size stored");
                }
            }
            SessionState::Configuring | SessionState::Previewing => {
                if previous == Some(size) && !self.configure_failed() {
                    debug!(size = %size, "Preview size unchanged, keeping session");
                    return;
                }
                info!(from = ?previous, to = %size, "Reconfiguring capture session");
                self.configure(size);
            }
        }
    }

    fn configure_failed(&self) -> bool {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .configure_failed
    }

    /// Record a failed configuration; the state stays Configuring
    fn configuration_failed(&mut self, error: CameraError) {
        self.update_status(|s| {
            s.configure_failed = true;
            s.last_error = Some(error.into());
        });
        self.close_reader();
    }

    /// Start a new session on the open device, replacing any current one
    fn configure(&mut self, size: PreviewSize) {
        let Some(format) = self.device_info.as_ref().map(|d| d.format) else {
            return;
        };
        self.update_status(|s| s.configure_failed = false);

        self.close_session();
        self.close_reader();
        self.session_generation += 1;
        let generation = self.session_generation;

        let worker = self.worker.clone();
        let reader = FrameReader::new(
            size,
            format,
            self.settings.max_images,
            Arc::new(move || {
                worker.post(ControllerMessage::FrameAvailable { generation });
            }),
        );
        let output = reader.producer();
        self.reader = Some(reader);
        self.set_state(SessionState::Configuring);

        let callbacks = SessionCallbacks::new(self.worker.clone(), generation);
        let Some(device) = self.device.as_mut() else {
            return;
        };

        info!(size = %size, format = %format, generation, "Configuring capture session");
        if let Err(e) = device.create_session(SessionConfig { size, format }, output, callbacks) {
            error!(error = %e, "Failed to create capture session");
            self.configuration_failed(CameraError::SessionConfigureFailed(e.to_string()));
        }
    }

    fn on_session_event(&mut self, generation: u64, event: SessionEvent) {
        if generation != self.session_generation
            || self.device.is_none()
            || self.state != SessionState::Configuring
        {
            debug!(
                generation,
                current = self.session_generation,
                "Ignoring stale session callback"
            );
            if let SessionEvent::Configured(mut session) = event {
                session.close();
            }
            return;
        }

        match event {
            SessionEvent::Configured(mut session) => {
                let Some(size) = self.reader.as_ref().map(|r| r.size()) else {
                    session.close();
                    return;
                };
                let request = CaptureRequest::preview(size)
                    .with_modes(self.settings.af_mode, self.settings.ae_mode);

                if let Err(e) = session.set_repeating_request(&request) {
                    error!(error = %e, "Failed to start repeating request");
                    session.close();
                    self.configuration_failed(CameraError::SessionConfigureFailed(e.to_string()));
                    return;
                }

                self.session = Some(session);
                self.set_state(SessionState::Previewing);
                info!(size = %size, "Preview running");
            }
            SessionEvent::ConfigureFailed(reason) => {
                error!(reason = %reason, "Capture session configuration failed");
                self.configuration_failed(CameraError::SessionConfigureFailed(reason));
            }
        }
    }

    fn on_frame_available(&mut self, generation: u64) {
        if generation != self.session_generation {
            return;
        }
        let Some(reader) = self.reader.as_ref() else {
            return;
        };
        let Some(image) = reader.acquire_latest() else {
            return;
        };

        let sequence = image.sequence;
        let mut delivered = false;
        let mut failed = false;

        match FrameBuffer::from_image(&image) {
            Ok(frame) => {
                let mut consumer = self.consumer.lock().unwrap_or_else(|e| e.into_inner());
                if !self.gate.is_open() {
                    debug!(sequence, "Delivery stopped, dropping frame");
                } else if let Some(callback) = consumer.as_mut() {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&frame)));
                    if outcome.is_err() {
                        error!(sequence, "Frame consumer panicked");
                        failed = true;
                    } else {
                        delivered = true;
                    }
                }
            }
            Err(e) => {
                warn!(sequence, error = %e, "Dropping unusable frame");
                self.report(e);
                failed = true;
            }
        }
        drop(image);

        let stats = reader.stats();
        let mut total = 0;
        self.update_status(|s| {
            if delivered {
                s.frames_delivered += 1;
            }
            if failed {
                s.frames_failed += 1;
            }
            s.frames_dropped = stats.dropped;
            total = s.frames_delivered;
        });

        if delivered && total % FRAME_LOG_INTERVAL == 0 {
            debug!(
                delivered = total,
                dropped = stats.dropped,
                sequence,
                "Preview frames"
            );
        }
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!("Closing capture session");
            session.close();
        }
    }

    fn close_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.close();
            let dropped = reader.stats().dropped;
            self.update_status(|s| s.frames_dropped = dropped);
        }
    }

    /// Release session, device and reader, in that order, and end up Closed
    ///
    /// Safe in any state, including mid-configuration. Callbacks still in
    /// flight become stale.
    fn teardown(&mut self) {
        if self.state == SessionState::Closed
            && self.device.is_none()
            && self.session.is_none()
            && self.reader.is_none()
        {
            return;
        }

        self.set_state(SessionState::Closing);
        self.close_session();
        if let Some(mut device) = self.device.take() {
            info!(device = %device.id(), "Closing camera");
            device.close();
        }
        self.close_reader();

        self.device_generation += 1;
        self.session_generation += 1;
        self.set_state(SessionState::Closed);
    }
}

impl WorkerActor for DeviceSessionController {
    type Message = ControllerMessage;

    fn handle(&mut self, message: ControllerMessage) {
        if !matches!(message, ControllerMessage::FrameAvailable { .. }) {
            debug!(kind = message.kind(), state = %self.state, "Controller message");
        }
        match message {
            ControllerMessage::Open { device, size } => self.open(device, size),
            ControllerMessage::Configure { size } => self.on_configure(size),
            ControllerMessage::Device { generation, event } => {
                self.on_device_event(generation, event)
            }
            ControllerMessage::Session { generation, event } => {
                self.on_session_event(generation, event)
            }
            ControllerMessage::FrameAvailable { generation } => self.on_frame_available(generation),
        }
    }

    fn on_quit(&mut self) {
        self.teardown();
    }
}

fn device_error(code: DeviceErrorCode, device: &str) -> CameraError {
    let detail = format!("{}: {}", device, code);
    match code {
        DeviceErrorCode::InUse | DeviceErrorCode::MaxCamerasInUse | DeviceErrorCode::Disabled => {
            CameraError::DeviceAccessDenied(detail)
        }
        DeviceErrorCode::Device | DeviceErrorCode::Service => CameraError::Backend(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::frame_reader::FrameProducer;
    use std::sync::mpsc::Receiver;
    use std::time::{Duration, Instant};

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    struct FakeProvider {
        log: Log,
        refuse: bool,
    }

    impl CameraProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn enumerate(&self) -> BackendResult<Vec<CameraDevice>> {
            Ok(vec![camera()])
        }

        fn open(&self, device_id: &str, _callbacks: DeviceCallbacks) -> BackendResult<()> {
            if self.refuse {
                return Err(CameraError::DeviceAccessDenied(device_id.to_string()));
            }
            record(&self.log, format!("open {}", device_id));
            Ok(())
        }
    }

    struct FakeDevice {
        log: Log,
        outputs: Arc<Mutex<Vec<FrameProducer>>>,
    }

    impl DeviceHandle for FakeDevice {
        fn id(&self) -> &str {
            "cam0"
        }

        fn create_session(
            &mut self,
            config: SessionConfig,
            output: FrameProducer,
            _callbacks: SessionCallbacks,
        ) -> BackendResult<()> {
            record(&self.log, format!("create {}", config.size));
            self.outputs.lock().unwrap().push(output);
            Ok(())
        }

        fn close(&mut self) {
            record(&self.log, "close device");
        }
    }

    struct FakeSession {
        log: Log,
        requests: Arc<Mutex<Vec<CaptureRequest>>>,
    }

    impl CaptureSession for FakeSession {
        fn set_repeating_request(&mut self, request: &CaptureRequest) -> BackendResult<()> {
            self.requests.lock().unwrap().push(*request);
            record(&self.log, "repeat");
            Ok(())
        }

        fn close(&mut self) {
            record(&self.log, "close session");
        }
    }

    fn camera() -> CameraDevice {
        CameraDevice {
            id: "cam0".to_string(),
            name: "Fake".to_string(),
            facing: LensFacing::Back,
            output_sizes: vec![PreviewSize::new(4, 4), PreviewSize::new(8, 8)],
            format: FrameFormat::Nv21,
        }
    }

    struct Harness {
        controller: DeviceSessionController,
        log: Log,
        outputs: Arc<Mutex<Vec<FrameProducer>>>,
        requests: Arc<Mutex<Vec<CaptureRequest>>>,
        status: SharedStatus,
        consumer: SharedConsumer,
        gate: FrameGate,
        posted: Receiver<ControllerMessage>,
    }

    impl Harness {
        fn new(refuse: bool) -> Self {
            let log: Log = Arc::default();
            let status: SharedStatus = Arc::default();
            let consumer: SharedConsumer = Arc::default();
            let gate = FrameGate::new();
            let (worker, posted) = WorkerHandle::detached("controller-test");
            let provider = Arc::new(FakeProvider {
                log: Arc::clone(&log),
                refuse,
            });
            Self {
                controller: DeviceSessionController::new(
                    provider,
                    worker,
                    ControllerSettings::default(),
                    Arc::clone(&status),
                    Arc::clone(&consumer),
                    gate.clone(),
                ),
                log,
                outputs: Arc::default(),
                requests: Arc::default(),
                status,
                consumer,
                gate,
                posted,
            }
        }

        fn device(&self) -> Box<dyn DeviceHandle> {
            Box::new(FakeDevice {
                log: Arc::clone(&self.log),
                outputs: Arc::clone(&self.outputs),
            })
        }

        fn session(&self) -> Box<dyn CaptureSession> {
            Box::new(FakeSession {
                log: Arc::clone(&self.log),
                requests: Arc::clone(&self.requests),
            })
        }

        fn open(&mut self, size: Option<PreviewSize>) {
            self.controller.handle(ControllerMessage::Open {
                device: camera(),
                size,
            });
        }

        fn device_opened(&mut self) {
            let device = self.device();
            let generation = self.controller.device_generation;
            self.controller.handle(ControllerMessage::Device {
                generation,
                event: DeviceEvent::Opened(device),
            });
        }

        fn session_configured(&mut self, generation: u64) {
            let session = self.session();
            self.controller.handle(ControllerMessage::Session {
                generation,
                event: SessionEvent::Configured(session),
            });
        }

        fn preview(&mut self, size: PreviewSize) {
            self.open(Some(size));
            self.device_opened();
            let generation = self.controller.session_generation;
            self.session_configured(generation);
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn status(&self) -> SessionStatus {
            self.status.lock().unwrap().clone()
        }
    }

    fn nv21(sequence: u64) -> RawImage {
        RawImage {
            width: 4,
            height: 4,
            format: FrameFormat::Nv21,
            planes: vec![Plane {
                data: vec![128; 24],
                row_stride: 4,
                pixel_stride: 1,
            }],
            sequence,
            captured_at: Instant::now(),
        }
    }

    #[test]
    fn test_open_configure_preview() {
        let mut h = Harness::new(false);
        h.preview(PreviewSize::new(4, 4));

        assert_eq!(h.controller.state(), SessionState::Previewing);
        assert_eq!(h.log(), vec!["open cam0", "create 4x4", "repeat"]);

        let requests = h.requests.lock().unwrap();
        assert_eq!(requests[0].af_mode, AfMode::ContinuousPicture);
        assert_eq!(requests[0].ae_mode, AeMode::OnAutoFlash);
        assert_eq!(h.status().state, SessionState::Previewing);
    }

    #[test]
    fn test_configuration_waits_for_size() {
        let mut h = Harness::new(false);
        h.open(None);
        h.device_opened();

        assert_eq!(h.controller.state(), SessionState::Opening);
        assert!(h.controller.device.is_some());

        h.controller.handle(ControllerMessage::Configure {
            size: PreviewSize::new(8, 8),
        });
        assert_eq!(h.controller.state(), SessionState::Configuring);
        assert_eq!(h.log(), vec!["open cam0", "create 8x8"]);
    }

    #[test]
    fn test_configure_failure_stays_configuring() {
        let mut h = Harness::new(false);
        h.open(Some(PreviewSize::new(4, 4)));
        h.device_opened();

        let generation = h.controller.session_generation;
        h.controller.handle(ControllerMessage::Session {
            generation,
            event: SessionEvent::ConfigureFailed("no stream".to_string()),
        });

        assert_eq!(h.controller.state(), SessionState::Configuring);
        assert!(h.status().configure_failed);
        assert!(matches!(
            h.status().last_error,
            Some(AppError::Camera(CameraError::SessionConfigureFailed(_)))
        ));
        assert_eq!(h.log().iter().filter(|e| e.starts_with("create")).count(), 1);
    }

    #[test]
    fn test_same_size_retries_failed_configuration() {
        let mut h = Harness::new(false);
        h.open(Some(PreviewSize::new(4, 4)));
        h.device_opened();
        let generation = h.controller.session_generation;
        h.controller.handle(ControllerMessage::Session {
            generation,
            event: SessionEvent::ConfigureFailed("no stream".to_string()),
        });

        h.controller.handle(ControllerMessage::Configure {
            size: PreviewSize::new(4, 4),
        });
        assert!(!h.status().configure_failed);
        assert_eq!(h.log().iter().filter(|e| e.starts_with("create")).count(), 2);

        let generation = h.controller.session_generation;
        h.session_configured(generation);
        assert_eq!(h.controller.state(), SessionState::Previewing);
    }

    #[test]
    fn test_resize_keeps_device_open() {
        let mut h = Harness::new(false);
        h.preview(PreviewSize::new(4, 4));

        h.controller.handle(ControllerMessage::Configure {
            size: PreviewSize::new(8, 8),
        });
        assert_eq!(h.controller.state(), SessionState::Configuring);

        let log = h.log();
        assert!(log.contains(&"close session".to_string()));
        assert!(!log.contains(&"close device".to_string()));
        assert_eq!(log.last().map(String::as_str), Some("create 8x8"));
    }

    #[test]
    fn test_same_size_does_not_reconfigure() {
        let mut h = Harness::new(false);
        h.preview(PreviewSize::new(4, 4));
        let before = h.log().len();

        h.controller.handle(ControllerMessage::Configure {
            size: PreviewSize::new(4, 4),
        });
        assert_eq!(h.log().len(), before);
        assert_eq!(h.controller.state(), SessionState::Previewing);
    }

    #[test]
    fn test_stale_session_is_closed() {
        let mut h = Harness::new(false);
        h.open(Some(PreviewSize::new(4, 4)));
        h.device_opened();
        let stale = h.controller.session_generation;

        h.controller.handle(ControllerMessage::Configure {
            size: PreviewSize::new(8, 8),
        });
        h.session_configured(stale);

        assert_eq!(h.controller.state(), SessionState::Configuring);
        assert!(h.controller.session.is_none());
        assert_eq!(h.log().last().map(String::as_str), Some("close session"));
    }

    #[test]
    fn test_disconnect_forces_closed() {
        let mut h = Harness::new(false);
        h.preview(PreviewSize::new(4, 4));

        let generation = h.controller.device_generation;
        h.controller.handle(ControllerMessage::Device {
            generation,
            event: DeviceEvent::Disconnected,
        });

        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(matches!(
            h.status().last_error,
            Some(AppError::Camera(CameraError::DeviceDisconnected(_)))
        ));
        let log = h.log();
        let tail: Vec<&str> = log.iter().rev().take(2).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["close session", "close device"]);

        // A late open for the old generation is released immediately
        let late = h.device();
        h.controller.handle(ControllerMessage::Device {
            generation,
            event: DeviceEvent::Opened(late),
        });
        assert!(h.controller.device.is_none());
        assert_eq!(h.log().last().map(String::as_str), Some("close device"));
    }

    #[test]
    fn test_device_error_maps_to_access_denied() {
        let mut h = Harness::new(false);
        h.open(Some(PreviewSize::new(4, 4)));
        let generation = h.controller.device_generation;
        h.controller.handle(ControllerMessage::Device {
            generation,
            event: DeviceEvent::Error(DeviceErrorCode::InUse),
        });

        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(matches!(
            h.status().last_error,
            Some(AppError::Camera(CameraError::DeviceAccessDenied(_)))
        ));
    }

    #[test]
    fn test_refused_open_returns_to_closed() {
        let mut h = Harness::new(true);
        h.open(Some(PreviewSize::new(4, 4)));
        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(h.status().last_error.is_some());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut h = Harness::new(false);
        h.controller.on_quit();
        h.controller.on_quit();
        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(h.log().is_empty());

        h.preview(PreviewSize::new(4, 4));
        h.controller.on_quit();
        h.controller.on_quit();
        assert_eq!(
            h.log(),
            vec!["open cam0", "create 4x4", "repeat", "close session", "close device"]
        );
    }

    #[test]
    fn test_frames_delivered_latest_only() {
        let mut h = Harness::new(false);
        h.preview(PreviewSize::new(4, 4));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        *h.consumer.lock().unwrap() = Some(Box::new(move |frame: &FrameBuffer<'_>| {
            sink.lock().unwrap().push((frame.sequence(), frame.color().get_pixel(0, 0).0));
        }));

        let output = h.outputs.lock().unwrap()[0].clone();
        output.submit(nv21(1));
        output.submit(nv21(2));
        output.submit(nv21(3));

        // Three submissions, one notification
        let generation = h.controller.session_generation;
        let message = h.posted.recv().unwrap();
        assert!(matches!(message, ControllerMessage::FrameAvailable { generation: g } if g == generation));
        assert!(h.posted.recv_timeout(Duration::from_millis(50)).is_err());
        h.controller.handle(message);

        assert_eq!(*seen.lock().unwrap(), vec![(3, [128, 128, 128, 255])]);
        let status = h.status();
        assert_eq!(status.frames_delivered, 1);
        assert_eq!(status.frames_dropped, 2);
    }

    #[test]
    fn test_consumer_panic_is_contained() {
        let mut h = Harness::new(false);
        h.preview(PreviewSize::new(4, 4));
        *h.consumer.lock().unwrap() = Some(Box::new(|_: &FrameBuffer<'_>| panic!("boom")));

        let output = h.outputs.lock().unwrap()[0].clone();
        output.submit(nv21(1));
        let generation = h.controller.session_generation;
        h.controller
            .handle(ControllerMessage::FrameAvailable { generation });

        assert_eq!(h.status().frames_failed, 1);
        let stats = h.controller.reader.as_ref().unwrap().stats();
        assert_eq!(stats.acquired, 0);
        assert_eq!(stats.released, 1);

        // The worker keeps going
        output.submit(nv21(2));
        *h.consumer.lock().unwrap() = None;
        h.controller
            .handle(ControllerMessage::FrameAvailable { generation });
        assert_eq!(h.controller.state(), SessionState::Previewing);
    }

    #[test]
    fn test_closed_gate_stops_delivery() {
        let mut h = Harness::new(false);
        h.preview(PreviewSize::new(4, 4));

        let calls = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&calls);
        *h.consumer.lock().unwrap() = Some(Box::new(move |_: &FrameBuffer<'_>| {
            *sink.lock().unwrap() += 1;
        }));

        let output = h.outputs.lock().unwrap()[0].clone();
        let generation = h.controller.session_generation;
        h.gate.close();
        output.submit(nv21(1));
        h.controller
            .handle(ControllerMessage::FrameAvailable { generation });
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(h.status().frames_delivered, 0);

        h.gate.open();
        h.controller
            .handle(ControllerMessage::FrameAvailable { generation });
        output.submit(nv21(2));
        h.controller
            .handle(ControllerMessage::FrameAvailable { generation });
        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
