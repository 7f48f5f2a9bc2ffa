// SPDX-License-Identifier: MPL-2.0
// Camera providers with trait-based abstraction over real and synthetic devices

//! Camera provider abstraction
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │   PreviewPipeline    │  ← start / stop / resize on the host thread
//! └──────────┬───────────┘
//!            │ messages
//!            ▼
//! ┌──────────────────────┐
//! │    CaptureThread     │  ← one worker per running pipeline
//! │ DeviceSessionControl │  ← owns device, session, frame reader
//! └──────────┬───────────┘
//!            │ trait calls / callbacks
//!            ▼
//! ┌──────────────────────┐
//! │  CameraProvider      │
//! │  ├─ V4l2Provider     │  ← Linux capture nodes
//! │  └─ VirtualProvider  │  ← synthetic frames, fault injection
//! └──────────────────────┘
//! ```
//!
//! Providers report asynchronous results (device opened, session configured,
//! disconnects) through [`DeviceCallbacks`] and [`SessionCallbacks`], which
//! turn every callback into a message for the capture worker. Device and
//! session handles are only ever used from the worker.

pub mod capture_thread;
pub mod frame_loop;
pub mod frame_reader;
pub mod negotiation;
pub mod session;
#[cfg(target_os = "linux")]
pub mod v4l2;
#[cfg(target_os = "linux")]
pub mod v4l2_controls;
pub mod virtual_camera;
pub mod types;

pub use capture_thread::{CaptureThread, WorkerActor, WorkerHandle};
pub use frame_reader::{AcquiredImage, FrameProducer, FrameReader, ReaderStats};
pub use negotiation::{PreviewSizeTracker, SizeChange, select_best_size, select_device};
pub use session::{
    ControllerMessage, ControllerSettings, DeviceCallbacks, DeviceSessionController,
    FrameCallback, FrameGate, SessionCallbacks, SessionStatus, SharedConsumer, SharedStatus,
};
pub use types::*;
pub use virtual_camera::{FaultPlan, TestPattern, VirtualCameraProvider, VirtualCounters};

use std::sync::Arc;

/// Source of camera devices
///
/// `enumerate` runs on the caller's thread. `open` is called from the
/// capture worker and reports its outcome through `callbacks`; an error
/// returned directly means the open was refused before anything started.
pub trait CameraProvider: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// List available devices with their output sizes
    fn enumerate(&self) -> BackendResult<Vec<CameraDevice>>;

    /// Begin opening a device. Success is reported with
    /// [`DeviceCallbacks::opened`], later failures through the other callbacks.
    fn open(&self, device_id: &str, callbacks: DeviceCallbacks) -> BackendResult<()>;
}

/// An open camera device
///
/// At most one capture session exists per handle. Creating a new session
/// implicitly replaces the previous one, which the controller closes first.
pub trait DeviceHandle: Send {
    fn id(&self) -> &str;

    /// Begin configuring a session that writes into `output`. The outcome is
    /// reported through `callbacks`.
    fn create_session(
        &mut self,
        config: SessionConfig,
        output: FrameProducer,
        callbacks: SessionCallbacks,
    ) -> BackendResult<()>;

    /// Release the device. Calling it again is a no-op.
    fn close(&mut self);
}

/// A configured capture session
pub trait CaptureSession: Send {
    /// Submit (or replace) the standing request that drives frame production
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> BackendResult<()>;

    /// Stop production and release the session. Calling it again is a no-op.
    fn close(&mut self);
}

/// Which provider the pipeline should talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    /// Video4Linux capture nodes
    #[default]
    V4l2,
    /// Synthetic frames
    Virtual,
}

/// Build a provider of the given kind
///
/// Falls back to the synthetic provider where V4L2 is not available.
pub fn provider_for(kind: ProviderKind) -> Arc<dyn CameraProvider> {
    match kind {
        #[cfg(target_os = "linux")]
        ProviderKind::V4l2 => Arc::new(v4l2::V4l2Provider::new()),
        #[cfg(not(target_os = "linux"))]
        ProviderKind::V4l2 => {
            tracing::warn!("V4L2 unavailable on this platform, using synthetic camera");
            Arc::new(VirtualCameraProvider::default())
        }
        ProviderKind::Virtual => Arc::new(VirtualCameraProvider::default()),
    }
}
