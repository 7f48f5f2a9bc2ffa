// SPDX-License-Identifier: MPL-2.0

//! Marker Camera - live camera preview for marker detection
//!
//! This library opens a camera, negotiates a preview size for the display
//! surface, and delivers each frame as a borrowed YUV 4:2:0 buffer with
//! grayscale and RGBA views to a consumer running on a dedicated worker.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: Camera providers, capture worker and session state machine
//! - [`media`]: Frame buffers and YUV to RGBA conversion
//! - [`pipelines`]: The preview facade and the marker detection stage
//! - [`vision`]: Marker detection and calibration interfaces
//! - [`config`]: User configuration handling
//! - [`storage`]: Calibration persistence
//!
//! # Example
//!
//! ```no_run
//! use marker_camera::{Config, PreviewPipeline, provider_for, ProviderKind};
//!
//! let mut pipeline = PreviewPipeline::new(provider_for(ProviderKind::V4l2), Config::default());
//! pipeline.deliver_frame(|frame| {
//!     let gray = frame.gray();
//!     println!("frame {} ({}x{})", frame.sequence(), gray.width(), gray.height());
//! });
//! if pipeline.start(1280, 720) {
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//! }
//! pipeline.stop().ok();
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod media;
pub mod pipelines;
pub mod storage;
pub mod vision;

// Re-export commonly used types
pub use backends::camera::{
    CameraDevice, CameraProvider, DeviceSelector, FrameFormat, LensFacing, PreviewSize,
    ProviderKind, SessionState, SessionStatus, VirtualCameraProvider, provider_for,
};
pub use config::{Config, LayoutMode};
pub use errors::{AppError, AppResult, CameraError, FrameError};
pub use media::{FrameBuffer, GrayView};
pub use pipelines::{MarkerControl, MarkerStage, Notice, PreviewPipeline};
pub use storage::{CalibrationStore, JsonCalibrationStore};
pub use vision::{
    CameraCalibration, MarkerDetector, NoPatternCalibrator, PassthroughDetector, PatternCalibrator,
};
