// SPDX-License-Identifier: GPL-3.0-only
// Shared types for camera providers

//! Shared types for camera providers

use crate::errors::{CameraError, FrameError};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Result type for provider operations
pub type BackendResult<T> = Result<T, CameraError>;

/// Direction the lens faces relative to the device screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LensFacing {
    Front,
    Back,
    /// USB webcams and anything else without a fixed mounting
    External,
}

impl std::fmt::Display for LensFacing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LensFacing::Front => write!(f, "front"),
            LensFacing::Back => write!(f, "back"),
            LensFacing::External => write!(f, "external"),
        }
    }
}

/// Which camera `start` should open
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceSelector {
    /// First enumerated device
    #[default]
    Any,
    /// Exact device identifier
    Id(String),
    /// First device facing this way
    Facing(LensFacing),
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::Any => write!(f, "any"),
            DeviceSelector::Id(id) => write!(f, "id:{}", id),
            DeviceSelector::Facing(facing) => write!(f, "facing:{}", facing),
        }
    }
}

/// Output resolution of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreviewSize {
    pub width: u32,
    pub height: u32,
}

impl PreviewSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Width divided by height; zero for a degenerate size
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            0.0
        } else {
            self.width as f32 / self.height as f32
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl std::fmt::Display for PreviewSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for PreviewSize {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Sample order of an interleaved chroma plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChromaOrder {
    /// U first (NV12 style)
    Uv,
    /// V first (NV21 style)
    Vu,
}

/// Sensor pixel layout delivered by a capture session
///
/// All three layouts are 4:2:0: full-resolution luma plus chroma at half the
/// resolution in each dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameFormat {
    /// Legacy semi-planar: one buffer, luma rows followed by interleaved V/U rows
    Nv21,
    /// Legacy planar: one buffer, luma followed by two quarter-size chroma planes
    Yv12,
    /// Luma and interleaved chroma delivered as two separate planes
    Yuv420TwoPlane { chroma: ChromaOrder },
}

impl Default for FrameFormat {
    fn default() -> Self {
        FrameFormat::Yuv420TwoPlane {
            chroma: ChromaOrder::Vu,
        }
    }
}

impl FrameFormat {
    /// Map a V4L2-style FourCC onto a supported layout
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Result<Self, FrameError> {
        match fourcc {
            b"NV21" => Ok(FrameFormat::Nv21),
            b"YV12" => Ok(FrameFormat::Yv12),
            b"NV12" => Ok(FrameFormat::Yuv420TwoPlane {
                chroma: ChromaOrder::Uv,
            }),
            other => Err(FrameError::UnsupportedFormat(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    /// FourCC a provider should request for this layout
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            FrameFormat::Nv21 => *b"NV21",
            FrameFormat::Yv12 => *b"YV12",
            FrameFormat::Yuv420TwoPlane {
                chroma: ChromaOrder::Uv,
            } => *b"NV12",
            FrameFormat::Yuv420TwoPlane {
                chroma: ChromaOrder::Vu,
            } => *b"NV21",
        }
    }

    /// Number of planes a provider delivers for this layout
    pub fn plane_count(&self) -> usize {
        match self {
            FrameFormat::Nv21 | FrameFormat::Yv12 => 1,
            FrameFormat::Yuv420TwoPlane { .. } => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameFormat::Nv21 => "NV21",
            FrameFormat::Yv12 => "YV12",
            FrameFormat::Yuv420TwoPlane { .. } => "YUV_420_888",
        }
    }
}

impl std::fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameFormat::Yuv420TwoPlane { chroma } => write!(f, "{} ({:?})", self.name(), chroma),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Represents a camera device
#[derive(Debug, Clone, PartialEq)]
pub struct CameraDevice {
    /// Provider-unique identifier
    pub id: String,
    pub name: String,
    pub facing: LensFacing,
    /// Output sizes in the order the provider enumerates them
    pub output_sizes: Vec<PreviewSize>,
    /// Layout the device delivers frames in
    pub format: FrameFormat,
}

/// Lifecycle state of the device/session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Closed,
    Opening,
    Configuring,
    Previewing,
    Closing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Closed => "closed",
            SessionState::Opening => "opening",
            SessionState::Configuring => "configuring",
            SessionState::Previewing => "previewing",
            SessionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Autofocus mode for the repeating request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AfMode {
    Off,
    #[default]
    ContinuousPicture,
    ContinuousVideo,
}

/// Auto-exposure mode for the repeating request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AeMode {
    Off,
    On,
    #[default]
    OnAutoFlash,
}

/// Standing capture instruction submitted once a session is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub size: PreviewSize,
    pub af_mode: AfMode,
    pub ae_mode: AeMode,
}

impl CaptureRequest {
    /// Preview template: continuous autofocus, auto exposure with auto flash
    pub fn preview(size: PreviewSize) -> Self {
        Self {
            size,
            af_mode: AfMode::ContinuousPicture,
            ae_mode: AeMode::OnAutoFlash,
        }
    }

    pub fn with_modes(mut self, af_mode: AfMode, ae_mode: AeMode) -> Self {
        self.af_mode = af_mode;
        self.ae_mode = ae_mode;
        self
    }
}

/// Error codes a device reports through its error callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    /// Another client holds the device
    InUse,
    /// Too many devices open system-wide
    MaxCamerasInUse,
    /// Device disabled by policy
    Disabled,
    /// Fatal device failure
    Device,
    /// Fatal camera service failure
    Service,
}

impl std::fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DeviceErrorCode::InUse => "camera in use",
            DeviceErrorCode::MaxCamerasInUse => "too many cameras in use",
            DeviceErrorCode::Disabled => "camera disabled",
            DeviceErrorCode::Device => "fatal device error",
            DeviceErrorCode::Service => "fatal service error",
        };
        f.write_str(text)
    }
}

/// One plane of a raw image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Bytes between the starts of consecutive rows
    pub row_stride: usize,
    /// Bytes between consecutive samples of one component
    pub pixel_stride: usize,
}

/// Raw image as handed over by a provider
///
/// Plane layout per format:
/// - `Nv21` / `Yv12`: one plane holding the whole contiguous buffer
/// - `Yuv420TwoPlane`: plane 0 is luma, plane 1 interleaved chroma (pixel stride 2)
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub planes: Vec<Plane>,
    /// Monotonic sequence number assigned by the provider
    pub sequence: u64,
    pub captured_at: Instant,
}

impl RawImage {
    pub fn size(&self) -> PreviewSize {
        PreviewSize::new(self.width, self.height)
    }
}

/// Parameters for creating a capture session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub size: PreviewSize,
    pub format: FrameFormat,
}
