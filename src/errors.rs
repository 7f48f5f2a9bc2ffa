// SPDX-License-Identifier: MPL-2.0

//! Error types for the preview pipeline

use std::fmt;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Main error type
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Camera device and capture session errors
    Camera(CameraError),
    /// Frame layout and conversion errors
    Frame(FrameError),
    /// Calibration errors
    Calibration(CalibrationError),
    /// Worker thread errors
    Thread(ThreadError),
    /// Configuration errors
    Config(String),
    /// Storage/filesystem errors
    Storage(String),
    /// Generic error with message
    Other(String),
}

/// Camera device and capture session errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    /// Enumeration returned nothing, or no device matched the selector
    NoDeviceAvailable,
    /// The device advertised no output sizes
    NoSizesAvailable,
    /// The capture session could not be configured
    SessionConfigureFailed(String),
    /// Permission missing or the device refused access
    DeviceAccessDenied(String),
    /// The device went away while open
    DeviceDisconnected(String),
    /// Any other provider failure
    Backend(String),
}

/// Frame layout and conversion errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Pixel format is not one of the supported 4:2:0 layouts
    UnsupportedFormat(String),
    /// Plane sizes or strides do not match the frame dimensions
    InvalidLayout(String),
}

/// Calibration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    /// The calibration pattern was not found in the frame
    PatternNotFound,
    /// Solver failed to produce a calibration
    SolveFailed(String),
    /// Stored calibration data could not be read or written
    Persistence(String),
}

/// Worker thread errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    /// The OS refused to spawn the worker
    SpawnFailed(String),
    /// A join was requested from the worker thread itself
    SelfJoin(String),
    /// The worker panicked
    Panicked(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Camera(e) => write!(f, "Camera error: {}", e),
            AppError::Frame(e) => write!(f, "Frame error: {}", e),
            AppError::Calibration(e) => write!(f, "Calibration error: {}", e),
            AppError::Thread(e) => write!(f, "Worker error: {}", e),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Storage(msg) => write!(f, "Storage error: {}", msg),
            AppError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraError::NoDeviceAvailable => write!(f, "No camera device available"),
            CameraError::NoSizesAvailable => write!(f, "No output sizes available"),
            CameraError::SessionConfigureFailed(msg) => {
                write!(f, "Session configuration failed: {}", msg)
            }
            CameraError::DeviceAccessDenied(msg) => write!(f, "Device access denied: {}", msg),
            CameraError::DeviceDisconnected(msg) => write!(f, "Device disconnected: {}", msg),
            CameraError::Backend(msg) => write!(f, "Backend error: {}", msg),
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::UnsupportedFormat(msg) => write!(f, "Unsupported format: {}", msg),
            FrameError::InvalidLayout(msg) => write!(f, "Invalid frame layout: {}", msg),
        }
    }
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationError::PatternNotFound => {
                write!(f, "The calibration pattern was not found")
            }
            CalibrationError::SolveFailed(msg) => write!(f, "Calibration failed: {}", msg),
            CalibrationError::Persistence(msg) => {
                write!(f, "Calibration persistence failed: {}", msg)
            }
        }
    }
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadError::SpawnFailed(msg) => write!(f, "Failed to spawn worker: {}", msg),
            ThreadError::SelfJoin(name) => {
                write!(f, "Worker '{}' cannot be joined from itself", name)
            }
            ThreadError::Panicked(name) => write!(f, "Worker '{}' panicked", name),
        }
    }
}

impl std::error::Error for AppError {}
impl std::error::Error for CameraError {}
impl std::error::Error for FrameError {}
impl std::error::Error for CalibrationError {}
impl std::error::Error for ThreadError {}

impl From<CameraError> for AppError {
    fn from(err: CameraError) -> Self {
        AppError::Camera(err)
    }
}

impl From<FrameError> for AppError {
    fn from(err: FrameError) -> Self {
        AppError::Frame(err)
    }
}

impl From<CalibrationError> for AppError {
    fn from(err: CalibrationError) -> Self {
        AppError::Calibration(err)
    }
}

impl From<ThreadError> for AppError {
    fn from(err: ThreadError) -> Self {
        AppError::Thread(err)
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Other(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Other(msg.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> Self {
        CalibrationError::Persistence(err.to_string())
    }
}
