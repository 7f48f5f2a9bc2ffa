// SPDX-License-Identifier: GPL-3.0-only

//! Marker detection and camera calibration collaborators
//!
//! The pipeline does not implement detection or calibration itself. It hands
//! converted frames to these traits from the capture worker, so
//! implementations run on that thread and may keep per-frame state in
//! `&mut self`.

use crate::errors::CalibrationError;
use crate::media::GrayView;
use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Intrinsics and distortion coefficients of one camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration {
    /// Row-major 3x3 camera matrix
    pub camera_matrix: [f64; 9],
    /// Distortion coefficients (k1, k2, p1, p2[, k3...])
    pub distortion: Vec<f64>,
}

impl CameraCalibration {
    /// Pinhole model with focal length `focal` and the principal point at the image center
    pub fn pinhole(focal: f64, width: u32, height: u32) -> Self {
        Self {
            camera_matrix: [
                focal,
                0.0,
                width as f64 / 2.0,
                0.0,
                focal,
                height as f64 / 2.0,
                0.0,
                0.0,
                1.0,
            ],
            distortion: vec![0.0; 5],
        }
    }

    pub fn focal_length(&self) -> (f64, f64) {
        (self.camera_matrix[0], self.camera_matrix[4])
    }

    pub fn principal_point(&self) -> (f64, f64) {
        (self.camera_matrix[2], self.camera_matrix[5])
    }

    /// A usable calibration has positive focal lengths and finite values
    pub fn is_valid(&self) -> bool {
        let (fx, fy) = self.focal_length();
        fx > 0.0
            && fy > 0.0
            && self.camera_matrix.iter().all(|v| v.is_finite())
            && self.distortion.iter().all(|v| v.is_finite())
    }
}

/// Finds markers in a colour frame and returns an annotated copy
pub trait MarkerDetector: Send {
    /// Output must have the same dimensions as `frame`. With a calibration
    /// the detector may also estimate marker poses.
    fn detect(&mut self, frame: &RgbaImage, calibration: Option<&CameraCalibration>) -> RgbaImage;
}

/// Accumulates calibration pattern views and solves for the intrinsics
pub trait PatternCalibrator: Send {
    /// Look for the pattern; returns true if it was found in this frame
    fn process_frame(&mut self, gray: &GrayView<'_>, frame: &RgbaImage) -> bool;

    /// Keep the corners found by the last successful `process_frame`
    fn add_corners(&mut self);

    /// Solve using all corners added so far
    fn calibrate(&mut self) -> Result<CameraCalibration, CalibrationError>;
}

/// Detector that returns the frame unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughDetector;

impl MarkerDetector for PassthroughDetector {
    fn detect(&mut self, frame: &RgbaImage, _calibration: Option<&CameraCalibration>) -> RgbaImage {
        frame.clone()
    }
}

/// Calibrator for builds without a pattern finder
///
/// Every request ends in a pattern-not-found notice.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPatternCalibrator;

impl PatternCalibrator for NoPatternCalibrator {
    fn process_frame(&mut self, _gray: &GrayView<'_>, _frame: &RgbaImage) -> bool {
        false
    }

    fn add_corners(&mut self) {}

    fn calibrate(&mut self) -> Result<CameraCalibration, CalibrationError> {
        Err(CalibrationError::PatternNotFound)
    }
}
