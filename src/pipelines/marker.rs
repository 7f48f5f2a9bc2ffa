// SPDX-License-Identifier: GPL-3.0-only

//! Marker detection stage
//!
//! A frame consumer for [`PreviewPipeline::deliver_frame`](super::PreviewPipeline::deliver_frame).
//! Each frame is converted to RGBA and handed to the marker detector. When
//! the host requests a calibration, the next frame goes to the pattern
//! calibrator instead; a successful calibration is kept for pose estimation
//! and persisted per device.
//!
//! The annotated frame is published to a latest-frame slot that the host
//! reads through [`MarkerControl`].

use super::preview::Notice;
use crate::media::FrameBuffer;
use crate::storage::CalibrationStore;
use crate::vision::{CameraCalibration, MarkerDetector, PatternCalibrator};
use image::RgbaImage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// State shared between the stage (worker side) and its control handle
#[derive(Default)]
struct MarkerShared {
    calibration_requested: AtomicBool,
    calibration_loaded: AtomicBool,
    calibration: Mutex<Option<CameraCalibration>>,
    latest: Mutex<Option<Arc<RgbaImage>>>,
    frames: AtomicU64,
}

/// Host-side handle to a running [`MarkerStage`]
#[derive(Clone)]
pub struct MarkerControl {
    shared: Arc<MarkerShared>,
}

impl MarkerControl {
    /// Run the calibrator on the next frame
    pub fn request_calibration(&self) {
        debug!("Calibration requested");
        self.shared
            .calibration_requested
            .store(true, Ordering::SeqCst);
    }

    pub fn calibration_pending(&self) -> bool {
        self.shared.calibration_requested.load(Ordering::SeqCst)
    }

    /// True once a calibration was loaded from the store or computed
    pub fn calibration_loaded(&self) -> bool {
        self.shared.calibration_loaded.load(Ordering::SeqCst)
    }

    pub fn calibration(&self) -> Option<CameraCalibration> {
        self.shared
            .calibration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Most recent annotated frame
    pub fn latest_frame(&self) -> Option<Arc<RgbaImage>> {
        self.shared
            .latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Frames processed so far
    pub fn frames(&self) -> u64 {
        self.shared.frames.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MarkerControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerControl")
            .field("frames", &self.frames())
            .field("calibration_loaded", &self.calibration_loaded())
            .field("calibration_pending", &self.calibration_pending())
            .finish()
    }
}

/// Frame consumer running marker detection and on-demand calibration
pub struct MarkerStage {
    detector: Box<dyn MarkerDetector>,
    calibrator: Box<dyn PatternCalibrator>,
    store: Arc<dyn CalibrationStore>,
    notices: Sender<Notice>,
    device_id: Option<String>,
    shared: Arc<MarkerShared>,
}

impl MarkerStage {
    pub fn new(
        detector: Box<dyn MarkerDetector>,
        calibrator: Box<dyn PatternCalibrator>,
        store: Arc<dyn CalibrationStore>,
        notices: Sender<Notice>,
    ) -> Self {
        Self {
            detector,
            calibrator,
            store,
            notices,
            device_id: None,
            shared: Arc::default(),
        }
    }

    pub fn control(&self) -> MarkerControl {
        MarkerControl {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Bind the stage to a device and load its stored calibration
    ///
    /// Returns whether a calibration was loaded. A store failure is logged
    /// and leaves the stage uncalibrated.
    pub fn on_view_start(&mut self, device_id: &str) -> bool {
        self.device_id = Some(device_id.to_string());

        let loaded = match self.store.load(device_id) {
            Ok(calibration) => calibration,
            Err(e) => {
                warn!(device = device_id, error = %e, "Could not load calibration");
                None
            }
        };

        let found = loaded.is_some();
        self.set_calibration(loaded);
        info!(device = device_id, calibrated = found, "Marker stage started");
        found
    }

    fn set_calibration(&self, calibration: Option<CameraCalibration>) {
        self.shared
            .calibration_loaded
            .store(calibration.is_some(), Ordering::SeqCst);
        *self
            .shared
            .calibration
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = calibration;
    }

    fn notify(&self, notice: Notice) {
        if self.notices.send(notice).is_err() {
            debug!("Notice receiver gone");
        }
    }

    /// Handle one frame on the capture worker
    pub fn process(&mut self, frame: &FrameBuffer<'_>) {
        let rgba = frame.color();

        let output = if self
            .shared
            .calibration_requested
            .swap(false, Ordering::SeqCst)
        {
            self.calibrate(frame, rgba);
            rgba.clone()
        } else {
            let calibration = self.control().calibration();
            let annotated = self.detector.detect(rgba, calibration.as_ref());
            if annotated.dimensions() != rgba.dimensions() {
                warn!(
                    expected = ?rgba.dimensions(),
                    got = ?annotated.dimensions(),
                    "Detector changed the frame size, showing the plain frame"
                );
                rgba.clone()
            } else {
                annotated
            }
        };

        *self
            .shared
            .latest
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(output));
        self.shared.frames.fetch_add(1, Ordering::SeqCst);
    }

    fn calibrate(&mut self, frame: &FrameBuffer<'_>, rgba: &RgbaImage) {
        let gray = frame.gray();
        if !self.calibrator.process_frame(&gray, rgba) {
            debug!(sequence = frame.sequence(), "Calibration pattern not found");
            self.notify(Notice::PatternNotFound);
            return;
        }

        self.calibrator.add_corners();
        let calibration = match self.calibrator.calibrate() {
            Ok(calibration) => calibration,
            Err(e) => {
                warn!(error = %e, "Calibration failed");
                self.notify(Notice::CalibrationFailed(e.to_string()));
                return;
            }
        };

        let device_id = self.device_id.clone().unwrap_or_default();
        info!(
            device = %device_id,
            focal = ?calibration.focal_length(),
            "Camera calibrated"
        );
        self.set_calibration(Some(calibration.clone()));

        match self.store.save(&device_id, &calibration) {
            Ok(()) => self.notify(Notice::CalibrationSaved { device_id }),
            Err(e) => {
                warn!(device = %device_id, error = %e, "Could not persist calibration");
                self.notify(Notice::CalibrationFailed(e.to_string()));
            }
        }
    }

    /// Turn the stage into a consumer for the preview pipeline
    pub fn into_callback(mut self) -> impl FnMut(&FrameBuffer<'_>) + Send + 'static {
        move |frame: &FrameBuffer<'_>| self.process(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::{FrameFormat, PreviewSize, TestPattern};
    use crate::backends::camera::virtual_camera::render_frame;
    use crate::errors::CalibrationError;
    use crate::media::GrayView;
    use std::collections::HashMap;
    use std::sync::mpsc;

    #[derive(Default)]
    struct MemoryStore {
        entries: Mutex<HashMap<String, CameraCalibration>>,
        fail_save: bool,
    }

    impl CalibrationStore for MemoryStore {
        fn load(&self, device_id: &str) -> Result<Option<CameraCalibration>, CalibrationError> {
            Ok(self.entries.lock().unwrap().get(device_id).cloned())
        }

        fn save(
            &self,
            device_id: &str,
            calibration: &CameraCalibration,
        ) -> Result<(), CalibrationError> {
            if self.fail_save {
                return Err(CalibrationError::Persistence("read-only".into()));
            }
            self.entries
                .lock()
                .unwrap()
                .insert(device_id.to_string(), calibration.clone());
            Ok(())
        }
    }

    /// Paints pixel (0, 0) red and records whether a calibration was passed
    struct MarkingDetector {
        calls: Arc<Mutex<Vec<bool>>>,
    }

    impl MarkerDetector for MarkingDetector {
        fn detect(
            &mut self,
            frame: &RgbaImage,
            calibration: Option<&CameraCalibration>,
        ) -> RgbaImage {
            self.calls.lock().unwrap().push(calibration.is_some());
            let mut out = frame.clone();
            out.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
            out
        }
    }

    struct ScriptedCalibrator {
        finds_pattern: bool,
        corners: usize,
        gray_width: Arc<Mutex<Option<u32>>>,
    }

    impl PatternCalibrator for ScriptedCalibrator {
        fn process_frame(&mut self, gray: &GrayView<'_>, _frame: &RgbaImage) -> bool {
            *self.gray_width.lock().unwrap() = Some(gray.width());
            self.finds_pattern
        }

        fn add_corners(&mut self) {
            self.corners += 1;
        }

        fn calibrate(&mut self) -> Result<CameraCalibration, CalibrationError> {
            if self.corners == 0 {
                return Err(CalibrationError::SolveFailed("no corners".into()));
            }
            Ok(CameraCalibration::pinhole(500.0, 8, 4))
        }
    }

    struct Harness {
        stage: MarkerStage,
        control: MarkerControl,
        store: Arc<MemoryStore>,
        detector_calls: Arc<Mutex<Vec<bool>>>,
        gray_width: Arc<Mutex<Option<u32>>>,
        notices: mpsc::Receiver<Notice>,
    }

    fn harness(finds_pattern: bool, store: MemoryStore) -> Harness {
        let store = Arc::new(store);
        let detector_calls = Arc::new(Mutex::new(Vec::new()));
        let gray_width = Arc::new(Mutex::new(None));
        let (tx, notices) = mpsc::channel();
        let stage = MarkerStage::new(
            Box::new(MarkingDetector {
                calls: Arc::clone(&detector_calls),
            }),
            Box::new(ScriptedCalibrator {
                finds_pattern,
                corners: 0,
                gray_width: Arc::clone(&gray_width),
            }),
            store.clone(),
            tx,
        );
        let control = stage.control();
        Harness {
            stage,
            control,
            store,
            detector_calls,
            gray_width,
            notices,
        }
    }

    fn feed(stage: &mut MarkerStage) {
        let image = render_frame(
            TestPattern::GRAY,
            PreviewSize::new(8, 4),
            FrameFormat::default(),
            0,
        );
        let frame = FrameBuffer::from_image(&image).unwrap();
        stage.process(&frame);
    }

    #[test]
    fn test_detects_without_calibration() {
        let mut h = harness(true, MemoryStore::default());
        assert!(!h.stage.on_view_start("virtual0"));
        feed(&mut h.stage);

        assert_eq!(*h.detector_calls.lock().unwrap(), vec![false]);
        let latest = h.control.latest_frame().unwrap();
        assert_eq!(latest.dimensions(), (8, 4));
        assert_eq!(latest.get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(latest.get_pixel(1, 0).0, [128, 128, 128, 255]);
    }

    #[test]
    fn test_stored_calibration_is_loaded() {
        let store = MemoryStore::default();
        store
            .save("virtual0", &CameraCalibration::pinhole(700.0, 640, 480))
            .unwrap();
        let mut h = harness(true, store);

        assert!(h.stage.on_view_start("virtual0"));
        assert!(h.control.calibration_loaded());
        feed(&mut h.stage);
        assert_eq!(*h.detector_calls.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_calibration_runs_once_and_persists() {
        let mut h = harness(true, MemoryStore::default());
        h.stage.on_view_start("virtual0");
        h.control.request_calibration();

        feed(&mut h.stage);
        assert!(!h.control.calibration_pending());
        assert!(h.control.calibration_loaded());
        assert_eq!(*h.gray_width.lock().unwrap(), Some(8));
        assert!(h.detector_calls.lock().unwrap().is_empty());
        assert_eq!(
            h.notices.try_recv(),
            Ok(Notice::CalibrationSaved {
                device_id: "virtual0".into()
            })
        );
        assert!(h.store.load("virtual0").unwrap().is_some());

        // Back to detection, now with the calibration
        feed(&mut h.stage);
        assert_eq!(*h.detector_calls.lock().unwrap(), vec![true]);
        assert_eq!(h.control.frames(), 2);
    }

    #[test]
    fn test_pattern_not_found_notice() {
        let mut h = harness(false, MemoryStore::default());
        h.stage.on_view_start("virtual0");
        h.control.request_calibration();

        feed(&mut h.stage);
        assert_eq!(h.notices.try_recv(), Ok(Notice::PatternNotFound));
        assert!(!h.control.calibration_loaded());
        // The unannotated frame is still shown
        let latest = h.control.latest_frame().unwrap();
        assert_eq!(latest.get_pixel(0, 0).0, [128, 128, 128, 255]);
    }

    #[test]
    fn test_persistence_failure_keeps_calibration() {
        let store = MemoryStore {
            fail_save: true,
            ..MemoryStore::default()
        };
        let mut h = harness(true, store);
        h.stage.on_view_start("virtual0");
        h.control.request_calibration();

        feed(&mut h.stage);
        assert!(matches!(
            h.notices.try_recv(),
            Ok(Notice::CalibrationFailed(_))
        ));
        assert!(h.control.calibration().is_some());
    }
}
