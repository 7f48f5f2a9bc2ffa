// SPDX-License-Identifier: MPL-2.0

//! Integration tests for the marker stage running behind the preview
//! pipeline on the synthetic camera

use image::RgbaImage;
use marker_camera::backends::camera::TestPattern;
use marker_camera::{
    CalibrationStore, CameraCalibration, Config, JsonCalibrationStore, MarkerDetector,
    MarkerStage, NoPatternCalibrator, Notice, PassthroughDetector, PreviewPipeline,
    VirtualCameraProvider,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn provider() -> Arc<VirtualCameraProvider> {
    Arc::new(
        VirtualCameraProvider::default()
            .with_pattern(TestPattern::GRAY)
            .with_frame_interval(Duration::from_millis(5)),
    )
}

fn calibration_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "marker-camera-calibration-{}-{}",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Start a pipeline and install a marker stage for the selected device
fn start_stage(
    config: Config,
    detector: Box<dyn MarkerDetector>,
) -> (PreviewPipeline, marker_camera::MarkerControl, bool) {
    let mut pipeline = PreviewPipeline::new(provider(), config);
    assert!(pipeline.start(640, 480));

    let device_id = pipeline.device().map(|d| d.id.clone()).unwrap();
    let dir = pipeline.config().calibration_dir().unwrap();
    let mut stage = MarkerStage::new(
        detector,
        Box::new(NoPatternCalibrator),
        Arc::new(JsonCalibrationStore::new(dir)),
        pipeline.notice_sender(),
    );
    let loaded = stage.on_view_start(&device_id);
    let control = stage.control();
    pipeline.deliver_frame(stage.into_callback());
    (pipeline, control, loaded)
}

#[test]
fn test_stage_publishes_live_frames_and_reports_missing_pattern() {
    let config = Config {
        calibration_dir: Some(calibration_dir("live")),
        ..Config::default()
    };
    let (mut pipeline, control, loaded) = start_stage(config, Box::new(PassthroughDetector));
    assert!(!loaded);

    assert!(wait_until(|| control.frames() >= 3));
    let latest = control.latest_frame().unwrap();
    assert_eq!(latest.dimensions(), (640, 480));
    assert!(latest.pixels().all(|p| p.0 == [128, 128, 128, 255]));

    control.request_calibration();
    let mut notices = Vec::new();
    assert!(wait_until(|| {
        notices.extend(pipeline.drain_notices());
        notices.contains(&Notice::PatternNotFound)
    }));
    assert!(!control.calibration_pending());
    assert!(!control.calibration_loaded());

    pipeline.stop().unwrap();
}

/// Records whether any frame was detected with a calibration
struct CalibrationAwareDetector {
    calibrated: Arc<AtomicBool>,
}

impl MarkerDetector for CalibrationAwareDetector {
    fn detect(&mut self, frame: &RgbaImage, calibration: Option<&CameraCalibration>) -> RgbaImage {
        if calibration.is_some() {
            self.calibrated.store(true, Ordering::SeqCst);
        }
        frame.clone()
    }
}

#[test]
fn test_stored_calibration_reaches_the_detector() {
    let dir = calibration_dir("stored");
    JsonCalibrationStore::new(&dir)
        .save("virtual0", &CameraCalibration::pinhole(600.0, 640, 480))
        .unwrap();

    let calibrated = Arc::new(AtomicBool::new(false));
    let config = Config {
        calibration_dir: Some(dir),
        ..Config::default()
    };
    let (mut pipeline, control, loaded) = start_stage(
        config,
        Box::new(CalibrationAwareDetector {
            calibrated: Arc::clone(&calibrated),
        }),
    );

    assert!(loaded);
    assert!(control.calibration_loaded());
    assert!(wait_until(|| calibrated.load(Ordering::SeqCst)));
    assert_eq!(
        control.calibration().map(|c| c.focal_length()),
        Some((600.0, 600.0))
    );

    pipeline.stop().unwrap();
}
