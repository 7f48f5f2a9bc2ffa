// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for camera operations
//!
//! This module provides command-line functionality for:
//! - Listing available cameras
//! - Running the preview pipeline headless
//! - Running marker detection, with an optional calibration request
//! - Saving a single converted frame

use chrono::Local;
use marker_camera::backends::camera::{ProviderKind, provider_for};
use marker_camera::constants::get_resolution_label;
use marker_camera::constants::timing::{SNAPSHOT_TIMEOUT, SNAPSHOT_WARMUP};
use marker_camera::{
    CameraProvider, Config, DeviceSelector, JsonCalibrationStore, MarkerStage, NoPatternCalibrator,
    Notice, PassthroughDetector, PreviewPipeline, SessionState,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

/// Default folder name for saved snapshots
const DEFAULT_SAVE_FOLDER: &str = "marker-camera";

/// Flags shared by every subcommand
pub struct Options {
    pub use_virtual: bool,
    pub config: Option<PathBuf>,
    pub device: Option<String>,
}

impl Options {
    fn provider(&self) -> Arc<dyn CameraProvider> {
        if self.use_virtual {
            provider_for(ProviderKind::Virtual)
        } else {
            provider_for(ProviderKind::V4l2)
        }
    }

    fn config(&self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };
        if let Some(id) = &self.device {
            config.device = DeviceSelector::Id(id.clone());
        }
        Ok(config)
    }
}

/// List all available cameras
pub fn list_cameras(options: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let provider = options.provider();
    let cameras = provider.enumerate()?;

    if cameras.is_empty() {
        println!("No cameras found.");
        return Ok(());
    }

    println!("Available cameras ({}):", provider.name());
    println!();
    for camera in &cameras {
        println!("  [{}] {}", camera.id, camera.name);
        println!("      Facing: {}", camera.facing);
        println!("      Format: {}", camera.format);

        // Largest first
        let mut sizes = camera.output_sizes.clone();
        sizes.sort_by_key(|s| std::cmp::Reverse(s.pixel_count()));
        let size_strs: Vec<String> = sizes
            .iter()
            .map(|s| match get_resolution_label(s.width) {
                Some(label) => format!("{} ({})", s, label),
                None => s.to_string(),
            })
            .collect();
        println!("      Sizes: {}", size_strs.join(", "));
        println!();
    }

    Ok(())
}

/// Run the preview pipeline for `duration` seconds and print throughput
pub fn run_preview(
    options: &Options,
    width: u32,
    height: u32,
    duration: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut pipeline = PreviewPipeline::new(options.provider(), options.config()?);

    let frames = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&frames);
    pipeline.deliver_frame(move |frame| {
        // Touch both views so conversion cost is part of the measurement
        let _ = frame.gray();
        let _ = frame.color();
        counter.fetch_add(1, Ordering::Relaxed);
    });

    if !pipeline.start(width, height) {
        let reason = pipeline
            .last_error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(format!("Failed to start preview: {}", reason).into());
    }

    if let Some(device) = pipeline.device() {
        println!("Using camera: {} ({})", device.name, device.id);
    }
    if let Some(size) = pipeline.preview_size() {
        println!(
            "Preview size: {} for a {}x{} display (scale {:.2})",
            size,
            width,
            height,
            pipeline.scale()
        );
    }

    // Set up Ctrl+C handler
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    println!("Previewing... (press Ctrl+C to stop early)");
    let start = Instant::now();
    let target_duration = Duration::from_secs(duration);

    while start.elapsed() < target_duration {
        if stop_flag.load(Ordering::SeqCst) {
            println!();
            println!("Stopping early...");
            break;
        }
        if pipeline.state() == SessionState::Closed {
            println!();
            println!("Camera closed unexpectedly");
            break;
        }

        let elapsed = start.elapsed().as_secs_f64();
        let count = frames.load(Ordering::Relaxed);
        print!(
            "\r{:>6.1}s  {:>6} frames  {:>5.1} fps  [{}]",
            elapsed,
            count,
            count as f64 / elapsed.max(0.001),
            pipeline.state()
        );
        std::io::Write::flush(&mut std::io::stdout())?;

        std::thread::sleep(Duration::from_millis(250));
    }
    println!();

    let elapsed = start.elapsed().as_secs_f64();
    pipeline.stop()?;

    let status = pipeline.status();
    println!(
        "Delivered {} frames in {:.1}s ({:.1} fps), {} dropped, {} failed",
        status.frames_delivered,
        elapsed,
        status.frames_delivered as f64 / elapsed.max(0.001),
        status.frames_dropped,
        status.frames_failed
    );
    if let Some(error) = status.last_error {
        println!("Last error: {}", error);
    }

    Ok(())
}

/// Run the marker stage on live frames for `duration` seconds
///
/// Calibrations are loaded from and saved to the configured calibration
/// directory. With `output`, the last processed frame is written as PNG.
pub fn detect(
    options: &Options,
    width: u32,
    height: u32,
    duration: u64,
    calibrate: bool,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = options.config()?;
    let calibration_dir = config
        .calibration_dir()
        .ok_or("No data directory for calibrations; set calibration_dir in the config")?;
    let store = Arc::new(JsonCalibrationStore::new(calibration_dir));
    let mut pipeline = PreviewPipeline::new(options.provider(), config);

    if !pipeline.start(width, height) {
        let reason = pipeline
            .last_error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(format!("Failed to start camera: {}", reason).into());
    }
    let device_id = pipeline
        .device()
        .map(|d| d.id.clone())
        .ok_or("No camera selected")?;

    let mut stage = MarkerStage::new(
        Box::new(PassthroughDetector),
        Box::new(NoPatternCalibrator),
        store.clone(),
        pipeline.notice_sender(),
    );
    let calibrated = stage.on_view_start(&device_id);
    let control = stage.control();
    pipeline.deliver_frame(stage.into_callback());

    println!(
        "Detecting on {} ({}), calibration {} in {}",
        device_id,
        pipeline.preview_size().map(|s| s.to_string()).unwrap_or_default(),
        if calibrated { "loaded" } else { "missing" },
        store.dir().display()
    );
    if calibrate {
        control.request_calibration();
    }

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    let start = Instant::now();
    let target_duration = Duration::from_secs(duration);
    while start.elapsed() < target_duration && !stop_flag.load(Ordering::SeqCst) {
        if pipeline.state() == SessionState::Closed {
            println!();
            println!("Camera closed unexpectedly");
            break;
        }
        for notice in pipeline.drain_notices() {
            println!();
            match notice {
                Notice::PatternNotFound => println!("Calibration pattern not found"),
                Notice::CalibrationSaved { device_id } => {
                    println!("Calibration saved for {}", device_id)
                }
                Notice::CalibrationFailed(reason) => println!("Calibration failed: {}", reason),
                Notice::PermissionDenied => println!("Camera permission denied"),
            }
        }
        print!(
            "\r{:>6.1}s  {:>6} frames processed",
            start.elapsed().as_secs_f64(),
            control.frames()
        );
        std::io::Write::flush(&mut std::io::stdout())?;
        std::thread::sleep(Duration::from_millis(250));
    }
    println!();

    pipeline.stop()?;
    println!("Processed {} frames", control.frames());

    if let Some(path) = output {
        let frame = control
            .latest_frame()
            .ok_or("No frame was processed")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        frame.save_with_format(&path, image::ImageFormat::Png)?;
        println!("Last frame saved: {}", path.display());
    }

    Ok(())
}

/// Save one frame, taken after a short warm-up, as PNG
pub fn snapshot(
    options: &Options,
    width: u32,
    height: u32,
    gray: bool,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut pipeline = PreviewPipeline::new(options.provider(), options.config()?);

    let (sender, receiver) = mpsc::sync_channel::<image::DynamicImage>(1);
    let started = Instant::now();
    pipeline.deliver_frame(move |frame| {
        // Let auto exposure settle before keeping a frame
        if started.elapsed() < SNAPSHOT_WARMUP {
            return;
        }
        let image = if gray {
            image::DynamicImage::ImageLuma8(frame.gray().to_image())
        } else {
            image::DynamicImage::ImageRgba8(frame.color().clone())
        };
        let _ = sender.try_send(image);
    });

    if !pipeline.start(width, height) {
        let reason = pipeline
            .last_error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(format!("Failed to start camera: {}", reason).into());
    }

    println!("Capturing...");
    let image = receiver.recv_timeout(SNAPSHOT_WARMUP + SNAPSHOT_TIMEOUT);
    pipeline.stop()?;
    let image = image.map_err(|_| "Failed to capture frame from camera")?;

    let output_path = match output {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            path
        }
        None => {
            let dir = get_default_snapshot_dir();
            std::fs::create_dir_all(&dir)?;
            let timestamp = Local::now().format("%Y%m%d_%H%M%S");
            dir.join(format!("snapshot_{}.png", timestamp))
        }
    };

    image.save_with_format(&output_path, image::ImageFormat::Png)?;
    println!(
        "Snapshot saved: {} ({}x{})",
        output_path.display(),
        image.width(),
        image.height()
    );
    Ok(())
}

/// Get default snapshot directory
fn get_default_snapshot_dir() -> PathBuf {
    dirs::picture_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(DEFAULT_SAVE_FOLDER)
}
