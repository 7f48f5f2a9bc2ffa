// SPDX-License-Identifier: GPL-3.0-only

//! Synthetic camera provider
//!
//! Produces test-pattern frames in any of the supported 4:2:0 layouts and
//! reports device and session results asynchronously, the way hardware does.
//! A [`FaultPlan`] injects the failures the pipeline has to survive: refused
//! access, session configuration failure and a disconnect mid-stream.
//! [`VirtualCounters`] track every open and close so leaks show up in tests.

use super::frame_loop::{FramePacer, LoopAction, ProducerLoop};
use super::frame_reader::FrameProducer;
use super::session::{DeviceCallbacks, SessionCallbacks};
use super::types::*;
use super::{CameraProvider, CaptureSession, DeviceHandle};
use crate::constants::virtual_camera::{DEFAULT_SIZES, FRAME_INTERVAL};
use crate::errors::CameraError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Picture the synthetic camera renders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestPattern {
    /// Every sample set to the given values
    Flat { y: u8, u: u8, v: u8 },
    /// Moving luma ramp with a chroma gradient
    #[default]
    Gradient,
}

impl TestPattern {
    /// Neutral gray
    pub const GRAY: TestPattern = TestPattern::Flat {
        y: 128,
        u: 128,
        v: 128,
    };
}

/// Failures to inject into the synthetic devices
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Refuse `open` as if the camera permission were missing
    pub deny_access: bool,
    /// Report every session configuration as failed
    pub fail_configure: bool,
    /// Report the device as disconnected after this many frames
    pub disconnect_after: Option<u64>,
    /// Delay before the opened callback fires
    pub open_delay: Duration,
}

/// Lifecycle counters shared by all devices of one provider
#[derive(Debug, Default)]
pub struct VirtualCounters {
    devices_opened: AtomicU64,
    devices_closed: AtomicU64,
    sessions_created: AtomicU64,
    sessions_closed: AtomicU64,
    frames_produced: AtomicU64,
}

impl VirtualCounters {
    pub fn devices_opened(&self) -> u64 {
        self.devices_opened.load(Ordering::SeqCst)
    }

    pub fn devices_closed(&self) -> u64 {
        self.devices_closed.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced.load(Ordering::SeqCst)
    }

    /// Devices opened and not yet closed
    pub fn open_devices(&self) -> u64 {
        self.devices_opened().saturating_sub(self.devices_closed())
    }

    /// Sessions created and not yet closed
    pub fn open_sessions(&self) -> u64 {
        self.sessions_created().saturating_sub(self.sessions_closed())
    }
}

/// Provider backed by generated frames
pub struct VirtualCameraProvider {
    devices: Vec<CameraDevice>,
    pattern: TestPattern,
    frame_interval: Duration,
    faults: Arc<Mutex<FaultPlan>>,
    counters: Arc<VirtualCounters>,
}

impl Default for VirtualCameraProvider {
    fn default() -> Self {
        Self::new(Self::default_devices())
    }
}

impl VirtualCameraProvider {
    pub fn new(devices: Vec<CameraDevice>) -> Self {
        Self {
            devices,
            pattern: TestPattern::default(),
            frame_interval: FRAME_INTERVAL,
            faults: Arc::default(),
            counters: Arc::default(),
        }
    }

    /// A back camera delivering two-plane frames and a front camera
    /// delivering legacy NV21
    pub fn default_devices() -> Vec<CameraDevice> {
        let sizes: Vec<PreviewSize> = DEFAULT_SIZES.iter().copied().map(PreviewSize::from).collect();
        vec![
            CameraDevice {
                id: "virtual0".to_string(),
                name: "Synthetic Back Camera".to_string(),
                facing: LensFacing::Back,
                output_sizes: sizes.clone(),
                format: FrameFormat::default(),
            },
            CameraDevice {
                id: "virtual1".to_string(),
                name: "Synthetic Front Camera".to_string(),
                facing: LensFacing::Front,
                output_sizes: sizes,
                format: FrameFormat::Nv21,
            },
        ]
    }

    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_faults(self, faults: FaultPlan) -> Self {
        self.set_faults(faults);
        self
    }

    /// Replace the fault plan
    ///
    /// Access and open faults apply to the next open, configure and
    /// disconnect faults to the next session of any device.
    pub fn set_faults(&self, faults: FaultPlan) {
        *self.faults.lock().unwrap_or_else(|e| e.into_inner()) = faults;
    }

    pub fn counters(&self) -> Arc<VirtualCounters> {
        Arc::clone(&self.counters)
    }
}

impl CameraProvider for VirtualCameraProvider {
    fn name(&self) -> &str {
        "virtual"
    }

    fn enumerate(&self) -> BackendResult<Vec<CameraDevice>> {
        debug!(count = self.devices.len(), "Enumerated synthetic cameras");
        Ok(self.devices.clone())
    }

    fn open(&self, device_id: &str, callbacks: DeviceCallbacks) -> BackendResult<()> {
        let info = self
            .devices
            .iter()
            .find(|d| d.id == device_id)
            .cloned()
            .ok_or_else(|| CameraError::Backend(format!("unknown device {}", device_id)))?;

        let faults = self.faults.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if faults.deny_access {
            warn!(device = %device_id, "Synthetic camera refusing access");
            return Err(CameraError::DeviceAccessDenied(device_id.to_string()));
        }

        let device = VirtualDevice {
            info,
            pattern: self.pattern,
            frame_interval: self.frame_interval,
            faults: Arc::clone(&self.faults),
            counters: Arc::clone(&self.counters),
            callbacks: callbacks.clone(),
            closed: false,
        };
        let delay = faults.open_delay;
        let counters = Arc::clone(&self.counters);

        thread::Builder::new()
            .name("virtual-camera-open".to_string())
            .spawn(move || {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                counters.devices_opened.fetch_add(1, Ordering::SeqCst);
                info!(device = %device.info.id, "Synthetic camera opened");
                callbacks.opened(Box::new(device));
            })
            .map_err(|e| CameraError::Backend(e.to_string()))?;

        Ok(())
    }
}

struct VirtualDevice {
    info: CameraDevice,
    pattern: TestPattern,
    frame_interval: Duration,
    faults: Arc<Mutex<FaultPlan>>,
    counters: Arc<VirtualCounters>,
    callbacks: DeviceCallbacks,
    closed: bool,
}

impl DeviceHandle for VirtualDevice {
    fn id(&self) -> &str {
        &self.info.id
    }

    fn create_session(
        &mut self,
        config: SessionConfig,
        output: FrameProducer,
        callbacks: SessionCallbacks,
    ) -> BackendResult<()> {
        if self.closed {
            return Err(CameraError::Backend(format!("{} is closed", self.info.id)));
        }
        if !self.info.output_sizes.contains(&config.size) {
            callbacks.configure_failed(format!("unsupported size {}", config.size));
            return Ok(());
        }
        let faults = self.faults.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if faults.fail_configure {
            callbacks.configure_failed("injected configure failure");
            return Ok(());
        }

        self.counters.sessions_created.fetch_add(1, Ordering::SeqCst);
        callbacks.configured(Box::new(VirtualSession {
            device_id: self.info.id.clone(),
            config,
            output,
            pattern: self.pattern,
            frame_interval: self.frame_interval,
            disconnect_after: faults.disconnect_after,
            device_callbacks: self.callbacks.clone(),
            counters: Arc::clone(&self.counters),
            producer: None,
            closed: false,
        }));
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.devices_closed.fetch_add(1, Ordering::SeqCst);
            debug!(device = %self.info.id, "Synthetic camera closed");
        }
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        self.close();
    }
}

struct VirtualSession {
    device_id: String,
    config: SessionConfig,
    output: FrameProducer,
    pattern: TestPattern,
    frame_interval: Duration,
    disconnect_after: Option<u64>,
    device_callbacks: DeviceCallbacks,
    counters: Arc<VirtualCounters>,
    producer: Option<ProducerLoop>,
    closed: bool,
}

impl CaptureSession for VirtualSession {
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> BackendResult<()> {
        if self.closed {
            return Err(CameraError::Backend("session closed".to_string()));
        }
        if let Some(mut producer) = self.producer.take() {
            producer.stop();
        }

        debug!(
            size = %request.size,
            af = ?request.af_mode,
            ae = ?request.ae_mode,
            "Synthetic repeating request"
        );

        let output = self.output.clone();
        let pattern = self.pattern;
        let size = self.config.size;
        let format = self.config.format;
        let disconnect_after = self.disconnect_after;
        let device_callbacks = self.device_callbacks.clone();
        let counters = Arc::clone(&self.counters);
        let mut pacer = FramePacer::new(self.frame_interval);
        let mut sequence = 0u64;

        let producer = ProducerLoop::start(&format!("virtual-{}", self.device_id), move |stop| {
            if !pacer.wait(stop) || output.is_closed() {
                return LoopAction::Stop;
            }

            output.submit(render_frame(pattern, size, format, sequence));
            counters.frames_produced.fetch_add(1, Ordering::SeqCst);
            sequence += 1;

            if disconnect_after.is_some_and(|limit| sequence >= limit) {
                warn!(frames = sequence, "Injected disconnect");
                device_callbacks.disconnected();
                return LoopAction::Stop;
            }
            LoopAction::Continue
        })
        .map_err(|e| CameraError::Backend(e.to_string()))?;

        self.producer = Some(producer);
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut producer) = self.producer.take() {
            producer.stop();
        }
        self.counters.sessions_closed.fetch_add(1, Ordering::SeqCst);
        debug!(device = %self.device_id, "Synthetic session closed");
    }
}

impl Drop for VirtualSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Render one synthetic frame in the requested layout
///
/// Rows are tightly packed (row stride equals width).
pub fn render_frame(
    pattern: TestPattern,
    size: PreviewSize,
    format: FrameFormat,
    sequence: u64,
) -> RawImage {
    let w = size.width as usize;
    let h = size.height as usize;
    let (cw, ch) = (w / 2, h / 2);

    let luma: Vec<u8> = match pattern {
        TestPattern::Flat { y, .. } => vec![y; w * h],
        TestPattern::Gradient => (0..h)
            .flat_map(|row| {
                (0..w).map(move |col| ((col * 255 / w.max(1)) as u64 + row as u64 + sequence) as u8)
            })
            .collect(),
    };

    let chroma_at = |cx: usize, cy: usize| -> (u8, u8) {
        match pattern {
            TestPattern::Flat { u, v, .. } => (u, v),
            TestPattern::Gradient => (
                (cx * 255 / cw.max(1)) as u8,
                (cy * 255 / ch.max(1)) as u8,
            ),
        }
    };

    let interleaved = |order: ChromaOrder| -> Vec<u8> {
        let mut out = Vec::with_capacity(cw * ch * 2);
        for cy in 0..ch {
            for cx in 0..cw {
                let (u, v) = chroma_at(cx, cy);
                match order {
                    ChromaOrder::Uv => out.extend_from_slice(&[u, v]),
                    ChromaOrder::Vu => out.extend_from_slice(&[v, u]),
                }
            }
        }
        out
    };

    let planes = match format {
        FrameFormat::Nv21 => {
            let mut data = luma;
            data.extend(interleaved(ChromaOrder::Vu));
            vec![Plane {
                data,
                row_stride: w,
                pixel_stride: 1,
            }]
        }
        FrameFormat::Yv12 => {
            // Chroma planes stored in the order the I420 decode path reads them
            let positions = || (0..ch).flat_map(move |cy| (0..cw).map(move |cx| (cx, cy)));
            let mut data = luma;
            data.extend(positions().map(|(cx, cy)| chroma_at(cx, cy).0));
            data.extend(positions().map(|(cx, cy)| chroma_at(cx, cy).1));
            vec![Plane {
                data,
                row_stride: w,
                pixel_stride: 1,
            }]
        }
        FrameFormat::Yuv420TwoPlane { chroma } => vec![
            Plane {
                data: luma,
                row_stride: w,
                pixel_stride: 1,
            },
            Plane {
                data: interleaved(chroma),
                row_stride: w,
                pixel_stride: 2,
            },
        ],
    };

    RawImage {
        width: size.width,
        height: size.height,
        format,
        planes,
        sequence,
        captured_at: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::capture_thread::WorkerHandle;
    use crate::backends::camera::session::{ControllerMessage, DeviceEvent};
    use crate::media::FrameBuffer;

    const FORMATS: [FrameFormat; 3] = [
        FrameFormat::Nv21,
        FrameFormat::Yv12,
        FrameFormat::Yuv420TwoPlane {
            chroma: ChromaOrder::Vu,
        },
    ];

    #[test]
    fn test_rendered_layouts_are_valid() {
        for format in FORMATS {
            let image = render_frame(TestPattern::Gradient, PreviewSize::new(64, 48), format, 5);
            let frame = FrameBuffer::from_image(&image).unwrap();
            assert_eq!(frame.color().dimensions(), (64, 48));
        }
    }

    #[test]
    fn test_flat_gray_converts_to_gray() {
        for format in FORMATS {
            let image = render_frame(TestPattern::GRAY, PreviewSize::new(8, 8), format, 0);
            let frame = FrameBuffer::from_image(&image).unwrap();
            assert!(frame.color().pixels().all(|p| p.0 == [128, 128, 128, 255]));
        }
    }

    #[test]
    fn test_colours_agree_across_layouts() {
        let pattern = TestPattern::Flat { y: 90, u: 60, v: 200 };
        let reference = render_frame(pattern, PreviewSize::new(4, 4), FORMATS[0], 0);
        let expected = FrameBuffer::from_image(&reference).unwrap().color().clone();

        for format in &FORMATS[1..] {
            let image = render_frame(pattern, PreviewSize::new(4, 4), *format, 0);
            let frame = FrameBuffer::from_image(&image).unwrap();
            assert_eq!(frame.color(), &expected, "{}", format);
        }
    }

    #[test]
    fn test_denied_open_is_synchronous() {
        let provider = VirtualCameraProvider::default().with_faults(FaultPlan {
            deny_access: true,
            ..FaultPlan::default()
        });
        let (worker, _rx) = WorkerHandle::detached("virtual-test");

        let result = provider.open("virtual0", DeviceCallbacks::new(worker, 1));
        assert!(matches!(result, Err(CameraError::DeviceAccessDenied(_))));
        assert_eq!(provider.counters().devices_opened(), 0);
    }

    #[test]
    fn test_open_reports_through_callbacks() {
        let provider = VirtualCameraProvider::default();
        let counters = provider.counters();
        let (worker, rx) = WorkerHandle::detached("virtual-test");

        provider
            .open("virtual1", DeviceCallbacks::new(worker, 7))
            .unwrap();

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            ControllerMessage::Device {
                generation,
                event: DeviceEvent::Opened(mut device),
            } => {
                assert_eq!(generation, 7);
                assert_eq!(device.id(), "virtual1");
                assert_eq!(counters.open_devices(), 1);
                device.close();
                device.close();
            }
            _ => panic!("expected an opened callback"),
        }
        assert_eq!(counters.open_devices(), 0);
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        let provider = VirtualCameraProvider::default();
        let (worker, _rx) = WorkerHandle::detached("virtual-test");
        assert!(provider.open("nope", DeviceCallbacks::new(worker, 1)).is_err());
    }
}
