// SPDX-License-Identifier: GPL-3.0-only

//! Video4Linux capture provider
//!
//! Every `/dev/video*` node that can capture NV12, NV21 or YV12 shows up as a
//! device. Frames are streamed from mmap buffers on a producer loop and copied
//! into the session's frame reader, so the kernel buffer is requeued right
//! away.

use super::frame_loop::{LoopAction, ProducerLoop};
use super::frame_reader::FrameProducer;
use super::session::{DeviceCallbacks, SessionCallbacks};
use super::types::*;
use super::v4l2_controls;
use super::{CameraProvider, CaptureSession, DeviceHandle};
use crate::constants::timing::DEQUEUE_TIMEOUT;
use crate::errors::CameraError;
use std::io;
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{Format, FourCC};

/// Layouts in order of preference
const PREFERRED_FOURCCS: [&[u8; 4]; 3] = [b"NV12", b"NV21", b"YV12"];

/// Sizes offered for nodes that report a stepwise size range
const STEPWISE_SIZES: [(u32, u32); 4] = [(640, 480), (1280, 720), (1920, 1080), (320, 240)];

/// mmap buffers queued with the driver
const STREAM_BUFFERS: u32 = 4;

/// Provider for V4L2 capture nodes
#[derive(Debug, Default)]
pub struct V4l2Provider;

impl V4l2Provider {
    pub fn new() -> Self {
        Self
    }
}

impl CameraProvider for V4l2Provider {
    fn name(&self) -> &str {
        "v4l2"
    }

    fn enumerate(&self) -> BackendResult<Vec<CameraDevice>> {
        let mut paths: Vec<String> = std::fs::read_dir("/dev")
            .map_err(|e| CameraError::Backend(format!("Cannot list /dev: {}", e)))?
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("video").then(|| format!("/dev/{}", name))
            })
            .collect();
        paths.sort();

        let devices: Vec<CameraDevice> = paths.iter().filter_map(|p| inspect_device(p)).collect();
        info!(count = devices.len(), "Enumerated V4L2 cameras");
        Ok(devices)
    }

    fn open(&self, device_id: &str, callbacks: DeviceCallbacks) -> BackendResult<()> {
        let device = Device::with_path(device_id).map_err(|e| open_error(device_id, &e))?;
        info!(device = %device_id, "V4L2 device opened");

        callbacks.opened(Box::new(V4l2Device {
            path: device_id.to_string(),
            device: Some(device),
            callbacks: callbacks.clone(),
        }));
        Ok(())
    }
}

fn open_error(path: &str, error: &io::Error) -> CameraError {
    match error.kind() {
        io::ErrorKind::PermissionDenied => CameraError::DeviceAccessDenied(path.to_string()),
        io::ErrorKind::NotFound => CameraError::DeviceDisconnected(path.to_string()),
        _ => CameraError::Backend(format!("{}: {}", path, error)),
    }
}

/// Query one node; `None` if it is not a usable capture device
fn inspect_device(path: &str) -> Option<CameraDevice> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps
        .capabilities
        .contains(v4l::capability::Flags::VIDEO_CAPTURE)
    {
        return None;
    }

    let formats = dev.enum_formats().ok()?;
    let (fourcc, format) = PREFERRED_FOURCCS.iter().find_map(|wanted| {
        formats
            .iter()
            .find(|f| &f.fourcc.repr == *wanted)
            .and_then(|f| FrameFormat::from_fourcc(&f.fourcc.repr).ok().map(|fmt| (f.fourcc, fmt)))
    })?;

    let mut sizes = Vec::new();
    for frame_size in dev.enum_framesizes(fourcc).ok()? {
        match frame_size.size {
            v4l::framesize::FrameSizeEnum::Discrete(discrete) => {
                sizes.push(PreviewSize::new(discrete.width, discrete.height));
            }
            v4l::framesize::FrameSizeEnum::Stepwise(step) => {
                for (w, h) in STEPWISE_SIZES {
                    if w >= step.min_width
                        && w <= step.max_width
                        && h >= step.min_height
                        && h <= step.max_height
                    {
                        sizes.push(PreviewSize::new(w, h));
                    }
                }
            }
        }
    }
    sizes.dedup();
    if sizes.is_empty() {
        debug!(path, "No frame sizes, skipping");
        return None;
    }

    debug!(path, card = %caps.card, format = %format, sizes = sizes.len(), "Found V4L2 camera");
    Some(CameraDevice {
        id: path.to_string(),
        name: caps.card,
        facing: LensFacing::External,
        output_sizes: sizes,
        format,
    })
}

struct V4l2Device {
    path: String,
    device: Option<Device>,
    callbacks: DeviceCallbacks,
}

impl DeviceHandle for V4l2Device {
    fn id(&self) -> &str {
        &self.path
    }

    fn create_session(
        &mut self,
        config: SessionConfig,
        output: FrameProducer,
        callbacks: SessionCallbacks,
    ) -> BackendResult<()> {
        let Some(dev) = self.device.as_ref() else {
            return Err(CameraError::Backend(format!("{} is closed", self.path)));
        };

        let fourcc = FourCC::new(&config.format.fourcc());
        let requested = Format::new(config.size.width, config.size.height, fourcc);
        let actual = match dev.set_format(&requested) {
            Ok(actual) => actual,
            Err(e) => {
                callbacks.configure_failed(format!("set_format: {}", e));
                return Ok(());
            }
        };

        if actual.width != config.size.width
            || actual.height != config.size.height
            || actual.fourcc != fourcc
        {
            callbacks.configure_failed(format!(
                "driver chose {}x{} {} instead of {} {}",
                actual.width, actual.height, actual.fourcc, config.size, config.format
            ));
            return Ok(());
        }

        let stride = (actual.stride as usize).max(config.size.width as usize);
        debug!(path = %self.path, size = %config.size, stride, "V4L2 format set");

        callbacks.configured(Box::new(V4l2Session {
            path: self.path.clone(),
            config,
            stride,
            output,
            device_callbacks: self.callbacks.clone(),
            producer: None,
        }));
        Ok(())
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            info!(path = %self.path, "V4L2 device closed");
        }
    }
}

struct V4l2Session {
    path: String,
    config: SessionConfig,
    stride: usize,
    output: FrameProducer,
    device_callbacks: DeviceCallbacks,
    producer: Option<ProducerLoop>,
}

/// Stream state living on the producer thread
struct StreamState {
    // Declared first so the buffers are unmapped before the node closes
    stream: MmapStream<'static>,
    _device: Device,
}

impl CaptureSession for V4l2Session {
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> BackendResult<()> {
        if let Some(mut producer) = self.producer.take() {
            producer.stop();
        }

        v4l2_controls::apply_capture_modes(&self.path, request);

        let path = self.path.clone();
        let size = self.config.size;
        let format = self.config.format;
        let stride = self.stride;
        let output = self.output.clone();
        let disconnect = self.device_callbacks.clone();
        let init_failed = self.device_callbacks.clone();

        let producer = ProducerLoop::start_with_init(
            &format!("v4l2-{}", self.path.trim_start_matches("/dev/")),
            move || {
                let device = Device::with_path(&path).map_err(|e| e.to_string())?;
                let mut stream =
                    MmapStream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS)
                        .map_err(|e| format!("Failed to create stream: {}", e))?;
                stream.set_timeout(DEQUEUE_TIMEOUT);
                Ok(StreamState {
                    stream,
                    _device: device,
                })
            },
            move |state, _stop| match state.stream.next() {
                Ok((buf, meta)) => {
                    let image = split_frame(buf, size, format, stride, meta.sequence as u64);
                    if output.submit(image) {
                        LoopAction::Continue
                    } else {
                        LoopAction::Stop
                    }
                }
                Err(e) => match stream_fault(&e) {
                    StreamFault::TimedOut => {
                        trace!("No frame within the dequeue timeout");
                        LoopAction::Continue
                    }
                    StreamFault::Gone => {
                        warn!(error = %e, "V4L2 device went away");
                        disconnect.disconnected();
                        LoopAction::Stop
                    }
                    StreamFault::Transient => {
                        warn!(error = %e, "Failed to capture frame");
                        LoopAction::Continue
                    }
                },
            },
            move |_| init_failed.error(DeviceErrorCode::Device),
        )
        .map_err(|e| CameraError::Backend(e.to_string()))?;

        self.producer = Some(producer);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut producer) = self.producer.take() {
            producer.stop();
            debug!(path = %self.path, "V4L2 stream stopped");
        }
    }
}

impl Drop for V4l2Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamFault {
    /// Nothing arrived in time; the loop checks its stop flag and waits again
    TimedOut,
    /// The node was unplugged
    Gone,
    Transient,
}

fn stream_fault(error: &io::Error) -> StreamFault {
    if error.kind() == io::ErrorKind::TimedOut {
        StreamFault::TimedOut
    } else if error.raw_os_error() == Some(libc::ENODEV) {
        StreamFault::Gone
    } else {
        StreamFault::Transient
    }
}

/// Wrap one driver buffer as a raw image
///
/// NV21 and YV12 stay a single contiguous plane. The two-plane layout is
/// split after the luma rows.
pub fn split_frame(
    buf: &[u8],
    size: PreviewSize,
    format: FrameFormat,
    stride: usize,
    sequence: u64,
) -> RawImage {
    let planes = match format {
        FrameFormat::Nv21 | FrameFormat::Yv12 => vec![Plane {
            data: buf.to_vec(),
            row_stride: stride,
            pixel_stride: 1,
        }],
        FrameFormat::Yuv420TwoPlane { .. } => {
            let luma_len = (size.height as usize * stride).min(buf.len());
            vec![
                Plane {
                    data: buf[..luma_len].to_vec(),
                    row_stride: stride,
                    pixel_stride: 1,
                },
                Plane {
                    data: buf[luma_len..].to_vec(),
                    row_stride: stride,
                    pixel_stride: 2,
                },
            ]
        }
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
