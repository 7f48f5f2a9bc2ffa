// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 camera controls for the repeating request
//!
//! Maps the autofocus and auto-exposure modes of a [`CaptureRequest`] onto
//! the UVC-style controls most capture nodes expose. Every control is
//! optional: a node without autofocus simply keeps its fixed focus.
//!
//! Inspired by [cameractrls](https://github.com/soyersoyer/cameractrls).

use super::types::{AeMode, AfMode, CaptureRequest};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use tracing::{debug, warn};

// ===== V4L2 Control Class Bases =====
const V4L2_CTRL_CLASS_CAMERA: u32 = 0x009a0000;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = V4L2_CTRL_CLASS_CAMERA | 0x900;

// ===== V4L2 Control IDs (Camera Class) =====

/// Exposure mode: Auto, Manual, Shutter Priority, Aperture Priority
pub const V4L2_CID_EXPOSURE_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 1;
/// Allow frame rate variation during auto exposure
pub const V4L2_CID_EXPOSURE_AUTO_PRIORITY: u32 = V4L2_CID_CAMERA_CLASS_BASE + 3;
/// Auto focus enable
pub const V4L2_CID_FOCUS_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 12;

// ===== V4L2 Exposure Auto Menu Values =====

/// Automatic exposure time and iris
pub const V4L2_EXPOSURE_AUTO: i32 = 0;
/// Manual exposure time and iris
pub const V4L2_EXPOSURE_MANUAL: i32 = 1;
/// Auto exposure time, manual iris (aperture priority)
pub const V4L2_EXPOSURE_APERTURE_PRIORITY: i32 = 3;

// ===== V4L2 Control Flags =====
const V4L2_CTRL_FLAG_DISABLED: u32 = 0x0001;

// ===== V4L2 ioctl Numbers =====
// Calculated as: (dir << 30) | (size << 16) | ('V' << 8) | nr

/// Set control value (v4l2_control: 8 bytes)
const VIDIOC_S_CTRL: libc::c_ulong = 0xC008561C;
/// Query control info (v4l2_queryctrl: 68 bytes)
const VIDIOC_QUERYCTRL: libc::c_ulong = 0xC0445624;

#[repr(C)]
struct V4l2Control {
    id: u32,
    value: i32,
}

#[repr(C)]
struct V4l2Queryctrl {
    id: u32,
    ctrl_type: u32,
    name: [u8; 32],
    minimum: i32,
    maximum: i32,
    step: i32,
    default_value: i32,
    flags: u32,
    reserved: [u32; 2],
}

/// Range and state of a V4L2 control
#[derive(Debug, Clone)]
pub struct ControlInfo {
    pub id: u32,
    pub name: String,
    pub minimum: i32,
    pub maximum: i32,
    pub flags: u32,
}

impl ControlInfo {
    pub fn is_disabled(&self) -> bool {
        self.flags & V4L2_CTRL_FLAG_DISABLED != 0
    }

    pub fn accepts(&self, value: i32) -> bool {
        value >= self.minimum && value <= self.maximum
    }
}

fn extract_name(bytes: &[u8; 32]) -> String {
    let name_len = bytes.iter().position(|&c| c == 0).unwrap_or(32);
    String::from_utf8_lossy(&bytes[..name_len]).to_string()
}

/// Query if a control exists and get its information
pub fn query_control(device_path: &str, control_id: u32) -> Option<ControlInfo> {
    let file = File::open(device_path).ok()?;

    let mut qctrl = V4l2Queryctrl {
        id: control_id,
        ctrl_type: 0,
        name: [0; 32],
        minimum: 0,
        maximum: 0,
        step: 0,
        default_value: 0,
        flags: 0,
        reserved: [0; 2],
    };

    let result = unsafe {
        libc::ioctl(
            file.as_raw_fd(),
            VIDIOC_QUERYCTRL,
            &mut qctrl as *mut V4l2Queryctrl,
        )
    };
    if result < 0 {
        return None;
    }

    Some(ControlInfo {
        id: qctrl.id,
        name: extract_name(&qctrl.name),
        minimum: qctrl.minimum,
        maximum: qctrl.maximum,
        flags: qctrl.flags,
    })
}

/// Set value of a control
pub fn set_control(device_path: &str, control_id: u32, value: i32) -> Result<(), String> {
    let file = File::open(device_path).map_err(|e| format!("Failed to open device: {}", e))?;

    let mut ctrl = V4l2Control {
        id: control_id,
        value,
    };

    let result =
        unsafe { libc::ioctl(file.as_raw_fd(), VIDIOC_S_CTRL, &mut ctrl as *mut V4l2Control) };

    if result < 0 {
        let errno = std::io::Error::last_os_error();
        return Err(format!("Failed to set control: {}", errno));
    }
    Ok(())
}

/// Value for `V4L2_CID_FOCUS_AUTO`
pub fn focus_auto_value(mode: AfMode) -> i32 {
    match mode {
        AfMode::Off => 0,
        AfMode::ContinuousPicture | AfMode::ContinuousVideo => 1,
    }
}

/// Candidate values for `V4L2_CID_EXPOSURE_AUTO`, most preferred first
///
/// UVC cameras usually reject full auto and only offer aperture priority.
pub fn exposure_auto_values(mode: AeMode) -> &'static [i32] {
    match mode {
        AeMode::Off => &[V4L2_EXPOSURE_MANUAL],
        AeMode::On | AeMode::OnAutoFlash => {
            &[V4L2_EXPOSURE_AUTO, V4L2_EXPOSURE_APERTURE_PRIORITY]
        }
    }
}

/// Apply the request's focus and exposure modes, best effort
///
/// Returns the number of controls that were set.
pub fn apply_capture_modes(device_path: &str, request: &CaptureRequest) -> usize {
    let mut applied = 0;

    if let Some(info) = query_control(device_path, V4L2_CID_FOCUS_AUTO)
        && !info.is_disabled()
    {
        let value = focus_auto_value(request.af_mode);
        match set_control(device_path, V4L2_CID_FOCUS_AUTO, value) {
            Ok(()) => applied += 1,
            Err(e) => warn!(device_path, error = %e, "Could not set autofocus"),
        }
    } else {
        debug!(device_path, "No autofocus control");
    }

    if let Some(info) = query_control(device_path, V4L2_CID_EXPOSURE_AUTO)
        && !info.is_disabled()
    {
        let accepted = exposure_auto_values(request.ae_mode)
            .iter()
            .filter(|v| info.accepts(**v))
            .any(|v| set_control(device_path, V4L2_CID_EXPOSURE_AUTO, *v).is_ok());
        if accepted {
            applied += 1;
        } else {
            warn!(device_path, mode = ?request.ae_mode, "Could not set exposure mode");
        }
    }

    // Let auto exposure lower the frame rate in dim light
    if request.ae_mode != AeMode::Off
        && query_control(device_path, V4L2_CID_EXPOSURE_AUTO_PRIORITY).is_some()
        && set_control(device_path, V4L2_CID_EXPOSURE_AUTO_PRIORITY, 1).is_ok()
    {
        applied += 1;
    }

    debug!(device_path, applied, "Applied capture controls");
    applied
}
