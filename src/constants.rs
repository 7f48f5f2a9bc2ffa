// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline-wide constants

use std::time::Duration;

/// Output size negotiation
pub mod negotiation {
    /// Maximum absolute difference between the requested and candidate aspect ratios
    pub const ASPECT_TOLERANCE: f32 = 0.2;
}

/// Capture worker and frame queue constants
pub mod capture {
    /// Name given to the dedicated camera worker thread
    pub const WORKER_THREAD_NAME: &str = "MarkerCameraBackground";

    /// Images the frame reader may hold at once (queued + acquired).
    /// Anything beyond this is dropped in favour of the newest frame.
    pub const MAX_IMAGES: usize = 2;
}

/// Timing constants
pub mod timing {
    use super::Duration;

    /// Frame counter modulo for periodic logging
    pub const FRAME_LOG_INTERVAL: u64 = 30;

    /// Status poll interval while waiting for a session state
    pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

    /// Longest a V4L2 dequeue blocks before the producer rechecks its stop flag
    pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

    /// Camera warm-up before the CLI takes a snapshot
    pub const SNAPSHOT_WARMUP: Duration = Duration::from_millis(500);

    /// Give up on a snapshot if no frame arrives in this time
    pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Synthetic camera defaults
pub mod virtual_camera {
    use super::Duration;

    /// Frame interval of the synthetic producer (~30 fps)
    pub const FRAME_INTERVAL: Duration = Duration::from_millis(33);

    /// Output sizes advertised by the default synthetic devices
    pub const DEFAULT_SIZES: &[(u32, u32)] = &[
        (320, 240),
        (640, 480),
        (1280, 720),
        (1920, 1080),
    ];
}

/// Resolution labels for device listings
pub fn get_resolution_label(width: u32) -> Option<&'static str> {
    match width {
        w if w >= 3840 => Some("4K"), // 3840x2160
        w if w >= 2560 => Some("2K"), // 2560x1440
        w if w >= 1920 => Some("HD"), // 1920x1080
        w if w >= 640 => Some("SD"),  // 640x480
        _ => None,
    }
}

/// Application information utilities
pub mod app_info {
    /// Get the application version from build-time environment
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_labels() {
        assert_eq!(get_resolution_label(3840), Some("4K"));
        assert_eq!(get_resolution_label(1920), Some("HD"));
        assert_eq!(get_resolution_label(640), Some("SD"));
        assert_eq!(get_resolution_label(320), None);
    }

    #[test]
    fn test_default_sizes_are_sorted() {
        let sizes = virtual_camera::DEFAULT_SIZES;
        assert!(sizes.windows(2).all(|w| w[0].0 * w[0].1 < w[1].0 * w[1].1));
    }
}
