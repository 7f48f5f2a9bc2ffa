// SPDX-License-Identifier: GPL-3.0-only

//! Device selection and output size negotiation
//!
//! Both are pure functions over what a provider enumerates, so they run on the
//! caller's thread before any work is posted to the capture worker.

use super::types::*;
use crate::constants::negotiation::ASPECT_TOLERANCE;
use crate::errors::CameraError;
use tracing::{debug, info};

/// Pick a device according to the selector. First match wins, there is no scoring.
pub fn select_device<'a>(
    devices: &'a [CameraDevice],
    selector: &DeviceSelector,
) -> BackendResult<&'a CameraDevice> {
    if devices.is_empty() {
        return Err(CameraError::NoDeviceAvailable);
    }

    let found = match selector {
        DeviceSelector::Any => devices.first(),
        DeviceSelector::Id(id) => devices.iter().find(|d| &d.id == id),
        DeviceSelector::Facing(facing) => devices.iter().find(|d| d.facing == *facing),
    };

    match found {
        Some(device) => {
            info!(device = %device.id, selector = %selector, "Selected camera");
            Ok(device)
        }
        None => Err(CameraError::NoDeviceAvailable),
    }
}

/// Select the output size that best fills the requested display size
///
/// A candidate is accepted when it fits inside the requested bounds, is at
/// least as large as the previously accepted candidate in both dimensions, and
/// its aspect ratio is within [`ASPECT_TOLERANCE`] of the requested one.
/// Among equal candidates the earliest one is kept.
///
/// When no candidate matches the aspect ratio the first candidate is kept,
/// provided it fits. Only when it does not fit is the scan repeated without
/// the aspect test, and when nothing fits at all the first candidate is
/// returned anyway.
pub fn select_best_size(
    candidates: &[PreviewSize],
    requested_width: u32,
    requested_height: u32,
) -> BackendResult<PreviewSize> {
    let first = *candidates.first().ok_or(CameraError::NoSizesAvailable)?;

    if requested_width == 0 || requested_height == 0 {
        debug!(
            requested_width,
            requested_height, "Degenerate display size, using first candidate"
        );
        return Ok(first);
    }

    let aspect = requested_width as f32 / requested_height as f32;

    let first_fits = first.width <= requested_width && first.height <= requested_height;

    let best = scan(candidates, requested_width, requested_height, |size| {
        (aspect - size.aspect_ratio()).abs() < ASPECT_TOLERANCE
    })
    .or_else(|| {
        if first_fits {
            Some(first)
        } else {
            scan(candidates, requested_width, requested_height, |_| true)
        }
    })
    .unwrap_or(first);

    info!(
        requested = %PreviewSize::new(requested_width, requested_height),
        best = %best,
        "Negotiated preview size"
    );
    Ok(best)
}

fn scan(
    candidates: &[PreviewSize],
    max_width: u32,
    max_height: u32,
    aspect_ok: impl Fn(&PreviewSize) -> bool,
) -> Option<PreviewSize> {
    let mut best: Option<PreviewSize> = None;

    for size in candidates {
        debug!(size = %size, "Trying size");
        let fits = size.width <= max_width && size.height <= max_height;
        let grows = best.is_none_or(|b| size.width >= b.width && size.height >= b.height);
        if fits && grows && aspect_ok(size) {
            best = Some(*size);
        }
    }

    best
}

/// Outcome of re-running negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeChange {
    /// Same as the stored size, no reconfiguration needed
    Unchanged(PreviewSize),
    /// New size stored, the session must be reconfigured
    Changed(PreviewSize),
}

impl SizeChange {
    pub fn size(&self) -> PreviewSize {
        match self {
            SizeChange::Unchanged(size) | SizeChange::Changed(size) => *size,
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, SizeChange::Changed(_))
    }
}

/// Remembers the negotiated size so that repeated resize callbacks with the
/// same outcome do not tear down the session
#[derive(Debug, Clone, Default)]
pub struct PreviewSizeTracker {
    current: Option<PreviewSize>,
}

impl PreviewSizeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<PreviewSize> {
        self.current
    }

    /// Negotiate and store the result, reporting whether it changed
    pub fn update(
        &mut self,
        candidates: &[PreviewSize],
        requested_width: u32,
        requested_height: u32,
    ) -> BackendResult<SizeChange> {
        let best = select_best_size(candidates, requested_width, requested_height)?;
        if self.current == Some(best) {
            return Ok(SizeChange::Unchanged(best));
        }
        self.current = Some(best);
        Ok(SizeChange::Changed(best))
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(list: &[(u32, u32)]) -> Vec<PreviewSize> {
        list.iter().copied().map(PreviewSize::from).collect()
    }

    fn device(id: &str, facing: LensFacing) -> CameraDevice {
        CameraDevice {
            id: id.to_string(),
            name: id.to_string(),
            facing,
            output_sizes: sizes(&[(640, 480)]),
            format: FrameFormat::default(),
        }
    }

    #[test]
    fn test_empty_candidates() {
        assert_eq!(
            select_best_size(&[], 640, 480),
            Err(CameraError::NoSizesAvailable)
        );
    }

    #[test]
    fn test_exact_match_wins() {
        let candidates = sizes(&[(640, 480), (1280, 720), (1920, 1080), (3840, 2160)]);
        assert_eq!(
            select_best_size(&candidates, 1920, 1080),
            Ok(PreviewSize::new(1920, 1080))
        );
    }

    #[test]
    fn test_falls_back_to_fitting_size_when_aspect_is_off() {
        let candidates = sizes(&[(640, 480), (1280, 720), (1920, 1080), (3840, 2160)]);
        assert_eq!(
            select_best_size(&candidates, 1000, 600),
            Ok(PreviewSize::new(640, 480))
        );
    }

    #[test]
    fn test_descending_enumeration_still_fits() {
        let candidates = sizes(&[(1920, 1080), (1280, 720), (640, 360)]);
        assert_eq!(
            select_best_size(&candidates, 1280, 720),
            Ok(PreviewSize::new(1280, 720))
        );

        // No aspect match and the first size is too large: any fitting size
        let candidates = sizes(&[(1920, 1080), (800, 600)]);
        assert_eq!(
            select_best_size(&candidates, 1000, 600),
            Ok(PreviewSize::new(800, 600))
        );
    }

    #[test]
    fn test_fitting_first_candidate_kept_without_aspect_match() {
        // 800x600 fits but its aspect is 0.33 away from 1000/600
        let candidates = sizes(&[(640, 480), (800, 600)]);
        assert_eq!(
            select_best_size(&candidates, 1000, 600),
            Ok(PreviewSize::new(640, 480))
        );
    }

    #[test]
    fn test_nothing_fits_returns_first() {
        let candidates = sizes(&[(3840, 2160), (1920, 1080)]);
        assert_eq!(
            select_best_size(&candidates, 320, 240),
            Ok(PreviewSize::new(3840, 2160))
        );
    }

    #[test]
    fn test_repeated_selection_is_identical() {
        let candidates = sizes(&[(1280, 960), (800, 600), (1280, 720), (960, 720)]);
        let first = select_best_size(&candidates, 1280, 960).unwrap();
        let second = select_best_size(&candidates, 1280, 960).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, PreviewSize::new(1280, 960));
    }

    #[test]
    fn test_tracker_reports_change_once() {
        let candidates = sizes(&[(640, 480), (1280, 720)]);
        let mut tracker = PreviewSizeTracker::new();

        let first = tracker.update(&candidates, 1280, 720).unwrap();
        assert_eq!(first, SizeChange::Changed(PreviewSize::new(1280, 720)));

        let second = tracker.update(&candidates, 1280, 720).unwrap();
        assert_eq!(second, SizeChange::Unchanged(PreviewSize::new(1280, 720)));

        let third = tracker.update(&candidates, 640, 480).unwrap();
        assert!(third.is_changed());
    }

    #[test]
    fn test_select_device_policies() {
        let devices = vec![
            device("0", LensFacing::Back),
            device("1", LensFacing::Front),
        ];

        let any = select_device(&devices, &DeviceSelector::Any).unwrap();
        assert_eq!(any.id, "0");

        let front = select_device(&devices, &DeviceSelector::Facing(LensFacing::Front)).unwrap();
        assert_eq!(front.id, "1");

        let by_id = select_device(&devices, &DeviceSelector::Id("1".to_string())).unwrap();
        assert_eq!(by_id.facing, LensFacing::Front);

        assert_eq!(
            select_device(&devices, &DeviceSelector::Facing(LensFacing::External)),
            Err(CameraError::NoDeviceAvailable)
        );
        assert_eq!(
            select_device(&[], &DeviceSelector::Any),
            Err(CameraError::NoDeviceAvailable)
        );
    }
}
