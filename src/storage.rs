// SPDX-License-Identifier: MPL-2.0

//! Persistence of per-device camera calibrations

use crate::config::APP_DIR;
use crate::errors::CalibrationError;
use crate::vision::CameraCalibration;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Calibration persistence keyed by device id
pub trait CalibrationStore: Send + Sync {
    /// `Ok(None)` when nothing was stored for the device
    fn load(&self, device_id: &str) -> Result<Option<CameraCalibration>, CalibrationError>;

    fn save(&self, device_id: &str, calibration: &CameraCalibration)
    -> Result<(), CalibrationError>;
}

/// One JSON file per device in a directory
#[derive(Debug, Clone)]
pub struct JsonCalibrationStore {
    dir: PathBuf,
}

impl JsonCalibrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data dir>/marker-camera/calibration`
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join(APP_DIR).join("calibration"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the calibration of `device_id`
    pub fn path_for(&self, device_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(device_id)))
    }
}

/// Device ids such as `/dev/video0` become `dev_video0`
fn file_stem(device_id: &str) -> String {
    let stem: String = device_id
        .trim_start_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "default".to_string()
    } else {
        stem
    }
}

impl CalibrationStore for JsonCalibrationStore {
    fn load(&self, device_id: &str) -> Result<Option<CameraCalibration>, CalibrationError> {
        let path = self.path_for(device_id);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(device = device_id, "No stored calibration");
                return Ok(None);
            }
            Err(e) => {
                return Err(CalibrationError::Persistence(format!(
                    "{}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let calibration: CameraCalibration = serde_json::from_str(&text)
            .map_err(|e| CalibrationError::Persistence(format!("{}: {}", path.display(), e)))?;
        if !calibration.is_valid() {
            warn!(path = %path.display(), "Ignoring invalid stored calibration");
            return Ok(None);
        }

        debug!(device = device_id, path = %path.display(), "Loaded calibration");
        Ok(Some(calibration))
    }

    fn save(
        &self,
        device_id: &str,
        calibration: &CameraCalibration,
    ) -> Result<(), CalibrationError> {
        let persistence = |e: &dyn std::fmt::Display| {
            CalibrationError::Persistence(format!("{}: {}", self.dir.display(), e))
        };

        std::fs::create_dir_all(&self.dir).map_err(|e| persistence(&e))?;
        let text = serde_json::to_string_pretty(calibration).map_err(|e| persistence(&e))?;
        let path = self.path_for(device_id);
        std::fs::write(&path, text).map_err(|e| persistence(&e))?;

        info!(device = device_id, path = %path.display(), "Saved calibration");
        Ok(())
    }
}
