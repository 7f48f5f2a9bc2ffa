// SPDX-License-Identifier: GPL-3.0-only

use crate::backends::camera::{AeMode, AfMode, ControllerSettings, DeviceSelector};
use crate::constants::capture::MAX_IMAGES;
use crate::errors::{AppError, AppResult};
use crate::storage::JsonCalibrationStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory name under the platform config and data directories
pub const APP_DIR: &str = "marker-camera";

/// Current config schema version
pub const CONFIG_VERSION: u32 = 1;

/// How the preview is fitted into the display surface
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum LayoutMode {
    /// Scale the frame to fill the surface
    #[default]
    Fill,
    /// Draw the frame at its native size (scale reported as 0)
    Exact,
}

impl LayoutMode {
    /// Display scale for a frame of `frame_size` drawn into `width` x `height`
    pub fn scale(&self, width: u32, height: u32, frame_width: u32, frame_height: u32) -> f32 {
        match self {
            LayoutMode::Exact => 0.0,
            LayoutMode::Fill => {
                if frame_width == 0 || frame_height == 0 {
                    return 0.0;
                }
                let by_height = height as f32 / frame_height as f32;
                let by_width = width as f32 / frame_width as f32;
                by_height.min(by_width)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Schema version, bumped when fields change meaning
    pub version: u32,
    /// Which camera to open
    pub device: DeviceSelector,
    /// Preview layout
    pub layout: LayoutMode,
    /// Autofocus mode of the repeating request
    pub af_mode: AfMode,
    /// Auto-exposure mode of the repeating request
    pub ae_mode: AeMode,
    /// Frames the reader may hold at once
    pub max_images: usize,
    /// Where calibrations are stored (default: platform data directory)
    pub calibration_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            device: DeviceSelector::default(), // First enumerated camera
            layout: LayoutMode::default(),
            af_mode: AfMode::default(), // Continuous picture
            ae_mode: AeMode::default(), // Auto exposure with auto flash
            max_images: MAX_IMAGES,
            calibration_dir: None,
        }
    }
}

impl Config {
    /// Default location: `<config dir>/marker-camera/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.json"))
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> AppResult<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => {
                warn!("No config directory on this platform, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load from `path`. A missing file yields defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> AppResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(AppError::Config(format!("{}: {}", path.display(), e))),
        };

        let config: Config = serde_json::from_str(&text)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;

        if config.version > CONFIG_VERSION {
            warn!(
                found = config.version,
                supported = CONFIG_VERSION,
                "Config written by a newer version, unknown fields ignored"
            );
        }
        Ok(config.sanitized())
    }

    /// Save to the default location
    pub fn save(&self) -> AppResult<PathBuf> {
        let path = Self::default_path()
            .ok_or_else(|| AppError::Config("no config directory on this platform".into()))?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        info!(path = %path.display(), "Saved config");
        Ok(())
    }

    /// Calibration directory, falling back to `<data dir>/marker-camera/calibration`
    pub fn calibration_dir(&self) -> Option<PathBuf> {
        self.calibration_dir
            .clone()
            .or_else(JsonCalibrationStore::default_dir)
    }

    /// Capture settings for the session controller
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            af_mode: self.af_mode,
            ae_mode: self.ae_mode,
            max_images: self.max_images,
        }
    }

    fn sanitized(mut self) -> Self {
        if self.max_images == 0 {
            warn!("max_images of 0 is invalid, using {}", MAX_IMAGES);
            self.max_images = MAX_IMAGES;
        }
        self.version = CONFIG_VERSION;
        self
    }
}
