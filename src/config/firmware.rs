use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub const FIRMWARE_FILE: &str = "qpy_fw.json";

/// The firmware image chosen for flashing, persisted as `qpy_fw.json`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct FirmwareSelection {
    /// Local file path or an `http(s)` URL. Empty when nothing is selected.
    #[serde(default)]
    pub path: String,
    /// Whether a remote image was already fetched to disk.
    #[serde(default)]
    pub downloadflag: bool,
}

impl FirmwareSelection {
    /// A missing file is an empty selection.
    pub fn load(file: &Path) -> Result<Self> {
        if !file.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(file)
            .map_err(|e| AppError::ConfigError(format!("Failed to read firmware selection: {}", e)))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, file: &Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        fs::write(file, json)
            .map_err(|e| AppError::ConfigError(format!("Unable to set selected firmware: {}", e)))
    }

    pub fn select(&mut self, path: impl Into<String>) {
        self.path = path.into();
        self.downloadflag = false;
    }

    pub fn mark_downloaded(&mut self) {
        self.downloadflag = true;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.path.trim().is_empty()
    }

    pub fn is_remote(&self) -> bool {
        self.path.starts_with("http://") || self.path.starts_with("https://")
    }

    /// Local image to hand to the flash tool.
    pub fn flashable_path(&self) -> Result<PathBuf> {
        if self.is_empty() {
            return Err(AppError::ValidationError(
                "No firmware selected".to_string(),
            ));
        }
        if self.is_remote() && !self.downloadflag {
            return Err(AppError::ValidationError(format!(
                "Firmware {} has not been downloaded",
                self.path
            )));
        }
        Ok(PathBuf::from(&self.path))
    }
}
