/// Configuration for the history subsystem
///
/// Stored as JSON next to the other RAW editor settings:
/// - Linux: ~/.config/raw-editor/history.json
/// - macOS: ~/Library/Application Support/raw-editor/history.json
/// - Windows: %APPDATA%\raw-editor\history.json
///
/// Every field has a default, so a missing file (or a partial one) is fine.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// Which family of modules is switched on for a never-edited image.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Workflow {
    #[default]
    SceneReferred,
    DisplayReferred,
    None,
}

/// White balance defaults: modern (D65 reference, adaptation later in the pipe)
/// or legacy (camera as-shot coefficients).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChromaticAdaptation {
    #[default]
    Modern,
    Legacy,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Catalog database; `None` means the platform data directory.
    pub database_path: Option<PathBuf>,

    /// Cost quota of the image metadata cache, in MiB
    pub image_cache_mib: usize,

    /// Enqueue a sidecar write on every safe write-through
    pub write_sidecar_files: bool,

    /// Bound of the sidecar task queue
    pub sidecar_queue_capacity: usize,

    /// Committed mask states above which a warning is logged
    pub mask_history_warning_threshold: usize,

    pub workflow: Workflow,

    pub chromatic_adaptation: ChromaticAdaptation,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            image_cache_mib: 50,
            write_sidecar_files: true,
            sidecar_queue_capacity: 64,
            mask_history_warning_threshold: 250,
            workflow: Workflow::SceneReferred,
            chromatic_adaptation: ChromaticAdaptation::Modern,
        }
    }
}

impl Config {
    /// Load the configuration from the default location.
    pub fn load() -> Result<Self, StoreError> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from an explicit file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            tracing::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Path of the configuration file, if the platform has a config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut path| {
            path.push("raw-editor");
            path.push("history.json");
            path
        })
    }

    /// Catalog database location: the configured one or the platform default
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            let mut path = dirs::data_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_else(std::env::temp_dir);
            path.push("raw-editor");
            path.push("raw_editor.db");
            path
        })
    }

    /// Image cache quota in bytes
    pub fn image_cache_bytes(&self) -> usize {
        self.image_cache_mib.saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.image_cache_mib, 50);
        assert_eq!(config.image_cache_bytes(), 50 * 1024 * 1024);
        assert_eq!(config.mask_history_warning_threshold, 250);
        assert!(config.write_sidecar_files);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{ "image_cache_mib": 8, "workflow": "display-referred" }"#).unwrap();
        assert_eq!(config.image_cache_mib, 8);
        assert_eq!(config.workflow, Workflow::DisplayReferred);
        assert_eq!(config.sidecar_queue_capacity, 64);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_serialization() {
        let mut config = Config::default();
        config.chromatic_adaptation = ChromaticAdaptation::Legacy;
        let json = config.to_json().unwrap();
        assert_eq!(Config::from_json(&json).unwrap(), config);
    }
}
