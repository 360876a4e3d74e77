use anyhow::Result;
use log::{error, info, LevelFilter};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::shared_prefs::DEFAULT_PREFS_PATH;

pub const DEFAULT_CONFIG_PATH: &str = "/data/adb/gps_rider/config.toml";
pub const DEFAULT_COMPANION_PACKAGE: &str = "com.dvhamham";

/// Module-level settings, independent from the companion app's preferences.
///
/// ```toml
/// companion_package = "com.dvhamham"
/// prefs_path = "/data/data/com.dvhamham/shared_prefs/gps_rider_prefs.xml"
/// log_level = "debug"
/// notify_activation = true
/// exclude = ["com.android.phone"]
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub companion_package: String,
    /// Preference file written by the companion app. Must be readable from
    /// inside the spoofed app's sandbox.
    pub prefs_path: PathBuf,
    pub log_level: String,
    /// Show a toast in spoofed apps once hooks are in place.
    pub notify_activation: bool,
    /// Packages that are never hooked.
    pub exclude: Vec<String>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            companion_package: DEFAULT_COMPANION_PACKAGE.to_string(),
            prefs_path: PathBuf::from(DEFAULT_PREFS_PATH),
            log_level: "info".to_string(),
            notify_activation: true,
            exclude: Vec::new(),
        }
    }
}

impl ModuleConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Reads the config file, falling back to defaults when it is missing
    /// or malformed.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                info!("No module config at {} ({}), using defaults", path.display(), e);
                return Self::default();
            }
        };

        match Self::from_toml(&content) {
            Ok(config) => config,
            Err(e) => {
                error!("Invalid module config {}: {:?}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn is_excluded(&self, package: &str) -> bool {
        self.exclude.iter().any(|p| p == package)
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }
}
