//! Configuration management (config.toml)
//!
//! Handles loading, saving, and providing defaults for driver settings.
//! Settings are stored in TOML format, by default in the platform-specific
//! config directory. Every field has a default so partial files are valid.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::{DriverConfig, FailurePolicy};
use crate::error::ConfigError;
use crate::libretro::CoreOptions;

/// Largest accepted window scale factor.
pub const MAX_SCALE: u32 = 8;

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Environment names, created and shown in this order (default: `["Hello"]`)
    #[serde(default = "default_environments")]
    pub environments: Vec<String>,
    /// Libretro core settings
    #[serde(default)]
    pub core: CoreConfig,
    /// Game settings
    #[serde(default)]
    pub rom: RomConfig,
    /// Loop timing and failure handling
    #[serde(default)]
    pub driver: DriverSettings,
    /// Where frames are shown
    #[serde(default)]
    pub display: DisplayConfig,
}

/// Libretro core configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Path to the core shared library
    #[serde(default = "default_core_path")]
    pub path: PathBuf,
    /// Load a private copy of the core for every environment (default: true)
    #[serde(default = "default_true")]
    pub isolate_instances: bool,
    /// BIOS directory reported to the core (default: `<data_dir>/system`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_dir: Option<PathBuf>,
    /// Save directory reported to the core (default: `<data_dir>/saves`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_dir: Option<PathBuf>,
    /// Core option overrides (`key = "value"`)
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Game configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RomConfig {
    /// Path to the ROM handed to the core
    #[serde(default = "default_rom_path")]
    pub path: PathBuf,
}

/// Loop settings as stored in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Sleep between iterations in milliseconds (default: 1000)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Stop after this many iterations (default: run until interrupted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
    /// What to do when an environment has no frame (default: abort)
    #[serde(default)]
    pub on_missing_frame: FailurePolicy,
    /// What to do when showing a frame fails (default: abort)
    #[serde(default)]
    pub on_display_error: FailurePolicy,
}

/// Display backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DisplayBackend {
    /// One native window per environment
    #[default]
    Window,
    /// PNG files in `output_dir`
    Png,
    /// Log only
    Headless,
}

/// Display configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Backend (default: window)
    #[serde(default)]
    pub backend: DisplayBackend,
    /// Output directory for the png backend (default: `frames`)
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Keep every PNG instead of overwriting one file per environment
    #[serde(default)]
    pub keep_history: bool,
    /// Initial window size as a multiple of the frame size (default: 3, range: 1-8)
    #[serde(default = "default_scale")]
    pub scale: u32,
}

fn default_environments() -> Vec<String> {
    vec!["Hello".to_string()]
}
fn default_core_path() -> PathBuf {
    PathBuf::from("cores/genesis_plus_gx_libretro.so")
}
fn default_rom_path() -> PathBuf {
    PathBuf::from("roms/Street Fighter II' - Special Champion Edition (USA).zip")
}
fn default_true() -> bool {
    true
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("frames")
}
fn default_scale() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environments: default_environments(),
            core: CoreConfig::default(),
            rom: RomConfig::default(),
            driver: DriverSettings::default(),
            display: DisplayConfig::default(),
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            path: default_core_path(),
            isolate_instances: default_true(),
            system_dir: None,
            save_dir: None,
            options: BTreeMap::new(),
        }
    }
}

impl Default for RomConfig {
    fn default() -> Self {
        Self {
            path: default_rom_path(),
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_iterations: None,
            on_missing_frame: FailurePolicy::default(),
            on_display_error: FailurePolicy::default(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            backend: DisplayBackend::default(),
            output_dir: default_output_dir(),
            keep_history: false,
            scale: default_scale(),
        }
    }
}

impl Config {
    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environments.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one environment name is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for name in &self.environments {
            if name.is_empty() {
                return Err(ConfigError::Invalid(
                    "environment names must not be empty".to_string(),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "environment \"{}\" is listed twice",
                    name
                )));
            }
        }
        if self.driver.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "driver.interval_ms must be greater than 0".to_string(),
            ));
        }
        if !(1..=MAX_SCALE).contains(&self.display.scale) {
            return Err(ConfigError::Invalid(format!(
                "display.scale must be between 1 and {}, got {}",
                MAX_SCALE, self.display.scale
            )));
        }
        Ok(())
    }

    /// Loop settings for [`crate::driver::AppContext`].
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            environments: self.environments.clone(),
            interval: Duration::from_millis(self.driver.interval_ms),
            max_iterations: self.driver.max_iterations,
            on_missing_frame: self.driver.on_missing_frame,
            on_display_error: self.driver.on_display_error,
        }
    }

    /// Options for the libretro loader, with directory defaults filled in.
    pub fn core_options(&self) -> CoreOptions {
        let data = data_dir();
        CoreOptions {
            system_dir: self
                .core
                .system_dir
                .clone()
                .or_else(|| data.as_ref().map(|d| d.join("system"))),
            save_dir: self
                .core
                .save_dir
                .clone()
                .or_else(|| data.as_ref().map(|d| d.join("saves"))),
            isolate_instances: self.core.isolate_instances,
            variables: self.core.options.clone(),
        }
    }
}

/// Returns the platform-specific configuration directory.
///
/// On Windows: `%APPDATA%\RetroEnv\config`
/// On macOS: `~/Library/Application Support/io.retroenv.RetroEnv`
/// On Linux: `~/.config/RetroEnv`
///
/// Returns `None` if the home directory cannot be determined.
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("io.retroenv", "", "RetroEnv")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Returns the platform-specific data directory (core system and save files).
///
/// On Windows: `%APPDATA%\RetroEnv\data`
/// On macOS: `~/Library/Application Support/io.retroenv.RetroEnv`
/// On Linux: `~/.local/share/RetroEnv`
pub fn data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("io.retroenv", "", "RetroEnv")
        .map(|dirs| dirs.data_dir().to_path_buf())
}

/// Default location of the config file.
pub fn default_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Loads the configuration from `path`.
///
/// Unlike [`load`], a missing or malformed file is an error.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the configuration from the platform's configuration directory.
///
/// Returns default values if the file doesn't exist or cannot be parsed.
pub fn load() -> Config {
    let Some(path) = default_path() else {
        return Config::default();
    };
    if !path.exists() {
        return Config::default();
    }
    match load_from(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("{}; using defaults", e);
            Config::default()
        }
    }
}

/// Writes the configuration to `path`, creating parent directories.
pub fn save_to(config: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Saves the configuration to the platform's configuration directory.
pub fn save(config: &Config) -> Result<(), ConfigError> {
    match default_path() {
        Some(path) => save_to(config, &path),
        None => Ok(()),
    }
}
