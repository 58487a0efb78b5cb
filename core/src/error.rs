//! Error types
//!
//! Each stage of the driver has its own error type so callers can decide per
//! call whether to abort or continue. [`RetroError`] unifies them for the
//! driver loop.

use std::path::PathBuf;

use thiserror::Error;

/// Invalid or unreadable configuration (paths, config file, values).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The core library path does not point to a file
    #[error("core library not found: {}", .0.display())]
    MissingCore(PathBuf),

    /// The ROM path does not point to a file
    #[error("ROM not found: {}", .0.display())]
    MissingRom(PathBuf),

    /// A config file could not be read
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A config file is not valid TOML for [`crate::config::Config`]
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A config file could not be written
    #[error("failed to write config file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be serialized
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A config value failed validation
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure while loading or talking to a libretro core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The shared library could not be opened
    #[error("failed to load core from {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    /// A required `retro_*` export is missing
    #[error("core does not export `{symbol}`: {source}")]
    MissingSymbol {
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },

    /// The core was built against a different libretro API
    #[error("core was compiled with libretro API version {found}, expected {expected}")]
    ApiVersion { found: u32, expected: u32 },

    /// The private copy of the core could not be created
    #[error("failed to prepare private core copy: {0}")]
    Isolate(#[source] std::io::Error),

    /// Without isolation a core library can only back one instance
    #[error("core {} is already in use and instance isolation is disabled", .0.display())]
    SharedCoreInUse(PathBuf),

    /// The ROM path could not be resolved
    #[error("failed to resolve ROM path {}: {source}", path.display())]
    RomPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The ROM could not be read into memory
    #[error("failed to read ROM {}: {source}", path.display())]
    RomRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A path contains an interior NUL byte
    #[error("path cannot be passed to the core: {}", .0.display())]
    InvalidPath(PathBuf),

    /// `retro_load_game` returned false
    #[error("core refused to load game {}", .0.display())]
    LoadGame(PathBuf),
}

/// Failure while creating a named environment.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// The name is empty
    #[error("environment name must not be empty")]
    InvalidName,

    /// An environment with this name already exists
    #[error("environment with name \"{0}\" already exists")]
    Duplicate(String),

    /// The core instance backing the environment failed to start
    #[error("failed to create environment \"{name}\": {source}")]
    Core {
        name: String,
        #[source]
        source: CoreError,
    },
}

/// Failure converting a raw core framebuffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The buffer or pitch is too small for the reported dimensions
    #[error(
        "framebuffer truncated: {width}x{height} with pitch {pitch} needs {needed} bytes, \
         got {actual}"
    )]
    Truncated {
        width: u32,
        height: u32,
        pitch: usize,
        needed: usize,
        actual: usize,
    },
}

/// Failure while stepping environments.
///
/// An environment without a frame yet is not an error; it is left out of the
/// step's [`crate::frame::FrameMap`].
#[derive(Debug, Error)]
pub enum RunError {
    /// The latest framebuffer could not be converted
    #[error("environment \"{name}\" produced an invalid frame: {source}")]
    Frame {
        name: String,
        #[source]
        source: FrameError,
    },
}

/// A frame was requested for an environment that is not in the mapping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no frame for environment \"{name}\" (available: {})", available.join(", "))]
pub struct LookupError {
    pub name: String,
    pub available: Vec<String>,
}

/// Failure presenting a frame.
#[derive(Debug, Error)]
pub enum DisplayError {
    /// Writing the frame to disk failed
    #[error("failed to write frame to {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Encoding the frame failed
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),

    /// The frame has no pixels
    #[error("cannot display an empty {width}x{height} frame")]
    EmptyFrame { width: u32, height: u32 },

    /// The windowing or GPU backend failed
    #[error("display backend error: {0}")]
    Backend(String),

    /// The user closed the window
    #[error("window \"{0}\" was closed")]
    WindowClosed(String),

    /// The requested backend is not compiled in
    #[error("display backend \"{0}\" is not available in this build")]
    Unavailable(&'static str),
}

/// Any error surfaced by the driver loop.
#[derive(Debug, Error)]
pub enum RetroError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Display(#[from] DisplayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_error_lists_available_names() {
        let err = LookupError {
            name: "Goodbye".to_string(),
            available: vec!["Hello".to_string(), "World".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "no frame for environment \"Goodbye\" (available: Hello, World)"
        );
    }

    #[test]
    fn test_retro_error_is_transparent() {
        let err: RetroError = EnvironmentError::Duplicate("Hello".to_string()).into();
        assert_eq!(
            err.to_string(),
            "environment with name \"Hello\" already exists"
        );
    }

    #[test]
    fn test_config_error_mentions_path() {
        let err = ConfigError::MissingCore(PathBuf::from("cores/missing.so"));
        assert!(err.to_string().contains("cores/missing.so"));
    }
}
