//! Named environments backed by core instances
//!
//! The [`EnvironmentManager`] trait is the surface the driver loop depends on.
//! [`RetroEnvManager`] implements it on top of any [`InstanceLoader`]; the
//! default loader starts real libretro cores.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, CoreError, EnvironmentError, RunError};
use crate::frame::{Frame, FrameMap};
use crate::libretro::LibretroLoader;

/// Audio/video parameters reported by a core after loading a game.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AvInfo {
    pub base_width: u32,
    pub base_height: u32,
    /// Display aspect ratio; zero or negative means `base_width / base_height`
    pub aspect_ratio: f32,
    pub fps: f64,
    pub sample_rate: f64,
}

impl AvInfo {
    /// Aspect ratio with the libretro fallback applied.
    ///
    /// `None` when the core reported neither a ratio nor a base geometry.
    pub fn display_aspect(&self) -> Option<f32> {
        if self.aspect_ratio > 0.0 {
            Some(self.aspect_ratio)
        } else if self.base_width > 0 && self.base_height > 0 {
            Some(self.base_width as f32 / self.base_height as f32)
        } else {
            None
        }
    }
}

/// A running emulated session that can be stepped one frame at a time.
pub trait Instance {
    /// Advance one frame and return the latest picture.
    ///
    /// `Ok(None)` means the core has not presented anything yet.
    fn run_frame(&mut self) -> Result<Option<Frame>, RunError>;

    fn av_info(&self) -> AvInfo;
}

/// Creates [`Instance`]s from a core and a ROM.
pub trait InstanceLoader {
    type Instance: Instance;

    fn load(
        &self,
        name: &str,
        core_path: &Path,
        rom_path: &Path,
    ) -> Result<Self::Instance, CoreError>;
}

/// Coordinates named environments and steps them together.
pub trait EnvironmentManager {
    /// Create a new environment under `name`.
    fn create_environment(&mut self, name: &str) -> Result<(), EnvironmentError>;

    /// Step every environment once and collect their frames.
    ///
    /// Environments that have not presented a frame yet are left out of the
    /// mapping.
    fn run(&mut self) -> Result<FrameMap, RunError>;

    /// Names of all live environments, in key order.
    fn environment_names(&self) -> Vec<String>;

    /// Tear down every environment. Calling this more than once is a no-op.
    fn close(&mut self);
}

/// Manager for environments that share one core library and one ROM.
pub struct RetroEnvManager<L: InstanceLoader = LibretroLoader> {
    core_path: PathBuf,
    rom_path: PathBuf,
    loader: L,
    environments: BTreeMap<String, L::Instance>,
}

impl RetroEnvManager<LibretroLoader> {
    /// Create a manager that starts libretro cores with default options.
    pub fn new(
        core_path: impl Into<PathBuf>,
        rom_path: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        Self::with_loader(core_path, rom_path, LibretroLoader::default())
    }
}

impl<L: InstanceLoader> RetroEnvManager<L> {
    /// Create a manager with a specific loader.
    ///
    /// Both paths must point to existing regular files.
    pub fn with_loader(
        core_path: impl Into<PathBuf>,
        rom_path: impl Into<PathBuf>,
        loader: L,
    ) -> Result<Self, ConfigError> {
        let core_path = core_path.into();
        let rom_path = rom_path.into();

        if !core_path.is_file() {
            return Err(ConfigError::MissingCore(core_path));
        }
        if !rom_path.is_file() {
            return Err(ConfigError::MissingRom(rom_path));
        }

        Ok(Self {
            core_path,
            rom_path,
            loader,
            environments: BTreeMap::new(),
        })
    }

    pub fn core_path(&self) -> &Path {
        &self.core_path
    }

    pub fn rom_path(&self) -> &Path {
        &self.rom_path
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }
}

impl<L: InstanceLoader> EnvironmentManager for RetroEnvManager<L> {
    fn create_environment(&mut self, name: &str) -> Result<(), EnvironmentError> {
        if name.is_empty() {
            return Err(EnvironmentError::InvalidName);
        }
        if self.environments.contains_key(name) {
            return Err(EnvironmentError::Duplicate(name.to_string()));
        }

        let instance = self
            .loader
            .load(name, &self.core_path, &self.rom_path)
            .map_err(|source| EnvironmentError::Core {
                name: name.to_string(),
                source,
            })?;
        self.environments.insert(name.to_string(), instance);
        Ok(())
    }

    fn run(&mut self) -> Result<FrameMap, RunError> {
        let mut frames = FrameMap::new();
        for (name, instance) in &mut self.environments {
            let Some(mut frame) = instance.run_frame()? else {
                tracing::debug!("[{}] no frame presented yet", name);
                continue;
            };
            if let Some(aspect) = instance.av_info().display_aspect() {
                frame = frame.with_aspect(aspect);
            }
            frames.insert(name.clone(), frame);
        }
        Ok(frames)
    }

    fn environment_names(&self) -> Vec<String> {
        self.environments.keys().cloned().collect()
    }

    fn close(&mut self) {
        if self.environments.is_empty() {
            return;
        }
        let count = self.environments.len();
        // Instances release their cores on drop.
        self.environments.clear();
        tracing::debug!("Closed {} environment(s)", count);
    }
}

impl<L: InstanceLoader> Drop for RetroEnvManager<L> {
    fn drop(&mut self) {
        self.close();
    }
}
