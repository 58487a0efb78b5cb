//! One running libretro core with a loaded game

use std::collections::{BTreeMap, HashSet};
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use super::callbacks::{self, ActiveScope, CallbackState};
use super::core_api::CoreApi;
use super::sys;
use crate::error::{CoreError, RunError};
use crate::frame::Frame;
use crate::manager::{AvInfo, Instance, InstanceLoader};

/// Core libraries currently loaded without isolation.
static SHARED_CORES: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(Default::default);

/// Options applied to every instance a [`LibretroLoader`] starts.
#[derive(Debug, Clone)]
pub struct CoreOptions {
    /// Directory reported for `GET_SYSTEM_DIRECTORY` (BIOS files)
    pub system_dir: Option<PathBuf>,
    /// Directory reported for `GET_SAVE_DIRECTORY`
    pub save_dir: Option<PathBuf>,
    /// Load a private copy of the core per instance
    pub isolate_instances: bool,
    /// Core option values, overriding the defaults the core declares
    pub variables: BTreeMap<String, String>,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            system_dir: None,
            save_dir: None,
            isolate_instances: true,
            variables: BTreeMap::new(),
        }
    }
}

/// Starts [`LibretroInstance`]s.
#[derive(Debug, Clone, Default)]
pub struct LibretroLoader {
    options: CoreOptions,
}

impl LibretroLoader {
    pub fn new(options: CoreOptions) -> Self {
        Self { options }
    }
}

impl InstanceLoader for LibretroLoader {
    type Instance = LibretroInstance;

    fn load(
        &self,
        name: &str,
        core_path: &Path,
        rom_path: &Path,
    ) -> Result<LibretroInstance, CoreError> {
        LibretroInstance::open(name, core_path, rom_path, &self.options)
    }
}

/// Static information reported by `retro_get_system_info`.
#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
    pub library_name: String,
    pub library_version: String,
    pub valid_extensions: Vec<String>,
    pub need_fullpath: bool,
}

impl SystemInfo {
    /// Whether the core lists the extension of `path` (case-insensitive).
    pub fn accepts(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.valid_extensions
            .iter()
            .any(|valid| valid.eq_ignore_ascii_case(ext))
    }
}

/// A core instance with a game loaded.
///
/// Unloads the game and deinitialises the core on drop.
pub struct LibretroInstance {
    // Boxed so the address published to callbacks stays fixed.
    state: Box<CallbackState>,
    system_info: SystemInfo,
    steps: u64,
    game_loaded: bool,
    shared_core: Option<PathBuf>,
    /// Keeps the game path alive while the core may still reference it
    game_path: CString,
    /// Keeps the ROM bytes alive for cores that do not copy them
    game_data: Option<Vec<u8>>,
    api: CoreApi,
}

impl LibretroInstance {
    /// Load the core, initialise it and load the game.
    pub fn open(
        name: &str,
        core_path: &Path,
        rom_path: &Path,
        options: &CoreOptions,
    ) -> Result<Self, CoreError> {
        let shared_core = if options.isolate_instances {
            None
        } else {
            let key = std::fs::canonicalize(core_path).unwrap_or_else(|_| core_path.to_path_buf());
            let mut shared = SHARED_CORES.lock().unwrap_or_else(|e| e.into_inner());
            if !shared.insert(key.clone()) {
                return Err(CoreError::SharedCoreInUse(core_path.to_path_buf()));
            }
            Some(key)
        };

        let started = if options.isolate_instances {
            CoreApi::load_isolated(core_path)
        } else {
            CoreApi::load(core_path)
        }
        .and_then(|api| Self::start(name, api, rom_path, options, shared_core.clone()));

        if started.is_err()
            && let Some(key) = &shared_core
        {
            release_shared(key);
        }
        started
    }

    /// Initialise a loaded core and load the game.
    fn start(
        name: &str,
        api: CoreApi,
        rom_path: &Path,
        options: &CoreOptions,
        shared_core: Option<PathBuf>,
    ) -> Result<Self, CoreError> {
        let mut state = Box::new(CallbackState::new(name));
        state.system_dir = options.system_dir.as_deref().map(path_cstring).transpose()?;
        state.save_dir = options.save_dir.as_deref().map(path_cstring).transpose()?;
        for (key, value) in &options.variables {
            match CString::new(value.as_str()) {
                Ok(value) => {
                    state.variable_overrides.insert(key.clone(), value);
                }
                Err(_) => tracing::warn!("Ignoring core option {} with interior NUL", key),
            }
        }

        let resolved_rom =
            std::fs::canonicalize(rom_path).map_err(|source| CoreError::RomPath {
                path: rom_path.to_path_buf(),
                source,
            })?;
        let game_path = path_cstring(&resolved_rom)?;

        let mut instance = Self {
            state,
            system_info: SystemInfo::default(),
            steps: 0,
            game_loaded: false,
            shared_core,
            game_path,
            game_data: None,
            api,
        };

        // Environment must be set before retro_init; the remaining callbacks
        // are set afterwards.
        {
            let _scope = ActiveScope::enter(&mut instance.state);
            // SAFETY: the callbacks match the libretro signatures and route to
            // `instance.state` only while a scope is open.
            unsafe {
                (instance.api.retro_set_environment)(callbacks::environment);
                (instance.api.retro_init)();
                (instance.api.retro_set_video_refresh)(callbacks::video_refresh);
                (instance.api.retro_set_audio_sample)(callbacks::audio_sample);
                (instance.api.retro_set_audio_sample_batch)(callbacks::audio_sample_batch);
                (instance.api.retro_set_input_poll)(callbacks::input_poll);
                (instance.api.retro_set_input_state)(callbacks::input_state);
            }
        }

        instance.system_info = instance.query_system_info();
        tracing::info!(
            "[{}] core {} {}",
            name,
            instance.system_info.library_name,
            instance.system_info.library_version
        );
        let info = &instance.system_info;
        if !info.valid_extensions.is_empty() && !info.accepts(&resolved_rom) {
            tracing::warn!(
                "[{}] {} is not a listed extension of this core ({})",
                name,
                resolved_rom.display(),
                info.valid_extensions.join("|")
            );
        }

        instance.load_game(&resolved_rom)?;
        Ok(instance)
    }

    fn query_system_info(&mut self) -> SystemInfo {
        let mut raw = sys::retro_system_info::default();
        // SAFETY: the core fills the struct with static strings.
        unsafe {
            (self.api.retro_get_system_info)(&mut raw);
            SystemInfo {
                library_name: lossy(raw.library_name),
                library_version: lossy(raw.library_version),
                valid_extensions: lossy(raw.valid_extensions)
                    .split('|')
                    .filter(|e| !e.is_empty())
                    .map(str::to_string)
                    .collect(),
                need_fullpath: raw.need_fullpath,
            }
        }
    }

    fn load_game(&mut self, rom: &Path) -> Result<(), CoreError> {
        tracing::info!("[{}] loading ROM {}", self.state.name, rom.display());

        if !self.system_info.need_fullpath {
            if is_archive(rom) {
                tracing::warn!(
                    "[{}] {} looks like an archive but the core expects ROM data; \
                     it will receive the archive bytes unextracted",
                    self.state.name,
                    rom.display()
                );
            }
            let bytes = std::fs::read(rom).map_err(|source| CoreError::RomRead {
                path: rom.to_path_buf(),
                source,
            })?;
            self.game_data = Some(bytes);
        }

        let (data, size) = match &self.game_data {
            Some(bytes) => (bytes.as_ptr().cast(), bytes.len()),
            None => (std::ptr::null(), 0),
        };
        let info = sys::retro_game_info {
            path: self.game_path.as_ptr(),
            data,
            size,
            meta: std::ptr::null(),
        };

        let loaded = {
            let _scope = ActiveScope::enter(&mut self.state);
            // SAFETY: `info` and the buffers it points to outlive the call and
            // stay alive for the instance's lifetime.
            unsafe { (self.api.retro_load_game)(&info) }
        };
        if !loaded {
            return Err(CoreError::LoadGame(rom.to_path_buf()));
        }
        self.game_loaded = true;

        let mut av = sys::retro_system_av_info::default();
        {
            let _scope = ActiveScope::enter(&mut self.state);
            // SAFETY: valid out-pointer; called after a successful load.
            unsafe { (self.api.retro_get_system_av_info)(&mut av) };
        }
        self.state.av_info = av;
        tracing::debug!(
            "[{}] {}x{} @ {:.2} fps, {} Hz audio",
            self.state.name,
            av.geometry.base_width,
            av.geometry.base_height,
            av.timing.fps,
            av.timing.sample_rate
        );
        Ok(())
    }
}

impl Instance for LibretroInstance {
    fn run_frame(&mut self) -> Result<Option<Frame>, RunError> {
        {
            let _scope = ActiveScope::enter(&mut self.state);
            // SAFETY: a game is loaded; callbacks are routed to this instance.
            unsafe { (self.api.retro_run)() };
        }
        self.steps += 1;

        let Some(raw) = &self.state.frame else {
            return Ok(None);
        };
        Frame::from_raw(raw, self.steps)
            .map(Some)
            .map_err(|source| RunError::Frame {
                name: self.state.name.clone(),
                source,
            })
    }

    fn av_info(&self) -> AvInfo {
        let av = &self.state.av_info;
        AvInfo {
            base_width: av.geometry.base_width,
            base_height: av.geometry.base_height,
            aspect_ratio: av.geometry.aspect_ratio,
            fps: av.timing.fps,
            sample_rate: av.timing.sample_rate,
        }
    }
}

impl Drop for LibretroInstance {
    fn drop(&mut self) {
        {
            let _scope = ActiveScope::enter(&mut self.state);
            // SAFETY: the core was initialised in `start`; the game is only
            // unloaded if it was loaded.
            unsafe {
                if self.game_loaded {
                    (self.api.retro_unload_game)();
                }
                (self.api.retro_deinit)();
            }
        }
        if let Some(key) = self.shared_core.take() {
            release_shared(&key);
        }
        tracing::debug!(
            "[{}] core released after {} step(s), {} duplicate frame(s), {} audio frame(s)",
            self.state.name,
            self.steps,
            self.state.duplicate_frames,
            self.state.audio_frames
        );
    }
}

fn release_shared(key: &Path) {
    SHARED_CORES
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(key);
}

/// Whether `path` names a compressed archive rather than a bare ROM.
fn is_archive(path: &Path) -> bool {
    const ARCHIVES: [&str; 2] = ["zip", "7z"];
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ARCHIVES.iter().any(|a| a.eq_ignore_ascii_case(ext)))
}

fn path_cstring(path: &Path) -> Result<CString, CoreError> {
    path.to_str()
        .and_then(|s| CString::new(s).ok())
        .ok_or_else(|| CoreError::InvalidPath(path.to_path_buf()))
}

unsafe fn lossy(ptr: *const std::ffi::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: the core returns NUL-terminated strings.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeCore, FakeCoreSetup, TestFiles};

    fn start_fake(files: &TestFiles, setup: FakeCoreSetup) -> Result<LibretroInstance, CoreError> {
        let api = CoreApi::from_fns(FakeCore::install(setup))?;
        LibretroInstance::start("Hello", api, files.rom(), &CoreOptions::default(), None)
    }

    const STARTUP: [&str; 10] = [
        "set_environment",
        "init",
        "set_video_refresh",
        "set_audio_sample",
        "set_audio_sample_batch",
        "set_input_poll",
        "set_input_state",
        "get_system_info",
        "load_game",
        "get_system_av_info",
    ];

    // =============================================================
    // Lifecycle against a fake core
    // =============================================================

    #[test]
    fn test_start_calls_core_in_libretro_order() {
        let files = TestFiles::new();
        let instance = start_fake(&files, FakeCoreSetup::default()).unwrap();
        assert_eq!(FakeCore::calls(), STARTUP);
        assert_eq!(instance.system_info.library_name, "Fake");
        assert_eq!(instance.system_info.valid_extensions, vec!["md", "bin"]);

        drop(instance);
        let calls = FakeCore::calls();
        assert_eq!(calls[..STARTUP.len()], STARTUP);
        assert_eq!(calls[STARTUP.len()..], ["unload_game", "deinit"]);
    }

    #[test]
    fn test_need_fullpath_passes_path_only() {
        let files = TestFiles::new();
        let _instance = start_fake(&files, FakeCoreSetup::default()).unwrap();

        let expected = std::fs::canonicalize(files.rom()).unwrap();
        assert_eq!(FakeCore::loaded_path(), Some(expected.display().to_string()));
        assert_eq!(FakeCore::loaded_data(), None);
    }

    #[test]
    fn test_rom_bytes_passed_when_core_needs_data() {
        let files = TestFiles::new();
        let setup = FakeCoreSetup {
            need_fullpath: false,
            ..Default::default()
        };
        let _instance = start_fake(&files, setup).unwrap();

        assert_eq!(FakeCore::loaded_data(), Some(b"rom".to_vec()));
        assert!(FakeCore::loaded_path().is_some());
    }

    #[test]
    fn test_refused_load_deinits_without_unload() {
        let files = TestFiles::new();
        let setup = FakeCoreSetup {
            refuse_load: true,
            ..Default::default()
        };
        let err = start_fake(&files, setup).err().unwrap();
        assert!(matches!(err, CoreError::LoadGame(_)));

        let calls = FakeCore::calls();
        assert_eq!(calls.last(), Some(&"deinit"));
        assert!(!calls.contains(&"unload_game"));
        assert!(!calls.contains(&"get_system_av_info"));
    }

    #[test]
    fn test_version_mismatch_never_initialises() {
        let files = TestFiles::new();
        let setup = FakeCoreSetup {
            api_version: 0,
            ..Default::default()
        };
        let err = start_fake(&files, setup).err().unwrap();
        assert!(matches!(err, CoreError::ApiVersion { found: 0, .. }));
        assert!(FakeCore::calls().is_empty());
    }

    #[test]
    fn test_missing_rom_is_reported_before_init() {
        let files = TestFiles::new();
        let api = CoreApi::from_fns(FakeCore::install(FakeCoreSetup::default())).unwrap();
        let missing = files.dir().join("missing.md");
        let err = LibretroInstance::start("Hello", api, &missing, &CoreOptions::default(), None)
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::RomPath { .. }));
        assert!(FakeCore::calls().is_empty());
    }

    #[test]
    fn test_run_frame_waits_for_first_presented_frame() {
        let files = TestFiles::new();
        let setup = FakeCoreSetup {
            present_from_run: Some(2),
            ..Default::default()
        };
        let mut instance = start_fake(&files, setup).unwrap();

        assert_eq!(instance.run_frame().unwrap(), None);
        let frame = instance.run_frame().unwrap().unwrap();
        assert_eq!((frame.width, frame.height, frame.sequence), (2, 1, 2));
        // XRGB8888 selected by the core during init
        assert_eq!(frame.pixels, vec![0x12, 0x34, 0x56, 255, 255, 255, 255, 255]);
        assert_eq!(instance.av_info().display_aspect(), Some(4.0 / 3.0));
        assert_eq!(
            FakeCore::calls().iter().filter(|c| **c == "run").count(),
            2
        );
    }

    #[test]
    fn test_core_that_never_presents_yields_no_frame() {
        let files = TestFiles::new();
        let setup = FakeCoreSetup {
            present_from_run: None,
            ..Default::default()
        };
        let mut instance = start_fake(&files, setup).unwrap();
        for _ in 0..3 {
            assert_eq!(instance.run_frame().unwrap(), None);
        }
    }

    #[test]
    fn test_archive_extensions_are_detected() {
        assert!(is_archive(Path::new("roms/Sonic.zip")));
        assert!(is_archive(Path::new("roms/Sonic.7Z")));
        assert!(!is_archive(Path::new("roms/Sonic.md")));
        assert!(!is_archive(Path::new("roms/zip")));
    }

    // =============================================================
    // Loading real libraries
    // =============================================================

    #[test]
    fn test_system_info_matches_extensions_case_insensitively() {
        let info = SystemInfo {
            valid_extensions: vec!["md".to_string(), "zip".to_string()],
            ..Default::default()
        };
        assert!(info.accepts(Path::new("roms/Street Fighter II.ZIP")));
        assert!(info.accepts(Path::new("game.md")));
        assert!(!info.accepts(Path::new("game.sfc")));
        assert!(!info.accepts(Path::new("no_extension")));
    }

    #[test]
    fn test_default_options_isolate_instances() {
        let options = CoreOptions::default();
        assert!(options.isolate_instances);
        assert!(options.variables.is_empty());
    }

    #[test]
    fn test_missing_core_is_reported_by_the_loader() {
        let dir = tempfile::tempdir().unwrap();
        let rom = dir.path().join("game.md");
        std::fs::write(&rom, b"rom").unwrap();

        let loader = LibretroLoader::default();
        let err = loader
            .load("Hello", &dir.path().join("missing_libretro.so"), &rom)
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::Isolate(_)));
    }

    #[test]
    fn test_shared_core_slot_is_released_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let core = dir.path().join("broken_libretro.so");
        std::fs::write(&core, b"not a library").unwrap();
        let rom = dir.path().join("game.md");
        std::fs::write(&rom, b"rom").unwrap();

        let options = CoreOptions {
            isolate_instances: false,
            ..Default::default()
        };
        for _ in 0..2 {
            let err = LibretroInstance::open("Hello", &core, &rom, &options)
                .err()
                .unwrap();
            assert!(matches!(err, CoreError::Load { .. }));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_path_with_nul_is_rejected() {
        use std::os::unix::ffi::OsStrExt;
        let path = Path::new(std::ffi::OsStr::from_bytes(b"bad\0path"));
        assert!(matches!(path_cstring(path), Err(CoreError::InvalidPath(_))));
    }
}
