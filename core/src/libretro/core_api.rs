//! Dynamic loading of a libretro core library

use std::ffi::c_uint;
use std::ops::Deref;
use std::path::Path;

use libloading::Library;
use tempfile::TempDir;

use super::sys;
use crate::error::CoreError;

/// The `retro_*` entry points of one core.
#[derive(Clone, Copy)]
pub struct CoreFns {
    pub retro_set_environment: unsafe extern "C" fn(sys::retro_environment_t),
    pub retro_set_video_refresh: unsafe extern "C" fn(sys::retro_video_refresh_t),
    pub retro_set_audio_sample: unsafe extern "C" fn(sys::retro_audio_sample_t),
    pub retro_set_audio_sample_batch: unsafe extern "C" fn(sys::retro_audio_sample_batch_t),
    pub retro_set_input_poll: unsafe extern "C" fn(sys::retro_input_poll_t),
    pub retro_set_input_state: unsafe extern "C" fn(sys::retro_input_state_t),
    pub retro_init: unsafe extern "C" fn(),
    pub retro_deinit: unsafe extern "C" fn(),
    pub retro_api_version: unsafe extern "C" fn() -> c_uint,
    pub retro_get_system_info: unsafe extern "C" fn(*mut sys::retro_system_info),
    pub retro_get_system_av_info: unsafe extern "C" fn(*mut sys::retro_system_av_info),
    pub retro_run: unsafe extern "C" fn(),
    pub retro_load_game: unsafe extern "C" fn(*const sys::retro_game_info) -> bool,
    pub retro_unload_game: unsafe extern "C" fn(),
}

impl CoreFns {
    /// Resolve every entry point exported by `library`.
    ///
    /// # Safety
    /// `library` must be a libretro core; the pointers are only valid while it
    /// stays loaded.
    unsafe fn resolve(library: &Library) -> Result<Self, CoreError> {
        // SAFETY: each symbol is declared with the signature from libretro.h.
        unsafe {
            Ok(Self {
                retro_set_environment: symbol(library, "retro_set_environment")?,
                retro_set_video_refresh: symbol(library, "retro_set_video_refresh")?,
                retro_set_audio_sample: symbol(library, "retro_set_audio_sample")?,
                retro_set_audio_sample_batch: symbol(library, "retro_set_audio_sample_batch")?,
                retro_set_input_poll: symbol(library, "retro_set_input_poll")?,
                retro_set_input_state: symbol(library, "retro_set_input_state")?,
                retro_init: symbol(library, "retro_init")?,
                retro_deinit: symbol(library, "retro_deinit")?,
                retro_api_version: symbol(library, "retro_api_version")?,
                retro_get_system_info: symbol(library, "retro_get_system_info")?,
                retro_get_system_av_info: symbol(library, "retro_get_system_av_info")?,
                retro_run: symbol(library, "retro_run")?,
                retro_load_game: symbol(library, "retro_load_game")?,
                retro_unload_game: symbol(library, "retro_unload_game")?,
            })
        }
    }
}

/// A loaded core: its entry points plus whatever keeps them valid.
pub struct CoreApi {
    fns: CoreFns,
    // Dropped before `_scratch` so the copy is unmapped before it is deleted.
    _library: Option<Library>,
    _scratch: Option<TempDir>,
}

impl CoreApi {
    /// Load the core at `path` directly.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        Self::open(path, path, None)
    }

    /// Copy the core into a private temporary directory and load the copy.
    ///
    /// The dynamic loader returns the same handle for repeated loads of one
    /// file, so a private copy is the only way to get independent global state
    /// per instance.
    pub fn load_isolated(path: &Path) -> Result<Self, CoreError> {
        let scratch = tempfile::Builder::new()
            .prefix("retroenv-core-")
            .tempdir()
            .map_err(CoreError::Isolate)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "core".into());
        let copy = scratch.path().join(file_name);
        std::fs::copy(path, &copy).map_err(CoreError::Isolate)?;
        tracing::debug!("Copied core {} to {}", path.display(), copy.display());

        Self::open(path, &copy, Some(scratch))
    }

    fn open(
        original: &Path,
        load_path: &Path,
        scratch: Option<TempDir>,
    ) -> Result<Self, CoreError> {
        // SAFETY: loading a libretro core runs its library constructors; cores
        // are trusted native plugins chosen by the user.
        let library = unsafe { Library::new(load_path) }.map_err(|source| CoreError::Load {
            path: original.to_path_buf(),
            source,
        })?;
        // SAFETY: the pointers are stored next to the library that owns them.
        let fns = unsafe { CoreFns::resolve(&library)? };

        let api = Self::from_parts(fns, Some(library), scratch)?;
        tracing::info!("Loaded core from {}", original.display());
        Ok(api)
    }

    /// Wrap entry points that live in the test binary itself.
    #[cfg(test)]
    pub(crate) fn from_fns(fns: CoreFns) -> Result<Self, CoreError> {
        Self::from_parts(fns, None, None)
    }

    fn from_parts(
        fns: CoreFns,
        library: Option<Library>,
        scratch: Option<TempDir>,
    ) -> Result<Self, CoreError> {
        // SAFETY: retro_api_version has no preconditions.
        let found = unsafe { (fns.retro_api_version)() };
        if found != sys::RETRO_API_VERSION {
            return Err(CoreError::ApiVersion {
                found,
                expected: sys::RETRO_API_VERSION,
            });
        }
        Ok(Self {
            fns,
            _library: library,
            _scratch: scratch,
        })
    }
}

impl Deref for CoreApi {
    type Target = CoreFns;

    fn deref(&self) -> &CoreFns {
        &self.fns
    }
}

/// Resolve `name` and copy the function pointer out of the symbol.
///
/// # Safety
/// `T` must match the C signature of the exported symbol.
unsafe fn symbol<T: Copy>(library: &Library, name: &'static str) -> Result<T, CoreError> {
    // SAFETY: upheld by the caller.
    unsafe { library.get::<T>(name.as_bytes()) }
        .map(|sym| *sym)
        .map_err(|source| CoreError::MissingSymbol {
            symbol: name,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeCore, FakeCoreSetup};
    use std::io::Write;

    #[test]
    fn test_missing_core_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let err = CoreApi::load(&dir.path().join("missing_libretro.so")).err().unwrap();
        assert!(matches!(err, CoreError::Load { .. }));
    }

    #[test]
    fn test_non_library_file_fails_to_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not an ELF").unwrap();
        let err = CoreApi::load(file.path()).err().unwrap();
        assert!(matches!(err, CoreError::Load { .. }));
    }

    #[test]
    fn test_isolated_load_of_missing_core_reports_copy_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = CoreApi::load_isolated(&dir.path().join("missing_libretro.so"))
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::Isolate(_)));
    }

    #[test]
    fn test_api_version_mismatch_is_rejected() {
        let fns = FakeCore::install(FakeCoreSetup {
            api_version: 2,
            ..Default::default()
        });
        let err = CoreApi::from_fns(fns).err().unwrap();
        assert!(matches!(err, CoreError::ApiVersion { found: 2, expected: 1 }));
        assert!(FakeCore::calls().is_empty());
    }

    #[test]
    fn test_matching_api_version_is_accepted() {
        let api = CoreApi::from_fns(FakeCore::install(FakeCoreSetup::default())).unwrap();
        // SAFETY: the fake core has no preconditions.
        assert_eq!(unsafe { (api.retro_api_version)() }, sys::RETRO_API_VERSION);
    }
}
