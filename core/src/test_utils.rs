//! Shared test utilities for unit tests

use std::cell::{Cell, RefCell};
use std::ffi::{CStr, c_uint, c_void};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use tempfile::TempDir;

use crate::display::FrameSink;
use crate::driver::{ShutdownSignal, Sleeper};
use crate::error::{CoreError, DisplayError, RunError};
use crate::frame::{Frame, PixelFormat, RawFrame};
use crate::libretro::core_api::CoreFns;
use crate::libretro::sys;
use crate::manager::{AvInfo, Instance, InstanceLoader};

// ============================================================================
// Files
// ============================================================================

/// Temporary directory holding a placeholder core and ROM file.
pub struct TestFiles {
    dir: TempDir,
    core: PathBuf,
    rom: PathBuf,
}

impl TestFiles {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let core = dir.path().join("test_libretro.so");
        let rom = dir.path().join("test.md");
        std::fs::write(&core, b"core").unwrap();
        std::fs::write(&rom, b"rom").unwrap();
        Self { dir, core, rom }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn core(&self) -> &Path {
        &self.core
    }

    pub fn rom(&self) -> &Path {
        &self.rom
    }
}

// ============================================================================
// Counter Instance
// ============================================================================

/// Instance whose frames encode how many times it has been stepped.
///
/// The red channel of the single pixel holds the low byte of the counter.
pub struct CounterInstance {
    counter: u64,
    frameless: bool,
    bad_frames: bool,
    name: String,
}

impl Instance for CounterInstance {
    fn run_frame(&mut self) -> Result<Option<Frame>, RunError> {
        self.counter += 1;
        if self.frameless {
            return Ok(None);
        }
        if self.bad_frames {
            // Pitch too small for a 2 pixel wide XRGB8888 row
            let raw = RawFrame {
                data: vec![0; 4],
                width: 2,
                height: 1,
                pitch: 4,
                format: PixelFormat::Xrgb8888,
            };
            return Frame::from_raw(&raw, self.counter)
                .map(Some)
                .map_err(|source| RunError::Frame {
                    name: self.name.clone(),
                    source,
                });
        }
        Ok(Some(Frame::new(
            1,
            1,
            vec![self.counter as u8, 0, 0, 255],
            self.counter,
        )))
    }

    fn av_info(&self) -> AvInfo {
        AvInfo {
            base_width: 1,
            base_height: 1,
            aspect_ratio: 4.0 / 3.0,
            fps: 60.0,
            sample_rate: 44_100.0,
        }
    }
}

/// Loader for [`CounterInstance`]s.
#[derive(Default)]
pub struct CounterLoader {
    loads: Cell<usize>,
    fail_load: bool,
    bad_frames: bool,
    frameless: Vec<String>,
}

impl CounterLoader {
    /// Loader whose every load fails.
    pub fn failing() -> Self {
        Self {
            fail_load: true,
            ..Default::default()
        }
    }

    /// Instances named `name` never present a frame.
    pub fn without_frames_for(mut self, name: &str) -> Self {
        self.frameless.push(name.to_string());
        self
    }

    /// Instances present framebuffers that cannot be converted.
    pub fn with_bad_frames(mut self) -> Self {
        self.bad_frames = true;
        self
    }

    /// Number of instances loaded so far.
    pub fn loads(&self) -> usize {
        self.loads.get()
    }
}

impl InstanceLoader for CounterLoader {
    type Instance = CounterInstance;

    fn load(
        &self,
        name: &str,
        core_path: &Path,
        _rom_path: &Path,
    ) -> Result<CounterInstance, CoreError> {
        if self.fail_load {
            return Err(CoreError::LoadGame(core_path.to_path_buf()));
        }
        self.loads.set(self.loads.get() + 1);
        Ok(CounterInstance {
            counter: 0,
            frameless: self.frameless.iter().any(|n| n == name),
            bad_frames: self.bad_frames,
            name: name.to_string(),
        })
    }
}

// ============================================================================
// Recording Sink
// ============================================================================

/// What a [`RecordingSink`] has seen.
#[derive(Debug, Default)]
pub struct SinkLog {
    /// `(title, frame sequence)` for every successful `show`
    pub shown: Vec<(String, u64)>,
    /// Red channel of every successfully shown frame
    pub red: Vec<u8>,
    pub show_calls: usize,
    pub closed: usize,
}

/// Sink that records frames instead of displaying them.
pub struct RecordingSink {
    log: Rc<RefCell<SinkLog>>,
    fail: bool,
    close_window_after: Option<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            log: Rc::default(),
            fail: false,
            close_window_after: None,
        }
    }

    /// Sink whose every `show` fails with a backend error.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    /// Sink that reports its window closed once `shows` frames were shown.
    pub fn closing_after(shows: usize) -> Self {
        Self {
            close_window_after: Some(shows),
            ..Self::new()
        }
    }

    /// Shared handle to the log, valid after the sink is moved or dropped.
    pub fn log(&self) -> Rc<RefCell<SinkLog>> {
        Rc::clone(&self.log)
    }
}

impl FrameSink for RecordingSink {
    fn show(&mut self, title: &str, frame: &Frame) -> Result<(), DisplayError> {
        let mut log = self.log.borrow_mut();
        log.show_calls += 1;
        if self.fail {
            return Err(DisplayError::Backend("test sink failure".to_string()));
        }
        if let Some(limit) = self.close_window_after
            && log.shown.len() >= limit
        {
            return Err(DisplayError::WindowClosed(title.to_string()));
        }
        log.shown.push((title.to_string(), frame.sequence));
        log.red.push(frame.pixels[0]);
        Ok(())
    }

    fn close(&mut self) {
        self.log.borrow_mut().closed += 1;
    }
}

// ============================================================================
// Recording Sleeper
// ============================================================================

/// Sleeper that records requested durations without sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    pub sleeps: Vec<Duration>,
    trigger_after: Option<(usize, ShutdownSignal)>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `signal` once `sleeps` sleeps have been requested.
    pub fn triggering(signal: ShutdownSignal, sleeps: usize) -> Self {
        Self {
            sleeps: Vec::new(),
            trigger_after: Some((sleeps, signal)),
        }
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&mut self, duration: Duration) {
        self.sleeps.push(duration);
        if let Some((after, signal)) = &self.trigger_after
            && self.sleeps.len() >= *after
        {
            signal.trigger();
        }
    }
}

// ============================================================================
// Fake Libretro Core
// ============================================================================

/// How the fake core behaves.
#[derive(Debug, Clone)]
pub struct FakeCoreSetup {
    pub api_version: c_uint,
    pub need_fullpath: bool,
    /// `retro_load_game` returns false
    pub refuse_load: bool,
    /// First `retro_run` (1-based) that presents a frame; `None` never does
    pub present_from_run: Option<u64>,
}

impl Default for FakeCoreSetup {
    fn default() -> Self {
        Self {
            api_version: sys::RETRO_API_VERSION,
            need_fullpath: true,
            refuse_load: false,
            present_from_run: Some(1),
        }
    }
}

#[derive(Default)]
struct FakeCoreState {
    setup: Option<FakeCoreSetup>,
    calls: Vec<&'static str>,
    environment: Option<sys::retro_environment_t>,
    video_refresh: Option<sys::retro_video_refresh_t>,
    runs: u64,
    loaded_path: Option<String>,
    loaded_data: Option<Vec<u8>>,
}

thread_local! {
    static FAKE_CORE: RefCell<FakeCoreState> = RefCell::new(FakeCoreState::default());
}

/// 2x1 XRGB8888 framebuffer: one 0x123456 pixel, one white pixel.
static FAKE_PIXELS: [u8; 8] = [0x56, 0x34, 0x12, 0x00, 0xff, 0xff, 0xff, 0x00];

/// A libretro core implemented in the test binary.
///
/// State is thread-local, so every test gets its own core.
pub struct FakeCore;

impl FakeCore {
    /// Reset the core on this thread and return its entry points.
    pub fn install(setup: FakeCoreSetup) -> CoreFns {
        FAKE_CORE.with(|core| {
            *core.borrow_mut() = FakeCoreState {
                setup: Some(setup),
                ..Default::default()
            }
        });
        CoreFns {
            retro_set_environment: fake_set_environment,
            retro_set_video_refresh: fake_set_video_refresh,
            retro_set_audio_sample: fake_set_audio_sample,
            retro_set_audio_sample_batch: fake_set_audio_sample_batch,
            retro_set_input_poll: fake_set_input_poll,
            retro_set_input_state: fake_set_input_state,
            retro_init: fake_init,
            retro_deinit: fake_deinit,
            retro_api_version: fake_api_version,
            retro_get_system_info: fake_get_system_info,
            retro_get_system_av_info: fake_get_system_av_info,
            retro_run: fake_run,
            retro_load_game: fake_load_game,
            retro_unload_game: fake_unload_game,
        }
    }

    /// Entry points called so far, in order (`retro_` prefix dropped).
    pub fn calls() -> Vec<&'static str> {
        FAKE_CORE.with(|core| core.borrow().calls.clone())
    }

    /// Path handed to `retro_load_game`.
    pub fn loaded_path() -> Option<String> {
        FAKE_CORE.with(|core| core.borrow().loaded_path.clone())
    }

    /// ROM bytes handed to `retro_load_game`, if any.
    pub fn loaded_data() -> Option<Vec<u8>> {
        FAKE_CORE.with(|core| core.borrow().loaded_data.clone())
    }
}

fn setup() -> FakeCoreSetup {
    FAKE_CORE.with(|core| core.borrow().setup.clone().unwrap_or_default())
}

fn record(call: &'static str) {
    FAKE_CORE.with(|core| core.borrow_mut().calls.push(call));
}

extern "C" fn fake_set_environment(cb: sys::retro_environment_t) {
    record("set_environment");
    FAKE_CORE.with(|core| core.borrow_mut().environment = Some(cb));
}

extern "C" fn fake_set_video_refresh(cb: sys::retro_video_refresh_t) {
    record("set_video_refresh");
    FAKE_CORE.with(|core| core.borrow_mut().video_refresh = Some(cb));
}

extern "C" fn fake_set_audio_sample(_cb: sys::retro_audio_sample_t) {
    record("set_audio_sample");
}

extern "C" fn fake_set_audio_sample_batch(_cb: sys::retro_audio_sample_batch_t) {
    record("set_audio_sample_batch");
}

extern "C" fn fake_set_input_poll(_cb: sys::retro_input_poll_t) {
    record("set_input_poll");
}

extern "C" fn fake_set_input_state(_cb: sys::retro_input_state_t) {
    record("set_input_state");
}

extern "C" fn fake_init() {
    record("init");
    let environment = FAKE_CORE.with(|core| core.borrow().environment);
    if let Some(environment) = environment {
        let mut format: c_uint = 1;
        // SAFETY: SET_PIXEL_FORMAT takes a pointer to an unsigned int.
        unsafe {
            environment(
                sys::RETRO_ENVIRONMENT_SET_PIXEL_FORMAT,
                (&mut format as *mut c_uint).cast(),
            )
        };
    }
}

extern "C" fn fake_deinit() {
    record("deinit");
}

extern "C" fn fake_api_version() -> c_uint {
    setup().api_version
}

extern "C" fn fake_get_system_info(info: *mut sys::retro_system_info) {
    record("get_system_info");
    // SAFETY: the frontend passes a valid out-pointer.
    let info = unsafe { &mut *info };
    info.library_name = c"Fake".as_ptr();
    info.library_version = c"1.0".as_ptr();
    info.valid_extensions = c"md|bin".as_ptr();
    info.need_fullpath = setup().need_fullpath;
}

extern "C" fn fake_get_system_av_info(av: *mut sys::retro_system_av_info) {
    record("get_system_av_info");
    // SAFETY: the frontend passes a valid out-pointer.
    let av = unsafe { &mut *av };
    av.geometry = sys::retro_game_geometry {
        base_width: 320,
        base_height: 224,
        max_width: 320,
        max_height: 480,
        aspect_ratio: 4.0 / 3.0,
    };
    av.timing = sys::retro_system_timing {
        fps: 60.0,
        sample_rate: 44_100.0,
    };
}

extern "C" fn fake_run() {
    record("run");
    let (runs, video_refresh) = FAKE_CORE.with(|core| {
        let mut core = core.borrow_mut();
        core.runs += 1;
        (core.runs, core.video_refresh)
    });
    let presents = setup().present_from_run.is_some_and(|first| runs >= first);
    if presents && let Some(video_refresh) = video_refresh {
        // SAFETY: the buffer holds one row of two XRGB8888 pixels.
        unsafe { video_refresh(FAKE_PIXELS.as_ptr().cast::<c_void>(), 2, 1, 8) };
    }
}

extern "C" fn fake_load_game(game: *const sys::retro_game_info) -> bool {
    record("load_game");
    // SAFETY: the frontend passes a valid game info whose buffers outlive the
    // call.
    let (path, data) = unsafe {
        let game = &*game;
        let path = (!game.path.is_null())
            .then(|| CStr::from_ptr(game.path).to_string_lossy().into_owned());
        let data = (!game.data.is_null())
            .then(|| std::slice::from_raw_parts(game.data.cast::<u8>(), game.size).to_vec());
        (path, data)
    };
    FAKE_CORE.with(|core| {
        let mut core = core.borrow_mut();
        core.loaded_path = path;
        core.loaded_data = data;
    });
    !setup().refuse_load
}

extern "C" fn fake_unload_game() {
    record("unload_game");
}
