//! Frontend callbacks handed to the core
//!
//! Libretro callbacks are bare C function pointers with no user data, so the
//! state of the instance currently inside a core call is published through a
//! thread-local pointer. [`ActiveScope`] sets it for the duration of one call
//! into the core and restores the previous value on drop.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::ffi::{CStr, CString, c_char, c_uint, c_void};
use std::ptr;

use super::{log, sys};
use crate::frame::{PixelFormat, RawFrame};

/// Per-instance state written by the callbacks.
#[derive(Debug, Default)]
pub struct CallbackState {
    /// Environment name, for log messages
    pub name: String,
    /// Format requested through `SET_PIXEL_FORMAT`
    pub pixel_format: PixelFormat,
    /// Whether the core explicitly selected a format
    pub pixel_format_set: bool,
    /// Latest framebuffer presented by the core
    pub frame: Option<RawFrame>,
    /// Number of video refreshes that reused the previous frame
    pub duplicate_frames: u64,
    /// Audio frames received (and discarded)
    pub audio_frames: u64,
    pub av_info: sys::retro_system_av_info,
    /// NUL-terminated directory strings handed to the core
    pub system_dir: Option<CString>,
    pub save_dir: Option<CString>,
    /// Core option defaults declared with `SET_VARIABLES`
    pub variable_defaults: BTreeMap<String, CString>,
    /// User-supplied core option values
    pub variable_overrides: BTreeMap<String, CString>,
}

impl CallbackState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Value reported for `GET_VARIABLE`, overrides first.
    pub fn variable(&self, key: &str) -> Option<&CStr> {
        self.variable_overrides
            .get(key)
            .or_else(|| self.variable_defaults.get(key))
            .map(CString::as_c_str)
    }
}

thread_local! {
    static ACTIVE: Cell<*mut CallbackState> = const { Cell::new(ptr::null_mut()) };
}

/// Routes callbacks on this thread to one [`CallbackState`] while alive.
pub struct ActiveScope<'a> {
    previous: *mut CallbackState,
    _state: std::marker::PhantomData<&'a mut CallbackState>,
}

impl<'a> ActiveScope<'a> {
    pub fn enter(state: &'a mut CallbackState) -> Self {
        let previous = ACTIVE.with(|active| active.replace(state as *mut CallbackState));
        Self {
            previous,
            _state: std::marker::PhantomData,
        }
    }
}

impl Drop for ActiveScope<'_> {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(self.previous));
    }
}

/// Run `f` against the active state, if a scope is open on this thread.
fn with_active<R>(f: impl FnOnce(&mut CallbackState) -> R) -> Option<R> {
    let state = ACTIVE.with(Cell::get);
    if state.is_null() {
        return None;
    }
    // SAFETY: the pointer was set by an `ActiveScope` that holds the unique
    // borrow of the state until it is dropped, and callbacks only run on the
    // thread that opened the scope.
    Some(f(unsafe { &mut *state }))
}

/// Name of the environment whose core call is in progress on this thread.
pub fn active_name() -> Option<String> {
    with_active(|state| state.name.clone())
}

/// Parse a `SET_VARIABLES` value (`"Description; first|second|third"`) into
/// its default (first) option.
pub fn parse_variable_default(value: &str) -> Option<&str> {
    let (_, options) = value.split_once(';')?;
    options.trim_start().split('|').next().filter(|s| !s.is_empty())
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: the core passes NUL-terminated strings.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

pub unsafe extern "C" fn environment(cmd: c_uint, data: *mut c_void) -> bool {
    with_active(|state| unsafe { handle_environment(state, cmd, data) }).unwrap_or_else(|| {
        tracing::warn!("Environment command {} received outside of a core call", cmd);
        false
    })
}

unsafe fn handle_environment(state: &mut CallbackState, cmd: c_uint, data: *mut c_void) -> bool {
    // Every command handled below takes a payload.
    if data.is_null() {
        tracing::trace!("[{}] environment command {} without data", state.name, cmd);
        return false;
    }
    // SAFETY (for every arm): `data` is non-null and points to the type
    // libretro.h documents for `cmd`.
    unsafe {
        match cmd {
            sys::RETRO_ENVIRONMENT_GET_CAN_DUPE => {
                *(data as *mut bool) = true;
                true
            }
            sys::RETRO_ENVIRONMENT_SET_MESSAGE => {
                let message = &*(data as *const sys::retro_message);
                if let Some(msg) = c_str(message.msg) {
                    tracing::info!("[{}] core message: {}", state.name, msg);
                }
                true
            }
            sys::RETRO_ENVIRONMENT_GET_SYSTEM_DIRECTORY => {
                write_dir(data, state.system_dir.as_ref());
                state.system_dir.is_some()
            }
            sys::RETRO_ENVIRONMENT_GET_SAVE_DIRECTORY => {
                write_dir(data, state.save_dir.as_ref());
                state.save_dir.is_some()
            }
            sys::RETRO_ENVIRONMENT_SET_PIXEL_FORMAT => {
                let raw = *(data as *const c_uint);
                match PixelFormat::from_raw(raw) {
                    Some(format) => {
                        tracing::debug!(
                            "[{}] core requested pixel format {:?}",
                            state.name,
                            format
                        );
                        state.pixel_format = format;
                        state.pixel_format_set = true;
                        true
                    }
                    None => {
                        tracing::warn!(
                            "[{}] core requested unknown pixel format {}",
                            state.name,
                            raw
                        );
                        false
                    }
                }
            }
            sys::RETRO_ENVIRONMENT_SET_INPUT_DESCRIPTORS
            | sys::RETRO_ENVIRONMENT_SET_CONTROLLER_INFO
            | sys::RETRO_ENVIRONMENT_SET_SUPPORT_NO_GAME => true,
            sys::RETRO_ENVIRONMENT_GET_VARIABLE => {
                let var = &mut *(data as *mut sys::retro_variable);
                let Some(key) = c_str(var.key) else {
                    return false;
                };
                match state.variable(key) {
                    Some(value) => {
                        var.value = value.as_ptr();
                        true
                    }
                    None => {
                        var.value = ptr::null();
                        false
                    }
                }
            }
            sys::RETRO_ENVIRONMENT_SET_VARIABLES => {
                let mut var = data as *const sys::retro_variable;
                while !var.is_null() && !(*var).key.is_null() {
                    if let (Some(key), Some(value)) = (c_str((*var).key), c_str((*var).value))
                        && let Some(default) = parse_variable_default(value)
                        && let Ok(default) = CString::new(default)
                    {
                        tracing::trace!(
                            "[{}] core option {} defaults to {:?}",
                            state.name,
                            key,
                            default
                        );
                        state.variable_defaults.insert(key.to_string(), default);
                    }
                    var = var.add(1);
                }
                true
            }
            sys::RETRO_ENVIRONMENT_GET_VARIABLE_UPDATE => {
                *(data as *mut bool) = false;
                true
            }
            sys::RETRO_ENVIRONMENT_SET_SYSTEM_AV_INFO => {
                state.av_info = *(data as *const sys::retro_system_av_info);
                true
            }
            sys::RETRO_ENVIRONMENT_SET_GEOMETRY => {
                state.av_info.geometry = *(data as *const sys::retro_game_geometry);
                true
            }
            sys::RETRO_ENVIRONMENT_GET_LOG_INTERFACE => {
                (*(data as *mut sys::retro_log_callback)).log = log::printf();
                true
            }
            _ => {
                tracing::trace!(
                    "[{}] unhandled environment command {} (experimental: {})",
                    state.name,
                    cmd & !sys::RETRO_ENVIRONMENT_EXPERIMENTAL,
                    cmd & sys::RETRO_ENVIRONMENT_EXPERIMENTAL != 0
                );
                false
            }
        }
    }
}

unsafe fn write_dir(data: *mut c_void, dir: Option<&CString>) {
    let value = dir.map_or(ptr::null(), |d| d.as_ptr());
    // SAFETY: `data` is a `const char **` out-parameter.
    unsafe { *(data as *mut *const c_char) = value };
}

pub unsafe extern "C" fn video_refresh(
    data: *const c_void,
    width: c_uint,
    height: c_uint,
    pitch: usize,
) {
    with_active(|state| {
        if data.is_null() {
            // Duplicate frame: keep the previous buffer.
            state.duplicate_frames += 1;
            return;
        }
        let len = pitch * height as usize;
        // SAFETY: the core guarantees `height` rows of `pitch` bytes.
        let bytes = unsafe { std::slice::from_raw_parts(data as *const u8, len) };
        match &mut state.frame {
            Some(frame) => {
                frame.data.clear();
                frame.data.extend_from_slice(bytes);
                frame.width = width;
                frame.height = height;
                frame.pitch = pitch;
                frame.format = state.pixel_format;
            }
            None => {
                if !state.pixel_format_set {
                    tracing::debug!(
                        "[{}] first frame without SET_PIXEL_FORMAT, assuming {:?}",
                        state.name,
                        state.pixel_format
                    );
                }
                state.frame = Some(RawFrame {
                    data: bytes.to_vec(),
                    width,
                    height,
                    pitch,
                    format: state.pixel_format,
                });
            }
        }
    });
}

pub unsafe extern "C" fn audio_sample(_left: i16, _right: i16) {
    with_active(|state| state.audio_frames += 1);
}

pub unsafe extern "C" fn audio_sample_batch(_data: *const i16, frames: usize) -> usize {
    with_active(|state| state.audio_frames += frames as u64);
    frames
}

pub unsafe extern "C" fn input_poll() {}

/// Every button reads as released.
pub unsafe extern "C" fn input_state(
    _port: c_uint,
    _device: c_uint,
    _index: c_uint,
    _id: c_uint,
) -> i16 {
    0
}
