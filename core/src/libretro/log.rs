//! Core log output routed into `tracing`
//!
//! `retro_log_printf_t` is C-variadic, so the callback handed to cores is
//! `retroenv_log_printf` from `log_shim.c`. The shim formats the line with
//! `vsnprintf` and passes the text back to [`retroenv_log_message`].

use std::ffi::{CStr, c_char, c_uint};

use super::callbacks;
use super::sys;

unsafe extern "C" {
    fn retroenv_log_printf(level: c_uint, fmt: *const c_char, ...);
}

/// Callback reported for `GET_LOG_INTERFACE`.
pub fn printf() -> sys::retro_log_printf_t {
    retroenv_log_printf
}

/// Receives one formatted line from the shim.
///
/// # Safety
/// `message` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn retroenv_log_message(level: c_uint, message: *const c_char) {
    if message.is_null() {
        return;
    }
    // SAFETY: upheld by the caller.
    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    let message = message.trim_end();
    // Some cores log from their own threads, outside any core call.
    let name = callbacks::active_name().unwrap_or_else(|| "core".to_string());

    match level {
        sys::RETRO_LOG_DEBUG => tracing::debug!("[{}] {}", name, message),
        sys::RETRO_LOG_INFO => tracing::info!("[{}] {}", name, message),
        sys::RETRO_LOG_WARN => tracing::warn!("[{}] {}", name, message),
        sys::RETRO_LOG_ERROR => tracing::error!("[{}] {}", name, message),
        _ => tracing::trace!("[{}] {}", name, message),
    }
}
