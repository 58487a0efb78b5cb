//! RetroEnv Core - libretro environments and the frame driver loop
//!
//! This crate loads libretro emulator cores, runs them as named environments
//! and shows their frames through pluggable sinks.
//!
//! # Architecture
//!
//! - [`RetroEnvManager`] - Named environments sharing one core and ROM
//! - [`libretro`] - Dynamic core loading, C ABI and callback routing
//! - [`FrameSink`] - Window, PNG and headless frame presentation
//! - [`AppContext`] - Run-until-signalled loop with per-call failure policy

pub mod config;
pub mod display;
pub mod driver;
pub mod error;
pub mod frame;
pub mod libretro;
pub mod manager;
#[cfg(test)]
pub mod test_utils;

pub use config::{Config, CoreConfig, DisplayBackend, DisplayConfig, DriverSettings, RomConfig};
pub use display::{FrameSink, HeadlessSink, PngSink};
#[cfg(feature = "window")]
pub use display::WindowSink;
pub use driver::{
    AppContext, DriverConfig, FailurePolicy, RunSummary, ShutdownSignal, Sleeper, StopReason,
    ThreadSleeper,
};
pub use error::{
    ConfigError, CoreError, DisplayError, EnvironmentError, FrameError, LookupError, RetroError,
    RunError,
};
pub use frame::{Frame, FrameMap, PixelFormat, RawFrame};
pub use libretro::{CoreOptions, LibretroInstance, LibretroLoader};
pub use manager::{AvInfo, EnvironmentManager, Instance, InstanceLoader, RetroEnvManager};
