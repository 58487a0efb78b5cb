//! Libretro frontend
//!
//! Loads libretro cores as shared libraries and drives them one frame at a
//! time. Each [`LibretroInstance`] owns its own copy of the core so several
//! environments can run the same core side by side.

pub mod callbacks;
pub mod core_api;
pub mod instance;
pub mod log;
pub mod sys;

pub use core_api::CoreApi;
pub use instance::{CoreOptions, LibretroInstance, LibretroLoader, SystemInfo};
