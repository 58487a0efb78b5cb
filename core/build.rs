//! Build script for retroenv-core.
//!
//! Compiles the C shim behind the libretro log interface.

fn main() {
    println!("cargo:rerun-if-changed=src/libretro/log_shim.c");
    cc::Build::new()
        .file("src/libretro/log_shim.c")
        .warnings(true)
        .compile("retroenv_log_shim");
}
