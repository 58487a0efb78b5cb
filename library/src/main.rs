//! RetroEnv launcher
//!
//! Loads a libretro core and a ROM, creates the configured environments and
//! shows their frames once per interval until interrupted.
//!
//! # Usage
//!
//! ```bash
//! retroenv
//! retroenv --core cores/genesis_plus_gx_libretro.so --rom roms/game.zip
//! retroenv --env Hello --env World --display png --iterations 10
//! retroenv --config my-config.toml --skip-missing
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use retroenv_core::config::{self, Config, DisplayBackend};
use retroenv_core::driver::{self, FailurePolicy, ShutdownSignal};

#[derive(Parser)]
#[command(name = "retroenv")]
#[command(author, version, about = "RetroEnv - libretro environment frame viewer")]
struct Args {
    /// Config file (default: platform config dir, falling back to built-in defaults)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Libretro core shared library
    #[arg(long, value_name = "PATH")]
    core: Option<PathBuf>,

    /// ROM handed to the core
    #[arg(long, value_name = "PATH")]
    rom: Option<PathBuf>,

    /// Environment name (repeat for several environments)
    #[arg(long = "env", value_name = "NAME")]
    environments: Vec<String>,

    /// Sleep between iterations in milliseconds
    #[arg(long, value_name = "N")]
    interval_ms: Option<u64>,

    /// Stop after N iterations
    #[arg(long, value_name = "N")]
    iterations: Option<u64>,

    /// Where frames are shown
    #[arg(long, value_enum)]
    display: Option<DisplayArg>,

    /// Output directory for the png display
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Keep going when an environment has no frame
    #[arg(long)]
    skip_missing: bool,

    /// Keep going when a frame cannot be shown
    #[arg(long)]
    skip_display_errors: bool,

    /// Write the resulting configuration to the platform config dir and exit
    #[arg(long)]
    write_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DisplayArg {
    Window,
    Png,
    Headless,
}

impl From<DisplayArg> for DisplayBackend {
    fn from(arg: DisplayArg) -> Self {
        match arg {
            DisplayArg::Window => DisplayBackend::Window,
            DisplayArg::Png => DisplayBackend::Png,
            DisplayArg::Headless => DisplayBackend::Headless,
        }
    }
}

impl Args {
    /// Apply command-line overrides on top of a loaded config.
    fn apply(&self, config: &mut Config) {
        if let Some(core) = &self.core {
            config.core.path = core.clone();
        }
        if let Some(rom) = &self.rom {
            config.rom.path = rom.clone();
        }
        if !self.environments.is_empty() {
            config.environments = self.environments.clone();
        }
        if let Some(interval_ms) = self.interval_ms {
            config.driver.interval_ms = interval_ms;
        }
        if let Some(iterations) = self.iterations {
            config.driver.max_iterations = Some(iterations);
        }
        if let Some(display) = self.display {
            config.display.backend = display.into();
        }
        if let Some(output_dir) = &self.output_dir {
            config.display.output_dir = output_dir.clone();
        }
        if self.skip_missing {
            config.driver.on_missing_frame = FailurePolicy::Skip;
        }
        if self.skip_display_errors {
            config.driver.on_display_error = FailurePolicy::Skip;
        }
    }
}

/// Raise `shutdown` on Ctrl-C.
///
/// The signal is awaited on a current-thread runtime owned by a helper thread
/// so the driver loop itself stays synchronous.
fn watch_interrupt(shutdown: ShutdownSignal) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create signal runtime")?;

    std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::info!("Interrupt received, stopping");
                        shutdown.trigger();
                    }
                    Err(e) => tracing::warn!("Failed to listen for Ctrl-C: {}", e),
                }
            });
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => config::load(),
    };
    args.apply(&mut config);

    if args.write_config {
        config.validate().context("Refusing to write invalid configuration")?;
        config::save(&config).context("Failed to save configuration")?;
        match config::default_path() {
            Some(path) => tracing::info!("Configuration written to {}", path.display()),
            None => tracing::warn!("No config directory available, nothing written"),
        }
        return Ok(());
    }

    let shutdown = ShutdownSignal::new();
    watch_interrupt(shutdown.clone())?;

    let summary = driver::run(&config, &shutdown).context("Driver loop failed")?;
    tracing::info!(
        "Done: {} iteration(s), {} frame(s) shown",
        summary.iterations,
        summary.frames_shown
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_flags_keep_defaults() {
        let args = Args::try_parse_from(["retroenv"]).unwrap();
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "retroenv",
            "--core",
            "cores/other_libretro.so",
            "--env",
            "Hello",
            "--env",
            "World",
            "--interval-ms",
            "250",
            "--iterations",
            "5",
            "--display",
            "png",
            "--output-dir",
            "out",
            "--skip-missing",
        ])
        .unwrap();

        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.core.path, PathBuf::from("cores/other_libretro.so"));
        assert_eq!(config.environments, vec!["Hello", "World"]);
        assert_eq!(config.driver.interval_ms, 250);
        assert_eq!(config.driver.max_iterations, Some(5));
        assert_eq!(config.display.backend, DisplayBackend::Png);
        assert_eq!(config.display.output_dir, PathBuf::from("out"));
        assert_eq!(config.driver.on_missing_frame, FailurePolicy::Skip);
        assert_eq!(config.driver.on_display_error, FailurePolicy::Abort);
    }

    #[test]
    fn test_unknown_display_rejected() {
        assert!(Args::try_parse_from(["retroenv", "--display", "crt"]).is_err());
    }
}
