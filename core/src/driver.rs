//! Driver loop
//!
//! [`AppContext`] owns a manager and a sink, creates the configured
//! environments and then repeats: step every environment, show each
//! configured environment's frame, sleep for a fixed interval. The loop runs
//! until a [`ShutdownSignal`] is raised or an optional iteration limit is hit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::display::{self, FrameSink};
use crate::error::{DisplayError, RetroError};
use crate::manager::{EnvironmentManager, RetroEnvManager};
use crate::libretro::LibretroLoader;

/// How the loop reacts to a failed per-iteration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the loop and return the error
    #[default]
    Abort,
    /// Log a warning and carry on with the next environment
    Skip,
}

/// Loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// Environments to create and show, in order
    pub environments: Vec<String>,
    /// Fixed sleep after every iteration
    pub interval: Duration,
    /// Stop after this many iterations
    pub max_iterations: Option<u64>,
    pub on_missing_frame: FailurePolicy,
    pub on_display_error: FailurePolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            environments: vec!["Hello".to_string()],
            interval: Duration::from_secs(1),
            max_iterations: None,
            on_missing_frame: FailurePolicy::Abort,
            on_display_error: FailurePolicy::Abort,
        }
    }
}

/// Cloneable stop flag shared between the loop and whoever wants it to stop.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop before its next iteration.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Blocking pause between iterations.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown signal was raised
    Signal,
    /// `max_iterations` was reached
    IterationLimit,
    /// The user closed a display window
    WindowClosed,
}

/// Totals for a finished loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub frames_shown: u64,
    pub frames_skipped: u64,
    pub stopped_by: StopReason,
}

/// A manager and a sink wired together for the loop.
///
/// Both are closed by [`AppContext::close`], or on drop.
pub struct AppContext<M: EnvironmentManager, S: FrameSink> {
    manager: M,
    sink: S,
    config: DriverConfig,
    iterations: u64,
    frames_shown: u64,
    frames_skipped: u64,
    window_closed: bool,
    closed: bool,
}

impl<M: EnvironmentManager, S: FrameSink> AppContext<M, S> {
    /// Create every configured environment.
    ///
    /// On failure the manager and sink are closed before the error is returned.
    pub fn open(mut manager: M, mut sink: S, config: &DriverConfig) -> Result<Self, RetroError> {
        for name in &config.environments {
            if let Err(e) = manager.create_environment(name) {
                manager.close();
                sink.close();
                return Err(e.into());
            }
            tracing::info!("Created environment \"{}\"", name);
        }

        Ok(Self {
            manager,
            sink,
            config: config.clone(),
            iterations: 0,
            frames_shown: 0,
            frames_skipped: 0,
            window_closed: false,
            closed: false,
        })
    }

    /// One iteration without the sleep: step the environments and show their
    /// frames.
    pub fn step(&mut self) -> Result<(), RetroError> {
        let frames = self.manager.run()?;
        self.iterations += 1;
        tracing::info!("Iteration {}: {} frame(s)", self.iterations, frames.len());

        for name in &self.config.environments {
            let frame = match frames.get(name) {
                Ok(frame) => frame,
                Err(e) => match self.config.on_missing_frame {
                    FailurePolicy::Abort => return Err(e.into()),
                    FailurePolicy::Skip => {
                        tracing::warn!("{}; skipping", e);
                        self.frames_skipped += 1;
                        continue;
                    }
                },
            };

            match self.sink.show(name, frame) {
                Ok(()) => self.frames_shown += 1,
                Err(DisplayError::WindowClosed(title)) => {
                    tracing::info!("Window \"{}\" closed, stopping", title);
                    self.window_closed = true;
                    break;
                }
                Err(e) => match self.config.on_display_error {
                    FailurePolicy::Abort => return Err(e.into()),
                    FailurePolicy::Skip => {
                        tracing::warn!("Failed to show \"{}\": {}; skipping", name, e);
                        self.frames_skipped += 1;
                    }
                },
            }
        }
        Ok(())
    }

    /// Iterate until `shutdown` is raised, the iteration limit is hit or a
    /// window is closed.
    pub fn run(
        &mut self,
        sleeper: &mut dyn Sleeper,
        shutdown: &ShutdownSignal,
    ) -> Result<RunSummary, RetroError> {
        let stopped_by = loop {
            if shutdown.is_triggered() {
                break StopReason::Signal;
            }
            if let Some(max) = self.config.max_iterations
                && self.iterations >= max
            {
                break StopReason::IterationLimit;
            }

            self.step()?;
            if self.window_closed {
                shutdown.trigger();
                break StopReason::WindowClosed;
            }
            sleeper.sleep(self.config.interval);
        };

        let summary = self.summary(stopped_by);
        tracing::info!(
            "Stopped after {} iteration(s) ({:?}): {} shown, {} skipped",
            summary.iterations,
            summary.stopped_by,
            summary.frames_shown,
            summary.frames_skipped
        );
        Ok(summary)
    }

    /// Close the manager and sink.
    pub fn close(mut self) {
        self.release();
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    fn summary(&self, stopped_by: StopReason) -> RunSummary {
        RunSummary {
            iterations: self.iterations,
            frames_shown: self.frames_shown,
            frames_skipped: self.frames_skipped,
            stopped_by,
        }
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.manager.close();
        self.sink.close();
    }
}

impl<M: EnvironmentManager, S: FrameSink> Drop for AppContext<M, S> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Build the libretro manager and the configured sink, then run the loop.
pub fn run(config: &Config, shutdown: &ShutdownSignal) -> Result<RunSummary, RetroError> {
    config.validate()?;

    let options = config.core_options();
    for dir in [&options.system_dir, &options.save_dir].into_iter().flatten() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!("Failed to create {}: {}", dir.display(), e);
        }
    }

    let manager = RetroEnvManager::with_loader(
        &config.core.path,
        &config.rom.path,
        LibretroLoader::new(options),
    )?;
    tracing::info!(
        "Manager ready: core {}, ROM {}",
        manager.core_path().display(),
        manager.rom_path().display()
    );

    let sink = display::open(&config.display)?;
    let mut context = AppContext::open(manager, sink, &config.driver_config())?;
    let result = context.run(&mut ThreadSleeper, shutdown);
    context.close();
    result
}
