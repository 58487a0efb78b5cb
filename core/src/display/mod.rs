//! Frame presentation
//!
//! A [`FrameSink`] shows one frame under a title. The driver picks a sink from
//! [`DisplayConfig`]: a native window, PNG files on disk, or nothing at all.

mod png;
#[cfg(feature = "window")]
mod window;

pub use self::png::PngSink;
#[cfg(feature = "window")]
pub use self::window::WindowSink;

use crate::config::{DisplayBackend, DisplayConfig};
use crate::error::DisplayError;
use crate::frame::Frame;

/// Something that can present frames.
pub trait FrameSink {
    /// Present `frame` under `title`, replacing whatever was shown there before.
    fn show(&mut self, title: &str, frame: &Frame) -> Result<(), DisplayError>;

    /// Release any resources held for shown titles.
    fn close(&mut self) {}
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn show(&mut self, title: &str, frame: &Frame) -> Result<(), DisplayError> {
        (**self).show(title, frame)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Sink that only logs what it would have shown.
#[derive(Debug, Default)]
pub struct HeadlessSink {
    shown: u64,
}

impl HeadlessSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames accepted so far.
    pub fn shown(&self) -> u64 {
        self.shown
    }
}

impl FrameSink for HeadlessSink {
    fn show(&mut self, title: &str, frame: &Frame) -> Result<(), DisplayError> {
        self.shown += 1;
        tracing::debug!(
            "[{}] frame {} ({}x{})",
            title,
            frame.sequence,
            frame.width,
            frame.height
        );
        Ok(())
    }
}

/// Create the sink selected by `config`.
pub fn open(config: &DisplayConfig) -> Result<Box<dyn FrameSink>, DisplayError> {
    match config.backend {
        DisplayBackend::Window => open_window(config),
        DisplayBackend::Png => Ok(Box::new(PngSink::new(
            &config.output_dir,
            config.keep_history,
        )?)),
        DisplayBackend::Headless => Ok(Box::new(HeadlessSink::new())),
    }
}

#[cfg(feature = "window")]
fn open_window(config: &DisplayConfig) -> Result<Box<dyn FrameSink>, DisplayError> {
    Ok(Box::new(WindowSink::new(config.scale)?))
}

#[cfg(not(feature = "window"))]
fn open_window(_config: &DisplayConfig) -> Result<Box<dyn FrameSink>, DisplayError> {
    Err(DisplayError::Unavailable("window"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_sink_accepts_frames() {
        let mut sink = HeadlessSink::new();
        let frame = Frame::new(1, 1, vec![0, 0, 0, 255], 1);
        sink.show("Hello", &frame).unwrap();
        sink.show("Hello", &frame).unwrap();
        assert_eq!(sink.shown(), 2);
    }

    #[test]
    fn test_open_headless() {
        let config = DisplayConfig {
            backend: DisplayBackend::Headless,
            ..Default::default()
        };
        let mut sink = open(&config).unwrap();
        let frame = Frame::new(1, 1, vec![0, 0, 0, 255], 1);
        assert!(sink.show("Hello", &frame).is_ok());
        sink.close();
    }

    #[test]
    fn test_open_png_creates_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = DisplayConfig {
            backend: DisplayBackend::Png,
            output_dir: dir.path().join("frames"),
            ..Default::default()
        };
        let _sink = open(&config).unwrap();
        assert!(dir.path().join("frames").is_dir());
    }

    #[cfg(not(feature = "window"))]
    #[test]
    fn test_window_unavailable_without_feature() {
        let config = DisplayConfig::default();
        assert!(matches!(open(&config), Err(DisplayError::Unavailable("window"))));
    }
}
