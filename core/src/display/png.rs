//! PNG file sink

use std::path::PathBuf;

use image::RgbaImage;

use super::FrameSink;
use crate::error::DisplayError;
use crate::frame::Frame;

/// Writes each shown frame to `<output_dir>/<title>.png`.
///
/// With history enabled every frame gets its own timestamped file instead of
/// overwriting the previous one.
#[derive(Debug)]
pub struct PngSink {
    output_dir: PathBuf,
    keep_history: bool,
    written: u64,
}

impl PngSink {
    /// Create the sink, creating `output_dir` if needed.
    pub fn new(output_dir: impl Into<PathBuf>, keep_history: bool) -> Result<Self, DisplayError> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir).map_err(|source| DisplayError::Io {
            path: output_dir.clone(),
            source,
        })?;
        tracing::info!("Writing frames to {}", output_dir.display());

        Ok(Self {
            output_dir,
            keep_history,
            written: 0,
        })
    }

    /// File the next frame for `title` will be written to.
    pub fn path_for(&self, title: &str, frame: &Frame) -> PathBuf {
        let stem = sanitize_filename(title);
        let name = if self.keep_history {
            let now = chrono::Local::now();
            format!(
                "{}_{}_{:06}.png",
                stem,
                now.format("%Y-%m-%d_%H-%M-%S"),
                frame.sequence
            )
        } else {
            format!("{}.png", stem)
        };
        self.output_dir.join(name)
    }

    /// Number of files written so far.
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for PngSink {
    fn show(&mut self, title: &str, frame: &Frame) -> Result<(), DisplayError> {
        if frame.is_empty() {
            return Err(DisplayError::EmptyFrame {
                width: frame.width,
                height: frame.height,
            });
        }

        let image = RgbaImage::from_raw(frame.width, frame.height, frame.pixels.clone())
            .ok_or_else(|| {
                DisplayError::Backend(format!(
                    "pixel buffer of {} bytes does not match {}x{}",
                    frame.pixels.len(),
                    frame.width,
                    frame.height
                ))
            })?;

        let path = self.path_for(title, frame);
        image.save(&path)?;
        self.written += 1;
        tracing::debug!("[{}] frame {} -> {}", title, frame.sequence, path.display());
        Ok(())
    }
}

/// Turn a window title into a file name stem.
///
/// Keeps alphanumerics, `-` and `_`; everything else becomes `_`, with runs
/// collapsed. An empty result becomes `frame`.
fn sanitize_filename(title: &str) -> String {
    let stem = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    if stem.is_empty() {
        "frame".to_string()
    } else {
        stem
    }
}
