//! Frames produced by environments
//!
//! Cores hand the frontend packed framebuffers in one of three libretro pixel
//! formats. [`RawFrame`] keeps the bytes exactly as presented (including row
//! padding) and converts them to tightly packed RGBA8 [`Frame`]s on demand.

use std::collections::BTreeMap;

use crate::error::{FrameError, LookupError};

/// Libretro pixel formats (`enum retro_pixel_format`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// 0RGB1555, native endian (the libretro default)
    #[default]
    Rgb1555,
    /// XRGB8888, native endian
    Xrgb8888,
    /// RGB565, native endian
    Rgb565,
}

impl PixelFormat {
    /// Map a raw `retro_pixel_format` value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Rgb1555),
            1 => Some(Self::Xrgb8888),
            2 => Some(Self::Rgb565),
            _ => None,
        }
    }

    /// Bytes per pixel in the packed source buffer.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb1555 | Self::Rgb565 => 2,
            Self::Xrgb8888 => 4,
        }
    }
}

/// A framebuffer as handed over by the core's video refresh callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row in `data` (may include padding)
    pub pitch: usize,
    pub format: PixelFormat,
}

impl RawFrame {
    /// Convert to tightly packed RGBA8.
    pub fn to_rgba(&self) -> Result<Vec<u8>, FrameError> {
        let width = self.width as usize;
        let height = self.height as usize;
        let bpp = self.format.bytes_per_pixel();
        let row_bytes = width * bpp;

        // The last row does not need to carry padding.
        let needed = if height == 0 {
            0
        } else {
            self.pitch * (height - 1) + row_bytes
        };
        if self.pitch < row_bytes || self.data.len() < needed {
            return Err(FrameError::Truncated {
                width: self.width,
                height: self.height,
                pitch: self.pitch,
                needed,
                actual: self.data.len(),
            });
        }

        let mut rgba = Vec::with_capacity(width * height * 4);
        for row in 0..height {
            let start = row * self.pitch;
            let line = &self.data[start..start + row_bytes];
            match self.format {
                PixelFormat::Rgb1555 => {
                    for px in line.chunks_exact(2) {
                        let v = u16::from_le_bytes([px[0], px[1]]);
                        rgba.extend_from_slice(&[
                            expand5((v >> 10) & 0x1f),
                            expand5((v >> 5) & 0x1f),
                            expand5(v & 0x1f),
                            0xff,
                        ]);
                    }
                }
                PixelFormat::Rgb565 => {
                    for px in line.chunks_exact(2) {
                        let v = u16::from_le_bytes([px[0], px[1]]);
                        rgba.extend_from_slice(&[
                            expand5((v >> 11) & 0x1f),
                            expand6((v >> 5) & 0x3f),
                            expand5(v & 0x1f),
                            0xff,
                        ]);
                    }
                }
                PixelFormat::Xrgb8888 => {
                    for px in line.chunks_exact(4) {
                        // Little-endian XRGB: B, G, R, X
                        rgba.extend_from_slice(&[px[2], px[1], px[0], 0xff]);
                    }
                }
            }
        }
        Ok(rgba)
    }
}

fn expand5(v: u16) -> u8 {
    ((v << 3) | (v >> 2)) as u8
}

fn expand6(v: u16) -> u8 {
    ((v << 2) | (v >> 4)) as u8
}

/// An RGBA8 snapshot of one environment's display.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8, `width * height * 4` bytes
    pub pixels: Vec<u8>,
    /// Number of steps the environment had run when this frame was taken
    pub sequence: u64,
    /// Intended width / height on screen; `None` means square pixels
    pub display_aspect: Option<f32>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>, sequence: u64) -> Self {
        debug_assert_eq!(pixels.len(), width as usize * height as usize * 4);
        Self {
            width,
            height,
            pixels,
            sequence,
            display_aspect: None,
        }
    }

    /// Attach the aspect ratio the picture should be shown at.
    pub fn with_aspect(mut self, aspect: f32) -> Self {
        self.display_aspect = (aspect.is_finite() && aspect > 0.0).then_some(aspect);
        self
    }

    /// Width / height the picture should be shown at.
    pub fn aspect(&self) -> f32 {
        match self.display_aspect {
            Some(aspect) => aspect,
            None if self.height > 0 => self.width as f32 / self.height as f32,
            None => 1.0,
        }
    }

    /// Convert a raw core framebuffer.
    pub fn from_raw(raw: &RawFrame, sequence: u64) -> Result<Self, FrameError> {
        Ok(Self::new(raw.width, raw.height, raw.to_rgba()?, sequence))
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Frames from a single `run()` call, keyed by environment name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMap {
    frames: BTreeMap<String, Frame>,
}

impl FrameMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, frame: Frame) {
        self.frames.insert(name.into(), frame);
    }

    /// Look up the frame for `name`.
    pub fn get(&self, name: &str) -> Result<&Frame, LookupError> {
        self.frames.get(name).ok_or_else(|| LookupError {
            name: name.to_string(),
            available: self.names(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.frames.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.frames.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Frame)> {
        self.frames.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Frame)> for FrameMap {
    fn from_iter<T: IntoIterator<Item = (String, Frame)>>(iter: T) -> Self {
        Self {
            frames: iter.into_iter().collect(),
        }
    }
}
