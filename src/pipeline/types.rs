//! Core types for the tracking pipeline

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bytes per RGBA pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// Timestamp representation for filter samples
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Timestamp {
    /// Milliseconds since pipeline start
    pub millis: f64,
}

impl Timestamp {
    /// Create a new timestamp from milliseconds
    pub fn from_millis(millis: f64) -> Self {
        Self { millis }
    }

    /// Create a timestamp from duration since the clock base
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            millis: duration.as_secs_f64() * 1000.0,
        }
    }

    /// Calculate the difference between two timestamps
    pub fn diff(&self, other: Timestamp) -> Duration {
        Duration::from_secs_f64((self.millis - other.millis).abs() / 1000.0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}ms", self.millis)
    }
}

/// RGBA pixel buffer at processing resolution.
///
/// A buffer has exactly one owner at any time: the capture side while it is
/// being filled, the detection side while it is being searched. It is
/// deliberately not `Clone`; handing it over is a move, so the previous owner
/// cannot touch it after the transfer.
#[derive(Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl FrameBuffer {
    /// Allocate a zeroed (transparent black) buffer
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    /// Wrap existing RGBA data. Returns `None` if the length does not match.
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        if pixels.len() != width as usize * height as usize * BYTES_PER_PIXEL {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Size of the pixel data in bytes
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Address of the pixel storage, used to check that a buffer was recycled
    /// rather than reallocated
    pub fn storage_id(&self) -> usize {
        self.pixels.as_ptr() as usize
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("size", &self.byte_len())
            .finish()
    }
}
