//! Traits for camera sources

use image::RgbaImage;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),

    #[error("camera resolution changed from {expected:?} to {got:?}")]
    ResolutionChanged {
        expected: (u32, u32),
        got: (u32, u32),
    },

    #[error("cannot load camera image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Source of camera frames polled once per display tick
pub trait CameraSource {
    /// Resolution of the frames in (width, height)
    fn resolution(&self) -> (u32, u32);

    /// Latest camera frame. An error ends the tracking session.
    fn current_frame(&mut self) -> Result<&RgbaImage, CaptureError>;
}
