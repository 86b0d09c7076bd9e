use image::RgbaImage;
use log::info;
use std::path::Path;

use super::traits::{CameraSource, CaptureError};

/// Camera stand-in that shows the same image on every frame
pub struct StillCamera {
    image: RgbaImage,
}

impl StillCamera {
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let image = image::open(path)
            .map_err(|source| CaptureError::Image {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgba8();
        info!(
            "StillCamera: {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );
        Ok(Self::new(image))
    }

    /// Replace the shown image. The resolution must not change.
    pub fn replace(&mut self, image: RgbaImage) -> Result<(), CaptureError> {
        if image.dimensions() != self.image.dimensions() {
            return Err(CaptureError::ResolutionChanged {
                expected: self.image.dimensions(),
                got: image.dimensions(),
            });
        }
        self.image = image;
        Ok(())
    }
}

impl CameraSource for StillCamera {
    fn resolution(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn current_frame(&mut self) -> Result<&RgbaImage, CaptureError> {
        Ok(&self.image)
    }
}
