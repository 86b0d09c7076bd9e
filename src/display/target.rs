//! Renderer interface driven by the tracking coordinator

use image::RgbaImage;
use log::{debug, trace};

use crate::detection::FieldOfView;
use crate::markers::Pose3D;

/// Renderer-owned texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// Everything the tracking session needs from the renderer.
///
/// All calls happen on the render context and must not block.
pub trait RenderTarget {
    /// Allocate a texture for camera frames of the given size
    fn create_texture(&mut self, width: u32, height: u32) -> TextureHandle;

    /// Queue `frame` for upload into `texture`
    fn schedule_upload(&mut self, texture: TextureHandle, frame: &RgbaImage);

    /// Show `texture` as the camera background
    fn present(&mut self, texture: TextureHandle);

    /// Camera field of view, set once after loading
    fn set_field_of_view(&mut self, fov: FieldOfView);

    /// New smoothed pose for a tracked marker
    fn set_marker_pose(&mut self, index: usize, pose: &Pose3D);

    /// A tracked marker was lost. Its last pose stays valid.
    fn marker_lost(&mut self, _index: usize) {}
}

/// Renderer that only logs what it is asked to do
#[derive(Debug, Default)]
pub struct LogRenderer {
    next_texture: u64,
    presented: u64,
}

impl LogRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl RenderTarget for LogRenderer {
    fn create_texture(&mut self, width: u32, height: u32) -> TextureHandle {
        self.next_texture += 1;
        debug!(
            "LogRenderer: texture {} ({}x{})",
            self.next_texture, width, height
        );
        TextureHandle(self.next_texture)
    }

    fn schedule_upload(&mut self, texture: TextureHandle, frame: &RgbaImage) {
        trace!(
            "LogRenderer: upload {}x{} into texture {}",
            frame.width(),
            frame.height(),
            texture.0
        );
    }

    fn present(&mut self, texture: TextureHandle) {
        self.presented += 1;
        trace!("LogRenderer: present texture {}", texture.0);
    }

    fn set_field_of_view(&mut self, fov: FieldOfView) {
        log::info!(
            "LogRenderer: field of view {:.1}° x {:.1}°",
            fov.horizontal_degrees(),
            fov.vertical_degrees()
        );
    }

    fn set_marker_pose(&mut self, index: usize, pose: &Pose3D) {
        let t = pose.translation;
        let (roll, pitch, yaw) = pose.rotation.euler_angles();
        log::info!(
            "LogRenderer: marker {} at ({:.1}, {:.1}, {:.1}) rpy ({:.1}°, {:.1}°, {:.1}°)",
            index,
            t.x,
            t.y,
            t.z,
            roll.to_degrees(),
            pitch.to_degrees(),
            yaw.to_degrees()
        );
    }

    fn marker_lost(&mut self, index: usize) {
        log::info!("LogRenderer: marker {} lost", index);
    }
}
