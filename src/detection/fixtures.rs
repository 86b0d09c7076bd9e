//! Generated marker files and camera frames for tests

use image::{ImageFormat, Rgba, RgbaImage};
use std::path::{Path, PathBuf};

use crate::pipeline::types::FrameBuffer;

/// Side of a generated marker image in pixels
pub const MARKER_SIZE: u32 = 64;

/// Background gray of generated frames
pub const BACKGROUND: u8 = 128;

const GRID: u32 = 4;
const CODES: [u16; 2] = [0b1010_0110_1001_0101, !0b1010_0110_1001_0101];

/// Fresh directory under the system temp dir, unique per test name and process
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("markertrack-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// 4×4 grid of black and white blocks; `variant` 0 and 1 are inverses
pub fn marker_image(variant: usize) -> RgbaImage {
    let code = CODES[variant % CODES.len()];
    let block = MARKER_SIZE / GRID;
    RgbaImage::from_fn(MARKER_SIZE, MARKER_SIZE, |x, y| {
        let bit = (y / block) * GRID + x / block;
        let v = if code & (1 << bit) != 0 { 255 } else { 0 };
        Rgba([v, v, v, 255])
    })
}

pub fn write_camera(dir: &Path) -> PathBuf {
    let path = dir.join("camera.json");
    std::fs::write(
        &path,
        r#"{"width": 640, "height": 480, "fx": 600.0, "fy": 600.0, "cx": 320.0, "cy": 240.0}"#,
    )
    .unwrap();
    path
}

/// Write `name.iset`, `name.fset` and `name.fset3`; returns the marker reference
pub fn write_marker_set(dir: &Path, name: &str, variant: usize) -> String {
    let base = dir.join(name);
    let base = base.to_string_lossy().into_owned();

    marker_image(variant)
        .save_with_format(format!("{}.iset", base), ImageFormat::Png)
        .unwrap();
    std::fs::write(format!("{}.fset", base), r#"{"dpi": 150}"#).unwrap();
    std::fs::write(format!("{}.fset3", base), r#"{"scales": [24, 32]}"#).unwrap();
    base
}

/// 640×480 camera image with the marker drawn at twice its size
pub fn camera_image_with_marker(variant: usize, (left, top): (u32, u32)) -> RgbaImage {
    let marker = marker_image(variant);
    let mut frame = RgbaImage::from_pixel(640, 480, Rgba([BACKGROUND, BACKGROUND, BACKGROUND, 255]));
    for y in 0..MARKER_SIZE * 2 {
        for x in 0..MARKER_SIZE * 2 {
            frame.put_pixel(left + x, top + y, *marker.get_pixel(x / 2, y / 2));
        }
    }
    frame
}

pub fn frame_with_marker(variant: usize, at: (u32, u32)) -> FrameBuffer {
    let image = camera_image_with_marker(variant, at);
    FrameBuffer::from_pixels(640, 480, image.into_raw()).unwrap()
}

pub fn empty_frame() -> FrameBuffer {
    let image = RgbaImage::from_pixel(640, 480, Rgba([BACKGROUND, BACKGROUND, BACKGROUND, 255]));
    FrameBuffer::from_pixels(640, 480, image.into_raw()).unwrap()
}
