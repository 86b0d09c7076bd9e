//! Projection matrix helpers
//!
//! Matrices are column-major, so element `P[col][row]` lives at `col * 4 + row`.

use crate::pipeline::messages::Matrix4Data;

/// Angular extent of the camera view, in radians
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldOfView {
    pub vertical: f64,
    pub horizontal: f64,
}

impl FieldOfView {
    /// Derive the field of view from an OpenGL style projection
    pub fn from_projection(projection: &Matrix4Data) -> Self {
        let p00 = f64::from(projection[0]);
        let p11 = f64::from(projection[5]);

        let vertical = 2.0 * (1.0 / p11).atan();
        let aspect = p11 / p00;
        let horizontal = 2.0 * (aspect * (vertical / 2.0).tan()).atan();

        Self {
            vertical,
            horizontal,
        }
    }

    pub fn vertical_degrees(&self) -> f64 {
        self.vertical.to_degrees()
    }

    pub fn horizontal_degrees(&self) -> f64 {
        self.horizontal.to_degrees()
    }
}

/// Rescale rows 0 and 1 so the projection maps onto the letterboxed content
/// area instead of the full processing frame
pub fn rescale_to_content(
    projection: &Matrix4Data,
    processing: (u32, u32),
    content: (u32, u32),
) -> Matrix4Data {
    let sx = processing.0 as f32 / content.0.max(1) as f32;
    let sy = processing.1 as f32 / content.1.max(1) as f32;

    let mut out = *projection;
    for col in 0..4 {
        out[col * 4] *= sx;
        out[col * 4 + 1] *= sy;
    }
    out
}

/// Build an OpenGL projection from pinhole intrinsics at a given image size.
///
/// Image rows grow downwards while clip space y grows upwards.
pub fn from_intrinsics(
    (fx, fy): (f64, f64),
    (cx, cy): (f64, f64),
    (width, height): (f64, f64),
    near: f64,
    far: f64,
) -> Matrix4Data {
    let mut m = [0.0f64; 16];
    m[0] = 2.0 * fx / width;
    m[5] = 2.0 * fy / height;
    m[8] = 1.0 - 2.0 * cx / width;
    m[9] = 2.0 * cy / height - 1.0;
    m[10] = -(far + near) / (far - near);
    m[11] = -1.0;
    m[14] = -2.0 * far * near / (far - near);

    m.map(|v| v as f32)
}
