//! Camera input
//!
//! Frames come from a [`CameraSource`] at its own resolution and are
//! letterboxed into the fixed processing resolution before detection.

mod letterbox;
mod still;
mod traits;

pub use letterbox::{Letterbox, ProcessingGeometry};
pub use still::StillCamera;
pub use traits::{CameraSource, CaptureError};
