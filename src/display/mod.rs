//! Camera background display and the renderer seam

pub mod target;
pub mod video_buffer;

pub use target::{LogRenderer, RenderTarget, TextureHandle};
pub use video_buffer::DoubleBuffer;
