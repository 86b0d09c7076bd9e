//! Letterboxing camera frames into the processing resolution
//!
//! The camera image is scaled so its longer side (measured in a 4:3 box) fits
//! the target long edge, then centered in a 4:3 processing frame. The bars are
//! opaque black.

use image::RgbaImage;

use crate::pipeline::types::{BYTES_PER_PIXEL, FrameBuffer};

const BAR: [u8; 4] = [0, 0, 0, 255];

/// Placement of the camera image inside the processing frame.
///
/// All sizes are whole pixels, truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingGeometry {
    /// Camera resolution
    pub source: (u32, u32),
    /// Size of the scaled camera image
    pub content: (u32, u32),
    /// Size of the processing frame
    pub processing: (u32, u32),
    /// Top-left corner of the content inside the processing frame
    pub offset: (u32, u32),
}

impl ProcessingGeometry {
    pub fn compute(source_width: u32, source_height: u32, long_edge: u32) -> Self {
        let vw = f64::from(source_width);
        let vh = f64::from(source_height);

        let scale = f64::from(long_edge) / vw.max(vh / 3.0 * 4.0);
        let w = vw * scale;
        let h = vh * scale;
        let pw = w.max(h / 3.0 * 4.0);
        let ph = h.max(w / 4.0 * 3.0);

        Self {
            source: (source_width, source_height),
            content: (w as u32, h as u32),
            processing: (pw as u32, ph as u32),
            offset: (((pw - w) / 2.0) as u32, ((ph - h) / 2.0) as u32),
        }
    }
}

/// Precomputed nearest-neighbour mapping from camera to processing frame
#[derive(Debug, Clone)]
pub struct Letterbox {
    geometry: ProcessingGeometry,
    /// Source column for each content column
    columns: Vec<u32>,
    /// Source row for each content row
    rows: Vec<u32>,
}

fn sample_map(content: u32, source: u32) -> Vec<u32> {
    let content = u64::from(content.max(1));
    let source = u64::from(source);
    (0..content)
        .map(|i| ((2 * i + 1) * source / (2 * content)).min(source.saturating_sub(1)) as u32)
        .collect()
}

impl Letterbox {
    pub fn new(geometry: ProcessingGeometry) -> Self {
        Self {
            columns: sample_map(geometry.content.0, geometry.source.0),
            rows: sample_map(geometry.content.1, geometry.source.1),
            geometry,
        }
    }

    pub fn geometry(&self) -> &ProcessingGeometry {
        &self.geometry
    }

    /// Draw `frame` into `out`.
    ///
    /// Returns `false` without touching `out` if either size does not match
    /// the geometry.
    pub fn fill(&self, frame: &RgbaImage, out: &mut FrameBuffer) -> bool {
        let g = &self.geometry;
        if frame.dimensions() != g.source || (out.width(), out.height()) != g.processing {
            return false;
        }

        let (pw, ph) = (g.processing.0 as usize, g.processing.1 as usize);
        let (ox, oy) = (g.offset.0 as usize, g.offset.1 as usize);
        let (cw, ch) = (self.columns.len(), self.rows.len());
        let src = frame.as_raw();
        let src_stride = g.source.0 as usize * BYTES_PER_PIXEL;
        let dst_stride = pw * BYTES_PER_PIXEL;
        let dst = out.pixels_mut();

        for (y, row) in dst.chunks_exact_mut(dst_stride).enumerate().take(ph) {
            if y < oy || y >= oy + ch {
                for px in row.chunks_exact_mut(BYTES_PER_PIXEL) {
                    px.copy_from_slice(&BAR);
                }
                continue;
            }

            let src_row = &src[self.rows[y - oy] as usize * src_stride..][..src_stride];
            for (x, px) in row.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
                if x < ox || x >= ox + cw {
                    px.copy_from_slice(&BAR);
                } else {
                    let sx = self.columns[x - ox] as usize * BYTES_PER_PIXEL;
                    px.copy_from_slice(&src_row[sx..sx + BYTES_PER_PIXEL]);
                }
            }
        }
        true
    }
}
