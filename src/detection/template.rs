//! Template matching marker engine
//!
//! Markers are located by brute force: the frame is converted to luma, reduced
//! 4× by box averaging and every marker template is slid over it. The best
//! window by mean absolute difference wins if it is under the marker's error
//! bound. The pose assumes the marker faces the camera.
//!
//! Camera file (JSON): `{ "width", "height", "fx", "fy", "cx", "cy", "near"?, "far"? }`
//! with intrinsics in pixels of the calibrated `width` × `height` image.
//!
//! Each marker reference `path/name` names three files:
//! - `path/name.iset`: the marker image, any format the `image` crate decodes
//! - `path/name.fset`: JSON `{ "dpi"?, "max_error"? }`
//! - `path/name.fset3`: JSON `{ "scales": [...] }`, template widths in reduced pixels

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbaImage};
use log::{debug, info, trace, warn};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::engine::{DetectionError, MarkerEngine, MarkerHit};
use super::kernel::MatchKernel;
use super::projection;
use crate::markers::MarkerCalibration;
use crate::pipeline::messages::{LoadRequest, Matrix4Data};
use crate::pipeline::types::{BYTES_PER_PIXEL, FrameBuffer};

/// Reduction factor between the processing frame and the search image
pub const DOWNSAMPLE: usize = 4;

const DEFAULT_DPI: f64 = 150.0;
const DEFAULT_MAX_ERROR: f64 = 24.0;
const MM_PER_INCH: f64 = 25.4;

/// Coarse search stride in reduced pixels
const COARSE_STEP: usize = 2;

#[derive(Debug, Clone, Deserialize)]
struct CameraFile {
    width: f64,
    height: f64,
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    #[serde(default = "default_near")]
    near: f64,
    #[serde(default = "default_far")]
    far: f64,
}

fn default_near() -> f64 {
    10.0
}

fn default_far() -> f64 {
    10000.0
}

impl CameraFile {
    fn validate(&self) -> Result<(), DetectionError> {
        let positive = [self.width, self.height, self.fx, self.fy];
        if positive.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(DetectionError::InvalidCamera(format!(
                "size and focal lengths must be positive, got {}x{} f=({}, {})",
                self.width, self.height, self.fx, self.fy
            )));
        }
        if !(self.near > 0.0 && self.far > self.near) {
            return Err(DetectionError::InvalidCamera(format!(
                "clip planes must satisfy 0 < near < far, got {} / {}",
                self.near, self.far
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FeatureSet {
    #[serde(default = "default_dpi")]
    dpi: f64,
    #[serde(default)]
    max_error: Option<f64>,
}

fn default_dpi() -> f64 {
    DEFAULT_DPI
}

#[derive(Debug, Deserialize)]
struct ScaleSet {
    scales: Vec<u32>,
}

/// Pinhole intrinsics at processing resolution
#[derive(Debug, Clone, Copy)]
struct Intrinsics {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
}

#[derive(Debug)]
struct Template {
    width: usize,
    height: usize,
    luma: Vec<u8>,
}

#[derive(Debug)]
struct MarkerModel {
    calibration: MarkerCalibration,
    max_error: f64,
    templates: Vec<Template>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    marker: usize,
    x: usize,
    y: usize,
    width: usize,
    mad: f64,
}

/// Rec. 709 luma with 8-bit fixed point weights
#[inline]
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((54 * u32::from(r) + 183 * u32::from(g) + 19 * u32::from(b) + 128) >> 8) as u8
}

fn luma_into(rgba: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.extend(
        rgba.chunks_exact(BYTES_PER_PIXEL)
            .map(|px| luma(px[0], px[1], px[2])),
    );
}

/// Box-average `src` by `DOWNSAMPLE` in both directions. Trailing rows and
/// columns that do not fill a whole box are dropped.
fn downsample_into(src: &[u8], width: usize, height: usize, out: &mut Vec<u8>) -> (usize, usize) {
    let rw = width / DOWNSAMPLE;
    let rh = height / DOWNSAMPLE;
    let area = (DOWNSAMPLE * DOWNSAMPLE) as u32;

    out.clear();
    out.reserve(rw * rh);
    for ry in 0..rh {
        for rx in 0..rw {
            let mut sum = 0u32;
            for dy in 0..DOWNSAMPLE {
                let row = (ry * DOWNSAMPLE + dy) * width + rx * DOWNSAMPLE;
                sum += src[row..row + DOWNSAMPLE]
                    .iter()
                    .map(|&v| u32::from(v))
                    .sum::<u32>();
            }
            out.push(((sum + area / 2) / area) as u8);
        }
    }
    (rw, rh)
}

fn sibling(base: &str, extension: &str) -> PathBuf {
    let mut path = OsString::from(base);
    path.push(".");
    path.push(extension);
    PathBuf::from(path)
}

fn read_file(path: &Path) -> Result<Vec<u8>, DetectionError> {
    std::fs::read(path).map_err(|source| DetectionError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, DetectionError> {
    let bytes = read_file(path)?;
    serde_json::from_slice(&bytes).map_err(|source| DetectionError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Brute force marker engine over reduced luma frames
pub struct TemplateEngine {
    intrinsics: Option<Intrinsics>,
    processing: (u32, u32),
    markers: Vec<MarkerModel>,
    kernel: MatchKernel,
    luma: Vec<u8>,
    reduced: Vec<u8>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self {
            intrinsics: None,
            processing: (0, 0),
            markers: Vec::new(),
            kernel: MatchKernel::Scalar,
            luma: Vec::new(),
            reduced: Vec::new(),
        }
    }

    pub fn kernel(&self) -> MatchKernel {
        self.kernel
    }

    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    fn load_marker(base: &str) -> Result<MarkerModel, DetectionError> {
        let image_path = sibling(base, "iset");
        let features_path = sibling(base, "fset");
        let scales_path = sibling(base, "fset3");

        let features: FeatureSet = read_json(&features_path)?;
        let scales: ScaleSet = read_json(&scales_path)?;
        let bytes = read_file(&image_path)?;
        let image: RgbaImage = image::load_from_memory(&bytes)
            .map_err(|source| DetectionError::Image {
                path: image_path.clone(),
                source,
            })?
            .to_rgba8();

        let invalid = |reason: String| DetectionError::InvalidMarker {
            path: PathBuf::from(base),
            reason,
        };
        if !(features.dpi.is_finite() && features.dpi > 0.0) {
            return Err(invalid(format!("dpi must be positive, got {}", features.dpi)));
        }
        if scales.scales.is_empty() || scales.scales.contains(&0) {
            return Err(invalid("scales must be a non-empty list of widths".into()));
        }

        let (width, height) = image.dimensions();
        let mut luma_pixels = Vec::with_capacity(width as usize * height as usize);
        luma_into(image.as_raw(), &mut luma_pixels);
        let gray = GrayImage::from_raw(width, height, luma_pixels)
            .ok_or_else(|| invalid("image buffer has the wrong size".into()))?;

        let templates = scales
            .scales
            .iter()
            .map(|&scale| {
                let th = ((f64::from(scale) * f64::from(height) / f64::from(width)).round() as u32)
                    .max(1);
                let resized = imageops::resize(&gray, scale, th, FilterType::Triangle);
                Template {
                    width: scale as usize,
                    height: th as usize,
                    luma: resized.into_raw(),
                }
            })
            .collect();

        Ok(MarkerModel {
            calibration: MarkerCalibration {
                width: f64::from(width),
                height: f64::from(height),
                dpi: features.dpi,
            },
            max_error: features.max_error.unwrap_or(DEFAULT_MAX_ERROR),
            templates,
        })
    }

    /// Sum of absolute differences of `template` at (`x`, `y`), or `None` once
    /// the running sum exceeds `limit`
    fn window_sad(
        &self,
        reduced_width: usize,
        template: &Template,
        x: usize,
        y: usize,
        limit: u32,
    ) -> Option<u32> {
        let mut sum = 0u32;
        for row in 0..template.height {
            let start = (y + row) * reduced_width + x;
            let frame_row = &self.reduced[start..start + template.width];
            let template_row = &template.luma[row * template.width..(row + 1) * template.width];
            sum += self.kernel.sad(frame_row, template_row);
            if sum > limit {
                return None;
            }
        }
        Some(sum)
    }

    fn search(&self, reduced_width: usize, reduced_height: usize) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;

        for (marker_index, marker) in self.markers.iter().enumerate() {
            for template in &marker.templates {
                if template.width > reduced_width || template.height > reduced_height {
                    continue;
                }
                let area = (template.width * template.height) as f64;
                let bound = best.map_or(marker.max_error, |b| b.mad.min(marker.max_error));
                let mut limit = (bound * area) as u32;
                let mut found: Option<(usize, usize, u32)> = None;

                let max_x = reduced_width - template.width;
                let max_y = reduced_height - template.height;
                for y in (0..=max_y).step_by(COARSE_STEP) {
                    for x in (0..=max_x).step_by(COARSE_STEP) {
                        if let Some(sad) = self.window_sad(reduced_width, template, x, y, limit)
                            && found.is_none_or(|(_, _, s)| sad < s)
                        {
                            found = Some((x, y, sad));
                            limit = sad;
                        }
                    }
                }

                // refine around the coarse hit
                if let Some((cx, cy, _)) = found {
                    for y in cy.saturating_sub(1)..=(cy + 1).min(max_y) {
                        for x in cx.saturating_sub(1)..=(cx + 1).min(max_x) {
                            if let Some(sad) =
                                self.window_sad(reduced_width, template, x, y, limit)
                                && found.is_none_or(|(_, _, s)| sad < s)
                            {
                                found = Some((x, y, sad));
                                limit = sad;
                            }
                        }
                    }
                }

                if let Some((x, y, sad)) = found {
                    let mad = f64::from(sad) / area;
                    if best.is_none_or(|b| mad < b.mad) {
                        best = Some(Candidate {
                            marker: marker_index,
                            x,
                            y,
                            width: template.width,
                            mad,
                        });
                    }
                }
            }
        }

        best
    }

    /// Fronto-parallel pose of a candidate, origin at the marker's top-left corner
    fn pose(&self, intrinsics: Intrinsics, candidate: &Candidate) -> Matrix4Data {
        let calibration = &self.markers[candidate.marker].calibration;
        let marker_mm = calibration.width / calibration.dpi * MM_PER_INCH;

        let u = (candidate.x * DOWNSAMPLE) as f64;
        let v = (candidate.y * DOWNSAMPLE) as f64;
        let width_px = (candidate.width * DOWNSAMPLE) as f64;

        let z = intrinsics.fx * marker_mm / width_px;
        let x = (u - intrinsics.cx) * z / intrinsics.fx;
        let y = (v - intrinsics.cy) * z / intrinsics.fy;

        let mut transform = [0.0f32; 16];
        transform[0] = 1.0;
        transform[5] = 1.0;
        transform[10] = 1.0;
        transform[15] = 1.0;
        // image y points down and the camera looks down -z
        transform[12] = x as f32;
        transform[13] = -y as f32;
        transform[14] = -z as f32;
        transform
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerEngine for TemplateEngine {
    fn load_camera(&mut self, request: &LoadRequest) -> Result<Matrix4Data, DetectionError> {
        let path = PathBuf::from(&request.camera_calibration_ref);
        let camera: CameraFile = read_json(&path)?;
        camera.validate()?;

        if request.pw == 0 || request.ph == 0 {
            return Err(DetectionError::InvalidCamera(format!(
                "processing size {}x{} is empty",
                request.pw, request.ph
            )));
        }

        let (pw, ph) = (f64::from(request.pw), f64::from(request.ph));
        let sx = pw / camera.width;
        let sy = ph / camera.height;
        let intrinsics = Intrinsics {
            fx: camera.fx * sx,
            fy: camera.fy * sy,
            cx: camera.cx * sx,
            cy: camera.cy * sy,
        };

        self.intrinsics = Some(intrinsics);
        self.processing = (request.pw, request.ph);
        self.kernel = MatchKernel::select(request.simd_capable);

        let pixels = request.pw as usize * request.ph as usize;
        self.luma = Vec::with_capacity(pixels);
        self.reduced = Vec::with_capacity(pixels / (DOWNSAMPLE * DOWNSAMPLE));

        info!(
            "TemplateEngine: camera {} loaded for {}x{} ({:?} kernel)",
            path.display(),
            request.pw,
            request.ph,
            self.kernel
        );

        Ok(projection::from_intrinsics(
            (intrinsics.fx, intrinsics.fy),
            (intrinsics.cx, intrinsics.cy),
            (pw, ph),
            camera.near,
            camera.far,
        ))
    }

    fn load_markers(&mut self, refs: &[String]) -> Result<Vec<MarkerCalibration>, DetectionError> {
        if refs.is_empty() {
            return Err(DetectionError::NoMarkers);
        }

        let mut markers = Vec::with_capacity(refs.len());
        for (index, base) in refs.iter().enumerate() {
            let model = Self::load_marker(base)?;
            debug!(
                "TemplateEngine: marker {} from {}: {}x{} px at {} dpi, {} templates",
                index,
                base,
                model.calibration.width,
                model.calibration.height,
                model.calibration.dpi,
                model.templates.len()
            );
            markers.push(model);
        }

        let infos = markers.iter().map(|m| m.calibration).collect();
        self.markers = markers;
        Ok(infos)
    }

    fn detect(&mut self, frame: &FrameBuffer) -> Option<MarkerHit> {
        let intrinsics = self.intrinsics?;
        if self.markers.is_empty() {
            return None;
        }
        if (frame.width(), frame.height()) != self.processing {
            warn!(
                "TemplateEngine: frame is {}x{}, expected {}x{}",
                frame.width(),
                frame.height(),
                self.processing.0,
                self.processing.1
            );
            return None;
        }

        let width = frame.width() as usize;
        let height = frame.height() as usize;
        luma_into(frame.pixels(), &mut self.luma);
        let (rw, rh) = downsample_into(&self.luma, width, height, &mut self.reduced);

        let candidate = self.search(rw, rh)?;
        trace!(
            "TemplateEngine: marker {} at ({}, {}) width {} mad {:.2}",
            candidate.marker, candidate.x, candidate.y, candidate.width, candidate.mad
        );

        Some(MarkerHit {
            index: candidate.marker,
            transform: self.pose(intrinsics, &candidate),
        })
    }

    fn unload(&mut self) {
        self.intrinsics = None;
        self.processing = (0, 0);
        self.markers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::fixtures;

    fn load_request(camera: &Path, simd_capable: bool) -> LoadRequest {
        LoadRequest {
            pw: 640,
            ph: 480,
            min_cutoff_filter: 0.0001,
            beta_filter: 0.01,
            camera_calibration_ref: camera.to_string_lossy().into_owned(),
            marker_refs: Vec::new(),
            simd_capable,
        }
    }

    #[test]
    fn test_luma_weights() {
        assert_eq!(luma(0, 0, 0), 0);
        assert_eq!(luma(255, 255, 255), 255);
        // green dominates, blue contributes least
        assert!(luma(0, 255, 0) > luma(255, 0, 0));
        assert!(luma(255, 0, 0) > luma(0, 0, 255));
        assert_eq!(luma(255, 0, 0), 54);
    }

    #[test]
    fn test_downsample_averages_boxes() {
        let width = 8;
        let height = 4;
        let mut src = vec![0u8; width * height];
        for y in 0..height {
            for x in 4..8 {
                src[y * width + x] = 200;
            }
        }
        src[0] = 160;

        let mut out = Vec::new();
        assert_eq!(downsample_into(&src, width, height, &mut out), (2, 1));
        assert_eq!(out, vec![10, 200]);
    }

    #[test]
    fn test_load_and_detect() {
        let dir = fixtures::scratch_dir("template-detect");
        let camera = fixtures::write_camera(&dir);
        let refs = vec![
            fixtures::write_marker_set(&dir, "first", 0),
            fixtures::write_marker_set(&dir, "second", 1),
        ];

        for simd in [false, true] {
            let mut engine = TemplateEngine::new();
            let projection = engine.load_camera(&load_request(&camera, simd)).unwrap();
            assert!(projection[0] > 0.0);
            assert_eq!(engine.kernel(), MatchKernel::select(simd));

            let infos = engine.load_markers(&refs).unwrap();
            assert_eq!(infos.len(), 2);
            assert_eq!(infos[1].width, fixtures::MARKER_SIZE as f64);
            assert_eq!(infos[1].dpi, 150.0);

            let frame = fixtures::frame_with_marker(1, (192, 160));
            let hit = engine.detect(&frame).expect("marker 1 should be found");
            assert_eq!(hit.index, 1);
            // in front of the camera, top-left corner left of and above center
            assert!(hit.transform[14] < 0.0);
            assert!(hit.transform[12] < 0.0);
            assert!(hit.transform[13] > 0.0);

            let frame = fixtures::frame_with_marker(0, (320, 240));
            assert_eq!(engine.detect(&frame).map(|h| h.index), Some(0));

            assert!(engine.detect(&fixtures::empty_frame()).is_none());
        }
    }

    #[test]
    fn test_detect_requires_loading() {
        let mut engine = TemplateEngine::new();
        assert!(engine.detect(&fixtures::empty_frame()).is_none());
    }

    #[test]
    fn test_wrong_frame_size_is_ignored() {
        let dir = fixtures::scratch_dir("template-size");
        let camera = fixtures::write_camera(&dir);
        let refs = vec![fixtures::write_marker_set(&dir, "only", 0)];
        let mut engine = TemplateEngine::new();
        engine.load_camera(&load_request(&camera, false)).unwrap();
        engine.load_markers(&refs).unwrap();

        assert!(engine.detect(&FrameBuffer::new(320, 240)).is_none());
    }

    #[test]
    fn test_missing_marker_file() {
        let dir = fixtures::scratch_dir("template-missing");
        let base = fixtures::write_marker_set(&dir, "partial", 0);
        std::fs::remove_file(sibling(&base, "fset3")).unwrap();

        let mut engine = TemplateEngine::new();
        let err = engine.load_markers(&[base]).unwrap_err();
        assert!(matches!(err, DetectionError::Io { .. }), "{}", err);
        assert!(err.to_string().contains("fset3"));
    }

    #[test]
    fn test_bad_camera_file() {
        let dir = fixtures::scratch_dir("template-camera");
        let path = dir.join("camera.json");
        std::fs::write(&path, r#"{"width": 640, "height": 480, "fx": 0, "fy": 500, "cx": 320, "cy": 240}"#)
            .unwrap();

        let mut engine = TemplateEngine::new();
        let err = engine.load_camera(&load_request(&path, false)).unwrap_err();
        assert!(matches!(err, DetectionError::InvalidCamera(_)));

        std::fs::write(&path, "not json").unwrap();
        let err = engine.load_camera(&load_request(&path, false)).unwrap_err();
        assert!(matches!(err, DetectionError::Parse { .. }));
    }

    #[test]
    fn test_no_markers() {
        let mut engine = TemplateEngine::new();
        assert!(matches!(
            engine.load_markers(&[]),
            Err(DetectionError::NoMarkers)
        ));
    }

    #[test]
    fn test_unload() {
        let dir = fixtures::scratch_dir("template-unload");
        let camera = fixtures::write_camera(&dir);
        let refs = vec![fixtures::write_marker_set(&dir, "m", 0)];
        let mut engine = TemplateEngine::new();
        engine.load_camera(&load_request(&camera, false)).unwrap();
        engine.load_markers(&refs).unwrap();
        assert_eq!(engine.marker_count(), 1);

        engine.unload();
        assert_eq!(engine.marker_count(), 0);
        assert!(engine.detect(&fixtures::frame_with_marker(0, (192, 160))).is_none());
    }
}
