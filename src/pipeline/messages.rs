//! Messages exchanged between the render side and the detection worker
//!
//! Every variant that carries a [`FrameBuffer`] moves ownership of that buffer
//! to the receiver. The worker always hands the buffer back in its reply so the
//! render side can reuse it for the next capture.
//!
//! The enums are internally tagged on `kind`, which keeps the encoding usable
//! for an out-of-process worker transport.

use serde::{Deserialize, Serialize};

use crate::markers::MarkerCalibration;
use crate::pipeline::types::FrameBuffer;

/// Column-major 4×4 matrix (OpenGL layout)
pub type Matrix4Data = [f32; 16];

/// Parameters for loading the detection worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequest {
    /// Processing resolution
    pub pw: u32,
    pub ph: u32,
    pub min_cutoff_filter: f64,
    pub beta_filter: f64,
    /// Opaque reference to the camera calibration
    pub camera_calibration_ref: String,
    /// Opaque marker references; the position in this list is the marker index
    pub marker_refs: Vec<String>,
    /// Selects the vectorized matching kernel
    pub simd_capable: bool,
}

/// Render side → detection worker
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WorkerRequest {
    Load(LoadRequest),
    Process { exchange: u64, pixels: FrameBuffer },
}

/// Detection worker → render side
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WorkerEvent {
    /// Camera projection at processing resolution, sent once
    Loaded { projection: Matrix4Data },
    /// One record per marker, in load order, sent once
    MarkerInfos { infos: Vec<MarkerCalibration> },
    EndLoading,
    /// Loading failed; the worker is back to unloaded
    LoadFailed { reason: String },
    Found {
        exchange: u64,
        index: usize,
        /// Marker-to-camera transform, column-major, OpenGL right-handed camera space
        transform: Matrix4Data,
        pixels: FrameBuffer,
    },
    #[serde(rename = "not found")]
    NotFound { exchange: u64, pixels: FrameBuffer },
}

impl WorkerEvent {
    /// Exchange id for per-frame replies
    pub fn exchange(&self) -> Option<u64> {
        match self {
            WorkerEvent::Found { exchange, .. } | WorkerEvent::NotFound { exchange, .. } => {
                Some(*exchange)
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Loaded { .. } => "loaded",
            WorkerEvent::MarkerInfos { .. } => "markerInfos",
            WorkerEvent::EndLoading => "endLoading",
            WorkerEvent::LoadFailed { .. } => "loadFailed",
            WorkerEvent::Found { .. } => "found",
            WorkerEvent::NotFound { .. } => "not found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_on_the_wire() {
        let event = WorkerEvent::NotFound {
            exchange: 3,
            pixels: FrameBuffer::new(1, 1),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "not found");
        assert_eq!(json["kind"], event.kind());

        let json = serde_json::to_value(WorkerEvent::MarkerInfos { infos: Vec::new() }).unwrap();
        assert_eq!(json["kind"], "markerInfos");
    }

    #[test]
    fn test_load_request_field_names() {
        let request = WorkerRequest::Load(LoadRequest {
            pw: 640,
            ph: 480,
            min_cutoff_filter: 0.0001,
            beta_filter: 0.01,
            camera_calibration_ref: "camera.json".into(),
            marker_refs: vec!["a".into(), "b".into()],
            simd_capable: true,
        });
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "load");
        assert_eq!(json["cameraCalibrationRef"], "camera.json");
        assert_eq!(json["markerRefs"][1], "b");
        assert_eq!(json["simdCapable"], true);
    }

    #[test]
    fn test_process_round_trip_keeps_pixels() {
        let mut pixels = FrameBuffer::new(2, 1);
        pixels.pixels_mut()[5] = 9;
        let text = serde_json::to_string(&WorkerRequest::Process { exchange: 7, pixels }).unwrap();

        match serde_json::from_str::<WorkerRequest>(&text).unwrap() {
            WorkerRequest::Process { exchange, pixels } => {
                assert_eq!(exchange, 7);
                assert_eq!(pixels.pixels()[5], 9);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }
}
