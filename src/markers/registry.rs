//! Registry of tracked markers
//!
//! Markers are registered before tracking starts. Their position in the
//! registry is the index the detection worker reports them under.

use log::{debug, error, info};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::{FilterParams, OneEuroFilter};
use crate::pipeline::messages::Matrix4Data;
use crate::pipeline::types::Timestamp;

use super::pose::Pose3D;

/// Physical description of a marker image, as reported by the detection worker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkerCalibration {
    /// Image width in pixels
    pub width: f64,
    /// Image height in pixels
    pub height: f64,
    /// Print resolution in pixels per inch
    pub dpi: f64,
}

impl MarkerCalibration {
    pub fn is_valid(&self) -> bool {
        self.width > 0.0 && self.height > 0.0 && self.dpi > 0.0
    }

    /// Factor applied to raw detector translations.
    ///
    /// Equals `1 / (width / dpi / dpr)`.
    pub fn translation_scale(&self, device_pixel_ratio: f64) -> f64 {
        device_pixel_ratio * self.dpi / self.width
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("markers cannot be registered once tracking has started")]
    Sealed,

    #[error("unknown marker index {index} ({count} registered)")]
    UnknownMarker { index: usize, count: usize },

    #[error("marker {index} has no calibration yet")]
    Uncalibrated { index: usize },

    #[error("invalid calibration for marker {index}: {calibration:?}")]
    InvalidCalibration {
        index: usize,
        calibration: MarkerCalibration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    /// Never seen, or seen and lost again
    Lost,
    Tracked,
}

/// Handle returned on registration; wraps the marker index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkerHandle(usize);

impl MarkerHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Result of feeding a detection result to a marker
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoseUpdate {
    /// The marker is tracked with this (smoothed) pose
    Tracked(Pose3D),
    /// The marker was tracked until now
    Lost,
    /// The marker was already lost
    Unchanged,
}

#[derive(Debug)]
pub struct Marker {
    source: String,
    calibration: Option<MarkerCalibration>,
    tracking: TrackingState,
    pose: Option<Pose3D>,
    filter: OneEuroFilter,
}

impl Marker {
    fn new(source: String, params: FilterParams) -> Self {
        Self {
            source,
            calibration: None,
            tracking: TrackingState::Lost,
            pose: None,
            filter: OneEuroFilter::new(params),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn calibration(&self) -> Option<&MarkerCalibration> {
        self.calibration.as_ref()
    }

    pub fn tracking(&self) -> TrackingState {
        self.tracking
    }

    pub fn is_tracked(&self) -> bool {
        self.tracking == TrackingState::Tracked
    }

    /// Last exposed pose. Kept after the marker is lost.
    pub fn pose(&self) -> Option<&Pose3D> {
        self.pose.as_ref()
    }

    fn lose(&mut self) -> PoseUpdate {
        // a stale filter history would drag the first pose after reacquisition
        self.filter.reset();
        match std::mem::replace(&mut self.tracking, TrackingState::Lost) {
            TrackingState::Tracked => PoseUpdate::Lost,
            TrackingState::Lost => PoseUpdate::Unchanged,
        }
    }
}

pub struct MarkerRegistry {
    markers: Vec<Marker>,
    filter_params: FilterParams,
    device_pixel_ratio: f64,
    sealed: bool,
    scratch: Vec<f64>,
}

impl MarkerRegistry {
    pub fn new(filter_params: FilterParams, device_pixel_ratio: f64) -> Self {
        Self {
            markers: Vec::new(),
            filter_params,
            device_pixel_ratio,
            sealed: false,
            scratch: Vec::with_capacity(7),
        }
    }

    /// Add a marker by its source reference. Only allowed before tracking starts.
    pub fn register(&mut self, source: impl Into<String>) -> Result<MarkerHandle, RegistryError> {
        if self.sealed {
            return Err(RegistryError::Sealed);
        }
        let source = source.into();
        let index = self.markers.len();
        info!("Registry: marker {} registered from {}", index, source);
        self.markers.push(Marker::new(source, self.filter_params));
        Ok(MarkerHandle(index))
    }

    /// Freeze the marker list. Called when tracking starts.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Marker> {
        self.markers.get(index)
    }

    pub fn markers(&self) -> impl Iterator<Item = &Marker> {
        self.markers.iter()
    }

    /// Source references in registration order
    pub fn sources(&self) -> Vec<String> {
        self.markers.iter().map(|m| m.source.clone()).collect()
    }

    pub fn device_pixel_ratio(&self) -> f64 {
        self.device_pixel_ratio
    }

    pub fn set_calibration(
        &mut self,
        index: usize,
        calibration: MarkerCalibration,
    ) -> Result<(), RegistryError> {
        let count = self.markers.len();
        let marker = self
            .markers
            .get_mut(index)
            .ok_or(RegistryError::UnknownMarker { index, count })?;

        if !calibration.is_valid() {
            error!(
                "Registry: rejecting calibration for marker {}: {:?}",
                index, calibration
            );
            return Err(RegistryError::InvalidCalibration { index, calibration });
        }

        debug!(
            "Registry: marker {} is {}x{} px at {} dpi",
            index, calibration.width, calibration.height, calibration.dpi
        );
        marker.calibration = Some(calibration);
        Ok(())
    }

    /// Feed one detection result for a marker.
    ///
    /// `Some(transform)` is the raw marker-to-camera transform from the
    /// detector. It is scaled to marker units, shifted to the marker's anchor,
    /// smoothed and exposed. `None` means the marker was not seen in the frame.
    pub fn apply_pose(
        &mut self,
        index: usize,
        transform: Option<&Matrix4Data>,
        timestamp: Timestamp,
    ) -> Result<PoseUpdate, RegistryError> {
        let count = self.markers.len();
        let dpr = self.device_pixel_ratio;
        let marker = self
            .markers
            .get_mut(index)
            .ok_or(RegistryError::UnknownMarker { index, count })?;

        let Some(transform) = transform else {
            let update = marker.lose();
            if update == PoseUpdate::Lost {
                debug!("Registry: marker {} lost", index);
            }
            return Ok(update);
        };

        let calibration = marker
            .calibration
            .ok_or(RegistryError::Uncalibrated { index })?;

        let raw = Pose3D::from_transform(transform);
        let anchor = dpr / 2.0;
        let mut rotation = raw.rotation;
        let translation = raw.translation * calibration.translation_scale(dpr)
            + rotation * Vector3::new(anchor, anchor, 0.0);

        // q and -q are the same rotation; keep the filter input continuous.
        // A reset filter has no history to be continuous with.
        if marker.filter.is_initialized()
            && let Some(previous) = marker.pose
            && previous.rotation.coords.dot(&rotation.coords) < 0.0
        {
            rotation = nalgebra::UnitQuaternion::new_unchecked(-rotation.into_inner());
        }

        Pose3D::new(rotation, translation).to_vector(&mut self.scratch);
        let smoothed = marker.filter.filter(timestamp.millis, &self.scratch);
        let pose = Pose3D::from_vector(smoothed).unwrap_or(Pose3D::new(rotation, translation));

        if !marker.is_tracked() {
            debug!("Registry: marker {} tracked", index);
        }
        marker.tracking = TrackingState::Tracked;
        marker.pose = Some(pose);
        Ok(PoseUpdate::Tracked(pose))
    }

    /// Mark every tracked marker except `except` as lost.
    ///
    /// Returns the indices that went from tracked to lost.
    pub fn lose_all_except(&mut self, except: Option<usize>) -> Vec<usize> {
        let mut lost = Vec::new();
        for (index, marker) in self.markers.iter_mut().enumerate() {
            if Some(index) == except {
                continue;
            }
            if marker.lose() == PoseUpdate::Lost {
                lost.push(index);
            }
        }
        if !lost.is_empty() {
            debug!("Registry: markers {:?} lost", lost);
        }
        lost
    }

    pub fn tracked_count(&self) -> usize {
        self.markers.iter().filter(|m| m.is_tracked()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn calibration() -> MarkerCalibration {
        MarkerCalibration {
            width: 300.0,
            height: 200.0,
            dpi: 150.0,
        }
    }

    fn translation_only(x: f32, y: f32, z: f32) -> Matrix4Data {
        let mut m = [0.0f32; 16];
        m[0] = 1.0;
        m[5] = 1.0;
        m[10] = 1.0;
        m[15] = 1.0;
        m[12] = x;
        m[13] = y;
        m[14] = z;
        m
    }

    fn registry_with_one() -> MarkerRegistry {
        let mut registry = MarkerRegistry::new(FilterParams::default(), 1.0);
        registry.register("markers/poster").unwrap();
        registry.set_calibration(0, calibration()).unwrap();
        registry
    }

    #[test]
    fn test_registration_order_and_seal() {
        let mut registry = MarkerRegistry::new(FilterParams::default(), 1.0);
        let a = registry.register("a").unwrap();
        let b = registry.register("b").unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(registry.sources(), vec!["a".to_string(), "b".to_string()]);

        registry.seal();
        assert_eq!(registry.register("c"), Err(RegistryError::Sealed));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_translation_scale() {
        let calibration = MarkerCalibration {
            width: 100.0,
            height: 100.0,
            dpi: 300.0,
        };
        assert!((calibration.translation_scale(2.0) - 6.0).abs() < 1e-12);
        assert!((calibration.translation_scale(1.0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_calibration_errors() {
        let mut registry = registry_with_one();
        assert_eq!(
            registry.set_calibration(4, calibration()),
            Err(RegistryError::UnknownMarker { index: 4, count: 1 })
        );

        let bad = MarkerCalibration {
            dpi: 0.0,
            ..calibration()
        };
        assert!(matches!(
            registry.set_calibration(0, bad),
            Err(RegistryError::InvalidCalibration { index: 0, .. })
        ));
        // previous calibration kept
        assert_eq!(registry.get(0).unwrap().calibration(), Some(&calibration()));
    }

    #[test]
    fn test_pose_needs_calibration() {
        let mut registry = MarkerRegistry::new(FilterParams::default(), 1.0);
        registry.register("a").unwrap();
        let m = translation_only(0.0, 0.0, -100.0);
        assert_eq!(
            registry.apply_pose(0, Some(&m), Timestamp::from_millis(0.0)),
            Err(RegistryError::Uncalibrated { index: 0 })
        );
        assert!(registry.apply_pose(1, None, Timestamp::from_millis(0.0)).is_err());
    }

    #[test]
    fn test_first_pose_is_scaled_and_anchored() {
        let mut registry = registry_with_one();
        let m = translation_only(10.0, 20.0, -100.0);

        let update = registry
            .apply_pose(0, Some(&m), Timestamp::from_millis(16.0))
            .unwrap();
        let PoseUpdate::Tracked(pose) = update else {
            panic!("expected tracked, got {:?}", update);
        };

        // scale = 150 / 300 with dpr 1, anchor offset 0.5 along x and y
        assert!((pose.translation - Vector3::new(5.5, 10.5, -50.0)).norm() < 1e-9);
        assert!(pose.rotation.angle() < 1e-9);
        assert!(registry.get(0).unwrap().is_tracked());
    }

    #[test]
    fn test_anchor_follows_rotation() {
        let mut registry = registry_with_one();
        let rotation = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2);
        let m = Pose3D::new(rotation, Vector3::zeros()).to_transform();

        let PoseUpdate::Tracked(pose) = registry
            .apply_pose(0, Some(&m), Timestamp::from_millis(0.0))
            .unwrap()
        else {
            panic!("expected tracked");
        };
        // (0.5, 0.5, 0) rotated by 90° around z
        assert!((pose.translation - Vector3::new(-0.5, 0.5, 0.0)).norm() < 1e-6);
    }

    #[test]
    fn test_lost_keeps_last_pose() {
        let mut registry = registry_with_one();
        let m = translation_only(0.0, 0.0, -200.0);
        registry
            .apply_pose(0, Some(&m), Timestamp::from_millis(0.0))
            .unwrap();
        let before = *registry.get(0).unwrap().pose().unwrap();

        assert_eq!(
            registry.apply_pose(0, None, Timestamp::from_millis(16.0)),
            Ok(PoseUpdate::Lost)
        );
        assert_eq!(
            registry.apply_pose(0, None, Timestamp::from_millis(32.0)),
            Ok(PoseUpdate::Unchanged)
        );

        let marker = registry.get(0).unwrap();
        assert_eq!(marker.tracking(), TrackingState::Lost);
        assert_eq!(marker.pose(), Some(&before));
    }

    #[test]
    fn test_reacquisition_starts_fresh() {
        let mut registry = registry_with_one();
        registry
            .apply_pose(0, Some(&translation_only(0.0, 0.0, -200.0)), Timestamp::from_millis(0.0))
            .unwrap();
        registry.apply_pose(0, None, Timestamp::from_millis(16.0)).unwrap();

        // far away from the previous pose; a fresh filter passes it through
        let PoseUpdate::Tracked(pose) = registry
            .apply_pose(0, Some(&translation_only(400.0, 0.0, -200.0)), Timestamp::from_millis(32.0))
            .unwrap()
        else {
            panic!("expected tracked");
        };
        assert!((pose.translation.x - 200.5).abs() < 1e-9);
    }

    #[test]
    fn test_smoothing_lags_a_jump() {
        let mut registry = registry_with_one();
        registry
            .apply_pose(0, Some(&translation_only(0.0, 0.0, -200.0)), Timestamp::from_millis(0.0))
            .unwrap();
        let PoseUpdate::Tracked(pose) = registry
            .apply_pose(0, Some(&translation_only(400.0, 0.0, -200.0)), Timestamp::from_millis(16.0))
            .unwrap()
        else {
            panic!("expected tracked");
        };
        assert!(pose.translation.x > 0.5);
        assert!(pose.translation.x < 200.5);
    }

    #[test]
    fn test_quaternion_hemisphere_is_kept() {
        let mut registry = registry_with_one();
        let rotation = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.4);
        let m = Pose3D::new(rotation, Vector3::new(0.0, 0.0, -100.0)).to_transform();

        for step in 0..5 {
            let PoseUpdate::Tracked(pose) = registry
                .apply_pose(0, Some(&m), Timestamp::from_millis(step as f64 * 16.0))
                .unwrap()
            else {
                panic!("expected tracked");
            };
            assert!(pose.rotation.angle_to(&rotation) < 1e-5);
            assert!((pose.rotation.norm() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_reacquired_rotation_is_not_aligned_to_stale_pose() {
        let mut registry = registry_with_one();
        let before = Pose3D::new(
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.5),
            Vector3::new(0.0, 0.0, -100.0),
        )
        .to_transform();
        let PoseUpdate::Tracked(first) = registry
            .apply_pose(0, Some(&before), Timestamp::from_millis(0.0))
            .unwrap()
        else {
            panic!("expected tracked");
        };
        registry.apply_pose(0, None, Timestamp::from_millis(16.0)).unwrap();

        // a rotation whose decoded quaternion sits in the other hemisphere
        let (after, raw) = [Vector3::z_axis(), Vector3::y_axis(), Vector3::x_axis()]
            .into_iter()
            .flat_map(|axis| [2.9f64, -2.9].map(|angle| UnitQuaternion::from_axis_angle(&axis, angle)))
            .map(|rotation| {
                let m = Pose3D::new(rotation, Vector3::new(0.0, 0.0, -100.0)).to_transform();
                (m, Pose3D::from_transform(&m).rotation)
            })
            .find(|(_, raw)| raw.coords.dot(&first.rotation.coords) < 0.0)
            .expect("some candidate decodes into the opposite hemisphere");

        let PoseUpdate::Tracked(pose) = registry
            .apply_pose(0, Some(&after), Timestamp::from_millis(32.0))
            .unwrap()
        else {
            panic!("expected tracked");
        };
        assert!((pose.rotation.coords - raw.coords).norm() < 1e-6);
    }

    #[test]
    fn test_lose_all_except() {
        let mut registry = MarkerRegistry::new(FilterParams::default(), 1.0);
        for name in ["a", "b", "c"] {
            registry.register(name).unwrap();
        }
        for index in 0..3 {
            registry.set_calibration(index, calibration()).unwrap();
        }
        let m = translation_only(0.0, 0.0, -100.0);
        registry.apply_pose(0, Some(&m), Timestamp::from_millis(0.0)).unwrap();
        registry.apply_pose(2, Some(&m), Timestamp::from_millis(0.0)).unwrap();
        assert_eq!(registry.tracked_count(), 2);

        assert_eq!(registry.lose_all_except(Some(2)), vec![0]);
        assert_eq!(registry.lose_all_except(None), vec![2]);
        assert!(registry.lose_all_except(None).is_empty());
        assert_eq!(registry.tracked_count(), 0);
    }
}
