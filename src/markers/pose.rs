//! Marker poses in camera space

use nalgebra::{Matrix3, Matrix4, Quaternion, Rotation3, UnitQuaternion, Vector3};

use crate::pipeline::messages::Matrix4Data;

/// Rotation and translation of a marker relative to the camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose3D {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Pose3D {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(UnitQuaternion::identity(), Vector3::zeros())
    }

    /// Split a column-major 4×4 transform into rotation and translation.
    ///
    /// Scale in the upper 3×3 block is removed before the rotation is
    /// extracted, and the closest proper rotation is used when the block is not
    /// exactly orthonormal.
    pub fn from_transform(m: &Matrix4Data) -> Self {
        let m = Matrix4::from_iterator(m.iter().map(|&v| f64::from(v)));

        let mut basis: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
        for mut column in basis.column_iter_mut() {
            let norm = column.norm();
            if norm > f64::EPSILON {
                column /= norm;
            }
        }
        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&basis));
        let translation = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);

        Self::new(rotation, translation)
    }

    /// Column-major 4×4 homogeneous transform
    pub fn to_transform(&self) -> Matrix4Data {
        let m = self.rotation.to_homogeneous().append_translation(&self.translation);
        let mut out = [0.0f32; 16];
        for (dst, src) in out.iter_mut().zip(m.iter()) {
            *dst = *src as f32;
        }
        out
    }

    /// Pack as `[qx, qy, qz, qw, tx, ty, tz]` for filtering
    pub fn to_vector(&self, out: &mut Vec<f64>) {
        out.clear();
        out.extend_from_slice(self.rotation.coords.as_slice());
        out.extend_from_slice(self.translation.as_slice());
    }

    /// Inverse of [`to_vector`](Self::to_vector). The quaternion is renormalized.
    pub fn from_vector(v: &[f64]) -> Option<Self> {
        let [qx, qy, qz, qw, tx, ty, tz] = <[f64; 7]>::try_from(v).ok()?;
        let quaternion = Quaternion::new(qw, qx, qy, qz);
        if quaternion.norm() <= f64::EPSILON {
            return None;
        }
        Some(Self::new(
            UnitQuaternion::new_normalize(quaternion),
            Vector3::new(tx, ty, tz),
        ))
    }
}

impl Default for Pose3D {
    fn default() -> Self {
        Self::identity()
    }
}
